//! Relay transport
//!
//! [`Connector`] opens a handshaken source connection or runs a one-shot
//! admin request. [`TcpConnector`] is the real implementation; tests swap in
//! fakes.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::StreamTarget;
use crate::constants::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, WRITE_TIMEOUT};
use crate::error::StreamError;
use crate::stream::handshake;

/// An established source connection
pub trait RelayConnection: Send {
    /// Write one buffer of encoded audio
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// False once the peer has closed the connection
    fn is_alive(&mut self) -> bool;
}

/// Opens relay connections
pub trait Connector: Send + Sync {
    /// Connect and complete the source handshake
    fn open(&self, target: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError>;

    /// Send `request` on a fresh connection and return the response text
    fn request(&self, target: &StreamTarget, request: &str) -> Result<String, StreamError>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl TcpConnector {
    fn resolve(target: &StreamTarget) -> Result<SocketAddr, StreamError> {
        target
            .address()
            .to_socket_addrs()
            .map_err(|e| StreamError::ConnectionFailed(format!("{}: {}", target.address(), e)))?
            .next()
            .ok_or_else(|| {
                StreamError::ConnectionFailed(format!("{}: no address", target.address()))
            })
    }

    fn dial(&self, target: &StreamTarget) -> Result<TcpStream, StreamError> {
        let addr = Self::resolve(target)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        socket
            .connect_timeout(&addr.into(), self.connect_timeout)
            .map_err(|e| StreamError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let stream: TcpStream = socket.into();
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_read_timeout(Some(self.handshake_timeout))?;
        Ok(stream)
    }
}

impl Connector for TcpConnector {
    fn open(&self, target: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError> {
        let mut stream = self.dial(target)?;
        stream.write_all(handshake::source_request(target).as_bytes())?;

        let mut response = [0u8; 1024];
        let n = stream.read(&mut response)?;
        let response = String::from_utf8_lossy(&response[..n]);
        if !handshake::handshake_accepted(target.protocol, &response) {
            let status = response.lines().next().unwrap_or("").trim().to_string();
            return Err(StreamError::HandshakeRejected(if status.is_empty() {
                "connection closed".to_string()
            } else {
                status
            }));
        }
        stream.set_read_timeout(None)?;

        tracing::debug!("Handshake accepted by {}", target.address());
        Ok(Box::new(TcpRelayConnection {
            stream,
            chunked: target.protocol.uses_http_put(),
        }))
    }

    fn request(&self, target: &StreamTarget, request: &str) -> Result<String, StreamError> {
        let mut stream = self.dial(target)?;
        stream.write_all(request.as_bytes())?;

        // The server closes after answering; keep what arrived before a timeout
        let mut response = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) if !response.is_empty() => {
                    tracing::debug!("Admin response truncated: {}", e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Source connection over TCP
pub struct TcpRelayConnection {
    stream: TcpStream,
    /// HTTP chunk framing, used after a `Transfer-Encoding: chunked` handshake
    chunked: bool,
}

impl RelayConnection for TcpRelayConnection {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.chunked {
            write!(self.stream, "{:x}\r\n", data.len())?;
            self.stream.write_all(data)?;
            self.stream.write_all(b"\r\n")
        } else {
            self.stream.write_all(data)
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match self.stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        alive && self.stream.set_nonblocking(false).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerProtocol;
    use std::net::TcpListener;
    use std::thread;

    fn local_target(listener: &TcpListener, protocol: ServerProtocol) -> StreamTarget {
        StreamTarget {
            protocol,
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            password: "pw".to_string(),
            ..Default::default()
        }
    }

    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[test]
    fn test_icecast_handshake_and_chunked_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener, ServerProtocol::Icecast2);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let head = read_head(&mut stream);
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
            let mut body = [0u8; 9];
            stream.read_exact(&mut body).unwrap();
            (head, body)
        });

        let mut connection = TcpConnector::default().open(&target).unwrap();
        connection.send(b"abcd").unwrap();
        let (head, body) = server.join().unwrap();

        assert!(head.starts_with("PUT /stream HTTP/1.1"));
        assert_eq!(&body, b"4\r\nabcd\r\n");
    }

    #[test]
    fn test_rejected_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener, ServerProtocol::ShoutcastV1);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_head(&mut stream);
            stream.write_all(b"invalid password\r\n").unwrap();
        });

        let result = TcpConnector::default().open(&target);
        server.join().unwrap();
        assert!(matches!(result, Err(StreamError::HandshakeRejected(_))));
    }

    #[test]
    fn test_liveness_detects_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener, ServerProtocol::ShoutcastV1);

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_head(&mut stream);
            stream.write_all(b"OK2\r\n").unwrap();
            stream
        });

        let mut connection = TcpConnector::default().open(&target).unwrap();
        let peer = server.join().unwrap();
        assert!(connection.is_alive());

        drop(peer);
        thread::sleep(Duration::from_millis(50));
        assert!(!connection.is_alive());
    }

    #[test]
    fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = local_target(&listener, ServerProtocol::Icecast2);
        drop(listener);
        assert!(TcpConnector::default().open(&target).is_err());
    }
}
