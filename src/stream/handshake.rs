//! Relay source handshakes and admin metadata requests
//!
//! Pure request builders and response checks. Nothing here touches a socket,
//! so the exact bytes on the wire are easy to test.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::{ServerProtocol, StreamTarget};

const USER_AGENT: &str = concat!("relaycast/", env!("CARGO_PKG_VERSION"));

/// Percent-encode everything outside the RFC 3986 unreserved set
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

/// `Basic` credentials for the Authorization header
pub fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

fn audio_info(target: &StreamTarget) -> String {
    format!(
        "ice-samplerate={};ice-bitrate={};ice-channels={}",
        target.station.sample_rate, target.station.bitrate_kbps, target.station.channels
    )
}

fn push_header(request: &mut String, name: &str, value: &str) {
    let _ = write!(request, "{}: {}\r\n", name, value);
}

fn push_optional(request: &mut String, name: &str, value: &str) {
    if !value.is_empty() {
        push_header(request, name, value);
    }
}

/// Source request opening the stream for `target.protocol`
pub fn source_request(target: &StreamTarget) -> String {
    if target.protocol.uses_http_put() {
        put_request(target)
    } else {
        legacy_source_request(target)
    }
}

fn put_request(target: &StreamTarget) -> String {
    let station = &target.station;
    let identity = &target.identity;

    let mut request = format!("PUT {} HTTP/1.1\r\n", target.mount);
    push_header(&mut request, "Host", &target.address());
    push_header(
        &mut request,
        "Authorization",
        &basic_auth(&target.username, &target.password),
    );
    push_header(&mut request, "User-Agent", USER_AGENT);
    push_header(&mut request, "Content-Type", &station.content_type);
    push_header(&mut request, "Ice-Public", if station.public { "1" } else { "0" });
    push_header(&mut request, "Ice-Name", &station.name);
    push_header(&mut request, "Ice-Description", &station.description);
    push_header(&mut request, "Ice-Genre", &station.genre);
    push_header(&mut request, "Ice-Url", &station.url);
    push_header(&mut request, "Ice-Audio-Info", &audio_info(target));

    push_optional(&mut request, "Icy-Twitter", &identity.twitter);
    push_optional(&mut request, "Icy-Facebook", &identity.facebook);
    push_optional(&mut request, "Icy-Instagram", &identity.instagram);
    push_optional(&mut request, "Icy-Email", &identity.email);
    push_optional(&mut request, "Icy-Language", &identity.language);
    push_optional(&mut request, "Icy-Country", &identity.country);
    push_optional(&mut request, "Icy-City", &identity.city);

    push_header(&mut request, "Transfer-Encoding", "chunked");
    push_header(&mut request, "Expect", "100-continue");
    request.push_str("\r\n");
    request
}

fn legacy_source_request(target: &StreamTarget) -> String {
    let station = &target.station;

    let mut request = format!("SOURCE {} ICY/1.0\r\n", target.mount);
    push_header(&mut request, "icy-password", &target.password);
    push_header(&mut request, "content-type", &station.content_type);
    push_header(&mut request, "icy-name", &station.name);
    push_header(&mut request, "icy-genre", &station.genre);
    push_header(&mut request, "icy-url", &station.url);
    push_header(&mut request, "icy-pub", if station.public { "1" } else { "0" });
    push_header(&mut request, "icy-br", &station.bitrate_kbps.to_string());
    request.push_str("\r\n");
    request
}

/// Whether the relay accepted the source handshake
pub fn handshake_accepted(protocol: ServerProtocol, response: &str) -> bool {
    match protocol {
        ServerProtocol::Icecast2 | ServerProtocol::ShoutcastV2 => {
            response.contains("100") || response.contains("200")
        }
        ServerProtocol::ShoutcastV1 => response.contains("OK") || response.contains("200"),
    }
}

/// Now-playing update pushed through the relay's admin interface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub artwork: Option<String>,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            ..Default::default()
        }
    }

    /// Combined `Artist - Title` for clients that only read `song`
    pub fn song(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// Query string for an admin metadata update, without the leading `?`
pub fn admin_query(target: &StreamTarget, meta: &TrackMetadata) -> String {
    let mut query = match target.protocol {
        ServerProtocol::Icecast2 => format!("mount={}&mode=updinfo", url_encode(&target.mount)),
        ServerProtocol::ShoutcastV1 => {
            format!("pass={}&mode=updinfo", url_encode(&target.password))
        }
        ServerProtocol::ShoutcastV2 => {
            format!("sid=1&pass={}&mode=updinfo", url_encode(&target.password))
        }
    };

    let mut param = |name: &str, value: &str| {
        let _ = write!(query, "&{}={}", name, url_encode(value));
    };
    param("song", &meta.song());
    param("title", &meta.title);
    param("artist", &meta.artist);
    param("icy-meta-track-title", &meta.title);
    param("icy-meta-track-artist", &meta.artist);
    if let Some(album) = &meta.album {
        param("album", album);
    }
    if let Some(artwork) = &meta.artwork {
        param("artwork", artwork);
    }
    query
}

/// Complete admin GET request
pub fn admin_request(target: &StreamTarget, meta: &TrackMetadata) -> String {
    let path = match target.protocol {
        ServerProtocol::Icecast2 => "/admin/metadata",
        ServerProtocol::ShoutcastV1 | ServerProtocol::ShoutcastV2 => "/admin.cgi",
    };

    let mut request = format!("GET {}?{} HTTP/1.1\r\n", path, admin_query(target, meta));
    push_header(&mut request, "Host", &target.address());
    if target.protocol == ServerProtocol::Icecast2 {
        push_header(
            &mut request,
            "Authorization",
            &basic_auth(&target.username, &target.password),
        );
    }
    push_header(&mut request, "User-Agent", USER_AGENT);
    push_header(&mut request, "Connection", "close");
    request.push_str("\r\n");
    request
}

/// Whether the admin response body reports success
pub fn admin_acknowledged(response: &str) -> bool {
    response.contains("<return>1</return>")
}
