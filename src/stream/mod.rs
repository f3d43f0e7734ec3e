//! Relay streaming (Icecast2 / Shoutcast)

pub mod client;
pub mod connection;
pub mod handshake;

pub use client::{ConnectionState, StreamClient, StreamEvent};
pub use connection::{Connector, RelayConnection, TcpConnector};
pub use handshake::{url_encode, TrackMetadata};
