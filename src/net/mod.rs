//! Networking layer.
//!
//! - [`connection`] - Per-server sequence table and response matching
//! - [`transport`] - Socket tasks and the [`Connector`] seam
//! - [`tls`] - CA bundle loading and the TLS connector

pub mod connection;
pub mod tls;
pub mod transport;

pub use connection::{
    ConnId, ConnectionError, ConnectionOutput, ConnectionState, ResponseError, SendMode,
    ServerConnection, Waiter,
};
pub use tls::{TlsClientBuilder, TrustStore};
pub use transport::{CloseReason, Connector, Endpoint, TcpConnector, TransportEvent};
