pub mod broadcast;
pub mod connection;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastReport, WorldBroadcaster};
pub use connection::{ConnectionContext, ConnectionState};
pub use registry::{LoginRejection, ResyncSignal, SessionId, SessionRegistry};
pub use server::Server;

use reactocraft_protocol::{DisconnectCode, MalformedFrame};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors emitted by the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a connection ended. Each variant closes exactly one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
    #[error("client speaks protocol {client}, server speaks {server}")]
    VersionMismatch { client: u32, server: u32 },
    #[error("login rejected: {0}")]
    LoginRejected(#[from] registry::LoginRejection),
    #[error("login not completed in time")]
    LoginTimeout,
    #[error("no packets received for too long")]
    IdleTimeout,
    #[error("outbound queue kept overflowing")]
    Backpressure,
    #[error("server shutting down")]
    Shutdown,
    #[error("connection to {0} closed")]
    Closed(SocketAddr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Code for the parting `Disconnect`, if one is owed to the peer.
    pub fn disconnect_code(&self) -> Option<DisconnectCode> {
        match self {
            ConnectionError::ProtocolViolation(_) | ConnectionError::Malformed(_) => {
                Some(DisconnectCode::ProtocolViolation)
            }
            ConnectionError::VersionMismatch { .. } => Some(DisconnectCode::VersionMismatch),
            ConnectionError::LoginTimeout => Some(DisconnectCode::LoginTimeout),
            ConnectionError::IdleTimeout => Some(DisconnectCode::IdleTimeout),
            ConnectionError::Backpressure => Some(DisconnectCode::Backpressure),
            ConnectionError::Shutdown => Some(DisconnectCode::ServerShutdown),
            // LoginFailure already told the client why
            ConnectionError::LoginRejected(_)
            | ConnectionError::Closed(_)
            | ConnectionError::Io(_) => None,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.disconnect_code() == Some(DisconnectCode::ProtocolViolation)
    }
}
