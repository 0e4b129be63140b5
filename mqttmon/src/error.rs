//! Error types for mqttmon.

use std::io;

use crate::types::{ConnectReturnCode, ConnectionState};

/// Result type alias for mqttmon.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttmon operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connecting to the broker failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectErrorKind),

    /// A QoS 1/2 operation ran out of retries without being acknowledged.
    #[error("delivery timeout: packet {pkid} unacknowledged after {retries} retries")]
    DeliveryTimeout { pkid: u16, retries: u32 },

    /// The byte stream could not be decoded; framing is lost.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// No session is active and offline queueing is disabled.
    #[error("not connected")]
    NotConnected,

    /// The command is not valid in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(ConnectionState),

    /// Invalid topic name or topic filter.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Unsubscribe for a filter that was never subscribed.
    #[error("not subscribed: {0}")]
    NotSubscribed(String),

    /// The broker rejected a subscription (SUBACK 0x80).
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// The encoded packet would exceed the packet size limit.
    #[error("packet too large: {size} bytes (limit {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Every packet identifier is in use.
    #[error("no packet identifier available")]
    PacketIdExhausted,

    /// Too many commands queued while offline.
    #[error("offline queue full ({0} commands)")]
    QueueFull(usize),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error while connected.
    #[error("io error: {0}")]
    Io(String),

    /// The engine task has stopped.
    #[error("session closed")]
    SessionClosed,
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectErrorKind {
    /// No CONNACK within the connect timeout.
    #[error("timed out waiting for CONNACK")]
    Timeout,

    /// The broker answered CONNACK with a non-zero return code.
    #[error("refused by broker: {0:?}")]
    Refused(ConnectReturnCode),

    /// Transport could not be opened or broke during the handshake.
    #[error("transport: {0}")]
    Io(String),

    /// The broker sent something other than a valid CONNACK.
    #[error("protocol: {0}")]
    Protocol(String),

    /// `disconnect()` was called before the handshake finished.
    #[error("aborted by disconnect")]
    Aborted,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    /// Whether the error invalidates the current connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Malformed(_) | Error::Io(_))
    }
}
