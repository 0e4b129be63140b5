//! MQTT 3.1.1 client session engine for the MQTT Monitor.
//!
//! The engine owns one broker connection and everything that hangs off it:
//!
//! - **Connection**: connect handshake, keep-alive, reconnect with backoff
//! - **Subscriptions**: topic filter registry and message dispatch
//! - **Delivery**: QoS 1/2 acknowledgement tracking, retries, in-flight window
//!
//! A host (the monitor UI) drives it with commands on a [`Session`] handle
//! and consumes [`Event`]s; nothing calls back into host code.
//!
//! ## Example
//!
//! ```no_run
//! use mqttmon::{ConnectConfig, Event, QoS, Session, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> mqttmon::Result<()> {
//!     let (session, mut events) = Session::spawn(SessionOptions::default());
//!
//!     session.connect(ConnectConfig::new("127.0.0.1:1883", "monitor")).await?;
//!     session.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let Event::MessageReceived { filter, message } = event {
//!             println!("{} via {}: {:?}", message.topic, filter, message.payload);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod config;
pub mod connection;
mod error;
pub mod flow;
pub mod protocol;
pub mod registry;
mod session;
pub mod topic;
pub mod transport;
pub mod trie;
mod types;

pub use config::{ConnectConfig, OfflinePolicy, ReconnectPolicy, SessionOptions};
pub use error::{ConnectErrorKind, Error, Result};
pub use session::{Event, Events, Session};
pub use transport::{BoxTransport, Connector, TcpConnector, Transport, TransportType};
pub use types::{ConnectReturnCode, ConnectionState, LastWill, Message, OpId, OperationKind, QoS};

#[cfg(feature = "tls")]
pub use transport::{TlsConfig, TlsConnector};
