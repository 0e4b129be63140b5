//! Connection state machine.
//!
//! - [`StateMachine`]: the lifecycle states and which transitions are legal
//! - [`Link`]: an open transport plus its packet read buffer
//! - [`handshake`]: open a transport, send CONNECT, await CONNACK
//! - [`KeepAlive`]: PINGREQ scheduling and liveness detection
//! - [`Backoff`]: reconnect delays with jitter

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectConfig, ReconnectPolicy};
use crate::error::{ConnectErrorKind, Error, Result};
use crate::protocol::{ConnAck, Connect, Packet, PacketBuffer};
use crate::transport::{BoxTransport, Connector};
use crate::types::{ConnectReturnCode, ConnectionState};

// ============================================================================
// State machine
// ============================================================================

/// Connection lifecycle with a shared read-only view for session handles.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
    shared: Arc<RwLock<ConnectionState>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle other tasks can read the current state from.
    pub fn shared(&self) -> Arc<RwLock<ConnectionState>> {
        self.shared.clone()
    }

    /// Whether `from → to` is a legal transition.
    pub fn allowed(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (from, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Move to `to`. Illegal transitions fail with `InvalidState(current)`.
    pub fn transition(&mut self, to: ConnectionState) -> Result<()> {
        if !Self::allowed(self.state, to) {
            return Err(Error::InvalidState(self.state));
        }

        info!("Connection state {} -> {}", self.state, to);
        self.state = to;
        *self.shared.write() = to;
        Ok(())
    }
}

// ============================================================================
// Link
// ============================================================================

/// An open transport and the bytes read from it but not yet decoded.
pub struct Link {
    io: BoxTransport,
    buffer: PacketBuffer,
    write_buf: BytesMut,
}

impl Link {
    pub fn new(io: BoxTransport, max_packet_size: usize) -> Self {
        Self {
            io,
            buffer: PacketBuffer::new(max_packet_size),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// Encode and write one packet.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.write_buf.clear();
        packet.encode(&mut self.write_buf)?;
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        trace!("Sent {}", packet.name());
        Ok(())
    }

    /// Read the next packet.
    ///
    /// Cancel-safe: bytes already read stay in the buffer.
    pub async fn read(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.buffer.next_packet()? {
                trace!("Received {}", packet.name());
                return Ok(packet);
            }

            let n = self.io.read_buf(self.buffer.inner_mut()).await?;
            if n == 0 {
                return Err(Error::Io("connection closed by broker".to_string()));
            }
        }
    }

    /// Shut the transport down, ignoring errors.
    pub async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!("Transport shutdown: {}", e);
        }
    }
}

/// Build the CONNECT packet for `config`.
pub fn connect_packet(config: &ConnectConfig) -> Packet {
    Packet::Connect(Connect {
        client_id: config.effective_client_id(),
        keep_alive: config.keep_alive,
        clean_session: config.clean_session,
        username: config.username.clone(),
        password: config.password.as_ref().map(|p| p.as_bytes().to_vec()),
        will: config.will.clone(),
    })
}

/// Open a transport, send CONNECT and wait for CONNACK.
///
/// The whole exchange is bounded by `connect_timeout`. Takes owned
/// arguments so the future can be polled from the engine loop.
pub async fn handshake(connector: Arc<dyn Connector>, config: ConnectConfig) -> Result<(Link, ConnAck)> {
    let exchange = async {
        let io = connector
            .connect(&config.addr)
            .await
            .map_err(|e| ConnectErrorKind::Io(e.to_string()))?;
        let mut link = Link::new(io, config.max_packet_size);

        link.send(&connect_packet(&config))
            .await
            .map_err(|e| ConnectErrorKind::Io(e.to_string()))?;

        let ack = match link.read().await {
            Ok(Packet::ConnAck(ack)) => ack,
            Ok(other) => {
                return Err(ConnectErrorKind::Protocol(format!("expected CONNACK, got {}", other.name())));
            }
            Err(Error::Malformed(e)) => return Err(ConnectErrorKind::Protocol(e)),
            Err(e) => return Err(ConnectErrorKind::Io(e.to_string())),
        };

        if ack.code != ConnectReturnCode::Accepted {
            link.close().await;
            return Err(ConnectErrorKind::Refused(ack.code));
        }

        Ok((link, ack))
    };

    match timeout(config.connect_timeout, exchange).await {
        Ok(Ok((link, ack))) => {
            debug!("CONNACK from {} (session_present={})", config.addr, ack.session_present);
            Ok((link, ack))
        }
        Ok(Err(kind)) => {
            warn!("Connect to {} failed: {}", config.addr, kind);
            Err(kind.into())
        }
        Err(_) => {
            warn!("Connect to {} timed out after {:?}", config.addr, config.connect_timeout);
            Err(ConnectErrorKind::Timeout.into())
        }
    }
}

// ============================================================================
// Keep-alive
// ============================================================================

/// What the keep-alive timer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    Ping,
    /// Nothing heard from the broker for 1.5 × keep-alive.
    Lost,
}

/// Tracks last read/write activity on a connection.
///
/// A ping goes out half an interval after the older of the last read and
/// the last write, so a client that only writes still asks the broker for
/// a reply before the liveness deadline.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
    /// PINGREQ sent and nothing read since.
    ping_outstanding: bool,
}

impl KeepAlive {
    /// `keep_alive` in seconds; 0 disables pings and liveness checks.
    pub fn new(keep_alive: u16, now: Instant) -> Self {
        Self {
            interval: (keep_alive > 0).then(|| Duration::from_secs(keep_alive as u64)),
            last_read: now,
            last_write: now,
            ping_outstanding: false,
        }
    }

    pub fn on_read(&mut self, now: Instant) {
        self.last_read = now;
        self.ping_outstanding = false;
    }

    pub fn on_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    pub fn on_ping(&mut self, now: Instant) {
        self.last_write = now;
        self.ping_outstanding = true;
    }

    fn ping_at(&self, interval: Duration) -> Option<Instant> {
        if self.ping_outstanding {
            return None;
        }
        Some(self.last_write.min(self.last_read) + interval / 2)
    }

    fn lost_at(&self, interval: Duration) -> Instant {
        self.last_read + interval * 3 / 2
    }

    /// When the next ping or liveness check is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        let lost_at = self.lost_at(interval);
        Some(self.ping_at(interval).map_or(lost_at, |ping_at| ping_at.min(lost_at)))
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        let Some(interval) = self.interval else {
            return KeepAliveAction::Idle;
        };

        if now >= self.lost_at(interval) {
            KeepAliveAction::Lost
        } else if self.ping_at(interval).is_some_and(|at| now >= at) {
            KeepAliveAction::Ping
        } else {
            KeepAliveAction::Idle
        }
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Un-jittered delay for `attempt`: `base * 2^attempt`, capped.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay)
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }

        let delay = jitter(self.ceiling(self.attempt));
        self.attempt += 1;
        debug!("Reconnect attempt {} in {:?}", self.attempt, delay);
        Some(delay)
    }
}

/// Uniform in `[delay/2, delay]`.
fn jitter(delay: Duration) -> Duration {
    let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    let half = nanos / 2;
    let span = nanos - half;

    match getrandom::u64() {
        Ok(r) => Duration::from_nanos(half + r % span.saturating_add(1)),
        Err(e) => {
            warn!("No randomness for backoff jitter: {}", e);
            delay
        }
    }
}
