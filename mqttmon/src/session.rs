//! Session engine.
//!
//! [`Session::spawn`] starts one tokio task that owns the connection, the
//! subscription registry and the flow controller. [`Session`] handles send
//! commands to it over a channel; outcomes come back as [`Event`]s.
//!
//! The task `select!`s over four sources:
//! - commands from the handles
//! - packets from the broker
//! - the connect handshake in progress
//! - the earliest timer (keep-alive, retry deadline, reconnect delay)

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectConfig, OfflinePolicy, SessionOptions};
use crate::connection::{handshake, Backoff, KeepAlive, KeepAliveAction, Link, StateMachine};
use crate::error::{ConnectErrorKind, Error, Result};
use crate::flow::{Completed, FlowController, Request};
use crate::protocol::codec::MAX_REMAINING_LENGTH;
use crate::protocol::{ConnAck, Packet, Publish, SubAck, SubscribeFilter, MAX_PACKET_SIZE};
use crate::registry::{Registry, SubAckOutcome};
use crate::topic;
use crate::types::{ConnectionState, Message, OpId, OperationKind, QoS};

const COMMAND_BUFFER: usize = 128;

// ============================================================================
// Events
// ============================================================================

/// Something the host should know about.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection moved to a new state.
    ConnectionStateChanged(ConnectionState),
    /// A message arrived for an active subscription.
    ///
    /// Emitted once per matching subscription.
    MessageReceived { filter: String, message: Message },
    /// The broker granted a subscription.
    SubscriptionAcked { op: OpId, filter: String, granted_qos: QoS },
    /// An accepted command could not be completed.
    OperationFailed { op: OpId, kind: OperationKind, error: Error },
    /// A publish was sent (QoS 0) or acknowledged (QoS 1/2).
    PublishCompleted { op: OpId, pkid: u16 },
    /// The broker acknowledged an unsubscribe.
    Unsubscribed { op: OpId, filter: String },
}

/// Receiving side of a session's events.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Wait for the next event. `None` once the engine has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Connect {
        config: Box<ConnectConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Operation {
        op: Operation,
        reply: oneshot::Sender<Result<OpId>>,
    },
}

/// An accepted subscribe, unsubscribe or publish.
#[derive(Debug)]
enum Operation {
    Subscribe { op: OpId, filter: String, qos: QoS },
    Unsubscribe { op: OpId, filter: String },
    Publish { op: OpId, publish: Publish },
}

impl Operation {
    fn id(&self) -> OpId {
        match self {
            Operation::Subscribe { op, .. }
            | Operation::Unsubscribe { op, .. }
            | Operation::Publish { op, .. } => *op,
        }
    }

    fn kind(&self) -> OperationKind {
        match self {
            Operation::Subscribe { .. } => OperationKind::Subscribe,
            Operation::Unsubscribe { .. } => OperationKind::Unsubscribe,
            Operation::Publish { .. } => OperationKind::Publish,
        }
    }
}

/// Command handle for a session engine.
///
/// Cheap to clone. The engine stops once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    next_op: Arc<AtomicU64>,
}

impl Session {
    /// Start a session engine on the current tokio runtime.
    pub fn spawn(options: SessionOptions) -> (Session, Events) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let next_op = Arc::new(AtomicU64::new(1));

        let engine = Engine::new(options, cmd_rx, event_tx, next_op.clone());
        let session = Session {
            commands: cmd_tx,
            state: engine.machine.shared(),
            next_op,
        };

        tokio::spawn(engine.run());
        (session, Events { rx: event_rx })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connect to the broker described by `config`.
    ///
    /// Resolves once connected, or with a `Connect` error when the attempt
    /// fails. Only valid while disconnected.
    pub async fn connect(&self, config: ConnectConfig) -> Result<()> {
        self.request(|reply| Command::Connect {
            config: Box::new(config),
            reply,
        })
        .await
    }

    /// Close the connection and discard every pending operation.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Subscribe to a topic filter.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: QoS) -> Result<OpId> {
        let op = self.next_op();
        let filter = filter.into();
        self.request(|reply| Command::Operation {
            op: Operation::Subscribe { op, filter, qos },
            reply,
        })
        .await
    }

    /// Unsubscribe from a topic filter.
    pub async fn unsubscribe(&self, filter: impl Into<String>) -> Result<OpId> {
        let op = self.next_op();
        let filter = filter.into();
        self.request(|reply| Command::Operation {
            op: Operation::Unsubscribe { op, filter },
            reply,
        })
        .await
    }

    /// Publish a message.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<OpId> {
        let op = self.next_op();
        let publish = Publish::new(topic, payload, qos, retain, 0);
        self.request(|reply| Command::Operation {
            op: Operation::Publish { op, publish },
            reply,
        })
        .await
    }

    fn next_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }
}

// ============================================================================
// Engine
// ============================================================================

type Handshake = Pin<Box<dyn Future<Output = Result<(Link, ConnAck)>> + Send>>;

struct Engine {
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    next_op: Arc<AtomicU64>,

    machine: StateMachine,
    config: Option<ConnectConfig>,
    link: Option<Link>,
    handshake: Option<Handshake>,
    connect_reply: Option<oneshot::Sender<Result<()>>>,
    keep_alive: Option<KeepAlive>,
    backoff: Option<Backoff>,
    reconnect_at: Option<Instant>,
    /// Set while the current connect attempt is a reconnect.
    reconnecting: bool,

    registry: Registry,
    flow: FlowController,
    /// Filters to request again after the next successful connect.
    resubscribe: Vec<(String, QoS)>,
    /// Operations accepted while not connected.
    offline: VecDeque<Operation>,
}

impl Engine {
    fn new(
        options: SessionOptions,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<Event>,
        next_op: Arc<AtomicU64>,
    ) -> Self {
        let flow = FlowController::new(ConnectConfig::default().flow());
        Self {
            options,
            commands,
            events,
            next_op,
            machine: StateMachine::new(),
            config: None,
            link: None,
            handshake: None,
            connect_reply: None,
            keep_alive: None,
            backoff: None,
            reconnect_at: None,
            reconnecting: false,
            registry: Registry::new(),
            flow,
            resubscribe: Vec::new(),
            offline: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        debug!("Session engine started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                result = read_link(&mut self.link) => {
                    let result = match result {
                        Ok(packet) => self.on_packet(packet).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        self.connection_lost(e).await;
                    }
                }
                result = poll_handshake(&mut self.handshake) => {
                    self.handshake = None;
                    self.on_handshake(result).await;
                }
                _ = sleep_until_opt(deadline) => self.on_tick().await,
            }
        }

        // every handle is gone
        if let Some(mut link) = self.link.take() {
            let _ = link.send(&Packet::Disconnect).await;
            link.close().await;
        }
        debug!("Session engine stopped");
    }

    fn emit(&self, event: Event) {
        trace!("Event {:?}", event);
        // the host may have dropped its receiver
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, to: ConnectionState) {
        match self.machine.transition(to) {
            Ok(()) => self.emit(Event::ConnectionStateChanged(to)),
            Err(e) => warn!("Ignoring transition to {}: {}", to, e),
        }
    }

    fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    fn alloc_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.state() {
            ConnectionState::Connected => {
                let keep_alive = self.keep_alive.as_ref().and_then(KeepAlive::next_deadline);
                let retry = self.flow.next_deadline();
                match (keep_alive, retry) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            ConnectionState::Reconnecting => self.reconnect_at,
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { config, reply } => self.on_connect(*config, reply),
            Command::Disconnect { reply } => {
                let result = self.on_disconnect().await;
                let _ = reply.send(result);
            }
            Command::Operation { op, reply } => {
                let id = op.id();
                if let Err(e) = self.accept(&op) {
                    debug!("Rejected {} ({}): {}", id, op.kind(), e);
                    let _ = reply.send(Err(e));
                    return;
                }

                let connected = self.state() == ConnectionState::Connected;
                let _ = reply.send(Ok(id));
                if connected {
                    if let Err(e) = self.execute(op).await {
                        self.connection_lost(e).await;
                    }
                } else {
                    debug!("Queued {} ({}) while {}", id, op.kind(), self.state());
                    self.offline.push_back(op);
                }
            }
        }
    }

    /// Synchronous checks before an operation is accepted.
    fn accept(&self, op: &Operation) -> Result<()> {
        match op {
            Operation::Subscribe { filter, .. } => topic::validate_filter(filter)?,
            Operation::Publish { publish, .. } => {
                topic::validate_topic(&publish.topic)?;
                self.check_size(publish)?;
            }
            Operation::Unsubscribe { filter, .. } => {
                let queued = self
                    .offline
                    .iter()
                    .any(|q| matches!(q, Operation::Subscribe { filter: f, .. } if f == filter));
                if self.registry.get(filter).is_none() && !queued {
                    return Err(Error::NotSubscribed(filter.clone()));
                }
            }
        }

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected if self.options.offline == OfflinePolicy::Queue => {}
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                return Err(Error::NotConnected);
            }
        }

        if self.offline.len() >= self.options.max_offline_queue {
            return Err(Error::QueueFull(self.options.max_offline_queue));
        }
        Ok(())
    }

    /// Reject publishes that cannot be encoded or exceed the packet size limit.
    fn check_size(&self, publish: &Publish) -> Result<()> {
        let max = self
            .config
            .as_ref()
            .map_or(MAX_PACKET_SIZE, |c| c.max_packet_size)
            .min(MAX_REMAINING_LENGTH);
        let size = Packet::Publish(publish.clone()).size();
        if size > max {
            return Err(Error::PacketTooLarge { size, max });
        }
        Ok(())
    }

    fn on_connect(&mut self, config: ConnectConfig, reply: oneshot::Sender<Result<()>>) {
        if self.state() != ConnectionState::Disconnected {
            let _ = reply.send(Err(Error::InvalidState(self.state())));
            return;
        }
        if let Err(e) = config.validate() {
            let _ = reply.send(Err(e));
            return;
        }

        info!("Connecting to {}", config.addr);
        self.flow.reconfigure(config.flow());
        self.backoff = Some(Backoff::new(config.reconnect.clone()));
        self.config = Some(config);
        self.connect_reply = Some(reply);
        self.reconnecting = false;
        self.start_handshake();
    }

    fn start_handshake(&mut self) {
        let Some(config) = self.config.clone() else {
            warn!("No connect config; staying disconnected");
            return;
        };

        self.set_state(ConnectionState::Connecting);
        self.handshake = Some(Box::pin(handshake(self.options.connector.clone(), config)));
    }

    async fn on_disconnect(&mut self) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(Error::InvalidState(ConnectionState::Disconnected));
        }

        info!("Disconnecting");
        self.set_state(ConnectionState::Disconnecting);

        self.handshake = None;
        self.reconnect_at = None;
        self.keep_alive = None;
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(ConnectErrorKind::Aborted.into()));
        }

        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.send(&Packet::Disconnect).await {
                debug!("DISCONNECT not sent: {}", e);
            }
            link.close().await;
        }

        self.abandon_inflight();
        self.abandon_offline();
        self.registry.clear();

        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    async fn on_handshake(&mut self, result: Result<(Link, ConnAck)>) {
        match result {
            Ok((link, ack)) => {
                let keep_alive = self.config.as_ref().map_or(0, |c| c.keep_alive);
                self.link = Some(link);
                self.keep_alive = Some(KeepAlive::new(keep_alive, Instant::now()));
                self.reconnecting = false;
                if let Some(backoff) = self.backoff.as_mut() {
                    backoff.reset();
                }

                info!("Connected (session_present={})", ack.session_present);
                self.set_state(ConnectionState::Connected);
                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Ok(()));
                }

                if !ack.session_present {
                    for done in self.flow.reset_session() {
                        self.on_completed(done);
                    }
                }

                if let Err(e) = self.on_connected().await {
                    self.connection_lost(e).await;
                }
            }
            Err(e) if self.reconnecting => {
                warn!("Reconnect attempt failed: {}", e);
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_reconnect();
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Err(e));
                }
                self.enter_disconnected();
            }
        }
    }

    /// Resend what was in flight, resubscribe, then replay queued commands.
    async fn on_connected(&mut self) -> Result<()> {
        let now = Instant::now();
        for packet in self.flow.resend_all(now) {
            self.send(packet).await?;
        }

        for (filter, qos) in std::mem::take(&mut self.resubscribe) {
            // unsubscribed or forgotten while offline
            if self.registry.get(&filter).is_none() {
                continue;
            }
            let op = self.alloc_op();
            debug!("Resubscribing {} as {}", filter, op);
            self.submit(op, Request::Subscribe(vec![SubscribeFilter::new(filter, qos)]))
                .await?;
        }

        while self.state() == ConnectionState::Connected {
            let Some(op) = self.offline.pop_front() else {
                break;
            };
            self.execute(op).await?;
        }
        Ok(())
    }

    /// The connection failed while connected.
    async fn connection_lost(&mut self, error: Error) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        warn!("Connection lost: {}", error);

        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.keep_alive = None;

        let resubscribe = self.config.as_ref().is_some_and(|c| c.resubscribe);
        let active = self.registry.deactivate_all();
        if resubscribe {
            self.resubscribe.extend(active);
        } else {
            for (filter, _) in active {
                self.registry.remove(&filter);
            }
        }

        if self.config.as_ref().is_some_and(|c| c.auto_reconnect) {
            self.set_state(ConnectionState::Reconnecting);
            self.reconnecting = true;
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
            self.enter_disconnected();
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.backoff.as_mut().and_then(Backoff::next_delay) {
            Some(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!("Reconnect attempts exhausted");
                self.reconnect_at = None;
                self.reconnecting = false;
                self.set_state(ConnectionState::Disconnected);
                self.enter_disconnected();
            }
        }
    }

    /// Landed in `Disconnected` without an explicit `disconnect()`.
    fn enter_disconnected(&mut self) {
        self.abandon_inflight();
        self.registry.clear();
        if self.options.offline == OfflinePolicy::Reject {
            self.abandon_offline();
        }
    }

    fn abandon_inflight(&mut self) {
        for (op, kind) in self.flow.clear() {
            debug!("Discarding in-flight {} ({})", op, kind);
            self.emit(Event::OperationFailed {
                op,
                kind,
                error: Error::NotConnected,
            });
        }
        self.resubscribe.clear();
    }

    fn abandon_offline(&mut self) {
        while let Some(op) = self.offline.pop_front() {
            debug!("Discarding queued {} ({})", op.id(), op.kind());
            self.emit(Event::OperationFailed {
                op: op.id(),
                kind: op.kind(),
                error: Error::NotConnected,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Carry out an accepted operation. Errors are transport failures.
    async fn execute(&mut self, op: Operation) -> Result<()> {
        match op {
            Operation::Subscribe { op, filter, qos } => {
                if let Err(e) = self.registry.subscribe(&filter, qos) {
                    self.fail(op, OperationKind::Subscribe, e);
                    return Ok(());
                }
                self.submit(op, Request::Subscribe(vec![SubscribeFilter::new(filter, qos)]))
                    .await
            }
            Operation::Unsubscribe { op, filter } => {
                if let Err(e) = self.registry.unsubscribe(&filter) {
                    self.fail(op, OperationKind::Unsubscribe, e);
                    return Ok(());
                }
                self.submit(op, Request::Unsubscribe(vec![filter])).await
            }
            Operation::Publish { op, publish } => {
                let qos = publish.qos;
                self.submit(op, Request::Publish(publish)).await?;
                if qos == QoS::AtMostOnce {
                    self.emit(Event::PublishCompleted { op, pkid: 0 });
                }
                Ok(())
            }
        }
    }

    async fn submit(&mut self, op: OpId, request: Request) -> Result<()> {
        match self.flow.submit(op, request.clone(), Instant::now()) {
            Ok(Some(packet)) => self.send(packet).await,
            Ok(None) => Ok(()),
            Err(e) => {
                self.fail_request(op, &request, e);
                Ok(())
            }
        }
    }

    /// Move backlog operations into the freed in-flight window.
    async fn release(&mut self) -> Result<()> {
        for packet in self.flow.release(Instant::now()) {
            self.send(packet).await?;
        }
        Ok(())
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(Error::NotConnected);
        };
        link.send(&packet).await?;
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.on_write(Instant::now());
        }
        Ok(())
    }

    fn fail(&self, op: OpId, kind: OperationKind, error: Error) {
        warn!("{} ({}) failed: {}", op, kind, error);
        self.emit(Event::OperationFailed { op, kind, error });
    }

    /// A tracked operation failed; undo its registry effect and report it.
    fn fail_request(&mut self, op: OpId, request: &Request, error: Error) {
        match request {
            Request::Subscribe(filters) => {
                for f in filters {
                    self.registry.on_subscribe_failed(&f.path);
                }
            }
            // the filter is gone either way
            Request::Unsubscribe(filters) => {
                for f in filters {
                    self.registry.on_unsuback(f);
                }
            }
            Request::Publish(_) => {}
        }
        self.fail(op, request.kind(), error);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state() {
            ConnectionState::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| at <= now) {
                    self.reconnect_at = None;
                    self.start_handshake();
                }
            }
            ConnectionState::Connected => {
                if let Err(e) = self.on_connected_tick(now).await {
                    self.connection_lost(e).await;
                }
            }
            _ => {}
        }
    }

    async fn on_connected_tick(&mut self, now: Instant) -> Result<()> {
        let action = self
            .keep_alive
            .as_ref()
            .map_or(KeepAliveAction::Idle, |ka| ka.poll(now));
        match action {
            KeepAliveAction::Lost => return Err(Error::Io("keep-alive timeout".to_string())),
            KeepAliveAction::Ping => {
                self.send(Packet::PingReq).await?;
                if let Some(keep_alive) = self.keep_alive.as_mut() {
                    keep_alive.on_ping(now);
                }
            }
            KeepAliveAction::Idle => {}
        }

        let expired = self.flow.poll_expired(now);
        for failed in expired.failed {
            self.fail_request(failed.op, &failed.request, failed.error);
        }
        for packet in expired.resend {
            self.send(packet).await?;
        }
        self.release().await
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn on_packet(&mut self, packet: Packet) -> Result<()> {
        let now = Instant::now();
        if let Some(keep_alive) = self.keep_alive.as_mut() {
            keep_alive.on_read(now);
        }

        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await?,
            Packet::PubAck(pkid) => {
                if let Some(done) = self.flow.on_puback(pkid) {
                    self.on_completed(done);
                }
                self.release().await?;
            }
            Packet::PubRec(pkid) => {
                if let Some(pubrel) = self.flow.on_pubrec(pkid, now) {
                    self.send(pubrel).await?;
                }
            }
            Packet::PubRel(pkid) => {
                let pubcomp = self.flow.on_incoming_pubrel(pkid);
                self.send(pubcomp).await?;
            }
            Packet::PubComp(pkid) => {
                if let Some(done) = self.flow.on_pubcomp(pkid) {
                    self.on_completed(done);
                }
                self.release().await?;
            }
            Packet::SubAck(ack) => {
                self.on_suback(ack);
                self.release().await?;
            }
            Packet::UnsubAck(pkid) => {
                if let Some(done) = self.flow.on_unsuback(pkid) {
                    self.on_completed(done);
                }
                self.release().await?;
            }
            Packet::PingResp => trace!("PINGRESP"),
            other => {
                return Err(Error::Malformed(format!("unexpected {} from broker", other.name())));
            }
        }
        Ok(())
    }

    async fn on_publish(&mut self, publish: Publish) -> Result<()> {
        let (deliver, ack) = self.flow.on_incoming_publish(&publish);
        if let Some(ack) = ack {
            self.send(ack).await?;
        }
        if !deliver {
            return Ok(());
        }

        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        let filters = self.registry.dispatch(&message);
        if filters.is_empty() {
            debug!("No active subscription for {}", message.topic);
        }
        for filter in filters {
            self.emit(Event::MessageReceived {
                filter,
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn on_suback(&mut self, ack: SubAck) {
        let Some(done) = self.flow.on_suback(ack.pkid) else {
            return;
        };
        let Request::Subscribe(filters) = done.request else {
            return;
        };

        for (filter, code) in filters.iter().zip(ack.return_codes) {
            // unsubscribed while the SUBSCRIBE was in flight: still report
            // the broker's answer for the subscribe operation
            let outcome = self.registry.on_suback(&filter.path, code).unwrap_or_else(|| {
                debug!("SUBACK for {} after it was unsubscribed", filter.path);
                SubAckOutcome::from(code)
            });
            match outcome {
                SubAckOutcome::Granted(granted_qos) => self.emit(Event::SubscriptionAcked {
                    op: done.op,
                    filter: filter.path.clone(),
                    granted_qos,
                }),
                SubAckOutcome::Rejected => self.fail(
                    done.op,
                    OperationKind::Subscribe,
                    Error::SubscriptionRejected(filter.path.clone()),
                ),
            }
        }
    }

    fn on_completed(&mut self, done: Completed) {
        match done.request {
            Request::Publish(_) => self.emit(Event::PublishCompleted {
                op: done.op,
                pkid: done.pkid,
            }),
            Request::Unsubscribe(filters) => {
                for filter in filters {
                    self.registry.on_unsuback(&filter);
                    self.emit(Event::Unsubscribed { op: done.op, filter });
                }
            }
            Request::Subscribe(_) => {}
        }
    }
}

async fn read_link(link: &mut Option<Link>) -> Result<Packet> {
    match link {
        Some(link) => link.read().await,
        None => pending().await,
    }
}

async fn poll_handshake(handshake: &mut Option<Handshake>) -> Result<(Link, ConnAck)> {
    match handshake {
        Some(handshake) => handshake.await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
