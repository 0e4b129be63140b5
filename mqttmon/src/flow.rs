//! Outbound queue and flow controller.
//!
//! Owns every QoS 1/2 operation between "sent" and "acknowledged": packet
//! identifier assignment, acknowledgement tracking (including the QoS 2
//! PUBREC/PUBREL/PUBCOMP handshake), retransmission with the DUP flag, the
//! in-flight window, and delivery timeouts. It also tracks inbound QoS 2
//! publishes so duplicates are not delivered twice.
//!
//! The controller never touches the transport. It returns the packets the
//! engine has to write.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Packet, Publish, Subscribe, SubscribeFilter, Unsubscribe};
use crate::types::{OpId, OperationKind, QoS};

/// What an outbound operation asks the broker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Publish(Publish),
    Subscribe(Vec<SubscribeFilter>),
    Unsubscribe(Vec<String>),
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Publish(_) => OperationKind::Publish,
            Request::Subscribe(_) => OperationKind::Subscribe,
            Request::Unsubscribe(_) => OperationKind::Unsubscribe,
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            Request::Publish(p) => p.qos,
            // SUBSCRIBE and UNSUBSCRIBE are always acknowledged
            Request::Subscribe(_) | Request::Unsubscribe(_) => QoS::AtLeastOnce,
        }
    }

    /// Build the packet for this request under `pkid`.
    fn packet(&self, pkid: u16, dup: bool) -> Packet {
        match self {
            Request::Publish(p) => {
                let mut publish = p.clone();
                publish.pkid = if publish.qos == QoS::AtMostOnce { 0 } else { pkid };
                publish.dup = dup && publish.qos != QoS::AtMostOnce;
                Packet::Publish(publish)
            }
            Request::Subscribe(filters) => Packet::Subscribe(Subscribe {
                pkid,
                filters: filters.clone(),
            }),
            Request::Unsubscribe(topics) => Packet::Unsubscribe(Unsubscribe {
                pkid,
                topics: topics.clone(),
            }),
        }
    }
}

/// Acknowledgement an in-flight operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitPubAck,
    AwaitPubRec,
    AwaitPubComp,
    AwaitSubAck,
    AwaitUnsubAck,
}

/// A QoS 1/2 operation waiting for acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub op: OpId,
    pub pkid: u16,
    pub request: Request,
    pub step: Step,
    /// Number of retransmissions so far.
    pub retries: u32,
    pub deadline: Instant,
    seq: u64,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    pub fn qos(&self) -> QoS {
        self.request.qos()
    }

    /// Packet to send for the current step.
    fn packet(&self, dup: bool) -> Packet {
        match self.step {
            Step::AwaitPubComp => Packet::PubRel(self.pkid),
            _ => self.request.packet(self.pkid, dup),
        }
    }
}

/// An operation the broker acknowledged.
#[derive(Debug, Clone)]
pub struct Completed {
    pub op: OpId,
    pub pkid: u16,
    pub request: Request,
}

/// An operation that ran out of retries.
#[derive(Debug, Clone)]
pub struct Failed {
    pub op: OpId,
    pub pkid: u16,
    pub request: Request,
    pub error: Error,
}

/// Result of a deadline sweep.
#[derive(Debug, Default)]
pub struct Expired {
    pub resend: Vec<Packet>,
    pub failed: Vec<Failed>,
}

/// Flow controller settings.
#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub max_inflight: u16,
}

#[derive(Debug)]
struct Queued {
    op: OpId,
    request: Request,
}

/// Outbound queue and flow controller.
#[derive(Debug)]
pub struct FlowController {
    config: FlowConfig,
    next_pkid: u16,
    next_seq: u64,
    inflight: HashMap<u16, PendingOperation>,
    backlog: VecDeque<Queued>,
    incoming_qos2: HashSet<u16>,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            next_pkid: 1,
            next_seq: 0,
            inflight: HashMap::new(),
            backlog: VecDeque::new(),
            incoming_qos2: HashSet::new(),
        }
    }

    /// Replace the settings (read from a new connect config).
    pub fn reconfigure(&mut self, config: FlowConfig) {
        self.config = config;
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Submit an operation.
    ///
    /// QoS 0 publishes come straight back as a packet and are not tracked.
    /// Everything else gets a packet identifier and is tracked, or waits in
    /// the backlog while the in-flight window is full (`Ok(None)`).
    pub fn submit(&mut self, op: OpId, request: Request, now: Instant) -> Result<Option<Packet>> {
        if request.qos() == QoS::AtMostOnce {
            return Ok(Some(request.packet(0, false)));
        }

        if !self.backlog.is_empty() || !self.has_window() {
            trace!("In-flight window full, queueing {} ({})", op, request.kind());
            self.backlog.push_back(Queued { op, request });
            return Ok(None);
        }

        self.track(op, request, now).map(Some)
    }

    /// Move backlog entries into the in-flight window while it has room.
    pub fn release(&mut self, now: Instant) -> Vec<Packet> {
        let mut packets = Vec::new();
        while self.has_window() {
            let Some(queued) = self.backlog.pop_front() else {
                break;
            };
            match self.track(queued.op, queued.request, now) {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    warn!("Cannot release {}: {}", queued.op, e);
                    break;
                }
            }
        }
        packets
    }

    fn has_window(&self) -> bool {
        self.inflight.len() < self.config.max_inflight as usize
    }

    fn track(&mut self, op: OpId, request: Request, now: Instant) -> Result<Packet> {
        let pkid = self.allocate_pkid()?;
        let step = match &request {
            Request::Publish(p) if p.qos == QoS::ExactlyOnce => Step::AwaitPubRec,
            Request::Publish(_) => Step::AwaitPubAck,
            Request::Subscribe(_) => Step::AwaitSubAck,
            Request::Unsubscribe(_) => Step::AwaitUnsubAck,
        };

        let pending = PendingOperation {
            op,
            pkid,
            request,
            step,
            retries: 0,
            deadline: now + self.config.ack_timeout,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let packet = pending.packet(false);
        debug!("Tracking {} as pkid={} ({:?})", op, pkid, step);
        self.inflight.insert(pkid, pending);
        Ok(packet)
    }

    /// Next free packet identifier, skipping the ones still outstanding.
    fn allocate_pkid(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let pkid = self.next_pkid;
            self.next_pkid = self.next_pkid.wrapping_add(1);
            if self.next_pkid == 0 {
                self.next_pkid = 1;
            }

            if !self.inflight.contains_key(&pkid) {
                return Ok(pkid);
            }
        }

        Err(Error::PacketIdExhausted)
    }

    fn complete(&mut self, pkid: u16, expected: Step, ack: &str) -> Option<Completed> {
        match self.inflight.get(&pkid) {
            Some(pending) if pending.step == expected => {
                let pending = self.inflight.remove(&pkid)?;
                debug!("{} completed by {} (pkid={})", pending.op, ack, pkid);
                Some(Completed {
                    op: pending.op,
                    pkid,
                    request: pending.request,
                })
            }
            Some(pending) => {
                debug!("Ignoring {} for pkid={} in step {:?}", ack, pkid, pending.step);
                None
            }
            None => {
                debug!("Ignoring {} for unknown pkid={}", ack, pkid);
                None
            }
        }
    }

    /// PUBACK: completes a QoS 1 publish.
    pub fn on_puback(&mut self, pkid: u16) -> Option<Completed> {
        self.complete(pkid, Step::AwaitPubAck, "PUBACK")
    }

    /// PUBREC: advances a QoS 2 publish and returns the PUBREL to send.
    ///
    /// Duplicate or out-of-order PUBRECs change nothing.
    pub fn on_pubrec(&mut self, pkid: u16, now: Instant) -> Option<Packet> {
        match self.inflight.get_mut(&pkid) {
            Some(pending) if pending.step == Step::AwaitPubRec => {
                pending.step = Step::AwaitPubComp;
                pending.deadline = now + self.config.ack_timeout;
                trace!("pkid={} awaiting PUBCOMP", pkid);
                Some(Packet::PubRel(pkid))
            }
            Some(pending) => {
                debug!("Ignoring PUBREC for pkid={} in step {:?}", pkid, pending.step);
                None
            }
            None => {
                debug!("Ignoring PUBREC for unknown pkid={}", pkid);
                None
            }
        }
    }

    /// PUBCOMP: completes a QoS 2 publish.
    pub fn on_pubcomp(&mut self, pkid: u16) -> Option<Completed> {
        self.complete(pkid, Step::AwaitPubComp, "PUBCOMP")
    }

    /// SUBACK: completes a subscribe.
    pub fn on_suback(&mut self, pkid: u16) -> Option<Completed> {
        self.complete(pkid, Step::AwaitSubAck, "SUBACK")
    }

    /// UNSUBACK: completes an unsubscribe.
    pub fn on_unsuback(&mut self, pkid: u16) -> Option<Completed> {
        self.complete(pkid, Step::AwaitUnsubAck, "UNSUBACK")
    }

    /// Retransmit what is overdue; fail what has no retries left.
    pub fn poll_expired(&mut self, now: Instant) -> Expired {
        let mut due: Vec<u16> = self
            .inflight
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.pkid)
            .collect();
        due.sort_by_key(|pkid| self.inflight.get(pkid).map(|p| p.seq));

        let mut expired = Expired::default();
        for pkid in due {
            let Some(pending) = self.inflight.get_mut(&pkid) else {
                continue;
            };

            if pending.retries >= self.config.max_retries {
                let retries = pending.retries;
                if let Some(pending) = self.inflight.remove(&pkid) {
                    warn!("{} (pkid={}) timed out after {} retries", pending.op, pkid, retries);
                    expired.failed.push(Failed {
                        op: pending.op,
                        pkid,
                        request: pending.request,
                        error: Error::DeliveryTimeout { pkid, retries },
                    });
                }
                continue;
            }

            pending.retries += 1;
            pending.deadline = now + self.config.ack_timeout;
            debug!("Retransmitting {} (pkid={}, retry {})", pending.op, pkid, pending.retries);
            expired.resend.push(pending.packet(true));
        }

        expired
    }

    /// Earliest retry deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight.values().map(|p| p.deadline).min()
    }

    /// After a reconnect: resend every outstanding operation with fresh
    /// deadlines, in submission order.
    pub fn resend_all(&mut self, now: Instant) -> Vec<Packet> {
        let mut pending: Vec<&mut PendingOperation> = self.inflight.values_mut().collect();
        pending.sort_by_key(|p| p.seq);

        pending
            .into_iter()
            .map(|p| {
                p.deadline = now + self.config.ack_timeout;
                p.packet(true)
            })
            .collect()
    }

    /// The broker answered CONNACK without a stored session.
    ///
    /// Inbound QoS 2 identifiers from the old session are forgotten so the
    /// new session can reuse them. Publishes already PUBREC'd are handed
    /// back as completed: the broker took ownership of the message and no
    /// longer holds the state a PUBREL would release.
    pub fn reset_session(&mut self) -> Vec<Completed> {
        self.incoming_qos2.clear();

        let released: Vec<u16> = self
            .inflight
            .values()
            .filter(|p| p.step == Step::AwaitPubComp)
            .map(|p| p.pkid)
            .collect();

        let mut completed: Vec<PendingOperation> = released
            .into_iter()
            .filter_map(|pkid| self.inflight.remove(&pkid))
            .collect();
        completed.sort_by_key(|p| p.seq);

        completed
            .into_iter()
            .map(|p| {
                debug!("{} completed by session reset (pkid={})", p.op, p.pkid);
                Completed {
                    op: p.op,
                    pkid: p.pkid,
                    request: p.request,
                }
            })
            .collect()
    }

    /// Discard everything, returning the ids of the abandoned operations.
    pub fn clear(&mut self) -> Vec<(OpId, OperationKind)> {
        let mut pending: Vec<PendingOperation> = self.inflight.drain().map(|(_, p)| p).collect();
        pending.sort_by_key(|p| p.seq);

        let mut dropped: Vec<(OpId, OperationKind)> =
            pending.into_iter().map(|p| (p.op, p.kind())).collect();
        dropped.extend(self.backlog.drain(..).map(|q| (q.op, q.request.kind())));

        self.incoming_qos2.clear();
        dropped
    }

    pub fn get(&self, pkid: u16) -> Option<&PendingOperation> {
        self.inflight.get(&pkid)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle an inbound PUBLISH.
    ///
    /// Returns whether the message should be delivered and the
    /// acknowledgement to send back, if any.
    pub fn on_incoming_publish(&mut self, publish: &Publish) -> (bool, Option<Packet>) {
        match publish.qos {
            QoS::AtMostOnce => (true, None),
            QoS::AtLeastOnce => (true, Some(Packet::PubAck(publish.pkid))),
            QoS::ExactlyOnce => {
                let first = self.incoming_qos2.insert(publish.pkid);
                if !first {
                    debug!("Suppressing duplicate QoS 2 publish pkid={}", publish.pkid);
                }
                (first, Some(Packet::PubRec(publish.pkid)))
            }
        }
    }

    /// Handle an inbound PUBREL, returning the PUBCOMP.
    pub fn on_incoming_pubrel(&mut self, pkid: u16) -> Packet {
        if !self.incoming_qos2.remove(&pkid) {
            debug!("PUBREL for unknown inbound pkid={}", pkid);
        }
        Packet::PubComp(pkid)
    }
}
