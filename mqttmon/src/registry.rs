//! Subscription registry.
//!
//! Tracks every topic filter the session asked for, what the broker granted,
//! and routes incoming messages to the active subscriptions that match.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::SubscribeReasonCode;
use crate::topic;
use crate::trie::TopicTrie;
use crate::types::{Message, QoS};

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// SUBSCRIBE sent (or waiting to be sent), no SUBACK yet.
    Pending,
    /// Acknowledged by the broker; receives messages.
    Active,
    /// UNSUBSCRIBE sent, waiting for UNSUBACK. No longer receives messages.
    Unsubscribing,
}

/// A topic filter subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub requested_qos: QoS,
    /// Set only once the broker acknowledges the subscription.
    pub granted_qos: Option<QoS>,
    pub state: SubscriptionState,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }
}

/// Outcome of a SUBACK return code for one filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckOutcome {
    Granted(QoS),
    Rejected,
}

impl From<SubscribeReasonCode> for SubAckOutcome {
    fn from(code: SubscribeReasonCode) -> Self {
        match code {
            SubscribeReasonCode::Success(qos) => SubAckOutcome::Granted(qos),
            SubscribeReasonCode::Failure => SubAckOutcome::Rejected,
        }
    }
}

/// Filter → subscription map plus a trie index of the active filters.
#[derive(Debug, Default)]
pub struct Registry {
    subscriptions: HashMap<String, Subscription>,
    index: TopicTrie<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending subscription, or re-request an existing one.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()> {
        topic::validate_filter(filter)?;

        match self.subscriptions.get_mut(filter) {
            Some(sub) if sub.state == SubscriptionState::Unsubscribing => {
                // resubscribed before the UNSUBACK arrived
                sub.requested_qos = qos;
                sub.granted_qos = None;
                sub.state = SubscriptionState::Pending;
            }
            Some(sub) => {
                sub.requested_qos = qos;
            }
            None => {
                self.subscriptions.insert(
                    filter.to_string(),
                    Subscription {
                        filter: filter.to_string(),
                        requested_qos: qos,
                        granted_qos: None,
                        state: SubscriptionState::Pending,
                    },
                );
            }
        }

        debug!("Subscription {} pending (qos {:?})", filter, qos);
        Ok(())
    }

    /// Apply the broker's SUBACK return code for `filter`.
    ///
    /// Returns `None` if the filter is no longer registered.
    pub fn on_suback(&mut self, filter: &str, code: SubscribeReasonCode) -> Option<SubAckOutcome> {
        let sub = self.subscriptions.get_mut(filter)?;
        if sub.state == SubscriptionState::Unsubscribing {
            return None;
        }

        match code {
            SubscribeReasonCode::Success(granted) => {
                sub.granted_qos = Some(granted);
                if sub.state != SubscriptionState::Active {
                    sub.state = SubscriptionState::Active;
                    // filter was validated on subscribe
                    let _ = self.index.insert(filter, filter.to_string());
                }
                debug!("Subscription {} active (granted qos {:?})", filter, granted);
                Some(SubAckOutcome::Granted(granted))
            }
            SubscribeReasonCode::Failure => {
                debug!("Subscription {} rejected by broker", filter);
                self.remove(filter);
                Some(SubAckOutcome::Rejected)
            }
        }
    }

    /// A SUBSCRIBE for `filter` was never acknowledged.
    pub fn on_subscribe_failed(&mut self, filter: &str) {
        if self
            .subscriptions
            .get(filter)
            .is_some_and(|s| s.state == SubscriptionState::Pending)
        {
            self.subscriptions.remove(filter);
        }
    }

    /// Stop delivering to `filter` and mark it as awaiting UNSUBACK.
    pub fn unsubscribe(&mut self, filter: &str) -> Result<()> {
        let sub = self
            .subscriptions
            .get_mut(filter)
            .ok_or_else(|| Error::NotSubscribed(filter.to_string()))?;

        sub.state = SubscriptionState::Unsubscribing;
        self.index.remove(filter, |f| f == filter);
        debug!("Subscription {} unsubscribing", filter);
        Ok(())
    }

    /// UNSUBACK (or its timeout) for `filter`. Returns true if removed.
    pub fn on_unsuback(&mut self, filter: &str) -> bool {
        if self
            .subscriptions
            .get(filter)
            .is_some_and(|s| s.state == SubscriptionState::Unsubscribing)
        {
            self.subscriptions.remove(filter);
            return true;
        }
        false
    }

    /// Filters of the active subscriptions matching the message topic.
    ///
    /// A message matching two filters is returned for both.
    pub fn dispatch(&self, msg: &Message) -> Vec<String> {
        let filters: Vec<String> = self.index.matches(&msg.topic).into_iter().cloned().collect();
        trace!("Message on {} matched {} subscription(s)", msg.topic, filters.len());
        filters
    }

    /// The connection dropped: active subscriptions must be requested again.
    ///
    /// Active subscriptions become pending and are returned, in no particular
    /// order. Pending and unsubscribing entries keep their state; their
    /// SUBSCRIBE/UNSUBSCRIBE is still outstanding and will be re-sent.
    pub fn deactivate_all(&mut self) -> Vec<(String, QoS)> {
        self.index.clear();

        self.subscriptions
            .values_mut()
            .filter(|sub| sub.state == SubscriptionState::Active)
            .map(|sub| {
                sub.state = SubscriptionState::Pending;
                sub.granted_qos = None;
                (sub.filter.clone(), sub.requested_qos)
            })
            .collect()
    }

    /// Forget every subscription.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.index.clear();
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.subscriptions.get(filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drop `filter` regardless of its state.
    pub fn remove(&mut self, filter: &str) -> bool {
        self.index.remove(filter, |f| f == filter);
        self.subscriptions.remove(filter).is_some()
    }
}
