//! Fixed-capacity table of topic subscriptions
//!
//! The registry remembers every filter the agent has asked the broker for,
//! together with the acknowledgement state of the most recent request and an
//! optional handler for inbound publishes that match the filter.

use crate::topics::topic_matches;
use crate::transport::{IncomingPublish, QoS, SubackCode, SubscriptionRequest};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Callback for inbound publishes. Runs on the dispatcher task; must not block.
pub type PublishHandler = Arc<dyn Fn(&IncomingPublish) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Granted(QoS),
    Failure,
}

#[derive(Clone)]
pub struct TopicSubscription {
    pub filter: String,
    pub qos: QoS,
    pub ack_status: AckStatus,
    handler: Option<PublishHandler>,
}

impl TopicSubscription {
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("ack_status", &self.ack_status)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Subscription registry full ({capacity} slots)")]
    Full { capacity: usize },
}

pub struct SubscriptionRegistry {
    slots: Vec<Option<TopicSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, filter: &str) -> Option<&TopicSubscription> {
        self.entries().find(|entry| entry.filter == filter)
    }

    /// Occupied slots in slot order
    pub fn entries(&self) -> impl Iterator<Item = &TopicSubscription> {
        self.slots.iter().flatten()
    }

    /// Would recording all of `filters` fit?
    pub fn has_room_for<S: AsRef<str>>(&self, filters: &[S]) -> bool {
        let mut new_filters: Vec<&str> = Vec::new();
        for filter in filters {
            let filter = filter.as_ref();
            if self.get(filter).is_none() && !new_filters.contains(&filter) {
                new_filters.push(filter);
            }
        }
        let free = self.slots.iter().filter(|slot| slot.is_none()).count();
        new_filters.len() <= free
    }

    /// Record a subscription request as Pending.
    ///
    /// Re-recording a known filter updates its QoS and status in place; the
    /// handler is only replaced when a new one is supplied.
    pub fn record(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Option<PublishHandler>,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.slots.iter_mut().flatten().find(|e| e.filter == filter) {
            existing.qos = qos;
            existing.ack_status = AckStatus::Pending;
            if handler.is_some() {
                existing.handler = handler;
            }
            return Ok(());
        }

        let capacity = self.capacity();
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(RegistryError::Full { capacity })?;
        *slot = Some(TopicSubscription {
            filter: filter.to_string(),
            qos,
            ack_status: AckStatus::Pending,
            handler,
        });
        Ok(())
    }

    /// Apply SUBACK codes positionally: `codes[i]` answers `filters[i]`
    pub fn on_suback<S: AsRef<str>>(&mut self, filters: &[S], codes: &[SubackCode]) {
        if filters.len() != codes.len() {
            warn!(
                filters = filters.len(),
                codes = codes.len(),
                "SUBACK code count does not match the request"
            );
        }

        for (filter, code) in filters.iter().zip(codes) {
            let filter = filter.as_ref();
            match self.slots.iter_mut().flatten().find(|e| e.filter == filter) {
                Some(entry) => {
                    entry.ack_status = match code {
                        SubackCode::Granted(qos) => AckStatus::Granted(*qos),
                        SubackCode::Failure => AckStatus::Failure,
                    };
                }
                None => debug!(filter, "SUBACK for a filter no longer in the registry"),
            }
        }
    }

    /// Filters whose latest SUBACK was a failure
    pub fn failures(&self) -> Vec<String> {
        self.entries()
            .filter(|entry| entry.ack_status == AckStatus::Failure)
            .map(|entry| entry.filter.clone())
            .collect()
    }

    pub fn reset_all_pending(&mut self) {
        for entry in self.slots.iter_mut().flatten() {
            entry.ack_status = AckStatus::Pending;
        }
    }

    /// Free the slot holding `filter`; returns whether it was present
    pub fn remove(&mut self, filter: &str) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.filter == filter) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// One request per entry, in slot order
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.entries()
            .map(|entry| SubscriptionRequest::new(entry.filter.clone(), entry.qos))
            .collect()
    }

    /// Hand an inbound publish to every matching entry with a handler.
    /// Returns how many filters matched.
    pub fn dispatch_incoming(&self, message: &IncomingPublish) -> usize {
        let mut matched = 0;
        for entry in self.entries() {
            if topic_matches(&message.topic, &entry.filter) {
                matched += 1;
                if let Some(handler) = &entry.handler {
                    handler(message);
                }
            }
        }
        matched
    }
}
