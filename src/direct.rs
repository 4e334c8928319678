//! Single-task client built on [`PacketWaiter`]
//!
//! For programs with one task talking to the broker there is no need for the
//! command queue: each operation writes its packet and then waits for the
//! matching acknowledgement itself. Incoming publishes and late acknowledgements
//! seen during a wait are kept and surfaced by [`DirectClient::process`].
//!
//! The client does not reconnect on its own. After an error call
//! [`DirectClient::establish`] again; unacknowledged publishes are re-sent when
//! the broker kept the session.

use crate::backoff::{BackoffError, BackoffPolicy, JitterSource, OsJitter};
use crate::error::{AgentError, AgentResult};
use crate::supervisor::ConnectionSupervisor;
use crate::topics::{validate_filter, validate_topic_name};
use crate::transport::{
    EventPayload, InboundEvent, IncomingPublish, Link, OutgoingMessage, PacketId, PacketKind, QoS,
    SubackCode, SubscriptionRequest,
};
use crate::waiter::PacketWaiter;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DirectSettings {
    /// Clean-session flag used by [`DirectClient::establish`]
    pub clean_session: bool,
    /// Retry schedule for subscriptions the broker rejects
    pub subscribe_backoff: BackoffPolicy,
    /// QoS 1 publishes that may await a PUBACK at once
    pub outgoing_capacity: usize,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            clean_session: true,
            subscribe_backoff: BackoffPolicy::new(
                Duration::from_millis(500),
                Duration::from_millis(2500),
                4,
            ),
            outgoing_capacity: 1,
        }
    }
}

/// A QoS 1 publish still waiting for its PUBACK
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPublish {
    pub packet_id: PacketId,
    pub message: OutgoingMessage,
}

pub struct DirectClient<L: Link> {
    supervisor: ConnectionSupervisor<L>,
    waiter: PacketWaiter,
    settings: DirectSettings,
    outgoing: Vec<OutgoingPublish>,
    inbox: VecDeque<IncomingPublish>,
    jitter: Box<dyn JitterSource>,
}

/// Keep what a wait saw but did not ask for
fn absorb(
    event: &InboundEvent,
    inbox: &mut VecDeque<IncomingPublish>,
    outgoing: &mut Vec<OutgoingPublish>,
) {
    match (&event.kind, &event.payload) {
        (PacketKind::Publish, EventPayload::Publish(message)) => inbox.push_back(message.clone()),
        (PacketKind::PubAck, _) => {
            if let Some(id) = event.packet_id {
                outgoing.retain(|entry| entry.packet_id != id);
            }
        }
        _ => {}
    }
}

impl<L: Link> DirectClient<L> {
    pub fn new(
        supervisor: ConnectionSupervisor<L>,
        waiter: PacketWaiter,
        settings: DirectSettings,
    ) -> Self {
        Self::with_jitter(supervisor, waiter, settings, Box::new(OsJitter))
    }

    pub fn with_jitter(
        supervisor: ConnectionSupervisor<L>,
        waiter: PacketWaiter,
        settings: DirectSettings,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        Self {
            supervisor,
            waiter,
            settings,
            outgoing: Vec::new(),
            inbox: VecDeque::new(),
            jitter,
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<L> {
        &self.supervisor
    }

    /// Publishes that have not been acknowledged yet
    pub fn outgoing(&self) -> &[OutgoingPublish] {
        &self.outgoing
    }

    pub fn last_received(&self) -> Option<PacketKind> {
        self.waiter.last_received()
    }

    /// Connect with retries, then settle the outgoing table.
    ///
    /// With a resumed session every unacknowledged publish is re-sent with the
    /// DUP flag; otherwise the broker has forgotten them and they are dropped.
    pub async fn establish(&mut self) -> AgentResult<bool> {
        let session_present = self
            .supervisor
            .connect_with_retries(self.settings.clean_session)
            .await?;

        if session_present {
            for entry in self.outgoing.iter_mut() {
                let resent = self
                    .supervisor
                    .link_mut()
                    .publish(&entry.message, true)
                    .await?;
                if let Some(id) = resent {
                    debug!(
                        old = entry.packet_id,
                        new = id,
                        topic = %entry.message.topic,
                        "Publish re-sent"
                    );
                    entry.packet_id = id;
                }
            }
        } else if !self.outgoing.is_empty() {
            warn!(
                dropped = self.outgoing.len(),
                "Session not resumed, discarding unacknowledged publishes"
            );
            self.outgoing.clear();
        }

        Ok(session_present)
    }

    /// Subscribe to one filter, retrying with backoff while the broker rejects it.
    ///
    /// Returns the granted QoS.
    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> AgentResult<QoS> {
        validate_filter(filter).map_err(|e| AgentError::invalid_input(e.to_string()))?;

        let policy = self.settings.subscribe_backoff;
        let mut backoff = policy.start();
        let request = [SubscriptionRequest::new(filter, qos)];

        loop {
            let packet_id = self.supervisor.link_mut().subscribe(&request).await?;
            let correlation = self.waiter.expect(PacketKind::SubAck).with_id(packet_id);
            let inbox = &mut self.inbox;
            let outgoing = &mut self.outgoing;
            let suback = self
                .waiter
                .wait_for_correlated(self.supervisor.link_mut(), correlation, |e| {
                    absorb(e, inbox, outgoing)
                })
                .await?;

            match suback.suback_codes().first() {
                Some(SubackCode::Granted(granted)) => {
                    info!(filter, granted = granted.level(), "Subscribed");
                    return Ok(*granted);
                }
                _ => match policy.next_delay(&mut backoff, self.jitter.as_mut()) {
                    Ok(delay) => {
                        warn!(
                            filter,
                            attempt = backoff.attempts_done(),
                            delay_ms = delay.as_millis() as u64,
                            "Subscription rejected, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(BackoffError::Exhausted { attempts }) => {
                        return Err(AgentError::SubscribeRejected {
                            filter: filter.to_string(),
                            attempts: attempts + 1,
                        });
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    pub async fn unsubscribe(&mut self, filter: &str) -> AgentResult<()> {
        validate_filter(filter).map_err(|e| AgentError::invalid_input(e.to_string()))?;

        let packet_id = self
            .supervisor
            .link_mut()
            .unsubscribe(&[filter.to_string()])
            .await?;
        let correlation = self.waiter.expect(PacketKind::UnsubAck).with_id(packet_id);
        let inbox = &mut self.inbox;
        let outgoing = &mut self.outgoing;
        self.waiter
            .wait_for_correlated(self.supervisor.link_mut(), correlation, |e| {
                absorb(e, inbox, outgoing)
            })
            .await?;

        info!(filter, "Unsubscribed");
        Ok(())
    }

    /// QoS 1 publish; returns once the broker acknowledged it
    pub async fn publish<P: Into<Bytes>>(
        &mut self,
        topic: &str,
        payload: P,
    ) -> AgentResult<PacketId> {
        validate_topic_name(topic).map_err(|e| AgentError::invalid_input(e.to_string()))?;
        if self.outgoing.len() >= self.settings.outgoing_capacity {
            return Err(AgentError::OutgoingTableFull {
                capacity: self.settings.outgoing_capacity,
            });
        }

        let message = OutgoingMessage::new(topic, payload, QoS::AtLeastOnce);
        let packet_id = self
            .supervisor
            .link_mut()
            .publish(&message, false)
            .await?
            .ok_or_else(|| AgentError::internal_error("QoS 1 publish returned no packet id"))?;
        self.outgoing.push(OutgoingPublish { packet_id, message });

        let correlation = self.waiter.expect(PacketKind::PubAck).with_id(packet_id);
        let inbox = &mut self.inbox;
        let outgoing = &mut self.outgoing;
        self.waiter
            .wait_for_correlated(self.supervisor.link_mut(), correlation, |e| {
                absorb(e, inbox, outgoing)
            })
            .await?;

        debug!(topic, packet_id, "Publish acknowledged");
        Ok(packet_id)
    }

    /// Run one pump of at most `timeout` and return every publish received so far
    pub async fn process(&mut self, timeout: Duration) -> AgentResult<Vec<IncomingPublish>> {
        let events = self.supervisor.link_mut().pump_once(timeout).await?;
        for event in &events {
            absorb(event, &mut self.inbox, &mut self.outgoing);
        }
        Ok(self.inbox.drain(..).collect())
    }

    pub async fn disconnect(&mut self) -> AgentResult<()> {
        self.supervisor.disconnect().await?;
        Ok(())
    }
}
