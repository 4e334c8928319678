//! Bounded wait for one inbound packet
//!
//! Single-caller mode: whoever owns the engine pumps it until the expected
//! packet shows up. Every event seen on the way is handed to a callback, and
//! the kind of the last one is kept as a marker. Each pump is wrapped in its
//! own timeout, so a wait never takes longer than `max_polls * per_poll_timeout`
//! even when the engine overstays its budget.

use crate::transport::{EngineError, InboundEvent, PacketId, PacketKind, ProtocolEngine};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Engine failed while waiting for {expected:?}")]
    Engine {
        expected: PacketKind,
        #[source]
        source: EngineError,
    },
    #[error("{expected:?} not received after {polls} polls")]
    Exhausted { expected: PacketKind, polls: u32 },
}

/// What a wait is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCorrelation {
    pub expected_type: PacketKind,
    pub expected_id: Option<PacketId>,
    pub attempts_remaining: u32,
    pub per_attempt_timeout: Duration,
}

impl PacketCorrelation {
    pub fn new(expected_type: PacketKind, max_polls: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            expected_type,
            expected_id: None,
            attempts_remaining: max_polls,
            per_attempt_timeout,
        }
    }

    pub fn with_id(mut self, packet_id: PacketId) -> Self {
        self.expected_id = Some(packet_id);
        self
    }

    fn matches(&self, event: &InboundEvent) -> bool {
        event.kind == self.expected_type
            && self
                .expected_id
                .map_or(true, |id| event.packet_id == Some(id))
    }
}

#[derive(Debug, Clone)]
pub struct PacketWaiter {
    per_poll_timeout: Duration,
    max_polls: u32,
    last_received: Option<PacketKind>,
}

impl PacketWaiter {
    pub fn new(per_poll_timeout: Duration, max_polls: u32) -> Self {
        Self {
            per_poll_timeout,
            max_polls,
            last_received: None,
        }
    }

    /// Kind of the most recent packet seen by any wait
    pub fn last_received(&self) -> Option<PacketKind> {
        self.last_received
    }

    /// Correlation with this waiter's default budget
    pub fn expect(&self, expected_type: PacketKind) -> PacketCorrelation {
        PacketCorrelation::new(expected_type, self.max_polls, self.per_poll_timeout)
    }

    /// Shorthand for [`wait_for_correlated`](Self::wait_for_correlated) with the default budget
    pub async fn wait_for<E, F>(
        &mut self,
        engine: &mut E,
        expected_type: PacketKind,
        on_event: F,
    ) -> Result<InboundEvent, WaitError>
    where
        E: ProtocolEngine + ?Sized,
        F: FnMut(&InboundEvent),
    {
        let correlation = self.expect(expected_type);
        self.wait_for_correlated(engine, correlation, on_event).await
    }

    /// Pump `engine` until an event matching `correlation` arrives.
    ///
    /// All events returned by the pump that delivered the match are still
    /// passed to `on_event`.
    pub async fn wait_for_correlated<E, F>(
        &mut self,
        engine: &mut E,
        mut correlation: PacketCorrelation,
        mut on_event: F,
    ) -> Result<InboundEvent, WaitError>
    where
        E: ProtocolEngine + ?Sized,
        F: FnMut(&InboundEvent),
    {
        self.last_received = None;
        let total_polls = correlation.attempts_remaining;

        while correlation.attempts_remaining > 0 {
            correlation.attempts_remaining -= 1;

            let pumped = tokio::time::timeout(
                correlation.per_attempt_timeout,
                engine.pump_once(correlation.per_attempt_timeout),
            )
            .await;
            let events = match pumped {
                Ok(Ok(events)) => events,
                Ok(Err(source)) => {
                    return Err(WaitError::Engine {
                        expected: correlation.expected_type,
                        source,
                    })
                }
                Err(_) => {
                    debug!(expected = ?correlation.expected_type, "Pump overran its budget");
                    continue;
                }
            };

            let mut matched = None;
            for event in events {
                self.last_received = Some(event.kind);
                on_event(&event);
                if matched.is_none() && correlation.matches(&event) {
                    matched = Some(event);
                }
            }
            if let Some(event) = matched {
                return Ok(event);
            }
        }

        warn!(
            expected = ?correlation.expected_type,
            packet_id = ?correlation.expected_id,
            polls = total_polls,
            "Expected packet did not arrive"
        );
        Err(WaitError::Exhausted {
            expected: correlation.expected_type,
            polls: total_polls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockLink;
    use crate::transport::{QoS, SubackCode};

    #[tokio::test]
    async fn test_returns_matching_event_and_reports_others() {
        // Arrange
        let mut link = MockLink::new();
        link.push_inbound(InboundEvent::signal(PacketKind::PingResp)).await;
        link.push_inbound(InboundEvent::suback(4, vec![SubackCode::Granted(QoS::AtLeastOnce)]))
            .await;
        let mut waiter = PacketWaiter::new(Duration::from_millis(50), 3);
        let mut seen = Vec::new();

        // Act
        let event = waiter
            .wait_for(&mut link, PacketKind::SubAck, |e| seen.push(e.kind))
            .await
            .unwrap();

        // Assert
        assert_eq!(event.packet_id, Some(4));
        assert_eq!(seen, vec![PacketKind::PingResp, PacketKind::SubAck]);
        assert_eq!(waiter.last_received(), Some(PacketKind::SubAck));
    }

    #[tokio::test]
    async fn test_identifier_must_match_when_given() {
        let mut link = MockLink::new();
        link.push_inbound(InboundEvent::ack(PacketKind::PubAck, 1)).await;
        let mut waiter = PacketWaiter::new(Duration::from_millis(10), 2);

        let correlation = waiter.expect(PacketKind::PubAck).with_id(2);
        let result = waiter
            .wait_for_correlated(&mut link, correlation, |_| {})
            .await;

        assert!(matches!(result, Err(WaitError::Exhausted { polls: 2, .. })));
        assert_eq!(waiter.last_received(), Some(PacketKind::PubAck));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_even_when_engine_stalls() {
        let mut link = MockLink::new();
        link.set_pump_delay(Some(Duration::from_secs(3600))).await;
        let mut waiter = PacketWaiter::new(Duration::from_millis(500), 30);

        let started = tokio::time::Instant::now();
        let result = waiter.wait_for(&mut link, PacketKind::SubAck, |_| {}).await;

        assert!(matches!(result, Err(WaitError::Exhausted { polls: 30, .. })));
        assert!(started.elapsed() <= Duration::from_millis(500 * 30));
        assert_eq!(waiter.last_received(), None);
    }

    #[tokio::test]
    async fn test_engine_error_ends_wait() {
        let mut link = MockLink::new();
        link.fail_pumps(1).await;
        let mut waiter = PacketWaiter::new(Duration::from_millis(10), 5);

        let result = waiter.wait_for(&mut link, PacketKind::UnsubAck, |_| {}).await;

        assert!(matches!(result, Err(WaitError::Engine { .. })));
    }
}
