//! Mock link for testing
//!
//! [`MockLink`] implements both [`Transport`] and [`ProtocolEngine`] against an
//! in-memory broker model. Clones share state, so a test keeps one clone to
//! script failures and inspect recorded calls while the agent owns another.

use crate::backoff::{BackoffPolicy, JitterSource};
use crate::supervisor::SupervisorSettings;
use crate::topics::topic_matches;
use crate::transport::{
    EngineError, Endpoint, InboundEvent, IncomingPublish, OutgoingMessage, PacketId, PacketKind,
    ProtocolEngine, QoS, SessionIdentity, SubackCode, SubscriptionRequest, TlsSettings, Transport,
    TransportError,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One call made against the mock, in order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Connect(Endpoint),
    Close,
    Handshake {
        clean_session: bool,
    },
    Subscribe {
        packet_id: PacketId,
        filters: Vec<String>,
    },
    Publish {
        packet_id: Option<PacketId>,
        topic: String,
        dup: bool,
    },
    Unsubscribe {
        packet_id: PacketId,
        filters: Vec<String>,
    },
    Disconnect,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<LinkCall>,
    connect_failures: u32,
    handshake_failures: u32,
    session_present: VecDeque<bool>,
    subscribe_failures: u32,
    publish_failures: u32,
    unsubscribe_failures: u32,
    pump_failures: u32,
    suback_script: VecDeque<Vec<SubackCode>>,
    auto_ack: bool,
    echo_publishes: bool,
    pump_delay: Option<Duration>,
    inbound: VecDeque<InboundEvent>,
    broker_subscriptions: Vec<String>,
    next_packet_id: PacketId,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            connect_failures: 0,
            handshake_failures: 0,
            session_present: VecDeque::new(),
            subscribe_failures: 0,
            publish_failures: 0,
            unsubscribe_failures: 0,
            pump_failures: 0,
            suback_script: VecDeque::new(),
            auto_ack: true,
            echo_publishes: false,
            pump_delay: None,
            inbound: VecDeque::new(),
            broker_subscriptions: Vec::new(),
            next_packet_id: 1,
        }
    }
}

impl MockState {
    fn allocate_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = if id == PacketId::MAX { 1 } else { id + 1 };
        id
    }

    fn take_failure(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<LinkCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn connect_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, LinkCall::Connect(_)))
            .count()
    }

    /// Make the next `count` transport connects fail
    pub async fn fail_connects(&self, count: u32) {
        self.state.lock().await.connect_failures = count;
    }

    pub async fn fail_handshakes(&self, count: u32) {
        self.state.lock().await.handshake_failures = count;
    }

    pub async fn fail_subscribes(&self, count: u32) {
        self.state.lock().await.subscribe_failures = count;
    }

    pub async fn fail_publishes(&self, count: u32) {
        self.state.lock().await.publish_failures = count;
    }

    pub async fn fail_unsubscribes(&self, count: u32) {
        self.state.lock().await.unsubscribe_failures = count;
    }

    pub async fn fail_pumps(&self, count: u32) {
        self.state.lock().await.pump_failures = count;
    }

    /// Session-present flag for the next successful handshake (default false)
    pub async fn script_session_present(&self, present: bool) {
        self.state.lock().await.session_present.push_back(present);
    }

    /// SUBACK codes for the next subscribe; by default every filter is granted
    pub async fn script_suback(&self, codes: Vec<SubackCode>) {
        self.state.lock().await.suback_script.push_back(codes);
    }

    /// When disabled, no acknowledgements are generated automatically
    pub async fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().await.auto_ack = enabled;
    }

    /// Route published messages back to matching broker-side subscriptions
    pub async fn set_echo_publishes(&self, enabled: bool) {
        self.state.lock().await.echo_publishes = enabled;
    }

    /// Make each pump sleep before returning
    pub async fn set_pump_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.pump_delay = delay;
    }

    pub async fn push_inbound(&self, event: InboundEvent) {
        self.state.lock().await.inbound.push_back(event);
    }

    pub async fn broker_subscriptions(&self) -> Vec<String> {
        self.state.lock().await.broker_subscriptions.clone()
    }
}

#[async_trait]
impl Transport for MockLink {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        _tls: &TlsSettings,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.calls.push(LinkCall::Connect(endpoint.clone()));
        if MockState::take_failure(&mut state.connect_failures) {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state.lock().await.calls.push(LinkCall::Close);
        Ok(())
    }
}

#[async_trait]
impl ProtocolEngine for MockLink {
    async fn handshake(
        &mut self,
        _identity: &SessionIdentity,
        clean_session: bool,
        connack_timeout: Duration,
    ) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        state.calls.push(LinkCall::Handshake { clean_session });
        if MockState::take_failure(&mut state.handshake_failures) {
            return Err(EngineError::ConnAckTimeout(connack_timeout));
        }
        let present = state.session_present.pop_front().unwrap_or(false);
        if clean_session || !present {
            state.broker_subscriptions.clear();
        }
        Ok(present && !clean_session)
    }

    async fn subscribe(
        &mut self,
        requests: &[SubscriptionRequest],
    ) -> Result<PacketId, EngineError> {
        let mut state = self.state.lock().await;
        if MockState::take_failure(&mut state.subscribe_failures) {
            return Err(EngineError::SendFailed("Mock subscribe failure".to_string()));
        }
        let packet_id = state.allocate_id();
        let filters: Vec<String> = requests.iter().map(|r| r.filter.clone()).collect();
        state.calls.push(LinkCall::Subscribe {
            packet_id,
            filters: filters.clone(),
        });

        let codes = state.suback_script.pop_front().unwrap_or_else(|| {
            requests
                .iter()
                .map(|r| SubackCode::Granted(r.qos))
                .collect()
        });
        for (filter, code) in filters.iter().zip(&codes) {
            if !code.is_failure() && !state.broker_subscriptions.contains(filter) {
                state.broker_subscriptions.push(filter.clone());
            }
        }
        if state.auto_ack {
            state.inbound.push_back(InboundEvent::suback(packet_id, codes));
        }
        Ok(packet_id)
    }

    async fn publish(
        &mut self,
        message: &OutgoingMessage,
        dup: bool,
    ) -> Result<Option<PacketId>, EngineError> {
        let mut state = self.state.lock().await;
        if MockState::take_failure(&mut state.publish_failures) {
            return Err(EngineError::SendFailed("Mock publish failure".to_string()));
        }
        let packet_id = match message.qos {
            QoS::AtMostOnce => None,
            _ => Some(state.allocate_id()),
        };
        state.calls.push(LinkCall::Publish {
            packet_id,
            topic: message.topic.clone(),
            dup,
        });

        if state.echo_publishes
            && state
                .broker_subscriptions
                .iter()
                .any(|filter| topic_matches(&message.topic, filter))
        {
            state.inbound.push_back(InboundEvent::publish(IncomingPublish {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: message.qos,
                retain: message.retain,
            }));
        }
        if state.auto_ack {
            match (message.qos, packet_id) {
                (QoS::AtLeastOnce, Some(id)) => {
                    state.inbound.push_back(InboundEvent::ack(PacketKind::PubAck, id))
                }
                (QoS::ExactlyOnce, Some(id)) => {
                    state.inbound.push_back(InboundEvent::ack(PacketKind::PubRec, id));
                    state.inbound.push_back(InboundEvent::ack(PacketKind::PubComp, id));
                }
                _ => {}
            }
        }
        Ok(packet_id)
    }

    async fn unsubscribe(&mut self, filters: &[String]) -> Result<PacketId, EngineError> {
        let mut state = self.state.lock().await;
        if MockState::take_failure(&mut state.unsubscribe_failures) {
            return Err(EngineError::SendFailed("Mock unsubscribe failure".to_string()));
        }
        let packet_id = state.allocate_id();
        state.calls.push(LinkCall::Unsubscribe {
            packet_id,
            filters: filters.to_vec(),
        });
        state.broker_subscriptions.retain(|f| !filters.contains(f));
        if state.auto_ack {
            state
                .inbound
                .push_back(InboundEvent::ack(PacketKind::UnsubAck, packet_id));
        }
        Ok(packet_id)
    }

    async fn send_disconnect(&mut self) -> Result<(), EngineError> {
        self.state.lock().await.calls.push(LinkCall::Disconnect);
        Ok(())
    }

    async fn pump_once(&mut self, _timeout: Duration) -> Result<Vec<InboundEvent>, EngineError> {
        let delay = {
            let mut state = self.state.lock().await;
            if MockState::take_failure(&mut state.pump_failures) {
                return Err(EngineError::ReceiveFailed("Mock receive failure".to_string()));
            }
            state.pump_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().await.inbound.drain(..).collect())
    }
}

/// Jitter source that always picks the shortest delay
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroJitter;

impl JitterSource for ZeroJitter {
    fn next_u64(&mut self) -> Result<u64, rand::Error> {
        Ok(0)
    }
}

/// Supervisor settings for a broker that only exists in memory
pub fn mock_supervisor_settings(max_attempts: u32) -> SupervisorSettings {
    SupervisorSettings {
        endpoint: Endpoint::new("broker.test", 1883),
        tls: TlsSettings::default(),
        identity: SessionIdentity {
            client_identifier: "mock-client".to_string(),
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
        },
        backoff: BackoffPolicy::new(
            Duration::from_millis(500),
            Duration::from_millis(5000),
            max_attempts,
        ),
        connack_timeout: Duration::from_millis(1000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_grants_and_acks_by_default() {
        let mut link = MockLink::new();

        let id = link
            .subscribe(&[SubscriptionRequest::new("a/#", QoS::AtLeastOnce)])
            .await
            .unwrap();
        let events = link.pump_once(Duration::from_millis(1)).await.unwrap();

        assert_eq!(
            events,
            vec![InboundEvent::suback(id, vec![SubackCode::Granted(QoS::AtLeastOnce)])]
        );
        assert_eq!(link.broker_subscriptions().await, vec!["a/#".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_echo_requires_broker_subscription() {
        let mut link = MockLink::new();
        link.set_echo_publishes(true).await;
        link.set_auto_ack(false).await;

        link.publish(&OutgoingMessage::new("a/b", "x", QoS::AtMostOnce), false)
            .await
            .unwrap();
        assert!(link.pump_once(Duration::ZERO).await.unwrap().is_empty());

        link.subscribe(&[SubscriptionRequest::new("a/+", QoS::AtMostOnce)])
            .await
            .unwrap();
        link.publish(&OutgoingMessage::new("a/b", "x", QoS::AtMostOnce), false)
            .await
            .unwrap();
        let events = link.pump_once(Duration::ZERO).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PacketKind::Publish);
    }

    #[tokio::test]
    async fn test_clean_handshake_drops_broker_state() {
        let mut link = MockLink::new();
        link.subscribe(&[SubscriptionRequest::new("a", QoS::AtLeastOnce)])
            .await
            .unwrap();
        link.script_session_present(true).await;

        let present = link
            .handshake(
                &SessionIdentity {
                    client_identifier: "c".to_string(),
                    keepalive: Duration::from_secs(60),
                    username: None,
                    password: None,
                },
                true,
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(!present);
        assert!(link.broker_subscriptions().await.is_empty());
    }
}
