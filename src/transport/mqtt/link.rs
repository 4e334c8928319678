//! [`Link`](crate::transport::Link) implementation over a rumqttc v5 client
//!
//! rumqttc owns the socket and opens it on the first event-loop poll, so
//! [`Transport::connect`] only resolves the broker and prepares TLS; the TCP
//! and TLS handshakes happen inside [`ProtocolEngine::handshake`]. A fresh
//! client and event loop are built for every handshake so the supervisor,
//! not rumqttc, decides when and how to reconnect.

use super::events::inbound_event;
use super::options::{configure_mqtt_options, prepare_transport, to_wire_qos};
use crate::mqtt_span;
use crate::transport::{
    EngineError, Endpoint, InboundEvent, OutgoingMessage, PacketId, PacketKind, ProtocolEngine,
    QoS, SessionIdentity, SubscriptionRequest, TlsSettings, Transport, TransportError,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Filter, Packet};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use rumqttc::Outgoing;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 10;

struct LinkTarget {
    endpoint: Endpoint,
    transport: Option<rumqttc::Transport>,
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct RumqttcLink {
    target: Option<LinkTarget>,
    session: Option<Session>,
    /// Inbound events seen while waiting for an outgoing packet id
    buffered: VecDeque<InboundEvent>,
    /// UNSUBACKs for all but the last packet of a split batch
    suppressed_unsubacks: HashSet<PacketId>,
    send_timeout: Duration,
}

impl RumqttcLink {
    /// `send_timeout` bounds how long an operation waits for rumqttc to put its packet on the wire
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            target: None,
            session: None,
            buffered: VecDeque::new(),
            suppressed_unsubacks: HashSet::new(),
            send_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn session_mut(&mut self) -> Result<&mut Session, EngineError> {
        self.session.as_mut().ok_or(EngineError::NotConnected)
    }

    /// Translate and buffer an incoming packet unless it is a suppressed UNSUBACK
    fn accept_incoming(&mut self, packet: &Packet) -> Option<InboundEvent> {
        let event = inbound_event(packet)?;
        if event.kind == PacketKind::UnsubAck {
            if let Some(id) = event.packet_id {
                if self.suppressed_unsubacks.remove(&id) {
                    debug!(packet_id = id, "Suppressed UNSUBACK of split batch");
                    return None;
                }
            }
        }
        Some(event)
    }

    /// Poll until rumqttc reports the outgoing packet picked by `select`.
    ///
    /// Inbound packets arriving meanwhile are kept for the next pump.
    async fn await_outgoing(
        &mut self,
        what: &'static str,
        select: fn(&Outgoing) -> Option<PacketId>,
    ) -> Result<PacketId, EngineError> {
        let deadline = Instant::now() + self.send_timeout;
        loop {
            let polled = {
                let session = self.session_mut()?;
                tokio::time::timeout_at(deadline, session.eventloop.poll()).await
            };
            match polled {
                Err(_) => {
                    return Err(EngineError::SendFailed(format!(
                        "{what} not written within {:?}",
                        self.send_timeout
                    )))
                }
                Ok(Err(e)) => return Err(EngineError::SendFailed(e.to_string())),
                Ok(Ok(Event::Outgoing(outgoing))) => {
                    if let Some(id) = select(&outgoing) {
                        return Ok(id);
                    }
                }
                Ok(Ok(Event::Incoming(packet))) => {
                    if let Some(event) = self.accept_incoming(&packet) {
                        self.buffered.push_back(event);
                    }
                }
            }
        }
    }
}

impl Default for RumqttcLink {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for RumqttcLink {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        tls: &TlsSettings,
    ) -> Result<(), TransportError> {
        let transport = prepare_transport(tls)?;

        let mut addresses = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| TransportError::Resolve {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let Some(address) = addresses.next() else {
            return Err(TransportError::ConnectionFailed(format!(
                "{endpoint} resolved to no addresses"
            )));
        };
        debug!(%endpoint, %address, tls = tls.enabled, "Broker resolved");

        self.target = Some(LinkTarget {
            endpoint: endpoint.clone(),
            transport,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        // Dropping the event loop closes the socket
        self.session = None;
        self.target = None;
        self.buffered.clear();
        self.suppressed_unsubacks.clear();
        Ok(())
    }
}

#[async_trait]
impl ProtocolEngine for RumqttcLink {
    async fn handshake(
        &mut self,
        identity: &SessionIdentity,
        clean_session: bool,
        connack_timeout: Duration,
    ) -> Result<bool, EngineError> {
        let target = self.target.as_ref().ok_or(EngineError::NotConnected)?;
        let options = configure_mqtt_options(
            &target.endpoint,
            identity,
            clean_session,
            target.transport.clone(),
        );
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let span = mqtt_span!(client_id = %identity.client_identifier, clean_session);
        let connack = tokio::time::timeout(
            connack_timeout,
            async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            return Ok(ack.session_present)
                        }
                        Ok(_) => continue,
                        Err(ConnectionError::ConnectionRefused(code)) => {
                            return Err(EngineError::Refused(format!("{code:?}")))
                        }
                        Err(e) => return Err(EngineError::ReceiveFailed(e.to_string())),
                    }
                }
            }
            .instrument(span),
        )
        .await
        .map_err(|_| EngineError::ConnAckTimeout(connack_timeout))??;

        info!(
            client_id = %identity.client_identifier,
            session_present = connack,
            "CONNACK received"
        );
        self.buffered.clear();
        self.suppressed_unsubacks.clear();
        self.session = Some(Session { client, eventloop });
        Ok(connack)
    }

    async fn subscribe(
        &mut self,
        requests: &[SubscriptionRequest],
    ) -> Result<PacketId, EngineError> {
        let filters: Vec<Filter> = requests
            .iter()
            .map(|r| Filter::new(r.filter.clone(), to_wire_qos(r.qos)))
            .collect();

        self.session_mut()?
            .client
            .subscribe_many(filters)
            .await
            .map_err(|e| EngineError::SendFailed(e.to_string()))?;

        self.await_outgoing("SUBSCRIBE", |o| match o {
            Outgoing::Subscribe(id) => Some(*id),
            _ => None,
        })
        .await
    }

    async fn publish(
        &mut self,
        message: &OutgoingMessage,
        dup: bool,
    ) -> Result<Option<PacketId>, EngineError> {
        if dup {
            // rumqttc assigns identifiers itself, so a resend goes out as a new publish
            debug!(topic = %message.topic, "Re-sending publish under a new identifier");
        }

        self.session_mut()?
            .client
            .publish(
                message.topic.clone(),
                to_wire_qos(message.qos),
                message.retain,
                message.payload.clone(),
            )
            .await
            .map_err(|e| EngineError::SendFailed(e.to_string()))?;

        let id = self
            .await_outgoing("PUBLISH", |o| match o {
                Outgoing::Publish(id) => Some(*id),
                _ => None,
            })
            .await?;

        Ok(match message.qos {
            QoS::AtMostOnce => None,
            _ => Some(id),
        })
    }

    async fn unsubscribe(&mut self, filters: &[String]) -> Result<PacketId, EngineError> {
        if filters.is_empty() {
            return Err(EngineError::SendFailed(
                "UNSUBSCRIBE needs at least one filter".to_string(),
            ));
        }

        // One UNSUBSCRIBE per filter; only the last acknowledgement is surfaced
        let mut ids = Vec::with_capacity(filters.len());
        for filter in filters {
            self.session_mut()?
                .client
                .unsubscribe(filter.clone())
                .await
                .map_err(|e| EngineError::SendFailed(e.to_string()))?;
            let id = self
                .await_outgoing("UNSUBSCRIBE", |o| match o {
                    Outgoing::Unsubscribe(id) => Some(*id),
                    _ => None,
                })
                .await?;
            ids.push(id);
        }

        let last = ids.pop().ok_or(EngineError::NotConnected)?;
        self.suppressed_unsubacks.extend(ids);
        Ok(last)
    }

    async fn send_disconnect(&mut self) -> Result<(), EngineError> {
        self.session_mut()?
            .client
            .disconnect()
            .await
            .map_err(|e| EngineError::SendFailed(e.to_string()))?;

        match self
            .await_outgoing("DISCONNECT", |o| match o {
                Outgoing::Disconnect => Some(0),
                _ => None,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "DISCONNECT may not have reached the broker");
                Ok(())
            }
        }
    }

    async fn pump_once(&mut self, timeout: Duration) -> Result<Vec<InboundEvent>, EngineError> {
        let mut events: Vec<InboundEvent> = self.buffered.drain(..).collect();
        if !events.is_empty() {
            return Ok(events);
        }

        let deadline = Instant::now() + timeout;
        while events.is_empty() {
            let polled = {
                let session = self.session_mut()?;
                tokio::time::timeout_at(deadline, session.eventloop.poll()).await
            };
            match polled {
                Err(_) => break,
                Ok(Err(e)) => return Err(EngineError::ReceiveFailed(e.to_string())),
                Ok(Ok(Event::Incoming(packet))) => {
                    if let Some(event) = self.accept_incoming(&packet) {
                        events.push(event);
                    }
                }
                Ok(Ok(Event::Outgoing(_))) => {}
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            client_identifier: "link-test".to_string(),
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_engine_calls_require_open_link() {
        let mut link = RumqttcLink::default();

        let handshake = link
            .handshake(&identity(), true, Duration::from_millis(10))
            .await;
        let pumped = link.pump_once(Duration::from_millis(10)).await;
        let subscribed = link
            .subscribe(&[SubscriptionRequest::new("a/b", QoS::AtLeastOnce)])
            .await;

        assert!(matches!(handshake, Err(EngineError::NotConnected)));
        assert!(matches!(pumped, Err(EngineError::NotConnected)));
        assert!(matches!(subscribed, Err(EngineError::NotConnected)));
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn test_connect_fails_on_unreadable_ca() {
        let mut link = RumqttcLink::default();
        let tls = TlsSettings {
            enabled: true,
            ca_path: Some("/nonexistent/mqtt-agent/root.pem".into()),
            alpn: vec![],
        };

        let result = link.connect(&Endpoint::new("localhost", 8883), &tls).await;

        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[tokio::test]
    async fn test_empty_unsubscribe_is_rejected() {
        let mut link = RumqttcLink::default();

        let result = link.unsubscribe(&[]).await;

        assert!(matches!(result, Err(EngineError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let mut link = RumqttcLink::default();
        assert!(Transport::disconnect(&mut link).await.is_ok());
    }
}
