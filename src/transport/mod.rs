//! Transport and protocol-engine boundary
//!
//! The agent never speaks MQTT on the wire itself. It drives two collaborators:
//!
//! - a [`Transport`] that opens and closes the network link (TCP, optionally TLS)
//! - a [`ProtocolEngine`] that performs the MQTT handshake, serializes
//!   outgoing packets and surfaces inbound packets through [`ProtocolEngine::pump_once`]
//!
//! Real engines own their socket, so the agent works against a single [`Link`]
//! object implementing both traits.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// MQTT packet identifier
pub type PacketId = u16;

/// Delivery guarantee of a subscription or publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as used on the wire (0, 1 or 2)
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// TLS parameters handed to the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    /// PEM file with the broker's root CA; system roots are used when absent
    pub ca_path: Option<PathBuf>,
    /// ALPN protocol names offered during the TLS handshake
    pub alpn: Vec<String>,
}

/// Identity presented in the CONNECT packet
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub client_identifier: String,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("client_identifier", &self.client_identifier)
            .field("keepalive", &self.keepalive)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Kind of an inbound packet reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    ConnAck,
    SubAck,
    UnsubAck,
    PubAck,
    PubRec,
    PubComp,
    Publish,
    PingResp,
    Disconnect,
}

/// Per-filter result carried by a SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubackCode {
    Granted(QoS),
    Failure,
}

impl SubackCode {
    pub fn is_failure(&self) -> bool {
        matches!(self, SubackCode::Failure)
    }
}

/// Application message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    SubackCodes(Vec<SubackCode>),
    Publish(IncomingPublish),
}

/// One inbound packet surfaced by [`ProtocolEngine::pump_once`]
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub kind: PacketKind,
    pub packet_id: Option<PacketId>,
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn suback(packet_id: PacketId, codes: Vec<SubackCode>) -> Self {
        Self {
            kind: PacketKind::SubAck,
            packet_id: Some(packet_id),
            payload: EventPayload::SubackCodes(codes),
        }
    }

    /// PUBACK, PUBREC, PUBCOMP or UNSUBACK
    pub fn ack(kind: PacketKind, packet_id: PacketId) -> Self {
        Self {
            kind,
            packet_id: Some(packet_id),
            payload: EventPayload::None,
        }
    }

    pub fn publish(message: IncomingPublish) -> Self {
        Self {
            kind: PacketKind::Publish,
            packet_id: None,
            payload: EventPayload::Publish(message),
        }
    }

    pub fn signal(kind: PacketKind) -> Self {
        Self {
            kind,
            packet_id: None,
            payload: EventPayload::None,
        }
    }

    pub fn suback_codes(&self) -> &[SubackCode] {
        match &self.payload {
            EventPayload::SubackCodes(codes) => codes,
            _ => &[],
        }
    }
}

/// Application message to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl OutgoingMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }
}

/// One topic filter inside a SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
}

impl SubscriptionRequest {
    pub fn new<S: Into<String>>(filter: S, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// Network link failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to resolve {endpoint}")]
    Resolve {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Transport I/O error")]
    Io(#[from] std::io::Error),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Protocol engine failures
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("CONNACK not received within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Broker refused the connection: {0}")]
    Refused(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Connection closed by broker")]
    ClosedByBroker,
}

/// Opens and closes the network link
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, endpoint: &Endpoint, tls: &TlsSettings)
        -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// MQTT session operations on an open link
#[async_trait]
pub trait ProtocolEngine: Send {
    /// Send CONNECT and wait for CONNACK; returns the broker's session-present flag
    async fn handshake(
        &mut self,
        identity: &SessionIdentity,
        clean_session: bool,
        connack_timeout: Duration,
    ) -> Result<bool, EngineError>;

    /// Send one SUBSCRIBE covering every request, in order
    async fn subscribe(&mut self, requests: &[SubscriptionRequest])
        -> Result<PacketId, EngineError>;

    /// Send a PUBLISH. QoS 0 publishes carry no identifier.
    async fn publish(
        &mut self,
        message: &OutgoingMessage,
        dup: bool,
    ) -> Result<Option<PacketId>, EngineError>;

    async fn unsubscribe(&mut self, filters: &[String]) -> Result<PacketId, EngineError>;

    /// Send DISCONNECT
    async fn send_disconnect(&mut self) -> Result<(), EngineError>;

    /// Process I/O for at most `timeout` and return every inbound packet
    /// received meanwhile. Keep-alive traffic is handled here as well.
    async fn pump_once(&mut self, timeout: Duration) -> Result<Vec<InboundEvent>, EngineError>;
}

/// Transport and engine in one object
pub trait Link: Transport + ProtocolEngine {}

impl<T: Transport + ProtocolEngine> Link for T {}
