//! Translation of rumqttc packets into [`InboundEvent`]s
//!
//! Pure functions only; the link decides what to buffer or suppress.

use super::options::from_wire_qos;
use crate::transport::{InboundEvent, IncomingPublish, PacketKind, SubackCode};
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use tracing::trace;

/// Map an incoming packet to the event the agent understands.
///
/// Packets the agent never correlates (PUBREL, AUTH, echoed requests) yield `None`.
pub fn inbound_event(packet: &Packet) -> Option<InboundEvent> {
    let event = match packet {
        Packet::ConnAck(_) => InboundEvent::signal(PacketKind::ConnAck),
        Packet::SubAck(suback) => InboundEvent::suback(
            suback.pkid,
            suback.return_codes.iter().map(suback_code).collect(),
        ),
        Packet::UnsubAck(unsuback) => InboundEvent::ack(PacketKind::UnsubAck, unsuback.pkid),
        Packet::PubAck(puback) => InboundEvent::ack(PacketKind::PubAck, puback.pkid),
        Packet::PubRec(pubrec) => InboundEvent::ack(PacketKind::PubRec, pubrec.pkid),
        Packet::PubComp(pubcomp) => InboundEvent::ack(PacketKind::PubComp, pubcomp.pkid),
        Packet::Publish(publish) => InboundEvent::publish(IncomingPublish {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.clone(),
            qos: from_wire_qos(publish.qos),
            retain: publish.retain,
        }),
        Packet::PingResp(_) => InboundEvent::signal(PacketKind::PingResp),
        Packet::Disconnect(_) => InboundEvent::signal(PacketKind::Disconnect),
        other => {
            trace!("Ignoring inbound packet: {:?}", other);
            return None;
        }
    };
    Some(event)
}

/// Granted QoS, or failure for any reason code of 0x80 and above
pub fn suback_code(code: &SubscribeReasonCode) -> SubackCode {
    match code {
        SubscribeReasonCode::Success(qos) => SubackCode::Granted(from_wire_qos(*qos)),
        _ => SubackCode::Failure,
    }
}
