//! Pure construction of rumqttc connection options
//!
//! Kept free of I/O apart from reading the CA file so the mapping from our
//! settings to `MqttOptions` can be tested without a broker.

use crate::transport::{Endpoint, QoS, SessionIdentity, TlsSettings, TransportError};
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use tracing::{debug, warn};

/// Largest packet we accept from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Options for one CONNECT attempt
pub fn configure_mqtt_options(
    endpoint: &Endpoint,
    identity: &SessionIdentity,
    clean_session: bool,
    transport: Option<RumqttcTransport>,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        identity.client_identifier.clone(),
        endpoint.host.clone(),
        endpoint.port,
    );

    mqtt_options.set_clean_start(clean_session);
    mqtt_options.set_keep_alive(identity.keepalive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(username) = &identity.username {
        let password = identity.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    if let Some(transport) = transport {
        mqtt_options.set_transport(transport);
    }

    mqtt_options
}

/// Build the TLS transport described by `tls`, or `None` for plain TCP
pub fn prepare_transport(tls: &TlsSettings) -> Result<Option<RumqttcTransport>, TransportError> {
    if !tls.enabled {
        return Ok(None);
    }

    let Some(ca_path) = &tls.ca_path else {
        if !tls.alpn.is_empty() {
            warn!(
                alpn = ?tls.alpn,
                "ALPN requires a CA file, falling back to system roots without ALPN"
            );
        }
        return Ok(Some(RumqttcTransport::tls_with_default_config()));
    };

    let ca = std::fs::read(ca_path).map_err(|e| {
        TransportError::Tls(format!("cannot read CA file {}: {e}", ca_path.display()))
    })?;
    if ca.is_empty() {
        return Err(TransportError::Tls(format!(
            "CA file {} is empty",
            ca_path.display()
        )));
    }

    let alpn = if tls.alpn.is_empty() {
        None
    } else {
        Some(tls.alpn.iter().map(|p| p.as_bytes().to_vec()).collect())
    };
    debug!(ca = %ca_path.display(), alpn = ?tls.alpn, "Prepared TLS transport");

    Ok(Some(RumqttcTransport::tls(ca, None, alpn)))
}

pub fn to_wire_qos(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

pub fn from_wire_qos(qos: WireQoS) -> QoS {
    match qos {
        WireQoS::AtMostOnce => QoS::AtMostOnce,
        WireQoS::AtLeastOnce => QoS::AtLeastOnce,
        WireQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}
