//! rumqttc-backed engine and transport
//!
//! - [`options`] - pure mapping from our settings to `MqttOptions` and TLS
//! - [`events`] - pure translation of rumqttc packets into inbound events
//! - [`link`] - the I/O side: one client and event loop per session
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_agent::supervisor::ConnectionSupervisor;
//! use mqtt_agent::transport::mqtt::RumqttcLink;
//! use mqtt_agent::config::AgentConfig;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = AgentConfig::load_from_file("agent.toml".as_ref())?;
//! let link = RumqttcLink::new(Duration::from_secs(5));
//! let mut supervisor = ConnectionSupervisor::new(link, config.supervisor_settings());
//! let session_present = supervisor.connect_with_retries(true).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod events;
pub mod link;
pub mod options;

pub use events::inbound_event;
pub use link::RumqttcLink;
pub use options::{configure_mqtt_options, prepare_transport, MAX_PACKET_SIZE};
