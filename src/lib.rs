//! MQTT Agent - resilient pub/sub over one broker connection
//!
//! Many application tasks publish, subscribe and unsubscribe through a single
//! MQTT connection that may drop at any time. This crate is the resilience and
//! serialization layer around the protocol engine:
//!
//! - a connection supervisor with bounded, jittered exponential backoff
//! - a single-consumer command dispatcher that serializes concurrent requests
//! - a subscription registry that replays subscriptions when the broker did
//!   not keep the session
//! - a packet waiter and direct client for single-task programs
//!
//! The engine itself sits behind the [`transport::Transport`] and
//! [`transport::ProtocolEngine`] traits; [`transport::mqtt::RumqttcLink`]
//! implements both on top of rumqttc.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_agent::config::AgentConfig;
//! use mqtt_agent::dispatcher::{Agent, CommandReply};
//! use mqtt_agent::supervisor::ConnectionSupervisor;
//! use mqtt_agent::transport::mqtt::RumqttcLink;
//! use mqtt_agent::transport::QoS;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = AgentConfig::load_from_file("agent.toml".as_ref())?;
//! let supervisor = ConnectionSupervisor::new(
//!     RumqttcLink::new(Duration::from_secs(5)),
//!     config.supervisor_settings(),
//! );
//! let (mut agent, handle) = Agent::new(supervisor, config.agent_settings());
//! agent.connect().await?;
//! tokio::spawn(agent.run());
//!
//! let reply = handle.publish("devices/42/state", "online", QoS::AtLeastOnce).await?.await?;
//! assert!(matches!(reply, Ok(CommandReply::Published { .. })));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod backoff;
pub mod config;
pub mod direct;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod registry;
pub mod resumption;
pub mod run;
pub mod supervisor;
pub mod testing;
pub mod topics;
pub mod transport;
pub mod waiter;

pub use backoff::{BackoffError, BackoffPolicy, BackoffState};
pub use config::{AgentConfig, ConfigError};
pub use direct::{DirectClient, DirectSettings};
pub use dispatcher::{Agent, AgentHandle, AgentSettings, Command, CommandError, CommandReply};
pub use error::{AgentError, AgentResult};
pub use registry::SubscriptionRegistry;
pub use resumption::SessionResumptionController;
pub use run::RunPolicy;
pub use supervisor::{ConnectError, ConnectionState, ConnectionSupervisor};
pub use transport::mqtt::RumqttcLink;
pub use transport::{Link, ProtocolEngine, QoS, Transport};
pub use waiter::{PacketCorrelation, PacketWaiter, WaitError};
