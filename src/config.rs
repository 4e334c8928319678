//! TOML configuration
//!
//! Every option has a serde default except the broker address and the client
//! identifier. Credentials are named by environment variable and resolved
//! when the link is built, never stored in the file.

use crate::backoff::BackoffPolicy;
use crate::direct::DirectSettings;
use crate::dispatcher::{AgentSettings, DrainPolicy};
use crate::run::RunPolicy;
use crate::supervisor::SupervisorSettings;
use crate::transport::{Endpoint, QoS, SessionIdentity, TlsSettings};
use crate::waiter::PacketWaiter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// ALPN protocol that lets MQTT share port 443 with HTTPS on AWS IoT
pub const AWS_IOT_ALPN: &str = "x-amzn-mqtt-ca";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub waiter: WaiterSection,
    #[serde(default)]
    pub run: RunSection,
}

/// Broker address and session identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub broker_endpoint: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Client identifier (must match [a-zA-Z0-9._-]+)
    pub client_identifier: String,
    /// Keep-alive in seconds, 0 disables it
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,
    /// Clean-session flag of the initial connect
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub tls: TlsSection,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    /// PEM root CA; system roots when absent
    pub ca_path: Option<PathBuf>,
    /// ALPN names; defaults to `x-amzn-mqtt-ca` on port 443
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// Command dispatcher sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,
    #[serde(default = "default_max_outstanding_acks")]
    pub max_outstanding_acks: usize,
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
    #[serde(default = "default_command_block_time_ms")]
    pub command_block_time_ms: u64,
    #[serde(default = "default_event_queue_wait_ms")]
    pub event_queue_wait_ms: u64,
    #[serde(default = "default_pump_timeout_ms")]
    pub pump_timeout_ms: u64,
    #[serde(default = "default_drain_policy")]
    pub drain_policy: DrainPolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            queue_length: default_queue_length(),
            max_outstanding_acks: default_max_outstanding_acks(),
            registry_capacity: default_registry_capacity(),
            command_block_time_ms: default_command_block_time_ms(),
            event_queue_wait_ms: default_event_queue_wait_ms(),
            pump_timeout_ms: default_pump_timeout_ms(),
            drain_policy: default_drain_policy(),
        }
    }
}

/// Connection retry schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_connect_ack_timeout_ms")]
    pub connect_ack_timeout_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            connect_ack_timeout_ms: default_connect_ack_timeout_ms(),
        }
    }
}

/// Packet waiter budget and direct-client retry schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaiterSection {
    #[serde(default = "default_per_poll_timeout_ms")]
    pub per_poll_timeout_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_subscribe_retry_attempts")]
    pub subscribe_retry_attempts: u32,
    #[serde(default = "default_subscribe_base_backoff_ms")]
    pub subscribe_base_backoff_ms: u64,
    #[serde(default = "default_subscribe_max_backoff_ms")]
    pub subscribe_max_backoff_ms: u64,
    #[serde(default = "default_outgoing_publish_capacity")]
    pub outgoing_publish_capacity: usize,
}

impl Default for WaiterSection {
    fn default() -> Self {
        Self {
            per_poll_timeout_ms: default_per_poll_timeout_ms(),
            max_polls: default_max_polls(),
            subscribe_retry_attempts: default_subscribe_retry_attempts(),
            subscribe_base_backoff_ms: default_subscribe_base_backoff_ms(),
            subscribe_max_backoff_ms: default_subscribe_max_backoff_ms(),
            outgoing_publish_capacity: default_outgoing_publish_capacity(),
        }
    }
}

/// Demo workload driven by `mqtt-agent run`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSection {
    #[serde(default = "default_tasks")]
    pub tasks: usize,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_publish_qos")]
    pub publish_qos: QoS,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_cycle_pause_ms")]
    pub cycle_pause_ms: u64,
    #[serde(default)]
    pub success_policy: RunPolicy,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            cycles: default_cycles(),
            topic_prefix: default_topic_prefix(),
            publish_qos: default_publish_qos(),
            receive_timeout_ms: default_receive_timeout_ms(),
            cycle_pause_ms: default_cycle_pause_ms(),
            success_policy: RunPolicy::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive_seconds() -> u64 {
    60
}

fn default_queue_length() -> usize {
    10
}

fn default_max_outstanding_acks() -> usize {
    20
}

fn default_registry_capacity() -> usize {
    10
}

fn default_command_block_time_ms() -> u64 {
    500
}

fn default_event_queue_wait_ms() -> u64 {
    100
}

fn default_pump_timeout_ms() -> u64 {
    100
}

fn default_drain_policy() -> DrainPolicy {
    DrainPolicy::Fail
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_connect_ack_timeout_ms() -> u64 {
    1000
}

fn default_per_poll_timeout_ms() -> u64 {
    500
}

fn default_max_polls() -> u32 {
    30
}

fn default_subscribe_retry_attempts() -> u32 {
    4
}

fn default_subscribe_base_backoff_ms() -> u64 {
    500
}

fn default_subscribe_max_backoff_ms() -> u64 {
    2500
}

fn default_outgoing_publish_capacity() -> usize {
    1
}

fn default_tasks() -> usize {
    3
}

fn default_cycles() -> u32 {
    5
}

fn default_topic_prefix() -> String {
    "mqtt-agent/demo".to_string()
}

fn default_publish_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_receive_timeout_ms() -> u64 {
    5000
}

fn default_cycle_pause_ms() -> u64 {
    1000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client identifier: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.broker.client_identifier)?;

        if self.broker.broker_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_endpoint must not be empty".to_string(),
            ));
        }
        if self.broker.keepalive_seconds != 0 && self.broker.keepalive_seconds < 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "keepalive_seconds must be 0 or at least 5, got {}",
                self.broker.keepalive_seconds
            )));
        }
        if self.agent.queue_length == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue_length must be greater than 0".to_string(),
            ));
        }
        if self.agent.registry_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "registry_capacity must be greater than 0".to_string(),
            ));
        }
        if self.agent.max_outstanding_acks == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_outstanding_acks must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_retry_attempts must be greater than 0".to_string(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.waiter.max_polls == 0 || self.waiter.per_poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_polls and per_poll_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.waiter.subscribe_base_backoff_ms > self.waiter.subscribe_max_backoff_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "subscribe_base_backoff_ms ({}) exceeds subscribe_max_backoff_ms ({})",
                self.waiter.subscribe_base_backoff_ms, self.waiter.subscribe_max_backoff_ms
            )));
        }
        if self.waiter.outgoing_publish_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "outgoing_publish_capacity must be greater than 0".to_string(),
            ));
        }
        self.run.success_policy.validate()?;

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.broker.broker_endpoint.clone(), self.broker.broker_port)
    }

    pub fn tls_settings(&self) -> TlsSettings {
        let tls = &self.broker.tls;
        let alpn = if tls.alpn.is_empty() && tls.enabled && self.broker.broker_port == 443 {
            vec![AWS_IOT_ALPN.to_string()]
        } else {
            tls.alpn.clone()
        };
        TlsSettings {
            enabled: tls.enabled,
            ca_path: tls.ca_path.clone(),
            alpn,
        }
    }

    /// Identity for the CONNECT packet, credentials read from the environment now
    pub fn session_identity(&self) -> SessionIdentity {
        SessionIdentity {
            client_identifier: self.broker.client_identifier.clone(),
            keepalive: Duration::from_secs(self.broker.keepalive_seconds),
            username: self.get_mqtt_username(),
            password: self.get_mqtt_password(),
        }
    }

    pub fn connect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry.base_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
            self.retry.max_retry_attempts,
        )
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            endpoint: self.endpoint(),
            tls: self.tls_settings(),
            identity: self.session_identity(),
            backoff: self.connect_backoff(),
            connack_timeout: Duration::from_millis(self.retry.connect_ack_timeout_ms),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            queue_length: self.agent.queue_length,
            max_outstanding_acks: self.agent.max_outstanding_acks,
            registry_capacity: self.agent.registry_capacity,
            command_block_time: Duration::from_millis(self.agent.command_block_time_ms),
            event_queue_wait: Duration::from_millis(self.agent.event_queue_wait_ms),
            pump_timeout: Duration::from_millis(self.agent.pump_timeout_ms),
            drain_policy: self.agent.drain_policy,
            clean_session: self.broker.clean_session,
        }
    }

    pub fn packet_waiter(&self) -> PacketWaiter {
        PacketWaiter::new(
            Duration::from_millis(self.waiter.per_poll_timeout_ms),
            self.waiter.max_polls,
        )
    }

    pub fn direct_settings(&self) -> DirectSettings {
        DirectSettings {
            clean_session: self.broker.clean_session,
            subscribe_backoff: BackoffPolicy::new(
                Duration::from_millis(self.waiter.subscribe_base_backoff_ms),
                Duration::from_millis(self.waiter.subscribe_max_backoff_ms),
                self.waiter.subscribe_retry_attempts,
            ),
            outgoing_capacity: self.waiter.outgoing_publish_capacity,
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
broker_endpoint = "localhost"
client_identifier = "test-client"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client identifier '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::test_config();

        assert_eq!(config.broker.broker_port, 1883);
        assert_eq!(config.broker.keepalive_seconds, 60);
        assert!(config.broker.clean_session);
        assert_eq!(config.agent.queue_length, 10);
        assert_eq!(config.agent.registry_capacity, 10);
        assert_eq!(config.retry.max_retry_attempts, 5);
        assert_eq!(config.retry.base_backoff_ms, 500);
        assert_eq!(config.retry.max_backoff_ms, 5000);
        assert_eq!(config.retry.connect_ack_timeout_ms, 1000);
        assert_eq!(config.waiter.per_poll_timeout_ms, 500);
        assert_eq!(config.waiter.max_polls, 30);
        assert_eq!(config.run.success_policy, RunPolicy::Majority);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
broker_endpoint = "a1b2c3-ats.iot.us-east-1.amazonaws.com"
broker_port = 443
client_identifier = "thing-01"
keepalive_seconds = 30
clean_session = false
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[broker.tls]
enabled = true
ca_path = "/etc/ssl/AmazonRootCA1.pem"

[agent]
queue_length = 4
drain_policy = "drop"

[retry]
max_retry_attempts = 3
base_backoff_ms = 100
max_backoff_ms = 800

[run]
tasks = 2
cycles = 10
success_policy = { at_least = 7 }
"#;

        let config = AgentConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.broker.broker_port, 443);
        assert!(!config.broker.clean_session);
        assert_eq!(config.agent.queue_length, 4);
        assert_eq!(config.agent.drain_policy, DrainPolicy::Drop);
        assert_eq!(config.run.success_policy, RunPolicy::AtLeast(7));

        let tls = config.tls_settings();
        assert!(tls.enabled);
        assert_eq!(tls.alpn, vec![AWS_IOT_ALPN.to_string()]);

        let backoff = config.connect_backoff();
        assert_eq!(backoff.max_attempts, 3);
        assert_eq!(backoff.max_delay, Duration::from_millis(800));
    }

    #[test]
    fn test_alpn_only_defaulted_on_443() {
        let mut config = AgentConfig::test_config();
        config.broker.tls.enabled = true;
        config.broker.broker_port = 8883;

        assert!(config.tls_settings().alpn.is_empty());
    }

    #[test]
    fn test_settings_conversion() {
        let config = AgentConfig::test_config();

        let agent = config.agent_settings();
        assert_eq!(agent.queue_length, 10);
        assert_eq!(agent.max_outstanding_acks, 20);
        assert_eq!(agent.event_queue_wait, Duration::from_millis(100));
        assert!(agent.clean_session);

        let supervisor = config.supervisor_settings();
        assert_eq!(supervisor.endpoint, Endpoint::new("localhost", 1883));
        assert_eq!(supervisor.connack_timeout, Duration::from_millis(1000));
        assert_eq!(supervisor.identity.keepalive, Duration::from_secs(60));

        let direct = config.direct_settings();
        assert_eq!(direct.outgoing_capacity, 1);
        assert_eq!(direct.subscribe_backoff.max_attempts, 4);
        assert_eq!(direct.subscribe_backoff.max_delay, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("invalid@client").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("valid-client_123.test").is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<fn(&mut AgentConfig)> = vec![
            |c| c.agent.queue_length = 0,
            |c| c.agent.registry_capacity = 0,
            |c| c.agent.max_outstanding_acks = 0,
            |c| c.retry.max_retry_attempts = 0,
            |c| c.retry.base_backoff_ms = 10_000,
            |c| c.broker.keepalive_seconds = 2,
            |c| c.broker.broker_endpoint = " ".to_string(),
            |c| c.waiter.max_polls = 0,
            |c| c.waiter.outgoing_publish_capacity = 0,
            |c| c.run.success_policy = RunPolicy::AtLeast(0),
        ];

        for (index, mutate) in cases.into_iter().enumerate() {
            let mut config = AgentConfig::test_config();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidConfig(_))),
                "case {index} should be rejected"
            );
        }
    }

    #[test]
    fn test_missing_broker_section_fails_to_parse() {
        let result = AgentConfig::from_toml_str("[agent]\nqueue_length = 3\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_credentials_resolved_from_env() {
        let mut config = AgentConfig::test_config();
        config.broker.username_env = Some("MQTT_AGENT_TEST_USER_7F3A".to_string());
        config.broker.password_env = Some("MQTT_AGENT_TEST_MISSING_7F3A".to_string());
        std::env::set_var("MQTT_AGENT_TEST_USER_7F3A", "device");

        let identity = config.session_identity();

        assert_eq!(identity.username.as_deref(), Some("device"));
        assert_eq!(identity.password, None);
        std::env::remove_var("MQTT_AGENT_TEST_USER_7F3A");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = AgentConfig::test_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = AgentConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
