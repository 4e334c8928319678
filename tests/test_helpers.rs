//! Test helpers and utilities for integration tests

use mqtt_agent::dispatcher::{Agent, AgentHandle, AgentSettings, DrainPolicy};
use mqtt_agent::supervisor::ConnectionSupervisor;
use mqtt_agent::testing::mocks::{mock_supervisor_settings, LinkCall, MockLink, ZeroJitter};
use std::time::Duration;

/// Small queues and short waits so paused-clock tests stay quick
#[allow(dead_code)]
pub fn test_settings() -> AgentSettings {
    AgentSettings {
        queue_length: 4,
        max_outstanding_acks: 4,
        registry_capacity: 4,
        command_block_time: Duration::from_millis(50),
        event_queue_wait: Duration::from_millis(10),
        pump_timeout: Duration::from_millis(10),
        drain_policy: DrainPolicy::Fail,
        clean_session: true,
    }
}

/// Supervisor over a mock link with deterministic (zero) jitter
#[allow(dead_code)]
pub fn mock_supervisor(link: MockLink, max_attempts: u32) -> ConnectionSupervisor<MockLink> {
    ConnectionSupervisor::with_jitter(
        link,
        mock_supervisor_settings(max_attempts),
        Box::new(ZeroJitter),
    )
}

/// Agent that already holds a broker session, not yet running
#[allow(dead_code)]
pub async fn connected_agent(
    link: MockLink,
    settings: AgentSettings,
) -> (Agent<MockLink>, AgentHandle) {
    let (mut agent, handle) = Agent::new(mock_supervisor(link, 5), settings);
    agent.connect().await.expect("mock connect should succeed");
    (agent, handle)
}

/// Poll the recorded calls until `predicate` holds
#[allow(dead_code)]
pub async fn wait_for_calls<F>(link: &MockLink, mut predicate: F) -> Vec<LinkCall>
where
    F: FnMut(&[LinkCall]) -> bool,
{
    for _ in 0..500 {
        let calls = link.calls().await;
        if predicate(&calls) {
            return calls;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition never reached, calls: {:?}", link.calls().await);
}

#[allow(dead_code)]
pub fn handshakes(calls: &[LinkCall]) -> Vec<bool> {
    calls
        .iter()
        .filter_map(|call| match call {
            LinkCall::Handshake { clean_session } => Some(*clean_session),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn subscribed_filters(calls: &[LinkCall]) -> Vec<Vec<String>> {
    calls
        .iter()
        .filter_map(|call| match call {
            LinkCall::Subscribe { filters, .. } => Some(filters.clone()),
            _ => None,
        })
        .collect()
}
