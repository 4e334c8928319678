//! Thread-safe metrics collection
//!
//! Atomic counters for connection supervision, command dispatch and
//! acknowledgement matching, readable at any time through a serializable
//! snapshot.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Connection supervision
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    connection_start_time: AtomicU64,

    // Command queue
    commands_submitted: AtomicU64,
    commands_rejected_queue_full: AtomicU64,
    commands_dispatched: AtomicU64,

    // Acknowledgements and session resumption
    acks_matched: AtomicU64,
    acks_unmatched: AtomicU64,
    resubscribe_batches: AtomicU64,
    publishes_resent: AtomicU64,

    // Demo workload
    cycles_succeeded: AtomicU64,
    cycles_failed: AtomicU64,

    agent_state: Mutex<String>,
    uptime_start: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            commands_submitted: AtomicU64::new(0),
            commands_rejected_queue_full: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            acks_matched: AtomicU64::new(0),
            acks_unmatched: AtomicU64::new(0),
            resubscribe_batches: AtomicU64::new(0),
            publishes_resent: AtomicU64::new(0),
            cycles_succeeded: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            agent_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.set_connected(true);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.set_connected(false);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        if !connected {
            self.connection_start_time.store(0, Ordering::Relaxed);
        }
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_submitted(&self) {
        self.commands_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected_queue_full(&self) {
        self.commands_rejected_queue_full
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_matched(&self) {
        self.acks_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_unmatched(&self) {
        self.acks_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resubscribe_batch(&self) {
        self.resubscribe_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_resent(&self) {
        self.publishes_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_finished(&self, success: bool) {
        if success {
            self.cycles_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current) = self.agent_state.lock() {
            *current = state.to_string();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let agent_state = self
            .agent_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            timestamp: now,
            agent_state,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connected_seconds: if connection_start > 0 {
                    now.saturating_sub(connection_start)
                } else {
                    0
                },
            },
            commands: CommandMetrics {
                submitted: self.commands_submitted.load(Ordering::Relaxed),
                rejected_queue_full: self.commands_rejected_queue_full.load(Ordering::Relaxed),
                dispatched: self.commands_dispatched.load(Ordering::Relaxed),
                acks_matched: self.acks_matched.load(Ordering::Relaxed),
                acks_unmatched: self.acks_unmatched.load(Ordering::Relaxed),
                resubscribe_batches: self.resubscribe_batches.load(Ordering::Relaxed),
                publishes_resent: self.publishes_resent.load(Ordering::Relaxed),
            },
            cycles: CycleMetrics {
                succeeded: self.cycles_succeeded.load(Ordering::Relaxed),
                failed: self.cycles_failed.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub agent_state: String,
    pub uptime_seconds: u64,
    pub connection: ConnectionMetrics,
    pub commands: CommandMetrics,
    pub cycles: CycleMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub connected_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub submitted: u64,
    pub rejected_queue_full: u64,
    pub dispatched: u64,
    pub acks_matched: u64,
    pub acks_unmatched: u64,
    pub resubscribe_batches: u64,
    pub publishes_resent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleMetrics {
    pub succeeded: u64,
    pub failed: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
