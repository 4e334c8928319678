//! Demo workload and its success criterion
//!
//! `mqtt-agent run` spawns several tasks that share one agent. Each cycle a
//! task subscribes to its own topic, publishes a unique payload there, waits
//! for it to come back and unsubscribes again. The run passes when the
//! configured [`RunPolicy`] accepts the number of successful cycles.

use crate::config::{ConfigError, RunSection};
use crate::dispatcher::{AgentHandle, CommandError, CommandOutcome, CommandReply, SubmitError};
use crate::observability::metrics;
use crate::registry::PublishHandler;
use crate::run_span;
use crate::transport::IncomingPublish;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// How many cycles must succeed for the run to pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    /// Every attempted cycle
    All,
    /// More than half of the attempted cycles
    #[default]
    Majority,
    /// At least this many cycles
    AtLeast(u32),
}

impl RunPolicy {
    pub fn is_success(&self, succeeded: u32, attempted: u32) -> bool {
        match self {
            RunPolicy::All => attempted > 0 && succeeded == attempted,
            RunPolicy::Majority => u64::from(succeeded) * 2 > u64::from(attempted),
            RunPolicy::AtLeast(required) => succeeded >= *required,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            RunPolicy::AtLeast(0) => Err(ConfigError::InvalidConfig(
                "success_policy at_least must be greater than 0".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Command not accepted: {0}")]
    Submit(#[from] SubmitError),
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),
    #[error("Agent dropped the command without completing it")]
    Abandoned,
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(CommandReply),
    #[error("Published message not received within {0:?}")]
    NotReceived(Duration),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleFailure {
    pub task: usize,
    pub cycle: u32,
    pub reason: String,
}

/// Tally of one demo run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempted: u32,
    pub succeeded: u32,
    pub failures: Vec<CycleFailure>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            attempted: 0,
            succeeded: 0,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, task: usize, cycle: u32, result: Result<(), CycleError>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => self.failures.push(CycleFailure {
                task,
                cycle,
                reason: e.to_string(),
            }),
        }
    }

    pub fn merge(&mut self, other: RunReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn passed(&self, policy: RunPolicy) -> bool {
        policy.is_success(self.succeeded, self.attempted)
    }
}

async fn settle(receiver: oneshot::Receiver<CommandOutcome>) -> Result<CommandReply, CycleError> {
    match receiver.await {
        Ok(outcome) => Ok(outcome?),
        Err(_) => Err(CycleError::Abandoned),
    }
}

/// Topic owned by one task of one run
pub fn task_topic(prefix: &str, run_id: Uuid, task: usize) -> String {
    format!("{}/{}/task-{}", prefix.trim_end_matches('/'), run_id.simple(), task)
}

/// Subscribe, publish, await the echo, unsubscribe
pub async fn run_cycle(
    handle: &AgentHandle,
    topic: &str,
    cycle: u32,
    settings: &RunSection,
) -> Result<(), CycleError> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(8);
    let handler: PublishHandler = Arc::new(move |message: &IncomingPublish| {
        if tx.try_send(message.payload.clone()).is_err() {
            warn!(topic = %message.topic, "Receiver lagging, message dropped");
        }
    });

    match settle(handle.subscribe(topic, settings.publish_qos, Some(handler)).await?).await? {
        CommandReply::Subscribed { .. } => {}
        other => return Err(CycleError::UnexpectedReply(other)),
    }

    let payload = Bytes::from(format!("cycle-{cycle}-{}", Uuid::new_v4()));
    let publishing = handle
        .publish(topic, payload.clone(), settings.publish_qos)
        .await?;
    let published = settle(publishing).await;

    let received = if published.is_ok() {
        let wait = Duration::from_millis(settings.receive_timeout_ms);
        let arrived = tokio::time::timeout(wait, async {
            while let Some(message) = rx.recv().await {
                if message == payload {
                    return true;
                }
            }
            false
        })
        .await;
        match arrived {
            Ok(true) => Ok(()),
            _ => Err(CycleError::NotReceived(wait)),
        }
    } else {
        Ok(())
    };

    // Always try to leave the registry as we found it
    let unsubscribed = settle(handle.unsubscribe(topic).await?).await;

    published?;
    received?;
    unsubscribed?;
    Ok(())
}

/// One task's share of the run
pub async fn run_task(
    handle: AgentHandle,
    task: usize,
    run_id: Uuid,
    settings: RunSection,
) -> RunReport {
    let topic = task_topic(&settings.topic_prefix, run_id, task);
    let mut report = RunReport::new(run_id);

    for cycle in 1..=settings.cycles {
        let span = run_span!(task, cycle, topic = %topic);
        let result = run_cycle(&handle, &topic, cycle, &settings)
            .instrument(span)
            .await;
        match &result {
            Ok(()) => info!(task, cycle, "Cycle succeeded"),
            Err(e) => warn!(task, cycle, error = %e, "Cycle failed"),
        }
        metrics().cycle_finished(result.is_ok());
        report.record(task, cycle, result);

        if cycle < settings.cycles {
            tokio::time::sleep(Duration::from_millis(settings.cycle_pause_ms)).await;
        }
    }
    report
}

/// Run every task to completion and merge their reports
pub async fn run_demo(handle: &AgentHandle, settings: &RunSection) -> RunReport {
    let run_id = Uuid::new_v4();
    info!(
        %run_id,
        tasks = settings.tasks,
        cycles = settings.cycles,
        "Starting demo run"
    );

    let workers: Vec<_> = (0..settings.tasks)
        .map(|task| tokio::spawn(run_task(handle.clone(), task, run_id, settings.clone())))
        .collect();

    let mut report = RunReport::new(run_id);
    for (task, worker) in workers.into_iter().enumerate() {
        match worker.await {
            Ok(task_report) => report.merge(task_report),
            Err(e) => {
                warn!(task, error = %e, "Demo task panicked");
                report.record(
                    task,
                    0,
                    Err(CycleError::Command(CommandError::Cancelled)),
                );
            }
        }
    }
    report.finish();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_needs_more_than_half() {
        let policy = RunPolicy::Majority;
        assert!(policy.is_success(3, 5));
        assert!(!policy.is_success(2, 4));
        assert!(!policy.is_success(0, 0));
    }

    #[test]
    fn test_all_and_at_least() {
        assert!(RunPolicy::All.is_success(4, 4));
        assert!(!RunPolicy::All.is_success(3, 4));
        assert!(!RunPolicy::All.is_success(0, 0));
        assert!(RunPolicy::AtLeast(2).is_success(2, 10));
        assert!(!RunPolicy::AtLeast(2).is_success(1, 1));
    }

    #[test]
    fn test_at_least_zero_is_invalid() {
        assert!(RunPolicy::AtLeast(0).validate().is_err());
        assert!(RunPolicy::Majority.validate().is_ok());
    }

    #[test]
    fn test_policy_serde_forms() {
        #[derive(Deserialize)]
        struct Holder {
            policy: RunPolicy,
        }

        let majority: Holder = toml::from_str("policy = \"majority\"").unwrap();
        let at_least: Holder = toml::from_str("policy = { at_least = 3 }").unwrap();

        assert_eq!(majority.policy, RunPolicy::Majority);
        assert_eq!(at_least.policy, RunPolicy::AtLeast(3));
    }

    #[test]
    fn test_report_tally() {
        let mut report = RunReport::new(Uuid::new_v4());
        report.record(0, 1, Ok(()));
        report.record(0, 2, Err(CycleError::NotReceived(Duration::from_secs(1))));
        report.record(1, 1, Ok(()));

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].cycle, 2);
        assert!(report.passed(RunPolicy::Majority));
        assert!(!report.passed(RunPolicy::All));
    }

    #[test]
    fn test_task_topics_are_distinct() {
        let run_id = Uuid::new_v4();
        let a = task_topic("demo/", run_id, 0);
        let b = task_topic("demo", run_id, 1);

        assert_ne!(a, b);
        assert!(a.starts_with("demo/"));
        assert!(!a.contains("//"));
        assert!(crate::topics::validate_topic_name(&a).is_ok());
    }
}
