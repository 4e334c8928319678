//! Caller side of the command queue

use super::command::{Command, CommandOutcome, SubscribeEntry};
use crate::observability::metrics;
use crate::registry::PublishHandler;
use crate::supervisor::ConnectionState;
use crate::transport::{OutgoingMessage, QoS};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Command queue full")]
    QueueFull,
    #[error("Agent is no longer running")]
    AgentStopped,
}

/// Cloneable handle used by application tasks to talk to the agent
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    block_time: Duration,
    state_rx: watch::Receiver<ConnectionState>,
}

impl AgentHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<Command>,
        block_time: Duration,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            tx,
            block_time,
            state_rx,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Enqueue a command, waiting at most the configured block time for space
    pub async fn submit(&self, command: Command) -> Result<(), SubmitError> {
        match self.tx.send_timeout(command, self.block_time).await {
            Ok(()) => {
                metrics().command_submitted();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(command)) => {
                metrics().command_rejected_queue_full();
                warn!(kind = ?command.kind(), "Command queue full");
                Err(SubmitError::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(SubmitError::AgentStopped),
        }
    }

    /// Submit a command and get a receiver for its outcome
    pub async fn request(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        let (tx, rx) = oneshot::channel();
        let command = command.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.submit(command).await?;
        Ok(rx)
    }

    pub async fn connect(
        &self,
        clean_session: bool,
    ) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        self.request(Command::connect(clean_session)).await
    }

    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<PublishHandler>,
    ) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        let mut entry = SubscribeEntry::new(filter, qos);
        entry.handler = handler;
        self.request(Command::subscribe(vec![entry])).await
    }

    pub async fn publish<P: Into<Bytes>>(
        &self,
        topic: &str,
        payload: P,
        qos: QoS,
    ) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        self.request(Command::publish(OutgoingMessage::new(topic, payload, qos)))
            .await
    }

    pub async fn unsubscribe(
        &self,
        filter: &str,
    ) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        self.request(Command::unsubscribe(vec![filter.to_string()]))
            .await
    }

    pub async fn disconnect(&self) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        self.request(Command::disconnect()).await
    }

    pub async fn terminate(&self) -> Result<oneshot::Receiver<CommandOutcome>, SubmitError> {
        self.request(Command::terminate()).await
    }
}
