//! Commands accepted by the agent and their outcomes

use crate::registry::PublishHandler;
use crate::transport::{OutgoingMessage, PacketId, QoS, SubackCode, SubscriptionRequest};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect,
    Subscribe,
    Publish,
    Unsubscribe,
    Disconnect,
    Terminate,
}

/// Who issued a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandContext {
    Caller,
    /// Resubscribe batch issued after a reconnect without a stored session
    SessionResume,
}

/// One filter of a subscribe command
#[derive(Clone)]
pub struct SubscribeEntry {
    pub request: SubscriptionRequest,
    pub handler: Option<PublishHandler>,
}

impl SubscribeEntry {
    pub fn new<S: Into<String>>(filter: S, qos: QoS) -> Self {
        Self {
            request: SubscriptionRequest::new(filter, qos),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: PublishHandler) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for SubscribeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeEntry")
            .field("request", &self.request)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum CommandPayload {
    Connect { clean_session: bool },
    Subscribe(Vec<SubscribeEntry>),
    Publish(OutgoingMessage),
    Unsubscribe(Vec<String>),
    Disconnect,
    Terminate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Connected { session_present: bool },
    Subscribed { codes: Vec<SubackCode> },
    Published { packet_id: Option<PacketId> },
    Unsubscribed,
    Disconnected,
    Terminated,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("Protocol engine error: {0}")]
    Engine(String),
    #[error("Broker rejected the subscription: {codes:?}")]
    Rejected { codes: Vec<SubackCode> },
    #[error("No free acknowledgement slot ({capacity} outstanding)")]
    NoAckSlot { capacity: usize },
    #[error("Subscription registry full ({capacity} slots)")]
    RegistryFull { capacity: usize },
    #[error("Invalid command: {0}")]
    Invalid(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Broker session was not resumed")]
    SessionLost,
    #[error("Connection lost before the operation was acknowledged")]
    ConnectionLost,
    #[error("Reconnection failed: {0}")]
    Reconnect(String),
    #[error("Cancelled by agent termination")]
    Cancelled,
    #[error("Agent stopped")]
    AgentStopped,
}

pub type CommandOutcome = Result<CommandReply, CommandError>;

/// Completion callback. Runs on the dispatcher task; must not block.
pub type Completion = Box<dyn FnOnce(CommandOutcome) + Send>;

pub struct Command {
    pub payload: CommandPayload,
    pub context: CommandContext,
    completion: Option<Completion>,
}

impl Command {
    pub fn new(payload: CommandPayload) -> Self {
        Self {
            payload,
            context: CommandContext::Caller,
            completion: None,
        }
    }

    pub fn connect(clean_session: bool) -> Self {
        Self::new(CommandPayload::Connect { clean_session })
    }

    pub fn subscribe(entries: Vec<SubscribeEntry>) -> Self {
        Self::new(CommandPayload::Subscribe(entries))
    }

    pub fn publish(message: OutgoingMessage) -> Self {
        Self::new(CommandPayload::Publish(message))
    }

    pub fn unsubscribe(filters: Vec<String>) -> Self {
        Self::new(CommandPayload::Unsubscribe(filters))
    }

    pub fn disconnect() -> Self {
        Self::new(CommandPayload::Disconnect)
    }

    pub fn terminate() -> Self {
        Self::new(CommandPayload::Terminate)
    }

    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(CommandOutcome) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn kind(&self) -> CommandKind {
        match self.payload {
            CommandPayload::Connect { .. } => CommandKind::Connect,
            CommandPayload::Subscribe(_) => CommandKind::Subscribe,
            CommandPayload::Publish(_) => CommandKind::Publish,
            CommandPayload::Unsubscribe(_) => CommandKind::Unsubscribe,
            CommandPayload::Disconnect => CommandKind::Disconnect,
            CommandPayload::Terminate => CommandKind::Terminate,
        }
    }

    /// Filters named by a subscribe or unsubscribe command, in request order
    pub fn filters(&self) -> Vec<String> {
        match &self.payload {
            CommandPayload::Subscribe(entries) => {
                entries.iter().map(|e| e.request.filter.clone()).collect()
            }
            CommandPayload::Unsubscribe(filters) => filters.clone(),
            _ => Vec::new(),
        }
    }

    /// Deliver the outcome. Consumes the command so it completes at most once.
    pub fn complete(mut self, outcome: CommandOutcome) {
        if let Some(completion) = self.completion.take() {
            completion(outcome);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("payload", &self.payload)
            .field("context", &self.context)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_completion_runs_once_with_outcome() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let command = Command::disconnect().on_complete(move |outcome| {
            sink.lock().unwrap().push(outcome);
        });

        command.complete(Ok(CommandReply::Disconnected));

        assert_eq!(*seen.lock().unwrap(), vec![Ok(CommandReply::Disconnected)]);
    }

    #[test]
    fn test_complete_without_callback_is_noop() {
        Command::terminate().complete(Err(CommandError::Cancelled));
    }

    #[test]
    fn test_kind_and_filters() {
        let command = Command::subscribe(vec![
            SubscribeEntry::new("a/b", QoS::AtLeastOnce),
            SubscribeEntry::new("c/#", QoS::AtMostOnce),
        ]);
        assert_eq!(command.kind(), CommandKind::Subscribe);
        assert_eq!(command.filters(), vec!["a/b".to_string(), "c/#".to_string()]);
        assert_eq!(command.context, CommandContext::Caller);

        let command = Command::unsubscribe(vec!["x".to_string()])
            .with_context(CommandContext::SessionResume);
        assert_eq!(command.kind(), CommandKind::Unsubscribe);
        assert_eq!(command.context, CommandContext::SessionResume);
    }
}
