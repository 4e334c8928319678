//! Command dispatcher
//!
//! Many application tasks, one broker connection. Tasks hold an
//! [`AgentHandle`] and submit [`Command`]s into a bounded queue; a single
//! [`Agent`] task drains the queue in order, writes one packet at a time and
//! completes each command once the broker has acknowledged it.
//!
//! - [`command`] - commands, replies and completion callbacks
//! - [`handle`] - the caller side of the queue
//! - [`pending`] - commands waiting for an acknowledgement
//! - [`agent`] - the dispatch loop, reconnection and session resumption

pub mod agent;
pub mod command;
pub mod handle;
pub mod pending;

pub use agent::{Agent, AgentSettings, DrainPolicy};
pub use command::{
    Command, CommandContext, CommandError, CommandKind, CommandOutcome, CommandPayload,
    CommandReply, Completion, SubscribeEntry,
};
pub use handle::{AgentHandle, SubmitError};
pub use pending::{AckKind, PendingAck, PendingAckTable};
