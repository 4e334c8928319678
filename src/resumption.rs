//! What to do after a (re)connect
//!
//! When the broker kept the session, subscriptions survive and in-flight
//! publishes are re-sent with the DUP flag. When it did not, every registry
//! entry is replayed in one SUBSCRIBE batch and every outstanding
//! acknowledgement is failed.

use crate::dispatcher::command::{
    Command, CommandContext, CommandError, CommandOutcome, CommandPayload, SubscribeEntry,
};
use crate::dispatcher::pending::{AckKind, PendingAckTable};
use crate::observability::metrics;
use crate::registry::SubscriptionRegistry;
use crate::transport::{EngineError, ProtocolEngine};
use tracing::{debug, info, warn};

pub struct SessionResumptionController;

impl SessionResumptionController {
    /// Build the resubscribe batch, if one is needed.
    ///
    /// Returns `None` when the session is present or nothing is registered.
    /// Otherwise every entry is reset to Pending and a single subscribe
    /// command covering all of them is returned, tagged
    /// [`CommandContext::SessionResume`] so that rejected filters are dropped
    /// from the registry instead of being retried.
    pub fn after_connect(
        session_present: bool,
        registry: &mut SubscriptionRegistry,
    ) -> Option<Command> {
        if session_present {
            debug!("Broker resumed the session, subscriptions kept");
            return None;
        }
        if registry.is_empty() {
            return None;
        }

        registry.reset_all_pending();
        let entries: Vec<SubscribeEntry> = registry
            .requests()
            .into_iter()
            .map(|request| SubscribeEntry {
                request,
                handler: None,
            })
            .collect();

        info!(filters = entries.len(), "Session not resumed, resubscribing");
        metrics().resubscribe_batch();

        Some(
            Command::subscribe(entries)
                .with_context(CommandContext::SessionResume)
                .on_complete(|outcome: CommandOutcome| match outcome {
                    Ok(_) => info!("Resubscribe batch acknowledged"),
                    Err(CommandError::Rejected { codes }) => {
                        warn!(?codes, "Broker rejected part of the resubscribe batch")
                    }
                    Err(e) => warn!(error = %e, "Resubscribe batch failed"),
                }),
        )
    }

    /// Settle acknowledgements that were outstanding when the link dropped.
    ///
    /// With a resumed session, unacknowledged publishes are re-sent with DUP
    /// set and re-keyed under the identifier the engine reports; other
    /// entries can no longer complete and fail with `ConnectionLost`. Without
    /// a session everything fails with `SessionLost`. Returns how many
    /// publishes were re-sent.
    pub async fn resume_pending_acks<E>(
        session_present: bool,
        pending: &mut PendingAckTable,
        engine: &mut E,
    ) -> Result<usize, EngineError>
    where
        E: ProtocolEngine + ?Sized,
    {
        let outstanding = pending.drain();
        if outstanding.is_empty() {
            return Ok(0);
        }

        if !session_present {
            warn!(
                outstanding = outstanding.len(),
                "Session lost, failing outstanding acknowledgements"
            );
            for entry in outstanding {
                entry.command.complete(Err(CommandError::SessionLost));
            }
            return Ok(0);
        }

        let mut resent = 0;
        let mut remaining = outstanding.into_iter();
        while let Some(entry) = remaining.next() {
            let is_publish_ack = matches!(entry.ack_kind, AckKind::PubAck | AckKind::PubComp);
            let message = match &entry.command.payload {
                CommandPayload::Publish(message) if is_publish_ack => Some(message.clone()),
                _ => None,
            };
            let Some(message) = message else {
                entry.command.complete(Err(CommandError::ConnectionLost));
                continue;
            };

            match engine.publish(&message, true).await {
                Ok(packet_id) => {
                    let packet_id = packet_id.unwrap_or(entry.packet_id);
                    debug!(
                        old_id = entry.packet_id,
                        new_id = packet_id,
                        topic = %message.topic,
                        "Re-sent unacknowledged publish"
                    );
                    metrics().publish_resent();
                    resent += 1;
                    if let Err(command) = pending.insert(entry.ack_kind, packet_id, entry.command) {
                        command.complete(Err(CommandError::NoAckSlot {
                            capacity: pending.capacity(),
                        }));
                    }
                }
                Err(e) => {
                    entry.command.complete(Err(CommandError::ConnectionLost));
                    for rest in remaining {
                        rest.command.complete(Err(CommandError::ConnectionLost));
                    }
                    return Err(e);
                }
            }
        }
        Ok(resent)
    }
}
