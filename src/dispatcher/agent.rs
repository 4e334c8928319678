//! Single-consumer command loop
//!
//! The [`Agent`] owns the connection, the subscription registry and the
//! pending-ack table. Application tasks only reach it through an
//! [`AgentHandle`]; commands are dispatched strictly in arrival order and at
//! most one command is being written to the link at any time.

use super::command::{
    Command, CommandContext, CommandError, CommandKind, CommandPayload, CommandReply,
    SubscribeEntry,
};
use super::handle::AgentHandle;
use super::pending::{AckKind, PendingAckTable};
use crate::error::AgentResult;
use crate::observability::metrics;
use crate::registry::SubscriptionRegistry;
use crate::resumption::SessionResumptionController;
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::topics::{validate_filter, validate_topic_name};
use crate::transport::{EngineError, EventPayload, InboundEvent, Link, PacketId, PacketKind};
use crate::{connect_span, dispatch_span};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

/// What happens to queued commands when the agent terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Complete each queued command with [`CommandError::Cancelled`]
    Fail,
    /// Discard queued commands without running their callbacks
    Drop,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub queue_length: usize,
    pub max_outstanding_acks: usize,
    pub registry_capacity: usize,
    /// Longest a caller waits for queue space
    pub command_block_time: Duration,
    /// Longest the loop waits for a command before servicing the link
    pub event_queue_wait: Duration,
    /// Budget for one engine pump
    pub pump_timeout: Duration,
    pub drain_policy: DrainPolicy,
    /// Clean-session flag of the initial connect. Reconnects always ask for a stored session.
    pub clean_session: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            queue_length: 10,
            max_outstanding_acks: 20,
            registry_capacity: 10,
            command_block_time: Duration::from_millis(500),
            event_queue_wait: Duration::from_millis(100),
            pump_timeout: Duration::from_millis(100),
            drain_policy: DrainPolicy::Fail,
            clean_session: true,
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Agent<L: Link> {
    supervisor: ConnectionSupervisor<L>,
    registry: SubscriptionRegistry,
    pending: PendingAckTable,
    internal: VecDeque<Command>,
    rx: mpsc::Receiver<Command>,
    settings: AgentSettings,
    session_active: bool,
}

impl<L: Link> Agent<L> {
    pub fn new(
        supervisor: ConnectionSupervisor<L>,
        settings: AgentSettings,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(settings.queue_length.max(1));
        let handle = AgentHandle::new(tx, settings.command_block_time, supervisor.watch_state());
        let agent = Self {
            registry: SubscriptionRegistry::new(settings.registry_capacity),
            pending: PendingAckTable::new(settings.max_outstanding_acks),
            internal: VecDeque::new(),
            supervisor,
            rx,
            settings,
            session_active: false,
        };
        (agent, handle)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn outstanding_acks(&self) -> usize {
        self.pending.len()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<L> {
        &self.supervisor
    }

    /// Initial connection using the configured clean-session flag
    pub async fn connect(&mut self) -> AgentResult<bool> {
        let clean_session = self.settings.clean_session;
        let span = connect_span!(clean_session, initial = true);
        let session_present = self
            .supervisor
            .connect_with_retries(clean_session)
            .instrument(span)
            .await?;
        self.on_connected(session_present).await;
        Ok(session_present)
    }

    /// Serve commands until terminated, every handle is dropped, or
    /// reconnection is exhausted (the only error).
    pub async fn run(mut self) -> AgentResult<()> {
        info!(
            queue_length = self.settings.queue_length,
            max_outstanding_acks = self.settings.max_outstanding_acks,
            "Agent command loop started"
        );

        loop {
            let next = match self.internal.pop_front() {
                Some(command) => Some(command),
                None => {
                    let wait = self.settings.event_queue_wait;
                    match tokio::time::timeout(wait, self.rx.recv()).await {
                        Ok(Some(command)) => Some(command),
                        Ok(None) => {
                            info!("All agent handles dropped, stopping");
                            self.stop().await;
                            break;
                        }
                        Err(_) => None,
                    }
                }
            };

            if let Some(command) = next {
                metrics().command_dispatched();
                let span = dispatch_span!(kind = ?command.kind(), context = ?command.context);
                if let Flow::Stop = self.dispatch(command).instrument(span).await? {
                    break;
                }
            }

            if self.session_active {
                if let Err(e) = self.pump().await {
                    self.recover(e).await?;
                }
            }
        }

        info!("Agent command loop stopped");
        Ok(())
    }

    async fn dispatch(&mut self, command: Command) -> AgentResult<Flow> {
        debug!("Dispatching command");
        match command.kind() {
            CommandKind::Terminate => {
                self.stop().await;
                command.complete(Ok(CommandReply::Terminated));
                return Ok(Flow::Stop);
            }
            CommandKind::Connect => {
                self.handle_connect(command).await;
                return Ok(Flow::Continue);
            }
            _ if !self.session_active => {
                command.complete(Err(CommandError::NotConnected));
                return Ok(Flow::Continue);
            }
            CommandKind::Disconnect => {
                self.handle_disconnect(command).await;
                return Ok(Flow::Continue);
            }
            CommandKind::Subscribe | CommandKind::Publish | CommandKind::Unsubscribe => {}
        }

        let sent = match command.kind() {
            CommandKind::Subscribe => self.send_subscribe(command).await,
            CommandKind::Unsubscribe => self.send_unsubscribe(command).await,
            _ => self.send_publish(command).await,
        };
        if let Err(e) = sent {
            self.recover(e).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_connect(&mut self, command: Command) {
        let clean_session = match &command.payload {
            CommandPayload::Connect { clean_session } => *clean_session,
            _ => self.settings.clean_session,
        };

        if let ConnectionState::Connected { session_present } = self.supervisor.state() {
            if self.session_active {
                command.complete(Ok(CommandReply::Connected { session_present }));
                return;
            }
        }

        match self.supervisor.connect_with_retries(clean_session).await {
            Ok(session_present) => {
                self.on_connected(session_present).await;
                command.complete(Ok(CommandReply::Connected { session_present }));
            }
            Err(e) => {
                warn!(error = %e, "Requested connect failed, staying disconnected");
                command.complete(Err(CommandError::Reconnect(e.to_string())));
            }
        }
    }

    async fn handle_disconnect(&mut self, command: Command) {
        for entry in self.pending.drain() {
            entry.command.complete(Err(CommandError::ConnectionLost));
        }
        if let Err(e) = self.supervisor.disconnect().await {
            warn!(error = %e, "Disconnect was not clean");
        }
        self.session_active = false;
        info!("Disconnected on request");
        command.complete(Ok(CommandReply::Disconnected));
    }

    async fn send_subscribe(&mut self, command: Command) -> Result<(), EngineError> {
        let entries = match &command.payload {
            CommandPayload::Subscribe(entries) => entries.clone(),
            _ => return Ok(()),
        };
        if entries.is_empty() {
            command.complete(Err(CommandError::Invalid(
                "subscribe without filters".to_string(),
            )));
            return Ok(());
        }
        if let Some(e) = entries
            .iter()
            .find_map(|entry| validate_filter(&entry.request.filter).err())
        {
            command.complete(Err(CommandError::Invalid(e.to_string())));
            return Ok(());
        }
        if !self.registry.has_room_for(&command.filters()) {
            command.complete(Err(CommandError::RegistryFull {
                capacity: self.registry.capacity(),
            }));
            return Ok(());
        }
        if !self.pending.has_room() {
            self.reject_no_slot(command);
            return Ok(());
        }

        let requests: Vec<_> = entries.iter().map(|entry| entry.request.clone()).collect();
        match self.supervisor.link_mut().subscribe(&requests).await {
            Ok(packet_id) => {
                for entry in entries {
                    let SubscribeEntry { request, handler } = entry;
                    if let Err(e) = self.registry.record(&request.filter, request.qos, handler) {
                        error!(
                            filter = %request.filter,
                            error = %e,
                            "Failed to record subscription"
                        );
                    }
                }
                self.track(AckKind::SubAck, packet_id, command);
                Ok(())
            }
            Err(e) => {
                command.complete(Err(CommandError::Engine(e.to_string())));
                Err(e)
            }
        }
    }

    async fn send_publish(&mut self, command: Command) -> Result<(), EngineError> {
        let message = match &command.payload {
            CommandPayload::Publish(message) => message.clone(),
            _ => return Ok(()),
        };
        if let Err(e) = validate_topic_name(&message.topic) {
            command.complete(Err(CommandError::Invalid(e.to_string())));
            return Ok(());
        }
        let ack_kind = AckKind::for_publish(message.qos);
        if ack_kind.is_some() && !self.pending.has_room() {
            self.reject_no_slot(command);
            return Ok(());
        }

        match self.supervisor.link_mut().publish(&message, false).await {
            Ok(packet_id) => {
                match (ack_kind, packet_id) {
                    (Some(kind), Some(id)) => self.track(kind, id, command),
                    _ => command.complete(Ok(CommandReply::Published { packet_id })),
                }
                Ok(())
            }
            Err(e) => {
                command.complete(Err(CommandError::Engine(e.to_string())));
                Err(e)
            }
        }
    }

    async fn send_unsubscribe(&mut self, command: Command) -> Result<(), EngineError> {
        let filters = command.filters();
        if filters.is_empty() {
            command.complete(Err(CommandError::Invalid(
                "unsubscribe without filters".to_string(),
            )));
            return Ok(());
        }
        if !self.pending.has_room() {
            self.reject_no_slot(command);
            return Ok(());
        }

        match self.supervisor.link_mut().unsubscribe(&filters).await {
            Ok(packet_id) => {
                self.track(AckKind::UnsubAck, packet_id, command);
                Ok(())
            }
            Err(e) => {
                command.complete(Err(CommandError::Engine(e.to_string())));
                Err(e)
            }
        }
    }

    fn track(&mut self, ack_kind: AckKind, packet_id: PacketId, command: Command) {
        debug!(?ack_kind, packet_id, "Awaiting acknowledgement");
        if let Err(command) = self.pending.insert(ack_kind, packet_id, command) {
            self.reject_no_slot(command);
        }
    }

    fn reject_no_slot(&self, command: Command) {
        warn!(
            kind = ?command.kind(),
            capacity = self.pending.capacity(),
            "No free acknowledgement slot"
        );
        command.complete(Err(CommandError::NoAckSlot {
            capacity: self.pending.capacity(),
        }));
    }

    async fn pump(&mut self) -> Result<(), EngineError> {
        let events = self
            .supervisor
            .link_mut()
            .pump_once(self.settings.pump_timeout)
            .await?;
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: InboundEvent) -> Result<(), EngineError> {
        match event.kind {
            PacketKind::Publish => {
                if let EventPayload::Publish(message) = &event.payload {
                    if self.registry.dispatch_incoming(message) == 0 {
                        warn!(topic = %message.topic, "Publish on a topic with no subscription");
                    }
                }
            }
            PacketKind::Disconnect => return Err(EngineError::ClosedByBroker),
            PacketKind::ConnAck | PacketKind::PingResp | PacketKind::PubRec => {
                debug!(kind = ?event.kind, packet_id = ?event.packet_id, "Engine-level packet");
            }
            PacketKind::SubAck
            | PacketKind::UnsubAck
            | PacketKind::PubAck
            | PacketKind::PubComp => match (AckKind::from_packet(event.kind), event.packet_id) {
                (Some(ack_kind), Some(packet_id)) => self.resolve_ack(ack_kind, packet_id, &event),
                _ => warn!(kind = ?event.kind, "Acknowledgement without packet identifier"),
            },
        }
        Ok(())
    }

    fn resolve_ack(&mut self, ack_kind: AckKind, packet_id: PacketId, event: &InboundEvent) {
        let Some(entry) = self.pending.take(ack_kind, packet_id) else {
            metrics().ack_unmatched();
            error!(?ack_kind, packet_id, "Acknowledgement for an unknown packet identifier");
            return;
        };
        metrics().ack_matched();

        match ack_kind {
            AckKind::SubAck => {
                let filters = entry.command.filters();
                let codes = event.suback_codes().to_vec();
                let context = entry.command.context;
                self.registry.on_suback(&filters, &codes);

                let rejected: Vec<String> = filters
                    .iter()
                    .zip(&codes)
                    .filter(|(_, code)| code.is_failure())
                    .map(|(filter, _)| filter.clone())
                    .collect();
                let outcome = if rejected.is_empty() {
                    Ok(CommandReply::Subscribed { codes })
                } else {
                    Err(CommandError::Rejected { codes })
                };
                entry.command.complete(outcome);

                for filter in rejected {
                    self.registry.remove(&filter);
                    match context {
                        CommandContext::SessionResume => {
                            warn!(
                                filter = %filter,
                                "Dropped subscription the broker refused to restore"
                            )
                        }
                        CommandContext::Caller => {
                            info!(filter = %filter, "Broker rejected subscription")
                        }
                    }
                }
            }
            AckKind::UnsubAck => {
                for filter in entry.command.filters() {
                    self.registry.remove(&filter);
                }
                entry.command.complete(Ok(CommandReply::Unsubscribed));
            }
            AckKind::PubAck | AckKind::PubComp => {
                entry.command.complete(Ok(CommandReply::Published {
                    packet_id: Some(packet_id),
                }));
            }
        }
    }

    async fn on_connected(&mut self, session_present: bool) {
        self.session_active = true;
        match SessionResumptionController::resume_pending_acks(
            session_present,
            &mut self.pending,
            self.supervisor.link_mut(),
        )
        .await
        {
            Ok(0) => {}
            Ok(resent) => info!(resent, "Re-sent unacknowledged publishes"),
            Err(e) => warn!(error = %e, "Re-sending unacknowledged publishes failed"),
        }
        let resubscribe =
            SessionResumptionController::after_connect(session_present, &mut self.registry);
        if let Some(batch) = resubscribe {
            self.internal.push_back(batch);
        }
    }

    /// Tear the link down and reconnect with a persistent session
    async fn recover(&mut self, cause: EngineError) -> AgentResult<()> {
        warn!(error = %cause, "Link failure, reconnecting");
        metrics().reconnect();
        self.supervisor.teardown().await;

        let span = connect_span!(clean_session = false, initial = false);
        match self.supervisor.connect_with_retries(false).instrument(span).await {
            Ok(session_present) => {
                self.on_connected(session_present).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Reconnection exhausted, agent stopping");
                self.session_active = false;
                self.fail_everything(CommandError::Reconnect(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Terminate: settle queued and pending commands, then disconnect
    async fn stop(&mut self) {
        self.rx.close();
        let mut queued: Vec<Command> = self.internal.drain(..).collect();
        while let Ok(command) = self.rx.try_recv() {
            queued.push(command);
        }

        match self.settings.drain_policy {
            DrainPolicy::Fail => {
                for command in queued {
                    command.complete(Err(CommandError::Cancelled));
                }
            }
            DrainPolicy::Drop => {
                if !queued.is_empty() {
                    debug!(count = queued.len(), "Dropping queued commands");
                }
            }
        }
        for entry in self.pending.drain() {
            entry.command.complete(Err(CommandError::Cancelled));
        }

        if self.session_active {
            if let Err(e) = self.supervisor.disconnect().await {
                warn!(error = %e, "Disconnect during termination failed");
            }
            self.session_active = false;
        } else {
            self.supervisor.teardown().await;
        }
    }

    fn fail_everything(&mut self, error: CommandError) {
        self.rx.close();
        for entry in self.pending.drain() {
            entry.command.complete(Err(error.clone()));
        }
        for command in self.internal.drain(..) {
            command.complete(Err(error.clone()));
        }
        while let Ok(command) = self.rx.try_recv() {
            command.complete(Err(error.clone()));
        }
    }
}
