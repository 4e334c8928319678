//! Commands waiting for a broker acknowledgement

use super::command::Command;
use crate::transport::{PacketId, PacketKind, QoS};

/// Acknowledgement that completes a pending command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    PubComp,
    SubAck,
    UnsubAck,
}

impl AckKind {
    /// Ack that completes a publish of the given QoS, if any
    pub fn for_publish(qos: QoS) -> Option<Self> {
        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(AckKind::PubAck),
            QoS::ExactlyOnce => Some(AckKind::PubComp),
        }
    }

    pub fn from_packet(kind: PacketKind) -> Option<Self> {
        match kind {
            PacketKind::PubAck => Some(AckKind::PubAck),
            PacketKind::PubComp => Some(AckKind::PubComp),
            PacketKind::SubAck => Some(AckKind::SubAck),
            PacketKind::UnsubAck => Some(AckKind::UnsubAck),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct PendingAck {
    pub ack_kind: AckKind,
    pub packet_id: PacketId,
    pub command: Command,
}

/// Bounded, insertion-ordered table of [`PendingAck`]s
#[derive(Debug)]
pub struct PendingAckTable {
    entries: Vec<PendingAck>,
    capacity: usize,
}

impl PendingAckTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Track a command; hands it back when the table is full
    pub fn insert(
        &mut self,
        ack_kind: AckKind,
        packet_id: PacketId,
        command: Command,
    ) -> Result<(), Command> {
        if !self.has_room() {
            return Err(command);
        }
        self.entries.push(PendingAck {
            ack_kind,
            packet_id,
            command,
        });
        Ok(())
    }

    /// Remove the oldest entry waiting for this ack
    pub fn take(&mut self, ack_kind: AckKind, packet_id: PacketId) -> Option<PendingAck> {
        let index = self
            .entries
            .iter()
            .position(|e| e.ack_kind == ack_kind && e.packet_id == packet_id)?;
        Some(self.entries.remove(index))
    }

    /// Empty the table, oldest first
    pub fn drain(&mut self) -> Vec<PendingAck> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::command::{CommandOutcome, CommandReply};
    use crate::transport::{OutgoingMessage, QoS};
    use std::sync::{Arc, Mutex};

    fn tagged_publish(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Command {
        Command::publish(OutgoingMessage::new("t", "p", QoS::AtLeastOnce)).on_complete(
            move |_outcome: CommandOutcome| {
                log.lock().unwrap().push(tag);
            },
        )
    }

    #[test]
    fn test_take_matches_kind_and_id_oldest_first() {
        // Arrange
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = PendingAckTable::new(4);
        table.insert(AckKind::PubAck, 1, tagged_publish("first", log.clone())).unwrap();
        table.insert(AckKind::SubAck, 1, tagged_publish("suback", log.clone())).unwrap();
        table.insert(AckKind::PubAck, 1, tagged_publish("second", log.clone())).unwrap();

        // Act
        let entry = table.take(AckKind::PubAck, 1).unwrap();
        entry.command.complete(Ok(CommandReply::Published { packet_id: Some(1) }));

        // Assert
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert_eq!(table.len(), 2);
        assert!(table.take(AckKind::PubAck, 9).is_none());
    }

    #[test]
    fn test_insert_rejects_when_full() {
        let mut table = PendingAckTable::new(1);
        table.insert(AckKind::UnsubAck, 5, Command::disconnect()).unwrap();

        let rejected = table.insert(AckKind::UnsubAck, 6, Command::disconnect());

        assert!(rejected.is_err());
        assert!(!table.has_room());
    }

    #[test]
    fn test_ack_kind_mapping() {
        assert_eq!(AckKind::for_publish(QoS::AtMostOnce), None);
        assert_eq!(AckKind::for_publish(QoS::AtLeastOnce), Some(AckKind::PubAck));
        assert_eq!(AckKind::for_publish(QoS::ExactlyOnce), Some(AckKind::PubComp));
        assert_eq!(AckKind::from_packet(PacketKind::PubRec), None);
        assert_eq!(AckKind::from_packet(PacketKind::SubAck), Some(AckKind::SubAck));
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut table = PendingAckTable::new(3);
        table.insert(AckKind::PubAck, 3, Command::disconnect()).unwrap();
        table.insert(AckKind::PubAck, 1, Command::disconnect()).unwrap();

        let ids: Vec<PacketId> = table.drain().into_iter().map(|e| e.packet_id).collect();

        assert_eq!(ids, vec![3, 1]);
        assert!(table.is_empty());
    }
}
