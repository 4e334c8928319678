//! Command dispatcher behavior
//!
//! Commands from many tasks are serialized through one agent:
//! - FIFO dispatch and ack correlation
//! - Queue, registry and ack-table limits
//! - Disconnect and terminate semantics

mod test_helpers;

use mqtt_agent::dispatcher::{CommandError, CommandReply, DrainPolicy, SubmitError};
use mqtt_agent::registry::PublishHandler;
use mqtt_agent::testing::mocks::{LinkCall, MockLink};
use mqtt_agent::transport::{InboundEvent, IncomingPublish, PacketKind, QoS, SubackCode};
use std::sync::Arc;
use test_helpers::{connected_agent, test_settings, wait_for_calls};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_completes_on_puback() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    let agent_task = tokio::spawn(agent.run());

    let reply = handle
        .publish("devices/1/state", "on", QoS::AtLeastOnce)
        .await
        .unwrap()
        .await
        .unwrap();

    let published_id = link.calls().await.iter().find_map(|call| match call {
        LinkCall::Publish { packet_id, .. } => *packet_id,
        _ => None,
    });
    assert!(published_id.is_some());
    assert_eq!(reply, Ok(CommandReply::Published { packet_id: published_id }));

    drop(handle);
    agent_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_qos0_publish_completes_without_ack() {
    let link = MockLink::new();
    link.set_auto_ack(false).await;
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    tokio::spawn(agent.run());

    let reply = handle
        .publish("devices/1/state", "on", QoS::AtMostOnce)
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(reply, Ok(CommandReply::Published { packet_id: None }));
}

#[tokio::test(start_paused = true)]
async fn test_commands_reach_the_link_in_submission_order() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;

    // Queue everything before the loop starts
    let subscribed = handle.subscribe("orders/#", QoS::AtLeastOnce, None).await.unwrap();
    let published = handle
        .publish("orders/42", "created", QoS::AtLeastOnce)
        .await
        .unwrap();
    let unsubscribed = handle.unsubscribe("orders/#").await.unwrap();
    tokio::spawn(agent.run());

    assert!(matches!(
        subscribed.await.unwrap(),
        Ok(CommandReply::Subscribed { .. })
    ));
    assert!(matches!(
        published.await.unwrap(),
        Ok(CommandReply::Published { packet_id: Some(_) })
    ));
    assert_eq!(unsubscribed.await.unwrap(), Ok(CommandReply::Unsubscribed));

    let order: Vec<&str> = link
        .calls()
        .await
        .iter()
        .filter_map(|call| match call {
            LinkCall::Subscribe { .. } => Some("subscribe"),
            LinkCall::Publish { .. } => Some("publish"),
            LinkCall::Unsubscribe { .. } => Some("unsubscribe"),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["subscribe", "publish", "unsubscribe"]);
}

#[tokio::test(start_paused = true)]
async fn test_submit_fails_when_queue_stays_full() {
    let mut settings = test_settings();
    settings.queue_length = 2;
    let (_agent, handle) = connected_agent(MockLink::new(), settings).await;

    // Agent loop not running, nothing drains the queue
    handle.publish("a", "1", QoS::AtMostOnce).await.unwrap();
    handle.publish("a", "2", QoS::AtMostOnce).await.unwrap();
    let third = handle.publish("a", "3", QoS::AtMostOnce).await;

    assert_eq!(third.err(), Some(SubmitError::QueueFull));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_rejected_when_registry_full() {
    let mut settings = test_settings();
    settings.registry_capacity = 1;
    let (agent, handle) = connected_agent(MockLink::new(), settings).await;
    tokio::spawn(agent.run());

    let first = handle.subscribe("a/1", QoS::AtLeastOnce, None).await.unwrap();
    assert!(first.await.unwrap().is_ok());

    let second = handle.subscribe("a/2", QoS::AtLeastOnce, None).await.unwrap();
    assert_eq!(
        second.await.unwrap(),
        Err(CommandError::RegistryFull { capacity: 1 })
    );

    // Re-subscribing a known filter needs no new slot
    let again = handle.subscribe("a/1", QoS::AtMostOnce, None).await.unwrap();
    assert!(again.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_no_ack_slot_when_table_full() {
    let link = MockLink::new();
    link.set_auto_ack(false).await;
    let mut settings = test_settings();
    settings.max_outstanding_acks = 1;
    let (agent, handle) = connected_agent(link, settings).await;
    let agent_task = tokio::spawn(agent.run());

    let waiting = handle.publish("a", "1", QoS::AtLeastOnce).await.unwrap();
    let refused = handle.publish("a", "2", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(
        refused.await.unwrap(),
        Err(CommandError::NoAckSlot { capacity: 1 })
    );

    // QoS 0 needs no slot
    let fire_and_forget = handle.publish("a", "3", QoS::AtMostOnce).await.unwrap();
    assert!(fire_and_forget.await.unwrap().is_ok());

    let terminated = handle.terminate().await.unwrap();
    assert_eq!(terminated.await.unwrap(), Ok(CommandReply::Terminated));
    assert_eq!(waiting.await.unwrap(), Err(CommandError::Cancelled));
    agent_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_ack_is_ignored() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    link.push_inbound(InboundEvent::ack(PacketKind::PubAck, 999)).await;
    link.push_inbound(InboundEvent::ack(PacketKind::UnsubAck, 998)).await;
    tokio::spawn(agent.run());

    let reply = handle
        .publish("a/b", "still works", QoS::AtLeastOnce)
        .await
        .unwrap()
        .await
        .unwrap();

    assert!(matches!(reply, Ok(CommandReply::Published { packet_id: Some(_) })));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_publish_reaches_matching_handler() {
    let link = MockLink::new();
    link.set_echo_publishes(true).await;
    let (agent, handle) = connected_agent(link, test_settings()).await;
    tokio::spawn(agent.run());

    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingPublish>();
    let handler: PublishHandler = Arc::new(move |message: &IncomingPublish| {
        let _ = tx.send(message.clone());
    });

    let subscribed = handle
        .subscribe("sensors/+/temp", QoS::AtLeastOnce, Some(handler))
        .await
        .unwrap();
    assert!(subscribed.await.unwrap().is_ok());

    handle
        .publish("sensors/kitchen/temp", "21.5", QoS::AtLeastOnce)
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    let message = rx.recv().await.unwrap();
    assert_eq!(message.topic, "sensors/kitchen/temp");
    assert_eq!(&message.payload[..], b"21.5");
}

#[tokio::test(start_paused = true)]
async fn test_broker_rejection_frees_registry_slot() {
    let link = MockLink::new();
    link.script_suback(vec![SubackCode::Failure]).await;
    let mut settings = test_settings();
    settings.registry_capacity = 1;
    let (agent, handle) = connected_agent(link, settings).await;
    tokio::spawn(agent.run());

    let rejected = handle.subscribe("forbidden/#", QoS::AtLeastOnce, None).await.unwrap();
    assert_eq!(
        rejected.await.unwrap(),
        Err(CommandError::Rejected {
            codes: vec![SubackCode::Failure]
        })
    );

    let accepted = handle.subscribe("allowed/#", QoS::AtLeastOnce, None).await.unwrap();
    assert!(accepted.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_topics_are_refused_before_sending() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    tokio::spawn(agent.run());

    let publish = handle.publish("a/+/b", "x", QoS::AtLeastOnce).await.unwrap();
    assert!(matches!(publish.await.unwrap(), Err(CommandError::Invalid(_))));

    let subscribe = handle.subscribe("a/#/b", QoS::AtLeastOnce, None).await.unwrap();
    assert!(matches!(subscribe.await.unwrap(), Err(CommandError::Invalid(_))));

    let sent = link
        .calls()
        .await
        .into_iter()
        .filter(|call| matches!(call, LinkCall::Publish { .. } | LinkCall::Subscribe { .. }))
        .count();
    assert_eq!(sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_reports_current_session() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    tokio::spawn(agent.run());

    let reply = handle.connect(true).await.unwrap().await.unwrap();

    assert_eq!(
        reply,
        Ok(CommandReply::Connected {
            session_present: false
        })
    );
    assert_eq!(link.connect_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_commands_after_disconnect_report_not_connected() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    tokio::spawn(agent.run());

    let disconnected = handle.disconnect().await.unwrap().await.unwrap();
    assert_eq!(disconnected, Ok(CommandReply::Disconnected));
    assert!(link.calls().await.contains(&LinkCall::Disconnect));

    let publish = handle.publish("a", "x", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(publish.await.unwrap(), Err(CommandError::NotConnected));

    // An explicit connect brings the agent back
    let reconnected = handle.connect(false).await.unwrap().await.unwrap();
    assert!(matches!(reconnected, Ok(CommandReply::Connected { .. })));
    let publish = handle.publish("a", "x", QoS::AtLeastOnce).await.unwrap();
    assert!(publish.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_acks() {
    let link = MockLink::new();
    link.set_auto_ack(false).await;
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    tokio::spawn(agent.run());

    let waiting = handle.publish("a", "x", QoS::AtLeastOnce).await.unwrap();
    wait_for_calls(&link, |calls| {
        calls.iter().any(|call| matches!(call, LinkCall::Publish { .. }))
    })
    .await;

    handle.disconnect().await.unwrap().await.unwrap().unwrap();
    assert_eq!(waiting.await.unwrap(), Err(CommandError::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn test_terminate_cancels_queued_commands() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;

    let terminated = handle.terminate().await.unwrap();
    let queued_a = handle.publish("a", "1", QoS::AtLeastOnce).await.unwrap();
    let queued_b = handle.subscribe("b/#", QoS::AtLeastOnce, None).await.unwrap();

    agent.run().await.unwrap();

    assert_eq!(terminated.await.unwrap(), Ok(CommandReply::Terminated));
    assert_eq!(queued_a.await.unwrap(), Err(CommandError::Cancelled));
    assert_eq!(queued_b.await.unwrap(), Err(CommandError::Cancelled));
    assert!(link.calls().await.contains(&LinkCall::Disconnect));
    assert_eq!(
        handle.publish("a", "late", QoS::AtMostOnce).await.err(),
        Some(SubmitError::AgentStopped)
    );
}

#[tokio::test(start_paused = true)]
async fn test_drop_policy_discards_queued_callbacks() {
    let mut settings = test_settings();
    settings.drain_policy = DrainPolicy::Drop;
    let (agent, handle) = connected_agent(MockLink::new(), settings).await;

    let terminated = handle.terminate().await.unwrap();
    let queued = handle.publish("a", "1", QoS::AtLeastOnce).await.unwrap();

    agent.run().await.unwrap();

    assert_eq!(terminated.await.unwrap(), Ok(CommandReply::Terminated));
    // Callback dropped unrun, so the sender side is gone
    assert!(queued.await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_agent_stops_when_all_handles_dropped() {
    let link = MockLink::new();
    let (agent, handle) = connected_agent(link.clone(), test_settings()).await;
    let agent_task = tokio::spawn(agent.run());

    drop(handle);

    agent_task.await.unwrap().unwrap();
    assert!(link.calls().await.contains(&LinkCall::Disconnect));
}
