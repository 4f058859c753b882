//! Unsolicited inbound messages while tasks are (or are not) waiting.

use relaylink_node::connection::ConnectionState;
use relaylink_node::outgoing::OutgoingMessageTask;
use relaylink_protocol::{InboundMessage, OutboundMessage, Reflected};

use crate::harness::{
    message_bytes, test_identity, wait_until, MockChatServer, TestClientBuilder, WAIT,
};

fn reflected(id: u32) -> InboundMessage {
    InboundMessage::Reflected(Reflected {
        flags: 0,
        reflected_id: id,
        timestamp: 1_700_000_000_000,
        envelope: vec![0xee; 12],
    })
}

#[tokio::test]
async fn test_reflected_acked_without_running_task() {
    let identity = test_identity("DEVICE01");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    server.push(reflected(11));
    assert_eq!(
        server.next_received().await.unwrap(),
        OutboundMessage::ReflectedAck(11)
    );

    client.shutdown().await;
    server.shutdown();
}

/// A reflected message arriving while a task waits for its ack is handled
/// by the processor without failing or reordering the task.
#[tokio::test]
async fn test_reflected_bypasses_waiting_task() {
    let identity = test_identity("DEVICE01");
    let server = MockChatServer::start(&identity).await.unwrap();
    server.set_auto_ack(false);
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    let data = message_bytes(b"DEVICE01", b"RECEIVER", 9, b"wait");
    let handle = client
        .tasks
        .schedule(OutgoingMessageTask::new(data.clone()).unwrap());
    assert_eq!(
        server.next_received().await.unwrap(),
        OutboundMessage::OutgoingMessage(data.clone())
    );

    server.push(reflected(7));
    server.push(InboundMessage::OutgoingMessageAck(data[8..24].to_vec()));
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    assert_eq!(
        server.next_received().await.unwrap(),
        OutboundMessage::ReflectedAck(7)
    );
    wait_until(|| client.processor.reflected_count() == 1)
        .await
        .unwrap();

    client.shutdown().await;
    server.shutdown();
}

/// Unrelated CSP messages queue behind the waiting task instead of being lost.
#[tokio::test]
async fn test_incoming_message_backlogged_during_task() {
    let identity = test_identity("DEVICE01");
    let server = MockChatServer::start(&identity).await.unwrap();
    server.set_auto_ack(false);
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    let data = message_bytes(b"DEVICE01", b"RECEIVER", 1, b"first");
    let handle = client
        .tasks
        .schedule(OutgoingMessageTask::new(data.clone()).unwrap());
    server.next_received().await.unwrap();

    server.push(InboundMessage::IncomingMessage(message_bytes(
        b"FRIEND01",
        b"DEVICE01",
        2,
        b"hey",
    )));
    assert!(server.stays_quiet(std::time::Duration::from_millis(200)).await);
    assert_eq!(client.processor.incoming_count(), 0);

    server.push(InboundMessage::OutgoingMessageAck(data[8..24].to_vec()));
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    let ack = server.next_received().await.unwrap();
    assert!(matches!(ack, OutboundMessage::IncomingMessageAck(ref a) if a.starts_with(b"FRIEND01")));

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_server_alert_keeps_connection() {
    let identity = test_identity("DEVICE01");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    server.push(InboundMessage::ServerAlert("maintenance at noon".into()));
    wait_until(|| client.processor.alert_count() == 1)
        .await
        .unwrap();
    assert_eq!(client.connection.state(), ConnectionState::Authenticated);

    client.shutdown().await;
    server.shutdown();
}
