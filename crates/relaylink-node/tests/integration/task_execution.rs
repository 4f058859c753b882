//! Tasks driven over a live server connection.

use relaylink_node::outgoing::OutgoingMessageTask;
use relaylink_protocol::{InboundMessage, OutboundMessage};
use relaylink_storage::TaskArchive;

use crate::harness::{
    message_bytes, test_identity, wait_until, MockChatServer, TestClientBuilder, WAIT,
};

#[tokio::test]
async fn test_outgoing_message_completes_on_ack() {
    let identity = test_identity("SENDER01");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    let data = message_bytes(b"SENDER01", b"RECEIVER", 1, b"hello");
    let handle = client
        .tasks
        .schedule(OutgoingMessageTask::new(data.clone()).unwrap());
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    assert_eq!(
        server.next_received().await.unwrap(),
        OutboundMessage::OutgoingMessage(data)
    );
    assert_eq!(client.archive.count().unwrap(), 0);

    client.shutdown().await;
    server.shutdown();
}

/// Scheduled while offline, sent once the connection comes up.
#[tokio::test]
async fn test_task_scheduled_before_login() {
    let identity = test_identity("SENDER01");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .stopped()
        .build()
        .await
        .unwrap();

    let data = message_bytes(b"SENDER01", b"RECEIVER", 2, b"queued");
    let handle = client
        .tasks
        .schedule(OutgoingMessageTask::new(data).unwrap());
    assert_eq!(client.archive.count().unwrap(), 1);

    client.connection.start().await;
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(client.archive.count().unwrap(), 0);

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_incoming_message_acked() {
    let identity = test_identity("RECEIVER");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    server.push(InboundMessage::IncomingMessage(message_bytes(
        b"SENDER01",
        b"RECEIVER",
        5,
        b"body",
    )));
    let ack = server.next_received().await.unwrap();
    let mut expected = b"SENDER01".to_vec();
    expected.extend_from_slice(&[5; 8]);
    assert_eq!(ack, OutboundMessage::IncomingMessageAck(expected));
    wait_until(|| client.processor.incoming_count() == 1)
        .await
        .unwrap();

    client.shutdown().await;
    server.shutdown();
}

/// The running task is interrupted by the disconnect and runs again on the next connection.
#[tokio::test]
async fn test_task_resumes_after_disconnect() {
    let identity = test_identity("SENDER01");
    let server = MockChatServer::start(&identity).await.unwrap();
    server.set_auto_ack(false);
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    let data = message_bytes(b"SENDER01", b"RECEIVER", 3, b"again");
    let handle = client
        .tasks
        .schedule(OutgoingMessageTask::new(data.clone()).unwrap());
    let first = server.next_received().await.unwrap();
    assert_eq!(first, OutboundMessage::OutgoingMessage(data.clone()));

    server.disconnect();
    server.wait_logins(2).await.unwrap();
    let second = server
        .wait_received(|m| matches!(m, OutboundMessage::OutgoingMessage(_)))
        .await
        .unwrap();
    assert_eq!(second, OutboundMessage::OutgoingMessage(data.clone()));

    server.push(InboundMessage::OutgoingMessageAck(data[8..24].to_vec()));
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(client.archive.count().unwrap(), 0);

    client.shutdown().await;
    server.shutdown();
}

/// A persistent task left unacked is picked up from the archive by the next client.
#[tokio::test]
async fn test_archived_task_survives_restart() {
    let identity = test_identity("SENDER01");
    let server = MockChatServer::start(&identity).await.unwrap();
    server.set_auto_ack(false);
    let first = TestClientBuilder::new(identity.clone(), &server)
        .build()
        .await
        .unwrap();
    first.wait_authenticated().await.unwrap();

    let data = message_bytes(b"SENDER01", b"RECEIVER", 4, b"persist");
    let _unfinished = first
        .tasks
        .schedule(OutgoingMessageTask::new(data.clone()).unwrap());
    server.next_received().await.unwrap();
    assert_eq!(first.archive.count().unwrap(), 1);
    let dir = first.stop_keep_archive().await;

    server.set_auto_ack(true);
    let second = TestClientBuilder::new(identity, &server)
        .tempdir(dir)
        .build()
        .await
        .unwrap();
    let resent = server
        .wait_received(|m| matches!(m, OutboundMessage::OutgoingMessage(_)))
        .await
        .unwrap();
    assert_eq!(resent, OutboundMessage::OutgoingMessage(data));
    wait_until(|| second.archive.count().map(|n| n == 0).unwrap_or(false))
        .await
        .unwrap();

    second.shutdown().await;
    server.shutdown();
}
