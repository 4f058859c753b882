//! CSP login, connection state and reconnect behaviour.

use std::time::Duration;

use relaylink_crypto::KeyPair;
use relaylink_node::connection::ConnectionState;
use relaylink_protocol::{InboundMessage, OutboundMessage, ServerKeys};

use crate::harness::{test_identity, wait_state, wait_until, MockChatServer, TestClientBuilder};

#[tokio::test]
async fn test_login_reaches_authenticated() {
    let identity = test_identity("ECHOECHO");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .stopped()
        .build()
        .await
        .unwrap();

    let mut states = client.connection.subscribe();
    assert_eq!(client.connection.state(), ConnectionState::Disconnected);
    client.connection.start().await;
    wait_state(&mut states, ConnectionState::Authenticated)
        .await
        .unwrap();

    assert_eq!(server.login_count(), 1);
    assert!(client.tasks.is_running());
    assert!(client.connection.is_reconnect_allowed());

    client.connection.stop().await;
    assert_eq!(client.connection.state(), ConnectionState::Disconnected);
    assert!(!client.tasks.is_running());
    server.shutdown();
}

#[tokio::test]
async fn test_echo_request_answered() {
    let identity = test_identity("ECHOECHO");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    server.push(InboundMessage::EchoRequest(b"ping".to_vec()));
    let reply = server.next_received().await.unwrap();
    assert_eq!(reply, OutboundMessage::EchoReply(b"ping".to_vec()));

    client.shutdown().await;
    server.shutdown();
}

/// The client falls back to the alternate key when the primary does not open the server hello.
#[tokio::test]
async fn test_alternate_server_key() {
    let identity = test_identity("ALTKEY01");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .server_keys(ServerKeys {
            primary: *KeyPair::generate().public_key(),
            alternate: Some(server.public_key()),
        })
        .build()
        .await
        .unwrap();

    client.wait_authenticated().await.unwrap();
    assert_eq!(server.login_count(), 1);

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_server_key_retries_with_backoff() {
    let identity = test_identity("WRONGKEY");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .server_keys(ServerKeys {
            primary: *KeyPair::generate().public_key(),
            alternate: None,
        })
        .build()
        .await
        .unwrap();

    wait_until(|| server.hello_count() >= 2).await.unwrap();
    assert_eq!(server.login_count(), 0);
    assert_ne!(client.connection.state(), ConnectionState::Authenticated);
    assert!(client.connection.is_reconnect_allowed());

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_identity_rejected() {
    let known = test_identity("KNOWN001");
    let server = MockChatServer::start(&known).await.unwrap();
    let client = TestClientBuilder::new(test_identity("STRANGER"), &server)
        .build()
        .await
        .unwrap();

    wait_until(|| server.hello_count() >= 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.login_count(), 0);
    assert_ne!(client.connection.state(), ConnectionState::Authenticated);

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_server_disconnect() {
    let identity = test_identity("RECONNCT");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    server.disconnect();
    server.wait_logins(2).await.unwrap();
    client.wait_authenticated().await.unwrap();
    assert!(client.tasks.is_running());

    client.shutdown().await;
    server.shutdown();
}

#[tokio::test]
async fn test_server_error_disables_reconnect() {
    let identity = test_identity("SRVERROR");
    let server = MockChatServer::start(&identity).await.unwrap();
    let client = TestClientBuilder::new(identity, &server)
        .build()
        .await
        .unwrap();
    client.wait_authenticated().await.unwrap();

    let mut states = client.connection.subscribe();
    server.push(InboundMessage::ServerError {
        reconnect_allowed: false,
        text: "another connection for this identity".into(),
    });
    server.disconnect();
    wait_state(&mut states, ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(!client.connection.is_reconnect_allowed());

    // Well past the one second backoff
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(server.login_count(), 1);
    assert_eq!(client.connection.state(), ConnectionState::Disconnected);

    client.shutdown().await;
    server.shutdown();
}
