//! Device linking across real TCP paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relaylink_node::linking::{DeviceLinkingTask, PathMode};
use relaylink_rendezvous::{
    AuthenticationKey, RendezvousConnection, RendezvousError, RendezvousPath, RendezvousRole,
    TcpPath,
};
use tokio::net::TcpListener;

use crate::harness::WAIT;

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Both sides agree on the path and its hash when the responder nominates.
#[tokio::test]
async fn test_link_responder_nominates_over_three_paths() {
    let ak = AuthenticationKey::random();
    let paths = vec![
        (1, free_addr().await),
        (2, free_addr().await),
        (3, free_addr().await),
    ];

    let responder = DeviceLinkingTask {
        role: RendezvousRole::Responder,
        is_nominator: true,
        ak: ak.clone(),
        paths: paths.clone(),
        mode: PathMode::Listen,
        label: "laptop".into(),
        connect_timeout: WAIT,
    };
    let initiator = DeviceLinkingTask {
        role: RendezvousRole::Initiator,
        is_nominator: false,
        ak,
        paths,
        mode: PathMode::Dial,
        label: "phone".into(),
        connect_timeout: WAIT,
    };

    let responder = tokio::spawn(async move { responder.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let initiator = tokio::time::timeout(WAIT, initiator.run())
        .await
        .unwrap()
        .unwrap();
    let responder = responder.await.unwrap().unwrap();

    assert_eq!(initiator.pid, responder.pid);
    assert_eq!(initiator.rph, responder.rph);
    assert_eq!(initiator.remote_label, "laptop");
    assert_eq!(responder.remote_label, "phone");
}

/// A path that never connects is dropped; the rest still rendezvous.
#[tokio::test]
async fn test_dead_path_is_skipped() {
    let ak = AuthenticationKey::random();
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = free_addr().await;
    let addrs = (first.local_addr().unwrap(), second.local_addr().unwrap());

    let responder_ak = ak.clone();
    let responder = tokio::spawn(async move {
        let (a, _) = first.accept().await?;
        let (b, _) = second.accept().await?;
        let paths: Vec<Arc<dyn RendezvousPath>> = vec![
            Arc::new(TcpPath::from_stream(1, a)),
            Arc::new(TcpPath::from_stream(2, b)),
        ];
        let mut connection =
            RendezvousConnection::connect(RendezvousRole::Responder, false, responder_ak, paths)
                .await?;
        let data = connection.receive().await?;
        connection.send(b"pong".to_vec()).await?;
        let pid = connection.pid();
        let rph = *connection.rph();
        connection.close().await;
        Ok::<_, RendezvousError>((pid, rph, data))
    });

    let paths: Vec<Arc<dyn RendezvousPath>> = vec![
        Arc::new(TcpPath::new(1, addrs.0)),
        Arc::new(TcpPath::new(2, addrs.1)),
        Arc::new(TcpPath::new(3, dead)),
    ];
    let mut connection = tokio::time::timeout(
        WAIT,
        RendezvousConnection::connect(RendezvousRole::Initiator, true, ak, paths),
    )
    .await
    .unwrap()
    .unwrap();
    assert_ne!(connection.pid(), 3);
    connection.send(b"ping".to_vec()).await.unwrap();
    let reply = connection.receive().await.unwrap();
    assert_eq!(reply.as_deref(), Some(&b"pong"[..]));

    let (pid, rph, data) = responder.await.unwrap().unwrap();
    assert_eq!(pid, connection.pid());
    assert_eq!(&rph, connection.rph());
    assert_eq!(data.as_deref(), Some(&b"ping"[..]));
    connection.close().await;
}

#[tokio::test]
async fn test_mismatched_keys_fail_link() {
    let paths = vec![(1, free_addr().await), (2, free_addr().await)];
    let responder = DeviceLinkingTask {
        role: RendezvousRole::Responder,
        is_nominator: false,
        ak: AuthenticationKey::random(),
        paths: paths.clone(),
        mode: PathMode::Listen,
        label: "laptop".into(),
        connect_timeout: WAIT,
    };
    let initiator = DeviceLinkingTask {
        role: RendezvousRole::Initiator,
        is_nominator: true,
        ak: AuthenticationKey::random(),
        paths,
        mode: PathMode::Dial,
        label: "phone".into(),
        connect_timeout: WAIT,
    };

    let responder = tokio::spawn(async move { responder.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let initiator = tokio::time::timeout(WAIT, initiator.run()).await.unwrap();
    assert!(initiator.is_err());
    let responder = tokio::time::timeout(WAIT, responder)
        .await
        .unwrap()
        .unwrap();
    assert!(responder.is_err());
}

/// The peer reaches only one of the listened paths; linking goes ahead on it.
#[tokio::test]
async fn test_listener_links_over_the_only_dialed_path() {
    let ak = AuthenticationKey::random();
    let reachable = (1, free_addr().await);
    let unreached = (2, free_addr().await);

    let listener = DeviceLinkingTask {
        role: RendezvousRole::Responder,
        is_nominator: true,
        ak: ak.clone(),
        paths: vec![reachable, unreached],
        mode: PathMode::Listen,
        label: "laptop".into(),
        connect_timeout: Duration::from_millis(500),
    };
    let dialer = DeviceLinkingTask {
        role: RendezvousRole::Initiator,
        is_nominator: false,
        ak,
        paths: vec![reachable],
        mode: PathMode::Dial,
        label: "phone".into(),
        connect_timeout: WAIT,
    };

    let listener = tokio::spawn(async move { listener.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let dialed = tokio::time::timeout(WAIT, dialer.run())
        .await
        .unwrap()
        .unwrap();
    let listened = tokio::time::timeout(WAIT, listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(dialed.pid, 1);
    assert_eq!(listened.pid, 1);
    assert_eq!(dialed.rph, listened.rph);
    assert_eq!(dialed.remote_label, "laptop");
}
