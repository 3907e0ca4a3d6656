//! Integration tests for the session over real loopback UDP sockets.
//!
//! Every node binds `127.0.0.1:0`; the kernel picks the port and the test
//! reads it back from the handle.

use std::net::SocketAddr;
use std::time::Duration;

use kadnode::{Identifier, Session, SessionConfig, SessionError, SessionHandle, TaskError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Running = JoinHandle<Result<(), SessionError>>;

fn config(bootstrap: Option<SocketAddr>) -> SessionConfig {
    let config = SessionConfig::default().with_listen(vec!["127.0.0.1:0".parse().unwrap()]);
    match bootstrap {
        Some(addr) => config.with_bootstrap(addr.to_string()),
        None => config,
    }
}

async fn spawn_node(bootstrap: Option<SocketAddr>) -> (SessionHandle, Running) {
    spawn_with(config(bootstrap)).await
}

async fn spawn_with(config: SessionConfig) -> (SessionHandle, Running) {
    let session = Session::bind(config).await.expect("bind failed");
    let handle = session.handle();
    (handle, tokio::spawn(session.run()))
}

fn id(first: u8, last: u8) -> Identifier {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    bytes[19] = last;
    Identifier::from_bytes(bytes)
}

fn addr_of(handle: &SessionHandle) -> SocketAddr {
    handle.local_addrs()[0]
}

async fn wait_for_peers(handle: &SessionHandle, count: usize) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if handle.peer_count().await.expect("session stopped") >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peers never appeared");
}

/// A first node plus `joiners` nodes bootstrapped from it, all fully joined.
async fn spawn_network(joiners: usize) -> Vec<(SessionHandle, Running)> {
    let first = spawn_node(None).await;
    let seed = addr_of(&first.0);
    let mut nodes = vec![first];
    for _ in 0..joiners {
        let node = spawn_node(Some(seed)).await;
        wait_for_peers(&node.0, 1).await;
        nodes.push(node);
    }
    wait_for_peers(&nodes[0].0, joiners).await;
    nodes
}

async fn shutdown(nodes: Vec<(SessionHandle, Running)>) {
    for (handle, running) in nodes {
        handle.abort();
        let result = running.await.expect("session task panicked");
        assert!(matches!(result, Err(SessionError::Aborted)), "unexpected exit: {result:?}");
    }
}

#[tokio::test]
async fn bootstrap_introduces_both_nodes() {
    let nodes = spawn_network(1).await;
    let (first, joiner) = (&nodes[0].0, &nodes[1].0);

    let found = timeout(TEST_TIMEOUT, joiner.find_node(first.local_id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found[0].id, first.local_id());
    assert_eq!(found[0].addr, addr_of(first));

    shutdown(nodes).await;
}

#[tokio::test]
async fn ping_returns_the_responder_identity() {
    let nodes = spawn_network(1).await;
    let responder = timeout(TEST_TIMEOUT, nodes[1].0.ping(addr_of(&nodes[0].0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responder, nodes[0].0.local_id());
    shutdown(nodes).await;
}

#[tokio::test]
async fn joiners_discover_each_other_through_the_first_node() {
    let nodes = spawn_network(3).await;

    let target = nodes[3].0.local_id();
    let found = timeout(TEST_TIMEOUT, nodes[1].0.find_node(target))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found[0].id, target);
    let mut ids: Vec<Identifier> = found.iter().map(|c| c.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), found.len(), "duplicate contacts in lookup result");
    assert!(nodes[1].0.peer_count().await.unwrap() >= 2);

    shutdown(nodes).await;
}

#[tokio::test]
async fn saved_value_loads_from_another_node() {
    let nodes = spawn_network(3).await;

    let report = timeout(TEST_TIMEOUT, nodes[3].0.save(b"greeting", b"hello".to_vec()))
        .await
        .unwrap()
        .unwrap();
    assert!(report.acknowledged >= 1);
    assert!(report.acknowledged <= report.attempted);

    let value = timeout(TEST_TIMEOUT, nodes[1].0.load(b"greeting"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, b"hello");

    shutdown(nodes).await;
}

#[tokio::test]
async fn missing_key_is_not_found() {
    let nodes = spawn_network(2).await;
    let result = timeout(TEST_TIMEOUT, nodes[2].0.load(b"never stored")).await.unwrap();
    assert!(matches!(result, Err(SessionError::Task(TaskError::ValueNotFound))));
    shutdown(nodes).await;
}

#[tokio::test]
async fn isolated_node_cannot_save() {
    let (handle, running) = spawn_node(None).await;
    let result = handle.save(b"key", b"value".to_vec()).await;
    assert!(matches!(result, Err(SessionError::Task(TaskError::NoContacts))));
    shutdown(vec![(handle, running)]).await;
}

#[tokio::test]
async fn garbage_datagrams_are_dropped() {
    let nodes = spawn_network(1).await;
    let target = addr_of(&nodes[0].0);
    let before = nodes[0].0.peer_count().await.unwrap();

    let attacker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut truncated_header = vec![1u8, 0, 0, 0, 0];
    truncated_header.extend_from_slice(&[0xab; 10]);
    let mut bad_version = vec![0xffu8; 45];
    bad_version[0] = 9;
    for datagram in [vec![], vec![0u8; 3], truncated_header, bad_version, vec![0x42; 2048]] {
        attacker.send_to(&datagram, target).await.unwrap();
    }

    // The loop still serves requests and learned nothing from the garbage.
    let responder = timeout(TEST_TIMEOUT, nodes[1].0.ping(target))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(responder, nodes[0].0.local_id());
    assert_eq!(nodes[0].0.peer_count().await.unwrap(), before);

    shutdown(nodes).await;
}

#[tokio::test]
async fn silent_stalest_contact_gives_way_to_newcomer() {
    let mut hub_config = config(None).with_local_id(id(0, 0));
    hub_config.k = 1;
    let hub = spawn_with(hub_config).await;
    let hub_addr = addr_of(&hub.0);

    // Both joiners land in the hub's farthest bucket, which holds one contact.
    let departed = spawn_with(config(Some(hub_addr)).with_local_id(id(0x80, 1))).await;
    wait_for_peers(&departed.0, 1).await;
    wait_for_peers(&hub.0, 1).await;
    shutdown(vec![departed]).await;

    let newcomer_id = id(0x80, 2);
    let newcomer = spawn_with(config(Some(hub_addr)).with_local_id(newcomer_id)).await;
    wait_for_peers(&newcomer.0, 1).await;

    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(found) = hub.0.find_node(newcomer_id).await {
                if found.first().map(|c| c.id) == Some(newcomer_id) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("newcomer never replaced the silent contact");
    assert_eq!(hub.0.peer_count().await.unwrap(), 1);

    shutdown(vec![hub, newcomer]).await;
}

#[tokio::test]
async fn ping_to_silent_address_times_out() {
    let nodes = spawn_network(0).await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let result = timeout(TEST_TIMEOUT, nodes[0].0.ping(silent.local_addr().unwrap()))
        .await
        .unwrap();
    assert!(matches!(result, Err(SessionError::Task(TaskError::AllUnresponsive))));
    shutdown(nodes).await;
}

#[tokio::test(start_paused = true)]
async fn silent_bootstrap_peer_is_fatal() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = Session::bind(config(Some(silent.local_addr().unwrap())))
        .await
        .unwrap();
    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::InitialPeerFailedToRespond)));
}

#[tokio::test]
async fn handle_reports_closed_after_exit() {
    let (handle, running) = spawn_node(None).await;
    handle.abort();
    assert!(matches!(running.await.unwrap(), Err(SessionError::Aborted)));
    assert!(matches!(
        handle.find_node(Identifier::random()).await,
        Err(SessionError::Closed)
    ));
}
