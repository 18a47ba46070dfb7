use std::time::Duration;

use cairn_core::{Health, PeerDescriptor};
use cairn_services::{DiscoveryEvent, RegistryError};

use crate::*;

const SETTLE: Duration = Duration::from_secs(2);

/// A sighted peer is registered, dialed on demand, and answers ping.
#[tokio::test]
async fn test_sighted_peer_is_reachable() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();

    let before = a.registry.get("b").unwrap();
    assert_eq!(before.addr, b.addr);
    assert_eq!(before.health, Health::Unknown);
    assert!(!before.connected);

    let client = a.registry.connection_for("b").await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "b");

    let after = a.registry.get("b").unwrap();
    assert_eq!(after.health, Health::Reachable);
    assert!(after.connected);

    a.stop().await;
    b.stop().await;
}

/// Re-announcing an unchanged peer does not disturb its connection.
#[tokio::test]
async fn test_repeated_sightings_keep_connection() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();
    let first = a.registry.connection_for("b").await.unwrap();

    for _ in 0..5 {
        sightings
            .send(DiscoveryEvent::Sighted(b.descriptor()))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = a.registry.connection_for("b").await.unwrap();
    assert!(!first.is_closed());
    assert_eq!(second.ping().await.unwrap(), "b");
    assert_eq!(a.registry.len(), 1);

    a.stop().await;
    b.stop().await;
}

/// A node never registers itself, even when it hears its own announcement.
#[tokio::test]
async fn test_own_announcement_is_ignored() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(a.descriptor()))
        .unwrap();
    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();

    assert!(a.registry.get("a").is_none());
    assert_eq!(a.registry.len(), 1);

    a.stop().await;
    b.stop().await;
}

/// A departure announcement removes the peer and closes its connection.
#[tokio::test]
async fn test_departure_removes_peer() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();
    let client = a.registry.connection_for("b").await.unwrap();

    sightings
        .send(DiscoveryEvent::Departed {
            name: "b".to_string(),
            instance: Some(b.identity.instance()),
        })
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_none())
        .await
        .unwrap();

    assert!(client.is_closed());
    assert!(matches!(
        a.registry.connection_for("b").await,
        Err(RegistryError::PeerUnknown(_))
    ));

    a.stop().await;
    b.stop().await;
}

/// A peer that comes back on a new address is followed there; the
/// connection to the old address is retired.
#[tokio::test]
async fn test_restarted_peer_is_followed_to_new_address() {
    let a = Node::start("a").await.unwrap();
    let old_b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(old_b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();
    let old_client = a.registry.connection_for("b").await.unwrap();
    assert_eq!(old_client.peer_addr(), old_b.addr);

    old_b.stop().await;
    let new_b = Node::start("b").await.unwrap();
    sightings
        .send(DiscoveryEvent::Sighted(new_b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || {
        a.registry.get("b").map(|p| p.addr) == Some(new_b.addr)
    })
    .await
    .unwrap();

    assert!(old_client.is_closed());
    let new_client = a.registry.connection_for("b").await.unwrap();
    assert_eq!(new_client.peer_addr(), new_b.addr);
    assert_eq!(new_client.ping().await.unwrap(), "b");

    a.stop().await;
    new_b.stop().await;
}

/// A sighted peer nobody answers for stays registered as unreachable,
/// and is picked up once it starts listening.
#[tokio::test]
async fn test_unreachable_peer_is_retained() {
    let a = Node::start("a").await.unwrap();
    let sightings = a.discover();

    let addr = dead_addr().await.unwrap();
    sightings
        .send(DiscoveryEvent::Sighted(PeerDescriptor::new("ghost", addr)))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("ghost").is_some())
        .await
        .unwrap();

    match a.registry.connection_for("ghost").await {
        Err(RegistryError::ConnectFailed { name, .. }) => assert_eq!(name, "ghost"),
        other => panic!("expected ConnectFailed, got {:?}", other.map(|c| c.peer_addr())),
    }

    let snap = a.registry.get("ghost").unwrap();
    assert_eq!(snap.health, Health::Unreachable);
    assert!(!snap.connected);
    assert_eq!(a.registry.len(), 1);

    a.stop().await;
}

/// Peers learned by one node are served to others through KnownPeers.
#[tokio::test]
async fn test_known_peers_includes_self_and_registered() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let c = Node::start("c").await.unwrap();

    a.registry.upsert(b.descriptor()).await;

    // c asks a who it knows about
    c.registry.upsert(a.descriptor()).await;
    let client = c.registry.connection_for("a").await.unwrap();
    let mut names: Vec<String> = cairn_services::PeerDirectory::known_peers(&client)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

/// Shutdown closes every connection and stops accepting sightings.
#[tokio::test]
async fn test_shutdown_closes_connections() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let c = Node::start("c").await.unwrap();

    a.registry.upsert(b.descriptor()).await;
    a.registry.upsert(c.descriptor()).await;
    let to_b = a.registry.connection_for("b").await.unwrap();
    let to_c = a.registry.connection_for("c").await.unwrap();

    a.stop().await;

    assert!(to_b.is_closed());
    assert!(to_c.is_closed());
    assert!(a.registry.is_empty());
    assert!(matches!(
        a.registry.connection_for("b").await,
        Err(RegistryError::ShuttingDown)
    ));

    b.stop().await;
    c.stop().await;
}

/// An entry overwritten with a stale address (say, by a late join answer)
/// is corrected by the peer's next announcement.
#[tokio::test]
async fn test_rediscovery_corrects_stale_entry() {
    let a = Node::start("a").await.unwrap();
    let b = Node::start("b").await.unwrap();
    let sightings = a.discover();

    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || a.registry.get("b").is_some())
        .await
        .unwrap();

    let stale = PeerDescriptor::new("b", dead_addr().await.unwrap());
    a.registry.upsert(stale).await;
    assert_ne!(a.registry.get("b").unwrap().addr, b.addr);

    sightings
        .send(DiscoveryEvent::Sighted(b.descriptor()))
        .unwrap();
    wait_until(SETTLE, || {
        a.registry.get("b").map(|p| p.addr) == Some(b.addr)
    })
    .await
    .unwrap();

    let client = a.registry.connection_for("b").await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "b");

    a.stop().await;
    b.stop().await;
}

/// A handle that died on a failed call is not handed out again.
#[tokio::test]
async fn test_dead_handle_is_replaced() {
    let a = Node::start("a").await.unwrap();

    // Reads one request per connection, then hangs up without answering.
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = cairn_services::rpc::read_frame::<_, cairn_core::rpc::RpcRequest>(
                    &mut stream,
                )
                .await;
            });
        }
    });

    a.registry.upsert(PeerDescriptor::new("b", addr)).await;
    let first = a.registry.connection_for("b").await.unwrap();
    assert!(first.ping().await.is_err());
    assert!(first.is_closed());

    let second = a.registry.connection_for("b").await.unwrap();
    assert!(!second.is_closed());
    assert_eq!(second.peer_addr(), addr);
    let snap = a.registry.get("b").unwrap();
    assert_eq!(snap.health, Health::Reachable);
    assert!(snap.connected);

    a.stop().await;
}
