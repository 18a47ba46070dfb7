use std::time::Duration;

use cairn_services::{join, resolve_seed, JoinError, UpsertOutcome};

use crate::*;

/// Joining through a live seed returns the seed and everything it knows;
/// the joiner registers all of them except itself.
#[tokio::test]
async fn test_join_learns_seed_and_its_peers() {
    let seed = Node::start("seed").await.unwrap();
    let other = Node::start("other").await.unwrap();
    let joiner = Node::start("joiner").await.unwrap();

    seed.registry.upsert(other.descriptor()).await;
    // the seed already heard of the joiner via discovery
    seed.registry.upsert(joiner.descriptor()).await;

    let peers = join(joiner.registry.factory(), Some(seed.addr))
        .await
        .unwrap();

    let mut names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["joiner", "other", "seed"]);

    for peer in peers {
        let outcome = joiner.registry.upsert(peer.clone()).await;
        if peer.name == "joiner" {
            assert_eq!(outcome, UpsertOutcome::Ignored);
        } else {
            assert_eq!(outcome, UpsertOutcome::Inserted);
        }
    }

    let mut registered: Vec<String> = joiner
        .registry
        .snapshot()
        .into_iter()
        .map(|p| p.name)
        .collect();
    registered.sort();
    assert_eq!(registered, vec!["other".to_string(), "seed".to_string()]);

    // the join connection itself is not kept
    assert!(joiner.registry.snapshot().iter().all(|p| !p.connected));

    let client = joiner.registry.connection_for("other").await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "other");

    seed.stop().await;
    other.stop().await;
    joiner.stop().await;
}

/// A seed nobody answers for is reported and nothing is registered.
#[tokio::test]
async fn test_unreachable_seed_registers_nothing() {
    let joiner = Node::start("joiner").await.unwrap();
    let addr = dead_addr().await.unwrap();

    let err = join(joiner.registry.factory(), Some(addr))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::Unreachable { .. }), "got {err}");
    assert!(joiner.registry.is_empty());

    joiner.stop().await;
}

/// Without a seed, joining is a no-op and discovery alone fills the registry.
#[tokio::test]
async fn test_no_seed_then_discovery() {
    let joiner = Node::start("joiner").await.unwrap();
    let other = Node::start("other").await.unwrap();

    let peers = join(joiner.registry.factory(), None).await.unwrap();
    assert!(peers.is_empty());

    let sightings = joiner.discover();
    sightings
        .send(cairn_services::DiscoveryEvent::Sighted(other.descriptor()))
        .unwrap();
    wait_until(Duration::from_secs(2), || joiner.registry.get("other").is_some())
        .await
        .unwrap();

    joiner.stop().await;
    other.stop().await;
}

/// A seed given as a bare host gets the default RPC port.
#[tokio::test]
async fn test_seed_host_resolves_with_default_port() {
    let seed = Node::start("seed").await.unwrap();

    let addr = resolve_seed("127.0.0.1", seed.addr.port(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(addr, seed.addr);

    let peers = join(seed.registry.factory(), Some(addr)).await.unwrap();
    assert!(peers.iter().any(|p| p.name == "seed"));

    let via_name = resolve_seed("localhost", 8181, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(via_name.port(), 8181);
    assert!(via_name.ip().is_loopback());

    seed.stop().await;
}
