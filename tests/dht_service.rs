//! Two in-process DHT services talking over localhost.
use std::time::Duration;

use swarm_discovery::dht::cache::decode_cache;
use swarm_discovery::dht::service::DhtService;
use swarm_discovery_configuration::Dht;
use swarm_discovery_primitives::info_hash::InfoHash;

fn local_config() -> Dht {
    Dht {
        enabled: true,
        bind_address: "127.0.0.1:0".to_string(),
        rate_limit_up: 0,
        rate_limit_down: 0,
        cache_file: String::new(),
        bootstrap_nodes: Vec::new(),
    }
}

#[tokio::test]
async fn it_should_learn_a_node_and_run_an_announce() {
    let (b, _b_task) = DhtService::start(&local_config(), 6882).await.unwrap();
    let (a, _a_task) = DhtService::start(&local_config(), 6881).await.unwrap();

    // Feed B to A as a contact; A pings it, and the reply puts B into A's
    // routing table. B in turn learns about A the same way.
    a.add_node("127.0.0.1".to_string(), b.local_addr().port());

    let mut learned = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cache = a.store_cache().await.expect("the service should answer");
        if !decode_cache(&cache).unwrap().nodes.is_empty() {
            learned = true;
            break;
        }
    }
    assert!(learned, "A should have learned about B");

    // First announce: B hands out a token but tracks no peers yet, so the
    // announce completes without any.
    let result = tokio::time::timeout(Duration::from_secs(10), a.announce(InfoHash([0x42; 20])))
        .await
        .expect("the announce should finish quickly")
        .expect("the service should deliver a result");

    assert_eq!(result, Ok(Vec::new()));

    // The announce registered us with B; a second announce finds ourselves
    // under our advertised listen port.
    let result = tokio::time::timeout(Duration::from_secs(10), a.announce(InfoHash([0x42; 20])))
        .await
        .expect("the announce should finish quickly")
        .expect("the service should deliver a result");

    let peers = result.expect("the second announce should find peers");
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].to_string(), "127.0.0.1:6881");

    a.stop();
    b.stop();
}

#[tokio::test]
async fn it_should_persist_and_restore_its_node_id() {
    let (a, _task) = DhtService::start(&local_config(), 6881).await.unwrap();

    let cache = a.store_cache().await.expect("the service should answer");
    let loaded = decode_cache(&cache).unwrap();

    let self_id = loaded.self_id.expect("the cache should carry the node id");
    assert!(!self_id.is_zero());

    a.stop();
}
