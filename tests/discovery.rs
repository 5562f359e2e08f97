//! End-to-end peer discovery against an in-process fake UDP tracker.
use std::time::Duration;

use swarm_discovery::discovery::{Discovery, SwarmEvent};
use swarm_discovery_configuration::Configuration;
use swarm_discovery_primitives::info_hash::InfoHash;
use tokio::net::UdpSocket;

/// A fake BEP-15 tracker answering every connect and announce.
async fn fake_tracker() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buffer = [0u8; 1024];

        loop {
            let Ok((_, from)) = socket.recv_from(&mut buffer).await else {
                return;
            };

            let action = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);
            let transaction = &buffer[12..16];

            let mut reply = Vec::new();
            reply.extend_from_slice(&action.to_be_bytes());
            reply.extend_from_slice(transaction);

            match action {
                0 => reply.extend_from_slice(&7u64.to_be_bytes()),
                1 => {
                    reply.extend_from_slice(&1800u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
                }
                _ => continue,
            }

            socket.send_to(&reply, from).await.unwrap();
        }
    });

    port
}

#[tokio::test]
async fn it_should_discover_peers_through_a_udp_tracker() {
    let tracker_port = fake_tracker().await;

    let mut configuration = Configuration::default();
    configuration.dht.enabled = false;
    configuration.core.udp_timeout = 2;
    configuration.logging.log_level = "off".to_string();

    let trackers = vec![(0u32, format!("udp://127.0.0.1:{tracker_port}"))];

    let (handle, mut events, _task) =
        Discovery::start(&configuration, InfoHash([0x01; 20]), &trackers, None).unwrap();

    handle.send_start_event();

    let peers = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Some(SwarmEvent::Peers(peers)) if !peers.is_empty() => return peers,
                Some(_) => continue,
                None => panic!("the discovery task went away"),
            }
        }
    })
    .await
    .expect("an announce should have succeeded");

    assert_eq!(peers[0].to_string(), "127.0.0.1:6881");

    handle.shutdown();
}
