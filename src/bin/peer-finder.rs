//! Console client: announce an infohash to its trackers and the DHT and
//! print every peer that turns up.
use anyhow::Context;
use clap::Parser;
use swarm_discovery::app::App;
use swarm_discovery::discovery::SwarmEvent;
use swarm_discovery_configuration::Configuration;
use swarm_discovery_primitives::info_hash::InfoHash;

#[derive(Parser, Debug)]
#[command(author, version, about = "Find swarm peers for a torrent via trackers and the Mainline DHT.")]
struct Args {
    /// The torrent's infohash as 40 hex characters.
    info_hash: String,

    /// Announce URL, repeatable; each URL becomes its own failover group.
    #[arg(long = "tracker")]
    trackers: Vec<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let configuration = Configuration::load(args.config.as_deref()).context("loading configuration")?;

    let info_hash: InfoHash = args
        .info_hash
        .parse()
        .map_err(|_| anyhow::anyhow!("the infohash must be 40 hex characters"))?;

    let trackers: Vec<(u32, String)> = args
        .trackers
        .iter()
        .enumerate()
        .map(|(group, url)| (u32::try_from(group).unwrap_or(u32::MAX), url.clone()))
        .collect();

    let app = App::start(configuration).await.context("starting services")?;

    let (discovery, mut events, _task) = app.discover(info_hash, &trackers).context("starting discovery")?;
    discovery.send_start_event();

    println!("announcing {info_hash}; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = events.recv() => match event {
                Some(SwarmEvent::Peers(peers)) => {
                    for peer in peers {
                        println!("peer {peer}");
                    }
                }
                Some(SwarmEvent::Failure(msg)) => eprintln!("announce failed: {msg}"),
                None => break,
            }
        }
    }

    discovery.send_stop_event();
    discovery.shutdown();
    app.shutdown().await;

    Ok(())
}
