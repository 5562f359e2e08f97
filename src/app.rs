//! Wiring from a [`Configuration`] to the running services.
use swarm_discovery_configuration::Configuration;
use swarm_discovery_primitives::info_hash::InfoHash;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bootstrap;
use crate::dht::service::{DhtHandle, DhtService};
use crate::discovery::{Discovery, DiscoveryHandle, SwarmEvent};

/// The running application: the (optional) DHT service plus whatever
/// discoveries the caller starts on top of it.
pub struct App {
    configuration: Configuration,
    dht: Option<DhtHandle>,
    dht_task: Option<JoinHandle<()>>,
}

impl App {
    /// Sets up logging and starts the DHT when enabled.
    ///
    /// # Errors
    ///
    /// Will return an error when the DHT socket cannot be bound.
    pub async fn start(configuration: Configuration) -> std::io::Result<App> {
        bootstrap::logging::setup(&configuration);

        let (dht, dht_task) = if configuration.dht.enabled {
            let (handle, task) = DhtService::start(&configuration.dht, configuration.core.listen_port).await?;
            (Some(handle), Some(task))
        } else {
            (None, None)
        };

        Ok(App {
            configuration,
            dht,
            dht_task,
        })
    }

    #[must_use]
    pub fn dht(&self) -> Option<&DhtHandle> {
        self.dht.as_ref()
    }

    /// Starts peer discovery for one torrent over the given `(group, url)`
    /// tracker list plus the DHT.
    ///
    /// # Errors
    ///
    /// Will return an error when the HTTP client cannot be built.
    pub fn discover(
        &self,
        info_hash: InfoHash,
        trackers: &[(u32, String)],
    ) -> Result<(DiscoveryHandle, mpsc::UnboundedReceiver<SwarmEvent>, JoinHandle<()>), crate::clients::http::Error> {
        Discovery::start(&self.configuration, info_hash, trackers, self.dht.clone())
    }

    /// Stops the DHT (persisting its routing cache) and waits for it to
    /// wind down.
    pub async fn shutdown(self) {
        if let Some(dht) = &self.dht {
            dht.stop();
        }

        if let Some(task) = self.dht_task {
            let _ = task.await;
        }
    }
}
