//! Configuration data structures for the swarm-discovery library.
//!
//! The configuration is loaded from an optional [TOML](https://toml.io/en/)
//! file plus environment variable overrides. Each section of the TOML
//! structure maps to a data structure:
//!
//! - `[core]` → [`Core`]: announce identity and tracker client timing.
//! - `[dht]` → [`Dht`]: the Mainline DHT node.
//! - `[logging]` → [`Logging`]: log output.
//!
//! Loading merges three providers, later ones winning: the defaults, the
//! TOML file (when given) and environment variables prefixed with
//! `SWARM_DISCOVERY_` (section and field separated by `__`, for example
//! `SWARM_DISCOVERY_DHT__BIND_ADDRESS`).
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment variable overrides.
pub const ENV_VAR_PREFIX: &str = "SWARM_DISCOVERY_";

/// Errors raised while loading or rendering the configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to load configuration: {source}")]
    Load {
        #[from]
        source: Box<figment::Error>,
    },

    #[error("unable to render configuration to TOML: {source}")]
    Render {
        #[from]
        source: toml::ser::Error,
    },
}

/// Announce identity and tracker client timing.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Core {
    /// The port we advertise to trackers and DHT nodes as accepting peer
    /// connections.
    pub listen_port: u16,
    /// Azureus style client prefix for generated peer ids.
    pub peer_id_prefix: String,
    /// Number of peers wanted per announce. `-1` lets the tracker decide.
    pub numwant: i32,
    /// 32-bit announce key identifying us across address changes. `0`
    /// picks a random key at startup.
    pub key: u32,
    /// Seconds to wait for a BEP-15 UDP tracker reply before retrying.
    pub udp_timeout: u32,
    /// Number of BEP-15 attempts before the tracker counts as failed.
    pub udp_tries: u32,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            peer_id_prefix: "-SD0010-".to_string(),
            numwant: -1,
            key: 0,
            udp_timeout: 30,
            udp_tries: 2,
        }
    }
}

/// Configuration for the Mainline DHT node.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Dht {
    /// Whether the DHT runs at all. With the DHT disabled, `dht://`
    /// trackers are unusable.
    pub enabled: bool,
    /// Local UDP socket address to bind the DHT server to.
    pub bind_address: String,
    /// Upload rate limit in bytes per second. `0` means unlimited.
    pub rate_limit_up: u32,
    /// Download rate limit in bytes per second. `0` means unlimited.
    pub rate_limit_down: u32,
    /// Path for persisting the routing table between runs. Empty disables
    /// persistence.
    pub cache_file: String,
    /// `host:port` contacts used to enter the network when the routing
    /// table holds too few nodes.
    pub bootstrap_nodes: Vec<String>,
}

impl Default for Dht {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:6881".to_string(),
            rate_limit_up: 0,
            rate_limit_down: 0,
            cache_file: String::new(),
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],
        }
    }
}

/// Configuration for logging.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Logging {
    /// Maximum level to emit: `off`, `error`, `warn`, `info`, `debug` or
    /// `trace`.
    pub log_level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Core configuration for the library.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct Configuration {
    pub core: Core,
    pub dht: Dht,
    pub logging: Logging,
}

impl Configuration {
    /// Loads the configuration from the defaults, an optional TOML file
    /// and the environment.
    ///
    /// # Errors
    ///
    /// Will return an error when the file or the environment contain keys
    /// of the wrong shape or type.
    pub fn load(toml_path: Option<&str>) -> Result<Configuration, Error> {
        let mut figment = Figment::from(Serialized::defaults(Configuration::default()));

        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_VAR_PREFIX).split("__"));

        figment.extract().map_err(|err| Error::Load { source: Box::new(err) })
    }

    /// Renders the configuration as a TOML document.
    ///
    /// # Errors
    ///
    /// Will return an error when the configuration fails to serialize.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use crate::Configuration;

    #[test]
    fn configuration_should_have_usable_defaults() {
        let configuration = Configuration::default();

        assert_eq!(configuration.core.listen_port, 6881);
        assert_eq!(configuration.core.udp_tries, 2);
        assert!(configuration.dht.enabled);
        assert_eq!(configuration.dht.bootstrap_nodes.len(), 2);
        assert_eq!(configuration.logging.log_level, "info");
    }

    #[test]
    fn configuration_should_round_trip_through_toml() {
        let configuration = Configuration::default();

        let toml = configuration.to_toml().unwrap();
        let parsed: Configuration = toml::from_str(&toml).unwrap();

        assert_eq!(parsed, configuration);
    }

    #[test]
    fn configuration_should_be_loaded_without_a_file() {
        figment::Jail::expect_with(|_jail| {
            let configuration = Configuration::load(None).expect("it should load from defaults");

            assert_eq!(configuration, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn configuration_should_be_overridden_by_the_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SWARM_DISCOVERY_DHT__BIND_ADDRESS", "127.0.0.1:7000");
            jail.set_env("SWARM_DISCOVERY_CORE__LISTEN_PORT", "7001");

            let configuration = Configuration::load(None).expect("it should load with env overrides");

            assert_eq!(configuration.dht.bind_address, "127.0.0.1:7000");
            assert_eq!(configuration.core.listen_port, 7001);
            Ok(())
        });
    }

    #[test]
    fn configuration_should_be_loaded_from_a_toml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "swarm-discovery.toml",
                r#"
                [dht]
                enabled = false
                "#,
            )?;

            let configuration = Configuration::load(Some("swarm-discovery.toml")).expect("it should load the file");

            assert!(!configuration.dht.enabled);
            // Untouched sections keep their defaults.
            assert_eq!(configuration.core.listen_port, 6881);
            Ok(())
        });
    }
}
