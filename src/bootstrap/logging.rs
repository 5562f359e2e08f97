//! Setup for the application logging.
//!
//! It redirects the log output to the standard output with the level
//! defined in the configuration:
//!
//! - `Off`
//! - `Error`
//! - `Warn`
//! - `Info`
//! - `Debug`
//! - `Trace`
use std::str::FromStr;
use std::sync::Once;

use swarm_discovery_configuration::Configuration;
use tracing::info;
use tracing::level_filters::LevelFilter;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber with the configured level.
pub fn setup(configuration: &Configuration) {
    let level = config_level_or_default(&configuration.logging.log_level);

    if level == LevelFilter::OFF {
        return;
    }

    INIT.call_once(|| {
        stdout_config(level);
    });
}

fn config_level_or_default(log_level: &str) -> LevelFilter {
    LevelFilter::from_str(log_level).unwrap_or(LevelFilter::INFO)
}

fn stdout_config(level: LevelFilter) {
    tracing_subscriber::fmt().compact().with_max_level(level).init();

    info!("logging initialized");
}
