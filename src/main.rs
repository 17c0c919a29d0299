#[macro_use]
extern crate log;

use std::env::var;
use std::num::NonZeroU32;

mod config;
mod connection;
mod error;
mod fanlight;
mod message;
mod peer_frame;
mod protocol;
mod router;
mod stats;
mod topology;

use config::Config;
use fanlight::Fanlight;
use router::{Router, RouterOptions};
use topology::Topology;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("FANLIGHT_CONFIG").unwrap_or("config.toml".into());

    let config: Config = toml::from_slice(&std::fs::read(config_loc)?)?;

    let rate_limit =
        NonZeroU32::new(config.general.rate_limit).ok_or("rate_limit must be non-zero")?;

    let topology = Topology::from_config(
        &config.topology,
        config.general.peer_bind_address.parse()?,
    )?;

    let router = Router::new(topology, RouterOptions::from_config(&config)?);

    let mut fanlight = Fanlight::new(
        config.general.bind_address.as_str(),
        config.general.peer_bind_address.as_str(),
        router,
        rate_limit,
    )
    .await?;

    fanlight.stats_interval(config.general.stats_interval);

    fanlight.up().await?;

    Ok(())
}
