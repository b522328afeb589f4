mod args;

pub use args::{Cli, CliCommand, ConfigCliArgs, ConfigCommand, ServeCliArgs};

use crate::capture::PortAllocator;
use crate::config::Config;
use crate::global;
use anyhow::{Context, Result};

pub fn handle_config_command(args: ConfigCliArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Show => {
            let config = Config::load()?;
            let text = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("{text}");
        }
        ConfigCommand::Path => {
            println!("{}", global::config_file()?.display());
        }
    }
    Ok(())
}

/// Allocates (and immediately releases) one capture port pair to check that
/// the configured range is usable.
pub fn handle_ports_command() -> Result<()> {
    let config = Config::load()?;
    let capture = &config.capture;
    let allocator = PortAllocator::from_config(capture)?;
    let lease = allocator.allocate_even_pair()?;

    println!(
        "Capture range {}-{} on {}: free pair {} / {}",
        capture.port_min, capture.port_max, capture.listen_ip, lease.audio_port, lease.rtcp_port
    );
    Ok(())
}
