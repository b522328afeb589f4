use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "carecall")]
#[command(about = "Session orchestration for a clinical video SFU", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the signaling and broadcaster API server
    Serve(ServeCliArgs),
    /// Inspect the configuration file
    Config(ConfigCliArgs),
    /// Probe the capture port range for a free even/odd pair
    Ports,
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeCliArgs {
    /// Use the in-process loopback media engine (no RTP forwarding)
    #[arg(long)]
    pub loopback: bool,
    /// Override the HTTP/WebSocket port from the config file
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(ClapArgs, Debug)]
pub struct ConfigCliArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file location
    Path,
}
