use anyhow::Result;
use carecall::{
    app,
    cli::{handle_config_command, handle_ports_command, Cli, CliCommand},
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(CliCommand::Version) => {
            println!("carecall {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(CliCommand::Config(args)) => handle_config_command(args),
        Some(CliCommand::Ports) => handle_ports_command(),
        Some(CliCommand::Serve(args)) => app::run_service(args).await,
        None => app::run_service(Default::default()).await,
    }
}
