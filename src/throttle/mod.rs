//! Host network throttling, used to reproduce poor links during testing.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_UPLINK: u64 = 1_000_000;
pub const DEFAULT_DOWNLINK: u64 = 1_000_000;

/// How long the throttle command may run before it is killed.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSettings {
    pub uplink: u64,
    pub downlink: u64,
    pub rtt: u64,
    pub packet_loss: f64,
}

impl ThrottleSettings {
    /// Fills unset or zero values with the defaults.
    pub fn with_defaults(
        uplink: Option<u64>,
        downlink: Option<u64>,
        rtt: Option<u64>,
        packet_loss: Option<f64>,
    ) -> Self {
        Self {
            uplink: uplink.filter(|v| *v > 0).unwrap_or(DEFAULT_UPLINK),
            downlink: downlink.filter(|v| *v > 0).unwrap_or(DEFAULT_DOWNLINK),
            rtt: rtt.unwrap_or(0),
            packet_loss: packet_loss.unwrap_or(0.0),
        }
    }
}

/// Process-wide network throttle.
#[async_trait]
pub trait NetworkThrottle: Send + Sync {
    async fn start(&self, settings: ThrottleSettings) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Drives an external `throttle` command line tool.
pub struct ShellThrottle {
    command: String,
}

impl ShellThrottle {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn start_args(settings: &ThrottleSettings) -> Vec<String> {
        vec![
            "--up".to_string(),
            settings.uplink.to_string(),
            "--down".to_string(),
            settings.downlink.to_string(),
            "--rtt".to_string(),
            settings.rtt.to_string(),
            "--packetLoss".to_string(),
            settings.packet_loss.to_string(),
        ]
    }

    pub fn stop_args() -> Vec<String> {
        vec!["--stop".to_string()]
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        debug!("running {} {}", self.command, args.join(" "));

        let child = tokio::process::Command::new(&self.command)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.command))?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .with_context(|| format!("{} timed out", self.command))?
            .with_context(|| format!("Failed to wait for {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkThrottle for ShellThrottle {
    async fn start(&self, settings: ThrottleSettings) -> Result<()> {
        self.run(Self::start_args(&settings)).await?;
        info!(
            "network throttle set [uplink:{}, downlink:{}, rtt:{}, packetLoss:{}]",
            settings.uplink, settings.downlink, settings.rtt, settings.packet_loss
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.run(Self::stop_args()).await?;
        info!("network throttle stopped");
        Ok(())
    }
}
