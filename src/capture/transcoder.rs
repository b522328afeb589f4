//! Transcoder subprocess: reads the tapped RTP stream described by an SDP
//! file and writes 16-bit little-endian PCM to stdout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a transcoder gets to exit after SIGINT before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub room_id: String,
    pub sdp_path: PathBuf,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Handle used to stop a running transcoder.
pub trait ProcessControl: Send {
    /// Asks the process to exit. Does not wait for it.
    fn terminate(self: Box<Self>);
}

pub struct TranscoderProcess {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscoderProcess>;
}

pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    /// Uses `path` when given, otherwise looks `ffmpeg` up in `PATH`.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let program = match path {
            Some(path) => PathBuf::from(path),
            None => which::which("ffmpeg").context("ffmpeg not found in PATH")?,
        };
        Ok(Self { program })
    }

    pub fn args(request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "-loglevel",
            "debug",
            "-protocol_whitelist",
            "file,crypto,data,udp,rtp",
            "-f",
            "sdp",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push(request.sdp_path.to_string_lossy().into_owned());
        args.extend(
            [
                "-map".to_string(),
                "0:a:0".to_string(),
                "-c:a".to_string(),
                "pcm_s16le".to_string(),
                "-ar".to_string(),
                request.sample_rate.to_string(),
                "-ac".to_string(),
                request.channels.to_string(),
                "-f".to_string(),
                "s16le".to_string(),
                "pipe:1".to_string(),
            ]
            .into_iter(),
        );
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, request: &TranscodeRequest) -> Result<TranscoderProcess> {
        let args = Self::args(request);
        debug!("spawning {:?} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.program))?;

        let output = child
            .stdout
            .take()
            .context("transcoder stdout was not captured")?;

        if let Some(stderr) = child.stderr.take() {
            let room_id = request.room_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg[{}]: {}", room_id, line);
                }
            });
        }

        info!(
            "transcoder started for room {} (pid {:?})",
            request.room_id,
            child.id()
        );

        Ok(TranscoderProcess {
            output: Box::new(output),
            control: Box::new(FfmpegControl { child }),
        })
    }
}

struct FfmpegControl {
    child: Child,
}

impl FfmpegControl {
    #[cfg(unix)]
    fn interrupt(child: &mut Child) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match child.id() {
            Some(pid) => {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                    warn!("failed to send SIGINT to transcoder {}: {}", pid, err);
                    let _ = child.start_kill();
                }
            }
            None => debug!("transcoder already exited"),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(child: &mut Child) {
        let _ = child.start_kill();
    }
}

impl ProcessControl for FfmpegControl {
    fn terminate(self: Box<Self>) {
        let mut child = self.child;
        Self::interrupt(&mut child);

        // Reap in the background; kill if SIGINT was not enough.
        tokio::spawn(async move {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("transcoder exited with {}", status),
                Ok(Err(err)) => warn!("failed to wait for transcoder: {}", err),
                Err(_) => {
                    warn!("transcoder ignored SIGINT, killing it");
                    let _ = child.kill().await;
                }
            }
        });
    }
}
