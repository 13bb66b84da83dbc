//! FFmpeg subprocess driver.
//!
//! The core treats the transcoder as an opaque byte producer with a health
//! signal: spawn it positioned inside the lineup, read raw output, kill it
//! on teardown. Codec and filter-graph internals stay outside this crate.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use retrotv_core::models::{StreamMode, TranscodeConfig};

/// Everything needed to start one backing process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub ffmpeg_path: String,
    pub transcode: TranscodeConfig,
    pub mode: StreamMode,
    /// Media path or synthesized source for the item currently playing
    pub input: String,
    /// Seek offset into that item
    pub seek_ms: i64,
    /// Session working directory (HLS segments land here)
    pub workdir: PathBuf,
}

/// A running backing process: a chunked byte stream plus a kill switch.
#[async_trait]
pub trait StreamProcess: Send {
    /// Next chunk of raw output; `Ok(None)` at end of stream.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Terminate the process and reap it.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Spawning seam so session tests can script a fake producer.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<Box<dyn StreamProcess>>;
}

/// Real ffmpeg spawner.
pub struct FfmpegSpawner;

#[async_trait]
impl Spawner for FfmpegSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<Box<dyn StreamProcess>> {
        let mut cmd = Command::new(&request.ffmpeg_path);
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&request.workdir);

        build_args(&mut cmd, request);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout not piped"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        Ok(Box::new(FfmpegProcess {
            child,
            stdout,
            buf: vec![0u8; CHUNK_SIZE],
        }))
    }
}

const CHUNK_SIZE: usize = 64 * 1024;

fn build_args(cmd: &mut Command, request: &SpawnRequest) {
    let seek_secs = request.seek_ms as f64 / 1000.0;
    cmd.args(["-hide_banner", "-loglevel", "warning"])
        .args(["-re", "-ss", &format!("{seek_secs:.3}")]);

    // Offline/flex items synthesize their source instead of reading a file.
    if let Some(filter) = request.input.strip_prefix("lavfi:") {
        cmd.args(["-f", "lavfi", "-i", filter]);
    } else {
        cmd.args(["-i", &request.input]);
    }

    cmd.args(["-s", &request.transcode.resolution])
        .args(["-c:v", &request.transcode.video_codec])
        .args(["-c:a", &request.transcode.audio_codec])
        .args(["-b:v", &format!("{}k", request.transcode.video_bitrate_kbps)])
        .args(["-b:a", &format!("{}k", request.transcode.audio_bitrate_kbps)])
        .args(["-bufsize", &format!("{}k", request.transcode.buffer_size_kb)]);

    match request.mode {
        StreamMode::Hls | StreamMode::HlsSlower => {
            cmd.args(["-f", "mpegts", "pipe:1"]);
        }
        StreamMode::Concat => {
            cmd.args(["-f", "mpegts", "pipe:1"]);
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "ffmpeg", "{line}");
    }
}

struct FfmpegProcess {
    child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

#[async_trait]
impl StreamProcess for FfmpegProcess {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let n = self.stdout.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_places_seek_before_input() {
        let request = SpawnRequest {
            ffmpeg_path: "ffmpeg".to_string(),
            transcode: TranscodeConfig::default(),
            mode: StreamMode::Concat,
            input: "/library/show/ep1.mkv".to_string(),
            seek_ms: 90_500,
            workdir: PathBuf::from("/tmp"),
        };
        let mut cmd = Command::new(&request.ffmpeg_path);
        build_args(&mut cmd, &request);

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let ss = args.iter().position(|a| a == "-ss").expect("-ss present");
        let input = args.iter().position(|a| a == "-i").expect("-i present");
        assert!(ss < input, "seek must precede input for fast seeking");
        assert_eq!(args[ss + 1], "90.500");
        assert_eq!(args[input + 1], "/library/show/ep1.mkv");
    }

    #[test]
    fn test_build_args_expands_synthesized_sources() {
        let request = SpawnRequest {
            ffmpeg_path: "ffmpeg".to_string(),
            transcode: TranscodeConfig::default(),
            mode: StreamMode::Hls,
            input: "lavfi:smptebars=size=1920x1080:rate=30".to_string(),
            seek_ms: 0,
            workdir: PathBuf::from("/tmp"),
        };
        let mut cmd = Command::new(&request.ffmpeg_path);
        build_args(&mut cmd, &request);

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let fmt = args.iter().position(|a| a == "lavfi").expect("lavfi format");
        assert_eq!(args[fmt - 1], "-f");
        assert_eq!(args[fmt + 1], "-i");
        assert_eq!(args[fmt + 2], "smptebars=size=1920x1080:rate=30");
    }
}
