//! Subprocess-based transformer spawning ffprobe/ffmpeg.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::exec::MediaTransformer;

/// Runs transformations by invoking the ffmpeg tool family. Frame grabs and
/// previews land in a per-call temp directory that is dropped (and removed)
/// when the call returns, success or not.
#[derive(Clone)]
pub struct CommandTransformer {
    ffprobe_bin: String,
    ffmpeg_bin: String,
}

impl Default for CommandTransformer {
    fn default() -> Self {
        Self {
            ffprobe_bin: "ffprobe".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

impl CommandTransformer {
    pub fn new(ffprobe_bin: impl Into<String>, ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!(target: "relay::exec", %program, ?args, "spawning transformation command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RelayError::Command(format!("failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Command(format!(
                "{program} exited with status {exit_code}: {}",
                stderr.lines().take(10).collect::<Vec<_>>().join("\n")
            )));
        }

        Ok(output.stdout)
    }

    async fn probe(&self, path: &Path, args: &[&str]) -> Result<serde_json::Value> {
        let path = path.to_string_lossy();
        let mut full_args = vec!["-v", "error", "-print_format", "json"];
        full_args.extend_from_slice(args);
        full_args.push(path.as_ref());
        let stdout = self.run(&self.ffprobe_bin, &full_args).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }
}

#[async_trait]
impl MediaTransformer for CommandTransformer {
    async fn scan(&self, path: &Path) -> Result<serde_json::Value> {
        self.probe(path, &["-show_format", "-show_streams"]).await
    }

    async fn metadata(&self, path: &Path) -> Result<serde_json::Value> {
        self.probe(path, &["-show_format"]).await
    }

    async fn thumbnail(&self, path: &Path) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()?;
        let out = workdir.path().join("thumb.jpg");
        let input = path.to_string_lossy();
        let output = out.to_string_lossy();

        self.run(
            &self.ffmpeg_bin,
            &[
                "-y",
                "-i",
                input.as_ref(),
                "-frames:v",
                "1",
                "-vf",
                "scale=256:-1",
                output.as_ref(),
            ],
        )
        .await?;

        let bytes = tokio::fs::read(&out).await?;
        Ok(bytes)
        // workdir drops here, removing the frame regardless of outcome
    }

    async fn preview(&self, path: &Path) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()?;
        let out = workdir.path().join("preview.webm");
        let input = path.to_string_lossy();
        let output = out.to_string_lossy();

        self.run(
            &self.ffmpeg_bin,
            &[
                "-y",
                "-i",
                input.as_ref(),
                "-vf",
                "scale=320:-1",
                "-b:v",
                "500k",
                "-an",
                output.as_ref(),
            ],
        )
        .await?;

        let bytes = tokio::fs::read(&out).await?;
        Ok(bytes)
    }
}

impl fmt::Debug for CommandTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTransformer")
            .field("ffprobe_bin", &self.ffprobe_bin)
            .field("ffmpeg_bin", &self.ffmpeg_bin)
            .finish()
    }
}
