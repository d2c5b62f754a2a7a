//! Stream discovery with `ffprobe`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::runner::{ToolError, ToolInvocation, ToolRunner};
use super::{StreamDescriptor, StreamKind};
use crate::config::MediaConfig;
use crate::ids::Requester;
use crate::storage::remove_file_quietly;

/// Errors raised while probing a staged file.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("ffprobe could not run: {0}")]
    Tool(#[from] ToolError),

    #[error("ffprobe exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },

    #[error("Unreadable ffprobe output: {reason}")]
    Parse { reason: String },
}

impl ProbeError {
    /// Whether ffprobe was killed for exceeding its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Tool(e) if e.is_timeout())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

/// Turns ffprobe's JSON stream list into selectable descriptors.
///
/// Only audio and subtitle streams are kept. A stream without a language
/// tag uses its index as the language.
///
/// # Errors
///
/// - `ProbeError::Parse` - Output is not ffprobe JSON
pub fn parse_streams(
    json: &[u8],
    source_path: &Path,
    source_name: &str,
    requester: &Requester,
) -> Result<Vec<StreamDescriptor>, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(json).map_err(|e| ProbeError::Parse {
        reason: e.to_string(),
    })?;

    let descriptors = output
        .streams
        .into_iter()
        .filter_map(|stream| {
            let kind = StreamKind::from_codec_type(stream.codec_type.as_deref().unwrap_or(""));
            if kind == StreamKind::Other {
                return None;
            }

            let language = stream
                .tags
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("language"))
                .map(|(_, value)| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| stream.index.to_string());

            Some(StreamDescriptor {
                index: stream.index,
                kind,
                codec_name: stream.codec_name.unwrap_or_else(|| "unknown".to_string()),
                language,
                source_path: source_path.to_path_buf(),
                source_name: source_name.to_string(),
                requester_id: requester.id,
                requester_name: requester.display_name(),
            })
        })
        .collect();

    Ok(descriptors)
}

/// Lists the selectable streams of staged files.
#[derive(Clone)]
pub struct StreamProber {
    runner: Arc<dyn ToolRunner>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl StreamProber {
    pub fn new(runner: Arc<dyn ToolRunner>, config: &MediaConfig) -> Self {
        Self {
            runner,
            ffprobe: config.ffprobe_path.clone(),
            timeout: config.probe_timeout,
        }
    }

    /// Probes `path` for audio and subtitle streams.
    ///
    /// An empty result is valid: the file simply has nothing to extract.
    /// On any failure the source file is deleted before returning.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Tool` - ffprobe missing or timed out
    /// - `ProbeError::Failed` - ffprobe exited non-zero
    /// - `ProbeError::Parse` - Output could not be parsed
    pub async fn probe(
        &self,
        path: &Path,
        requester: &Requester,
        source_name: &str,
    ) -> Result<Vec<StreamDescriptor>, ProbeError> {
        let result = self.run_probe(path, requester, source_name).await;

        match &result {
            Ok(streams) => tracing::info!(
                "Probed {}: {} selectable streams",
                path.display(),
                streams.len()
            ),
            Err(e) => {
                tracing::warn!("Probe of {} failed: {}", path.display(), e);
                remove_file_quietly(path).await;
            }
        }
        result
    }

    async fn run_probe(
        &self,
        path: &Path,
        requester: &Requester,
        source_name: &str,
    ) -> Result<Vec<StreamDescriptor>, ProbeError> {
        let invocation = ToolInvocation::new(&self.ffprobe, self.timeout)
            .args([
                "-hide_banner",
                "-v",
                "error",
                "-show_streams",
                "-print_format",
                "json",
            ])
            .arg(path);

        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            return Err(ProbeError::Failed {
                status: output.status,
                stderr: output.stderr,
            });
        }

        parse_streams(&output.stdout, path, source_name, requester)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::testing::{ScriptedToolRunner, fixture_probe_json};

    fn requester() -> Requester {
        Requester::new(UserId::new(42), "Ada")
    }

    #[test]
    fn test_parse_fixture_streams() {
        let streams = parse_streams(
            fixture_probe_json().as_bytes(),
            Path::new("/work/movie.mkv"),
            "movie.mkv",
            &requester(),
        )
        .unwrap();

        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].index, 1);
        assert_eq!(streams[0].kind, StreamKind::Audio);
        assert_eq!(streams[0].language, "eng");
        assert_eq!(streams[1].index, 2);
        assert_eq!(streams[1].kind, StreamKind::Subtitle);
        assert_eq!(streams[1].language, "spa");
        assert_eq!(streams[1].requester_name, "Ada");
    }

    #[test]
    fn test_missing_language_uses_index() {
        let json = br#"{"streams":[{"index":3,"codec_type":"audio","codec_name":"aac"},
            {"index":4,"codec_type":"subtitle","codec_name":"ass","tags":{"LANGUAGE":"fre"}}]}"#;

        let streams =
            parse_streams(json, Path::new("a.mkv"), "a.mkv", &requester()).unwrap();

        assert_eq!(streams[0].language, "3");
        assert_eq!(streams[1].language, "fre");
    }

    #[test]
    fn test_video_only_file_yields_empty_set() {
        let json = br#"{"streams":[{"index":0,"codec_type":"video","codec_name":"h264"}]}"#;
        let streams = parse_streams(json, Path::new("a.mp4"), "a.mp4", &requester()).unwrap();
        assert!(streams.is_empty());
    }

    #[test]
    fn test_garbage_output_is_parse_error() {
        let result = parse_streams(b"not json", Path::new("a.mp4"), "a.mp4", &requester());
        assert!(matches!(result, Err(ProbeError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_failed_probe_deletes_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("broken.mkv");
        std::fs::write(&source, b"not media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        runner.fail_probe("Invalid data found when processing input");
        let prober = StreamProber::new(runner.clone(), &MediaConfig::default());

        let result = prober.probe(&source, &requester(), "broken.mkv").await;

        assert!(matches!(result, Err(ProbeError::Failed { status: Some(1), .. })));
        assert!(!result.unwrap_err().is_timeout());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_timed_out_probe_is_reported_as_timeout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("huge.mkv");
        std::fs::write(&source, b"media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        runner.time_out_probe();
        let prober = StreamProber::new(runner, &MediaConfig::default());

        let error = prober
            .probe(&source, &requester(), "huge.mkv")
            .await
            .unwrap_err();

        assert!(error.is_timeout());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_probe_invocation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("movie.mkv");
        std::fs::write(&source, b"media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        let prober = StreamProber::new(runner.clone(), &MediaConfig::default());

        let streams = prober.probe(&source, &requester(), "movie.mkv").await.unwrap();

        assert_eq!(streams.len(), 2);
        assert!(source.exists());
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].command_line().contains("-show_streams -print_format json"));
    }
}
