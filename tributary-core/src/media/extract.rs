//! Single-stream extraction with `ffmpeg`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::runner::{ToolError, ToolInvocation, ToolRunner};
use super::{StreamDescriptor, StreamKind, TargetFormat};
use crate::config::MediaConfig;
use crate::storage::remove_file_quietly;

/// Errors raised while extracting a stream.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Source file {path} no longer exists")]
    SourceMissing { path: PathBuf },

    #[error("Streams of kind {kind} cannot be extracted")]
    Unsupported { kind: StreamKind },

    #[error("ffmpeg could not run: {0}")]
    Tool(#[from] ToolError),

    #[error("ffmpeg exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },

    #[error("ffmpeg reported success but {path} was not written")]
    MissingOutput { path: PathBuf },
}

impl ExtractError {
    /// Whether the source file is gone, which makes any retry pointless.
    pub fn is_source_missing(&self) -> bool {
        matches!(self, ExtractError::SourceMissing { .. })
    }

    /// Whether ffmpeg was killed for exceeding its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExtractError::Tool(e) if e.is_timeout())
    }
}

/// Output path for an extraction: the source's base name with the target
/// extension, next to the source.
pub fn output_path(source: &Path, target: TargetFormat, index: u32) -> PathBuf {
    let candidate = source.with_extension(target.extension());
    if candidate == source {
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());
        source.with_file_name(format!("{stem}.{index}.{}", target.extension()))
    } else {
        candidate
    }
}

/// Codec arguments: a verbatim copy when the stream already uses the target's
/// native codec, a transcode otherwise.
pub fn codec_args(codec_name: &str, target: TargetFormat) -> Vec<&'static str> {
    if codec_name.eq_ignore_ascii_case(target.native_codec()) {
        return vec!["-c", "copy"];
    }
    match target {
        TargetFormat::Mp3 => vec!["-c:a", target.encoder(), "-q:a", "2"],
        TargetFormat::Srt => vec!["-c:s", target.encoder()],
    }
}

/// Pulls one selected stream out of a staged source file.
#[derive(Clone)]
pub struct ExtractionEngine {
    runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl ExtractionEngine {
    pub fn new(runner: Arc<dyn ToolRunner>, config: &MediaConfig) -> Self {
        Self {
            runner,
            ffmpeg: config.ffmpeg_path.clone(),
            timeout: config.extract_timeout,
        }
    }

    /// Extracts `descriptor` and returns the output path.
    ///
    /// The source is never deleted here. Partial output is removed on
    /// failure.
    ///
    /// # Errors
    ///
    /// - `ExtractError::SourceMissing` - Source was deleted before extraction
    /// - `ExtractError::Unsupported` - Stream is neither audio nor subtitle
    /// - `ExtractError::Tool` - ffmpeg missing or timed out
    /// - `ExtractError::Failed` - ffmpeg exited non-zero
    /// - `ExtractError::MissingOutput` - ffmpeg wrote nothing
    pub async fn extract(&self, descriptor: &StreamDescriptor) -> Result<PathBuf, ExtractError> {
        let target = descriptor
            .target_format()
            .ok_or(ExtractError::Unsupported {
                kind: descriptor.kind,
            })?;

        let source = &descriptor.source_path;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ExtractError::SourceMissing {
                path: source.clone(),
            });
        }

        let output = output_path(source, target, descriptor.index);
        let invocation = ToolInvocation::new(&self.ffmpeg, self.timeout)
            .args(["-hide_banner", "-y", "-i"])
            .arg(source)
            .arg("-map")
            .arg(format!("0:{}", descriptor.index))
            .args(codec_args(&descriptor.codec_name, target))
            .arg(&output);

        tracing::info!(
            "Extracting {} stream {} ({}) from {}",
            descriptor.kind,
            descriptor.index,
            descriptor.codec_name,
            source.display()
        );

        let result = match self.runner.run(&invocation).await {
            Ok(run) if run.success() => {
                if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                    Ok(output.clone())
                } else {
                    Err(ExtractError::MissingOutput {
                        path: output.clone(),
                    })
                }
            }
            Ok(run) => Err(ExtractError::Failed {
                status: run.status,
                stderr: run.stderr,
            }),
            Err(e) => Err(ExtractError::Tool(e)),
        };

        if let Err(e) = &result {
            tracing::warn!("Extraction of stream {} failed: {}", descriptor.index, e);
            remove_file_quietly(&output).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::testing::ScriptedToolRunner;

    fn descriptor(source: &Path, index: u32, kind: StreamKind, codec: &str) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind,
            codec_name: codec.to_string(),
            language: "eng".to_string(),
            source_path: source.to_path_buf(),
            source_name: "movie.mkv".to_string(),
            requester_id: UserId::new(1),
            requester_name: "Ada".to_string(),
        }
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("/w/movie.mkv"), TargetFormat::Mp3, 1),
            PathBuf::from("/w/movie.mp3")
        );
        assert_eq!(
            output_path(Path::new("/w/movie.mp3"), TargetFormat::Mp3, 1),
            PathBuf::from("/w/movie.1.mp3")
        );
    }

    #[test]
    fn test_codec_selection() {
        assert_eq!(codec_args("mp3", TargetFormat::Mp3), vec!["-c", "copy"]);
        assert_eq!(
            codec_args("aac", TargetFormat::Mp3),
            vec!["-c:a", "libmp3lame", "-q:a", "2"]
        );
        assert_eq!(codec_args("subrip", TargetFormat::Srt), vec!["-c", "copy"]);
        assert_eq!(codec_args("ass", TargetFormat::Srt), vec!["-c:s", "srt"]);
    }

    #[tokio::test]
    async fn test_extract_audio() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("movie.mkv");
        std::fs::write(&source, b"media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        let engine = ExtractionEngine::new(runner.clone(), &MediaConfig::default());

        let output = engine
            .extract(&descriptor(&source, 1, StreamKind::Audio, "aac"))
            .await
            .unwrap();

        assert_eq!(output, temp_dir.path().join("movie.mp3"));
        assert!(output.exists());
        let command = runner.invocations()[0].command_line();
        assert!(command.contains("-map 0:1 -c:a libmp3lame -q:a 2"));
    }

    #[tokio::test]
    async fn test_failed_extraction_keeps_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("movie.mkv");
        std::fs::write(&source, b"media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        runner.fail_extraction("Stream map '0:9' matches no streams");
        let engine = ExtractionEngine::new(runner, &MediaConfig::default());

        let result = engine
            .extract(&descriptor(&source, 9, StreamKind::Subtitle, "subrip"))
            .await;

        assert!(matches!(result, Err(ExtractError::Failed { .. })));
        assert!(!result.unwrap_err().is_timeout());
        assert!(source.exists());
        assert!(!temp_dir.path().join("movie.srt").exists());
    }

    #[tokio::test]
    async fn test_timed_out_extraction_removes_partial_output() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("movie.mkv");
        std::fs::write(&source, b"media").unwrap();

        let runner = Arc::new(ScriptedToolRunner::new());
        runner.time_out_extraction();
        let engine = ExtractionEngine::new(runner, &MediaConfig::default());

        let error = engine
            .extract(&descriptor(&source, 1, StreamKind::Audio, "aac"))
            .await
            .unwrap_err();

        assert!(error.is_timeout());
        assert!(source.exists());
        assert!(!temp_dir.path().join("movie.mp3").exists());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = temp_dir.path().join("gone.mkv");
        let engine = ExtractionEngine::new(
            Arc::new(ScriptedToolRunner::new()),
            &MediaConfig::default(),
        );

        let error = engine
            .extract(&descriptor(&source, 1, StreamKind::Audio, "aac"))
            .await
            .unwrap_err();
        assert!(error.is_source_missing());
    }
}
