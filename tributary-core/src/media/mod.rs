//! Stream inspection and extraction through external media tools.
//!
//! `ffprobe` lists the streams of a staged file and `ffmpeg` pulls one of
//! them out. Both run through [`ToolRunner`] so tests can script their
//! output.

pub mod extract;
pub mod metadata;
pub mod probe;
pub mod runner;

use std::fmt;
use std::path::PathBuf;

pub use extract::{ExtractError, ExtractionEngine};
pub use metadata::{AudioMetadata, MetadataReader};
pub use probe::{ProbeError, StreamProber};
pub use runner::{ProcessToolRunner, ToolError, ToolInvocation, ToolOutput, ToolRunner};

use crate::ids::UserId;

/// Kind of an embedded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Subtitle,
    /// Video, data and attachment streams; never offered for selection
    Other,
}

impl StreamKind {
    /// Maps an ffprobe `codec_type` value.
    pub fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            _ => StreamKind::Other,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Subtitle => f.write_str("subtitle"),
            StreamKind::Other => f.write_str("other"),
        }
    }
}

/// Output container chosen for an extracted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Mp3,
    Srt,
}

impl TargetFormat {
    /// Target used for a stream kind; `None` for non-selectable kinds.
    pub fn for_kind(kind: StreamKind) -> Option<Self> {
        match kind {
            StreamKind::Audio => Some(TargetFormat::Mp3),
            StreamKind::Subtitle => Some(TargetFormat::Srt),
            StreamKind::Other => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Srt => "srt",
        }
    }

    /// Codec name ffprobe reports for streams that can be copied verbatim.
    pub fn native_codec(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Srt => "subrip",
        }
    }

    /// Encoder used when the source codec differs.
    pub fn encoder(self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "libmp3lame",
            TargetFormat::Srt => "srt",
        }
    }
}

/// One selectable stream of a probed source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Index understood by `-map 0:<index>`
    pub index: u32,
    pub kind: StreamKind,
    pub codec_name: String,
    /// Language tag, or the stream index when the file has none
    pub language: String,
    pub source_path: PathBuf,
    pub source_name: String,
    pub requester_id: UserId,
    pub requester_name: String,
}

impl StreamDescriptor {
    /// Button label shown to the requester, e.g. `ENG - aac`.
    pub fn label(&self) -> String {
        format!("{} - {}", self.language.to_uppercase(), self.codec_name)
    }

    pub fn target_format(&self) -> Option<TargetFormat> {
        TargetFormat::for_kind(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_mapping() {
        assert_eq!(StreamKind::from_codec_type("audio"), StreamKind::Audio);
        assert_eq!(StreamKind::from_codec_type("subtitle"), StreamKind::Subtitle);
        assert_eq!(StreamKind::from_codec_type("video"), StreamKind::Other);
        assert_eq!(StreamKind::from_codec_type("data"), StreamKind::Other);
    }

    #[test]
    fn test_target_formats() {
        assert_eq!(TargetFormat::for_kind(StreamKind::Audio), Some(TargetFormat::Mp3));
        assert_eq!(TargetFormat::for_kind(StreamKind::Other), None);
        assert_eq!(TargetFormat::Srt.extension(), "srt");
        assert_eq!(TargetFormat::Srt.native_codec(), "subrip");
    }
}
