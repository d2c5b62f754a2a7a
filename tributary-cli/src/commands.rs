//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tributary_core::media::ProcessToolRunner;
use tributary_core::pipeline::{PipelineCoordinator, PipelineServices, PipelineState};
use tributary_core::status::SysinfoMetrics;
use tributary_core::storage::SysinfoDiskSpace;
use tributary_core::transport::{CallbackAction, CallbackQuery, InboundFile, LocalTransport};
use tributary_core::{ChatId, CorrelationId, MessageId, MessageRef, Requester, TributaryConfig, UserId};
use uuid::Uuid;

/// Identity the CLI acts as; it is always the configured owner.
const CLI_USER: i64 = 0;
const CLI_CHAT: i64 = 0;

/// How long a single stage may take before the CLI gives up.
const STAGE_TIMEOUT: Duration = Duration::from_secs(3600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List the audio and subtitle streams of a video file
    Probe {
        /// Video file to inspect
        file: PathBuf,
    },
    /// Extract one stream from a video file into the outbox
    Extract {
        /// Video file to extract from
        file: PathBuf,
        /// Stream index as listed by `probe`
        #[arg(short, long)]
        stream: u32,
        /// Directory receiving the extracted file
        #[arg(short, long, default_value = "outbox")]
        outbox: PathBuf,
    },
    /// Show disk, CPU and memory usage
    Status,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of whichever pipeline stage the command could not
/// complete.
pub async fn handle_command(command: Commands, work_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = TributaryConfig::from_env();
    config.access.owner = Some(UserId::new(CLI_USER));
    if let Some(work_dir) = work_dir {
        config.storage.work_dir = work_dir;
    }

    match command {
        Commands::Probe { file } => probe(config, &file).await,
        Commands::Extract {
            file,
            stream,
            outbox,
        } => extract(config, &file, stream, outbox).await,
        Commands::Status => show_status(config).await,
    }
}

/// Print the selectable streams of `file`
///
/// # Errors
/// - Pipeline did not reach stream selection
pub async fn probe(config: TributaryConfig, file: &Path) -> anyhow::Result<()> {
    let session = Session::start(config, PathBuf::from("outbox")).await?;
    let correlation_id = session.stage(file).await?;

    let bucket = session
        .coordinator
        .selection(&correlation_id)
        .context("No streams were offered")?;
    println!("Streams in {}:", bucket.source_name);
    for stream in bucket.streams() {
        println!("  {:>3}  {:<8}  {}", stream.index, stream.kind, stream.label());
    }

    session.press(CallbackAction::Cancel { correlation_id }).await;
    session.finish().await;
    Ok(())
}

/// Extract stream `index` of `file` into `outbox`
///
/// # Errors
/// - Staging, extraction or delivery failed
pub async fn extract(
    config: TributaryConfig,
    file: &Path,
    index: u32,
    outbox: PathBuf,
) -> anyhow::Result<()> {
    let session = Session::start(config, outbox.clone()).await?;
    let correlation_id = session.stage(file).await?;

    session
        .press(CallbackAction::Select {
            correlation_id: correlation_id.clone(),
            index,
        })
        .await;
    let outcome = session
        .coordinator
        .wait_until(&correlation_id, STAGE_TIMEOUT, |state| {
            state.is_terminal() || matches!(state, PipelineState::Failed(_))
        })
        .await;
    session.finish().await;

    match outcome {
        Some(PipelineState::Succeeded) => {
            println!("Stream {index} written to {}", outbox.display());
            Ok(())
        }
        Some(state) => bail!("Extraction of stream {index} ended {state}"),
        None => bail!("Extraction of stream {index} timed out"),
    }
}

/// Print host and transfer status
///
/// # Errors
/// - Working directory cannot be prepared
pub async fn show_status(config: TributaryConfig) -> anyhow::Result<()> {
    let session = Session::start(config, PathBuf::from("outbox")).await?;
    println!("{}", session.coordinator.status_report().await);
    session.finish().await;
    Ok(())
}

/// A coordinator running on the local transport.
struct Session {
    coordinator: Arc<PipelineCoordinator>,
}

impl Session {
    async fn start(config: TributaryConfig, outbox: PathBuf) -> anyhow::Result<Self> {
        let services = PipelineServices {
            transport: Arc::new(LocalTransport::new(outbox)),
            tools: Arc::new(ProcessToolRunner::new(config.media.max_stderr_bytes)),
            disk: Arc::new(SysinfoDiskSpace),
            metrics: Arc::new(SysinfoMetrics::new(config.storage.work_dir.clone())),
        };
        let coordinator = PipelineCoordinator::start(config, services).await?;
        Ok(Self { coordinator })
    }

    /// Submits `file`, confirms it and waits until its streams are offered.
    async fn stage(&self, file: &Path) -> anyhow::Result<CorrelationId> {
        let metadata = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("Cannot read {}", file.display()))?;
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Path has no file name")?;

        let inbound = InboundFile {
            file_id: file.to_string_lossy().into_owned(),
            file_name,
            declared_size: metadata.len(),
            mime_type: None,
            message: MessageRef::new(ChatId::new(CLI_CHAT), MessageId::new(1)),
        };
        let Some(correlation_id) = self
            .coordinator
            .handle_inbound_file(requester(), inbound)
            .await?
        else {
            bail!("{} is not a video file", file.display());
        };

        self.press(CallbackAction::Proceed {
            correlation_id: correlation_id.clone(),
        })
        .await;
        let state = self
            .coordinator
            .wait_until(&correlation_id, STAGE_TIMEOUT, |state| {
                state == PipelineState::AwaitingSelection || state.is_terminal()
            })
            .await;

        match state {
            Some(PipelineState::AwaitingSelection) => Ok(correlation_id),
            Some(state) => bail!("Could not stage {}: {state}", file.display()),
            None => bail!("Staging {} timed out", file.display()),
        }
    }

    async fn press(&self, action: CallbackAction) {
        let query = CallbackQuery {
            id: Uuid::new_v4().to_string(),
            from: requester(),
            message: MessageRef::new(ChatId::new(CLI_CHAT), MessageId::new(1)),
            payload: action.encode(),
        };
        self.coordinator.handle_callback(query).await;
    }

    async fn finish(self) {
        let report = self.coordinator.shutdown(SHUTDOWN_GRACE).await;
        tracing::debug!("CLI session closed: {:?}", report);
    }
}

fn requester() -> Requester {
    Requester::new(UserId::new(CLI_USER), "cli")
}
