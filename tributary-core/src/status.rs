//! Human-readable status of transfers and the host.

use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Disks, System};
use tokio::sync::watch;

use crate::admission::AdmissionController;
use crate::config::StatusConfig;
use crate::format::format_bytes;
use crate::ids::MessageRef;
use crate::progress::{ActiveTransfer, Direction, ProgressRecord, ProgressRegistry};
use crate::transport::{Button, CallbackAction, Keyboard, MessagingTransport, TransportError};

/// Point-in-time host resource usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSnapshot {
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of host resource figures.
pub trait HostMetrics: Send + Sync {
    fn snapshot(&self) -> HostSnapshot;
}

/// Production metrics backed by `sysinfo`.
pub struct SysinfoMetrics {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SysinfoMetrics {
    /// Reports disk usage for the mount holding `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            disk_path: disk_path.into(),
        }
    }
}

impl HostMetrics for SysinfoMetrics {
    fn snapshot(&self) -> HostSnapshot {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            let memory_percent = if system.total_memory() == 0 {
                0.0
            } else {
                (system.used_memory() as f64 * 100.0 / system.total_memory() as f64) as f32
            };
            (system.global_cpu_info().cpu_usage(), memory_percent)
        };

        let resolved =
            std::fs::canonicalize(&self.disk_path).unwrap_or_else(|_| self.disk_path.clone());
        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| (disk.total_space(), disk.available_space()))
            .unwrap_or((0, 0));

        HostSnapshot {
            disk_total,
            disk_used: disk_total.saturating_sub(disk_free),
            disk_free,
            cpu_percent,
            memory_percent,
        }
    }
}

/// Renders the live status message.
#[derive(Clone)]
pub struct StatusReporter {
    progress: ProgressRegistry,
    admission: AdmissionController,
    metrics: Arc<dyn HostMetrics>,
}

impl StatusReporter {
    pub fn new(
        progress: ProgressRegistry,
        admission: AdmissionController,
        metrics: Arc<dyn HostMetrics>,
    ) -> Self {
        Self {
            progress,
            admission,
            metrics,
        }
    }

    /// Current status text: transfers by direction, then host usage.
    ///
    /// Host figures are gathered on the blocking pool.
    pub async fn render(&self) -> String {
        let host = self.host_snapshot().await;
        self.compose(&host)
    }

    async fn host_snapshot(&self) -> HostSnapshot {
        let metrics = Arc::clone(&self.metrics);
        match tokio::task::spawn_blocking(move || metrics.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Host metrics unavailable: {}", e);
                HostSnapshot::default()
            }
        }
    }

    fn compose(&self, host: &HostSnapshot) -> String {
        let entries = self.progress.snapshot();
        let mut text = String::new();

        render_direction(&mut text, &entries, Direction::Download, "Downloads");
        render_direction(&mut text, &entries, Direction::Upload, "Uploads");

        let _ = writeln!(text, "Disk Usage:");
        let _ = writeln!(text, "• Total: {}", format_bytes(host.disk_total));
        let _ = writeln!(text, "• Used: {}", format_bytes(host.disk_used));
        let _ = writeln!(text, "• Free: {}", format_bytes(host.disk_free));
        let _ = writeln!(text);
        let _ = writeln!(text, "System Usage:");
        let _ = writeln!(text, "• CPU Usage: {:.1}%", host.cpu_percent);
        let _ = writeln!(text, "• RAM Usage: {:.1}%", host.memory_percent);
        let _ = write!(
            text,
            "• Transfer slots: {}/{}",
            self.admission.active_slots(),
            self.admission.config().global_capacity()
        );
        text
    }

    /// Keeps `message` showing the current status until the watch period
    /// ends, the message disappears or `shutdown` fires.
    ///
    /// Unchanged content is skipped and rate limits are honoured.
    pub async fn watch(
        &self,
        transport: Arc<dyn MessagingTransport>,
        message: MessageRef,
        config: StatusConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let deadline = Instant::now() + config.watch_duration;
        let keyboard = status_keyboard();

        while Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep(config.refresh_interval) => {}
                _ = shutdown.changed() => break,
            }

            let text = self.render().await;
            match transport.edit_message(message, &text, Some(&keyboard)).await {
                Ok(()) | Err(TransportError::NotModified) => {}
                Err(TransportError::MessageGone) => {
                    tracing::debug!("Status message {} is gone, stopping updates", message);
                    return;
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    tracing::debug!("Status updates rate limited for {:?}", retry_after);
                    tokio::time::sleep(retry_after.min(Duration::from_secs(60))).await;
                }
                Err(e) => tracing::warn!("Status update for {} failed: {}", message, e),
            }
        }
        tracing::debug!("Stopped status updates for {}", message);
    }
}

/// Keyboard attached to status messages.
pub fn status_keyboard() -> Keyboard {
    Keyboard::new().row(vec![Button::new("Close", CallbackAction::Close)])
}

fn render_direction(
    text: &mut String,
    entries: &[(ActiveTransfer, Option<ProgressRecord>)],
    direction: Direction,
    title: &str,
) {
    let matching: Vec<_> = entries
        .iter()
        .filter(|(transfer, _)| transfer.direction == direction)
        .collect();

    if matching.is_empty() {
        let _ = writeln!(text, "No {} in progress.", title.to_lowercase());
        let _ = writeln!(text);
        return;
    }

    let _ = writeln!(text, "Ongoing {title}:");
    for (transfer, record) in matching {
        match record {
            Some(record) => {
                let _ = writeln!(text, "• {}", transfer.file_name);
                let _ = writeln!(
                    text,
                    "  - Progress: {}/{} ({:.2}%)",
                    record.current, record.total, record.percent
                );
                let _ = writeln!(text, "  - Speed: {}", record.speed);
                let _ = writeln!(text, "  - ETA: {}", record.eta);
            }
            None => {
                let _ = writeln!(text, "• {}", transfer.file_name);
                let _ = writeln!(text, "  - Progress: Initializing...");
            }
        }
    }
    let _ = writeln!(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::ids::{ChatId, CorrelationId, MessageId};
    use crate::testing::{FixedDiskSpace, ScriptedTransport, StaticHostMetrics};

    fn reporter(progress: &ProgressRegistry) -> StatusReporter {
        let admission = AdmissionController::new(
            AdmissionConfig::default(),
            "/tmp",
            Arc::new(FixedDiskSpace::new(u64::MAX)),
        );
        StatusReporter::new(
            progress.clone(),
            admission,
            Arc::new(StaticHostMetrics::default()),
        )
    }

    fn message(id: i64) -> MessageRef {
        MessageRef::new(ChatId::new(1), MessageId::new(id))
    }

    #[tokio::test]
    async fn test_render_idle() {
        let progress = ProgressRegistry::new();
        let text = reporter(&progress).render().await;

        assert!(text.contains("No downloads in progress."));
        assert!(text.contains("No uploads in progress."));
        assert!(text.contains("• Total: 100.00 GB"));
        assert!(text.contains("• CPU Usage: 12.5%"));
        assert!(text.contains("• Transfer slots: 0/10"));
    }

    struct BrokenMetrics;

    impl HostMetrics for BrokenMetrics {
        fn snapshot(&self) -> HostSnapshot {
            panic!("/proc unreadable");
        }
    }

    #[tokio::test]
    async fn test_render_survives_broken_metrics() {
        let progress = ProgressRegistry::new();
        let admission = AdmissionController::new(
            AdmissionConfig::default(),
            "/tmp",
            Arc::new(FixedDiskSpace::new(u64::MAX)),
        );
        let reporter = StatusReporter::new(progress, admission, Arc::new(BrokenMetrics));

        let text = reporter.render().await;

        assert!(text.contains("• Total: 0.00 B"));
        assert!(text.contains("• CPU Usage: 0.0%"));
        assert!(text.contains("• Transfer slots: 0/10"));
    }

    #[tokio::test]
    async fn test_render_transfers() {
        let progress = ProgressRegistry::new();
        let download = progress
            .begin(
                &CorrelationId::new("1-1"),
                Direction::Download,
                "movie.mkv",
                1_048_576,
                message(1),
            )
            .unwrap();
        let _upload = progress
            .begin(
                &CorrelationId::new("1-2"),
                Direction::Upload,
                "song.mp3",
                100,
                message(2),
            )
            .unwrap();
        download.callback(Duration::ZERO)(512_000, 1_048_576);

        let text = reporter(&progress).render().await;

        assert!(text.contains("Ongoing Downloads:\n• movie.mkv"));
        assert!(text.contains("Progress: 500.00 KB/1.00 MB (48.83%)"));
        assert!(text.contains("Ongoing Uploads:\n• song.mp3\n  - Progress: Initializing..."));
    }

    #[tokio::test]
    async fn test_watch_stops_when_message_gone() {
        let progress = ProgressRegistry::new();
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_edit_error(TransportError::NotModified);
        transport.script_edit_error(TransportError::MessageGone);
        let (_tx, rx) = watch::channel(false);

        let config = StatusConfig {
            refresh_interval: Duration::from_millis(1),
            watch_duration: Duration::from_secs(30),
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            reporter(&progress).watch(transport.clone(), message(9), config, rx),
        )
        .await
        .unwrap();

        assert_eq!(transport.edit_attempts(), 2);
    }

    #[tokio::test]
    async fn test_watch_stops_on_shutdown() {
        let progress = ProgressRegistry::new();
        let transport = Arc::new(ScriptedTransport::new());
        let (tx, rx) = watch::channel(false);

        let config = StatusConfig {
            refresh_interval: Duration::from_secs(60),
            watch_duration: Duration::from_secs(600),
        };
        let reporter = reporter(&progress);
        let handle = tokio::spawn({
            let transport = transport.clone();
            async move { reporter.watch(transport, message(9), config, rx).await }
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transport.edit_attempts(), 0);
    }
}
