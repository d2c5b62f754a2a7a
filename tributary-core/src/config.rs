//! Centralized configuration for Tributary.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ids::{ChatId, UserId};

/// Central configuration for all Tributary components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TributaryConfig {
    pub admission: AdmissionConfig,
    pub transfer: TransferConfig,
    pub media: MediaConfig,
    pub audit: AuditConfig,
    pub storage: StorageConfig,
    pub status: StatusConfig,
    pub access: AccessConfig,
}

/// Concurrency ceilings and the disk-space gate.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Concurrent transfers a single user may hold
    pub per_user_limit: usize,
    /// Global capacity as a multiple of the per-user limit
    pub capacity_factor: usize,
    /// Minimum free bytes on the storage mount to admit a transfer
    pub min_free_space: u64,
}

impl AdmissionConfig {
    /// Total number of slots across all users.
    pub fn global_capacity(&self) -> usize {
        self.per_user_limit.saturating_mul(self.capacity_factor)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            per_user_limit: 2,
            capacity_factor: 5,
            min_free_space: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// Inbound transfer retry and progress sampling behaviour.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Attempts before a download is reported as failed
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Minimum time between accepted progress samples
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// External media tool locations and invocation limits.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Upper bound for a single probe or metadata invocation
    pub probe_timeout: Duration,
    /// Upper bound for a single extraction
    pub extract_timeout: Duration,
    /// Keep only the last N bytes of stderr in errors and logs
    pub max_stderr_bytes: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            probe_timeout: Duration::from_secs(120),
            extract_timeout: Duration::from_secs(30 * 60), // 30 minutes
            max_stderr_bytes: 64 * 1024,
        }
    }
}

/// Audit destinations receiving copies of sources and extracted streams.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Receives a copy of every uploaded extraction
    pub chat: Option<ChatId>,
    /// Receives a copy of every source file; falls back to `chat`
    pub media_chat: Option<ChatId>,
    /// Pause before each duplicate-destination send
    pub pause: Duration,
    /// Signature appended to captions in the requester's chat
    pub signature: String,
}

impl AuditConfig {
    /// Destination for source media copies.
    pub fn media_destination(&self) -> Option<ChatId> {
        self.media_chat.or(self.chat)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            chat: None,
            media_chat: None,
            pause: Duration::from_secs(5),
            signature: "Extracted by Tributary".to_string(),
        }
    }
}

/// Working directory and staged file lifetime.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for staged downloads and extraction outputs
    pub work_dir: PathBuf,
    /// Open selections older than this are purged with their source file
    pub selection_ttl: Duration,
    /// How often expired selections are swept
    pub janitor_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("downloads"),
            selection_ttl: Duration::from_secs(24 * 3600),
            janitor_interval: Duration::from_secs(600),
        }
    }
}

/// Live status message behaviour.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Interval between status message edits
    pub refresh_interval: Duration,
    /// How long a status message keeps refreshing
    pub watch_duration: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            watch_duration: Duration::from_secs(600),
        }
    }
}

/// Who may submit files.
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub owner: Option<UserId>,
    pub authorized_users: HashSet<UserId>,
}

impl AccessConfig {
    /// Whether `user` may submit files.
    pub fn allows(&self, user: UserId) -> bool {
        self.owner == Some(user) || self.authorized_users.contains(&user)
    }
}

impl TributaryConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are logged and ignored so a typo never prevents
    /// start-up with sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(limit) = env_value::<usize>("TRIBUTARY_PER_USER_LIMIT") {
            config.admission.per_user_limit = limit;
        }
        if let Some(factor) = env_value::<usize>("TRIBUTARY_CAPACITY_FACTOR") {
            config.admission.capacity_factor = factor;
        }
        if let Some(megabytes) = env_value::<u64>("TRIBUTARY_MIN_FREE_MB") {
            config.admission.min_free_space = megabytes.saturating_mul(1024 * 1024);
        }

        if let Some(attempts) = env_value::<u32>("TRIBUTARY_MAX_ATTEMPTS") {
            config.transfer.max_attempts = attempts.max(1);
        }

        if let Some(path) = env_value::<PathBuf>("TRIBUTARY_FFMPEG") {
            config.media.ffmpeg_path = path;
        }
        if let Some(path) = env_value::<PathBuf>("TRIBUTARY_FFPROBE") {
            config.media.ffprobe_path = path;
        }
        if let Some(seconds) = env_value::<u64>("TRIBUTARY_EXTRACT_TIMEOUT_SECS") {
            config.media.extract_timeout = Duration::from_secs(seconds);
        }

        if let Some(chat) = env_value::<i64>("TRIBUTARY_LOG_CHANNEL") {
            config.audit.chat = Some(ChatId::new(chat));
        }
        if let Some(chat) = env_value::<i64>("TRIBUTARY_LOG_MEDIA_CHANNEL") {
            config.audit.media_chat = Some(ChatId::new(chat));
        }

        if let Some(path) = env_value::<PathBuf>("TRIBUTARY_WORK_DIR") {
            config.storage.work_dir = path;
        }

        if let Some(owner) = env_value::<i64>("TRIBUTARY_OWNER_ID") {
            config.access.owner = Some(UserId::new(owner));
        }
        if let Ok(users) = std::env::var("TRIBUTARY_AUTH_USERS") {
            config.access.authorized_users = parse_user_list(&users);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            transfer: TransferConfig {
                max_attempts: 3,
                retry_delay: Duration::ZERO,
                progress_interval: Duration::ZERO,
            },
            media: MediaConfig {
                probe_timeout: Duration::from_secs(5),
                extract_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            audit: AuditConfig {
                pause: Duration::ZERO,
                ..Default::default()
            },
            status: StatusConfig {
                refresh_interval: Duration::from_millis(10),
                watch_duration: Duration::from_millis(100),
            },
            admission: AdmissionConfig {
                min_free_space: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {name}: {trimmed:?}");
            None
        }
    }
}

fn parse_user_list(raw: &str) -> HashSet<UserId> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i64>() {
            Ok(id) => Some(UserId::new(id)),
            Err(_) => {
                tracing::warn!("Ignoring invalid user id in TRIBUTARY_AUTH_USERS: {entry:?}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TributaryConfig::default();

        assert_eq!(config.admission.per_user_limit, 2);
        assert_eq!(config.admission.global_capacity(), 10);
        assert_eq!(config.transfer.max_attempts, 5);
        assert_eq!(config.transfer.progress_interval, Duration::from_secs(5));
        assert_eq!(config.media.ffprobe_path, PathBuf::from("ffprobe"));
        assert_eq!(config.status.refresh_interval, Duration::from_secs(10));
        assert!(config.audit.chat.is_none());
    }

    #[test]
    fn test_media_audit_falls_back_to_audit_chat() {
        let mut audit = AuditConfig {
            chat: Some(ChatId::new(-100)),
            ..Default::default()
        };
        assert_eq!(audit.media_destination(), Some(ChatId::new(-100)));

        audit.media_chat = Some(ChatId::new(-200));
        assert_eq!(audit.media_destination(), Some(ChatId::new(-200)));
    }

    #[test]
    fn test_access_allows_owner_and_authorized_users() {
        let access = AccessConfig {
            owner: Some(UserId::new(1)),
            authorized_users: [UserId::new(2)].into_iter().collect(),
        };

        assert!(access.allows(UserId::new(1)));
        assert!(access.allows(UserId::new(2)));
        assert!(!access.allows(UserId::new(3)));
    }

    #[test]
    fn test_parse_user_list_skips_garbage() {
        let users = parse_user_list("1, 2,,abc, 3 ");
        assert_eq!(users.len(), 3);
        assert!(users.contains(&UserId::new(3)));
    }

    #[test]
    fn test_testing_config_has_no_delays() {
        let config = TributaryConfig::for_testing();
        assert_eq!(config.transfer.retry_delay, Duration::ZERO);
        assert_eq!(config.audit.pause, Duration::ZERO);
        assert_eq!(config.admission.min_free_space, 0);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("TRIBUTARY_PER_USER_LIMIT", "4");
            std::env::set_var("TRIBUTARY_MAX_ATTEMPTS", "0");
            std::env::set_var("TRIBUTARY_LOG_CHANNEL", "-1009");
            std::env::set_var("TRIBUTARY_AUTH_USERS", "11,12");
            std::env::set_var("TRIBUTARY_CAPACITY_FACTOR", "lots");
        }

        let config = TributaryConfig::from_env();

        assert_eq!(config.admission.per_user_limit, 4);
        assert_eq!(config.admission.capacity_factor, 5);
        assert_eq!(config.transfer.max_attempts, 1);
        assert_eq!(config.audit.chat, Some(ChatId::new(-1009)));
        assert!(config.access.allows(UserId::new(12)));

        // Cleanup
        unsafe {
            std::env::remove_var("TRIBUTARY_PER_USER_LIMIT");
            std::env::remove_var("TRIBUTARY_MAX_ATTEMPTS");
            std::env::remove_var("TRIBUTARY_LOG_CHANNEL");
            std::env::remove_var("TRIBUTARY_AUTH_USERS");
            std::env::remove_var("TRIBUTARY_CAPACITY_FACTOR");
        }
    }
}
