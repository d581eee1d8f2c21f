//! Configuration management for cryptsync
//!
//! Each synchronized tree carries its own configuration in
//! `.cryptsync/config.json` at the tree root. The file lists the remotes the
//! tree syncs with plus the external tools and timeouts used to reach them.

use crate::error::{Error, Result};
use crate::overlay::CipherConfig;
use crate::secret::Secret;
use crate::session::{EncryptionMode, RemoteEndpoint, TransferOptions, CONTROL_DIR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file inside the control directory
pub const CONFIG_FILE: &str = "config.json";

/// Default mount timeout: 30 seconds
pub const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 30;

/// Default unmount timeout: 15 seconds
pub const DEFAULT_UNMOUNT_TIMEOUT_SECS: u64 = 15;

/// Largest accepted first unmount retry delay: one minute
pub const MAX_DETACH_BASE_DELAY_MS: u64 = 60_000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote directories by name
    pub remotes: BTreeMap<String, RemoteConfig>,

    /// External tool names
    pub tools: ToolConfig,

    /// Deadlines for external tools
    pub timeouts: TimeoutConfig,

    /// Unmount retry policy
    pub detach: DetachConfig,
}

/// One remote directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    /// `host:path`, or a plain path for a directory on this machine
    pub location: String,

    /// Encryption key; setting it enables encryption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Secret>,

    /// Encrypt even though no key is stored (it is asked for at runtime)
    pub encrypted: bool,

    /// Parameters for new encrypted volumes, checked against existing ones
    pub cipher: CipherConfig,

    /// Exclusion patterns
    pub exclude: Vec<String>,

    /// Delete files missing on the sending side
    pub delete: bool,

    /// Ignore modification times when comparing
    pub ignore_time: bool,

    /// Follow symbolic links
    pub follow_links: bool,

    /// Compare file contents in addition to size and time
    pub content: bool,

    /// Allowed modification time difference in seconds
    pub modify_window: u64,

    /// Symbolic link pointed at the attached view by `mount`; relative
    /// paths are taken from the tree root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
}

/// External tool names or paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub sshfs: String,
    /// Extra `-o` options for sshfs
    pub sshfs_options: Vec<String>,
    pub encfs: String,
    pub rsync: String,
    pub fusermount: String,
}

/// Deadlines for external tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub mount_secs: u64,
    pub overlay_secs: u64,
    pub unmount_secs: u64,
    /// No deadline when unset
    pub transfer_secs: Option<u64>,
}

/// Unmount retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetachConfig {
    /// Retries after the first failed unmount
    pub retries: u32,
    /// Delay before the first retry, doubled every time
    pub base_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            location: String::new(),
            key: None,
            encrypted: false,
            cipher: CipherConfig::default(),
            exclude: Vec::new(),
            delete: false,
            ignore_time: false,
            follow_links: false,
            content: false,
            modify_window: 0,
            mount_point: None,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            sshfs: "sshfs".to_string(),
            sshfs_options: vec!["idmap=user".to_string(), "reconnect".to_string()],
            encfs: "encfs".to_string(),
            rsync: "rsync".to_string(),
            fusermount: default_unmount_tool().to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            mount_secs: DEFAULT_MOUNT_TIMEOUT_SECS,
            overlay_secs: DEFAULT_MOUNT_TIMEOUT_SECS,
            unmount_secs: DEFAULT_UNMOUNT_TIMEOUT_SECS,
            transfer_secs: None,
        }
    }
}

impl Default for DetachConfig {
    fn default() -> Self {
        DetachConfig {
            retries: 3,
            base_delay_ms: 500,
        }
    }
}

#[cfg(target_os = "macos")]
fn default_unmount_tool() -> &'static str {
    "umount"
}

#[cfg(not(target_os = "macos"))]
fn default_unmount_tool() -> &'static str {
    "fusermount"
}

impl TimeoutConfig {
    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount_secs)
    }

    pub fn overlay(&self) -> Duration {
        Duration::from_secs(self.overlay_secs)
    }

    pub fn unmount(&self) -> Duration {
        Duration::from_secs(self.unmount_secs)
    }

    pub fn transfer(&self) -> Option<Duration> {
        self.transfer_secs.map(Duration::from_secs)
    }
}

impl RemoteConfig {
    /// Remote with only a location set
    pub fn with_location(location: impl Into<String>) -> Self {
        RemoteConfig {
            location: location.into(),
            ..RemoteConfig::default()
        }
    }

    pub fn endpoint(&self) -> Result<RemoteEndpoint> {
        RemoteEndpoint::parse(&self.location)
    }

    /// Whether this remote is stored encrypted
    pub fn wants_encryption(&self) -> bool {
        self.encrypted || self.key.as_ref().is_some_and(|k| !k.is_empty())
    }

    /// Encryption mode using the stored key, or `key` when given
    pub fn encryption_mode(&self, key: Option<Secret>) -> EncryptionMode {
        if !self.wants_encryption() {
            return EncryptionMode::None;
        }
        let key = key.or_else(|| self.key.clone()).unwrap_or_default();
        EncryptionMode::Encrypted {
            cipher: self.cipher.clone(),
            key,
        }
    }

    /// Transfer options derived from this remote's switches
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            exclude: self.exclude.clone(),
            delete: self.delete,
            dry_run: false,
            follow_links: self.follow_links,
            ignore_time: self.ignore_time,
            content: self.content,
            modify_window: self.modify_window,
            delta: None,
            scope: PathBuf::new(),
        }
    }
}

impl Config {
    /// Find the tree root by walking up from `start` to the first directory
    /// holding `.cryptsync/config.json`
    pub fn find_root(start: &Path) -> Result<PathBuf> {
        let mut dir = Some(start);
        while let Some(current) = dir {
            if Self::path_in(current).is_file() {
                return Ok(current.to_path_buf());
            }
            dir = current.parent();
        }
        Err(Error::Config(format!(
            "no {}/{} found in {} or any parent directory",
            CONTROL_DIR,
            CONFIG_FILE,
            start.display()
        )))
    }

    /// Configuration file path for a tree root
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONTROL_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        let tool = |var: &str, slot: &mut String| {
            if let Ok(value) = std::env::var(var) {
                let value = value.trim();
                if !value.is_empty() {
                    *slot = value.to_string();
                }
            }
        };
        tool("CRYPTSYNC_RSYNC", &mut self.tools.rsync);
        tool("CRYPTSYNC_SSHFS", &mut self.tools.sshfs);
        tool("CRYPTSYNC_ENCFS", &mut self.tools.encfs);
        tool("CRYPTSYNC_FUSERMOUNT", &mut self.tools.fusermount);

        if let Ok(timeout) = std::env::var("CRYPTSYNC_TRANSFER_TIMEOUT") {
            if let Ok(secs) = timeout.trim().parse::<u64>() {
                self.timeouts.transfer_secs = Some(secs);
            }
        }

        for (name, remote) in self.remotes.iter_mut() {
            if let Ok(key) = std::env::var(key_env_var(name)) {
                if !key.is_empty() {
                    remote.key = Some(Secret::new(key));
                }
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, remote) in &self.remotes {
            if name.is_empty() || name.contains('/') {
                return Err(Error::InvalidSessionConfig(format!(
                    "invalid remote name '{}'",
                    name
                )));
            }

            if remote.location.trim().is_empty() {
                return Err(Error::InvalidSessionConfig(format!(
                    "no location specified for {}",
                    name
                )));
            }
            remote.endpoint()?;

            if remote.wants_encryption() {
                remote.cipher.validate()?;
            }
        }

        if self.timeouts.mount_secs == 0
            || self.timeouts.overlay_secs == 0
            || self.timeouts.unmount_secs == 0
            || self.timeouts.transfer_secs == Some(0)
        {
            return Err(Error::InvalidSessionConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if self.detach.retries == 0 {
            return Err(Error::InvalidSessionConfig(
                "detach retries must be greater than 0".to_string(),
            ));
        }

        if self.detach.base_delay_ms > MAX_DETACH_BASE_DELAY_MS {
            return Err(Error::InvalidSessionConfig(format!(
                "detach base delay must be at most {} ms",
                MAX_DETACH_BASE_DELAY_MS
            )));
        }

        Ok(())
    }

    /// Look up a remote by name
    pub fn remote(&self, name: &str) -> Result<&RemoteConfig> {
        self.remotes.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.remotes.keys().map(String::as_str).collect();
            Error::Config(format!(
                "unknown remote name \"{}\" (configured: {})",
                name,
                known.join(", ")
            ))
        })
    }

    /// Create or update a remote in the tree rooted at `root`.
    ///
    /// `update` is applied to the existing entry, or to a default one for a
    /// new remote, so settings it does not touch are kept. Returns true when
    /// a new configuration file was created.
    pub fn init_remote(
        root: &Path,
        name: &str,
        update: impl FnOnce(&mut RemoteConfig),
    ) -> Result<bool> {
        let control = root.join(CONTROL_DIR);
        std::fs::create_dir_all(&control)?;

        let path = Self::path_in(root);
        let created = !path.exists();
        let mut config = if created {
            Config::default()
        } else {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse config file: {}", e))
            })?
        };

        update(config.remotes.entry(name.to_string()).or_default());
        config.validate()?;
        config.save(&path)?;
        Ok(created)
    }
}

/// Environment variable holding the key for a remote
pub fn key_env_var(remote: &str) -> String {
    let suffix: String = remote
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CRYPTSYNC_KEY_{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_and_load() {
        let dir = tempdir().unwrap();
        let created = Config::init_remote(dir.path(), "backup", |r| {
            r.location = "server:/srv/backup".to_string();
        })
        .unwrap();
        assert!(created);

        let config = Config::load(Config::path_in(dir.path())).unwrap();
        let remote = config.remote("backup").unwrap();
        assert_eq!(remote.location, "server:/srv/backup");
        assert!(!remote.wants_encryption());
        assert_eq!(config.tools.rsync, "rsync");

        let created = Config::init_remote(dir.path(), "usb", |r| {
            r.location = "/media/usb".to_string();
        })
        .unwrap();
        assert!(!created);
        let config = Config::load(Config::path_in(dir.path())).unwrap();
        assert_eq!(config.remotes.len(), 2);
    }

    #[test]
    fn test_init_keeps_settings_of_existing_remote() {
        let dir = tempdir().unwrap();
        Config::init_remote(dir.path(), "backup", |r| {
            r.location = "server:/old".to_string();
            r.ignore_time = true;
            r.modify_window = 2;
            r.exclude = vec!["*.tmp".to_string()];
            r.cipher.key_size = 256;
            r.encrypted = true;
        })
        .unwrap();

        Config::init_remote(dir.path(), "backup", |r| {
            r.location = "server:/new".to_string();
        })
        .unwrap();

        let config = Config::load(Config::path_in(dir.path())).unwrap();
        let remote = config.remote("backup").unwrap();
        assert_eq!(remote.location, "server:/new");
        assert!(remote.ignore_time);
        assert_eq!(remote.modify_window, 2);
        assert_eq!(remote.exclude, vec!["*.tmp".to_string()]);
        assert_eq!(remote.cipher.key_size, 256);
        assert!(remote.encrypted);
    }

    #[test]
    fn test_find_root_walks_up() {
        let dir = tempdir().unwrap();
        Config::init_remote(dir.path(), "r", |r| r.location = "h:/p".to_string()).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(Config::find_root(&nested).unwrap(), dir.path());

        let other = tempdir().unwrap();
        assert!(Config::find_root(other.path()).is_err());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"remotes": {"r": {"location": "h:/p", "colour": "blue"}}}"#,
        )
        .unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_location_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"remotes": {"r": {"delete": true}}}"#).unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(Error::InvalidSessionConfig(_))
        ));
    }

    #[test]
    fn test_encryption_mode() {
        let mut remote = RemoteConfig::with_location("h:/p");
        assert!(matches!(remote.encryption_mode(None), EncryptionMode::None));

        remote.key = Some(Secret::new("k"));
        match remote.encryption_mode(None) {
            EncryptionMode::Encrypted { key, cipher } => {
                assert_eq!(key.expose(), "k");
                assert_eq!(cipher, CipherConfig::default());
            }
            EncryptionMode::None => panic!("expected encryption"),
        }

        let mut prompted = RemoteConfig::with_location("h:/p");
        prompted.encrypted = true;
        assert!(prompted.wants_encryption());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.timeouts.transfer_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detach_delay_is_bounded() {
        let mut config = Config::default();
        config.detach.base_delay_ms = MAX_DETACH_BASE_DELAY_MS;
        assert!(config.validate().is_ok());

        config.detach.base_delay_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidSessionConfig(_))
        ));
    }

    #[test]
    fn test_key_env_var_name() {
        assert_eq!(key_env_var("my-backup"), "CRYPTSYNC_KEY_MY_BACKUP");
    }
}
