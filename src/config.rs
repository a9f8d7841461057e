//! Installation config file
//!
//! An unattended run is described by one JSON file: what to install where,
//! who the user is, and the pipeline knobs (mount root, timeouts, image
//! locations). Enums are typed so a typo fails at load time rather than in
//! the middle of partitioning.

use crate::desktop::Desktop;
use crate::types::{BootMode, InstallMode};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Pipeline settings
// ============================================================================

/// Knobs shared by the disk and install workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Where the target root filesystem is mounted
    pub mount_root: PathBuf,
    /// How long to wait for a partition device node to appear
    pub node_timeout_secs: u64,
    /// Program used to run commands inside the target
    pub chroot_program: String,
    /// Prefix for privileged commands when not root; `null` to never elevate
    pub privilege_wrapper: Option<String>,
    /// Installation image copied into the target when present
    pub iso_path: PathBuf,
    /// Bootstrap tarball location and its download URL
    pub bootstrap_image: PathBuf,
    pub bootstrap_url: String,
    /// Written to the target mirrorlist when the host has none to copy
    pub mirror_url: String,
    /// Undelivered events before a worker blocks
    pub event_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            node_timeout_secs: 10,
            chroot_program: "arch-chroot".to_string(),
            privilege_wrapper: Some("sudo".to_string()),
            iso_path: PathBuf::from("/tmp/archlinux.iso"),
            bootstrap_image: PathBuf::from("/tmp/archlinux-bootstrap-x86_64.tar.zst"),
            bootstrap_url:
                "https://mirrors.mit.edu/archlinux/iso/latest/archlinux-bootstrap-x86_64.tar.zst"
                    .to_string(),
            mirror_url: "https://mirrors.mit.edu/archlinux/$repo/os/$arch".to_string(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.mount_root.is_absolute() || self.mount_root == Path::new("/") {
            bail!("Mount root must be an absolute path other than /");
        }
        if self.node_timeout_secs == 0 {
            bail!("Node timeout must be at least one second");
        }
        if self.chroot_program.trim().is_empty() {
            bail!("Chroot program must be specified");
        }
        if self.event_capacity == 0 {
            bail!("Event capacity must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("{0} must be specified")]
    Empty(&'static str),

    #[error("{0} do not match")]
    Mismatch(&'static str),

    #[error("{0} cannot contain whitespace")]
    Whitespace(&'static str),

    #[error("invalid username {0:?}: use 1-32 lowercase letters, digits, '_' or '-', starting with a letter or '_'")]
    InvalidUsername(String),

    #[error("username {0:?} is reserved")]
    ReservedUsername(String),
}

/// Primary user plus root password. Passwords are never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
    root_password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn check_password(value: &str, what: &'static str) -> Result<(), CredentialsError> {
    if value.is_empty() {
        return Err(CredentialsError::Empty(what));
    }
    if value.contains(char::is_whitespace) {
        return Err(CredentialsError::Whitespace(what));
    }
    Ok(())
}

fn check_username(username: &str) -> Result<(), CredentialsError> {
    if username.is_empty() {
        return Err(CredentialsError::Empty("Username"));
    }
    let mut chars = username.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !first_ok || !rest_ok || username.len() > 32 {
        return Err(CredentialsError::InvalidUsername(username.to_string()));
    }
    if username == "root" {
        return Err(CredentialsError::ReservedUsername(username.to_string()));
    }
    Ok(())
}

impl Credentials {
    pub fn new(
        username: &str,
        password: &str,
        root_password: &str,
    ) -> Result<Self, CredentialsError> {
        let username = username.trim();
        check_username(username)?;
        check_password(password, "User password")?;
        check_password(root_password, "Root password")?;
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            root_password: root_password.to_string(),
        })
    }

    /// Build from form input where each password was typed twice
    pub fn confirmed(
        username: &str,
        password: &str,
        password_again: &str,
        root_password: &str,
        root_password_again: &str,
    ) -> Result<Self, CredentialsError> {
        let creds = Self::new(username, password, root_password)?;
        if password != password_again {
            return Err(CredentialsError::Mismatch("User passwords"));
        }
        if root_password != root_password_again {
            return Err(CredentialsError::Mismatch("Root passwords"));
        }
        Ok(creds)
    }

    /// `chpasswd` stdin setting both the user's and root's password
    pub fn chpasswd_input(&self) -> String {
        format!(
            "{}:{}\nroot:{}\n",
            self.username, self.password, self.root_password
        )
    }
}

// ============================================================================
// Install config
// ============================================================================

fn default_hostname() -> String {
    "archlinux".to_string()
}

fn default_locale() -> String {
    "en_US.UTF-8".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_keymap() -> String {
    "us".to_string()
}

/// Everything an unattended run needs
#[derive(Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    pub mode: InstallMode,
    /// `None` picks the mode the live system booted in
    #[serde(default)]
    pub boot_mode: Option<BootMode>,
    /// Target disk; may be empty for use-partition (resolved from the partition)
    #[serde(default)]
    pub drive: String,
    #[serde(default)]
    pub partition: Option<String>,

    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_keymap")]
    pub keymap: String,

    pub username: String,
    pub user_password: String,
    pub root_password: String,

    #[serde(default)]
    pub desktop: Desktop,

    #[serde(default)]
    pub settings: PipelineSettings,
}

impl fmt::Debug for InstallConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallConfig")
            .field("mode", &self.mode)
            .field("boot_mode", &self.boot_mode)
            .field("drive", &self.drive)
            .field("partition", &self.partition)
            .field("hostname", &self.hostname)
            .field("locale", &self.locale)
            .field("timezone", &self.timezone)
            .field("keymap", &self.keymap)
            .field("username", &self.username)
            .field("desktop", &self.desktop)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            mode: InstallMode::default(),
            boot_mode: None,
            drive: String::new(),
            partition: None,
            hostname: default_hostname(),
            locale: default_locale(),
            timezone: default_timezone(),
            keymap: default_keymap(),
            username: String::new(),
            user_password: String::new(),
            root_password: String::new(),
            desktop: Desktop::default(),
            settings: PipelineSettings::default(),
        }
    }
}

impl InstallConfig {
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// Boot mode from the file, or the one the live system booted in
    pub fn boot_mode(&self) -> BootMode {
        self.boot_mode.unwrap_or_else(BootMode::detect)
    }

    pub fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Credentials::new(&self.username, &self.user_password, &self.root_password)
    }

    pub fn validate(&self) -> Result<()> {
        let has_partition = self
            .partition
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        match self.mode {
            InstallMode::UsePartition if !has_partition => {
                bail!("use-partition requires a target partition")
            }
            InstallMode::UsePartition => {}
            _ if self.drive.trim().is_empty() => bail!("Install drive must be specified"),
            _ => {}
        }

        // RFC 1123 label: 1-63 chars, letters/digits/hyphens, no leading/trailing hyphen
        let hostname = self.hostname.trim();
        if hostname.is_empty() || hostname.len() > 63 {
            bail!("Hostname must be 1-63 characters long");
        }
        if hostname.starts_with('-') || hostname.ends_with('-') {
            bail!("Hostname cannot start or end with a hyphen");
        }
        if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            bail!("Hostname can only contain letters, numbers, and hyphens");
        }

        if self.locale.trim().is_empty() || self.locale.contains(char::is_whitespace) {
            bail!("Locale must be a single name such as en_US.UTF-8");
        }
        let timezone = self.timezone.trim();
        if timezone.is_empty()
            || timezone.starts_with('/')
            || timezone.contains("..")
            || !timezone
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
        {
            bail!("Timezone must be a zoneinfo name such as Europe/Berlin");
        }
        if self.keymap.trim().is_empty() || self.keymap.contains(char::is_whitespace) {
            bail!("Keymap must be a single name such as us");
        }

        self.credentials()?;
        self.settings.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> InstallConfig {
        InstallConfig {
            drive: "sda".to_string(),
            hostname: "archbox".to_string(),
            username: "alice".to_string(),
            user_password: "secret".to_string(),
            root_password: "rootsecret".to_string(),
            ..InstallConfig::default()
        }
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_empty_drive() {
        let config = InstallConfig {
            drive: "  ".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_use_partition_needs_partition() {
        let mut config = InstallConfig {
            mode: InstallMode::UsePartition,
            drive: String::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
        config.partition = Some("sda2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_hostname_rules() {
        for bad in ["", "-arch", "arch-", "arch box", "arch_box", &"a".repeat(64)] {
            let config = InstallConfig {
                hostname: bad.to_string(),
                ..valid_config()
            };
            assert!(config.validate().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_validation_timezone_rules() {
        for bad in ["", "/etc/passwd", "../../etc", "Europe/Ber lin"] {
            let config = InstallConfig {
                timezone: bad.to_string(),
                ..valid_config()
            };
            assert!(config.validate().is_err(), "{:?} should be rejected", bad);
        }
        let config = InstallConfig {
            timezone: "America/Argentina/Buenos_Aires".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_relative_mount_root() {
        let mut config = valid_config();
        config.settings.mount_root = PathBuf::from("mnt");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_rules() {
        assert_eq!(
            Credentials::new("", "a", "b").unwrap_err(),
            CredentialsError::Empty("Username")
        );
        assert!(matches!(
            Credentials::new("Alice", "a", "b"),
            Err(CredentialsError::InvalidUsername(_))
        ));
        assert!(matches!(
            Credentials::new("1alice", "a", "b"),
            Err(CredentialsError::InvalidUsername(_))
        ));
        assert_eq!(
            Credentials::new("root", "a", "b").unwrap_err(),
            CredentialsError::ReservedUsername("root".to_string())
        );
        assert_eq!(
            Credentials::new("alice", "", "b").unwrap_err(),
            CredentialsError::Empty("User password")
        );
        assert_eq!(
            Credentials::new("alice", "a b", "b").unwrap_err(),
            CredentialsError::Whitespace("User password")
        );
        assert!(Credentials::new("_svc-user1", "a", "b").is_ok());
    }

    #[test]
    fn test_credentials_confirmation() {
        assert_eq!(
            Credentials::confirmed("alice", "pw", "pw2", "root", "root").unwrap_err(),
            CredentialsError::Mismatch("User passwords")
        );
        assert_eq!(
            Credentials::confirmed("alice", "pw", "pw", "root", "toor").unwrap_err(),
            CredentialsError::Mismatch("Root passwords")
        );
        let creds = Credentials::confirmed("alice", "pw", "pw", "root", "root").unwrap();
        assert_eq!(creds.chpasswd_input(), "alice:pw\nroot:root\n");
    }

    #[test]
    fn test_debug_output_hides_passwords() {
        let config = valid_config();
        let debug = format!("{:?} {:?}", config, config.credentials().unwrap());
        assert!(!debug.contains("rootsecret"));
        assert!(debug.contains("alice"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let mut config = valid_config();
        config.desktop = Desktop::Xfce;
        config.boot_mode = Some(BootMode::Efi);
        config.save_to_file(file.path()).unwrap();

        let loaded = InstallConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.desktop, Desktop::Xfce);
        assert_eq!(loaded.boot_mode(), BootMode::Efi);
        assert_eq!(loaded.settings, PipelineSettings::default());
    }

    #[test]
    fn test_load_minimal_json_applies_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mode": "use-free-space", "drive": "nvme0n1", "username": "bob",
                "user_password": "x", "root_password": "y"}}"#
        )
        .unwrap();
        let config = InstallConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.mode, InstallMode::UseFreeSpace);
        assert_eq!(config.locale, "en_US.UTF-8");
        assert_eq!(config.settings.mount_root, PathBuf::from("/mnt"));
        assert_eq!(config.settings.node_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_unknown_mode() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mode": "resize-everything", "username": "bob", "user_password": "x", "root_password": "y"}}"#
        )
        .unwrap();
        assert!(InstallConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(InstallConfig::load_from_file("/nonexistent/archsetup.json").is_err());
    }
}
