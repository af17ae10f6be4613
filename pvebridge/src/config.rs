//! Configuration for pvebridge.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings for the Proxmox VE control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PveSettings {
    /// Hostname or address of the cluster endpoint.
    #[serde(default = "default_host")]
    pub host: String,

    /// API port. Default: 8006
    #[serde(default = "default_port")]
    pub port: u16,

    /// Full user id including the realm, e.g. `root@pam`.
    #[serde(default = "default_user")]
    pub user: String,

    /// Password for ticket-based authentication.
    #[serde(default)]
    pub password: String,

    /// Verify the API server's TLS certificate.
    ///
    /// Default: false. Most standalone nodes run with a self-signed
    /// certificate.
    #[serde(default)]
    pub verify_tls: bool,

    /// Deadline for waiting on an asynchronous task, in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Poll interval while waiting on a task, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Treat a failed delete-task wait during rebuild as fatal.
    ///
    /// The default keeps the forward-progress policy: a delete task that
    /// fails or times out is logged and rebuild proceeds to creation.
    #[serde(default)]
    pub strict_delete_wait: bool,
}

impl Default for PveSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            verify_tls: false,
            task_timeout_secs: default_task_timeout(),
            poll_interval_secs: default_poll_interval(),
            strict_delete_wait: false,
        }
    }
}

impl PveSettings {
    /// Base URL of the JSON API.
    pub fn api_base(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

/// Settings for the packet-filter side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NatSettings {
    /// Path or name of the iptables binary.
    #[serde(default = "default_iptables")]
    pub iptables_binary: String,

    /// Deadline for one iptables invocation, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Comment prefix marking rules owned by this system.
    #[serde(default = "default_owner_tag")]
    pub owner_tag: String,
}

impl Default for NatSettings {
    fn default() -> Self {
        Self {
            iptables_binary: default_iptables(),
            command_timeout_secs: default_command_timeout(),
            owner_tag: default_owner_tag(),
        }
    }
}

/// Top-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub pve: PveSettings,

    #[serde(default)]
    pub nat: NatSettings,

    /// Path of the SQLite database holding the desired NAT rule set.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pve: PveSettings::default(),
            nat: NatSettings::default(),
            database_path: default_database_path(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut settings: Settings = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        settings.apply_env();
        Ok(settings)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("PVEBRIDGE_HOST") {
            self.pve.host = host;
        }
        if let Ok(port) = std::env::var("PVEBRIDGE_PORT") {
            if let Ok(port) = port.parse() {
                self.pve.port = port;
            }
        }
        if let Ok(user) = std::env::var("PVEBRIDGE_USER") {
            self.pve.user = user;
        }
        if let Ok(password) = std::env::var("PVEBRIDGE_PASSWORD") {
            self.pve.password = password;
        }
        if let Ok(db) = std::env::var("PVEBRIDGE_DATABASE") {
            self.database_path = PathBuf::from(db);
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8006
}

fn default_user() -> String {
    "root@pam".to_string()
}

fn default_task_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    2
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_command_timeout() -> u64 {
    15
}

fn default_owner_tag() -> String {
    "pvebridge".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("pvebridge.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.pve.port, 8006);
        assert_eq!(settings.pve.user, "root@pam");
        assert_eq!(settings.pve.task_timeout_secs, 300);
        assert_eq!(settings.pve.poll_interval_secs, 2);
        assert!(!settings.pve.strict_delete_wait);
        assert_eq!(settings.nat.command_timeout_secs, 15);
        assert_eq!(settings.nat.owner_tag, "pvebridge");
    }

    #[test]
    fn api_base_url() {
        let mut pve = PveSettings::default();
        pve.host = "pve1.lab".into();
        assert_eq!(pve.api_base(), "https://pve1.lab:8006/api2/json");
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pve": {{"host": "10.1.1.1", "password": "secret"}}}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.pve.host, "10.1.1.1");
        assert_eq!(settings.pve.password, "secret");
        // Unset fields keep their defaults.
        assert_eq!(settings.pve.port, 8006);
        assert_eq!(settings.nat.iptables_binary, "iptables");
    }

    #[test]
    fn load_missing_file() {
        let result = Settings::load(Path::new("/nonexistent/pvebridge.json"));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
