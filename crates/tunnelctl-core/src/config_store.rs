//! C2: persistent mapping of a fixed set of keys, serialized as a single
//! JSON file with owner-only permissions under a per-user directory.

use crate::error::{CoreError, ErrorKind, Phase, Severity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub cloudflare: CloudflareSection,
    #[serde(default)]
    pub preferences: serde_json::Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudflareSection {
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub last_login_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub preferred_domain: Option<String>,
    #[serde(default)]
    pub tunnels: std::collections::HashMap<String, serde_json::Value>,
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Default location: `$XDG_CONFIG_HOME/tunnelctl/config.json`.
    pub fn new() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine a config directory for this platform"))?
            .join("tunnelctl");
        Ok(Self::at(dir.join("config.json")))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Well-known path of the credential file the external tunnel binary
    /// itself writes on login. Never written by this component.
    pub fn credential_file_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cloudflared")
            .join("cert.pem")
    }

    /// Returns defaults when the file is absent; fails with
    /// `CONFIG_FILE_INVALID` when deserialization fails.
    pub fn read(&self) -> Result<StoredConfig, CoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "config file absent, returning defaults");
            return Ok(StoredConfig {
                version: default_version(),
                ..Default::default()
            });
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| invalid(&self.path, &e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| invalid(&self.path, &e.to_string()))
    }

    pub fn write_api_token(&self, token: &str) -> Result<(), CoreError> {
        let mut cfg = self.read()?;
        cfg.cloudflare.api_token = Some(token.to_string());
        cfg.cloudflare.last_login_time = Some(chrono::Utc::now());
        self.persist(&cfg)
    }

    pub fn write_preferred_zone(&self, domain: &str) -> Result<(), CoreError> {
        let mut cfg = self.read()?;
        cfg.cloudflare.preferred_domain = Some(domain.to_string());
        self.persist(&cfg)
    }

    pub fn clear(&self) -> Result<(), CoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| invalid(&self.path, &e.to_string()))?;
        }
        Ok(())
    }

    fn persist(&self, cfg: &StoredConfig) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| invalid(&self.path, &e.to_string()))?;
        }
        let body = serde_json::to_string_pretty(cfg).map_err(|e| invalid(&self.path, &e.to_string()))?;
        write_owner_only(&self.path, &body).map_err(|e| invalid(&self.path, &e.to_string()))?;
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            warn!("falling back to ./tunnelctl-config.json: {e}");
            Self::at(PathBuf::from("./tunnelctl-config.json"))
        })
    }
}

#[cfg(unix)]
fn write_owner_only(path: &Path, body: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(body.as_bytes())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, body: &str) -> std::io::Result<()> {
    std::fs::write(path, body)
}

fn invalid(path: &Path, detail: &str) -> CoreError {
    CoreError {
        kind: ErrorKind::ConfigFileInvalid,
        severity: Severity::Error,
        phase: Phase::Config,
        cause: format!("{}: {detail}", path.display()),
        suggestions: vec!["Delete the config file and let it be regenerated.".to_string()],
        transaction_id: None,
        title: "Configuration file invalid".to_string(),
        description: "The stored configuration could not be read or parsed.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_on_absent_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("config.json"));
        let cfg = store.read().unwrap();
        assert!(cfg.cloudflare.api_token.is_none());
    }

    #[test]
    fn write_then_read_round_trips_api_token() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("config.json"));
        store.write_api_token("tok_abc123").unwrap();
        let cfg = store.read().unwrap();
        assert_eq!(cfg.cloudflare.api_token.as_deref(), Some("tok_abc123"));
    }

    #[test]
    fn invalid_json_is_reported_as_config_file_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::at(path);
        let err = store.read().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigFileInvalid);
    }

    #[test]
    fn clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::at(dir.path().join("config.json"));
        store.write_api_token("tok").unwrap();
        store.clear().unwrap();
        let cfg = store.read().unwrap();
        assert!(cfg.cloudflare.api_token.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::at(path.clone());
        store.write_api_token("tok").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
