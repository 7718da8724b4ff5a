use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::timeouts;
use crate::transport::IdlePolicy;

pub const DEFAULT_CERT_DIR: &str = "/predefhiddenfolder/certificates/auth/";
pub const DEFAULT_CDF_NAME: &str = "ext_info.sys";

/// Per-user session settings, stored as TOML
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_interval_ms: u64,
    pub idle_retries: u32,
    pub read_buffer_size: usize,
    pub cert_dir: String,
    pub cdf_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: timeouts::IDLE_WAIT_MS,
            idle_retries: timeouts::IDLE_RETRIES,
            read_buffer_size: timeouts::READ_CHUNK,
            cert_dir: DEFAULT_CERT_DIR.to_string(),
            cdf_name: DEFAULT_CDF_NAME.to_string(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("phonelink");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("phonelink");
    }
    PathBuf::from(".phonelink")
}

pub fn config_path() -> PathBuf {
    config_dir().join("phonelink.toml")
}

impl SessionConfig {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let cfg: Self = toml::from_str(&data)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Atomic write via a temp file in the target directory
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let data = toml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
        tmp.write_all(data.as_bytes())
            .and_then(|_| tmp.flush())
            .map_err(|e| Error::io(tmp.path(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
        }
        tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be at least 1".to_string()));
        }
        if !self.cert_dir.starts_with('/') {
            return Err(Error::Config(format!(
                "cert_dir {:?} must be an absolute phone path",
                self.cert_dir
            )));
        }
        if self.cdf_name.is_empty() || self.cdf_name.contains('/') {
            return Err(Error::Config(format!(
                "cdf_name {:?} must be a plain file name",
                self.cdf_name
            )));
        }
        Ok(())
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy {
            interval: Duration::from_millis(self.idle_interval_ms),
            max_idle_retries: self.idle_retries,
            read_chunk: self.read_buffer_size,
        }
    }
}
