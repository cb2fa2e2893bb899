//! Credentials store: `$HOME/.akita/credentials.yaml`, directory mode
//! 0700, file mode 0600. Kept deliberately separate from `config::Config`
//! — these are secrets, not tuning knobs, and get narrower permissions
//! than the rest of the agent's on-disk state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    pub api_key_id: Option<String>,
    pub api_key_secret: Option<String>,
    pub postman_api_key: Option<String>,
}

impl Credentials {
    pub fn path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".akita").join("credentials.yaml"))
    }

    /// Load credentials: environment variables take precedence over the
    /// persisted file, matching the precedence the rest of the config
    /// layer uses.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        let mut creds = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Credentials::default(),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        if let Ok(v) = std::env::var("AKITA_API_KEY_ID") {
            creds.api_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("AKITA_API_KEY_SECRET") {
            creds.api_key_secret = Some(v);
        }
        if let Ok(v) = std::env::var("POSTMAN_API_KEY") {
            creds.postman_api_key = Some(v);
        }

        Ok(creds)
    }

    /// Persist credentials to disk, creating `~/.akita` (0700) and writing
    /// the file itself with 0600 permissions on unix.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
            set_dir_permissions(parent);
        }

        let rendered = serde_yaml::to_string(self).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, rendered).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        set_file_permissions(&path);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.api_key_id.is_some() && self.api_key_secret.is_some()
    }

    /// Truncated SHA-256 hex digest of the API key id, safe to include in
    /// telemetry so operators can tell which key is active without the
    /// secret ever leaving this process.
    pub fn fingerprint(&self) -> Option<String> {
        let key_id = self.api_key_id.as_deref()?;
        let mut hasher = Sha256::new();
        hasher.update(key_id.as_bytes());
        let digest = hasher.finalize();
        Some(hex_prefix(&digest, 8))
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(unix)]
fn set_dir_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &std::path::Path) {}

#[cfg(unix)]
fn set_file_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &std::path::Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_configured_requires_both_key_id_and_secret() {
        let mut creds = Credentials::default();
        assert!(!creds.is_configured());
        creds.api_key_id = Some("id".into());
        assert!(!creds.is_configured());
        creds.api_key_secret = Some("secret".into());
        assert!(creds.is_configured());
    }

    #[test]
    fn fingerprint_is_deterministic_and_absent_without_a_key_id() {
        assert_eq!(Credentials::default().fingerprint(), None);

        let mut creds = Credentials::default();
        creds.api_key_id = Some("akid_abc123".into());
        let fp = creds.fingerprint().expect("fingerprint");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, creds.fingerprint().unwrap());
    }
}
