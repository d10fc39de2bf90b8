//! Certificate store - persistence of the root key pair
//!
//! The authority only needs two operations from its store: load a previously
//! saved root, and save a freshly generated one. Both are optional in effect:
//! the authority keeps working (with a regenerated root) when either fails.

use crate::mitm::error::{MitmError, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CERT_FILE: &str = "ca_cert.pem";
const KEY_FILE: &str = "ca_key.pem";

/// PEM material of a persisted root
pub struct StoredRoot {
    /// Root certificate (public, safe to log)
    pub certificate_pem: String,

    /// Root private key (never logged)
    pub private_key_pem: SecretString,
}

impl std::fmt::Debug for StoredRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredRoot")
            .field("certificate_pem", &self.certificate_pem.len())
            .field("private_key_pem", &"[redacted]")
            .finish()
    }
}

/// Storage backend for the root identity
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
    /// Load the persisted root, `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<StoredRoot>>;

    /// Persist the root
    async fn save(&self, root: &StoredRoot) -> Result<()>;
}

/// Filesystem store: `ca_cert.pem` and `ca_key.pem` inside one directory
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    directory: PathBuf,
}

impl FileCertificateStore {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn cert_path(&self) -> PathBuf {
        self.directory.join(CERT_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.directory.join(KEY_FILE)
    }
}

#[async_trait::async_trait]
impl CertificateStore for FileCertificateStore {
    async fn load(&self) -> Result<Option<StoredRoot>> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        if !fs::try_exists(&cert_path).await? || !fs::try_exists(&key_path).await? {
            debug!(directory = %self.directory.display(), "No persisted root found");
            return Ok(None);
        }

        let certificate_pem = fs::read_to_string(&cert_path).await.map_err(|e| {
            MitmError::store(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let private_key_pem = fs::read_to_string(&key_path).await.map_err(|e| {
            MitmError::store(format!("Failed to read {}: {}", key_path.display(), e))
        })?;

        info!(directory = %self.directory.display(), "Loaded persisted root");

        Ok(Some(StoredRoot {
            certificate_pem,
            private_key_pem: SecretString::new(private_key_pem),
        }))
    }

    async fn save(&self, root: &StoredRoot) -> Result<()> {
        fs::create_dir_all(&self.directory).await.map_err(|e| {
            MitmError::store(format!(
                "Failed to create {}: {}",
                self.directory.display(),
                e
            ))
        })?;

        fs::write(self.cert_path(), root.certificate_pem.as_bytes())
            .await
            .map_err(|e| MitmError::store(format!("Failed to save certificate: {}", e)))?;

        let key_path = self.key_path();
        fs::write(&key_path, root.private_key_pem.expose_secret().as_bytes())
            .await
            .map_err(|e| MitmError::store(format!("Failed to save private key: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(directory = %self.directory.display(), "Saved root certificate and key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_from_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path().join("nested"));

        let root = StoredRoot {
            certificate_pem: "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"
                .to_string(),
            private_key_pem: SecretString::new("key material".to_string()),
        };
        store.save(&root).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.certificate_pem, root.certificate_pem);
        assert_eq!(loaded.private_key_pem.expose_secret(), "key material");
    }

    #[test]
    fn test_debug_redacts_key() {
        let root = StoredRoot {
            certificate_pem: String::new(),
            private_key_pem: SecretString::new("very secret".to_string()),
        };
        assert!(!format!("{:?}", root).contains("very secret"));
    }
}
