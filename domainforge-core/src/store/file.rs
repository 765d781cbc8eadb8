//! File-backed credential storage: one record per domain.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::codec::RecordCodec;
use super::{CredentialStore, StoreError};
use crate::model::DomainName;
use crate::token::Credential;

/// Credential store keeping each domain in its own file.
///
/// Writes go to a uniquely named temp file in the same directory and are
/// then renamed over the record, so readers see either the old or the new
/// record.
pub struct FileCredentialStore {
    dir: PathBuf,
    codec: Box<dyn RecordCodec>,
}

impl FileCredentialStore {
    /// Create a store rooted at `storage_root`.
    ///
    /// Records go to `storage_root/credentials`. The directory is created on
    /// the first save.
    pub fn new(storage_root: PathBuf, codec: Box<dyn RecordCodec>) -> Self {
        Self {
            dir: storage_root.join("credentials"),
            codec,
        }
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, domain: &DomainName) -> PathBuf {
        self.dir
            .join(format!("{}.{}", domain.as_str(), self.codec.extension()))
    }
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("dir", &self.dir)
            .field("encoding", &self.codec.extension())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, domain: &DomainName) -> Result<Credential, StoreError> {
        let path = self.record_path(domain);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    domain: domain.clone(),
                });
            }
            Err(e) => {
                return Err(StoreError::Io {
                    domain: domain.clone(),
                    source: e,
                });
            }
        };

        let credential = self
            .codec
            .decode(&bytes)
            .map_err(|e| StoreError::Corrupt {
                domain: domain.clone(),
                message: e.to_string(),
            })?;

        if &credential.domain != domain {
            return Err(StoreError::Corrupt {
                domain: domain.clone(),
                message: format!("record belongs to {}", credential.domain),
            });
        }

        tracing::debug!("Loaded credential for {} from {:?}", domain, path);
        Ok(credential)
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let domain = &credential.domain;
        let io_err = |source: std::io::Error| StoreError::Io {
            domain: domain.clone(),
            source,
        };

        let bytes = self
            .codec
            .encode(credential)
            .map_err(|e| StoreError::Encode {
                domain: domain.clone(),
                message: e.to_string(),
            })?;

        fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let path = self.record_path(domain);
        let temp_path = self
            .dir
            .join(format!(".{}.tmp", Uuid::new_v4()));

        if let Err(e) = write_private(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(e));
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(e));
        }

        tracing::debug!("Saved credential for {} to {:?}", domain, path);
        Ok(())
    }

    async fn delete(&self, domain: &DomainName) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(domain)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io {
                domain: domain.clone(),
                source: e,
            }),
        }
    }

    async fn exists(&self, domain: &DomainName) -> Result<bool, StoreError> {
        fs::try_exists(self.record_path(domain))
            .await
            .map_err(|e| StoreError::Io {
                domain: domain.clone(),
                source: e,
            })
    }

    async fn list_domains(&self) -> Result<Vec<DomainName>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::List(e)),
        };

        let suffix = format!(".{}", self.codec.extension());
        let mut domains = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::List)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Temp files start with a dot and never parse as a domain.
            if let Some(stem) = name.strip_suffix(&suffix) {
                if let Ok(domain) = DomainName::parse(stem) {
                    domains.push(domain);
                }
            }
        }

        domains.sort();
        Ok(domains)
    }
}

/// Write `bytes` to a new file readable only by the owner.
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
