//! Persisted session credentials.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use noticeboard_common::{AppError, AppResult};
use noticeboard_model::Credentials;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Storage for the access/refresh pair and role flag.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Currently stored credentials, if any.
    async fn load(&self) -> AppResult<Option<Credentials>>;

    /// Replace the stored credentials.
    async fn store(&self, credentials: &Credentials) -> AppResult<()>;

    /// Forget the stored credentials.
    async fn clear(&self) -> AppResult<()>;
}

/// In-process credential store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    slot: Arc<RwLock<Option<Credentials>>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a session.
    #[must_use]
    pub fn with(credentials: Credentials) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(credentials))),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> AppResult<Option<Credentials>> {
        Ok(self.slot.read().await.clone())
    }

    async fn store(&self, credentials: &Credentials) -> AppResult<()> {
        *self.slot.write().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        *self.slot.write().await = None;
        Ok(())
    }
}

/// Credential store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> AppError {
    AppError::Internal(format!("credential file {}: {err}", path.display()))
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> AppResult<Option<Credentials>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.path, &e)),
        };

        match serde_json::from_slice(&raw) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable credential file");
                Ok(None)
            }
        }
    }

    async fn store(&self, credentials: &Credentials) -> AppResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }

        let raw = serde_json::to_vec_pretty(credentials)?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| io_error(&self.path, &e))?;
        debug!(path = %self.path.display(), "Credentials stored");
        Ok(())
    }

    async fn clear(&self) -> AppResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, &e)),
        }
    }
}
