//! File storage for the server, with per-filename reader-writer locking
//! and atomic upload finalization.
//!
//! Any number of downloads of one file share its read lock; finalizing an
//! upload takes the write lock, so a rename never happens under an active
//! reader and readers never observe a partially written file.

use crate::FxDashMap;
use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid filename {0:?}")]
    InvalidName(String),
    #[error("file {0:?} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The server's storage directory plus the per-filename lock table.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    locks: FxDashMap<String, Arc<RwLock<()>>>,
}

impl Storage {
    /// Opens (creating if needed) the storage directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: FxDashMap::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remote names must be bare filenames; anything that could escape the
    /// storage directory is rejected.
    pub fn validate_name(name: &str) -> Result<(), StorageError> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0');
        if invalid {
            return Err(StorageError::InvalidName(name.to_owned()));
        }
        Ok(())
    }

    fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared lock held by downloads for the duration of the transfer.
    pub async fn read_lock(&self, name: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(name).read_owned().await
    }

    async fn write_lock(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(name).write_owned().await
    }

    pub fn final_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.final_path(name).is_file()
    }

    /// Creates a fresh `.<name>.upload.<suffix>` temp file for an upload in
    /// progress.
    pub async fn create_upload_temp(&self, name: &str) -> Result<(File, PathBuf), StorageError> {
        Self::validate_name(name)?;
        let mut rng = SmallRng::from_entropy();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            let path = self.root.join(format!(".{name}.upload.{suffix}"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Atomically replaces the final file with the finished temp file.
    /// Blocks until every current reader of `name` has finished; a rename
    /// within one directory is atomic, so no reader ever sees a partial
    /// file at the final name.
    pub async fn finalize_upload(
        &self,
        name: &str,
        temp_path: &Path,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock(name).await;
        let final_path = self.final_path(name);
        match tokio::fs::remove_file(&final_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        tokio::fs::rename(temp_path, &final_path).await?;
        tracing::info!(name, "upload finalized");
        Ok(())
    }

    /// Removes an abandoned upload temp file.
    pub async fn discard_upload(&self, temp_path: &Path) {
        if let Err(error) = tokio::fs::remove_file(temp_path).await {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!(?temp_path, %error, "could not remove upload temp file");
            }
        }
    }

    /// Opens a stored file for a download. Callers hold the read lock for
    /// the whole transfer.
    pub async fn open_for_download(&self, name: &str) -> Result<File, StorageError> {
        Self::validate_name(name)?;
        match File::open(self.final_path(name)).await {
            Ok(file) => Ok(file),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_owned()))
            }
            Err(error) => Err(error.into()),
        }
    }
}
