//! Content-addressed bundle cache backed by a scratch directory.
//!
//! Artifacts are stored as `{fingerprint}.js`. A `create` reserves an empty
//! slot; `put_data` stages the bytes to a temp file and renames over the
//! slot, so concurrent identical uploads converge and `describe` never sees
//! a half-written artifact (zero-size slots report absent).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::hash::is_valid_fingerprint;

const ARTIFACT_EXT: &str = "js";

/// Metadata reported by `GET /bundles/{hash}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub hash: String,
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// Outcome of a `put_data` call, mapped to a response status by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// No slot was reserved for this fingerprint.
    NoSlot,
    /// The requested compression codec is not recognized; nothing written.
    UnknownCompression,
}

pub struct BundleStore {
    dir: PathBuf,
}

impl BundleStore {
    /// Open (creating if absent) the bundle directory.
    ///
    /// When the directory already holds more than `clear_threshold`
    /// artifacts, the whole cache is wiped. Bundles are cheap to re-upload
    /// and content-addressed, so a coarse bulk clear keeps the upload
    /// fast-path's "miss is rare" assumption calibrated.
    pub async fn open(dir: impl Into<PathBuf>, clear_threshold: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self { dir };
        let count = store.artifact_count().await?;
        if count > clear_threshold {
            tracing::info!(count, clear_threshold, "Bundle cache over threshold, clearing");
            store.clear().await?;
        }
        Ok(store)
    }

    /// Reserve an empty slot under the fingerprint. Idempotent: an existing
    /// slot (empty or written) is left untouched.
    pub async fn create(&self, hash: &str) -> Result<()> {
        let path = self.slot_path(hash)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tokio::fs::write(&path, b"").await?;
                tracing::debug!(hash, "Bundle slot reserved");
                Ok(())
            }
        }
    }

    /// Write the artifact bytes into a previously reserved slot.
    pub async fn put_data(
        &self,
        hash: &str,
        data: &[u8],
        compression: Option<&str>,
    ) -> Result<PutOutcome> {
        match compression {
            None | Some("none") => {}
            Some(other) => {
                tracing::warn!(hash, compression = other, "Unknown bundle compression refused");
                return Ok(PutOutcome::UnknownCompression);
            }
        }

        let path = self.slot_path(hash)?;
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(PutOutcome::NoSlot);
        }

        // Stage then rename so describe never observes a partial write and
        // racing writers of identical bytes both complete.
        let staging = self.dir.join(format!(".{hash}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, &path).await?;

        tracing::info!(hash, size = data.len(), "Bundle stored");
        Ok(PutOutcome::Stored)
    }

    /// Look up a bundle. Reserved-but-unwritten slots report absent.
    pub async fn describe(&self, hash: &str) -> Result<Option<BundleRecord>> {
        let path = self.slot_path(hash)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.len() == 0 {
            return Ok(None);
        }
        let created = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(BundleRecord {
            hash: hash.to_string(),
            size: meta.len(),
            created,
        }))
    }

    /// Filesystem path of a cached artifact, for handing to the worker
    /// launcher. Does not check existence.
    pub fn artifact_path(&self, hash: &str) -> Result<PathBuf> {
        self.slot_path(hash)
    }

    /// Number of artifacts (written or reserved) currently in the cache.
    pub async fn artifact_count(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if is_artifact(&entry.path()) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if is_artifact(&entry.path()) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    fn slot_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_fingerprint(hash) {
            return Err(FleetError::BundleRejected(format!(
                "invalid fingerprint: {hash}"
            )));
        }
        Ok(self.dir.join(format!("{hash}.{ARTIFACT_EXT}")))
    }
}

fn is_artifact(path: &Path) -> bool {
    path.extension().map(|e| e == ARTIFACT_EXT).unwrap_or(false)
}
