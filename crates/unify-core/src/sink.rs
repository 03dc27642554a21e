//! Where committed snapshots go besides memory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;
use tracing::{debug, info, warn};

use unify_auth_bridge::OrganisationId;

use crate::model::SyncSnapshot;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("snapshot rejected: {0}")]
    Rejected(String),
}

/// Record store adapter. `persist` runs before the in-memory swap, so a
/// failure here leaves the previous snapshot published.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn persist(&self, org: &OrganisationId, snapshot: &SyncSnapshot) -> Result<(), SinkError>;

    async fn load(&self, _org: &OrganisationId) -> Result<Option<SyncSnapshot>, SinkError> {
        Ok(None)
    }
}

pub struct NoopSink;

#[async_trait]
impl SnapshotSink for NoopSink {
    async fn persist(&self, _org: &OrganisationId, _snapshot: &SyncSnapshot) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One `<org>.json` file per organisation, replaced via rename. The stem is
/// the org id in unpadded url-safe base64, so distinct ids never share a file.
pub struct JsonFileSnapshotSink {
    dir: PathBuf,
}

impl JsonFileSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Organisations with a stored snapshot. Empty when the directory is missing.
    pub fn stored_organisations(&self) -> Result<Vec<OrganisationId>, SinkError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut orgs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_stem(stem) {
                Some(org) => orgs.push(org),
                None => warn!(path = %path.display(), "ignoring snapshot file with foreign name"),
            }
        }
        orgs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(orgs)
    }

    fn path_for(&self, org: &OrganisationId) -> PathBuf {
        let stem = URL_SAFE_NO_PAD.encode(org.as_str().as_bytes());
        self.dir.join(format!("{}.json", stem))
    }
}

fn decode_stem(stem: &str) -> Option<OrganisationId> {
    let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
    let id = String::from_utf8(bytes).ok()?;
    (!id.is_empty()).then(|| OrganisationId::new(id))
}

#[async_trait]
impl SnapshotSink for JsonFileSnapshotSink {
    async fn persist(&self, org: &OrganisationId, snapshot: &SyncSnapshot) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(org);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(%org, path = %path.display(), "snapshot written");
        Ok(())
    }

    async fn load(&self, org: &OrganisationId) -> Result<Option<SyncSnapshot>, SinkError> {
        let path = self.path_for(org);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%org, "no stored snapshot");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
