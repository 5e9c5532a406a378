//! Per-job artifact workspace
//!
//! ```text
//! <root>/<job_id>/
//!   input.json               input reference manifest
//!   separation/              committed stage outputs, one dir per stage
//!   transcription/
//!   beat_analysis/
//!   tmp/<stage>-<attempt>/   staging dir of a running attempt
//! ```
//!
//! Stage outputs are written to a staging directory and renamed into place
//! on success, so a half-written stage directory is never referenced. Every
//! cleanup operation treats a missing path as success.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stemflow_storage::{ArtifactRef, JobId, StageId};
use tracing::debug;

const INPUT_MANIFEST: &str = "input.json";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputManifest {
    pub job_id: JobId,
    pub input_ref: String,
    pub options: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactWorkspace {
    root: PathBuf,
}

impl ArtifactWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub fn stage_dir(&self, job_id: &JobId, stage: StageId) -> PathBuf {
        self.job_dir(job_id).join(stage.as_str())
    }

    pub fn staging_dir(&self, job_id: &JobId, stage: StageId, attempt: u32) -> PathBuf {
        self.job_dir(job_id)
            .join(TMP_DIR)
            .join(format!("{}-{}", stage.as_str(), attempt))
    }

    /// Create the job directory and write the input manifest
    pub async fn prepare(&self, manifest: &InputManifest) -> io::Result<PathBuf> {
        let dir = self.job_dir(&manifest.job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(manifest)?;
        tokio::fs::write(dir.join(INPUT_MANIFEST), json).await?;
        Ok(dir)
    }

    pub async fn read_manifest(&self, job_id: &JobId) -> io::Result<InputManifest> {
        let bytes = tokio::fs::read(self.job_dir(job_id).join(INPUT_MANIFEST)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// When the job directory was set up: the manifest's submission time, or
    /// the directory's modification time when the manifest is missing or torn
    pub async fn created_at(&self, job_id: &JobId) -> io::Result<DateTime<Utc>> {
        if let Ok(manifest) = self.read_manifest(job_id).await {
            return Ok(manifest.submitted_at);
        }
        let modified = tokio::fs::metadata(self.job_dir(job_id)).await?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    /// Ids of the job directories under the root; other entries are skipped
    pub async fn job_ids(&self) -> io::Result<Vec<JobId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(job_id) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                ids.push(job_id);
            }
        }
        Ok(ids)
    }

    /// Fresh, empty staging directory for an attempt
    pub async fn prepare_staging(&self, job_id: &JobId, stage: StageId, attempt: u32) -> io::Result<PathBuf> {
        let dir = self.staging_dir(job_id, stage, attempt);
        remove_dir_if_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Atomically move the attempt's staging directory into the stage directory
    pub async fn commit(&self, job_id: &JobId, stage: StageId, attempt: u32) -> io::Result<ArtifactRef> {
        let staging = self.staging_dir(job_id, stage, attempt);
        let target = self.stage_dir(job_id, stage);

        // Leftover from an attempt that committed but never got recorded
        remove_dir_if_exists(&target).await?;
        tokio::fs::rename(&staging, &target).await?;

        debug!(job_id = %job_id, stage = %stage, path = %target.display(), "stage output committed");
        Ok(ArtifactRef::new(target.to_string_lossy().into_owned()))
    }

    /// Drop staging directories; idempotent
    pub async fn cleanup_temp(&self, job_id: &JobId) -> io::Result<()> {
        remove_dir_if_exists(&self.job_dir(job_id).join(TMP_DIR)).await
    }

    /// Delete everything stored for the job; idempotent
    pub async fn remove_all(&self, job_id: &JobId) -> io::Result<()> {
        remove_dir_if_exists(&self.job_dir(job_id)).await
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
