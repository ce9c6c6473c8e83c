use std::path::PathBuf;
use uuid::Uuid;

use crate::models::job::Stage;

/// Local scratch space, one directory per job and stage.
///
/// A re-executed stage gets the same directory back, emptied, so partial
/// files from an abandoned attempt never leak into the next one.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

/// Scratch directory handed to collaborators for one stage run.
#[derive(Debug, Clone)]
pub struct JobScratch {
    pub job_id: Uuid,
    pub stage: Stage,
    pub dir: PathBuf,
}

impl JobScratch {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create (or reset) the scratch directory for `stage`.
    pub async fn prepare(&self, job_id: Uuid, stage: Stage) -> std::io::Result<JobScratch> {
        let dir = self.job_dir(job_id).join(stage.as_ref());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(JobScratch { job_id, stage, dir })
    }

    /// Remove every scratch directory of the job. Missing is fine.
    pub async fn cleanup(&self, job_id: Uuid) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
