//! Per-run working directory
//!
//! Every run gets a fresh directory under the work root, named after a
//! generated run id, and removes it when closed or dropped.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

pub struct Workspace {
    run_id: Uuid,
    dir: tempfile::TempDir,
}

impl Workspace {
    /// Create a new, empty directory for one run under `root`
    pub async fn allocate(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create work root {}", root.display()))?;

        let run_id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("run-{}-", run_id))
            .tempdir_in(root)
            .with_context(|| format!("Failed to create workspace under {}", root.display()))?;

        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file into the workspace, returning its path
    pub async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove the directory and everything the run left in it
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove workspace {}", path.display()))
    }
}
