use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sandbox::{
    RetryPolicy, SandboxConfig, SandboxFs, ShellConfig, ShellRunner, StateStore, VirtualConsole,
};
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

/// A sandbox rooted at `<temp>/projects` with its snapshot beside it.
pub struct Workspace {
    pub temp: TempDir,
    pub fs: SandboxFs,
}

impl Workspace {
    pub async fn new() -> Result<Self> {
        let temp = temp_workspace()?;
        let config = SandboxConfig::new(temp.path().join("projects"), 512 * 1024)?
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10))?);
        let state = StateStore::open(config.base_dir.clone(), snapshot_path(&temp)).await;
        let fs = SandboxFs::new(config, Arc::new(state));
        Ok(Self { temp, fs })
    }

    /// Reopens the store from disk, as a restarted process would.
    pub async fn reopen_state(&self) -> StateStore {
        StateStore::open(self.fs.base_dir().to_path_buf(), snapshot_path(&self.temp)).await
    }

    pub fn console(&self) -> Result<VirtualConsole> {
        let shell = ShellConfig::new(
            ShellConfig::platform_default().program(),
            Duration::from_secs(5),
            64 * 1024,
        )?;
        Ok(VirtualConsole::new(self.fs.clone(), ShellRunner::new(shell)))
    }
}

fn snapshot_path(temp: &TempDir) -> PathBuf {
    temp.path().join("project_state.json")
}
