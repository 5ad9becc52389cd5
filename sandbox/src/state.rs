//! Cached mirror of the sandbox tree and its persisted snapshot.
//!
//! The cache is eventually consistent: mutation primitives update it
//! incrementally, directory listings only ever add to it, and a full rescan
//! is the one operation that reconciles it with disk.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::errors::{Result, SandboxError};
use crate::path::{self, RelativePath};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub folders: BTreeSet<RelativePath>,
    #[serde(default)]
    pub files: BTreeSet<RelativePath>,
}

impl ProjectState {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    pub fn contains_folder(&self, path: &str) -> bool {
        self.folders.contains(&RelativePath::new(path))
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains(&RelativePath::new(path))
    }

    fn apply(&mut self, path: &RelativePath, is_folder: bool, is_delete: bool) -> bool {
        if path.is_root() {
            return false;
        }
        let set = if is_folder {
            &mut self.folders
        } else {
            &mut self.files
        };
        if is_delete {
            set.remove(path)
        } else {
            set.insert(path.clone())
        }
    }
}

/// One observed directory entry, fed back from listings.
#[derive(Clone, Debug)]
pub struct Observation {
    pub path: RelativePath,
    pub is_dir: bool,
}

#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    snapshot_path: PathBuf,
    state: Mutex<ProjectState>,
}

impl StateStore {
    /// Opens the store over the canonical `root`, seeding the cache from the
    /// snapshot at `snapshot_path` when one exists.
    pub async fn open(root: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        let store = Self {
            root: root.into(),
            snapshot_path: snapshot_path.into(),
            state: Mutex::new(ProjectState::default()),
        };
        let loaded = store.load().await;
        *store.state.lock().await = loaded;
        info!(snapshot = %store.snapshot_path.display(), "project state initialized");
        store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Copy of the current cache.
    pub async fn current(&self) -> ProjectState {
        self.state.lock().await.clone()
    }

    /// Reads the persisted snapshot. A missing or unreadable snapshot is an empty state.
    pub async fn load(&self) -> ProjectState {
        match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => match serde_json::from_slice::<ProjectState>(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(snapshot = %self.snapshot_path.display(), %err, "ignoring malformed snapshot");
                    ProjectState::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => ProjectState::default(),
            Err(err) => {
                warn!(snapshot = %self.snapshot_path.display(), %err, "failed to read snapshot");
                ProjectState::default()
            }
        }
    }

    /// Overwrites the persisted snapshot with `state`.
    pub async fn save(&self, state: &ProjectState) -> Result<()> {
        let bytes =
            serde_json::to_vec(state).map_err(|err| SandboxError::Snapshot(err.to_string()))?;
        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| SandboxError::io(parent, err))?;
            }
        }
        tokio::fs::write(&self.snapshot_path, bytes)
            .await
            .map_err(|err| SandboxError::io(&self.snapshot_path, err))?;
        debug!(
            folders = state.folders.len(),
            files = state.files.len(),
            "saved project state"
        );
        Ok(())
    }

    /// Saves after a change that already happened on disk. The cache keeps
    /// the change even if the snapshot cannot be written; the next successful
    /// save or rescan brings the snapshot back in line.
    async fn persist(&self, state: &ProjectState) {
        if let Err(err) = self.save(state).await {
            warn!(snapshot = %self.snapshot_path.display(), %err, "failed to persist project state");
        }
    }

    /// Walks the whole tree and replaces the cache wholesale.
    #[instrument(skip(self))]
    pub async fn full_rescan(&self) -> Result<ProjectState> {
        let mut guard = self.state.lock().await;
        let root = self.root.clone();
        let snapshot = self.snapshot_path.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_tree(&root, &snapshot))
            .await
            .map_err(|err| SandboxError::InvalidOperation(format!("rescan task failed: {err}")))??;
        *guard = scanned.clone();
        self.save(&scanned).await?;
        info!(
            folders = scanned.folders.len(),
            files = scanned.files.len(),
            "synced project state with file system"
        );
        Ok(scanned)
    }

    /// Adds or removes one entry without checking the filesystem, then
    /// persists on a best-effort basis.
    pub async fn incremental_update(
        &self,
        path: &RelativePath,
        is_folder: bool,
        is_delete: bool,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.apply(path, is_folder, is_delete) {
            self.persist(&guard).await;
        }
        Ok(())
    }

    /// Records a freshly created entry along with every ancestor folder.
    pub(crate) async fn record_created(&self, path: &RelativePath, is_folder: bool) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut changed = false;
        for ancestor in path.ancestors() {
            changed |= guard.apply(&ancestor, true, false);
        }
        changed |= guard.apply(path, is_folder, false);
        if changed {
            self.persist(&guard).await;
        }
        Ok(())
    }

    /// Additive-only merge of listing results; stale entries are left for the next rescan.
    pub async fn observe(&self, observations: &[Observation]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut changed = false;
        for entry in observations {
            changed |= guard.apply(&entry.path, entry.is_dir, false);
        }
        if changed {
            self.persist(&guard).await;
        }
        Ok(())
    }

    /// Clears the cache and removes the snapshot file.
    pub async fn reset(&self) -> Result<ProjectState> {
        let mut guard = self.state.lock().await;
        *guard = ProjectState::default();
        match tokio::fs::remove_file(&self.snapshot_path).await {
            Ok(()) => info!("project state file cleared"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(SandboxError::io(&self.snapshot_path, err)),
        }
        Ok(guard.clone())
    }
}

fn scan_tree(root: &Path, snapshot: &Path) -> Result<ProjectState> {
    let mut state = ProjectState::default();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|err| walk_error(root, err))?;
        if entry.path() == snapshot {
            continue;
        }
        let relative = path::relative_path(root, entry.path())?;
        // Links are not descended into, but a link to a directory is a folder.
        let is_dir =
            entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir());
        if is_dir {
            state.folders.insert(relative);
        } else {
            state.files.insert(relative);
        }
    }
    Ok(state)
}

pub(crate) fn walk_error(root: &Path, err: walkdir::Error) -> SandboxError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    SandboxError::io(path, source)
}
