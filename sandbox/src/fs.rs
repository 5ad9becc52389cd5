use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::errors::{Result, SandboxError};
use crate::path::{self, RelativePath};
use crate::retry::RetryPolicy;
use crate::state::{Observation, StateStore};

/// Directory under the root that receives uploaded files.
pub const UPLOADS_DIR: &str = "uploads";

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub base_dir: PathBuf,
    pub max_file_size: u64,
    pub retry: RetryPolicy,
}

impl SandboxConfig {
    /// Creates the root if needed and pins it to its canonical form.
    pub fn new(base_dir: impl AsRef<Path>, max_file_size: u64) -> Result<Self> {
        let base = path::ensure_absolute_base(base_dir.as_ref())?;
        Ok(Self {
            base_dir: base,
            max_file_size,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Sandboxed filesystem whose mutations are verified, retried, and mirrored
/// into the [`StateStore`].
#[derive(Clone, Debug)]
pub struct SandboxFs {
    config: Arc<SandboxConfig>,
    state: Arc<StateStore>,
    cancellation: CancellationToken,
}

impl SandboxFs {
    pub fn new(config: SandboxConfig, state: Arc<StateStore>) -> Self {
        Self {
            config: Arc::new(config),
            state,
            cancellation: CancellationToken::new(),
        }
    }

    /// Same sandbox, but retry loops stop when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
            cancellation: token,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        path::resolve(&self.config.base_dir, relative)
    }

    pub fn relative(&self, absolute: &Path) -> Result<RelativePath> {
        path::relative_path(&self.config.base_dir, absolute)
    }

    pub(crate) async fn resolve_blocking(&self, relative: &str) -> Result<PathBuf> {
        let base = self.config.base_dir.clone();
        let relative = relative.to_string();
        blocking(move || path::resolve(&base, &relative)).await
    }

    #[instrument(skip(self))]
    pub async fn create_folder(&self, relative: &str) -> Result<String> {
        let target = self.resolve_blocking(relative).await?;
        self.config
            .retry
            .run("create_folder", &self.cancellation, || {
                let target = target.clone();
                blocking(move || {
                    fs::create_dir_all(&target).map_err(|err| SandboxError::io(&target, err))?;
                    if !target.is_dir() {
                        return Err(SandboxError::CreateFailed { path: target });
                    }
                    Ok(())
                })
            })
            .await?;

        self.flush(&target).await;
        let rel = self.relative(&target)?;
        self.state.record_created(&rel, true).await?;
        info!(path = %target.display(), "folder created and verified");
        Ok(format!("Folder created: {}", rel))
    }

    #[instrument(skip(self, content), fields(size = content.as_ref().len()))]
    pub async fn create_file(&self, relative: &str, content: impl AsRef<[u8]>) -> Result<String> {
        let (rel, size) = self
            .write_verified("create_file", relative, content.as_ref())
            .await?;
        Ok(format!("File created: {} (Size: {} bytes)", rel, size))
    }

    #[instrument(skip(self, content), fields(size = content.as_ref().len()))]
    pub async fn write_file(&self, relative: &str, content: impl AsRef<[u8]>) -> Result<String> {
        let (rel, size) = self
            .write_verified("write_file", relative, content.as_ref())
            .await?;
        Ok(format!("Content written to file: {} (Size: {} bytes)", rel, size))
    }

    async fn write_verified(
        &self,
        label: &str,
        relative: &str,
        content: &[u8],
    ) -> Result<(RelativePath, u64)> {
        let target = self.resolve_blocking(relative).await?;
        let size = content.len() as u64;
        if size > self.config.max_file_size {
            return Err(SandboxError::FileTooLarge { path: target, size });
        }
        let content: Arc<[u8]> = Arc::from(content);

        let written = self
            .config
            .retry
            .run(label, &self.cancellation, || {
                let target = target.clone();
                let content = content.clone();
                blocking(move || write_and_verify(&target, &content))
            })
            .await?;

        self.flush(&target).await;
        let rel = self.relative(&target)?;
        self.state.record_created(&rel, false).await?;
        info!(path = %target.display(), size = written, "file written and verified");
        Ok((rel, written))
    }

    #[instrument(skip(self))]
    pub async fn read_file(&self, relative: &str) -> Result<String> {
        let target = self.resolve_blocking(relative).await?;
        let max = self.config.max_file_size;
        blocking(move || {
            if !target.is_file() {
                return Err(SandboxError::NotFound { path: target });
            }
            let size = fs::metadata(&target)
                .map_err(|err| SandboxError::io(&target, err))?
                .len();
            if size > max {
                return Err(SandboxError::FileTooLarge { path: target, size });
            }
            let bytes = fs::read(&target).map_err(|err| SandboxError::io(&target, err))?;
            String::from_utf8(bytes).map_err(|_| {
                SandboxError::InvalidOperation(format!(
                    "'{}' is not valid utf-8",
                    target.display()
                ))
            })
        })
        .await
    }

    /// Stores an uploaded file in the uploads directory under its final name component.
    #[instrument(skip(self, content))]
    pub async fn upload(&self, filename: &str, content: impl AsRef<[u8]>) -> Result<String> {
        let name = upload_name(filename)?;
        self.create_file(&format!("{UPLOADS_DIR}/{name}"), content).await?;
        Ok(format!("File {name} uploaded successfully to uploads directory"))
    }

    /// Removes a file or an empty directory. Non-empty directories are refused.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, relative: &str) -> Result<String> {
        let target = self.resolve_blocking(relative).await?;
        if target == self.config.base_dir {
            return Err(SandboxError::InvalidOperation(
                "refusing to delete the sandbox root".to_string(),
            ));
        }

        let is_folder = self
            .config
            .retry
            .run("delete_file", &self.cancellation, || {
                let target = target.clone();
                blocking(move || remove_entry(&target))
            })
            .await?;

        self.flush(&target).await;
        let rel = self.relative(&target)?;
        self.state.incremental_update(&rel, is_folder, true).await?;
        info!(path = %target.display(), "deleted");
        Ok(format!("Deleted: {}", rel))
    }

    /// Lists direct children and feeds every entry into the state cache.
    #[instrument(skip(self))]
    pub async fn list_entries(&self, relative: &str) -> Result<Vec<FileEntry>> {
        let target = self.resolve_blocking(relative).await?;
        let base = self.config.base_dir.clone();
        let (entries, observations) = blocking(move || list_dir(&base, &target)).await?;
        self.state.observe(&observations).await?;
        Ok(entries)
    }

    /// Best-effort flush of OS buffers for the touched entry's directory.
    async fn flush(&self, target: &Path) {
        let dir = match target.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return,
        };
        let result = blocking(move || {
            fs::File::open(&dir)
                .and_then(|handle| handle.sync_all())
                .map_err(|err| SandboxError::io(&dir, err))
        })
        .await;
        if let Err(err) = result {
            warn!(%err, "error syncing file system");
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

fn upload_name(filename: &str) -> Result<&str> {
    let name = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(SandboxError::InvalidOperation(format!(
            "invalid upload file name: '{filename}'"
        )));
    }
    Ok(name)
}

/// Runs blocking filesystem work on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| SandboxError::InvalidOperation(format!("blocking task failed: {err}")))?
}

fn write_and_verify(target: &Path, content: &[u8]) -> Result<u64> {
    if target.is_dir() {
        return Err(SandboxError::InvalidOperation(format!(
            "'{}' is a directory",
            target.display()
        )));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| SandboxError::io(parent, err))?;
    }
    {
        let mut file = fs::File::create(target).map_err(|err| SandboxError::io(target, err))?;
        io::Write::write_all(&mut file, content).map_err(|err| SandboxError::io(target, err))?;
        file.sync_all().map_err(|err| SandboxError::io(target, err))?;
    }
    let read_back = match fs::read(target) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SandboxError::Verification {
                path: target.to_path_buf(),
                detail: "file vanished after write".to_string(),
            })
        }
        Err(err) => return Err(SandboxError::io(target, err)),
    };
    #[cfg(test)]
    let read_back = fault::corrupt_read(target, read_back);
    if read_back != content {
        return Err(SandboxError::Verification {
            path: target.to_path_buf(),
            detail: format!(
                "expected {} bytes, read back {} bytes",
                content.len(),
                read_back.len()
            ),
        });
    }
    Ok(read_back.len() as u64)
}

/// Returns whether the removed entry was a directory.
fn remove_entry(target: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(SandboxError::NotFound {
                path: target.to_path_buf(),
            })
        }
        Err(err) => return Err(SandboxError::io(target, err)),
    };
    let is_dir = metadata.is_dir();
    if is_dir {
        let mut children = fs::read_dir(target).map_err(|err| SandboxError::io(target, err))?;
        if children.next().is_some() {
            return Err(SandboxError::InvalidOperation(format!(
                "directory '{}' is not empty",
                target.display()
            )));
        }
        fs::remove_dir(target).map_err(|err| SandboxError::io(target, err))?;
    } else {
        fs::remove_file(target).map_err(|err| SandboxError::io(target, err))?;
    }
    if fs::symlink_metadata(target).is_ok() {
        return Err(SandboxError::Verification {
            path: target.to_path_buf(),
            detail: "entry still present after removal".to_string(),
        });
    }
    Ok(is_dir)
}

fn list_dir(base: &Path, target: &Path) -> Result<(Vec<FileEntry>, Vec<Observation>)> {
    if !target.exists() {
        return Err(SandboxError::NotFound {
            path: target.to_path_buf(),
        });
    }
    if !target.is_dir() {
        return Err(SandboxError::InvalidOperation(format!(
            "'{}' is not a directory",
            target.display()
        )));
    }
    let mut entries = Vec::new();
    let mut observations = Vec::new();
    for entry in fs::read_dir(target).map_err(|err| SandboxError::io(target, err))? {
        let entry = entry.map_err(|err| SandboxError::io(target, err))?;
        let entry_path = entry.path();
        // Dangling symlinks still show up, described by the link itself.
        let metadata = fs::metadata(&entry_path)
            .or_else(|_| fs::symlink_metadata(&entry_path))
            .map_err(|err| SandboxError::io(&entry_path, err))?;
        let name = entry.file_name().into_string().map_err(|_| {
            SandboxError::InvalidOperation("invalid utf8 filename".to_string())
        })?;
        let is_dir = metadata.is_dir();
        entries.push(FileEntry {
            name,
            is_directory: is_dir,
            size: if metadata.is_file() {
                Some(metadata.len())
            } else {
                None
            },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
        observations.push(Observation {
            path: path::relative_path(base, &entry_path)?,
            is_dir,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((entries, observations))
}
