use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};

/// A sandbox-relative path with forward slashes and no `.` segments.
///
/// The empty string names the sandbox root itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(raw: &str) -> Self {
        let normalized = raw.replace('\\', "/");
        let parts: Vec<&str> = normalized
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect();
        RelativePath(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Caller-facing form: `.` for the root.
    pub fn display_or_dot(&self) -> &str {
        if self.is_root() {
            "."
        } else {
            &self.0
        }
    }

    pub fn parent(&self) -> Option<RelativePath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rsplit_once('/') {
            Some((parent, _)) => RelativePath(parent.to_string()),
            None => RelativePath::default(),
        })
    }

    /// Every proper ancestor, nearest last, excluding the root.
    pub fn ancestors(&self) -> Vec<RelativePath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            if path.is_root() {
                break;
            }
            current = path.parent();
            out.push(path);
        }
        out.reverse();
        out
    }

    pub fn join(&self, child: &str) -> RelativePath {
        if self.is_root() {
            RelativePath::new(child)
        } else {
            RelativePath::new(&format!("{}/{}", self.0, child))
        }
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_or_dot())
    }
}

impl From<&str> for RelativePath {
    fn from(value: &str) -> Self {
        RelativePath::new(value)
    }
}

/// Makes the root absolute, creates it, and returns its canonical form.
pub fn ensure_absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_relative() {
        return Err(SandboxError::InvalidOperation(
            "sandbox base directory must be absolute".to_string(),
        ));
    }
    std::fs::create_dir_all(base_dir).map_err(|err| SandboxError::io(base_dir, err))?;
    base_dir
        .canonicalize()
        .map_err(|err| SandboxError::io(base_dir, err))
}

/// Resolves caller input against the canonical `base_dir`.
///
/// Leading separators are stripped so the input is always taken as relative.
/// Input whose `..` segments climb above the root on their own is rejected
/// before any I/O. The rest is walked segment by segment: a symlink is
/// followed before a later `..` applies, so `link/..` names the link target's
/// parent, and every hop must stay inside the root.
pub fn resolve(base_dir: &Path, relative: &str) -> Result<PathBuf> {
    let outside = || SandboxError::OutsideRoot {
        path: relative.to_string(),
    };

    let normalized = relative.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    let mut depth = 0usize;
    for part in normalized.trim_start_matches('/').split('/') {
        match part {
            "" | "." => continue,
            ".." => depth = depth.checked_sub(1).ok_or_else(outside)?,
            other => {
                // A drive prefix such as `C:` would replace the whole path on Windows.
                if Path::new(other)
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
                {
                    return Err(outside());
                }
                depth += 1;
            }
        }
        segments.push(part);
    }

    let mut current = base_dir.to_path_buf();
    for segment in segments {
        if segment == ".." {
            if current == base_dir {
                return Err(outside());
            }
            current.pop();
            continue;
        }
        current.push(segment);
        let is_link = std::fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            // A dangling link cannot be checked against the root.
            current = current.canonicalize().map_err(|_| outside())?;
            if !current.starts_with(base_dir) {
                return Err(outside());
            }
        }
    }

    let resolved = canonicalize_existing_prefix(&current)?;
    if !resolved.starts_with(base_dir) {
        return Err(outside());
    }
    Ok(resolved)
}

/// Canonicalizes the deepest existing ancestor and re-appends the rest.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for name in missing.iter().rev() {
                    canonical.push(name);
                }
                return Ok(canonical);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                match existing.file_name() {
                    Some(name) => missing.push(name.to_os_string()),
                    None => return Err(SandboxError::io(path, err)),
                }
                if !existing.pop() {
                    return Err(SandboxError::io(path, err));
                }
            }
            Err(err) => return Err(SandboxError::io(path, err)),
        }
    }
}

/// Converts an already resolved absolute path back into its sandbox-relative form.
pub fn relative_path(base_dir: &Path, absolute: &Path) -> Result<RelativePath> {
    let stripped = absolute
        .strip_prefix(base_dir)
        .map_err(|_| SandboxError::OutsideRoot {
            path: absolute.display().to_string(),
        })?;
    let parts: Vec<String> = stripped
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(RelativePath(parts.join("/")))
}
