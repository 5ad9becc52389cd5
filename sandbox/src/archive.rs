use std::fs;
use std::io::{self, Cursor};
use std::path::Path;

use tracing::{info, instrument};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::{Result, SandboxError};
use crate::fs::{blocking, SandboxFs};
use crate::path;
use crate::state::walk_error;

impl SandboxFs {
    /// Zips the whole sandbox tree in memory. Links are left out and so is the
    /// snapshot file when it lives inside the root.
    #[instrument(skip(self))]
    pub async fn archive_tree(&self) -> Result<Vec<u8>> {
        let root = self.base_dir().to_path_buf();
        let skip = self.state().snapshot_path().to_path_buf();
        let bytes = blocking(move || build_archive(&root, &skip)).await?;
        info!(size = bytes.len(), "project archive built");
        Ok(bytes)
    }
}

fn build_archive(root: &Path, skip: &Path) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let file_options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let dir_options = FileOptions::default();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| walk_error(root, err))?;
        let entry_path = entry.path();
        if entry_path == skip {
            continue;
        }
        let name = path::relative_path(root, entry_path)?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            writer
                .add_directory(format!("{}/", name.as_str()), dir_options)
                .map_err(archive_error)?;
        } else if file_type.is_file() {
            writer
                .start_file(name.as_str(), file_options)
                .map_err(archive_error)?;
            let mut file =
                fs::File::open(entry_path).map_err(|err| SandboxError::io(entry_path, err))?;
            io::copy(&mut file, &mut writer).map_err(|err| SandboxError::io(entry_path, err))?;
        }
    }

    let cursor = writer.finish().map_err(archive_error)?;
    Ok(cursor.into_inner())
}

fn archive_error(err: zip::result::ZipError) -> SandboxError {
    SandboxError::Archive(err.to_string())
}
