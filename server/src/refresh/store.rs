//! Destination file handling.
//!
//! The destination is only ever replaced by renaming a fully written
//! temporary file from the same directory over it, so readers see either the
//! old contents or the new ones.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use chrono::{DateTime, Local};
use tempfile::NamedTempFile;

/// Replace `dest` with the contents written by `fill`.
///
/// Creates the parent directory if needed. If `fill` or any later step
/// fails, the temporary file is removed and `dest` is left untouched.
pub fn write_atomic<F>(dest: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    fill(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Last modification time of `path`, or `None` if it does not exist.
pub fn modified_time(path: &Path) -> io::Result<Option<DateTime<Local>>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?.into())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
