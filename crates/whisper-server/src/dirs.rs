use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform-specific app data dir (`~/.local/share/whisper/`, etc.), created
/// if missing. Used for the redb file when `WHISPER_DATA_DIR` is unset.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "whisper")
        .context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}
