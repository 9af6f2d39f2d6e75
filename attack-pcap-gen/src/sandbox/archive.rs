use std::fs::File;
use std::io;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result, Stage};

/// Write the first regular file of a tar stream to `dest`, returning its size.
///
/// The engine's copy endpoint wraps a single file in a tar archive.
pub fn extract_single_file(archive: &[u8], dest: &Path) -> Result<u64> {
    let mut archive = tar::Archive::new(archive);
    let entries = archive
        .entries()
        .map_err(|e| Error::lifecycle(Stage::Copy, format!("unreadable archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::lifecycle(Stage::Copy, format!("bad archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if let Ok(path) = entry.path() {
            debug!("Extracting {} to {}", path.display(), dest.display());
        }
        let mut out = File::create(dest)?;
        let written = io::copy(&mut entry, &mut out)?;
        return Ok(written);
    }

    Err(Error::lifecycle(Stage::Copy, "archive holds no regular file"))
}
