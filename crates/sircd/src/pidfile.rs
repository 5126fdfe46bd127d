use std::{fs, io, path::PathBuf};

use tracing::{debug, warn};

/// A single-line pid file, removed again on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: PathBuf) -> io::Result<Self> {
        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove pid file");
        }
    }
}
