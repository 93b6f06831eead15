//! Scoped working directories and process umask.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{IoContext, Result};

/// A working directory that is either freshly created and removed when the
/// value drops, or supplied by the caller and left alone.
///
/// The persistent form exists so a caller can keep the chroot and automation
/// directories around between runs for inspection or retry; cleaning those
/// up is then the caller's job.
#[derive(Debug)]
pub enum WorkDir {
    Temp(TempDir),
    Persistent(PathBuf),
}

impl WorkDir {
    pub fn new(persistent: Option<&Path>) -> Result<Self> {
        match persistent {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .io_context(|| format!("creating work directory '{}'", dir.display()))?;
                Ok(Self::Persistent(dir.to_path_buf()))
            }
            None => {
                let temp = TempDir::new()
                    .io_context(|| "creating temporary work directory".to_string())?;
                Ok(Self::Temp(temp))
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Temp(temp) => temp.path(),
            Self::Persistent(path) => path,
        }
    }
}

/// Sets the process umask and restores the previous one on drop.
///
/// The whole pipeline runs under `022` so files created on the host side of
/// the chroot boundary come out world-readable.
#[derive(Debug)]
pub struct UmaskGuard {
    previous: libc::mode_t,
}

impl UmaskGuard {
    pub fn set(mask: libc::mode_t) -> Self {
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.previous);
        }
    }
}
