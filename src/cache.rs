//! Stage artifact cache.
//!
//! Each pipeline stage persists its finished output directory as a gzipped
//! tar archive named after the stage and the cache key derived from the
//! configuration that produced it: `<cache_dir>/<stage>-<hexdigest>.tar.gz`.
//! A later build with the same key extracts the archive instead of redoing
//! the work. Entries are never mutated under a different key and never
//! garbage-collected here; a changed configuration simply produces a new
//! archive next to the old one.
//!
//! Caching is an optimization, not a correctness dependency: opening the
//! store without a directory yields a null store where every lookup misses
//! and every store is a no-op.
//!
//! The store performs no locking. Two builds sharing a cache directory and
//! key may race on archive creation; running them concurrently is unsafe.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder as TarBuilder;
use tracing::info;
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// The pipeline stages with a cached artifact, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Debootstrap,
    Chroot,
    Squashfs,
}

impl Stage {
    /// Name used in archive files and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Debootstrap => "debootstrap",
            Stage::Chroot => "chroot",
            Stage::Squashfs => "squashfs",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive store for stage outputs.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: Option<PathBuf>,
}

impl CacheStore {
    /// Open the store at `dir`, creating the directory if needed.
    /// `None` disables caching.
    pub fn open(dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(|source| BuildError::CacheIo {
                op: "open",
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(Self {
            dir: dir.map(Path::to_path_buf),
        })
    }

    /// Look up the archive for `(stage, key)` and return a handle scoped to
    /// `path`, the directory the stage builds into.
    ///
    /// Caller protocol: on a hit, [`CacheEntry::extract`] must run before
    /// the stage output is used; on a miss, the caller populates `path`
    /// from scratch and then calls [`CacheEntry::store`].
    pub fn acquire(&self, path: &Path, stage: Stage, key: &str) -> CacheEntry {
        let archive = self
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.tar.gz", stage, key)));
        let hit = archive.as_deref().is_some_and(Path::is_file);
        if let Some(archive) = &archive {
            if hit {
                info!(archive = %archive.display(), "cache hit: reusing it");
            } else {
                info!(archive = %archive.display(), "cache miss: (re)creating it");
            }
        }
        CacheEntry {
            path: path.to_path_buf(),
            archive,
            hit,
        }
    }
}

/// Handle for one `(stage, key)` cache lookup, scoped to the directory the
/// stage builds into.
#[derive(Debug)]
pub struct CacheEntry {
    path: PathBuf,
    archive: Option<PathBuf>,
    hit: bool,
}

impl CacheEntry {
    /// Whether an archive exists for this entry's key.
    pub fn hit(&self) -> bool {
        self.hit
    }

    /// Archive path, when caching is enabled.
    pub fn archive(&self) -> Option<&Path> {
        self.archive.as_deref()
    }

    /// Recreate the scoped directory from the archive.
    ///
    /// The destination is always rebuilt from empty: anything already at
    /// `path` is removed first. Extraction happens into a sibling directory
    /// that is renamed into place once complete, so an interrupted extract
    /// never leaves a half-populated destination behind.
    pub fn extract(&self) -> Result<()> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        self.extract_inner(archive)
            .map_err(|source| BuildError::CacheIo {
                op: "extract",
                path: archive.clone(),
                source,
            })
    }

    fn extract_inner(&self, archive: &Path) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(tmp_name("extract"));
        fs::create_dir_all(&tmp)?;

        let file = File::open(archive)?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker.set_preserve_permissions(true);
        unpacker.unpack(&tmp)?;

        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        fs::rename(&tmp, &self.path)
    }

    /// Persist the full contents of the scoped directory as this entry's
    /// archive, replacing any previous archive under the same key.
    ///
    /// No-op on a null store.
    pub fn store(&self) -> Result<()> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        self.store_inner(archive)
            .map_err(|source| BuildError::CacheIo {
                op: "store",
                path: archive.clone(),
                source,
            })
    }

    fn store_inner(&self, archive: &Path) -> io::Result<()> {
        let parent = archive.parent().unwrap_or_else(|| Path::new("."));
        let tmp = parent.join(tmp_name("store.tar.gz"));
        create_tar_gz(&self.path, &tmp)?;
        // Write-then-rename, so a partial archive can never be taken for a
        // valid hit by a later run.
        match fs::rename(&tmp, archive) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }
}

/// Default per-user cache directory, when the platform has one.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("livebuilder"))
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{prefix}-{n}")
}

/// Pack `src_dir` into a gzipped tar at `out_path`.
///
/// Entries are walked in sorted order with zeroed mtime/uid/gid so that
/// identical trees produce identical archives. Symlinks are stored as
/// symlinks and mode bits are preserved.
fn create_tar_gz(src_dir: &Path, out_path: &Path) -> io::Result<()> {
    let out = File::create(out_path)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = Vec::new();
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.map_err(io::Error::other)?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.path().to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode());
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
        // Sockets and fifos are skipped; nothing in a stage tree needs them.
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}
