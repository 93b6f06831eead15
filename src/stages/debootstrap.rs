//! Bootstrap stage: produce a minimal root filesystem tree.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::cache::{CacheStore, Stage};
use crate::descriptor::BuildDescriptor;
use crate::error::Result;
use crate::process::Cmd;

/// Bootstraps a minimal root filesystem with debootstrap.
pub struct Debootstrap<'a> {
    desc: &'a BuildDescriptor,
}

impl<'a> Debootstrap<'a> {
    pub fn new(desc: &'a BuildDescriptor) -> Self {
        Self { desc }
    }

    /// Populate `dest` with the bootstrapped tree.
    ///
    /// A tree that already carries a non-empty `etc/` is reused as-is,
    /// without consulting the cache; manually prepared trees must not be
    /// clobbered. Otherwise the stage extracts a cached archive when one
    /// exists for the current key, or runs debootstrap and stores the
    /// result. A debootstrap failure is fatal; there is no retry.
    pub fn build(&self, dest: &Path) -> Result<()> {
        if tree_already_populated(dest) {
            info!(path = %dest.display(), "tree already exists: reusing it");
            return Ok(());
        }

        info!(
            distribution = self.desc.distribution(),
            architecture = self.desc.architecture(),
            "bootstrapping base system"
        );

        let store = CacheStore::open(self.desc.cache_dir())?;
        let entry = store.acquire(dest, Stage::Debootstrap, self.desc.debootstrap_key());
        if entry.hit() {
            entry.extract()?;
            return Ok(());
        }

        self.run_debootstrap(dest)?;
        self.clean_apt_cache(dest)?;
        entry.store()
    }

    fn run_debootstrap(&self, dest: &Path) -> Result<()> {
        let mut cmd = Cmd::new("debootstrap")
            .eatmydata()
            .arg(format!("--arch={}", self.desc.architecture()));
        if !self.desc.packages().is_empty() {
            // The set is sorted at descriptor construction.
            cmd = cmd.arg(format!("--include={}", self.desc.packages().join(",")));
        }
        cmd.arg(self.desc.distribution())
            .arg(dest)
            .arg(self.desc.build_mirror())
            .run()
    }

    /// Drop the downloaded package archives from the fresh tree; they only
    /// bloat the cached artifact.
    fn clean_apt_cache(&self, dest: &Path) -> Result<()> {
        Cmd::new("chroot")
            .eatmydata()
            .arg(dest)
            .args(["apt-get", "clean"])
            .run()
    }
}

/// A non-empty `etc/` marks a previously prepared tree.
fn tree_already_populated(dest: &Path) -> bool {
    match fs::read_dir(dest.join("etc")) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
