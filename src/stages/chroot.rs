//! Customization stage: apply the playbook to the bootstrapped tree.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::ansible::PlaybookRunner;
use crate::cache::{CacheStore, Stage};
use crate::descriptor::BuildDescriptor;
use crate::error::{BuildError, IoContext, Result};
use crate::process::Cmd;
use crate::stages::Debootstrap;

/// Repository drop-ins carrying this prefix exist for build time only and
/// are removed when the tree is pointed at its installed mirror.
const INSTALL_TIME_REPO_PREFIX: &str = "inst-";

/// Customizes a bootstrapped tree with the configured playbook.
pub struct Chroot<'a> {
    desc: &'a BuildDescriptor,
}

impl<'a> Chroot<'a> {
    pub fn new(desc: &'a BuildDescriptor) -> Self {
        Self { desc }
    }

    /// Produce the customized tree in `dest`.
    ///
    /// A tree with an existing `etc/` is reused untouched; this guard comes
    /// before the cache so a manually seeded tree bypasses both it and the
    /// post steps. On a cache hit the playbook still replays against the
    /// extracted tree, because its side effects can depend on the extracted
    /// state, and the archive is re-stored only when that replay changed
    /// something. On a miss the tree is bootstrapped fresh, customized, and
    /// always stored. The post steps then run on both cache paths.
    pub fn build(&self, dest: &Path) -> Result<()> {
        if dest.join("etc").is_dir() {
            info!(path = %dest.display(), "tree already exists: reusing it");
            return Ok(());
        }

        let store = CacheStore::open(self.desc.cache_dir())?;
        let entry = store.acquire(dest, Stage::Chroot, self.desc.chroot_key());
        if entry.hit() {
            entry.extract()?;
            if self.run_playbook(dest)? {
                entry.store()?;
            } else {
                info!("playbook changed nothing: keeping previous cache entry");
            }
        } else {
            Debootstrap::new(self.desc).build(dest)?;
            self.run_playbook(dest)?;
            entry.store()?;
        }

        self.update_initramfs(dest)?;
        self.set_target_apt_mirror(dest)?;
        if self.desc.networkd() {
            self.enable_networkd(dest)?;
        }
        Ok(())
    }

    /// Run the playbook once and report whether it changed the tree.
    ///
    /// Any failed task is terminal. The same invocation is repeated once
    /// with full verbosity purely to get usable diagnostics into the log;
    /// whatever that rerun does, the stage fails.
    fn run_playbook(&self, dest: &Path) -> Result<bool> {
        info!(
            path = %dest.display(),
            playbook = self.desc.playbook(),
            "customizing tree"
        );
        let runner = PlaybookRunner::new(self.desc);
        let report = runner.run(dest, false)?;

        if report.failed() {
            warn!(
                failed = report.stats.failed,
                "playbook reported failures: rerunning once to surface diagnostics"
            );
            let _ = runner.run(dest, true);
            return Err(BuildError::PlaybookFailed {
                failed: report.stats.failed,
            });
        }

        Ok(report.changed_anything())
    }

    /// Refresh the initramfs when the tree ships the tool for it.
    fn update_initramfs(&self, dest: &Path) -> Result<()> {
        if dest.join("usr/sbin/update-initramfs").exists() {
            info!("updating the initramfs");
            Cmd::new("chroot")
                .eatmydata()
                .arg(dest)
                .args(["/usr/sbin/update-initramfs", "-u"])
                .run()?;
        }
        Ok(())
    }

    /// Point apt at the installed-time mirror.
    ///
    /// After this runs, apt inside the tree may well stop working from the
    /// build host; the configuration is for the installed system.
    fn set_target_apt_mirror(&self, dest: &Path) -> Result<()> {
        rewrite_apt_sources(
            dest,
            self.desc.installed_mirror(),
            self.desc.distribution(),
            self.desc.installed_mirror_components(),
        )?;

        // The installed mirror may be unreachable from here, and that is ok.
        Cmd::new("chroot")
            .eatmydata()
            .arg(dest)
            .args(["apt-get", "update"])
            .run_unchecked()?;
        Cmd::new("chroot")
            .eatmydata()
            .arg(dest)
            .args(["apt-get", "clean"])
            .run()
    }

    /// Enable systemd-networkd and systemd-resolved in the tree.
    ///
    /// This runs after customization because a resolv.conf delegated to
    /// resolved breaks apt's network access inside the chroot, where
    /// resolved is not running.
    fn enable_networkd(&self, dest: &Path) -> Result<()> {
        for unit in ["systemd-networkd", "systemd-resolved"] {
            Cmd::new("chroot")
                .eatmydata()
                .arg(dest)
                .args(["systemctl", "enable", unit])
                .run()?;
        }
        delegate_resolv_conf(dest)
    }
}

/// Rewrite the tree's apt configuration for the installed system: drop
/// `sources.list`, drop install-time-only drop-ins, write the final mirror.
pub(crate) fn rewrite_apt_sources(
    dest: &Path,
    mirror: &str,
    distribution: &str,
    components: &str,
) -> Result<()> {
    let aptconf = dest.join("etc/apt");
    let sources = aptconf.join("sources.list");
    if sources.exists() {
        fs::remove_file(&sources)
            .io_context(|| format!("removing '{}'", sources.display()))?;
    }

    let dropins = aptconf.join("sources.list.d");
    fs::create_dir_all(&dropins)
        .io_context(|| format!("creating '{}'", dropins.display()))?;
    for entry in fs::read_dir(&dropins)
        .io_context(|| format!("reading '{}'", dropins.display()))?
    {
        let entry = entry.io_context(|| format!("reading '{}'", dropins.display()))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(INSTALL_TIME_REPO_PREFIX) {
            fs::remove_file(entry.path())
                .io_context(|| format!("removing '{}'", entry.path().display()))?;
        }
    }

    let base = dropins.join("base.list");
    fs::write(&base, format!("deb {mirror} {distribution} {components}\n"))
        .io_context(|| format!("writing '{}'", base.display()))
}

/// Replace any runtime-generated resolv.conf with a symlink delegating to
/// systemd-resolved.
pub(crate) fn delegate_resolv_conf(dest: &Path) -> Result<()> {
    let resolvconf = dest.join("etc/resolv.conf");
    if resolvconf.symlink_metadata().is_ok() {
        fs::remove_file(&resolvconf)
            .io_context(|| format!("removing '{}'", resolvconf.display()))?;
    }
    std::os::unix::fs::symlink("/run/systemd/resolve/resolv.conf", &resolvconf)
        .io_context(|| format!("creating resolv.conf symlink in '{}'", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_tree(base: &Path) -> std::path::PathBuf {
        let dest = base.join("tree");
        fs::create_dir_all(dest.join("etc/apt/sources.list.d")).unwrap();
        fs::write(
            dest.join("etc/apt/sources.list"),
            "deb http://build-mirror/ bookworm main\n",
        )
        .unwrap();
        fs::write(
            dest.join("etc/apt/sources.list.d/inst-local.list"),
            "deb [trusted=yes] file:/srv/local ./\n",
        )
        .unwrap();
        fs::write(
            dest.join("etc/apt/sources.list.d/backports.list"),
            "deb http://build-mirror/ bookworm-backports main\n",
        )
        .unwrap();
        dest
    }

    #[test]
    fn rewrite_replaces_sources_and_drops_install_time_repos() {
        let tmp = TempDir::new().unwrap();
        let dest = seeded_tree(tmp.path());

        rewrite_apt_sources(&dest, "http://deb.debian.org/debian/", "bookworm", "main contrib")
            .unwrap();

        assert!(!dest.join("etc/apt/sources.list").exists());
        assert!(!dest.join("etc/apt/sources.list.d/inst-local.list").exists());
        // Non-install-time drop-ins survive.
        assert!(dest.join("etc/apt/sources.list.d/backports.list").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("etc/apt/sources.list.d/base.list")).unwrap(),
            "deb http://deb.debian.org/debian/ bookworm main contrib\n"
        );
    }

    #[test]
    fn rewrite_tolerates_missing_sources_list() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("tree");
        fs::create_dir_all(dest.join("etc/apt")).unwrap();

        rewrite_apt_sources(&dest, "http://m/", "stable", "main").unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("etc/apt/sources.list.d/base.list")).unwrap(),
            "deb http://m/ stable main\n"
        );
    }

    #[test]
    fn resolv_conf_becomes_a_delegating_symlink() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("tree");
        fs::create_dir_all(dest.join("etc")).unwrap();
        fs::write(dest.join("etc/resolv.conf"), "nameserver 10.0.0.1\n").unwrap();

        delegate_resolv_conf(&dest).unwrap();
        let link = dest.join("etc/resolv.conf");
        assert!(link.is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            Path::new("/run/systemd/resolve/resolv.conf")
        );
    }

    #[test]
    fn resolv_conf_replaces_a_stale_symlink() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("tree");
        fs::create_dir_all(dest.join("etc")).unwrap();
        std::os::unix::fs::symlink("/tmp/elsewhere", dest.join("etc/resolv.conf")).unwrap();

        delegate_resolv_conf(&dest).unwrap();
        assert_eq!(
            fs::read_link(dest.join("etc/resolv.conf")).unwrap(),
            Path::new("/run/systemd/resolve/resolv.conf")
        );
    }
}
