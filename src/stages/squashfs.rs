//! Compression stage: produce the final squashfs image.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Stage};
use crate::descriptor::BuildDescriptor;
use crate::error::{IoContext, Result};
use crate::process::Cmd;
use crate::stages::Chroot;
use crate::workdir::WorkDir;

/// Runtime-only pseudo-directories that must not end up in the image.
const EXCLUDED_TREES: &[&str] = &["/proc", "/dev", "/sys", "/run"];

/// Anything smaller than this is almost certainly a truncated or otherwise
/// broken image; a minimal Debian tree compresses to far more.
const MIN_IMAGE_BYTES: u64 = 1024 * 1024;

/// Image filename produced inside the destination directory.
pub const IMAGE_NAME: &str = "filesystem.squashfs";

/// Compresses the customized tree into the final read-only image.
pub struct Squashfs<'a> {
    desc: &'a BuildDescriptor,
}

impl<'a> Squashfs<'a> {
    pub fn new(desc: &'a BuildDescriptor) -> Self {
        Self { desc }
    }

    /// Produce `filesystem.squashfs` and the boot files in `dest`.
    ///
    /// The customized working tree comes from the chroot stage (which
    /// bootstraps as needed), lives in a scoped directory, and is fed to
    /// mksquashfs after the optional customization hook has run against it.
    pub fn build(&self, dest: &Path) -> Result<()> {
        let store = CacheStore::open(self.desc.cache_dir())?;
        let entry = store.acquire(dest, Stage::Squashfs, self.desc.squashfs_key());
        if entry.hit() {
            entry.extract()?;
            return Ok(());
        }

        let work = WorkDir::new(self.desc.chroot_dir())?;
        Chroot::new(self.desc).build(work.path())?;

        if let Some(hook) = self.desc.customize_squashfs() {
            info!(script = %hook.display(), "running customization hook");
            Cmd::new(hook).arg(work.path()).run()?;
        }

        self.run_mksquashfs(work.path(), dest)?;
        entry.store()
    }

    fn run_mksquashfs(&self, src: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)
            .io_context(|| format!("creating output directory '{}'", dest.display()))?;

        let image = dest.join(IMAGE_NAME);
        if image.exists() {
            info!(path = %image.display(), "image already exists: reusing it");
            return Ok(());
        }

        let mut exclude = NamedTempFile::new()
            .io_context(|| "creating mksquashfs exclude file".to_string())?;
        for tree in EXCLUDED_TREES {
            writeln!(exclude, "{tree}")
                .io_context(|| "writing mksquashfs exclude file".to_string())?;
        }
        exclude
            .flush()
            .io_context(|| "writing mksquashfs exclude file".to_string())?;

        info!(source = %src.display(), "running mksquashfs");
        Cmd::new("mksquashfs")
            .nice()
            .arg(src)
            .arg(&image)
            .args(["-no-progress", "-comp", self.desc.squashfs_compression()])
            .arg("-e")
            .arg(exclude.path())
            .run()?;

        let size = fs::metadata(&image)
            .io_context(|| format!("checking image '{}'", image.display()))?
            .len();
        debug!(path = %image.display(), bytes = size, "created squashfs");
        if size < MIN_IMAGE_BYTES {
            warn!(
                path = %image.display(),
                bytes = size,
                "image appears to be too small"
            );
        }

        // Kernel and initrd must stay reachable outside the image for the
        // bootloader to load them.
        debug!("copying boot files out of the image tree");
        copy_boot_files(&src.join("boot"), dest)
    }
}

/// Copy the regular files directly under `src` into `dest`, skipping
/// directories and symlinks.
pub(crate) fn copy_boot_files(src: &Path, dest: &Path) -> Result<()> {
    for entry in
        fs::read_dir(src).io_context(|| format!("reading boot directory '{}'", src.display()))?
    {
        let entry = entry.io_context(|| format!("reading boot directory '{}'", src.display()))?;
        let file_type = entry
            .file_type()
            .io_context(|| format!("inspecting '{}'", entry.path().display()))?;
        if file_type.is_dir() || file_type.is_symlink() {
            continue;
        }
        let target = dest.join(entry.file_name());
        fs::copy(entry.path(), &target).io_context(|| {
            format!(
                "copying '{}' to '{}'",
                entry.path().display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn boot_copy_takes_regular_files_only() {
        let tmp = TempDir::new().unwrap();
        let boot = tmp.path().join("boot");
        fs::create_dir_all(boot.join("grub")).unwrap();
        fs::write(boot.join("vmlinuz-6.1.0-13-amd64"), b"kernel").unwrap();
        fs::write(boot.join("initrd.img-6.1.0-13-amd64"), b"initrd").unwrap();
        std::os::unix::fs::symlink("vmlinuz-6.1.0-13-amd64", boot.join("vmlinuz")).unwrap();

        let dest = tmp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        copy_boot_files(&boot, &dest).unwrap();

        assert_eq!(
            fs::read(dest.join("vmlinuz-6.1.0-13-amd64")).unwrap(),
            b"kernel"
        );
        assert_eq!(
            fs::read(dest.join("initrd.img-6.1.0-13-amd64")).unwrap(),
            b"initrd"
        );
        assert!(!dest.join("vmlinuz").exists());
        assert!(!dest.join("grub").exists());
    }

    #[test]
    fn missing_boot_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        assert!(copy_boot_files(&tmp.path().join("boot"), &dest).is_err());
    }

    #[test]
    fn existing_image_skips_recompression() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join(IMAGE_NAME), b"already built").unwrap();

        let desc = BuildDescriptor::builder()
            .distribution("bookworm")
            .architecture("amd64")
            .build_mirror("http://example/deb")
            .build()
            .unwrap();

        // The tree does not exist and mksquashfs is never invoked; the
        // existing image short-circuits the whole step.
        Squashfs::new(&desc)
            .run_mksquashfs(&tmp.path().join("missing-tree"), &dest)
            .unwrap();
        assert_eq!(fs::read(dest.join(IMAGE_NAME)).unwrap(), b"already built");
    }
}
