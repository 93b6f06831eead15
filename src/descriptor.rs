//! Build descriptor and cache key derivation.
//!
//! A [`BuildDescriptor`] fully describes one image build. It is assembled
//! through [`BuildDescriptorBuilder`], validated once, and never mutated
//! afterwards; every stage borrows it read-only.
//!
//! Each stage derives its cache key from the subset of fields that can
//! change its output, and each key folds in its predecessor's key, so a
//! change to anything feeding the bootstrap invalidates every downstream
//! artifact as well:
//!
//! ```text
//! debootstrap_key = H(architecture, distribution, build_mirror, packages)
//! chroot_key      = H(debootstrap_key, playbook)
//! squashfs_key    = H(debootstrap_key, installed_mirror, playbook,
//!                     compression, networkd)
//! ```
//!
//! Keys hash a canonical JSON rendering of those fields: object keys are
//! sorted (serde_json maps are ordered) and the package set is sorted and
//! deduplicated at construction time, so descriptors that agree on the
//! relevant fields produce identical digests regardless of how the caller
//! assembled them.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BuildError, Result};

/// Packages added to every build so the customization stage can run inside
/// the tree: a Python interpreter for the automation tool's modules and
/// eatmydata to take fsync out of package operations.
const HELPER_PACKAGES: &[&str] = &["eatmydata", "python3"];

/// Immutable per-run description of one image build.
#[derive(Debug)]
pub struct BuildDescriptor {
    distribution: String,
    architecture: String,
    build_mirror: String,
    installed_mirror: String,
    installed_mirror_components: String,
    playbook: String,
    packages: Vec<String>,
    kernel_package: Option<String>,
    squashfs_compression: String,
    networkd: bool,
    cache_dir: Option<PathBuf>,
    customize_squashfs: Option<PathBuf>,
    chroot_dir: Option<PathBuf>,
    ansible_dir: Option<PathBuf>,
    debootstrap_key: OnceCell<String>,
    chroot_key: OnceCell<String>,
    squashfs_key: OnceCell<String>,
}

impl BuildDescriptor {
    pub fn builder() -> BuildDescriptorBuilder {
        BuildDescriptorBuilder::default()
    }

    /// Release to bootstrap, e.g. `bookworm`.
    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// Target architecture, e.g. `amd64`.
    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Mirror used while building the tree.
    pub fn build_mirror(&self) -> &str {
        &self.build_mirror
    }

    /// Mirror configured in the finished image.
    pub fn installed_mirror(&self) -> &str {
        &self.installed_mirror
    }

    /// Components enabled for the installed mirror, e.g. `main contrib`.
    pub fn installed_mirror_components(&self) -> &str {
        &self.installed_mirror_components
    }

    /// Playbook applied by the customization stage.
    pub fn playbook(&self) -> &str {
        &self.playbook
    }

    /// Sorted, deduplicated package set, helper packages included.
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Kernel package name, when one is managed by this build.
    pub fn kernel_package(&self) -> Option<&str> {
        self.kernel_package.as_deref()
    }

    /// Compression algorithm handed to mksquashfs.
    pub fn squashfs_compression(&self) -> &str {
        &self.squashfs_compression
    }

    /// Whether the image boots with systemd-networkd/-resolved enabled.
    pub fn networkd(&self) -> bool {
        self.networkd
    }

    /// Cache directory; `None` disables caching entirely.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Optional hook script run against the tree before compression.
    pub fn customize_squashfs(&self) -> Option<&Path> {
        self.customize_squashfs.as_deref()
    }

    /// Persistent chroot working directory, if the caller wants one.
    pub fn chroot_dir(&self) -> Option<&Path> {
        self.chroot_dir.as_deref()
    }

    /// Persistent automation working directory, if the caller wants one.
    pub fn ansible_dir(&self) -> Option<&Path> {
        self.ansible_dir.as_deref()
    }

    /// Cache key for the bootstrap stage.
    pub fn debootstrap_key(&self) -> &str {
        self.debootstrap_key.get_or_init(|| {
            stage_key(
                "debootstrap",
                &json!({
                    "architecture": &self.architecture,
                    "distribution": &self.distribution,
                    "build_mirror": &self.build_mirror,
                    "packages": &self.packages,
                }),
            )
        })
    }

    /// Cache key for the customization stage. Subsumes the bootstrap key.
    pub fn chroot_key(&self) -> &str {
        self.chroot_key.get_or_init(|| {
            stage_key(
                "chroot",
                &json!({
                    "debootstrap": self.debootstrap_key(),
                    "playbook": &self.playbook,
                }),
            )
        })
    }

    /// Cache key for the compression stage. Subsumes the bootstrap key.
    pub fn squashfs_key(&self) -> &str {
        self.squashfs_key.get_or_init(|| {
            stage_key(
                "squashfs",
                &json!({
                    "debootstrap": self.debootstrap_key(),
                    "installed_mirror": &self.installed_mirror,
                    "playbook": &self.playbook,
                    "compression": &self.squashfs_compression,
                    "networkd": self.networkd,
                }),
            )
        })
    }

    /// Descriptor fields exposed to the playbook as connection variables.
    pub(crate) fn connection_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("distribution", self.distribution.clone()),
            ("architecture", self.architecture.clone()),
            ("build_mirror", self.build_mirror.clone()),
            ("installed_mirror", self.installed_mirror.clone()),
            ("playbook", self.playbook.clone()),
            ("squashfs_compression", self.squashfs_compression.clone()),
        ];
        if let Some(kernel) = &self.kernel_package {
            vars.push(("kernel_package", kernel.clone()));
        }
        vars
    }
}

fn stage_key(stage: &str, fields: &serde_json::Value) -> String {
    let canonical = fields.to_string();
    debug!(stage, input = %canonical, "cache key input");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Builder for [`BuildDescriptor`].
///
/// Defaults follow what a plain Debian live build wants: `stable` from
/// `http://deb.debian.org/debian/` on both sides, `main` components, the
/// `chroot.yaml` playbook and `lzo` squashfs compression. Distribution,
/// architecture, build mirror and playbook must be non-empty when
/// [`build`](Self::build) runs.
#[derive(Debug, Clone)]
pub struct BuildDescriptorBuilder {
    distribution: String,
    architecture: String,
    build_mirror: String,
    installed_mirror: String,
    installed_mirror_components: String,
    playbook: String,
    packages: Vec<String>,
    kernel_package: Option<String>,
    squashfs_compression: String,
    networkd: bool,
    cache_dir: Option<PathBuf>,
    customize_squashfs: Option<PathBuf>,
    chroot_dir: Option<PathBuf>,
    ansible_dir: Option<PathBuf>,
}

impl Default for BuildDescriptorBuilder {
    fn default() -> Self {
        Self {
            distribution: "stable".to_string(),
            architecture: String::new(),
            build_mirror: "http://deb.debian.org/debian/".to_string(),
            installed_mirror: "http://deb.debian.org/debian/".to_string(),
            installed_mirror_components: "main".to_string(),
            playbook: "chroot.yaml".to_string(),
            packages: Vec::new(),
            kernel_package: None,
            squashfs_compression: "lzo".to_string(),
            networkd: false,
            cache_dir: None,
            customize_squashfs: None,
            chroot_dir: None,
            ansible_dir: None,
        }
    }
}

impl BuildDescriptorBuilder {
    pub fn distribution(mut self, value: impl Into<String>) -> Self {
        self.distribution = value.into();
        self
    }

    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    pub fn build_mirror(mut self, value: impl Into<String>) -> Self {
        self.build_mirror = value.into();
        self
    }

    pub fn installed_mirror(mut self, value: impl Into<String>) -> Self {
        self.installed_mirror = value.into();
        self
    }

    pub fn installed_mirror_components(mut self, value: impl Into<String>) -> Self {
        self.installed_mirror_components = value.into();
        self
    }

    pub fn playbook(mut self, value: impl Into<String>) -> Self {
        self.playbook = value.into();
        self
    }

    pub fn packages<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kernel_package(mut self, value: impl Into<String>) -> Self {
        self.kernel_package = Some(value.into());
        self
    }

    pub fn squashfs_compression(mut self, value: impl Into<String>) -> Self {
        self.squashfs_compression = value.into();
        self
    }

    pub fn networkd(mut self, value: bool) -> Self {
        self.networkd = value;
        self
    }

    pub fn cache_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(value.into());
        self
    }

    pub fn customize_squashfs(mut self, value: impl Into<PathBuf>) -> Self {
        self.customize_squashfs = Some(value.into());
        self
    }

    pub fn chroot_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.chroot_dir = Some(value.into());
        self
    }

    pub fn ansible_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.ansible_dir = Some(value.into());
        self
    }

    /// Validate and freeze the descriptor.
    ///
    /// Helper packages are appended here, and the package set is sorted and
    /// deduplicated, so key derivation never depends on caller-supplied
    /// ordering or duplicates.
    pub fn build(self) -> Result<BuildDescriptor> {
        for (field, value) in [
            ("distribution", &self.distribution),
            ("architecture", &self.architecture),
            ("build_mirror", &self.build_mirror),
            ("playbook", &self.playbook),
        ] {
            if value.trim().is_empty() {
                return Err(BuildError::Configuration(format!(
                    "{field} must not be empty"
                )));
            }
        }

        let mut packages = self.packages;
        packages.extend(HELPER_PACKAGES.iter().map(|p| p.to_string()));
        packages.sort();
        packages.dedup();

        Ok(BuildDescriptor {
            distribution: self.distribution,
            architecture: self.architecture,
            build_mirror: self.build_mirror,
            installed_mirror: self.installed_mirror,
            installed_mirror_components: self.installed_mirror_components,
            playbook: self.playbook,
            packages,
            kernel_package: self.kernel_package,
            squashfs_compression: self.squashfs_compression,
            networkd: self.networkd,
            cache_dir: self.cache_dir,
            customize_squashfs: self.customize_squashfs,
            chroot_dir: self.chroot_dir,
            ansible_dir: self.ansible_dir,
            debootstrap_key: OnceCell::new(),
            chroot_key: OnceCell::new(),
            squashfs_key: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BuildDescriptorBuilder {
        BuildDescriptor::builder()
            .distribution("bookworm")
            .architecture("amd64")
            .build_mirror("http://example/deb")
    }

    #[test]
    fn package_order_does_not_change_keys() {
        let a = base().packages(["vim", "curl"]).build().unwrap();
        let b = base().packages(["curl", "vim"]).build().unwrap();
        assert_eq!(a.debootstrap_key(), b.debootstrap_key());
        assert_eq!(a.chroot_key(), b.chroot_key());
        assert_eq!(a.squashfs_key(), b.squashfs_key());
    }

    #[test]
    fn duplicate_packages_collapse() {
        let a = base().packages(["curl", "curl", "vim"]).build().unwrap();
        let b = base().packages(["vim", "curl"]).build().unwrap();
        assert_eq!(a.packages(), b.packages());
        assert_eq!(a.debootstrap_key(), b.debootstrap_key());
    }

    #[test]
    fn helper_packages_always_present() {
        let desc = base().packages(["python3"]).build().unwrap();
        assert!(desc.packages().contains(&"python3".to_string()));
        assert!(desc.packages().contains(&"eatmydata".to_string()));
        assert_eq!(
            desc.packages()
                .iter()
                .filter(|p| p.as_str() == "python3")
                .count(),
            1
        );
    }

    #[test]
    fn installed_mirror_only_touches_squashfs_key() {
        let a = base().build().unwrap();
        let b = base().installed_mirror("http://other/deb").build().unwrap();
        assert_eq!(a.debootstrap_key(), b.debootstrap_key());
        assert_eq!(a.chroot_key(), b.chroot_key());
        assert_ne!(a.squashfs_key(), b.squashfs_key());
    }

    #[test]
    fn distribution_change_invalidates_everything() {
        let a = base().build().unwrap();
        let b = base().distribution("trixie").build().unwrap();
        assert_ne!(a.debootstrap_key(), b.debootstrap_key());
        assert_ne!(a.chroot_key(), b.chroot_key());
        assert_ne!(a.squashfs_key(), b.squashfs_key());
    }

    #[test]
    fn playbook_change_leaves_bootstrap_key() {
        let a = base().build().unwrap();
        let b = base().playbook("desktop.yaml").build().unwrap();
        assert_eq!(a.debootstrap_key(), b.debootstrap_key());
        assert_ne!(a.chroot_key(), b.chroot_key());
        assert_ne!(a.squashfs_key(), b.squashfs_key());
    }

    #[test]
    fn networkd_only_touches_squashfs_key() {
        let a = base().build().unwrap();
        let b = base().networkd(true).build().unwrap();
        assert_eq!(a.debootstrap_key(), b.debootstrap_key());
        assert_eq!(a.chroot_key(), b.chroot_key());
        assert_ne!(a.squashfs_key(), b.squashfs_key());
    }

    #[test]
    fn keys_are_stable_across_calls() {
        let desc = base().packages(["curl"]).build().unwrap();
        let first = desc.debootstrap_key().to_string();
        assert_eq!(first, desc.debootstrap_key());
    }

    #[test]
    fn keys_are_hex_digests() {
        let desc = base().build().unwrap();
        let key = desc.debootstrap_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_architecture_is_rejected() {
        let err = BuildDescriptor::builder()
            .distribution("bookworm")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn empty_mirror_is_rejected() {
        let err = base().build_mirror("  ").build().unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }
}
