//! Build configuration loading.
//!
//! One TOML file fully describes one image build:
//!
//! ```toml
//! [image]
//! distribution = "bookworm"
//! architecture = "amd64"
//! packages = ["task-ssh-server", "vim"]
//! playbook = "chroot.yaml"
//! networkd = true
//! cache = true
//! ```
//!
//! Only `architecture` is required; everything else has a documented
//! default in the descriptor builder. Unknown keys are rejected so a typo
//! cannot silently drop a setting.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::cache;
use crate::descriptor::BuildDescriptor;
use crate::error::{BuildError, IoContext, Result};
use crate::kernel::kernel_package;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    image: ImageSectionToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageSectionToml {
    architecture: String,
    distribution: Option<String>,
    build_mirror: Option<String>,
    installed_mirror: Option<String>,
    installed_mirror_components: Option<String>,
    playbook: Option<String>,
    packages: Option<Vec<String>>,
    kernel_package: Option<String>,
    auto_kernel: Option<bool>,
    squashfs_compression: Option<String>,
    networkd: Option<bool>,
    cache: Option<bool>,
    cache_dir: Option<PathBuf>,
    customize_squashfs: Option<PathBuf>,
    chroot_dir: Option<PathBuf>,
    ansible_dir: Option<PathBuf>,
}

/// Load an image description from `path` into a validated descriptor.
pub fn load_image_config(path: &Path) -> Result<BuildDescriptor> {
    let raw = fs::read_to_string(path)
        .io_context(|| format!("reading build configuration '{}'", path.display()))?;
    let parsed: ImageToml = toml::from_str(&raw).map_err(|err| {
        BuildError::Configuration(format!("parsing '{}': {err}", path.display()))
    })?;
    descriptor_from(parsed.image)
}

fn descriptor_from(image: ImageSectionToml) -> Result<BuildDescriptor> {
    let kernel = image
        .kernel_package
        .unwrap_or_else(|| kernel_package(&image.architecture));
    let mut packages = image.packages.unwrap_or_default();
    // The kernel is installed like any other package unless the playbook is
    // declared responsible for it.
    if image.auto_kernel.unwrap_or(true) {
        packages.push(kernel.clone());
    }

    let cache_dir = match (image.cache_dir, image.cache.unwrap_or(false)) {
        (Some(dir), _) => Some(dir),
        (None, true) => {
            let dir = cache::default_cache_dir();
            if dir.is_none() {
                warn!("no user cache directory on this platform: caching disabled");
            }
            dir
        }
        (None, false) => None,
    };

    let mut builder = BuildDescriptor::builder()
        .architecture(image.architecture)
        .packages(packages)
        .kernel_package(kernel);
    if let Some(value) = image.distribution {
        builder = builder.distribution(value);
    }
    if let Some(value) = image.build_mirror {
        builder = builder.build_mirror(value);
    }
    if let Some(value) = image.installed_mirror {
        builder = builder.installed_mirror(value);
    }
    if let Some(value) = image.installed_mirror_components {
        builder = builder.installed_mirror_components(value);
    }
    if let Some(value) = image.playbook {
        builder = builder.playbook(value);
    }
    if let Some(value) = image.squashfs_compression {
        builder = builder.squashfs_compression(value);
    }
    if let Some(value) = image.networkd {
        builder = builder.networkd(value);
    }
    if let Some(value) = cache_dir {
        builder = builder.cache_dir(value);
    }
    if let Some(value) = image.customize_squashfs {
        builder = builder.customize_squashfs(value);
    }
    if let Some(value) = image.chroot_dir {
        builder = builder.chroot_dir(value);
    }
    if let Some(value) = image.ansible_dir {
        builder = builder.ansible_dir(value);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load(toml: &str) -> Result<BuildDescriptor> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.toml");
        fs::write(&path, toml).unwrap();
        load_image_config(&path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let desc = load("[image]\narchitecture = \"amd64\"\n").unwrap();
        assert_eq!(desc.distribution(), "stable");
        assert_eq!(desc.build_mirror(), "http://deb.debian.org/debian/");
        assert_eq!(desc.playbook(), "chroot.yaml");
        assert_eq!(desc.squashfs_compression(), "lzo");
        assert!(!desc.networkd());
        assert!(desc.cache_dir().is_none());
        // Auto-selected kernel lands in the package set.
        assert_eq!(desc.kernel_package(), Some("linux-image-amd64"));
        assert!(desc
            .packages()
            .contains(&"linux-image-amd64".to_string()));
    }

    #[test]
    fn full_config_round_trips() {
        let desc = load(
            r#"
            [image]
            distribution = "bookworm"
            architecture = "arm64"
            build_mirror = "http://build/deb"
            installed_mirror = "http://installed/deb"
            installed_mirror_components = "main contrib"
            playbook = "desktop.yaml"
            packages = ["vim", "curl"]
            squashfs_compression = "xz"
            networkd = true
            cache_dir = "/var/cache/livebuilder"
            "#,
        )
        .unwrap();
        assert_eq!(desc.distribution(), "bookworm");
        assert_eq!(desc.architecture(), "arm64");
        assert_eq!(desc.installed_mirror(), "http://installed/deb");
        assert_eq!(desc.installed_mirror_components(), "main contrib");
        assert_eq!(desc.playbook(), "desktop.yaml");
        assert_eq!(desc.squashfs_compression(), "xz");
        assert!(desc.networkd());
        assert_eq!(
            desc.cache_dir(),
            Some(Path::new("/var/cache/livebuilder"))
        );
    }

    #[test]
    fn auto_kernel_can_be_disabled() {
        let desc = load(
            "[image]\narchitecture = \"amd64\"\nauto_kernel = false\n",
        )
        .unwrap();
        assert_eq!(desc.kernel_package(), Some("linux-image-amd64"));
        assert!(!desc
            .packages()
            .iter()
            .any(|p| p.starts_with("linux-image-")));
    }

    #[test]
    fn explicit_kernel_package_wins() {
        let desc = load(
            "[image]\narchitecture = \"i386\"\nkernel_package = \"linux-image-rt-686-pae\"\n",
        )
        .unwrap();
        assert_eq!(desc.kernel_package(), Some("linux-image-rt-686-pae"));
        assert!(desc
            .packages()
            .contains(&"linux-image-rt-686-pae".to_string()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load("[image]\narchitecture = \"amd64\"\nmiror = \"typo\"\n").unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn missing_architecture_is_rejected() {
        let err = load("[image]\ndistribution = \"bookworm\"\n").unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }
}
