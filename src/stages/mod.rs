//! The build pipeline.
//!
//! Three stages run strictly in order, each consuming the previous stage's
//! output directory as its working tree:
//!
//! 1. [`Debootstrap`] bootstraps a minimal root filesystem.
//! 2. [`Chroot`] customizes that tree with the configured playbook.
//! 3. [`Squashfs`] compresses the customized tree into the final image.
//!
//! Every stage exposes the same single operation, `build(dest)`, is
//! idempotent under an unchanged descriptor (via cache keys or guard
//! checks), and wraps its expensive work in the stage artifact cache.

pub mod chroot;
pub mod debootstrap;
pub mod squashfs;

pub use chroot::Chroot;
pub use debootstrap::Debootstrap;
pub use squashfs::Squashfs;

use std::path::Path;

use crate::descriptor::BuildDescriptor;
use crate::error::Result;
use crate::workdir::UmaskGuard;

/// Build the compressed image and its boot files into `dest`.
///
/// Entry point for one complete build. The pipeline runs under a `022`
/// umask so host-side file creation comes out world-readable.
pub fn build_image(descriptor: &BuildDescriptor, dest: &Path) -> Result<()> {
    let _umask = UmaskGuard::set(0o022);
    Squashfs::new(descriptor).build(dest)
}
