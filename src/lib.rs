//! Cached build pipeline for Debian live filesystem images.
//!
//! The pipeline turns a declarative description of an image into a
//! compressed read-only root filesystem in three strictly sequential
//! stages, each one consuming its predecessor's output directory:
//!
//! ```text
//! BuildDescriptor ── keys ──┐
//!                           │
//!   debootstrap ──► chroot (ansible playbook) ──► mksquashfs
//!        │               │                            │
//!        └───────────────┴── stage artifact cache ────┘
//!              <cache_dir>/<stage>-<digest>.tar.gz
//! ```
//!
//! Every stage derives a cache key from the configuration subset that can
//! change its output, with each key folding in its predecessor's, so an
//! upstream change invalidates everything downstream. Finished stage
//! outputs are stored as tar.gz archives and restored on later builds with
//! matching keys; without a cache directory the pipeline simply rebuilds
//! everything each time.
//!
//! # Example
//!
//! ```rust,ignore
//! use livebuilder::{build_image, BuildDescriptor};
//!
//! let descriptor = BuildDescriptor::builder()
//!     .distribution("bookworm")
//!     .architecture("amd64")
//!     .packages(["task-ssh-server", "vim"])
//!     .cache_dir("/var/cache/livebuilder")
//!     .build()?;
//!
//! build_image(&descriptor, std::path::Path::new("output/live"))?;
//! ```
//!
//! Execution is single-threaded and every external tool call blocks until
//! the child exits. Nothing here locks the cache directory: two concurrent
//! builds sharing one cache are unsafe.

pub mod ansible;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod kernel;
pub mod preflight;
pub mod process;
pub mod stages;
pub mod workdir;

pub use cache::{CacheEntry, CacheStore, Stage};
pub use descriptor::{BuildDescriptor, BuildDescriptorBuilder};
pub use error::{BuildError, Result};
pub use stages::build_image;
