//! Flashable disk images for ARM and RISC-V single-board computers.
//!
//! A board configuration directory (see [`profile`]) describes the target:
//! architecture, device family, filesystem, partition table, boot
//! configuration and permission fixups. The [`pipeline`] turns it into an
//! image by driving host tools in a fixed order:
//!
//! ```text
//! install root ── pacstrap, overlay, fixups
//!     │
//!     ├── image file ── loop / qemu-nbd device
//!     │       └── parted ── mkfs ── mount
//!     │
//!     ├── copy root, extlinux / cmdline.txt / grub, fstab
//!     │
//!     └── umount ── detach ── xz ── sha256 + manifest
//! ```
//!
//! Every external command goes through [`process::Runner`], so the whole
//! pipeline, including its abort path, runs against a recording fake in
//! tests.

pub mod device;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod manifest;
pub mod packages;
pub mod partition;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod profile;
pub mod stager;
pub mod teardown;
pub mod workspace;

pub use error::BuildError;
pub use pipeline::{BuildReport, CancellationToken, Pipeline, PipelineOptions};
pub use profile::BuildProfile;
