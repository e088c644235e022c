//! Host preflight checks.
//!
//! Verifies that every external tool the selected profile will drive is on
//! `PATH` before anything destructive happens, and reports all missing tools
//! at once together with the package that provides them.

use anyhow::Result;

use crate::error::BuildError;
use crate::process;
use crate::profile::{Backend, BuildProfile, FsKind, ImageKind};

/// (command, package) pairs every image build needs.
const IMAGE_TOOLS: &[(&str, &str)] = &[
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("mkfs.vfat", "dosfstools"),
    ("blkid", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("modprobe", "kmod"),
    ("cp", "coreutils"),
    ("dd", "coreutils"),
];

/// Tools required by `profile`, as (command, package) pairs.
pub fn required_tools(profile: &BuildProfile, compress: bool) -> Vec<(&'static str, &'static str)> {
    let mut tools = Vec::new();
    if profile.traits.repackage_only {
        if compress {
            tools.push(("xz", "xz"));
        }
        return tools;
    }

    tools.push(("pacstrap", "arch-install-scripts"));
    if compress {
        tools.push(("xz", "xz"));
    }
    if profile.kind == ImageKind::Rootfs {
        return tools;
    }

    tools.extend_from_slice(IMAGE_TOOLS);
    match profile.fs {
        FsKind::Ext4 => tools.push(("mkfs.ext4", "e2fsprogs")),
        FsKind::Btrfs => {
            tools.push(("mkfs.btrfs", "btrfs-progs"));
            tools.push(("btrfs", "btrfs-progs"));
        }
    }
    match profile.backend {
        Backend::Loop => tools.push(("losetup", "util-linux")),
        Backend::Nbd => tools.push(("qemu-nbd", "qemu-img")),
    }
    if profile.kind == ImageKind::Qcow2 {
        tools.push(("qemu-img", "qemu-img"));
    }
    if profile.uefi.is_some() {
        tools.push(("arch-chroot", "arch-install-scripts"));
    }
    tools
}

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !process::exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(BuildError::config(format!(
            "Missing required host tools:\n{msg}"
        )));
    }
    Ok(())
}

/// Check every tool `profile` needs.
pub fn check_host_tools(profile: &BuildProfile, compress: bool) -> Result<()> {
    check_required_tools(&required_tools(profile, compress))
}
