//! Formatting and mounting of planned partitions, plus the metadata files
//! (fstab, boot configuration) that reference them.

pub mod bootconfig;
pub mod fstab;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::device::DeviceHandle;
use crate::process::{Cmd, Runner};
use crate::profile::{FsKind, PartitionFs};
use crate::partition::PartitionLayout;

/// btrfs subvolumes created on every btrfs root, with their mount points.
pub const BTRFS_SUBVOLUMES: &[(&str, &str)] = &[
    ("@", "/"),
    ("@home", "/home"),
    ("@log", "/var/log"),
    ("@pkg", "/var/cache/pacman/pkg"),
    ("@.snapshots", "/.snapshots"),
];

pub const ROOT_LABEL_EXT4: &str = "PRIMARY";
pub const ROOT_LABEL_BTRFS: &str = "ROOTFS";
pub const BOOT_LABEL: &str = "BOOT";

const BTRFS_MOUNT_OPTS: &str = "compress=zstd";

/// Create filesystems on every partition of `layout` that needs one.
///
/// fat32 entries become vfat, root entries get the profile filesystem;
/// raw and reserved entries are left untouched.
pub fn format(
    runner: &dyn Runner,
    device: &DeviceHandle,
    layout: &PartitionLayout,
    fs: Option<FsKind>,
) -> Result<()> {
    for entry in &layout.entries {
        let Some(number) = entry.number else { continue };
        let node = device.partition(number);
        match entry.fs {
            PartitionFs::Fat32 => format_vfat(runner, &node)?,
            PartitionFs::Root => {
                let fs = fs.with_context(|| {
                    format!("partition '{}' needs a root filesystem kind", entry.name)
                })?;
                format_root(runner, &node, fs)?;
            }
            PartitionFs::Raw | PartitionFs::None => {}
        }
    }
    Ok(())
}

fn format_vfat(runner: &dyn Runner, node: &Path) -> Result<()> {
    tracing::info!("Formatting {} as vfat", node.display());
    Cmd::new("mkfs.vfat")
        .args(["-F", "32", "-n", BOOT_LABEL])
        .arg_path(node)
        .error_msg("Failed to format boot partition")
        .run(runner)?;
    Ok(())
}

fn format_root(runner: &dyn Runner, node: &Path, fs: FsKind) -> Result<()> {
    tracing::info!("Formatting {} as {fs}", node.display());
    let cmd = match fs {
        FsKind::Ext4 => Cmd::new("mkfs.ext4").args(["-F", "-L", ROOT_LABEL_EXT4]),
        FsKind::Btrfs => Cmd::new("mkfs.btrfs").args(["-f", "-L", ROOT_LABEL_BTRFS]),
    };
    cmd.arg_path(node)
        .error_msg("Failed to format root partition")
        .run(runner)?;
    Ok(())
}

/// Directory the boot partition is mounted on, relative to the root mount.
pub fn boot_mount_point(uefi: bool) -> &'static str {
    if uefi {
        "/boot/efi"
    } else {
        "/boot"
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Mount the root partition at `mnt` and prepare the boot mount point.
///
/// btrfs roots are mounted twice: bare to create the subvolumes, then with
/// `subvol=@` (and `@home` under `home/`).
pub fn mount_root(
    runner: &dyn Runner,
    node: &Path,
    fs: FsKind,
    mnt: &Path,
    uefi: bool,
) -> Result<()> {
    create_dir(mnt)?;
    match fs {
        FsKind::Ext4 => {
            Cmd::new("mount")
                .arg_path(node)
                .arg_path(mnt)
                .error_msg("Failed to mount root filesystem")
                .run(runner)?;
        }
        FsKind::Btrfs => {
            Cmd::new("mount")
                .args(["-t", "btrfs", "-o", BTRFS_MOUNT_OPTS])
                .arg_path(node)
                .arg_path(mnt)
                .error_msg("Failed to mount btrfs volume")
                .run(runner)?;
            for (subvol, _) in BTRFS_SUBVOLUMES {
                Cmd::new("btrfs")
                    .args(["subvolume", "create"])
                    .arg_path(&mnt.join(subvol))
                    .error_msg("Failed to create btrfs subvolume")
                    .run(runner)?;
            }
            Cmd::new("umount")
                .arg_path(node)
                .error_msg("Failed to unmount btrfs volume")
                .run(runner)?;

            Cmd::new("mount")
                .args(["-t", "btrfs", "-o"])
                .arg(format!("{BTRFS_MOUNT_OPTS},subvol=@"))
                .arg_path(node)
                .arg_path(mnt)
                .error_msg("Failed to mount root subvolume")
                .run(runner)?;
            let home = mnt.join("home");
            create_dir(&home)?;
            Cmd::new("mount")
                .args(["-t", "btrfs", "-o"])
                .arg(format!("{BTRFS_MOUNT_OPTS},subvol=@home"))
                .arg_path(node)
                .arg_path(&home)
                .error_msg("Failed to mount home subvolume")
                .run(runner)?;
        }
    }
    create_dir(&mnt.join("boot"))?;
    if uefi {
        create_dir(&mnt.join("boot/efi"))?;
    }
    tracing::info!("Mounted {} ({fs}) at {}", node.display(), mnt.display());
    Ok(())
}

/// Mount the boot partition under the root mount. Returns the mount point.
pub fn mount_boot(runner: &dyn Runner, node: &Path, mnt: &Path, uefi: bool) -> Result<PathBuf> {
    let target = mnt.join(boot_mount_point(uefi).trim_start_matches('/'));
    create_dir(&target)?;
    Cmd::new("mount")
        .arg_path(node)
        .arg_path(&target)
        .error_msg("Failed to mount boot partition")
        .run(runner)?;
    tracing::info!("Mounted {} at {}", node.display(), target.display());
    Ok(target)
}

fn blkid(runner: &dyn Runner, node: &Path, tag: &str) -> Result<String> {
    let value = Cmd::new("blkid")
        .args(["-s", tag, "-o", "value"])
        .arg_path(node)
        .error_msg("Failed to probe partition")
        .read(runner)?;
    if value.is_empty() {
        anyhow::bail!("blkid reported no {tag} for {}", node.display());
    }
    Ok(value)
}

/// Filesystem UUID of `node`.
pub fn read_uuid(runner: &dyn Runner, node: &Path) -> Result<String> {
    blkid(runner, node, "UUID")
}

/// Filesystem type of `node` as blkid names it (`vfat`, `ext4`, ...).
pub fn read_fstype(runner: &dyn Runner, node: &Path) -> Result<String> {
    blkid(runner, node, "TYPE")
}
