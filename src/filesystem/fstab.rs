//! `/etc/fstab` generation for the target root.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::BTRFS_SUBVOLUMES;
use crate::profile::FsKind;

/// Everything fstab needs to know about the mounted image.
#[derive(Debug, Clone)]
pub struct FstabInput<'a> {
    pub fs: FsKind,
    pub root_uuid: &'a str,
    pub boot_uuid: Option<&'a str>,
    /// blkid TYPE of the boot partition.
    pub boot_fstype: Option<&'a str>,
    /// `/boot` or `/boot/efi`.
    pub boot_mount: &'a str,
    pub simple_vfat: bool,
    pub no_discard: bool,
}

fn vfat_options(simple_vfat: bool) -> String {
    format!(
        "rw,relatime,fmask=0022,dmask=0022,codepage=437,{}shortname=mixed,utf8,errors=remount-ro",
        if simple_vfat { "" } else { "iocharset=ascii," }
    )
}

fn btrfs_options(subvol: &str, no_discard: bool) -> String {
    format!(
        "rw,relatime,ssd{},space_cache=v2,compress=zstd,subvol=/{subvol}",
        if no_discard { "" } else { ",discard=async" }
    )
}

fn line(uuid: &str, mount: &str, fstype: &str, options: &str, pass: u8) -> String {
    format!("UUID={uuid:<38} {mount:<22} {fstype:<6} {options} 0 {pass}")
}

/// The fstab lines for one image, root first.
///
/// Pure: the same input always produces the same lines.
pub fn fstab_lines(input: &FstabInput<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    match input.fs {
        FsKind::Ext4 => lines.push(line(input.root_uuid, "/", "ext4", "defaults", 1)),
        FsKind::Btrfs => {
            for (subvol, mount) in BTRFS_SUBVOLUMES {
                lines.push(line(
                    input.root_uuid,
                    mount,
                    "btrfs",
                    &btrfs_options(subvol, input.no_discard),
                    0,
                ));
            }
        }
    }

    if let Some(boot_uuid) = input.boot_uuid {
        let fstype = input.boot_fstype.unwrap_or("vfat");
        let options = if fstype == "vfat" {
            vfat_options(input.simple_vfat)
        } else {
            "defaults".to_string()
        };
        lines.push(line(boot_uuid, input.boot_mount, fstype, &options, 2));
    }
    lines
}

/// Append `lines` to `<root>/etc/fstab`, creating it if needed.
pub fn append_fstab(root: &Path, lines: &[String]) -> Result<()> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc)
        .with_context(|| format!("Failed to create directory: {}", etc.display()))?;
    let path = etc.join("fstab");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for l in lines {
        writeln!(file, "{l}").with_context(|| format!("Failed to write {}", path.display()))?;
    }
    tracing::info!("Wrote {} fstab entries to {}", lines.len(), path.display());
    Ok(())
}
