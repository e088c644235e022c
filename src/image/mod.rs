//! Backing image files: sizing and allocation.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::device::ImageFormat;
use crate::error::BuildError;
use crate::process::{Cmd, Runner};
use crate::profile::{FsKind, Tuning};

/// Disk usage of a tree in 1 KiB blocks, the way `du -s` reports it:
/// allocated blocks, hard-linked inodes counted once, symlinks not followed.
pub fn measure_tree_kb(root: &Path) -> Result<u64> {
    let mut seen = HashSet::new();
    let mut blocks_512: u64 = 0;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if meta.nlink() > 1 && !meta.is_dir() && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        blocks_512 += meta.blocks();
    }
    Ok(blocks_512.div_ceil(2))
}

/// Final image size for `content_kb` of root content.
///
/// ext4 images get a fixed reserve on top of the content; btrfs images are
/// shrunk by a fixed margin since compression keeps the on-disk footprint
/// below the measured size. `None` (a boot-only image) is left as is.
pub fn image_size_kb(content_kb: u64, fs: Option<FsKind>, tuning: &Tuning) -> Result<u64> {
    match fs {
        Some(FsKind::Ext4) => content_kb.checked_add(tuning.ext4_reserve_kb).ok_or_else(|| {
            BuildError::config(format!("ext4 image size overflows ({content_kb} KiB)"))
        }),
        Some(FsKind::Btrfs) => content_kb
            .checked_sub(tuning.btrfs_margin_kb)
            .filter(|kb| *kb > 0)
            .ok_or_else(|| {
                BuildError::config(format!(
                    "root content ({content_kb} KiB) is smaller than the btrfs margin ({} KiB)",
                    tuning.btrfs_margin_kb
                ))
            }),
        None => Ok(content_kb),
    }
}

/// Create a backing file of exactly `size_kb` KiB at `path`.
///
/// Raw images are preallocated (zero-filled); qcow2 images are created with
/// `qemu-img` and grow on demand.
pub fn create_image_file(
    runner: &dyn Runner,
    path: &Path,
    size_kb: u64,
    format: ImageFormat,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    tracing::info!("Creating image file {} ({size_kb} KiB)", path.display());

    match format {
        ImageFormat::Raw => {
            let bytes = size_kb
                .checked_mul(1024)
                .ok_or_else(|| BuildError::config(format!("image size {size_kb} KiB overflows")))?;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            if let Err(err) = file.allocate(bytes) {
                tracing::warn!(
                    "preallocation of {} failed ({err}), leaving it sparse",
                    path.display()
                );
            }
            file.set_len(bytes)
                .with_context(|| format!("Failed to size {}", path.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", path.display()))?;
        }
        ImageFormat::Qcow2 => {
            Cmd::new("qemu-img")
                .args(["create", "-f", "qcow2"])
                .arg_path(path)
                .arg(format!("{size_kb}K"))
                .error_msg("Failed to create qcow2 image")
                .run(runner)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn tuning() -> Tuning {
        Tuning {
            ext4_reserve_kb: 1_100_000,
            btrfs_margin_kb: 390_000,
            ..Tuning::default()
        }
    }

    #[test]
    fn test_size_formula() {
        let t = tuning();
        for n in [400_000u64, 2_500_000, 7_000_001] {
            assert_eq!(image_size_kb(n, Some(FsKind::Ext4), &t).unwrap(), n + 1_100_000);
            assert_eq!(image_size_kb(n, Some(FsKind::Btrfs), &t).unwrap(), n - 390_000);
            assert_eq!(image_size_kb(n, None, &t).unwrap(), n);
        }
    }

    #[test]
    fn test_btrfs_margin_underflow() {
        let err = image_size_kb(1000, Some(FsKind::Btrfs), &tuning()).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn test_raw_image_has_exact_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/BredOS.img");
        let size = image_size_kb(2048, Some(FsKind::Ext4), &Tuning {
            ext4_reserve_kb: 1024,
            ..Tuning::default()
        })
        .unwrap();

        create_image_file(&RecordingRunner::new(), &path, size, ImageFormat::Raw).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 3072 * 1024);

        // Deterministic: a second run gives the same file.
        create_image_file(&RecordingRunner::new(), &path, size, ImageFormat::Raw).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 3072 * 1024);
    }

    #[test]
    fn test_qcow2_uses_qemu_img() {
        let temp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let path = temp.path().join("x.qcow2");
        create_image_file(&runner, &path, 5000, ImageFormat::Qcow2).unwrap();
        assert_eq!(
            runner.commands(),
            vec![format!("qemu-img create -f qcow2 {} 5000K", path.display())]
        );
    }

    #[test]
    fn test_measure_counts_hardlinks_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/data"), vec![7u8; 64 * 1024]).unwrap();
        let before = measure_tree_kb(&root).unwrap();
        assert!(before >= 64);

        fs::hard_link(root.join("etc/data"), root.join("etc/data2")).unwrap();
        assert_eq!(measure_tree_kb(&root).unwrap(), before);

        std::os::unix::fs::symlink("/usr", root.join("usr")).unwrap();
        assert!(measure_tree_kb(&root).unwrap() < before + 64);
    }
}
