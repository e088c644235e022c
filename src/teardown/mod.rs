//! Unmounting, packaging and removal of working state.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};
use crate::stager::tree::atomic_move;

/// Default mount table consulted for nested mounts.
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Recursively unmount `mount_point` and everything below it.
pub fn unmount(runner: &dyn Runner, mount_point: &Path) -> Result<()> {
    tracing::info!("Unmounting {}", mount_point.display());
    Cmd::new("umount")
        .arg("-R")
        .arg_path(mount_point)
        .error_msg("Failed to unmount")
        .run(runner)?;
    Ok(())
}

/// Decode the octal escapes (`\040` etc.) the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points strictly below `dir` listed in `mount_table`, deepest first.
pub fn nested_mounts(dir: &Path, mount_table: &Path) -> Result<Vec<PathBuf>> {
    let content = match fs::read_to_string(mount_table) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", mount_table.display()))
        }
    };
    let mut mounts: Vec<PathBuf> = content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .filter(|mount| mount != dir && mount.starts_with(dir))
        .collect();
    mounts.sort_by_key(|m| std::cmp::Reverse(m.components().count()));
    mounts.dedup();
    Ok(mounts)
}

/// Unmount everything mounted below `dir`, deepest first. Failures are
/// logged and skipped. Returns the number of successful unmounts.
pub fn unmount_nested(runner: &dyn Runner, dir: &Path, mount_table: &Path) -> Result<usize> {
    let mut count = 0;
    for mount in nested_mounts(dir, mount_table)? {
        let output = Cmd::new("umount")
            .arg("-R")
            .arg_path(&mount)
            .allow_fail()
            .run(runner)?;
        if output.success() {
            count += 1;
        } else {
            tracing::warn!("Failed to unmount {}: {}", mount.display(), output.stderr.trim());
        }
    }
    Ok(count)
}

/// Compression parameters for [`finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression {
    pub level: u8,
    /// Passed to `xz -M` (e.g. `65%`).
    pub memory_limit: String,
}

/// An artifact placed in the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedArtifact {
    pub path: PathBuf,
    pub sha256: String,
}

/// Place `image` in `out_dir`, compressed with xz when requested.
///
/// The artifact is made world-readable and gets a `<artifact>.sha256`
/// companion.
pub fn finalize(
    runner: &dyn Runner,
    image: &Path,
    out_dir: &Path,
    compression: Option<&Compression>,
) -> Result<FinalizedArtifact> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory: {}", out_dir.display()))?;
    let file_name = image
        .file_name()
        .with_context(|| format!("{} has no file name", image.display()))?;

    let (produced, artifact_name) = match compression {
        Some(c) => {
            tracing::info!("Compressing {}", image.display());
            Cmd::new("xz")
                .arg("-k")
                .arg(format!("-{}", c.level))
                .args(["-T0", "--verbose", "-f", "-M"])
                .arg(&c.memory_limit)
                .arg_path(image)
                .inherit_output()
                .error_msg("Failed to compress image")
                .run(runner)?;
            let mut name = file_name.to_os_string();
            name.push(".xz");
            let mut produced = image.as_os_str().to_os_string();
            produced.push(".xz");
            (PathBuf::from(produced), name)
        }
        None => {
            tracing::info!("Copying {} uncompressed", image.display());
            (image.to_path_buf(), file_name.to_os_string())
        }
    };

    let artifact = out_dir.join(artifact_name);
    atomic_move(&produced, &artifact)?;
    fs::set_permissions(&artifact, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to chmod {}", artifact.display()))?;
    fs::set_permissions(out_dir, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", out_dir.display()))?;

    let sha256 = write_checksum(&artifact)?;
    tracing::info!("Wrote {}", artifact.display());
    Ok(FinalizedArtifact {
        path: artifact,
        sha256,
    })
}

/// SHA-256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<artifact>.sha256` in `sha256sum` format. Returns the digest.
pub fn write_checksum(artifact: &Path) -> Result<String> {
    let digest = sha256_file(artifact)?;
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut sum_path = artifact.as_os_str().to_os_string();
    sum_path.push(".sha256");
    let sum_path = PathBuf::from(sum_path);
    fs::write(&sum_path, format!("{digest}  {name}\n"))
        .with_context(|| format!("Failed to write {}", sum_path.display()))?;
    fs::set_permissions(&sum_path, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to chmod {}", sum_path.display()))?;
    Ok(digest)
}

/// Remove `path` recursively.
///
/// Refuses while anything is still mounted below it, so a failed unmount
/// never turns into deleting a mounted image's (or the host's) files.
pub fn cleanup(path: &Path, mount_table: &Path) -> Result<()> {
    if path.symlink_metadata().is_err() {
        return Ok(());
    }
    let still_mounted = nested_mounts(path, mount_table)?;
    if !still_mounted.is_empty() {
        anyhow::bail!(
            "refusing to remove {}: {} is still mounted",
            path.display(),
            still_mounted[0].display()
        );
    }
    tracing::info!("Cleaning up {}", path.display());
    fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    fn mount_table(dir: &Path, lines: &[String]) -> PathBuf {
        let path = dir.join("mounts");
        fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_nested_mounts_deepest_first() {
        let temp = TempDir::new().unwrap();
        let table = mount_table(
            temp.path(),
            &[
                "proc /proc proc rw 0 0".to_string(),
                "proc /work/aarch64/proc proc rw 0 0".to_string(),
                "dev /work/aarch64/dev devtmpfs rw 0 0".to_string(),
                "devpts /work/aarch64/dev/pts devpts rw 0 0".to_string(),
                "tmpfs /work/aarch64 tmpfs rw 0 0".to_string(),
                "tmpfs /work/aarch64-other tmpfs rw 0 0".to_string(),
                "x /work/aarch64/my\\040dir tmpfs rw 0 0".to_string(),
            ],
        );
        let mounts = nested_mounts(Path::new("/work/aarch64"), &table).unwrap();
        assert_eq!(mounts[0], PathBuf::from("/work/aarch64/dev/pts"));
        assert_eq!(mounts.len(), 4);
        assert!(mounts.contains(&PathBuf::from("/work/aarch64/my dir")));
        assert!(!mounts.contains(&PathBuf::from("/work/aarch64-other")));
    }

    #[test]
    fn test_unmount_nested_continues_after_failure() {
        let temp = TempDir::new().unwrap();
        let table = mount_table(
            temp.path(),
            &[
                "proc /w/a/proc proc rw 0 0".to_string(),
                "sys /w/a/sys sysfs rw 0 0".to_string(),
            ],
        );
        let runner = RecordingRunner::new().fail("umount -R /w/a/proc");
        assert_eq!(unmount_nested(&runner, Path::new("/w/a"), &table).unwrap(), 1);
        assert_eq!(runner.commands().len(), 2);
    }

    #[test]
    fn test_finalize_uncompressed() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("work/BredOS.img");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"image bytes").unwrap();
        let out = temp.path().join("out");

        let finalized = finalize(&RecordingRunner::new(), &image, &out, None).unwrap();
        let artifact = finalized.path;

        assert_eq!(artifact, out.join("BredOS.img"));
        assert_eq!(fs::metadata(&artifact).unwrap().permissions().mode() & 0o777, 0o644);
        assert_eq!(fs::metadata(&out).unwrap().permissions().mode() & 0o777, 0o755);
        let sum = fs::read_to_string(out.join("BredOS.img.sha256")).unwrap();
        assert_eq!(sum, format!("{}  BredOS.img\n", finalized.sha256));
        assert_eq!(finalized.sha256, sha256_file(&artifact).unwrap());
    }

    #[test]
    fn test_finalize_compressed_invokes_xz() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("BredOS.img");
        fs::write(&image, b"raw").unwrap();
        let out = temp.path().join("out");
        let xz_output = temp.path().join("BredOS.img.xz");
        let produced = xz_output.clone();
        let runner = RecordingRunner::new()
            .on("xz", move |_| fs::write(&produced, b"compressed").unwrap());

        let artifact = finalize(
            &runner,
            &image,
            &out,
            Some(&Compression {
                level: 9,
                memory_limit: "65%".into(),
            }),
        )
        .unwrap()
        .path;

        assert_eq!(
            runner.commands()[0],
            format!("xz -k -9 -T0 --verbose -f -M 65% {}", image.display())
        );
        assert_eq!(artifact, out.join("BredOS.img.xz"));
        assert_eq!(fs::read(&artifact).unwrap(), b"compressed");
        assert!(!xz_output.exists());
    }

    #[test]
    fn test_sha256_known_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_cleanup_refuses_while_mounted() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join("mnt")).unwrap();
        let table = mount_table(
            temp.path(),
            &[format!("/dev/loop0p2 {} ext4 rw 0 0", work.join("mnt").display())],
        );
        assert!(cleanup(&work, &table).is_err());
        assert!(work.exists());

        let empty = mount_table(temp.path(), &[]);
        cleanup(&work, &empty).unwrap();
        assert!(!work.exists());
        cleanup(&work, &empty).unwrap();
    }
}
