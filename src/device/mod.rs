//! Block-device handles backing image files.
//!
//! A handle is acquired (free loop node, or a fixed NBD node after loading
//! the module), attached to one backing file, and released exactly once.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process::{Cmd, Runner};
use crate::profile::Backend;

/// First NBD node used by builds. Lower nodes are left to the host.
pub const NBD_BASE: u32 = 2;

/// On-disk format of a backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl ImageFormat {
    fn qemu_name(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }
}

/// A leased block device.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    backend: Backend,
    path: PathBuf,
    backing: Option<PathBuf>,
}

impl DeviceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Device node of partition `number` (1-based), e.g. `/dev/loop3p2`.
    pub fn partition(&self, number: u32) -> PathBuf {
        let mut node = self.path.clone().into_os_string();
        node.push(format!("p{number}"));
        PathBuf::from(node)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Acquire a free device for `backend`.
///
/// `slot` distinguishes concurrent images of one build (boot/root of a split
/// image); it selects the NBD node and is ignored for loop devices, where the
/// kernel hands out the next free node.
pub fn acquire(runner: &dyn Runner, backend: Backend, slot: u32) -> Result<DeviceHandle> {
    let path = match backend {
        Backend::Loop => {
            Cmd::new("modprobe").arg("loop").allow_fail().run(runner)?;
            let node = Cmd::new("losetup")
                .arg("-f")
                .read(runner)
                .map_err(|e| BuildError::ResourceAcquisition(format!("losetup -f: {e:#}")))?;
            if node.is_empty() {
                return Err(BuildError::ResourceAcquisition(
                    "no free loop device available".to_string(),
                )
                .into());
            }
            PathBuf::from(node)
        }
        Backend::Nbd => {
            Cmd::new("modprobe")
                .args(["nbd", "max_part=16"])
                .run(runner)
                .map_err(|e| {
                    BuildError::ResourceAcquisition(format!("loading nbd module: {e:#}"))
                })?;
            PathBuf::from(format!("/dev/nbd{}", NBD_BASE + slot))
        }
    };

    tracing::info!("Acquired {} device {}", backend, path.display());
    Ok(DeviceHandle {
        backend,
        path,
        backing: None,
    })
}

/// Bind `file` to `handle`.
pub fn attach(
    runner: &dyn Runner,
    handle: &mut DeviceHandle,
    file: &Path,
    format: ImageFormat,
) -> Result<()> {
    if let Some(existing) = &handle.backing {
        return Err(BuildError::ResourceAcquisition(format!(
            "{} is already attached to {}",
            handle.path.display(),
            existing.display()
        ))
        .into());
    }

    tracing::info!(
        "Attaching image file {} to {} device {}",
        file.display(),
        handle.backend,
        handle.path.display()
    );
    let cmd = match handle.backend {
        Backend::Loop => {
            if format != ImageFormat::Raw {
                return Err(BuildError::config(
                    "loop devices can only back raw images",
                ));
            }
            Cmd::new("losetup")
                .arg("-P")
                .arg_path(&handle.path)
                .arg_path(file)
        }
        Backend::Nbd => Cmd::new("qemu-nbd")
            .arg("--connect")
            .arg_path(&handle.path)
            .arg_path(file)
            .arg("--format")
            .arg(format.qemu_name()),
    };
    cmd.error_msg("Failed to attach image file")
        .run(runner)
        .with_context(|| format!("attaching {}", file.display()))?;
    handle.backing = Some(file.to_path_buf());
    Ok(())
}

/// Detach `handle` from its backing file.
///
/// Releasing a handle that is not attached is a no-op, so callers on the
/// abort path may call this unconditionally. A failing detach command is
/// logged, not raised.
pub fn release(runner: &dyn Runner, handle: &mut DeviceHandle) -> Result<()> {
    let Some(backing) = handle.backing.take() else {
        tracing::debug!("{} is not attached, nothing to release", handle.path.display());
        return Ok(());
    };

    let cmd = match handle.backend {
        Backend::Loop => Cmd::new("losetup").arg("-d").arg_path(&handle.path),
        Backend::Nbd => Cmd::new("qemu-nbd").arg("-d").arg_path(&handle.path),
    };
    let output = cmd.allow_fail().run(runner)?;
    if output.success() {
        tracing::info!(
            "Released {} (was backing {})",
            handle.path.display(),
            backing.display()
        );
    } else {
        tracing::warn!(
            "Failed to release {}: {}",
            handle.path.display(),
            output.stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;

    #[test]
    fn test_loop_acquire_attach_release() {
        let runner = RecordingRunner::new().reply("losetup -f", "/dev/loop7\n");
        let mut handle = acquire(&runner, Backend::Loop, 0).unwrap();
        assert_eq!(handle.path(), Path::new("/dev/loop7"));

        attach(&runner, &mut handle, Path::new("/work/a.img"), ImageFormat::Raw).unwrap();
        assert!(handle.backing.is_some());
        release(&runner, &mut handle).unwrap();
        release(&runner, &mut handle).unwrap();

        let detaches = runner
            .commands()
            .iter()
            .filter(|c| c.starts_with("losetup -d"))
            .count();
        assert_eq!(detaches, 1);
        assert!(runner.ran("losetup -P /dev/loop7 /work/a.img"));
    }

    #[test]
    fn test_no_free_loop_device() {
        let runner = RecordingRunner::new().reply("losetup -f", "\n");
        let err = acquire(&runner, Backend::Loop, 0).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::ResourceAcquisition(_))
        ));
    }

    #[test]
    fn test_nbd_slots_and_module_failure() {
        let runner = RecordingRunner::new();
        let boot = acquire(&runner, Backend::Nbd, 0).unwrap();
        let root = acquire(&runner, Backend::Nbd, 1).unwrap();
        assert_eq!(boot.path(), Path::new("/dev/nbd2"));
        assert_eq!(root.path(), Path::new("/dev/nbd3"));

        let runner = RecordingRunner::new().fail("modprobe nbd");
        let err = acquire(&runner, Backend::Nbd, 0).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::ResourceAcquisition(_))
        ));
    }

    #[test]
    fn test_nbd_attach_qcow2() {
        let runner = RecordingRunner::new();
        let mut handle = acquire(&runner, Backend::Nbd, 0).unwrap();
        attach(&runner, &mut handle, Path::new("/w/x.qcow2"), ImageFormat::Qcow2).unwrap();
        assert!(runner.ran("qemu-nbd --connect /dev/nbd2 /w/x.qcow2 --format qcow2"));
    }

    #[test]
    fn test_failed_detach_is_logged_not_raised() {
        let runner = RecordingRunner::new()
            .reply("losetup -f", "/dev/loop1")
            .fail("losetup -d");
        let mut handle = acquire(&runner, Backend::Loop, 0).unwrap();
        attach(&runner, &mut handle, Path::new("/w/a.img"), ImageFormat::Raw).unwrap();
        assert!(release(&runner, &mut handle).is_ok());
        assert!(handle.backing.is_none());
    }

    #[test]
    fn test_partition_node() {
        let handle = DeviceHandle {
            backend: Backend::Loop,
            path: PathBuf::from("/dev/loop3"),
            backing: None,
        };
        assert_eq!(handle.partition(2), PathBuf::from("/dev/loop3p2"));
    }
}
