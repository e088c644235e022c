//! Process-lifetime working state of one build.
//!
//! The orchestrator owns the only [`WorkspaceState`]; stages receive the
//! individual paths and handles they need and return results instead of
//! mutating it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::device::{DeviceHandle, ImageFormat};
use crate::error::BuildError;
use crate::partition::PartitionLayout;
use crate::profile::{BuildProfile, ImageKind, PROFILE_FILE};

const LOCK_FILE: &str = ".build.lock";

/// Which part of the system an image file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// Boot and root in one image.
    Combined,
    /// Boot image of a split build.
    Boot,
    /// Root image of a split build.
    Root,
}

impl ImageRole {
    /// File name suffix appended to the image name.
    pub fn suffix(self) -> &'static str {
        match self {
            ImageRole::Combined => "",
            ImageRole::Boot => "_BOOT",
            ImageRole::Root => "_ROOTFS",
        }
    }
}

/// One backing file and everything realized on it.
#[derive(Debug)]
pub struct ImageSlot {
    pub role: ImageRole,
    pub path: PathBuf,
    pub size_kb: u64,
    pub format: ImageFormat,
    pub device: Option<DeviceHandle>,
    pub layout: Option<PartitionLayout>,
}

impl ImageSlot {
    fn new(role: ImageRole, path: PathBuf, format: ImageFormat) -> Self {
        Self {
            role,
            path,
            size_kb: 0,
            format,
            device: None,
            layout: None,
        }
    }
}

/// Working directories, image slots and the held work-directory lock.
#[derive(Debug)]
pub struct WorkspaceState {
    pub work_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub install_dir: PathBuf,
    pub images: Vec<ImageSlot>,
    /// Measured size of the install root.
    pub content_kb: Option<u64>,
    _lock: File,
}

impl WorkspaceState {
    /// Create the work directory, lock it and record the profile in it.
    pub fn open(work_dir: &Path, profile: &BuildProfile) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create directory: {}", work_dir.display()))?;

        let lock_path = work_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(BuildError::ResourceAcquisition(format!(
                "work directory {} is in use by another build",
                work_dir.display()
            ))
            .into());
        }

        let profile_copy = work_dir.join(PROFILE_FILE);
        fs::write(&profile_copy, &profile.source_text)
            .with_context(|| format!("Failed to write {}", profile_copy.display()))?;

        let format = match profile.kind {
            ImageKind::Qcow2 => ImageFormat::Qcow2,
            ImageKind::Image | ImageKind::Rootfs => ImageFormat::Raw,
        };
        let image_path = |role: ImageRole| {
            work_dir.join(format!(
                "{}{}.{}",
                profile.img_name,
                role.suffix(),
                profile.kind.extension()
            ))
        };
        let images = if profile.is_split() {
            vec![
                ImageSlot::new(ImageRole::Boot, image_path(ImageRole::Boot), format),
                ImageSlot::new(ImageRole::Root, image_path(ImageRole::Root), format),
            ]
        } else {
            vec![ImageSlot::new(
                ImageRole::Combined,
                image_path(ImageRole::Combined),
                format,
            )]
        };

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            mount_dir: work_dir.join("mnt"),
            install_dir: work_dir.join(profile.arch.name()),
            images,
            content_kb: None,
            _lock: lock,
        })
    }

    pub fn slot(&self, role: ImageRole) -> Option<&ImageSlot> {
        self.images.iter().find(|s| s.role == role)
    }

    /// Slot carrying the root filesystem.
    pub fn root_slot(&self) -> Option<&ImageSlot> {
        self.slot(ImageRole::Root)
            .or_else(|| self.slot(ImageRole::Combined))
    }

    /// Slot carrying the boot partition.
    pub fn boot_slot(&self) -> Option<&ImageSlot> {
        self.slot(ImageRole::Boot)
            .or_else(|| self.slot(ImageRole::Combined))
    }
}
