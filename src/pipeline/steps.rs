//! Declarative step lists.
//!
//! A board never contributes code: its family traits and profile select and
//! order stages from the closed [`Stage`] set below.

use std::fmt;

use crate::profile::{BuildProfile, ImageKind};
use crate::stager::AccountLookup;

/// One orchestrator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Copy `alarmimg/` into the install root.
    CopyOverlay,
    FixPermissions(AccountLookup),
    InstallPackages,
    ResetMachineIdentity,
    InjectFirmware,
    ProvisionUsers,
    MeasureContent,
    /// Create, attach, partition and format every image file.
    AssembleImages,
    MountRoot,
    MountBoot,
    StageContent,
    WriteBootConfig,
    InstallUefiBootloader,
    WriteFstab,
    Unmount,
    ReleaseDevices,
    ArchiveRootfs,
    Finalize,
    Cleanup,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::CopyOverlay => "copy-overlay",
            Stage::FixPermissions(_) => "fix-permissions",
            Stage::InstallPackages => "install-packages",
            Stage::ResetMachineIdentity => "reset-machine-identity",
            Stage::InjectFirmware => "inject-firmware",
            Stage::ProvisionUsers => "provision-users",
            Stage::MeasureContent => "measure-content",
            Stage::AssembleImages => "assemble-images",
            Stage::MountRoot => "mount-root",
            Stage::MountBoot => "mount-boot",
            Stage::StageContent => "stage-content",
            Stage::WriteBootConfig => "write-boot-config",
            Stage::InstallUefiBootloader => "install-uefi-bootloader",
            Stage::WriteFstab => "write-fstab",
            Stage::Unmount => "unmount",
            Stage::ReleaseDevices => "release-devices",
            Stage::ArchiveRootfs => "archive-rootfs",
            Stage::Finalize => "finalize",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Steps that populate the install root.
fn prepare_root(profile: &BuildProfile) -> Vec<Stage> {
    let mut steps = Vec::new();
    if profile.overlay_dir.is_some() {
        steps.push(Stage::CopyOverlay);
        steps.push(Stage::FixPermissions(AccountLookup::Deferred));
    }
    steps.push(Stage::InstallPackages);
    steps.push(Stage::ResetMachineIdentity);
    if !profile.traits.firmware.is_empty() {
        steps.push(Stage::InjectFirmware);
    }
    steps.push(Stage::ProvisionUsers);
    steps.push(Stage::FixPermissions(AccountLookup::Required));
    steps
}

/// Ordered stages for `profile`.
pub fn step_list(profile: &BuildProfile) -> Vec<Stage> {
    if profile.traits.repackage_only {
        return vec![Stage::Finalize, Stage::Cleanup];
    }

    let mut steps = prepare_root(profile);
    if profile.kind == ImageKind::Rootfs {
        steps.extend([Stage::ArchiveRootfs, Stage::Finalize, Stage::Cleanup]);
        return steps;
    }

    steps.extend([
        Stage::MeasureContent,
        Stage::AssembleImages,
        Stage::MountRoot,
        Stage::MountBoot,
        Stage::StageContent,
        Stage::WriteBootConfig,
    ]);
    if profile.uefi.is_some() {
        steps.push(Stage::InstallUefiBootloader);
    }
    steps.extend([
        Stage::WriteFstab,
        Stage::Unmount,
        Stage::ReleaseDevices,
        Stage::Finalize,
        Stage::Cleanup,
    ]);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::fixtures::{write_config_dir, GENERIC_EXT4};
    use std::fs;
    use tempfile::TempDir;

    fn profile_for(text: &str, overlay: bool) -> BuildProfile {
        let temp = TempDir::new().unwrap();
        write_config_dir(temp.path(), text);
        if overlay {
            fs::create_dir_all(temp.path().join("alarmimg/etc")).unwrap();
        }
        fs::write(temp.path().join("nvram.txt"), "boardflags=0x00404201").unwrap();
        BuildProfile::load(temp.path()).unwrap()
    }

    #[test]
    fn test_generic_image_steps() {
        let steps = step_list(&profile_for(GENERIC_EXT4, false));
        assert_eq!(steps.first(), Some(&Stage::InstallPackages));
        assert!(!steps.contains(&Stage::CopyOverlay));
        assert!(!steps.contains(&Stage::InstallUefiBootloader));
        let pos = |s: Stage| steps.iter().position(|x| *x == s).unwrap();
        assert!(pos(Stage::AssembleImages) < pos(Stage::MountRoot));
        assert!(pos(Stage::StageContent) < pos(Stage::WriteBootConfig));
        assert!(pos(Stage::WriteFstab) < pos(Stage::Unmount));
        assert!(pos(Stage::Unmount) < pos(Stage::ReleaseDevices));
        assert!(pos(Stage::ReleaseDevices) < pos(Stage::Finalize));
        assert_eq!(steps.last(), Some(&Stage::Cleanup));
    }

    #[test]
    fn test_overlay_gets_deferred_fixup_pass() {
        let steps = step_list(&profile_for(GENERIC_EXT4, true));
        assert_eq!(
            &steps[..3],
            &[
                Stage::CopyOverlay,
                Stage::FixPermissions(AccountLookup::Deferred),
                Stage::InstallPackages
            ]
        );
        assert!(steps.contains(&Stage::FixPermissions(AccountLookup::Required)));
    }

    #[test]
    fn test_rootfs_steps_have_no_device_work() {
        let steps = step_list(&profile_for(
            &GENERIC_EXT4.replace("\"image\"", "\"rootfs\""),
            false,
        ));
        assert!(!steps.contains(&Stage::AssembleImages));
        assert!(!steps.contains(&Stage::ReleaseDevices));
        let tail = &steps[steps.len() - 3..];
        assert_eq!(tail, &[Stage::ArchiveRootfs, Stage::Finalize, Stage::Cleanup]);
    }

    #[test]
    fn test_repackage_only_family() {
        let steps = step_list(&profile_for(
            &GENERIC_EXT4.replace("\"generic\"", "\"edge2\""),
            false,
        ));
        assert_eq!(steps, vec![Stage::Finalize, Stage::Cleanup]);
    }

    #[test]
    fn test_uefi_and_firmware_steps() {
        let text = GENERIC_EXT4
            .replace(
                "edition = ",
                "uefi = true\ngrub-target = \"arm64-efi\"\nedition = ",
            )
            .replace("start = \"0%\"", "start = \"32MiB\"")
            .replace("\"generic\"", "\"rock4c-plus\"");
        let steps = step_list(&profile_for(&text, false));
        let pos = |s: Stage| steps.iter().position(|x| *x == s).unwrap();
        assert!(pos(Stage::InjectFirmware) > pos(Stage::InstallPackages));
        assert!(pos(Stage::InstallUefiBootloader) > pos(Stage::WriteBootConfig));
        assert!(pos(Stage::InstallUefiBootloader) < pos(Stage::Unmount));
    }
}
