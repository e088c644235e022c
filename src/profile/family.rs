//! Built-in device families and their board traits.
//!
//! A family is data: which boot configuration it writes, how its fstab is
//! tuned, whether it produces split images, and which firmware files it
//! injects. The orchestrator derives its step list from these traits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How the boot partition is told where the root filesystem lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootConfigStyle {
    /// `/boot/extlinux/extlinux.conf` with an appended `append root=UUID=...`.
    Extlinux,
    /// Raspberry Pi firmware: `/boot/cmdline.txt` plus `/boot/config.txt`.
    RpiFirmware,
}

/// A file copied from the config directory into the install root before
/// staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirmwareFile {
    /// Relative to the config directory.
    pub source: PathBuf,
    /// Relative to the install root.
    pub dest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyTraits {
    pub boot_config: BootConfigStyle,
    /// Omit `iocharset=ascii` from the vfat boot entry.
    pub simple_vfat: bool,
    /// Omit `discard=async` from btrfs entries.
    pub no_discard: bool,
    /// Boot and root live on two separate image files.
    pub split: bool,
    /// Only re-package an image already present in the work directory.
    pub repackage_only: bool,
    pub firmware: Vec<FirmwareFile>,
}

impl Default for FamilyTraits {
    fn default() -> Self {
        Self {
            boot_config: BootConfigStyle::Extlinux,
            simple_vfat: false,
            no_discard: false,
            split: false,
            repackage_only: false,
            firmware: Vec::new(),
        }
    }
}

/// Supported board families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFamily {
    Rpi,
    Rock5b,
    Rock5bSplit,
    Rock4cPlus,
    Vim4,
    Cpi4,
    Generic,
    Edge2,
}

impl DeviceFamily {
    pub const ALL: &'static [DeviceFamily] = &[
        DeviceFamily::Rpi,
        DeviceFamily::Rock5b,
        DeviceFamily::Rock5bSplit,
        DeviceFamily::Rock4cPlus,
        DeviceFamily::Vim4,
        DeviceFamily::Cpi4,
        DeviceFamily::Generic,
        DeviceFamily::Edge2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceFamily::Rpi => "rpi",
            DeviceFamily::Rock5b => "rock5b",
            DeviceFamily::Rock5bSplit => "rock5b-split",
            DeviceFamily::Rock4cPlus => "rock4c-plus",
            DeviceFamily::Vim4 => "vim4",
            DeviceFamily::Cpi4 => "cpi4",
            DeviceFamily::Generic => "generic",
            DeviceFamily::Edge2 => "edge2",
        }
    }

    /// Built-in board traits before profile overrides.
    pub fn traits(self) -> FamilyTraits {
        let base = FamilyTraits::default();
        match self {
            DeviceFamily::Rpi => FamilyTraits {
                boot_config: BootConfigStyle::RpiFirmware,
                ..base
            },
            DeviceFamily::Rock5bSplit => FamilyTraits {
                split: true,
                ..base
            },
            DeviceFamily::Rock4cPlus => FamilyTraits {
                firmware: vec![FirmwareFile {
                    source: PathBuf::from("nvram.txt"),
                    dest: PathBuf::from("usr/lib/firmware/brcm/brcmfmac43455-sdio.txt"),
                }],
                ..base
            },
            DeviceFamily::Vim4 => FamilyTraits {
                simple_vfat: true,
                no_discard: true,
                ..base
            },
            DeviceFamily::Edge2 => FamilyTraits {
                repackage_only: true,
                ..base
            },
            DeviceFamily::Rock5b | DeviceFamily::Cpi4 | DeviceFamily::Generic => base,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-profile overrides of the family traits (`[board]` table).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BoardOverrides {
    pub boot_config: Option<BootConfigStyle>,
    pub simple_vfat: Option<bool>,
    pub no_discard: Option<bool>,
}

impl BoardOverrides {
    pub fn apply(&self, mut traits: FamilyTraits) -> FamilyTraits {
        if let Some(style) = self.boot_config {
            traits.boot_config = style;
        }
        if let Some(simple) = self.simple_vfat {
            traits.simple_vfat = simple;
        }
        if let Some(no_discard) = self.no_discard {
            traits.no_discard = no_discard;
        }
        traits
    }
}
