//! Board configuration units.
//!
//! A config directory holds `profile.toml`, the package list
//! (`packages.<arch>`), the package-manager config (`pacman.conf.<arch>`),
//! an optional `alarmimg/` overlay and any blobs the board's hooks write.
//! [`BuildProfile::load`] parses and validates all of it before the pipeline
//! is allowed to touch a device.

pub mod family;
pub mod partition;

pub use family::{BoardOverrides, BootConfigStyle, DeviceFamily, FamilyTraits, FirmwareFile};
pub use partition::{validate_table, HookStep, PartitionFs, PartitionSpec};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::BuildError;

pub const PROFILE_FILE: &str = "profile.toml";
pub const OVERLAY_DIR: &str = "alarmimg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Aarch64,
    Armv7h,
    Riscv64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::Aarch64 => "aarch64",
            Arch::Armv7h => "armv7h",
            Arch::Riscv64 => "riscv64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ext4,
    Btrfs,
}

impl FsKind {
    pub fn name(self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Btrfs => "btrfs",
        }
    }
}

/// How image files are exposed as block devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "loop")]
    Loop,
    #[serde(rename = "qemu-nbd", alias = "nbd")]
    Nbd,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Loop => "loop",
            Backend::Nbd => "qemu-nbd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Image,
    Rootfs,
    Qcow2,
}

impl ImageKind {
    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Image => "image",
            ImageKind::Rootfs => "rootfs",
            ImageKind::Qcow2 => "qcow2",
        }
    }

    /// Extension of the uncompressed artifact.
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Image => "img",
            ImageKind::Rootfs => "tar",
            ImageKind::Qcow2 => "qcow2",
        }
    }
}

macro_rules! display_by_name {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    )*};
}
display_by_name!(Arch, FsKind, Backend, ImageKind);

/// Requested ownership and mode for one path of the fixup table.
///
/// A key ending in `/` applies recursively to that directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermEntry {
    /// User name (resolved through the target's passwd) or numeric uid.
    pub owner: String,
    /// Group name (resolved through the target's group file) or numeric gid.
    pub group: String,
    /// Octal mode, e.g. `"0750"`.
    pub mode: String,
}

impl PermEntry {
    pub fn mode_bits(&self) -> Result<u32> {
        let bits = u32::from_str_radix(self.mode.trim(), 8).map_err(|_| {
            BuildError::Configuration(format!("invalid octal mode '{}'", self.mode))
        })?;
        if bits > 0o7777 {
            return Err(BuildError::config(format!(
                "mode '{}' is out of range",
                self.mode
            )));
        }
        Ok(bits)
    }
}

/// Size and compression tunables (`[tuning]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Tuning {
    /// Added to the measured rootfs size for ext4 images.
    pub ext4_reserve_kb: u64,
    /// Subtracted from the measured rootfs size for btrfs images.
    pub btrfs_margin_kb: u64,
    /// Fixed size of the boot image in split builds.
    pub split_boot_size_kb: u64,
    /// Passed to `xz -M`.
    pub xz_memory_limit: String,
    pub xz_level: u8,
    pub xz_fast_level: u8,
    pub user_uid_min: u32,
    pub user_uid_max: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            ext4_reserve_kb: 1_100_000,
            btrfs_margin_kb: 390_000,
            split_boot_size_kb: 150_000,
            xz_memory_limit: "65%".to_string(),
            xz_level: 9,
            xz_fast_level: 1,
            user_uid_min: 1000,
            user_uid_max: 60000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ProfileToml {
    arch: Arch,
    device: DeviceFamily,
    fs: FsKind,
    img_backend: Backend,
    img_type: ImageKind,
    img_name: String,
    img_version: String,
    #[serde(default)]
    edition: String,
    #[serde(default)]
    cmdline: String,
    #[serde(default)]
    configtxt: String,
    #[serde(default)]
    uefi: bool,
    grub_target: Option<String>,
    grub_cmdline: Option<String>,
    grub_dtb: Option<String>,
    #[serde(default = "default_uefi_firmware_start")]
    uefi_firmware_start: String,
    #[serde(default = "default_uefi_firmware_end")]
    uefi_firmware_end: String,
    #[serde(default = "default_true")]
    esp_flag: bool,
    #[serde(default)]
    board: BoardOverrides,
    #[serde(default)]
    partition: Vec<PartitionSpec>,
    #[serde(default)]
    partition_boot: Vec<PartitionSpec>,
    #[serde(default)]
    partition_root: Vec<PartitionSpec>,
    #[serde(default)]
    pre_partition: Vec<HookStep>,
    #[serde(default)]
    post_partition: Vec<HookStep>,
    #[serde(default)]
    perms: BTreeMap<String, PermEntry>,
    #[serde(default)]
    firmware: Vec<FirmwareFile>,
    #[serde(default)]
    tuning: Tuning,
}

fn default_true() -> bool {
    true
}

fn default_uefi_firmware_start() -> String {
    "1MiB".to_string()
}

fn default_uefi_firmware_end() -> String {
    "16MiB".to_string()
}

/// Name of the raw partition inserted ahead of the table for UEFI builds.
pub const UEFI_FIRMWARE_PARTITION: &str = "uefi-firmware";

/// Partition tables of a profile, by layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionTables {
    Single(Vec<PartitionSpec>),
    Split {
        boot: Vec<PartitionSpec>,
        root: Vec<PartitionSpec>,
    },
    /// Repackage-only families and rootfs archives carry no table.
    None,
}

/// UEFI bootloader parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiConfig {
    pub target: String,
    /// Raw firmware partition placed before the first table entry.
    pub firmware: PartitionSpec,
    /// Overrides the profile cmdline in `/etc/default/grub`.
    pub cmdline: Option<String>,
    pub dtb: Option<String>,
}

/// One validated build. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct BuildProfile {
    pub config_dir: PathBuf,
    pub arch: Arch,
    pub device: DeviceFamily,
    pub fs: FsKind,
    pub backend: Backend,
    pub kind: ImageKind,
    pub img_name: String,
    pub img_version: String,
    pub edition: String,
    pub cmdline: String,
    pub configtxt: String,
    pub uefi: Option<UefiConfig>,
    pub esp_flag: bool,
    pub traits: FamilyTraits,
    pub tables: PartitionTables,
    pub pre_partition: Vec<HookStep>,
    pub post_partition: Vec<HookStep>,
    pub perms: BTreeMap<String, PermEntry>,
    pub tuning: Tuning,
    pub packages_file: PathBuf,
    pub pacman_conf: PathBuf,
    /// `alarmimg/` when present.
    pub overlay_dir: Option<PathBuf>,
    /// Verbatim `profile.toml`, copied into the work directory.
    pub source_text: String,
}

impl BuildProfile {
    /// Load and validate `<config_dir>/profile.toml`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        if !config_dir.is_dir() {
            return Err(BuildError::config(format!(
                "config directory '{}' does not exist",
                config_dir.display()
            )));
        }
        let profile_path = config_dir.join(PROFILE_FILE);
        let text = fs::read_to_string(&profile_path)
            .map_err(|e| {
                BuildError::Configuration(format!(
                    "reading profile '{}': {e}",
                    profile_path.display()
                ))
            })
            .context("loading board configuration")?;
        Self::from_toml(config_dir, &text)
            .with_context(|| format!("invalid profile '{}'", profile_path.display()))
    }

    /// Validate a profile given as TOML text, resolving files relative to
    /// `config_dir`.
    pub fn from_toml(config_dir: &Path, text: &str) -> Result<Self> {
        let raw: ProfileToml =
            toml::from_str(text).map_err(|e| BuildError::Configuration(e.to_string()))?;

        if raw.img_name.trim().is_empty() {
            return Err(BuildError::config("img-name is not set"));
        }
        if raw.img_name.contains('/') {
            return Err(BuildError::config(format!(
                "img-name '{}' must not contain '/'",
                raw.img_name
            )));
        }
        if raw.img_version.trim().is_empty() {
            return Err(BuildError::config("img-version is not set"));
        }

        let packages_file = config_dir.join(format!("packages.{}", raw.arch));
        if !packages_file.is_file() {
            return Err(BuildError::config(format!(
                "packages file '{}' does not exist",
                packages_file.display()
            )));
        }
        let pacman_conf = config_dir.join(format!("pacman.conf.{}", raw.arch));
        let overlay_dir = Some(config_dir.join(OVERLAY_DIR)).filter(|p| p.is_dir());

        if raw.img_type == ImageKind::Qcow2 && raw.img_backend != Backend::Nbd {
            return Err(BuildError::config(
                "img-type 'qcow2' requires img-backend 'qemu-nbd'",
            ));
        }

        let mut traits = raw.board.apply(raw.device.traits());
        if !raw.firmware.is_empty() {
            traits.firmware = raw.firmware.clone();
        }
        for fw in &traits.firmware {
            check_relative(&fw.dest, "firmware dest")?;
            check_relative(&fw.source, "firmware source")?;
            if !config_dir.join(&fw.source).is_file() {
                return Err(BuildError::config(format!(
                    "firmware file '{}' not found in config directory",
                    fw.source.display()
                )));
            }
        }

        let tables = select_tables(&raw, &traits)?;

        if let Some(HookStep::SetFlag { partition, .. }) = raw
            .pre_partition
            .iter()
            .find(|h| matches!(h, HookStep::SetFlag { .. }))
        {
            return Err(BuildError::config(format!(
                "set-flag on '{partition}' must be a post-partition step; \
                 pre-partition steps run before the table exists"
            )));
        }
        for hook in raw.pre_partition.iter().chain(&raw.post_partition) {
            match hook {
                HookStep::WriteBlob { file, bs, .. } => {
                    check_relative(file, "write-blob file")?;
                    if !config_dir.join(file).is_file() {
                        return Err(BuildError::config(format!(
                            "write-blob file '{}' not found in config directory",
                            file.display()
                        )));
                    }
                    check_block_size(*bs)?;
                }
                HookStep::Zero { bs, .. } => check_block_size(*bs)?,
                HookStep::SetFlag { partition, .. } => {
                    let known = match &tables {
                        PartitionTables::Single(t) => t.iter().any(|p| &p.name == partition),
                        _ => false,
                    };
                    if !known {
                        return Err(BuildError::config(format!(
                            "set-flag hook names unknown partition '{partition}'"
                        )));
                    }
                }
            }
        }
        check_single_boot_flag(&tables, &raw.pre_partition, &raw.post_partition, raw.esp_flag)?;

        let uefi = if raw.uefi {
            let target = raw
                .grub_target
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| BuildError::config("uefi = true requires grub-target"))?;
            let firmware = PartitionSpec {
                name: UEFI_FIRMWARE_PARTITION.to_string(),
                start: raw.uefi_firmware_start.clone(),
                end: raw.uefi_firmware_end.clone(),
                size: None,
                fs: PartitionFs::Raw,
            };
            match &tables {
                PartitionTables::Split { .. } => {
                    return Err(BuildError::config(
                        "uefi is not supported for split-image families",
                    ));
                }
                PartitionTables::Single(table) => {
                    let mut combined = vec![firmware.clone()];
                    combined.extend(table.iter().cloned());
                    validate_table("partition", &combined)?;
                    if !partition::is_absolute_position(&table[0].start) {
                        return Err(BuildError::config(format!(
                            "with uefi, partition '{}' must start at an absolute offset after the firmware partition",
                            table[0].name
                        )));
                    }
                }
                PartitionTables::None => {}
            }
            Some(UefiConfig {
                target,
                firmware,
                cmdline: raw.grub_cmdline.clone(),
                dtb: raw.grub_dtb.clone(),
            })
        } else {
            None
        };

        for (path, entry) in &raw.perms {
            if !path.starts_with('/') {
                return Err(BuildError::config(format!(
                    "perms path '{path}' must be absolute within the target"
                )));
            }
            if entry.owner.trim().is_empty() || entry.group.trim().is_empty() {
                return Err(BuildError::config(format!(
                    "perms entry '{path}' needs owner and group"
                )));
            }
            entry
                .mode_bits()
                .with_context(|| format!("perms entry '{path}'"))?;
        }

        if raw.tuning.user_uid_min > raw.tuning.user_uid_max {
            return Err(BuildError::config(
                "tuning: user-uid-min is greater than user-uid-max",
            ));
        }
        for (key, level) in [
            ("xz-level", raw.tuning.xz_level),
            ("xz-fast-level", raw.tuning.xz_fast_level),
        ] {
            if level > 9 {
                return Err(BuildError::config(format!(
                    "tuning: {key} must be 0-9, got {level}"
                )));
            }
        }

        Ok(BuildProfile {
            config_dir: config_dir.to_path_buf(),
            arch: raw.arch,
            device: raw.device,
            fs: raw.fs,
            backend: raw.img_backend,
            kind: raw.img_type,
            img_name: raw.img_name,
            img_version: raw.img_version,
            edition: raw.edition,
            cmdline: raw.cmdline,
            configtxt: raw.configtxt,
            uefi,
            esp_flag: raw.esp_flag,
            traits,
            tables,
            pre_partition: raw.pre_partition,
            post_partition: raw.post_partition,
            perms: raw.perms,
            tuning: raw.tuning,
            packages_file,
            pacman_conf,
            overlay_dir,
            source_text: text.to_string(),
        })
    }

    pub fn is_split(&self) -> bool {
        matches!(self.tables, PartitionTables::Split { .. })
    }
}

fn select_tables(raw: &ProfileToml, traits: &FamilyTraits) -> Result<PartitionTables> {
    let has_single = !raw.partition.is_empty();
    let has_split = !raw.partition_boot.is_empty() || !raw.partition_root.is_empty();

    if traits.repackage_only || raw.img_type == ImageKind::Rootfs {
        return Ok(PartitionTables::None);
    }

    if traits.split {
        if has_single {
            return Err(BuildError::config(format!(
                "device '{}' builds split images; use [[partition-boot]] and [[partition-root]]",
                raw.device
            )));
        }
        validate_table("partition-boot", &raw.partition_boot)?;
        validate_table("partition-root", &raw.partition_root)?;
        return Ok(PartitionTables::Split {
            boot: raw.partition_boot.clone(),
            root: raw.partition_root.clone(),
        });
    }

    if has_split {
        return Err(BuildError::config(format!(
            "device '{}' builds a single image; use [[partition]]",
            raw.device
        )));
    }
    validate_table("partition", &raw.partition)?;
    Ok(PartitionTables::Single(raw.partition.clone()))
}

/// At most one partition may end up flagged boot or ESP: the first fat32
/// entry when `esp-flag` is on, plus whatever `set-flag` hooks add.
fn check_single_boot_flag(
    tables: &PartitionTables,
    pre: &[HookStep],
    post: &[HookStep],
    esp_flag: bool,
) -> Result<()> {
    let PartitionTables::Single(table) = tables else {
        return Ok(());
    };
    let auto = esp_flag
        .then(|| table.iter().find(|p| p.fs == PartitionFs::Fat32))
        .flatten()
        .map(|p| p.name.as_str());

    let mut flagged: Vec<&str> = auto.into_iter().collect();
    for hook in pre.iter().chain(post) {
        if let HookStep::SetFlag { partition, flag } = hook {
            if (flag == "boot" || flag == "esp") && !flagged.contains(&partition.as_str()) {
                flagged.push(partition);
            }
        }
    }
    if flagged.len() > 1 {
        return Err(BuildError::config(format!(
            "more than one partition flagged boot/ESP: {}",
            flagged.join(", ")
        )));
    }
    Ok(())
}

fn check_relative(path: &Path, what: &str) -> Result<()> {
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(BuildError::config(format!(
            "{what} '{}' must be a relative path without '..'",
            path.display()
        )));
    }
    Ok(())
}

fn check_block_size(bs: u64) -> Result<()> {
    if bs == 0 {
        return Err(BuildError::config("hook block size must be non-zero"));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    fn load(profile: &str) -> Result<BuildProfile> {
        let temp = TempDir::new().unwrap();
        write_config_dir(temp.path(), profile);
        BuildProfile::load(temp.path())
    }

    fn expect_config_error(profile: &str, needle: &str) {
        let err = load(profile).unwrap_err();
        assert!(
            matches!(BuildError::classify(&err), Some(BuildError::Configuration(_))),
            "not a configuration error: {err:#}"
        );
        assert!(format!("{err:#}").contains(needle), "{err:#}");
    }

    #[test]
    fn test_load_generic_profile() {
        let profile = load(GENERIC_EXT4).unwrap();
        assert_eq!(profile.arch, Arch::Aarch64);
        assert_eq!(profile.device, DeviceFamily::Generic);
        assert_eq!(profile.fs, FsKind::Ext4);
        assert_eq!(profile.backend, Backend::Loop);
        assert_eq!(profile.tuning.ext4_reserve_kb, 4096);
        assert_eq!(profile.tuning.btrfs_margin_kb, 390_000);
        assert!(profile.overlay_dir.is_none());
        assert!(matches!(&profile.tables, PartitionTables::Single(t) if t.len() == 2));
    }

    #[test]
    fn test_unsupported_enum_values_are_configuration_errors() {
        expect_config_error(&GENERIC_EXT4.replace("\"aarch64\"", "\"x86_64\""), "x86_64");
        expect_config_error(&GENERIC_EXT4.replace("fs = \"ext4\"\nimg", "fs = \"xfs\"\nimg"), "xfs");
        expect_config_error(&GENERIC_EXT4.replace("\"generic\"", "\"pinephone\""), "pinephone");
        expect_config_error(&GENERIC_EXT4.replace("\"loop\"", "\"iscsi\""), "iscsi");
        expect_config_error(&GENERIC_EXT4.replace("\"image\"", "\"vmdk\""), "vmdk");
    }

    #[test]
    fn test_missing_packages_file() {
        let temp = TempDir::new().unwrap();
        write_config_dir(temp.path(), &GENERIC_EXT4.replace("aarch64", "armv7h"));
        let err = BuildProfile::load(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("packages.armv7h"));
    }

    #[test]
    fn test_empty_image_name() {
        expect_config_error(
            &GENERIC_EXT4.replace("\"BredOS-generic\"", "\"\""),
            "img-name is not set",
        );
    }

    #[test]
    fn test_uefi_requires_target() {
        let profile = GENERIC_EXT4.replace("edition = ", "uefi = true\nedition = ");
        expect_config_error(&profile, "grub-target");
    }

    #[test]
    fn test_uefi_table_must_leave_room_for_firmware() {
        let uefi = GENERIC_EXT4.replace(
            "edition = ",
            "uefi = true\ngrub-target = \"arm64-efi\"\nedition = ",
        );
        expect_config_error(&uefi, "absolute offset");

        let fixed = uefi.replace("start = \"0%\"", "start = \"32MiB\"");
        let profile = load(&fixed).unwrap();
        let firmware = &profile.uefi.unwrap().firmware;
        assert_eq!(firmware.name, UEFI_FIRMWARE_PARTITION);
        assert_eq!(firmware.fs, PartitionFs::Raw);
    }

    #[test]
    fn test_qcow2_requires_nbd() {
        expect_config_error(
            &GENERIC_EXT4.replace("\"image\"", "\"qcow2\""),
            "requires img-backend",
        );
    }

    #[test]
    fn test_split_family_requires_split_tables() {
        expect_config_error(
            &GENERIC_EXT4.replace("\"generic\"", "\"rock5b-split\""),
            "partition-boot",
        );
    }

    #[test]
    fn test_second_boot_flag_rejected() {
        let profile = format!(
            "{GENERIC_EXT4}\n[[post-partition]]\nkind = \"set-flag\"\npartition = \"root\"\nflag = \"esp\"\n"
        );
        let profile = profile.replace("\n[tuning]\next4-reserve-kb = 4096\n", "\n");
        expect_config_error(&profile, "more than one partition flagged");
    }

    #[test]
    fn test_set_flag_rejected_before_table_exists() {
        let profile = format!(
            "{GENERIC_EXT4}\n[[pre-partition]]\nkind = \"set-flag\"\npartition = \"root\"\nflag = \"legacy_boot\"\n"
        );
        let profile = profile.replace("\n[tuning]\next4-reserve-kb = 4096\n", "\n");
        expect_config_error(&profile, "must be a post-partition step");

        let moved = profile.replace("[[pre-partition]]", "[[post-partition]]");
        load(&moved).unwrap();
    }

    #[test]
    fn test_perm_entry_mode() {
        let entry = PermEntry {
            owner: "root".into(),
            group: "root".into(),
            mode: "0750".into(),
        };
        assert_eq!(entry.mode_bits().unwrap(), 0o750);
        let bad = PermEntry {
            mode: "rwx".into(),
            ..entry
        };
        assert!(bad.mode_bits().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        expect_config_error(&format!("bogus = 1\n{GENERIC_EXT4}"), "bogus");
    }
}
