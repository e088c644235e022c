//! Partition table declarations as written in `profile.toml`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::BuildError;

/// What a table entry turns into on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PartitionFs {
    /// FAT32 boot partition; the first one is flagged boot/ESP.
    Fat32,
    /// The profile's root filesystem (ext4 or btrfs).
    Root,
    /// Created but left unformatted (firmware/bootloader payloads).
    Raw,
    /// Reserved space only. No partition is created.
    None,
}

impl TryFrom<String> for PartitionFs {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "fat32" | "vfat" => Ok(PartitionFs::Fat32),
            "ext4" | "btrfs" | "root" => Ok(PartitionFs::Root),
            "raw" => Ok(PartitionFs::Raw),
            "NONE" | "none" => Ok(PartitionFs::None),
            other => Err(format!(
                "unsupported partition filesystem '{other}' (expected fat32, ext4, btrfs, root, raw or NONE)"
            )),
        }
    }
}

impl From<PartitionFs> for String {
    fn from(fs: PartitionFs) -> Self {
        fs.to_string()
    }
}

impl fmt::Display for PartitionFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionFs::Fat32 => write!(f, "fat32"),
            PartitionFs::Root => write!(f, "root"),
            PartitionFs::Raw => write!(f, "raw"),
            PartitionFs::None => write!(f, "NONE"),
        }
    }
}

/// One `[[partition]]` entry.
///
/// `start`, `end` and `size` are passed to parted as-is after expanding the
/// `{image_kb}` / `{image_mb}` placeholders with the computed image size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    pub name: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub size: Option<String>,
    pub fs: PartitionFs,
}

impl PartitionSpec {
    /// Copy of this entry with size placeholders expanded.
    pub fn resolve(&self, image_kb: u64) -> PartitionSpec {
        PartitionSpec {
            name: self.name.clone(),
            start: expand_placeholders(&self.start, image_kb),
            end: expand_placeholders(&self.end, image_kb),
            size: self.size.as_ref().map(|s| expand_placeholders(s, image_kb)),
            fs: self.fs,
        }
    }
}

fn expand_placeholders(value: &str, image_kb: u64) -> String {
    value
        .replace("{image_kb}", &image_kb.to_string())
        .replace("{image_mb}", &(image_kb / 1024).to_string())
}

/// Board-specific raw steps run before/after partition creation.
///
/// This is a closed set: profiles sequence and parameterize these, they
/// never inject commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum HookStep {
    /// Write a file from the config directory at a block offset of the
    /// device (bootloader stages such as idbloader/u-boot.itb).
    WriteBlob {
        file: PathBuf,
        seek: u64,
        #[serde(default = "default_block_size")]
        bs: u64,
    },
    /// Zero `count` blocks starting at `seek`.
    Zero {
        seek: u64,
        count: u64,
        #[serde(default = "default_block_size")]
        bs: u64,
    },
    /// Set a parted flag on a named table entry.
    SetFlag { partition: String, flag: String },
}

fn default_block_size() -> u64 {
    512
}

/// A parsed parted position, used for ordering checks only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Position {
    Percent(f64),
    Bytes(u64),
}

impl Position {
    /// Parse the subset of parted unit syntax we can reason about.
    /// Returns `None` for anything else (sectors, expressions), which
    /// skips ordering checks for that entry.
    pub(crate) fn parse(value: &str) -> Option<Position> {
        let value = value.trim();
        if let Some(pct) = value.strip_suffix('%') {
            return pct.parse::<f64>().ok().map(Position::Percent);
        }
        let (num, mul) = split_unit(value)?;
        num.parse::<u64>()
            .ok()
            .and_then(|n| n.checked_mul(mul))
            .map(Position::Bytes)
    }

    fn before_or_at(self, other: Position) -> Option<bool> {
        match (self, other) {
            (Position::Percent(a), Position::Percent(b)) => Some(a <= b),
            (Position::Bytes(a), Position::Bytes(b)) => Some(a <= b),
            _ => None,
        }
    }

    fn strictly_before(self, other: Position) -> Option<bool> {
        match (self, other) {
            (Position::Percent(a), Position::Percent(b)) => Some(a < b),
            (Position::Bytes(a), Position::Bytes(b)) => Some(a < b),
            _ => None,
        }
    }
}

/// Split a byte position into its digits and unit multiplier. A bare
/// number is in megabytes, as parted reads it.
fn split_unit(value: &str) -> Option<(&str, u64)> {
    const UNITS: &[(&str, u64)] = &[
        ("KiB", 1 << 10),
        ("MiB", 1 << 20),
        ("GiB", 1 << 30),
        ("TiB", 1 << 40),
        ("kB", 1_000),
        ("KB", 1_000),
        ("MB", 1_000_000),
        ("GB", 1_000_000_000),
        ("K", 1_000),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("B", 1),
    ];
    let (num, mul) = UNITS
        .iter()
        .find_map(|(suffix, mul)| value.strip_suffix(suffix).map(|num| (num, *mul)))
        .unwrap_or((value, 1_000_000));
    (!num.is_empty() && num.bytes().all(|b| b.is_ascii_digit())).then_some((num, mul))
}

/// A byte position that is well formed but does not fit in 64 bits.
fn is_out_of_range(value: &str) -> bool {
    let value = value.trim();
    split_unit(value).is_some() && Position::parse(value).is_none()
}

/// Whether `value` is a byte offset (as opposed to a percentage or
/// something we cannot interpret).
pub(crate) fn is_absolute_position(value: &str) -> bool {
    matches!(Position::parse(value), Some(Position::Bytes(_)))
}

/// Check a (resolved) table for duplicate names and out-of-order or
/// overlapping entries.
pub fn validate_table(label: &str, table: &[PartitionSpec]) -> Result<()> {
    if table.is_empty() {
        return Err(BuildError::config(format!("partition table '{label}' is empty")));
    }

    let mut previous_end: Option<(String, Position)> = None;
    for (idx, entry) in table.iter().enumerate() {
        if entry.name.trim().is_empty() {
            bail!(BuildError::Configuration(format!(
                "partition table '{label}': entry {} has an empty name",
                idx + 1
            )));
        }
        if table[..idx].iter().any(|other| other.name == entry.name) {
            bail!(BuildError::Configuration(format!(
                "partition table '{label}': duplicate partition name '{}'",
                entry.name
            )));
        }

        for value in [&entry.start, &entry.end] {
            if is_out_of_range(value) {
                bail!(BuildError::Configuration(format!(
                    "partition table '{label}': invalid position '{value}' for '{}'",
                    entry.name
                )));
            }
        }

        let start = Position::parse(&entry.start);
        let end = Position::parse(&entry.end);
        if let (Some(start), Some(end)) = (start, end) {
            if start.strictly_before(end) == Some(false) {
                bail!(BuildError::Configuration(format!(
                    "partition table '{label}': '{}' ends ({}) before it starts ({})",
                    entry.name, entry.end, entry.start
                )));
            }
        }
        if let (Some((prev_name, prev_end)), Some(start)) = (&previous_end, start) {
            if prev_end.before_or_at(start) == Some(false) {
                bail!(BuildError::Configuration(format!(
                    "partition table '{label}': '{}' starts at {} which overlaps '{prev_name}'",
                    entry.name, entry.start
                )));
            }
        }
        if let Some(end) = end {
            previous_end = Some((entry.name.clone(), end));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, start: &str, end: &str, fs: PartitionFs) -> PartitionSpec {
        PartitionSpec {
            name: name.into(),
            start: start.into(),
            end: end.into(),
            size: None,
            fs,
        }
    }

    #[test]
    fn test_partition_fs_parses_profile_values() {
        assert_eq!(PartitionFs::try_from("fat32".to_string()), Ok(PartitionFs::Fat32));
        assert_eq!(PartitionFs::try_from("btrfs".to_string()), Ok(PartitionFs::Root));
        assert_eq!(PartitionFs::try_from("NONE".to_string()), Ok(PartitionFs::None));
        assert!(PartitionFs::try_from("ntfs".to_string()).is_err());
    }

    #[test]
    fn test_resolve_expands_image_size() {
        let spec = entry("root", "150M", "{image_kb}KiB", PartitionFs::Root);
        let resolved = spec.resolve(2_048_000);
        assert_eq!(resolved.end, "2048000KiB");

        let spec = entry("root", "150M", "{image_mb}MiB", PartitionFs::Root);
        assert_eq!(spec.resolve(2_048_000).end, "2000MiB");
    }

    #[test]
    fn test_position_parse() {
        assert_eq!(Position::parse("0%"), Some(Position::Percent(0.0)));
        assert_eq!(Position::parse("150M"), Some(Position::Bytes(150_000_000)));
        assert_eq!(Position::parse("16MiB"), Some(Position::Bytes(16 << 20)));
        assert_eq!(Position::parse("32768s"), None);
    }

    #[test]
    fn test_validate_accepts_contiguous_table() {
        let table = vec![
            entry("boot", "0%", "150M", PartitionFs::Fat32),
            entry("root", "150M", "100%", PartitionFs::Root),
        ];
        validate_table("partition", &table).unwrap();
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let table = vec![
            entry("boot", "16M", "300M", PartitionFs::Fat32),
            entry("root", "150M", "4000M", PartitionFs::Root),
        ];
        let err = validate_table("partition", &table).unwrap_err();
        assert!(err.to_string().contains("overlaps 'boot'"));
    }

    #[test]
    fn test_validate_rejects_oversized_position() {
        assert_eq!(Position::parse("99999999999999999"), None);
        let table = vec![entry("boot", "0%", "99999999999999999", PartitionFs::Fat32)];
        let err = validate_table("partition", &table).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::Configuration(_))
        ));
        assert!(err.to_string().contains("invalid position"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let table = vec![
            entry("boot", "0%", "50%", PartitionFs::Fat32),
            entry("boot", "50%", "100%", PartitionFs::Root),
        ];
        assert!(validate_table("partition", &table).is_err());
    }

    #[test]
    fn test_hook_step_toml() {
        #[derive(Deserialize)]
        struct Hooks {
            step: Vec<HookStep>,
        }
        let hooks: Hooks = toml::from_str(
            r#"
            [[step]]
            kind = "write-blob"
            file = "idbloader.img"
            seek = 64

            [[step]]
            kind = "set-flag"
            partition = "boot"
            flag = "legacy_boot"
            "#,
        )
        .unwrap();
        assert_eq!(
            hooks.step[0],
            HookStep::WriteBlob {
                file: "idbloader.img".into(),
                seek: 64,
                bs: 512
            }
        );
        assert!(matches!(hooks.step[1], HookStep::SetFlag { .. }));
    }
}
