//! Partition planning.
//!
//! Turns a profile's partition table into one `parted` invocation plus the
//! board's raw hook steps, and records the realized layout so later stages
//! can find each partition's device node.

use anyhow::{Context, Result};
use comfy_table::{presets, ContentArrangement, Table};
use serde::Serialize;
use std::path::Path;

use crate::device::DeviceHandle;
use crate::error::BuildError;
use crate::process::{Cmd, Runner};
use crate::profile::{FsKind, HookStep, PartitionFs, PartitionSpec};

/// One entry of a realized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPartition {
    pub name: String,
    pub start: String,
    pub end: String,
    pub size: Option<String>,
    pub fs: PartitionFs,
    /// Partition number on the device; `None` for reserved (`NONE`) entries.
    pub number: Option<u32>,
    /// Carries the boot and esp flags.
    pub boot_esp: bool,
}

/// The layout actually written to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLayout {
    pub image_kb: u64,
    pub entries: Vec<PlannedPartition>,
}

impl PartitionLayout {
    /// Partition number of the first entry with filesystem `fs`.
    pub fn number_of(&self, fs: PartitionFs) -> Option<u32> {
        self.entries
            .iter()
            .find(|p| p.fs == fs)
            .and_then(|p| p.number)
    }

    pub fn number_by_name(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.number)
    }

    /// Operator-facing table of the layout.
    pub fn render(&self, device: &Path) -> String {
        let mut table = Table::new();
        table
            .load_preset(presets::ASCII_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Partition", "Device", "Start", "End", "Size", "Filesystem"]);
        for entry in &self.entries {
            let node = entry
                .number
                .map(|n| format!("{}p{n}", device.display()))
                .unwrap_or_else(|| "-".to_string());
            let fs = if entry.boot_esp {
                format!("{} (boot, esp)", entry.fs)
            } else {
                entry.fs.to_string()
            };
            table.add_row([
                entry.name.as_str(),
                node.as_str(),
                entry.start.as_str(),
                entry.end.as_str(),
                entry.size.as_deref().unwrap_or("-"),
                fs.as_str(),
            ]);
        }
        format!(
            "{} Size {}M\n{table}",
            device.display(),
            self.image_kb / 1000
        )
    }
}

/// Inputs to [`plan`] beyond the table itself.
#[derive(Debug, Clone)]
pub struct PlanOptions<'a> {
    /// Filesystem type recorded for root entries.
    pub fs: Option<FsKind>,
    /// Raw partition inserted ahead of the table (UEFI builds).
    pub leading: Option<&'a PartitionSpec>,
    /// Flag the first fat32 entry boot/ESP.
    pub esp_flag: bool,
    pub pre_hooks: &'a [HookStep],
    pub post_hooks: &'a [HookStep],
    /// Where hook blobs are read from.
    pub config_dir: &'a Path,
}

/// Commands that realize a layout, in execution order.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub layout: PartitionLayout,
    pub pre: Vec<Cmd>,
    pub parted: Cmd,
    pub post: Vec<Cmd>,
}

impl PartitionPlan {
    pub fn commands(&self) -> impl Iterator<Item = &Cmd> {
        self.pre
            .iter()
            .chain(std::iter::once(&self.parted))
            .chain(self.post.iter())
    }
}

/// Number the entries of `table` in order.
///
/// Entries that produce a partition are numbered consecutively starting
/// after `offset` (the partitions inserted ahead of the table); `NONE`
/// entries get no number and do not advance the count.
pub fn number_partitions(table: &[PartitionSpec], offset: u32) -> Vec<Option<u32>> {
    let mut next = offset;
    table
        .iter()
        .map(|entry| {
            if entry.fs == PartitionFs::None {
                None
            } else {
                next += 1;
                Some(next)
            }
        })
        .collect()
}

/// Build the invocation plan for `table` on `device`.
pub fn plan(
    table: &[PartitionSpec],
    device: &Path,
    image_kb: u64,
    opts: &PlanOptions<'_>,
) -> Result<PartitionPlan> {
    let mut resolved: Vec<PartitionSpec> = Vec::new();
    if let Some(leading) = opts.leading {
        resolved.push(leading.resolve(image_kb));
    }
    resolved.extend(table.iter().map(|entry| entry.resolve(image_kb)));
    crate::profile::validate_table("partition", &resolved)?;

    let numbers = number_partitions(&resolved, 0);
    let boot_index = opts
        .esp_flag
        .then(|| resolved.iter().position(|p| p.fs == PartitionFs::Fat32))
        .flatten();

    let mut parted = Cmd::new("parted")
        .arg("--script")
        .arg_path(device)
        .args(["--align", "optimal", "mklabel", "gpt"]);
    let mut entries = Vec::with_capacity(resolved.len());

    for (idx, (entry, number)) in resolved.into_iter().zip(numbers).enumerate() {
        let boot_esp = boot_index == Some(idx);
        if let Some(n) = number {
            parted = parted.arg("mkpart").arg(&entry.name);
            parted = match entry.fs {
                PartitionFs::Fat32 => parted.arg("fat32"),
                PartitionFs::Root => match opts.fs {
                    Some(fs) => parted.arg(fs.name()),
                    None => {
                        return Err(BuildError::config(format!(
                            "partition '{}' is a root partition but this image has no root filesystem",
                            entry.name
                        )))
                    }
                },
                PartitionFs::Raw | PartitionFs::None => parted,
            };
            parted = parted.arg(&entry.start).arg(&entry.end);
            if boot_esp {
                let n = n.to_string();
                parted = parted.args(["set", n.as_str(), "boot", "on", "set", n.as_str(), "esp", "on"]);
            }
        }
        entries.push(PlannedPartition {
            name: entry.name,
            start: entry.start,
            end: entry.end,
            size: entry.size,
            fs: entry.fs,
            number,
            boot_esp,
        });
    }

    let layout = PartitionLayout { image_kb, entries };
    let pre = hook_commands(opts.pre_hooks, device, &layout, opts.config_dir)?;
    let post = hook_commands(opts.post_hooks, device, &layout, opts.config_dir)?;

    Ok(PartitionPlan {
        layout,
        pre,
        parted: parted.error_msg("Failed to write partition table"),
        post,
    })
}

fn hook_commands(
    hooks: &[HookStep],
    device: &Path,
    layout: &PartitionLayout,
    config_dir: &Path,
) -> Result<Vec<Cmd>> {
    hooks
        .iter()
        .map(|hook| hook_command(hook, device, layout, config_dir))
        .collect()
}

fn hook_command(
    hook: &HookStep,
    device: &Path,
    layout: &PartitionLayout,
    config_dir: &Path,
) -> Result<Cmd> {
    let mut of = std::ffi::OsString::from("of=");
    of.push(device.as_os_str());

    Ok(match hook {
        HookStep::WriteBlob { file, seek, bs } => {
            let mut input = std::ffi::OsString::from("if=");
            input.push(config_dir.join(file).as_os_str());
            Cmd::new("dd")
                .arg(input)
                .arg(of)
                .arg(format!("seek={seek}"))
                .arg(format!("bs={bs}"))
                .arg("conv=notrunc,fsync")
                .error_msg("Failed to write bootloader blob")
        }
        HookStep::Zero { seek, count, bs } => Cmd::new("dd")
            .arg("if=/dev/zero")
            .arg(of)
            .arg(format!("seek={seek}"))
            .arg(format!("bs={bs}"))
            .arg(format!("count={count}"))
            .arg("conv=notrunc,fsync")
            .error_msg("Failed to zero device region"),
        HookStep::SetFlag { partition, flag } => {
            let number = layout.number_by_name(partition).ok_or_else(|| {
                BuildError::config(format!(
                    "set-flag: partition '{partition}' is not created on this device"
                ))
            })?;
            Cmd::new("parted")
                .arg("--script")
                .arg_path(device)
                .arg("set")
                .arg(number.to_string())
                .arg(flag)
                .arg("on")
                .error_msg("Failed to set partition flag")
        }
    })
}

/// Run `plan` against `device`, then ask the kernel to re-read the table.
pub fn apply(runner: &dyn Runner, device: &DeviceHandle, plan: &PartitionPlan) -> Result<()> {
    tracing::info!("\n{}", plan.layout.render(device.path()));
    for cmd in plan.commands() {
        cmd.run(runner)
            .with_context(|| format!("partitioning {device}"))?;
    }
    Cmd::new("partprobe")
        .arg_path(device.path())
        .allow_fail()
        .run(runner)?;
    tracing::info!("Partitioned {device} successfully");
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

    fn opts<'a>(leading: Option<&'a PartitionSpec>, hooks: &'a [HookStep]) -> PlanOptions<'a> {
        PlanOptions {
            fs: Some(FsKind::Ext4),
            leading,
            esp_flag: true,
            pre_hooks: hooks,
            post_hooks: &[],
            config_dir: Path::new("/cfg"),
        }
    }

    fn two_entry_table() -> Vec<PartitionSpec> {
        vec![
            entry("boot", "32MiB", "150M", PartitionFs::Fat32),
            entry("root", "150M", "100%", PartitionFs::Root),
        ]
    }

    #[test]
    fn test_numbering_without_uefi() {
        let plan = plan(&two_entry_table(), Path::new("/dev/loop0"), 4_000_000, &opts(None, &[]))
            .unwrap();
        assert_eq!(plan.layout.number_of(PartitionFs::Fat32), Some(1));
        assert_eq!(plan.layout.number_of(PartitionFs::Root), Some(2));
    }

    #[test]
    fn test_numbering_with_uefi_partition() {
        let firmware = entry("uefi-firmware", "1MiB", "16MiB", PartitionFs::Raw);
        let plan = plan(
            &two_entry_table(),
            Path::new("/dev/loop0"),
            4_000_000,
            &opts(Some(&firmware), &[]),
        )
        .unwrap();
        assert_eq!(plan.layout.number_by_name("uefi-firmware"), Some(1));
        assert_eq!(plan.layout.number_of(PartitionFs::Fat32), Some(2));
        assert_eq!(plan.layout.number_of(PartitionFs::Root), Some(3));
        assert!(plan
            .parted
            .to_string()
            .contains("set 2 boot on set 2 esp on"));
    }

    #[test]
    fn test_none_entries_reserve_space_only() {
        let table = vec![
            entry("uboot", "0%", "16MiB", PartitionFs::None),
            entry("boot", "16MiB", "300MiB", PartitionFs::Fat32),
            entry("root", "300MiB", "100%", PartitionFs::Root),
        ];
        assert_eq!(number_partitions(&table, 0), vec![None, Some(1), Some(2)]);

        let plan = plan(&table, Path::new("/dev/loop0"), 4_000_000, &opts(None, &[])).unwrap();
        assert_eq!(
            plan.parted.to_string(),
            "parted --script /dev/loop0 --align optimal mklabel gpt \
             mkpart boot fat32 16MiB 300MiB set 1 boot on set 1 esp on \
             mkpart root ext4 300MiB 100%"
        );
    }

    #[test]
    fn test_only_first_fat32_is_flagged() {
        let table = vec![
            entry("boot", "0%", "100M", PartitionFs::Fat32),
            entry("extra", "100M", "200M", PartitionFs::Fat32),
            entry("root", "200M", "100%", PartitionFs::Root),
        ];
        let plan = plan(&table, Path::new("/dev/loop0"), 4_000_000, &opts(None, &[])).unwrap();
        let flagged: Vec<_> = plan.layout.entries.iter().filter(|p| p.boot_esp).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].name, "boot");
    }

    #[test]
    fn test_hooks_become_dd_and_parted_steps() {
        let hooks = vec![
            HookStep::WriteBlob {
                file: "idbloader.img".into(),
                seek: 64,
                bs: 512,
            },
            HookStep::SetFlag {
                partition: "root".into(),
                flag: "legacy_boot".into(),
            },
        ];
        let plan = plan(&two_entry_table(), Path::new("/dev/loop4"), 4_000_000, &opts(None, &hooks))
            .unwrap();
        let lines: Vec<String> = plan.pre.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "dd if=/cfg/idbloader.img of=/dev/loop4 seek=64 bs=512 conv=notrunc,fsync",
                "parted --script /dev/loop4 set 2 legacy_boot on",
            ]
        );
    }

    #[test]
    fn test_placeholder_table() {
        let table = vec![
            entry("boot", "0%", "150M", PartitionFs::Fat32),
            entry("root", "150M", "{image_kb}KiB", PartitionFs::Root),
        ];
        let plan = plan(&table, Path::new("/dev/loop0"), 2_000_000, &opts(None, &[])).unwrap();
        assert_eq!(plan.layout.entries[1].end, "2000000KiB");
    }

    #[test]
    fn test_render_lists_every_entry() {
        let plan = plan(&two_entry_table(), Path::new("/dev/loop0"), 4_000_000, &opts(None, &[]))
            .unwrap();
        let text = plan.layout.render(Path::new("/dev/loop0"));
        assert!(text.starts_with("/dev/loop0 Size 4000M"));
        assert!(text.contains("/dev/loop0p2"));
        assert!(text.contains("fat32 (boot, esp)"));
    }
}
