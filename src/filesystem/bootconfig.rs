//! Boot loader configuration written into the mounted image.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};
use crate::profile::BootConfigStyle;

/// Kernel command line with the root filesystem pinned by UUID.
pub fn root_cmdline(root_uuid: &str, cmdline: &str) -> String {
    let cmdline = cmdline.trim();
    if cmdline.is_empty() {
        format!("root=UUID={root_uuid}")
    } else {
        format!("root=UUID={root_uuid} {cmdline}")
    }
}

/// `extlinux.conf` contents: the profile template followed by the append
/// line.
pub fn render_extlinux(template: &str, root_uuid: &str, cmdline: &str) -> String {
    let mut out = template.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("    append ");
    out.push_str(&root_cmdline(root_uuid, cmdline));
    out.push('\n');
    out
}

/// Write the boot configuration for `style` under `<root>/boot`.
/// Returns the files written.
pub fn write_boot_config(
    root: &Path,
    style: BootConfigStyle,
    template: &str,
    root_uuid: &str,
    cmdline: &str,
) -> Result<Vec<PathBuf>> {
    let boot = root.join("boot");
    match style {
        BootConfigStyle::Extlinux => {
            let dir = boot.join("extlinux");
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            let path = dir.join("extlinux.conf");
            fs::write(&path, render_extlinux(template, root_uuid, cmdline))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
            Ok(vec![path])
        }
        BootConfigStyle::RpiFirmware => {
            fs::create_dir_all(&boot)
                .with_context(|| format!("Failed to create directory: {}", boot.display()))?;
            let cmdline_path = boot.join("cmdline.txt");
            fs::write(&cmdline_path, root_cmdline(root_uuid, cmdline))
                .with_context(|| format!("Failed to write {}", cmdline_path.display()))?;

            let config_path = boot.join("config.txt");
            let mut config = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config_path)
                .with_context(|| format!("Failed to open {}", config_path.display()))?;
            config
                .write_all(template.as_bytes())
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            tracing::info!(
                "Wrote {} and {}",
                cmdline_path.display(),
                config_path.display()
            );
            Ok(vec![cmdline_path, config_path])
        }
    }
}

fn set_grub_key(content: &mut Vec<String>, key: &str, value: &str) {
    let assignment = format!("{key}=\"{value}\"");
    let matches_key = |line: &str| {
        let line = line.trim_start().trim_start_matches('#').trim_start();
        line.strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('='))
    };
    match content.iter().position(|l| matches_key(l)) {
        Some(idx) => content[idx] = assignment,
        None => content.push(assignment),
    }
}

/// Rewrite `/etc/default/grub` contents: set the default kernel command line
/// and, when given, the device tree path. Commented-out keys are replaced in
/// place; missing keys are appended.
pub fn rewrite_grub_defaults(content: &str, cmdline: &str, dtb: Option<&str>) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    set_grub_key(&mut lines, "GRUB_CMDLINE_LINUX_DEFAULT", cmdline.trim());
    if let Some(dtb) = dtb {
        set_grub_key(&mut lines, "GRUB_DTB", dtb);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Configure and install GRUB inside the mounted root.
pub fn install_uefi_bootloader(
    runner: &dyn Runner,
    root: &Path,
    target: &str,
    bootloader_id: &str,
    cmdline: &str,
    dtb: Option<&str>,
) -> Result<()> {
    let defaults = root.join("etc/default/grub");
    let current = if defaults.exists() {
        fs::read_to_string(&defaults)
            .with_context(|| format!("Failed to read {}", defaults.display()))?
    } else {
        String::new()
    };
    if let Some(parent) = defaults.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&defaults, rewrite_grub_defaults(&current, cmdline, dtb))
        .with_context(|| format!("Failed to write {}", defaults.display()))?;

    tracing::info!("Installing GRUB ({target}) into {}", root.display());
    Cmd::new("arch-chroot")
        .arg_path(root)
        .arg("grub-install")
        .arg(format!("--target={target}"))
        .arg("--efi-directory=/boot/efi")
        .arg(format!("--bootloader-id={bootloader_id}"))
        .args(["--removable", "--no-nvram"])
        .error_msg("grub-install failed")
        .run(runner)?;
    Cmd::new("arch-chroot")
        .arg_path(root)
        .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
        .error_msg("grub-mkconfig failed")
        .run(runner)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_extlinux_appends_root() {
        let text = render_extlinux(
            "label BredOS\n    kernel /Image",
            "abcd",
            "rw rootwait",
        );
        assert_eq!(
            text,
            "label BredOS\n    kernel /Image\n    append root=UUID=abcd rw rootwait\n"
        );
    }

    #[test]
    fn test_write_extlinux() {
        let temp = TempDir::new().unwrap();
        let written =
            write_boot_config(temp.path(), BootConfigStyle::Extlinux, "label x\n", "u1", "quiet")
                .unwrap();
        assert_eq!(written, vec![temp.path().join("boot/extlinux/extlinux.conf")]);
        assert!(fs::read_to_string(&written[0])
            .unwrap()
            .ends_with("append root=UUID=u1 quiet\n"));
    }

    #[test]
    fn test_write_rpi_firmware() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("boot")).unwrap();
        fs::write(temp.path().join("boot/config.txt"), "# shipped\n").unwrap();

        write_boot_config(
            temp.path(),
            BootConfigStyle::RpiFirmware,
            "arm_64bit=1\n",
            "u2",
            "console=tty1",
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(temp.path().join("boot/cmdline.txt")).unwrap(),
            "root=UUID=u2 console=tty1"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("boot/config.txt")).unwrap(),
            "# shipped\narm_64bit=1\n"
        );
    }

    #[test]
    fn test_rewrite_grub_defaults() {
        let input = "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet\"\n#GRUB_DTB=\"x\"\n";
        let out = rewrite_grub_defaults(input, "rw console=ttyS2", Some("rockchip/rk3588-rock-5b.dtb"));
        assert_eq!(
            out,
            "GRUB_DEFAULT=0\n\
             GRUB_CMDLINE_LINUX_DEFAULT=\"rw console=ttyS2\"\n\
             GRUB_DTB=\"rockchip/rk3588-rock-5b.dtb\"\n"
        );

        let appended = rewrite_grub_defaults("GRUB_TIMEOUT=5\n", "quiet", None);
        assert_eq!(appended, "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"\n");
    }

    #[test]
    fn test_grub_key_prefix_does_not_match_longer_key() {
        let out = rewrite_grub_defaults("GRUB_CMDLINE_LINUX_DEFAULTS=1\n", "quiet", None);
        assert!(out.contains("GRUB_CMDLINE_LINUX_DEFAULTS=1\n"));
        assert!(out.ends_with("GRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"\n"));
    }

    #[test]
    fn test_install_runs_inside_target() {
        let temp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        install_uefi_bootloader(&runner, temp.path(), "arm64-efi", "BredOS", "quiet", None)
            .unwrap();
        let cmds = runner.commands();
        assert!(cmds[0].starts_with(&format!("arch-chroot {} grub-install --target=arm64-efi", temp.path().display())));
        assert!(cmds[1].ends_with("grub-mkconfig -o /boot/grub/grub.cfg"));
        assert!(fs::read_to_string(temp.path().join("etc/default/grub"))
            .unwrap()
            .contains("GRUB_CMDLINE_LINUX_DEFAULT=\"quiet\""));
    }
}
