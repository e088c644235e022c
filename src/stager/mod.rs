//! Root content staging: copying the prepared tree into the image and the
//! per-board fixups applied to it.

pub mod accounts;
pub mod perms;
pub mod tree;

pub use perms::{fix_permissions, AccountLookup};

use anyhow::{Context, Result};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::process::{Cmd, Runner};
use crate::profile::FirmwareFile;

/// Files that pin a machine identity; removed so each flashed image
/// generates its own on first boot.
pub const MACHINE_ID_FILES: &[&str] = &["etc/machine-id", "var/lib/dbus/machine-id"];

/// Marker written into provisioned home directories.
pub const SKEL_VERSION_FILE: &str = ".skel-version";

/// Copy all of `source` into `target`.
///
/// With `preserve_permissions` ownership, modes, timestamps and links are
/// kept (`cp -a`); otherwise the copy is owned by the invoking user.
pub fn stage(
    runner: &dyn Runner,
    source: &Path,
    target: &Path,
    preserve_permissions: bool,
) -> Result<()> {
    fs::create_dir_all(target)
        .with_context(|| format!("Failed to create directory: {}", target.display()))?;
    tracing::info!("Copying files to {}", target.display());

    let mut contents = source.as_os_str().to_os_string();
    contents.push("/.");
    let cmd = if preserve_permissions {
        Cmd::new("cp").arg("-a")
    } else {
        Cmd::new("cp").args(["-R", "--no-preserve=ownership"])
    };
    cmd.arg("--")
        .arg(contents)
        .arg_path(target)
        .error_msg("Failed to copy root content")
        .run(runner)
        .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;
    Ok(())
}

/// Remove the machine-identity files from `root`. Returns how many existed.
pub fn reset_machine_identity(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for rel in MACHINE_ID_FILES {
        let path = root.join(rel);
        if path.symlink_metadata().is_err() {
            continue;
        }
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        removed += 1;
    }
    tracing::info!("Reset machine identity in {} ({removed} files)", root.display());
    Ok(removed)
}

fn join_confined(root: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(BuildError::SecurityInvariant(format!(
            "'{}' escapes {}",
            rel.display(),
            root.display()
        ))
        .into());
    }
    Ok(root.join(rel))
}

/// Copy board firmware files from `config_dir` into `root`.
pub fn inject_firmware(config_dir: &Path, root: &Path, files: &[FirmwareFile]) -> Result<()> {
    for file in files {
        let src = join_confined(config_dir, &file.source)?;
        let dst = join_confined(root, &file.dest)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            let real_parent = fs::canonicalize(parent)
                .with_context(|| format!("Failed to resolve {}", parent.display()))?;
            let real_root = fs::canonicalize(root)
                .with_context(|| format!("Failed to resolve {}", root.display()))?;
            if !real_parent.starts_with(&real_root) {
                return Err(BuildError::SecurityInvariant(format!(
                    "firmware destination {} resolves outside {}",
                    dst.display(),
                    root.display()
                ))
                .into());
            }
        }
        fs::copy(&src, &dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        tracing::info!("Injected firmware {}", dst.display());
    }
    Ok(())
}

/// Populate the home directory of every regular user (uid in `uid_range`)
/// from `etc/skel` and stamp it with `version`.
///
/// Returns the names of the provisioned users.
pub fn provision_user_skeletons(
    root: &Path,
    uid_range: RangeInclusive<u32>,
    version: &str,
) -> Result<Vec<String>> {
    let skel = root.join("etc/skel");
    if !skel.is_dir() {
        tracing::debug!("no etc/skel in {}, skipping user provisioning", root.display());
        return Ok(Vec::new());
    }

    let mut provisioned = Vec::new();
    for account in accounts::read_accounts(root)? {
        if !uid_range.contains(&account.uid) {
            continue;
        }
        let rel = account
            .home
            .strip_prefix("/")
            .unwrap_or(&account.home)
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            tracing::warn!("user '{}' has '/' as home, skipping", account.name);
            continue;
        }
        let home = join_confined(root, &rel)
            .with_context(|| format!("home directory of user '{}'", account.name))?;
        if let Ok(existing) = home.symlink_metadata() {
            if existing.file_type().is_symlink() {
                return Err(BuildError::SecurityInvariant(format!(
                    "home directory of user '{}' is a symlink",
                    account.name
                ))
                .into());
            }
        }

        let real_root = fs::canonicalize(root)
            .with_context(|| format!("Failed to resolve {}", root.display()))?;
        let resolves_inside = |path: &Path| -> Result<bool> {
            let real = fs::canonicalize(path)
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            Ok(real.starts_with(&real_root))
        };
        let existing_ancestor = home
            .ancestors()
            .find(|p| p.symlink_metadata().is_ok())
            .unwrap_or(root);
        if !resolves_inside(existing_ancestor)? {
            return Err(BuildError::SecurityInvariant(format!(
                "home directory of user '{}' resolves outside {}",
                account.name,
                root.display()
            ))
            .into());
        }
        fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create directory: {}", home.display()))?;
        if !resolves_inside(&home)? {
            return Err(BuildError::SecurityInvariant(format!(
                "home directory of user '{}' resolves outside {}",
                account.name,
                root.display()
            ))
            .into());
        }

        tree::copy_dir_recursive(&skel, &home)?;
        fs::write(home.join(SKEL_VERSION_FILE), format!("{version}\n"))
            .with_context(|| format!("Failed to stamp {}", home.display()))?;
        for entry in WalkDir::new(&home).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", home.display()))?;
            std::os::unix::fs::lchown(entry.path(), Some(account.uid), Some(account.gid))
                .with_context(|| format!("Failed to chown {}", entry.path().display()))?;
        }
        tracing::info!("Provisioned home of '{}' from etc/skel", account.name);
        provisioned.push(account.name);
    }
    Ok(provisioned)
}
