//! Permission fixups confined to a target root.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::accounts::{resolve_gid, resolve_uid};
use crate::error::BuildError;
use crate::profile::PermEntry;

/// A fixup entry after resolution, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedFixup {
    path: PathBuf,
    uid: u32,
    gid: u32,
    mode: u32,
    recursive: bool,
}

/// Turn a table key like `/etc/shadow` or `/home/bred/` into a path relative
/// to the target root.
fn table_key_to_relative(key: &str) -> Result<PathBuf> {
    let rel = PathBuf::from(key.trim_start_matches('/'));
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(BuildError::SecurityInvariant(format!(
            "permission fixup path '{key}' contains '..'"
        ))
        .into());
    }
    Ok(rel)
}

/// Canonicalize `target/<key>` and require that it stays inside `root`
/// (the canonical target). The root itself is accepted.
fn confine(root: &Path, key: &str) -> Result<Option<PathBuf>> {
    let rel = table_key_to_relative(key)?;
    let candidate = root.join(&rel);
    if candidate.symlink_metadata().is_err() {
        return Ok(None);
    }
    let real = match fs::canonicalize(&candidate) {
        Ok(real) => real,
        // Dangling symlink: nothing inside the tree to fix, and following it
        // would leave the tree.
        Err(_) => {
            return Err(BuildError::SecurityInvariant(format!(
                "permission fixup path '{key}' is a dangling symlink"
            ))
            .into())
        }
    };
    if !real.starts_with(root) {
        return Err(BuildError::SecurityInvariant(format!(
            "permission fixup path '{key}' resolves to {} outside {}",
            real.display(),
            root.display()
        ))
        .into());
    }
    Ok(Some(real))
}

/// How owner and group names missing from the target are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLookup {
    /// Unknown names are a configuration error.
    Required,
    /// Entries naming unknown accounts are skipped. Used before packages
    /// have created the target's account database.
    Deferred,
}

/// Apply the fixup table to `target`.
///
/// Every entry is resolved and checked before anything is changed: a path
/// that resolves outside `target` aborts the whole table with
/// [`BuildError::SecurityInvariant`]. Keys ending in `/` apply to the
/// directory and everything below it (symlinks are re-owned, not followed).
/// Paths missing from the target are skipped with a warning.
pub fn fix_permissions(
    target: &Path,
    perms: &BTreeMap<String, PermEntry>,
    lookup: AccountLookup,
) -> Result<()> {
    if perms.is_empty() {
        return Ok(());
    }
    let root = fs::canonicalize(target)
        .with_context(|| format!("Failed to resolve target {}", target.display()))?;

    let mut fixups = Vec::with_capacity(perms.len());
    for (key, entry) in perms {
        let Some(path) = confine(&root, key)? else {
            tracing::warn!("permission fixup path '{key}' does not exist in the target, skipping");
            continue;
        };
        let ids = resolve_uid(&root, &entry.owner)
            .and_then(|uid| Ok((uid, resolve_gid(&root, &entry.group)?)));
        let (uid, gid) = match ids {
            Ok(ids) => ids,
            Err(err)
                if lookup == AccountLookup::Deferred
                    && matches!(
                        BuildError::classify(&err),
                        Some(BuildError::Configuration(_))
                    ) =>
            {
                tracing::debug!("deferring perms entry '{key}': {err:#}");
                continue;
            }
            Err(err) => return Err(err.context(format!("perms entry '{key}'"))),
        };
        fixups.push(ResolvedFixup {
            path,
            uid,
            gid,
            mode: entry.mode_bits().with_context(|| format!("perms entry '{key}'"))?,
            recursive: key.ends_with('/'),
        });
    }

    for fixup in &fixups {
        apply(fixup)?;
    }
    tracing::info!("Applied {} permission fixups in {}", fixups.len(), root.display());
    Ok(())
}

fn apply(fixup: &ResolvedFixup) -> Result<()> {
    if !fixup.recursive {
        return set_owner_and_mode(&fixup.path, fixup, false);
    }
    for entry in WalkDir::new(&fixup.path).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", fixup.path.display()))?;
        set_owner_and_mode(entry.path(), fixup, entry.path_is_symlink())?;
    }
    Ok(())
}

fn set_owner_and_mode(path: &Path, fixup: &ResolvedFixup, is_symlink: bool) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(fixup.uid), Some(fixup.gid)).with_context(|| {
        format!(
            "Failed to chown {}:{} {}",
            fixup.uid,
            fixup.gid,
            path.display()
        )
    })?;
    if !is_symlink {
        fs::set_permissions(path, fs::Permissions::from_mode(fixup.mode))
            .with_context(|| format!("Failed to chmod {:o} {}", fixup.mode, path.display()))?;
    }
    Ok(())
}
