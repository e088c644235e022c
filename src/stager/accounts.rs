//! Account database of a staged root (`etc/passwd`, `etc/group`).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

const SUPERUSER: &str = "root";

/// One `etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory as recorded in passwd (absolute within the target).
    pub home: PathBuf,
}

/// Read every account of the target's passwd file.
///
/// A missing file yields no accounts; an unparsable record is an error.
pub fn read_accounts(root: &Path) -> Result<Vec<Account>> {
    let passwd_path = root.join("etc/passwd");
    if !passwd_path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?;

    let mut accounts = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 6 {
            anyhow::bail!(
                "Corrupted passwd file: short record '{}' at {}",
                line,
                passwd_path.display()
            );
        }
        let uid: u32 = parts[2].parse().with_context(|| {
            format!(
                "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                parts[2],
                parts[0],
                passwd_path.display()
            )
        })?;
        let gid: u32 = parts[3].parse().with_context(|| {
            format!(
                "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
                parts[3],
                parts[0],
                passwd_path.display()
            )
        })?;
        accounts.push(Account {
            name: parts[0].to_string(),
            uid,
            gid,
            home: PathBuf::from(parts[5]),
        });
    }
    Ok(accounts)
}

/// Read a GID from the target's group file.
pub fn read_gid(root: &Path, groupname: &str) -> Result<Option<u32>> {
    let group_path = root.join("etc/group");
    if !group_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&group_path)
        .with_context(|| format!("Failed to read group file at {}", group_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == groupname {
            let gid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "Corrupted group file: invalid GID '{}' for group '{}' at {}",
                    parts[2],
                    groupname,
                    group_path.display()
                )
            })?;
            return Ok(Some(gid));
        }
    }
    Ok(None)
}

/// Resolve an owner given by name or number against the target root.
///
/// `root` always resolves, even before the target has a passwd file.
pub fn resolve_uid(root: &Path, owner: &str) -> Result<u32> {
    if let Ok(uid) = owner.parse() {
        return Ok(uid);
    }
    let found = read_accounts(root)?
        .into_iter()
        .find(|a| a.name == owner)
        .map(|a| a.uid);
    match found {
        Some(uid) => Ok(uid),
        None if owner == SUPERUSER => Ok(0),
        None => Err(BuildError::config(format!(
            "user '{owner}' does not exist in the target"
        ))),
    }
}

/// Resolve a group given by name or number against the target root.
pub fn resolve_gid(root: &Path, group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse() {
        return Ok(gid);
    }
    match read_gid(root, group)? {
        Some(gid) => Ok(gid),
        None if group == SUPERUSER => Ok(0),
        None => Err(BuildError::config(format!(
            "group '{group}' does not exist in the target"
        ))),
    }
}
