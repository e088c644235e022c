//! Package materialization into the install root.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process::{Cmd, Runner};

/// Read a package list: one package per line, `#` comments and blank lines
/// ignored.
pub fn read_package_list(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| {
        BuildError::Configuration(format!("reading packages file {}: {e}", path.display()))
    })?;
    let packages: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if packages.is_empty() {
        return Err(BuildError::config(format!(
            "packages file {} lists no packages",
            path.display()
        )));
    }
    Ok(packages)
}

/// Populates a root directory with a package set.
pub trait PackageMaterializer: Send + Sync {
    fn materialize(&self, runner: &dyn Runner, packages: &[String], root: &Path) -> Result<()>;
}

/// Installs with `pacstrap` using the board's pacman configuration.
#[derive(Debug, Clone)]
pub struct Pacstrap {
    pub pacman_conf: PathBuf,
}

impl PackageMaterializer for Pacstrap {
    fn materialize(&self, runner: &dyn Runner, packages: &[String], root: &Path) -> Result<()> {
        tracing::info!("Install dir is: {}", root.display());
        tracing::info!("Running pacstrap ({} packages)", packages.len());
        Cmd::new("pacstrap")
            .args(["-c", "-C"])
            .arg_path(&self.pacman_conf)
            .args(["-M", "-G"])
            .arg_path(root)
            .args(packages)
            .inherit_output()
            .error_msg("pacstrap failed")
            .run(runner)
            .with_context(|| format!("installing packages into {}", root.display()))?;
        tracing::info!("Pacstrap complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_read_package_list() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("packages.aarch64");
        fs::write(&path, "# base system\nbase\n\n  linux-rockchip  \n#plasma\nsddm\n").unwrap();
        assert_eq!(
            read_package_list(&path).unwrap(),
            vec!["base", "linux-rockchip", "sddm"]
        );
    }

    #[test]
    fn test_empty_package_list_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("packages.aarch64");
        fs::write(&path, "# nothing\n").unwrap();
        let err = read_package_list(&path).unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn test_pacstrap_command_line() {
        let runner = RecordingRunner::new();
        let pacstrap = Pacstrap {
            pacman_conf: PathBuf::from("/cfg/pacman.conf.aarch64"),
        };
        pacstrap
            .materialize(&runner, &["base".into(), "sudo".into()], Path::new("/work/aarch64"))
            .unwrap();
        assert_eq!(
            runner.commands(),
            vec!["pacstrap -c -C /cfg/pacman.conf.aarch64 -M -G /work/aarch64 base sudo"]
        );
    }
}
