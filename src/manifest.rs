//! Build manifest written next to the artifacts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::partition::PartitionLayout;
use crate::profile::BuildProfile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub file: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutRecord {
    pub image: String,
    pub layout: PartitionLayout,
}

/// Identity, layouts and artifacts of one finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildManifest {
    pub name: String,
    pub version: String,
    pub edition: String,
    pub arch: String,
    pub device: String,
    pub fs: String,
    pub kind: String,
    pub backend: String,
    pub layouts: Vec<LayoutRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
}

pub fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting current UTC time")
}

impl BuildManifest {
    pub fn new(profile: &BuildProfile, started_at_utc: String) -> Self {
        Self {
            name: profile.img_name.clone(),
            version: profile.img_version.clone(),
            edition: profile.edition.clone(),
            arch: profile.arch.to_string(),
            device: profile.device.to_string(),
            fs: profile.fs.to_string(),
            kind: profile.kind.to_string(),
            backend: profile.backend.to_string(),
            layouts: Vec::new(),
            artifacts: Vec::new(),
            started_at_utc,
            finished_at_utc: None,
        }
    }

    /// Record `artifact` with its digest.
    pub fn add_artifact(&mut self, artifact: &Path, sha256: String) -> Result<()> {
        let bytes = fs::metadata(artifact)
            .with_context(|| format!("stat {}", artifact.display()))?
            .len();
        self.artifacts.push(ArtifactRecord {
            file: artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            sha256,
            bytes,
        });
        Ok(())
    }

    pub fn path(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("{}.manifest.json", self.name))
    }

    /// Stamp the finish time and write `<out_dir>/<name>.manifest.json`.
    pub fn write(&mut self, out_dir: &Path) -> Result<PathBuf> {
        self.finished_at_utc = Some(now_utc()?);
        let path = self.path(out_dir);
        let bytes = serde_json::to_vec_pretty(self).context("serializing build manifest")?;
        fs::write(&path, bytes)
            .with_context(|| format!("Failed to write manifest '{}'", path.display()))?;
        Ok(path)
    }
}
