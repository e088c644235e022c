//! Image-assembly orchestrator.
//!
//! [`Pipeline::run`] walks the profile's [step list](steps::step_list),
//! advancing the [`StateMachine`] as devices are attached, partitioned,
//! formatted, populated and packaged. Any failure, and any cancellation
//! observed between stages, enters `Aborting`: the mount directory and
//! anything mounted under the install root are unmounted and every attached
//! device is released, each step best-effort.

pub mod state;
pub mod steps;

pub use state::{CancellationToken, PipelineState, StateMachine};
pub use steps::{step_list, Stage};

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use crate::device::{self, DeviceHandle};
use crate::error::BuildError;
use crate::filesystem::{self, bootconfig, fstab};
use crate::image;
use crate::manifest::{self, BuildManifest, LayoutRecord};
use crate::packages::{self, PackageMaterializer};
use crate::partition::{self, PartitionLayout, PlanOptions};
use crate::process::{Cmd, Runner};
use crate::profile::{BuildProfile, PartitionFs, PartitionSpec, PartitionTables};
use crate::stager;
use crate::teardown::{self, Compression};
use crate::workspace::{ImageRole, ImageSlot, WorkspaceState};

/// Invocation parameters that are not part of the board profile.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub work_dir: PathBuf,
    pub out_dir: PathBuf,
    pub compress: bool,
    /// Trade compression ratio for speed.
    pub fast: bool,
    /// Mount table consulted before removing directories.
    pub mount_table: PathBuf,
}

impl PipelineOptions {
    pub fn new(work_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            out_dir: out_dir.into(),
            compress: true,
            fast: false,
            mount_table: PathBuf::from(teardown::MOUNT_TABLE),
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub artifacts: Vec<PathBuf>,
    pub manifest: PathBuf,
    pub states: Vec<PipelineState>,
}

/// Values produced by one stage and consumed by a later one.
#[derive(Debug, Default)]
struct RunContext {
    root_uuid: Option<String>,
    boot_node: Option<PathBuf>,
    artifacts: Vec<PathBuf>,
    manifest_path: Option<PathBuf>,
}

pub struct Pipeline<'a> {
    profile: &'a BuildProfile,
    options: PipelineOptions,
    runner: &'a dyn Runner,
    materializer: &'a dyn PackageMaterializer,
    cancel: CancellationToken,
    state: StateMachine,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        profile: &'a BuildProfile,
        options: PipelineOptions,
        runner: &'a dyn Runner,
        materializer: &'a dyn PackageMaterializer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            profile,
            options,
            runner,
            materializer,
            cancel,
            state: StateMachine::default(),
        }
    }

    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    /// Run every stage of the profile's step list.
    ///
    /// On failure the abort path runs before the error is returned; a
    /// cancelled run returns [`BuildError::Interrupted`].
    pub fn run(&mut self) -> Result<BuildReport> {
        let mut ws = WorkspaceState::open(&self.options.work_dir, self.profile)?;
        let mut manifest = BuildManifest::new(self.profile, manifest::now_utc()?);
        let mut ctx = RunContext::default();

        let steps = step_list(self.profile);
        tracing::debug!(
            "step list: {}",
            steps.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );

        for step in steps {
            let result = self
                .check_cancelled()
                .and_then(|()| self.run_stage(step, &mut ws, &mut manifest, &mut ctx))
                .with_context(|| format!("stage '{step}'"));
            if let Err(err) = result {
                return Err(self.abort(&mut ws, err));
            }
        }
        self.state.advance(PipelineState::Done)?;

        Ok(BuildReport {
            artifacts: ctx.artifacts,
            manifest: ctx
                .manifest_path
                .context("build finished without writing a manifest")?,
            states: self.state.history().to_vec(),
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        check_cancelled(&self.cancel)
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        ws: &mut WorkspaceState,
        manifest: &mut BuildManifest,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let profile = self.profile;
        let runner = self.runner;
        tracing::info!("==> {stage}");

        match stage {
            Stage::CopyOverlay => {
                if let Some(overlay) = &profile.overlay_dir {
                    stager::stage(runner, overlay, &ws.install_dir, false)?;
                }
            }
            Stage::FixPermissions(lookup) => {
                stager::fix_permissions(&ws.install_dir, &profile.perms, lookup)?;
            }
            Stage::InstallPackages => {
                let packages = packages::read_package_list(&profile.packages_file)?;
                self.materializer
                    .materialize(runner, &packages, &ws.install_dir)?;
            }
            Stage::ResetMachineIdentity => {
                stager::reset_machine_identity(&ws.install_dir)?;
            }
            Stage::InjectFirmware => {
                stager::inject_firmware(
                    &profile.config_dir,
                    &ws.install_dir,
                    &profile.traits.firmware,
                )?;
            }
            Stage::ProvisionUsers => {
                let range = profile.tuning.user_uid_min..=profile.tuning.user_uid_max;
                stager::provision_user_skeletons(&ws.install_dir, range, &profile.img_version)?;
            }
            Stage::MeasureContent => {
                let content_kb = image::measure_tree_kb(&ws.install_dir)?;
                tracing::info!("Root content is {content_kb} KiB");
                ws.content_kb = Some(content_kb);
            }
            Stage::AssembleImages => self.assemble_images(ws)?,
            Stage::MountRoot => {
                let (device, layout) = attached(ws.root_slot())?;
                let number = layout
                    .number_of(PartitionFs::Root)
                    .context("partition layout has no root partition")?;
                let node = device.partition(number);
                filesystem::mount_root(
                    runner,
                    &node,
                    profile.fs,
                    &ws.mount_dir,
                    profile.uefi.is_some(),
                )?;
                ctx.root_uuid = Some(filesystem::read_uuid(runner, &node)?);
            }
            Stage::MountBoot => {
                let (device, layout) = attached(ws.boot_slot())?;
                match layout.number_of(PartitionFs::Fat32) {
                    Some(number) => {
                        let node = device.partition(number);
                        filesystem::mount_boot(
                            runner,
                            &node,
                            &ws.mount_dir,
                            profile.uefi.is_some(),
                        )?;
                        ctx.boot_node = Some(node);
                    }
                    None => tracing::info!("No fat32 partition, boot files stay on the root"),
                }
            }
            Stage::StageContent => {
                stager::stage(runner, &ws.install_dir, &ws.mount_dir, true)?;
                self.state.advance(PipelineState::Staged)?;
            }
            Stage::WriteBootConfig => {
                let root_uuid = ctx.root_uuid.as_deref().context("root UUID is not known")?;
                bootconfig::write_boot_config(
                    &ws.mount_dir,
                    profile.traits.boot_config,
                    &profile.configtxt,
                    root_uuid,
                    &profile.cmdline,
                )?;
            }
            Stage::InstallUefiBootloader => {
                let uefi = profile
                    .uefi
                    .as_ref()
                    .context("profile has no UEFI configuration")?;
                bootconfig::install_uefi_bootloader(
                    runner,
                    &ws.mount_dir,
                    &uefi.target,
                    &profile.img_name,
                    uefi.cmdline.as_deref().unwrap_or(&profile.cmdline),
                    uefi.dtb.as_deref(),
                )?;
            }
            Stage::WriteFstab => {
                let root_uuid = ctx.root_uuid.as_deref().context("root UUID is not known")?;
                let (boot_uuid, boot_fstype) = match &ctx.boot_node {
                    Some(node) => (
                        Some(filesystem::read_uuid(runner, node)?),
                        Some(filesystem::read_fstype(runner, node)?),
                    ),
                    None => (None, None),
                };
                let lines = fstab::fstab_lines(&fstab::FstabInput {
                    fs: profile.fs,
                    root_uuid,
                    boot_uuid: boot_uuid.as_deref(),
                    boot_fstype: boot_fstype.as_deref(),
                    boot_mount: filesystem::boot_mount_point(profile.uefi.is_some()),
                    simple_vfat: profile.traits.simple_vfat,
                    no_discard: profile.traits.no_discard,
                });
                fstab::append_fstab(&ws.mount_dir, &lines)?;
            }
            Stage::Unmount => {
                teardown::unmount(runner, &ws.mount_dir)?;
                self.state.advance(PipelineState::Unmounted)?;
            }
            Stage::ReleaseDevices => {
                for slot in &mut ws.images {
                    if let Some(handle) = slot.device.as_mut() {
                        device::release(runner, handle)?;
                    }
                }
            }
            Stage::ArchiveRootfs => {
                let slot = ws.images.first().context("workspace has no image slot")?;
                archive_tree(&ws.install_dir, &slot.path)?;
                self.state.advance(PipelineState::Staged)?;
            }
            Stage::Finalize => self.finalize(ws, manifest, ctx)?,
            Stage::Cleanup => {
                teardown::cleanup(&ws.work_dir, &self.options.mount_table)?;
            }
        }
        Ok(())
    }

    /// Size, create, attach, partition and format every image slot.
    ///
    /// Split builds assemble their two images concurrently; device leasing
    /// (find a free node, then bind it) is serialized between them.
    fn assemble_images(&mut self, ws: &mut WorkspaceState) -> Result<()> {
        let profile = self.profile;
        let content_kb = ws.content_kb.context("root content was not measured")?;
        for slot in &mut ws.images {
            slot.size_kb = match slot.role {
                ImageRole::Boot => profile.tuning.split_boot_size_kb,
                ImageRole::Combined | ImageRole::Root => {
                    image::image_size_kb(content_kb, Some(profile.fs), &profile.tuning)?
                }
            };
        }

        let runner = self.runner;
        let cancel = &self.cancel;
        let lease = Mutex::new(());
        let lease = &lease;
        let outcomes: Vec<(PipelineState, Result<()>)> = if ws.images.len() > 1 {
            thread::scope(|scope| {
                let handles: Vec<_> = ws
                    .images
                    .iter_mut()
                    .zip(0u32..)
                    .map(|(slot, index)| {
                        scope.spawn(move || {
                            assemble_slot(runner, profile, cancel, lease, index, slot)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            (
                                PipelineState::Init,
                                Err(anyhow!("image assembly thread panicked")),
                            )
                        })
                    })
                    .collect()
            })
        } else {
            ws.images
                .iter_mut()
                .zip(0u32..)
                .map(|(slot, index)| assemble_slot(runner, profile, cancel, lease, index, slot))
                .collect()
        };

        // The build is as far along as its slowest image.
        let reached = outcomes
            .iter()
            .map(|(state, _)| *state)
            .min()
            .unwrap_or(PipelineState::Init);
        for state in [
            PipelineState::DeviceAllocated,
            PipelineState::Partitioned,
            PipelineState::Formatted,
        ] {
            if state <= reached {
                self.state.advance(state)?;
            }
        }
        for (_, result) in outcomes {
            result?;
        }
        Ok(())
    }

    fn finalize(
        &mut self,
        ws: &WorkspaceState,
        manifest: &mut BuildManifest,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let tuning = &self.profile.tuning;
        let compression = self.options.compress.then(|| Compression {
            level: if self.options.fast {
                tuning.xz_fast_level
            } else {
                tuning.xz_level
            },
            memory_limit: tuning.xz_memory_limit.clone(),
        });

        for slot in &ws.images {
            if !slot.path.is_file() {
                return Err(BuildError::config(format!(
                    "image file {} does not exist",
                    slot.path.display()
                )));
            }
            let artifact = teardown::finalize(
                self.runner,
                &slot.path,
                &self.options.out_dir,
                compression.as_ref(),
            )?;
            manifest.add_artifact(&artifact.path, artifact.sha256)?;
            if let Some(layout) = &slot.layout {
                manifest.layouts.push(LayoutRecord {
                    image: file_name(&slot.path),
                    layout: layout.clone(),
                });
            }
            ctx.artifacts.push(artifact.path);
        }
        ctx.manifest_path = Some(manifest.write(&self.options.out_dir)?);
        self.state.advance(PipelineState::Packaged)?;
        Ok(())
    }

    /// Enter `Aborting` and undo what can be undone, in order: unmount the
    /// mount directory, unmount anything under the install root, release
    /// every attached device. Failures here are logged and swallowed.
    fn abort(&mut self, ws: &mut WorkspaceState, err: anyhow::Error) -> anyhow::Error {
        let interrupted = self.cancel.is_cancelled()
            || matches!(BuildError::classify(&err), Some(BuildError::Interrupted));
        let from = self.state.abort();
        let from = from.map(|s| s.name()).unwrap_or("finished");
        if interrupted {
            tracing::error!("Termination requested in state {from}, cleaning up");
        } else {
            tracing::error!("Build failed in state {from}: {err:#}");
        }

        let runner = self.runner;
        match Cmd::new("umount")
            .arg("-R")
            .arg_path(&ws.mount_dir)
            .allow_fail()
            .run(runner)
        {
            Ok(out) if !out.success() => tracing::debug!(
                "unmounting {}: {}",
                ws.mount_dir.display(),
                out.stderr.trim()
            ),
            Ok(_) => tracing::info!("Unmounted {}", ws.mount_dir.display()),
            Err(e) => tracing::warn!("Failed to unmount {}: {e:#}", ws.mount_dir.display()),
        }

        if let Err(e) = teardown::unmount_nested(runner, &ws.install_dir, &self.options.mount_table)
        {
            tracing::warn!(
                "Failed to unmount below {}: {e:#}",
                ws.install_dir.display()
            );
        }

        for slot in &mut ws.images {
            if let Some(handle) = slot.device.as_mut() {
                if let Err(e) = device::release(runner, handle) {
                    tracing::warn!("Failed to release {handle}: {e:#}");
                }
            }
        }

        if interrupted {
            BuildError::Interrupted.into()
        } else {
            err
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BuildError::Interrupted.into());
    }
    Ok(())
}

fn attached(slot: Option<&ImageSlot>) -> Result<(&DeviceHandle, &PartitionLayout)> {
    let slot = slot.context("workspace has no image slot for this partition")?;
    let device = slot
        .device
        .as_ref()
        .with_context(|| format!("{} has no device", slot.path.display()))?;
    let layout = slot
        .layout
        .as_ref()
        .with_context(|| format!("{} was not partitioned", slot.path.display()))?;
    Ok((device, layout))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Partition table and planning options for one image.
fn table_for(
    profile: &BuildProfile,
    role: ImageRole,
) -> Result<(&[PartitionSpec], PlanOptions<'_>)> {
    let base = PlanOptions {
        fs: Some(profile.fs),
        leading: None,
        esp_flag: profile.esp_flag,
        pre_hooks: &[],
        post_hooks: &[],
        config_dir: &profile.config_dir,
    };
    match (&profile.tables, role) {
        (PartitionTables::Single(table), ImageRole::Combined) => Ok((
            table.as_slice(),
            PlanOptions {
                leading: profile.uefi.as_ref().map(|u| &u.firmware),
                pre_hooks: &profile.pre_partition,
                post_hooks: &profile.post_partition,
                ..base
            },
        )),
        // Board hooks address the combined image only.
        (PartitionTables::Split { boot, .. }, ImageRole::Boot) => {
            Ok((boot.as_slice(), PlanOptions { fs: None, ..base }))
        }
        (PartitionTables::Split { root, .. }, ImageRole::Root) => Ok((
            root.as_slice(),
            PlanOptions {
                esp_flag: false,
                ..base
            },
        )),
        _ => Err(BuildError::config(format!(
            "no partition table for the {role:?} image of device '{}'",
            profile.device
        ))),
    }
}

/// Bring one image slot to `Formatted`. Returns the state reached, even
/// when a later sub-step fails.
fn assemble_slot(
    runner: &dyn Runner,
    profile: &BuildProfile,
    cancel: &CancellationToken,
    lease: &Mutex<()>,
    index: u32,
    slot: &mut ImageSlot,
) -> (PipelineState, Result<()>) {
    let mut reached = PipelineState::Init;
    let result = assemble_slot_steps(runner, profile, cancel, lease, index, slot, &mut reached);
    (reached, result)
}

fn assemble_slot_steps(
    runner: &dyn Runner,
    profile: &BuildProfile,
    cancel: &CancellationToken,
    lease: &Mutex<()>,
    index: u32,
    slot: &mut ImageSlot,
    reached: &mut PipelineState,
) -> Result<()> {
    let (table, opts) = table_for(profile, slot.role)?;

    check_cancelled(cancel)?;
    image::create_image_file(runner, &slot.path, slot.size_kb, slot.format)?;
    {
        let _lease = lease
            .lock()
            .map_err(|_| anyhow!("device lease lock poisoned"))?;
        let handle = slot
            .device
            .insert(device::acquire(runner, profile.backend, index)?);
        device::attach(runner, handle, &slot.path, slot.format)?;
    }
    *reached = PipelineState::DeviceAllocated;

    check_cancelled(cancel)?;
    let device = slot.device.as_ref().context("device vanished after attach")?;
    let plan = partition::plan(table, device.path(), slot.size_kb, &opts)?;
    partition::apply(runner, device, &plan)?;
    *reached = PipelineState::Partitioned;

    check_cancelled(cancel)?;
    filesystem::format(runner, device, &plan.layout, opts.fs)?;
    slot.layout = Some(plan.layout);
    *reached = PipelineState::Formatted;
    Ok(())
}

/// Archive `root` into a tar file at `dest`, keeping ownership and modes.
fn archive_tree(root: &Path, dest: &Path) -> Result<()> {
    tracing::info!("Archiving {} into {}", root.display(), dest.display());
    let file = File::create(dest)
        .with_context(|| format!("Failed to create archive {}", dest.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", root)
        .with_context(|| format!("Failed to archive {}", root.display()))?;
    let file = builder
        .into_inner()
        .with_context(|| format!("Failed to finish archive {}", dest.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", dest.display()))?;
    Ok(())
}
