use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use appliance_sys::lock::DEFAULT_LOCK_PATH;
use appliance_sys::partitioned::mount_path;
use appliance_sys::{
    BackingImage, BlockDeviceDriver, DryRunDriver, FormattedVolume, HostLock, Layout,
    PartitionedVolumeSet, SystemDriver, TeardownReport,
};
use appliance_types::{DiskKind, DiskRecord, PartitionRecord};
use tracing::{debug, info, warn};

use crate::errors::{LabError, Result};
use crate::ledger::{self, BuildState};
use crate::spec::{self, ApplianceSpec, workspace_root};

/// Directories one build works in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPaths {
    pub work_dir: PathBuf,
    pub mount_root: PathBuf,
    pub output_dir: PathBuf,
}

impl BuildPaths {
    pub fn for_spec(spec: &ApplianceSpec) -> Self {
        Self {
            work_dir: spec::artifacts_root(spec),
            mount_root: spec::mount_root(spec),
            output_dir: spec::output_dir(spec),
        }
    }

    /// Scratch tree for dry runs, so nothing outside `target/` is touched
    pub fn dry_run(spec: &ApplianceSpec) -> Self {
        Self::under(
            &workspace_root()
                .join("target/appliance-lab/dry-run")
                .join(&spec.name),
        )
    }

    pub fn under(base: &Path) -> Self {
        Self {
            work_dir: base.join("images"),
            mount_root: base.join("install_root"),
            output_dir: base.join("output"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dry_run: bool,
    /// Shell command run against the mounted tree
    pub hook: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub lock_path: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            hook: None,
            output_dir: None,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanReport {
    pub spec_name: String,
    pub layout: Layout,
    /// (disk, kind, bytes) in disk order
    pub disks: Vec<(String, DiskKind, u64)>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub spec_name: String,
    /// Partitions as they were mounted, in mount order
    pub records: Vec<PartitionRecord>,
    pub disks: Vec<DiskRecord>,
    pub fstab: String,
    pub staged: Vec<PathBuf>,
    /// Commands a dry run would have issued
    pub commands: Vec<String>,
    /// Teardown steps that failed and were skipped
    pub suppressed: Vec<String>,
}

pub fn require_root() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(LabError::PrivilegeRequired);
    }
    Ok(())
}

/// Lay partitions out without touching the host
pub fn plan(spec: &ApplianceSpec) -> Result<PlanReport> {
    let disks = spec::resolved_disks(spec)?;
    let layout = spec::partition_plan(spec)?.layout(disks.keys())?;

    Ok(PlanReport {
        spec_name: spec.name.clone(),
        layout,
        disks: disks
            .into_iter()
            .map(|(name, (disk, size))| (name, disk.kind, size))
            .collect(),
    })
}

/// Backing images and partitions for `spec`, nothing created yet
pub fn assemble(spec: &ApplianceSpec, paths: &BuildPaths) -> Result<PartitionedVolumeSet> {
    let mut images = BTreeMap::new();
    for (name, (disk, size)) in spec::resolved_disks(spec)? {
        let image = match disk.kind {
            DiskKind::FixedRaw => {
                let device = disk.device.clone().ok_or_else(|| LabError::SpecInvalid {
                    spec_name: spec.name.clone(),
                    reason: format!("fixed-raw disk {name} has no device"),
                })?;
                BackingImage::raw(size, device)
            }
            DiskKind::Loopback => {
                BackingImage::loopback(paths.work_dir.join(spec::image_file_name(spec, &disk)), size)
            }
            DiskKind::SparseLoopback => {
                BackingImage::sparse(paths.work_dir.join(spec::image_file_name(spec, &disk)), size)
            }
        };
        images.insert(name, image);
    }

    let mut set = PartitionedVolumeSet::new(images, &paths.mount_root);
    for request in &spec.partitions {
        set.add_partition(
            request.size_mb,
            request.disk.as_deref(),
            &request.mountpoint,
            request.fstype.as_deref(),
        )?;
    }
    Ok(set)
}

/// Build `spec` on this host, or record the commands when `dry_run` is set
pub fn build(spec: &ApplianceSpec, opts: &BuildOptions) -> Result<BuildReport> {
    if opts.dry_run {
        let driver = DryRunDriver::new();
        let paths = BuildPaths::dry_run(spec);
        if let Some(hook) = &opts.hook {
            info!("Dry run: not running hook `{}`", hook);
        }
        let mut report = build_with(spec, &driver, &paths, None, false)?;
        report.commands = driver.commands();
        return Ok(report);
    }

    require_root()?;
    let _lock = HostLock::acquire(&opts.lock_path)?;

    let mut paths = BuildPaths::for_spec(spec);
    if let Some(output_dir) = &opts.output_dir {
        paths.output_dir = output_dir.clone();
    }

    if ledger::exists(&spec.name) {
        warn!("Releasing resources left by an earlier build of {}", spec.name);
        cleanup_stale(&spec.name, &SystemDriver::new(), true)?;
    }

    build_with(spec, &SystemDriver::new(), &paths, opts.hook.as_deref(), true)
}

/// Mount everything, run the hook, tear down and stage the images. Teardown
/// always runs; an error from an earlier step is returned after it.
pub fn build_with(
    spec: &ApplianceSpec,
    driver: &dyn BlockDeviceDriver,
    paths: &BuildPaths,
    hook: Option<&str>,
    record_ledger: bool,
) -> Result<BuildReport> {
    let mut set = assemble(spec, paths)?;
    info!("Building {} under {:?}", spec.name, set.root());

    let populated = populate(spec, &mut set, driver, hook, record_ledger);

    let teardown = set.cleanup(driver);
    if record_ledger && teardown.is_clean() {
        ledger::remove(&spec.name)?;
    }

    let (records, fstab) = populated?;
    let disks = set.disk_records();
    let staged = stage(spec, set.into_disks(), &paths.output_dir)?;
    info!("Built {} ({} images)", spec.name, staged.len());

    Ok(BuildReport {
        spec_name: spec.name.clone(),
        records,
        disks,
        fstab,
        staged,
        commands: Vec::new(),
        suppressed: teardown
            .errors()
            .iter()
            .map(|(step, error)| format!("{step}: {error}"))
            .collect(),
    })
}

fn populate(
    spec: &ApplianceSpec,
    set: &mut PartitionedVolumeSet,
    driver: &dyn BlockDeviceDriver,
    hook: Option<&str>,
    record_ledger: bool,
) -> Result<(Vec<PartitionRecord>, String)> {
    set.mount(driver)?;

    if record_ledger {
        let path = ledger::save(&build_state(spec, set))?;
        debug!("Recorded build state in {:?}", path);
    }

    let fstab = set.fstab();
    write_fstab(set.root(), &fstab)?;

    if let Some(command) = hook {
        run_hook(command, set.root())?;
    }

    Ok((set.records(), fstab))
}

fn build_state(spec: &ApplianceSpec, set: &PartitionedVolumeSet) -> BuildState {
    let mut state = BuildState::new(&spec.name);
    let disks = set.disk_records();
    state.image_paths = disks
        .iter()
        .filter_map(|disk| disk.file.as_ref())
        .map(|file| file.display().to_string())
        .collect();
    state.loop_devices = disks
        .iter()
        .filter(|disk| disk.kind.is_file_backed())
        .filter_map(|disk| disk.device.clone())
        .collect();
    state.device_nodes = set
        .records()
        .into_iter()
        .filter_map(|record| record.device)
        .collect();
    state.mount_points = set
        .unmount_order()
        .iter()
        .map(|mountpoint| mount_path(set.root(), mountpoint).display().to_string())
        .collect();
    state
}

fn write_fstab(root: &Path, fstab: &str) -> Result<()> {
    let etc = root.join("etc");
    let io_error = |path: &Path, error: std::io::Error| LabError::Io {
        path: path.to_path_buf(),
        reason: error.to_string(),
    };

    fs::create_dir_all(&etc).map_err(|error| io_error(&etc, error))?;
    let path = etc.join("fstab");
    fs::write(&path, fstab).map_err(|error| io_error(&path, error))?;
    debug!("Wrote {:?}", path);
    Ok(())
}

fn run_hook(command: &str, root: &Path) -> Result<()> {
    info!("Running hook `{}`", command);
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("APPLIANCE_ROOT", root)
        .status()
        .map_err(|error| LabError::HookFailed {
            command: command.to_string(),
            reason: error.to_string(),
        })?;

    if !status.success() {
        return Err(LabError::HookFailed {
            command: command.to_string(),
            reason: status.to_string(),
        });
    }
    Ok(())
}

/// Move every file-backed image to `<output>/<spec>-<disk>.raw`
fn stage(
    spec: &ApplianceSpec,
    disks: BTreeMap<String, BackingImage>,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::new();
    for (name, mut image) in disks {
        if image.file().is_none() {
            continue;
        }
        let dest = output_dir.join(format!("{}-{}.raw", spec.name, name));
        staged.push(image.stage_to(&dest)?);
    }
    Ok(staged)
}

/// Release what a dead build left on the host, according to its ledger
/// entry. Every step is attempted. The entry is dropped when
/// `remove_entry` is set.
pub fn cleanup_stale(
    spec_name: &str,
    driver: &dyn BlockDeviceDriver,
    remove_entry: bool,
) -> Result<TeardownReport> {
    let mut report = TeardownReport::new();
    if !ledger::exists(spec_name) {
        debug!("No build state for {}", spec_name);
        return Ok(report);
    }

    let state = ledger::load(spec_name)?;
    info!(
        "Cleaning up {} from {}",
        spec_name,
        state.updated_at.to_rfc3339()
    );

    for mount_point in &state.mount_points {
        report.note(
            format!("umount {mount_point}"),
            driver.unmount(Path::new(mount_point)),
        );
    }
    for node in &state.device_nodes {
        report.note(
            format!("unlink {node}"),
            driver.unlink_device_node(Path::new(node)),
        );
    }
    for device in &state.loop_devices {
        report.note(
            format!("kpartx -d {device}"),
            driver.remove_partition_mappings(device),
        );
        report.note(format!("losetup -d {device}"), driver.detach_loop(device));
    }

    if remove_entry {
        ledger::remove(spec_name)?;
    }
    Ok(report)
}

/// Clean up one spec, or every spec with a ledger entry
pub fn cleanup(spec_name: Option<&str>, dry_run: bool, lock_path: &Path) -> Result<Vec<String>> {
    let names = match spec_name {
        Some(name) => vec![name.to_string()],
        None => ledger::stale_specs()?,
    };

    if dry_run {
        let driver = DryRunDriver::new();
        for name in &names {
            cleanup_stale(name, &driver, false)?;
        }
        return Ok(driver.commands());
    }

    require_root()?;
    let _lock = HostLock::acquire(lock_path)?;
    let driver = SystemDriver::new();
    let mut report = TeardownReport::new();
    for name in &names {
        report.merge(cleanup_stale(name, &driver, true)?);
    }
    Ok(report.failed_steps().into_iter().map(str::to_string).collect())
}

/// Shrink a finished ext image file in place to its minimal size, keeping at
/// least `keep_bytes` when given
pub fn resparse_image(image: &Path, keep_bytes: Option<u64>) -> Result<Option<u64>> {
    require_root()?;
    resparse_image_with(&SystemDriver::new(), image, keep_bytes)
}

pub fn resparse_image_with(
    driver: &dyn BlockDeviceDriver,
    image: &Path,
    keep_bytes: Option<u64>,
) -> Result<Option<u64>> {
    let len = fs::metadata(image)
        .map_err(|error| LabError::Io {
            path: image.to_path_buf(),
            reason: error.to_string(),
        })?
        .len();

    // Never mounted: resparse only checks and resizes the file itself
    let mut volume = FormattedVolume::new(
        BackingImage::sparse(image, len),
        image.with_extension("mnt"),
        "ext4",
    );
    Ok(volume.resparse(driver, keep_bytes)?)
}
