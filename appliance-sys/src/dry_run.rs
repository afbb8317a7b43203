// SPDX-License-Identifier: GPL-3.0-only

//! Recording driver that simulates host tooling
//!
//! Every call is rendered as the command line [`crate::SystemDriver`] would
//! run and appended to a log. Loop allocation, partition tables, kpartx
//! listings, mounts and compat links are tracked in memory so multi-step
//! lifecycles behave like they would on a host. Failures can be scripted by
//! command prefix.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use appliance_types::{MIB, PartitionKind};
use tracing::debug;

use crate::driver::{BlockDeviceDriver, FilesystemGeometry, FormatRequest, ResizeOutcome};
use crate::error::{Result, SysError};
use crate::plan::EXTENDED_NUMBER;
use crate::system::render;

const DEFAULT_LOOP_CAPACITY: u32 = 8;
const DEFAULT_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Default)]
struct State {
    commands: Vec<String>,
    failures: Vec<String>,
    loops: BTreeMap<u32, PathBuf>,
    tables: BTreeMap<String, Vec<PartitionKind>>,
    mapped: BTreeSet<String>,
    links: BTreeSet<PathBuf>,
    mounted: BTreeSet<PathBuf>,
}

#[derive(Debug)]
pub struct DryRunDriver {
    state: RefCell<State>,
    loop_capacity: u32,
    block_count: Option<u64>,
    block_size: u64,
    minimal_filesystem_bytes: u64,
    mapping_counts: BTreeMap<String, usize>,
}

impl Default for DryRunDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            loop_capacity: DEFAULT_LOOP_CAPACITY,
            block_count: None,
            block_size: DEFAULT_BLOCK_SIZE,
            minimal_filesystem_bytes: MIB,
            mapping_counts: BTreeMap::new(),
        }
    }

    /// Number of loop devices the simulated host has
    pub fn with_loop_capacity(mut self, capacity: u32) -> Self {
        self.loop_capacity = capacity;
        self
    }

    /// Report `block_count` from `dumpe2fs` and accept resizes to
    /// `minimal_bytes` or more
    pub fn with_filesystem(mut self, block_count: u64, minimal_bytes: u64) -> Self {
        self.block_count = Some(block_count);
        self.minimal_filesystem_bytes = minimal_bytes;
        self
    }

    /// Block size `dumpe2fs` reports
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Make `kpartx -l` on `disk` report `count` mappings regardless of the
    /// partitions written
    pub fn with_mapping_count(mut self, disk: &str, count: usize) -> Self {
        self.mapping_counts.insert(disk.to_string(), count);
        self
    }

    /// Fail every later command whose rendered line starts with `prefix`
    pub fn fail_on(&self, prefix: &str) {
        self.state.borrow_mut().failures.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().failures.clear();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    /// Recorded commands starting with `prefix`
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|command| command.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn attached_loops(&self) -> usize {
        self.state.borrow().loops.len()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.borrow().mounted.iter().cloned().collect()
    }

    pub fn links(&self) -> Vec<PathBuf> {
        self.state.borrow().links.iter().cloned().collect()
    }

    pub fn mapped_disks(&self) -> Vec<String> {
        self.state.borrow().mapped.iter().cloned().collect()
    }

    fn record(&self, command: String) -> Result<()> {
        debug!("[dry-run] {}", command);
        let mut state = self.state.borrow_mut();
        let failed = state
            .failures
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()));
        state.commands.push(command.clone());

        if failed {
            return Err(SysError::tool(command, "exit status 1", "scripted failure"));
        }
        Ok(())
    }

    fn simulated_mappings(&self, disk: &str) -> Vec<String> {
        let base = Path::new(disk)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| disk.to_string());

        let state = self.state.borrow();
        let mut number = 0;
        let mut names = Vec::new();
        for kind in state.tables.get(disk).into_iter().flatten() {
            match kind {
                PartitionKind::Primary | PartitionKind::Logical => number += 1,
                PartitionKind::Extended => {
                    number = EXTENDED_NUMBER;
                    continue;
                }
            }
            names.push(format!("{base}p{number}"));
        }

        if let Some(&count) = self.mapping_counts.get(disk) {
            while names.len() < count {
                names.push(format!("{base}p{}", 90 + names.len()));
            }
            names.truncate(count);
        }
        names
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn not_found(what: String) -> SysError {
    SysError::Io(io::Error::new(io::ErrorKind::NotFound, what))
}

impl BlockDeviceDriver for DryRunDriver {
    fn find_free_loop(&self) -> Result<String> {
        self.record(render("losetup", &["-f"]))
            .map_err(|e| SysError::ResourceExhausted(e.to_string()))?;

        let state = self.state.borrow();
        (0..self.loop_capacity)
            .find(|index| !state.loops.contains_key(index))
            .map(|index| format!("/dev/loop{index}"))
            .ok_or_else(|| SysError::ResourceExhausted("no free loop device".to_string()))
    }

    fn attach_loop(&self, device: &str, file: &Path) -> Result<()> {
        self.record(render("losetup", &[device, path_arg(file).as_str()]))?;

        let index = device
            .strip_prefix("/dev/loop")
            .and_then(|index| index.parse::<u32>().ok())
            .ok_or_else(|| not_found(format!("{device} is not a loop device")))?;

        let mut state = self.state.borrow_mut();
        if state.loops.contains_key(&index) {
            return Err(SysError::tool(
                format!("losetup {device}"),
                "exit status 1",
                "Device or resource busy",
            ));
        }
        state.loops.insert(index, file.to_path_buf());
        Ok(())
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        self.record(render("losetup", &["-d", device]))?;

        let mut state = self.state.borrow_mut();
        let before = state.loops.len();
        state
            .loops
            .retain(|index, _| format!("/dev/loop{index}") != device);
        if state.loops.len() == before {
            return Err(not_found(format!("{device} is not attached")));
        }
        Ok(())
    }

    fn write_label(&self, disk: &str) -> Result<()> {
        self.record(render("parted", &["-s", disk, "mklabel", "msdos"]))?;
        self.state
            .borrow_mut()
            .tables
            .insert(disk.to_string(), Vec::new());
        Ok(())
    }

    fn create_partition(
        &self,
        disk: &str,
        kind: PartitionKind,
        start_mb: u64,
        end_mb: u64,
    ) -> Result<()> {
        let start = format!("{start_mb}M");
        let end = format!("{end_mb}M");
        self.record(render(
            "parted",
            &[
                "-s",
                disk,
                "mkpart",
                kind.as_parted_str(),
                start.as_str(),
                end.as_str(),
            ],
        ))?;
        self.state
            .borrow_mut()
            .tables
            .entry(disk.to_string())
            .or_default()
            .push(kind);
        Ok(())
    }

    fn list_partition_mappings(&self, disk: &str) -> Result<Vec<String>> {
        self.record(render("kpartx", &["-l", disk]))?;
        Ok(self.simulated_mappings(disk))
    }

    fn add_partition_mappings(&self, disk: &str) -> Result<()> {
        self.record(render("kpartx", &["-a", disk]))?;
        self.state.borrow_mut().mapped.insert(disk.to_string());
        Ok(())
    }

    fn remove_partition_mappings(&self, disk: &str) -> Result<()> {
        self.record(render("kpartx", &["-d", disk]))?;
        self.state.borrow_mut().mapped.remove(disk);
        Ok(())
    }

    fn link_device_node(&self, target: &Path, link: &Path) -> Result<()> {
        self.record(render("ln", &["-s", path_arg(target).as_str(), path_arg(link).as_str()]))?;
        self.state.borrow_mut().links.insert(link.to_path_buf());
        Ok(())
    }

    fn unlink_device_node(&self, link: &Path) -> Result<()> {
        self.record(render("rm", &[path_arg(link).as_str()]))?;
        if !self.state.borrow_mut().links.remove(link) {
            return Err(not_found(format!("{link:?} does not exist")));
        }
        Ok(())
    }

    fn make_filesystem(&self, request: &FormatRequest<'_>) -> Result<()> {
        let tool = format!("mkfs.{}", request.fstype);
        let block_size = request.block_size.to_string();
        self.record(render(
            &tool,
            &[
                "-F",
                "-L",
                request.label,
                "-m",
                "1",
                "-b",
                block_size.as_str(),
                request.device,
            ],
        ))
    }

    fn tune_filesystem(&self, device: &str) -> Result<()> {
        self.record(render(
            "tune2fs",
            &["-c0", "-i0", "-Odir_index", "-ouser_xattr,acl", device],
        ))
    }

    fn check_filesystem(&self, target: &Path) -> Result<()> {
        self.record(render("e2fsck", &["-f", "-y", path_arg(target).as_str()]))
    }

    fn filesystem_geometry(&self, target: &Path) -> Result<FilesystemGeometry> {
        self.record(render("dumpe2fs", &["-h", path_arg(target).as_str()]))?;
        let block_count = match self.block_count {
            Some(count) => count,
            None => std::fs::metadata(target)
                .map(|meta| meta.len() / self.block_size)
                .unwrap_or(0),
        };
        Ok(FilesystemGeometry {
            block_count,
            block_size: self.block_size,
        })
    }

    fn resize_filesystem(&self, target: &Path, size_bytes: u64) -> Result<ResizeOutcome> {
        let size = format!("{}K", size_bytes / 1024);
        self.record(render("resize2fs", &[path_arg(target).as_str(), size.as_str()]))?;
        if size_bytes >= self.minimal_filesystem_bytes {
            Ok(ResizeOutcome::Resized)
        } else {
            Ok(ResizeOutcome::Refused)
        }
    }

    fn make_swap(&self, device: &str) -> Result<()> {
        self.record(render("mkswap", &[device]))
    }

    fn mount(&self, device: &str, dir: &Path, fstype: Option<&str>) -> Result<()> {
        let dir_arg = path_arg(dir);
        let mut args = vec![device, dir_arg.as_str()];
        if let Some(fstype) = fstype {
            args.extend(["-t", fstype]);
        }
        self.record(render("mount", &args))?;

        if !self.state.borrow_mut().mounted.insert(dir.to_path_buf()) {
            return Err(SysError::tool(
                render("mount", &args),
                "exit status 32",
                format!("{dir_arg} already mounted"),
            ));
        }
        Ok(())
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        let dir_arg = path_arg(dir);
        self.record(render("umount", &[dir_arg.as_str()]))?;

        if !self.state.borrow_mut().mounted.remove(dir) {
            return Err(SysError::tool(
                format!("umount {dir_arg}"),
                "exit status 32",
                format!("{dir_arg}: not mounted"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulates_kpartx_names_from_written_table() {
        let driver = DryRunDriver::new();
        driver.write_label("/dev/loop0").unwrap();
        for kind in [
            PartitionKind::Primary,
            PartitionKind::Primary,
            PartitionKind::Primary,
            PartitionKind::Extended,
            PartitionKind::Logical,
            PartitionKind::Logical,
        ] {
            driver.create_partition("/dev/loop0", kind, 0, 1).unwrap();
        }

        assert_eq!(
            driver.list_partition_mappings("/dev/loop0").unwrap(),
            vec!["loop0p1", "loop0p2", "loop0p3", "loop0p6", "loop0p7"]
        );
        assert!(driver.list_partition_mappings("/dev/loop1").unwrap().is_empty());
    }

    #[test]
    fn mapping_count_override_changes_listing() {
        let driver = DryRunDriver::new().with_mapping_count("/dev/loop0", 2);
        driver.write_label("/dev/loop0").unwrap();
        driver
            .create_partition("/dev/loop0", PartitionKind::Primary, 0, 10)
            .unwrap();
        assert_eq!(driver.list_partition_mappings("/dev/loop0").unwrap().len(), 2);
    }

    #[test]
    fn scripted_failures_are_recorded_and_raised() {
        let driver = DryRunDriver::new();
        driver.fail_on("kpartx -d");

        let error = driver.remove_partition_mappings("/dev/loop0").unwrap_err();
        assert!(matches!(error, SysError::ExternalTool { ref command, .. } if command == "kpartx -d /dev/loop0"));
        assert_eq!(driver.commands(), vec!["kpartx -d /dev/loop0"]);

        driver.clear_failures();
        driver.remove_partition_mappings("/dev/loop0").unwrap();
    }

    #[test]
    fn tracks_mounts_and_rejects_double_unmount() {
        let driver = DryRunDriver::new();
        let dir = Path::new("/tmp/appliance-root");
        driver.mount("/dev/loop01", dir, Some("ext3")).unwrap();
        assert_eq!(driver.mounted(), vec![dir.to_path_buf()]);
        assert!(driver.mount("/dev/loop01", dir, Some("ext3")).is_err());

        driver.unmount(dir).unwrap();
        assert!(driver.unmount(dir).is_err());
        assert_eq!(
            driver.commands_matching("mount ")[0],
            "mount /dev/loop01 /tmp/appliance-root -t ext3"
        );
    }

    #[test]
    fn resize_oracle_honours_minimal_size() {
        let driver = DryRunDriver::new().with_filesystem(1000, 300 * MIB);
        let target = Path::new("/tmp/disk.raw");
        assert_eq!(driver.filesystem_geometry(target).unwrap(), FilesystemGeometry {
            block_count: 1000,
            block_size: 4096,
        });
        let small_blocks = DryRunDriver::new().with_filesystem(1000, MIB).with_block_size(1024);
        assert_eq!(small_blocks.filesystem_geometry(target).unwrap().bytes(), 1_024_000);
        assert_eq!(
            driver.resize_filesystem(target, 300 * MIB).unwrap(),
            ResizeOutcome::Resized
        );
        assert_eq!(
            driver.resize_filesystem(target, 300 * MIB - 1).unwrap(),
            ResizeOutcome::Refused
        );
    }
}
