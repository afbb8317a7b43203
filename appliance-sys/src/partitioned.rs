// SPDX-License-Identifier: GPL-3.0-only

//! Multi-disk, multi-partition image set
//!
//! Owns the backing image of every disk and drives the lifecycle of the
//! partitions laid out across them:
//! - create backing images and write MBR tables
//! - map partitions through the device mapper with compat device nodes
//! - format and mount each partition in mount order
//! - unmount in reverse and tear everything down best-effort

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use appliance_types::{DiskRecord, PartitionRecord, fstab_entries, mb_to_bytes};
use tracing::{debug, info, warn};

use crate::backing::BackingImage;
use crate::driver::BlockDeviceDriver;
use crate::error::{Result, SysError};
use crate::plan::{Layout, PartitionPlan, PlacedPartition};
use crate::teardown::TeardownReport;
use crate::volume::{DEFAULT_BLOCK_SIZE, FormattedVolume};

const MAPPER_DIR: &str = "/dev/mapper";

#[derive(Debug)]
struct DiskSlot {
    image: BackingImage,
    mapped: bool,
}

#[derive(Debug)]
struct PartitionState {
    placed: PlacedPartition,

    /// Compat node linked to the mapper device
    device: Option<String>,

    volume: Option<FormattedVolume>,
    swap_ready: bool,
}

impl PartitionState {
    fn record(&self) -> PartitionRecord {
        PartitionRecord {
            mountpoint: self.placed.mountpoint().to_string(),
            fstype: self.placed.request.effective_fstype().to_string(),
            device: self.device.clone(),
            number: self.placed.number,
            kind: self.placed.kind,
            disk: self.placed.disk.clone(),
            start_mb: self.placed.start_mb,
            size_mb: self.placed.size_mb(),
        }
    }
}

#[derive(Debug)]
pub struct PartitionedVolumeSet {
    disks: BTreeMap<String, DiskSlot>,
    mount_dir: PathBuf,
    plan: PartitionPlan,
    layout: Option<Layout>,
    partitions: Vec<PartitionState>,

    /// Indexes into `partitions`, ascending by mountpoint
    mount_order: Vec<usize>,
}

impl PartitionedVolumeSet {
    pub fn new(disks: BTreeMap<String, BackingImage>, mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            disks: disks
                .into_iter()
                .map(|(name, image)| {
                    (
                        name,
                        DiskSlot {
                            image,
                            mapped: false,
                        },
                    )
                })
                .collect(),
            mount_dir: mount_dir.into(),
            plan: PartitionPlan::new(),
            layout: None,
            partitions: Vec::new(),
            mount_order: Vec::new(),
        }
    }

    /// Queue a partition. Rejected once the table has been written.
    pub fn add_partition(
        &mut self,
        size_mb: u64,
        disk: Option<&str>,
        mountpoint: &str,
        fstype: Option<&str>,
    ) -> Result<()> {
        if self.layout.is_some() {
            return Err(SysError::Configuration(format!(
                "cannot add {mountpoint} after the partition table was written"
            )));
        }
        self.plan.add_partition(size_mb, disk, mountpoint, fstype)
    }

    /// Image root; partitions are mounted beneath it
    pub fn root(&self) -> &Path {
        &self.mount_dir
    }

    /// Bring every partition up. Safe to call again after a failure; steps
    /// already done are skipped.
    pub fn mount(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        if self.layout.is_none() {
            self.prepare(driver)?;
        }

        let names: Vec<String> = self.disks.keys().cloned().collect();
        for name in &names {
            self.map_disk(driver, name)?;
        }

        for position in 0..self.mount_order.len() {
            let index = self.mount_order[position];
            self.mount_partition(driver, index)?;
        }

        info!(
            "Mounted {} partitions under {:?}",
            self.partitions.len(),
            self.mount_dir
        );
        Ok(())
    }

    fn prepare(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        let layout = self.plan.layout(self.disks.keys())?;

        for (name, slot) in &mut self.disks {
            debug!("Creating backing image for {}", name);
            slot.image.create(driver)?;
        }

        self.write_table(driver, &layout)?;

        self.partitions = layout
            .partitions
            .iter()
            .cloned()
            .map(|placed| PartitionState {
                placed,
                device: None,
                volume: None,
                swap_ready: false,
            })
            .collect();

        let mut order: Vec<usize> = (0..self.partitions.len()).collect();
        order.sort_by(|&a, &b| {
            self.partitions[a]
                .placed
                .mountpoint()
                .cmp(self.partitions[b].placed.mountpoint())
        });
        self.mount_order = order;
        self.layout = Some(layout);
        Ok(())
    }

    fn disk_device(&self, name: &str) -> Result<String> {
        self.disks
            .get(name)
            .and_then(|slot| slot.image.device())
            .map(str::to_string)
            .ok_or_else(|| SysError::InvariantViolation(format!("disk {name} has no device")))
    }

    fn write_table(&self, driver: &dyn BlockDeviceDriver, layout: &Layout) -> Result<()> {
        for name in self.disks.keys() {
            let device = self.disk_device(name)?;
            debug!("Initializing partition table for {}", device);
            driver.write_label(&device)?;
        }

        for entry in layout.table_entries() {
            let device = self.disk_device(&entry.disk)?;
            debug!(
                "Adding {} partition to {} from {}M to {}M",
                entry.kind, device, entry.start_mb, entry.end_mb
            );
            // parted reports a failed kernel reload on loop devices even
            // though the table was written
            if let Err(e) = driver.create_partition(&device, entry.kind, entry.start_mb, entry.end_mb)
            {
                warn!("mkpart on {} reported: {}", device, e);
            }
        }
        Ok(())
    }

    fn map_disk(&mut self, driver: &dyn BlockDeviceDriver, name: &str) -> Result<()> {
        if self.disks.get(name).is_some_and(|slot| slot.mapped) {
            return Ok(());
        }

        let device = self.disk_device(name)?;
        let indexes = self
            .layout
            .as_ref()
            .and_then(|layout| layout.disk(name))
            .map(|disk| disk.partitions.clone())
            .unwrap_or_default();

        debug!("Mapping partitions on {}", device);
        let mappings = driver.list_partition_mappings(&device)?;
        if mappings.len() != indexes.len() {
            return Err(SysError::InvariantViolation(format!(
                "unexpected number of partitions on {device}: mapper lists {}, layout has {}",
                mappings.len(),
                indexes.len()
            )));
        }

        for (&index, mapping) in indexes.iter().zip(&mappings) {
            let node = compat_node(&device, mapping)?;
            let target = Path::new(MAPPER_DIR).join(mapping);
            debug!("Dev {}: {} -> {:?}", mapping, node, target);

            driver.link_device_node(&target, Path::new(&node))?;
            self.partitions[index].device = Some(node);
        }

        driver.add_partition_mappings(&device)?;
        if let Some(slot) = self.disks.get_mut(name) {
            slot.mapped = true;
        }
        Ok(())
    }

    fn mount_partition(&mut self, driver: &dyn BlockDeviceDriver, index: usize) -> Result<()> {
        let root = self.mount_dir.clone();
        let state = &mut self.partitions[index];
        let node = state.device.clone().ok_or_else(|| {
            SysError::InvariantViolation(format!(
                "partition {} has no device node",
                state.placed.mountpoint()
            ))
        })?;

        if state.placed.is_swap() {
            if !state.swap_ready {
                info!("Initializing swap on {}", node);
                driver.make_swap(&node)?;
                state.swap_ready = true;
            }
            return Ok(());
        }

        let mountpoint = state.placed.mountpoint().to_string();
        let volume = state.volume.get_or_insert_with(|| {
            FormattedVolume::new(
                BackingImage::raw(mb_to_bytes(state.placed.size_mb()), node),
                mount_path(&root, &mountpoint),
                state.placed.request.effective_fstype(),
            )
            .with_block_size(DEFAULT_BLOCK_SIZE)
            .with_label(mountpoint.as_str())
            .removing_mount_dir(mountpoint == "/")
        });
        volume.mount(driver)
    }

    /// Unmount every volume in reverse mount order. Failures are collected,
    /// never raised.
    pub fn unmount(&mut self, driver: &dyn BlockDeviceDriver) -> TeardownReport {
        let mut report = TeardownReport::new();
        for &index in self.mount_order.iter().rev() {
            let state = &mut self.partitions[index];
            if state.placed.is_swap() {
                continue;
            }
            if let Some(volume) = state.volume.as_mut() {
                report.note(
                    format!("umount {}", state.placed.mountpoint()),
                    volume.unmount(driver),
                );
            }
        }
        report
    }

    /// Unmount, unmap and release every disk. Always runs to the end.
    pub fn cleanup(&mut self, driver: &dyn BlockDeviceDriver) -> TeardownReport {
        let mut report = self.unmount(driver);

        for state in &mut self.partitions {
            if let Some(node) = state.device.take() {
                report.note(
                    format!("unlink {node}"),
                    driver.unlink_device_node(Path::new(&node)),
                );
            }
            state.swap_ready = false;
        }

        for (name, slot) in &mut self.disks {
            if slot.mapped {
                if let Some(device) = slot.image.device() {
                    report.note(
                        format!("kpartx -d {device}"),
                        driver.remove_partition_mappings(device),
                    );
                }
                slot.mapped = false;
            }
            report.note(format!("release {name}"), slot.image.cleanup(driver));
        }

        for state in &mut self.partitions {
            if state.volume.as_ref().is_some_and(|volume| !volume.is_mounted()) {
                state.volume = None;
            }
        }
        // A later mount starts over unless something is still mounted
        if self.partitions.iter().all(|state| state.volume.is_none()) {
            self.layout = None;
        }

        if !report.is_clean() {
            warn!(
                "Cleanup of {:?} finished with {} suppressed errors",
                self.mount_dir,
                report.errors().len()
            );
        }
        report
    }

    /// Whole partitioned disks are never shrunk; minimize single volumes
    /// with [`FormattedVolume::resparse`] instead.
    pub fn resparse(&mut self) -> Option<u64> {
        None
    }

    /// Partition records ordered by mountpoint
    pub fn records(&self) -> Vec<PartitionRecord> {
        let states: Vec<&PartitionState> = if self.mount_order.is_empty() {
            self.partitions.iter().collect()
        } else {
            self.mount_order.iter().map(|&i| &self.partitions[i]).collect()
        };
        states.into_iter().map(PartitionState::record).collect()
    }

    /// Mountable paths in mount order
    pub fn mount_order(&self) -> Vec<String> {
        self.mount_order
            .iter()
            .map(|&i| &self.partitions[i])
            .filter(|state| !state.placed.is_swap())
            .map(|state| state.placed.mountpoint().to_string())
            .collect()
    }

    /// Mountable paths in unmount order, the exact reverse of mount order
    pub fn unmount_order(&self) -> Vec<String> {
        let mut order = self.mount_order();
        order.reverse();
        order
    }

    /// (disk identifier, bound device) for every bound disk
    pub fn disk_devices(&self) -> Vec<(String, String)> {
        self.disks
            .iter()
            .filter_map(|(name, slot)| {
                slot.image
                    .device()
                    .map(|device| (name.clone(), device.to_string()))
            })
            .collect()
    }

    pub fn disk_records(&self) -> Vec<DiskRecord> {
        self.disks
            .iter()
            .map(|(name, slot)| slot.image.record(name))
            .collect()
    }

    /// Device of the first disk by identifier, where bootloaders install
    pub fn first_disk_device(&self) -> Option<String> {
        self.disks
            .values()
            .next()
            .and_then(|slot| slot.image.device())
            .map(str::to_string)
    }

    pub fn fstab(&self) -> String {
        fstab_entries(&self.records())
    }

    /// Hand back the backing images, e.g. for staging after cleanup
    pub fn into_disks(self) -> BTreeMap<String, BackingImage> {
        self.disks
            .into_iter()
            .map(|(name, slot)| (name, slot.image))
            .collect()
    }
}

/// Node bootloaders expect for a partition: the whole-disk device followed
/// by the partition number (`/dev/loop0` + `loop0p2` gives `/dev/loop02`)
fn compat_node(disk_device: &str, mapping: &str) -> Result<String> {
    let digits = mapping.len()
        - mapping
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .len();
    if digits == 0 {
        return Err(SysError::InvariantViolation(format!(
            "mapping {mapping} carries no partition number"
        )));
    }
    Ok(format!("{disk_device}{}", &mapping[mapping.len() - digits..]))
}

/// Directory a mountpoint is mounted at beneath `root`
pub fn mount_path(root: &Path, mountpoint: &str) -> PathBuf {
    match mountpoint.trim_start_matches('/') {
        "" => root.to_path_buf(),
        relative => root.join(relative),
    }
}
