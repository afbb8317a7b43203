// SPDX-License-Identifier: GPL-3.0-only

//! MBR partition layout
//!
//! Layout is a pure function of the ordered request list. Requests are grouped
//! by disk in the order they were added. On each disk the first
//! [`MAX_PRIMARY`] requests become primary partitions numbered 1..=3. Later
//! requests become logical partitions numbered from 6, inside an extended
//! partition that takes number [`EXTENDED_NUMBER`] and spans every logical
//! partition on the disk. Offsets are in MiB and accumulate in request order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use appliance_types::{MIB, PartitionKind, PartitionRequest, SWAP_MOUNTPOINT, mb_to_bytes};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SysError};

/// Primary partitions per disk before logical placement starts
pub const MAX_PRIMARY: u32 = 3;

/// Partition number reserved for the extended container
pub const EXTENDED_NUMBER: u32 = 5;

/// Per-disk layout accumulator, threaded through planning by value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskCursor {
    /// Partitions placed so far (extended container excluded)
    pub count: u32,

    /// Offset of the next partition in MiB
    pub next_offset_mb: u64,

    /// Start of the extended container, once a logical partition exists
    pub extended_start_mb: Option<u64>,

    /// Sum of logical partition sizes in MiB
    pub extended_size_mb: u64,
}

/// Number, kind and start assigned to one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub number: u32,
    pub kind: PartitionKind,
    pub start_mb: u64,
}

impl DiskCursor {
    /// Place a partition of `size_mb`, returning its placement and the cursor
    /// for the next one.
    pub fn place(self, size_mb: u64) -> (Placement, DiskCursor) {
        let count = self.count + 1;
        let start_mb = self.next_offset_mb;
        let mut next = DiskCursor {
            count,
            next_offset_mb: start_mb + size_mb,
            ..self
        };

        let placement = if count > MAX_PRIMARY {
            next.extended_start_mb = Some(self.extended_start_mb.unwrap_or(start_mb));
            next.extended_size_mb = self.extended_size_mb + size_mb;
            Placement {
                number: count + 2,
                kind: PartitionKind::Logical,
                start_mb,
            }
        } else {
            Placement {
                number: count,
                kind: PartitionKind::Primary,
                start_mb,
            }
        };

        (placement, next)
    }

    /// The extended container implied by the logical partitions placed so far
    pub fn extended(&self) -> Option<ExtendedPartition> {
        self.extended_start_mb.map(|start_mb| ExtendedPartition {
            number: EXTENDED_NUMBER,
            start_mb,
            size_mb: self.extended_size_mb,
        })
    }
}

/// Synthesized extended container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtendedPartition {
    pub number: u32,
    pub start_mb: u64,
    pub size_mb: u64,
}

/// A request with its layout assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedPartition {
    pub request: PartitionRequest,

    /// Resolved disk identifier
    pub disk: String,

    pub number: u32,
    pub kind: PartitionKind,
    pub start_mb: u64,
}

impl PlacedPartition {
    pub fn size_mb(&self) -> u64 {
        self.request.size_mb
    }

    pub fn end_mb(&self) -> u64 {
        self.start_mb + self.request.size_mb
    }

    pub fn mountpoint(&self) -> &str {
        &self.request.mountpoint
    }

    pub fn is_swap(&self) -> bool {
        self.request.is_swap()
    }
}

/// Layout of one disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskLayout {
    pub disk: String,

    /// Indexes into [`Layout::partitions`], in request order
    pub partitions: Vec<usize>,

    pub cursor: DiskCursor,
}

impl DiskLayout {
    pub fn extended(&self) -> Option<ExtendedPartition> {
        self.cursor.extended()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

/// One `mkpart` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub disk: String,
    pub kind: PartitionKind,
    pub start_mb: u64,
    pub end_mb: u64,
}

/// Complete layout across all disks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    /// All partitions in request order
    pub partitions: Vec<PlacedPartition>,

    /// Per-disk layouts, including disks that hold no partition
    pub disks: BTreeMap<String, DiskLayout>,
}

impl Layout {
    /// Partition table mutations in the order they must be issued. The
    /// extended container is emitted right before the first logical
    /// partition of its disk.
    pub fn table_entries(&self) -> Vec<TableEntry> {
        let mut extended_written = BTreeSet::new();
        let mut entries = Vec::with_capacity(self.partitions.len() + self.disks.len());

        for partition in &self.partitions {
            if partition.kind == PartitionKind::Logical
                && extended_written.insert(partition.disk.clone())
            {
                if let Some(extended) = self.disks.get(&partition.disk).and_then(DiskLayout::extended)
                {
                    entries.push(TableEntry {
                        disk: partition.disk.clone(),
                        kind: PartitionKind::Extended,
                        start_mb: extended.start_mb,
                        end_mb: extended.start_mb + extended.size_mb,
                    });
                }
            }

            entries.push(TableEntry {
                disk: partition.disk.clone(),
                kind: partition.kind,
                start_mb: partition.start_mb,
                end_mb: partition.end_mb(),
            });
        }

        entries
    }

    pub fn disk(&self, name: &str) -> Option<&DiskLayout> {
        self.disks.get(name)
    }
}

/// Accumulates partition requests. No I/O happens until a layout is consumed.
#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    requests: Vec<PartitionRequest>,
}

impl PartitionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a partition request.
    ///
    /// Malformed requests are rejected here: a zero size, a mountpoint that
    /// is neither `swap` nor a normalized absolute path, a `swap` fstype on a
    /// mountable path, or a mountpoint requested twice.
    pub fn add_partition(
        &mut self,
        size_mb: u64,
        disk: Option<&str>,
        mountpoint: &str,
        fstype: Option<&str>,
    ) -> Result<()> {
        self.add_request(PartitionRequest::new(size_mb, disk, mountpoint, fstype))
    }

    pub fn add_request(&mut self, request: PartitionRequest) -> Result<()> {
        validate_request(&request)?;

        if !request.is_swap()
            && self
                .requests
                .iter()
                .any(|existing| existing.mountpoint == request.mountpoint)
        {
            return Err(SysError::Configuration(format!(
                "mountpoint {} requested more than once",
                request.mountpoint
            )));
        }

        self.requests.push(request);
        Ok(())
    }

    pub fn requests(&self) -> &[PartitionRequest] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Bytes each disk needs to hold its partitions plus one MiB for the
    /// label area
    pub fn required_disk_sizes(&self) -> BTreeMap<String, u64> {
        let mut sizes = BTreeMap::new();
        for request in &self.requests {
            *sizes
                .entry(request.disk_or_default().to_string())
                .or_insert(MIB) += mb_to_bytes(request.size_mb);
        }
        sizes
    }

    /// Assign numbers, kinds and offsets. `known_disks` lists every disk the
    /// caller can provide; a request naming any other disk fails.
    pub fn layout<I, S>(&self, known_disks: I) -> Result<Layout>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut disks: BTreeMap<String, DiskLayout> = known_disks
            .into_iter()
            .map(|name| {
                let name = name.as_ref().to_string();
                (
                    name.clone(),
                    DiskLayout {
                        disk: name,
                        partitions: Vec::new(),
                        cursor: DiskCursor::default(),
                    },
                )
            })
            .collect();

        let mut partitions = Vec::with_capacity(self.requests.len());
        for (index, request) in self.requests.iter().enumerate() {
            let disk_name = request.disk_or_default();
            let disk = disks.get_mut(disk_name).ok_or_else(|| {
                SysError::Configuration(format!(
                    "no disk {} for partition {}",
                    disk_name, request.mountpoint
                ))
            })?;

            let (placement, next) = disk.cursor.place(request.size_mb);
            disk.cursor = next;
            disk.partitions.push(index);

            debug!(
                "Assigned {} to {}{} ({}) at {}M size {}M",
                request.mountpoint,
                disk_name,
                placement.number,
                placement.kind,
                placement.start_mb,
                request.size_mb
            );

            partitions.push(PlacedPartition {
                request: request.clone(),
                disk: disk_name.to_string(),
                number: placement.number,
                kind: placement.kind,
                start_mb: placement.start_mb,
            });
        }

        Ok(Layout { partitions, disks })
    }
}

fn validate_request(request: &PartitionRequest) -> Result<()> {
    if request.size_mb == 0 {
        return Err(SysError::Configuration(format!(
            "partition {} has zero size",
            request.mountpoint
        )));
    }

    if let Some(disk) = request.disk.as_deref() {
        if disk.is_empty() || disk.contains('/') {
            return Err(SysError::Configuration(format!(
                "invalid disk identifier '{}' for partition {}",
                disk, request.mountpoint
            )));
        }
    }

    if request.is_swap() {
        return Ok(());
    }

    if request.fstype.as_deref() == Some(SWAP_MOUNTPOINT) {
        return Err(SysError::Configuration(format!(
            "swap partition must use mountpoint '{}', got {}",
            SWAP_MOUNTPOINT, request.mountpoint
        )));
    }

    if !is_normalized_mountpoint(&request.mountpoint) {
        return Err(SysError::Configuration(format!(
            "mountpoint '{}' must be a normalized absolute path",
            request.mountpoint
        )));
    }

    Ok(())
}

/// Absolute, no trailing slash (except root), no empty, `.` or `..`
/// components. For such paths an ancestor is a byte prefix of each of its
/// descendants, so lexicographic ordering mounts parents first.
fn is_normalized_mountpoint(mountpoint: &str) -> bool {
    if mountpoint == "/" {
        return true;
    }
    if !mountpoint.starts_with('/') || mountpoint.ends_with('/') || mountpoint.contains("//") {
        return false;
    }

    Path::new(mountpoint)
        .components()
        .all(|component| matches!(component, Component::RootDir | Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers(layout: &Layout) -> Vec<u32> {
        layout.partitions.iter().map(|p| p.number).collect()
    }

    #[test]
    fn three_partition_scenario_follows_request_order() {
        let mut plan = PartitionPlan::new();
        plan.add_partition(500, Some("sda"), "/", Some("ext3")).unwrap();
        plan.add_partition(200, Some("sda"), "/boot", Some("ext3")).unwrap();
        plan.add_partition(1000, Some("sda"), "swap", None).unwrap();

        let layout = plan.layout(["sda"]).unwrap();
        let summary: Vec<(&str, u32, PartitionKind, u64)> = layout
            .partitions
            .iter()
            .map(|p| (p.mountpoint(), p.number, p.kind, p.start_mb))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("/", 1, PartitionKind::Primary, 0),
                ("/boot", 2, PartitionKind::Primary, 500),
                ("swap", 3, PartitionKind::Primary, 700),
            ]
        );
        assert!(layout.disk("sda").unwrap().extended().is_none());
    }

    #[test]
    fn boot_first_request_order_places_boot_at_zero() {
        let mut plan = PartitionPlan::new();
        plan.add_partition(200, Some("sda"), "/boot", Some("ext3")).unwrap();
        plan.add_partition(500, Some("sda"), "/", Some("ext3")).unwrap();
        plan.add_partition(1000, Some("sda"), "swap", None).unwrap();

        let layout = plan.layout(["sda"]).unwrap();
        let summary: Vec<(&str, u32, u64)> = layout
            .partitions
            .iter()
            .map(|p| (p.mountpoint(), p.number, p.start_mb))
            .collect();
        assert_eq!(
            summary,
            vec![("/boot", 1, 0), ("/", 2, 200), ("swap", 3, 700)]
        );
    }

    #[test]
    fn five_partitions_use_extended_container() {
        let mut plan = PartitionPlan::new();
        for (mountpoint, size) in [("/", 100), ("/boot", 50), ("/var", 70), ("/home", 30), ("/srv", 20)] {
            plan.add_partition(size, None, mountpoint, None).unwrap();
        }

        let layout = plan.layout(["sda"]).unwrap();
        assert_eq!(numbers(&layout), vec![1, 2, 3, 6, 7]);
        assert_eq!(layout.partitions[3].kind, PartitionKind::Logical);
        assert_eq!(layout.partitions[4].kind, PartitionKind::Logical);

        let extended = layout.disk("sda").unwrap().extended().unwrap();
        assert_eq!(extended.number, EXTENDED_NUMBER);
        assert_eq!(extended.start_mb, 220);
        assert_eq!(extended.size_mb, 50);

        let entries = layout.table_entries();
        let kinds: Vec<PartitionKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PartitionKind::Primary,
                PartitionKind::Primary,
                PartitionKind::Primary,
                PartitionKind::Extended,
                PartitionKind::Logical,
                PartitionKind::Logical,
            ]
        );
        assert_eq!((entries[3].start_mb, entries[3].end_mb), (220, 270));
        assert_eq!((entries[5].start_mb, entries[5].end_mb), (250, 270));
    }

    #[test]
    fn numbering_is_contiguous_per_disk_for_any_mix() {
        let mut plan = PartitionPlan::new();
        let mut expected: BTreeMap<&str, u64> = BTreeMap::new();
        for index in 0..13u64 {
            let disk = if index % 3 == 0 { "sdb" } else { "sda" };
            let size = 10 + index * 7;
            *expected.entry(disk).or_default() += size;
            plan.add_partition(size, Some(disk), &format!("/p{index}"), None)
                .unwrap();
        }

        let layout = plan.layout(["sda", "sdb"]).unwrap();
        for disk in layout.disks.values() {
            let placed: Vec<&PlacedPartition> =
                disk.partitions.iter().map(|&i| &layout.partitions[i]).collect();

            for (position, partition) in placed.iter().enumerate() {
                let position = position as u32 + 1;
                if position <= MAX_PRIMARY {
                    assert_eq!(partition.number, position);
                    assert_eq!(partition.kind, PartitionKind::Primary);
                } else {
                    assert_eq!(partition.number, position + 2);
                    assert_eq!(partition.kind, PartitionKind::Logical);
                }
            }

            let logical_sum: u64 = placed
                .iter()
                .filter(|p| p.kind == PartitionKind::Logical)
                .map(|p| p.size_mb())
                .sum();
            if let Some(extended) = disk.extended() {
                assert_eq!(extended.size_mb, logical_sum);
            } else {
                assert_eq!(logical_sum, 0);
            }

            let mut offset = 0;
            for partition in &placed {
                assert_eq!(partition.start_mb, offset);
                offset += partition.size_mb();
            }
            assert_eq!(disk.cursor.next_offset_mb, expected[disk.disk.as_str()]);
        }
    }

    #[test]
    fn unknown_disk_is_a_configuration_error() {
        let mut plan = PartitionPlan::new();
        plan.add_partition(100, Some("sdz"), "/", None).unwrap();

        let error = plan.layout(["sda"]).unwrap_err();
        assert!(matches!(error, SysError::Configuration(ref msg) if msg.contains("sdz")));
    }

    #[test]
    fn empty_disks_still_get_a_layout() {
        let mut plan = PartitionPlan::new();
        plan.add_partition(100, None, "/", None).unwrap();

        let layout = plan.layout(["sda", "sdb"]).unwrap();
        assert_eq!(layout.disk("sdb").unwrap().partition_count(), 0);
        assert_eq!(layout.table_entries().len(), 1);
    }

    #[test]
    fn rejects_malformed_requests() {
        let mut plan = PartitionPlan::new();
        assert!(plan.add_partition(0, None, "/", None).is_err());
        assert!(plan.add_partition(10, None, "boot", None).is_err());
        assert!(plan.add_partition(10, None, "/boot/", None).is_err());
        assert!(plan.add_partition(10, None, "/var/../etc", None).is_err());
        assert!(plan.add_partition(10, None, "/var//lib", None).is_err());
        assert!(plan.add_partition(10, None, "/data", Some("swap")).is_err());
        assert!(plan.add_partition(10, Some(""), "/", None).is_err());
        assert!(plan.is_empty());

        plan.add_partition(10, None, "/", None).unwrap();
        assert!(plan.add_partition(10, None, "/", None).is_err());
        plan.add_partition(10, None, "swap", None).unwrap();
        plan.add_partition(10, None, "swap", None).unwrap();
        assert_eq!(plan.requests().len(), 3);
    }

    #[test]
    fn sums_required_disk_sizes() {
        let mut plan = PartitionPlan::new();
        plan.add_partition(500, None, "/", None).unwrap();
        plan.add_partition(200, Some("sda"), "/boot", None).unwrap();
        plan.add_partition(64, Some("sdb"), "swap", None).unwrap();

        let sizes = plan.required_disk_sizes();
        assert_eq!(sizes["sda"], 701 * MIB);
        assert_eq!(sizes["sdb"], 65 * MIB);
    }
}
