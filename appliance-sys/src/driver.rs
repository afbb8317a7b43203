// SPDX-License-Identifier: GPL-3.0-only

//! Capability seam for host block and filesystem tooling

use std::path::Path;

use appliance_types::PartitionKind;

use crate::Result;

/// Result of a filesystem resize attempt.
///
/// A refusal (the target is smaller than the filesystem's content) is not an
/// error. Callers decide whether it is fatal. Any other resize failure is an
/// error from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    Resized,
    Refused,
}

/// Size of an existing filesystem as its superblock reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemGeometry {
    pub block_count: u64,
    pub block_size: u64,
}

impl FilesystemGeometry {
    pub fn bytes(&self) -> u64 {
        self.block_count.saturating_mul(self.block_size)
    }
}

/// Parameters for creating a filesystem
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest<'a> {
    pub device: &'a str,
    pub fstype: &'a str,
    pub label: &'a str,
    pub block_size: u64,
}

/// Every external effect the engine has on the host.
///
/// Implementations are synchronous and blocking. Loop devices, the
/// `/dev/mapper` namespace and kernel partition state are global, so callers
/// must not drive two builds through the same host concurrently (see
/// [`crate::HostLock`]).
pub trait BlockDeviceDriver {
    /// Next unused loop device node
    fn find_free_loop(&self) -> Result<String>;

    fn attach_loop(&self, device: &str, file: &Path) -> Result<()>;

    fn detach_loop(&self, device: &str) -> Result<()>;

    /// Write a fresh msdos label to a whole-disk device
    fn write_label(&self, disk: &str) -> Result<()>;

    fn create_partition(
        &self,
        disk: &str,
        kind: PartitionKind,
        start_mb: u64,
        end_mb: u64,
    ) -> Result<()>;

    /// Names of the partition mappings the mapper would create (e.g. "loop0p1")
    fn list_partition_mappings(&self, disk: &str) -> Result<Vec<String>>;

    fn add_partition_mappings(&self, disk: &str) -> Result<()>;

    fn remove_partition_mappings(&self, disk: &str) -> Result<()>;

    fn link_device_node(&self, target: &Path, link: &Path) -> Result<()>;

    fn unlink_device_node(&self, link: &Path) -> Result<()>;

    fn make_filesystem(&self, request: &FormatRequest<'_>) -> Result<()>;

    fn tune_filesystem(&self, device: &str) -> Result<()>;

    /// Forced consistency check with automatic repair
    fn check_filesystem(&self, target: &Path) -> Result<()>;

    fn filesystem_geometry(&self, target: &Path) -> Result<FilesystemGeometry>;

    fn resize_filesystem(&self, target: &Path, size_bytes: u64) -> Result<ResizeOutcome>;

    fn make_swap(&self, device: &str) -> Result<()>;

    fn mount(&self, device: &str, dir: &Path, fstype: Option<&str>) -> Result<()>;

    fn unmount(&self, dir: &Path) -> Result<()>;
}
