//! Partition requests and the records handed to external collaborators

use serde::{Deserialize, Serialize};

/// Disk identifier assumed when a request does not name one
pub const DEFAULT_DISK: &str = "sda";

/// Filesystem type used when a mountable request does not declare one
pub const DEFAULT_FSTYPE: &str = "ext3";

/// Mountpoint marker for swap partitions
pub const SWAP_MOUNTPOINT: &str = "swap";

/// MBR partition entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Primary,
    Extended,
    Logical,
}

impl PartitionKind {
    /// Name used by `parted mkpart`
    pub fn as_parted_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Extended => "extended",
            Self::Logical => "logical",
        }
    }
}

impl std::fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_parted_str())
    }
}

/// A requested partition, before layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// Size in mebibytes
    pub size_mb: u64,

    /// Disk identifier (e.g. "sda"); [`DEFAULT_DISK`] when absent
    #[serde(default)]
    pub disk: Option<String>,

    /// Mountpoint relative to the image root, or [`SWAP_MOUNTPOINT`]
    pub mountpoint: String,

    /// Filesystem type (e.g. "ext3", "swap")
    #[serde(default)]
    pub fstype: Option<String>,
}

impl PartitionRequest {
    pub fn new(size_mb: u64, disk: Option<&str>, mountpoint: &str, fstype: Option<&str>) -> Self {
        Self {
            size_mb,
            disk: disk.map(str::to_string),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.map(str::to_string),
        }
    }

    /// Disk identifier, falling back to [`DEFAULT_DISK`]
    pub fn disk_or_default(&self) -> &str {
        self.disk.as_deref().unwrap_or(DEFAULT_DISK)
    }

    pub fn is_swap(&self) -> bool {
        self.mountpoint == SWAP_MOUNTPOINT
    }

    /// Filesystem type this partition is formatted with
    pub fn effective_fstype(&self) -> &str {
        if self.is_swap() {
            return SWAP_MOUNTPOINT;
        }
        self.fstype.as_deref().unwrap_or(DEFAULT_FSTYPE)
    }
}

/// Laid-out partition as exposed to fstab and bootloader tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub mountpoint: String,
    pub fstype: String,

    /// Compat device node (e.g. "/dev/loop01"), present while mapped
    pub device: Option<String>,

    /// Partition number within its disk (1-based, logical from 6)
    pub number: u32,

    pub kind: PartitionKind,

    /// Owning disk identifier
    pub disk: String,

    pub start_mb: u64,
    pub size_mb: u64,
}

impl PartitionRecord {
    /// Guest-side device name (e.g. "/dev/sda2")
    pub fn guest_device(&self) -> String {
        format!("/dev/{}{}", self.disk, self.number)
    }

    /// One fstab line for this partition
    pub fn fstab_line(&self) -> String {
        format!(
            "{}  {} {}    defaults,noatime 0 0",
            self.guest_device(),
            self.mountpoint,
            self.fstype
        )
    }
}

/// Render fstab content for the given records, followed by the pseudo
/// filesystems every appliance mounts.
pub fn fstab_entries(records: &[PartitionRecord]) -> String {
    let mut fstab = String::new();
    for record in records {
        fstab.push_str(&record.fstab_line());
        fstab.push('\n');
    }

    fstab.push_str("devpts     /dev/pts  devpts  gid=5,mode=620   0 0\n");
    fstab.push_str("tmpfs      /dev/shm  tmpfs   defaults         0 0\n");
    fstab.push_str("proc       /proc     proc    defaults         0 0\n");
    fstab.push_str("sysfs      /sys      sysfs   defaults         0 0\n");
    fstab
}
