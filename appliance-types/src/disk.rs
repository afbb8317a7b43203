//! Backing disk models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a disk's storage is provided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskKind {
    /// An existing block device; size is immutable
    FixedRaw,

    /// A regular file bound to a loop device
    Loopback,

    /// A sparse file bound to a loop device, growable and truncatable
    #[default]
    SparseLoopback,
}

impl DiskKind {
    pub fn is_file_backed(&self) -> bool {
        !matches!(self, Self::FixedRaw)
    }
}

/// Per-disk handle exposed to bootloader installation and packaging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    /// Disk identifier (e.g. "sda")
    pub name: String,

    pub kind: DiskKind,

    /// Bound block device (e.g. "/dev/loop0"), present while bound
    pub device: Option<String>,

    /// Backing file for file-backed disks
    pub file: Option<PathBuf>,

    pub size_bytes: u64,
}
