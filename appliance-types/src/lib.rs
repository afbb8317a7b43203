// SPDX-License-Identifier: GPL-3.0-only

//! Canonical data models for appliance disk image construction
//!
//! These types are shared by every layer of the stack:
//!
//! - **appliance-sys**: consumes [`PartitionRequest`] and produces [`PartitionRecord`]
//! - **appliance-lab**: deserializes requests from TOML specs and persists records
//!
//! Records are the hand-off point to external collaborators (fstab writers,
//! bootloader device maps, packaging), which never see engine internals.

pub mod common;
pub mod disk;
pub mod partition;

pub use common::{MIB, bytes_to_pretty, mb_to_bytes, pretty_to_bytes};
pub use disk::{DiskKind, DiskRecord};
pub use partition::{
    DEFAULT_DISK, DEFAULT_FSTYPE, PartitionKind, PartitionRecord, PartitionRequest,
    SWAP_MOUNTPOINT, fstab_entries,
};
