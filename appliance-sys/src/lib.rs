// SPDX-License-Identifier: GPL-3.0-only

//! Disk image partitioning and mount orchestration
//!
//! This crate drives the host tooling that turns sparse files into a
//! partitioned, formatted and mounted appliance image tree:
//! - Loop device binding for file-backed disks
//! - MBR layout (primary/extended/logical) and table writes
//! - Device-mapper partition nodes with bootloader compat symlinks
//! - Filesystem format, resize, check and minimal-size shrinking
//! - Ordered mount and best-effort teardown
//!
//! Every host effect goes through [`BlockDeviceDriver`]. [`SystemDriver`]
//! runs the real tools and needs root; [`DryRunDriver`] records commands and
//! simulates their results for planning and tests.

pub mod backing;
pub mod driver;
pub mod dry_run;
pub mod error;
pub mod lock;
pub mod partitioned;
pub mod plan;
pub mod search;
pub mod system;
pub mod teardown;
pub mod volume;

pub use backing::BackingImage;
pub use driver::{BlockDeviceDriver, FilesystemGeometry, FormatRequest, ResizeOutcome};
pub use dry_run::DryRunDriver;
pub use error::{Result, SysError};
pub use lock::HostLock;
pub use partitioned::PartitionedVolumeSet;
pub use plan::{DiskCursor, DiskLayout, Layout, PartitionPlan, PlacedPartition, TableEntry};
pub use search::{MinimalSize, MinimalSizeSearch, find_minimal_size};
pub use system::SystemDriver;
pub use teardown::TeardownReport;
pub use volume::FormattedVolume;
