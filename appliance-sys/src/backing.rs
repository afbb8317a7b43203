// SPDX-License-Identifier: GPL-3.0-only

//! Backing storage for one disk
//!
//! A backing image is either an existing block device, a plain file bound to
//! a loop device, or a sparse file bound to a loop device. File-backed images
//! keep their file across `cleanup`; only the loop binding is released.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use appliance_types::{DiskKind, DiskRecord};
use tracing::{debug, warn};

use crate::driver::BlockDeviceDriver;
use crate::error::{Result, SysError};

#[derive(Debug, Clone)]
pub struct BackingImage {
    kind: DiskKind,
    size: u64,
    device: Option<String>,
    file: Option<PathBuf>,
}

impl BackingImage {
    /// An existing block device of fixed size
    pub fn raw(size: u64, device: impl Into<String>) -> Self {
        Self {
            kind: DiskKind::FixedRaw,
            size,
            device: Some(device.into()),
            file: None,
        }
    }

    /// A pre-allocated file bound through a loop device
    pub fn loopback(file: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            kind: DiskKind::Loopback,
            size,
            device: None,
            file: Some(file.into()),
        }
    }

    /// A sparse file, grown on `create`, bound through a loop device
    pub fn sparse(file: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            kind: DiskKind::SparseLoopback,
            size,
            device: None,
            file: Some(file.into()),
        }
    }

    pub fn kind(&self) -> DiskKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bound block device, if any
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Whether the size can never change
    pub fn fixed(&self) -> bool {
        self.kind == DiskKind::FixedRaw
    }

    /// Whether backing storage is already present
    pub fn exists(&self) -> bool {
        match &self.file {
            Some(file) => file.exists(),
            None => true,
        }
    }

    pub fn record(&self, name: &str) -> DiskRecord {
        DiskRecord {
            name: name.to_string(),
            kind: self.kind,
            device: self.device.clone(),
            file: self.file.clone(),
            size_bytes: self.size,
        }
    }

    fn require_file(&self) -> Result<&Path> {
        self.file.as_deref().ok_or_else(|| {
            SysError::Configuration(format!(
                "device {} has no backing file",
                self.device.as_deref().unwrap_or("<unbound>")
            ))
        })
    }

    /// Current length of the backing file
    pub fn file_len(&self) -> Result<u64> {
        Ok(fs::metadata(self.require_file()?)?.len())
    }

    /// Allocate storage and bind a device. No-op when already bound.
    pub fn create(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        match self.kind {
            DiskKind::FixedRaw => Ok(()),
            DiskKind::Loopback => self.bind(driver),
            DiskKind::SparseLoopback => {
                if self.device.is_some() {
                    return Ok(());
                }
                self.expand(true, None)?;
                self.bind(driver)
            }
        }
    }

    fn bind(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let file = self.require_file()?.to_path_buf();
        let device = driver.find_free_loop().map_err(|e| match e {
            SysError::ResourceExhausted(_) => e,
            other => SysError::ResourceExhausted(format!(
                "failed to allocate loop device for {file:?}: {other}"
            )),
        })?;

        debug!("Losetup add {} mapping to {:?}", device, file);
        driver.attach_loop(&device, &file).map_err(|e| match e {
            SysError::ResourceExhausted(_) => e,
            other => SysError::ResourceExhausted(format!(
                "failed to bind {device} to {file:?}: {other}"
            )),
        })?;

        self.device = Some(device);
        Ok(())
    }

    /// Release the device binding. No-op when unbound.
    ///
    /// The device is forgotten even when the detach fails, so a later
    /// `create` allocates a fresh one instead of reusing stale state.
    pub fn cleanup(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        if self.fixed() {
            return Ok(());
        }
        let Some(device) = self.device.take() else {
            return Ok(());
        };

        debug!("Losetup remove {}", device);
        driver.detach_loop(&device)
    }

    fn require_sparse(&self, operation: &str) -> Result<&Path> {
        if self.kind != DiskKind::SparseLoopback {
            return Err(SysError::Configuration(format!(
                "cannot {operation} a {:?} disk",
                self.kind
            )));
        }
        self.require_file()
    }

    /// Grow the sparse file to `size` (default: the image size) by writing a
    /// single byte at its last offset. Never shrinks and never overwrites
    /// existing data.
    pub fn expand(&mut self, create: bool, size: Option<u64>) -> Result<()> {
        let file = self.require_sparse("expand")?.to_path_buf();
        let size = size.unwrap_or(self.size);

        if create {
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut handle = OpenOptions::new().write(true).create(create).open(&file)?;
        let current = handle.metadata()?.len();
        if size > current {
            debug!("Extending sparse file {:?} to {}", file, size);
            handle.seek(SeekFrom::Start(size - 1))?;
            handle.write_all(&[0])?;
            handle.sync_all()?;
        }

        if size > self.size {
            self.size = size;
        }
        Ok(())
    }

    /// Cut the sparse file to exactly `size` (default: the image size)
    pub fn truncate(&mut self, size: Option<u64>) -> Result<()> {
        let file = self.require_sparse("truncate")?.to_path_buf();
        let size = size.unwrap_or(self.size);

        debug!("Truncating sparse file {:?} to {}", file, size);
        let handle = OpenOptions::new().write(true).open(&file)?;
        handle.set_len(size)?;
        handle.sync_all()?;
        Ok(())
    }

    /// Move the backing file to its final location. The image must be
    /// unbound. Returns the new path.
    pub fn stage_to(&mut self, dest: &Path) -> Result<PathBuf> {
        if self.device.is_some() {
            return Err(SysError::InvariantViolation(format!(
                "cannot stage {:?} while bound to {}",
                self.file,
                self.device.as_deref().unwrap_or_default()
            )));
        }
        let source = self.require_file()?.to_path_buf();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!("Moving {:?} image to {:?}", source, dest);
        if let Err(e) = fs::rename(&source, dest) {
            warn!("Rename of {:?} failed ({}), copying instead", source, e);
            fs::copy(&source, dest)?;
            fs::remove_file(&source)?;
        }

        self.file = Some(dest.to_path_buf());
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::DryRunDriver;
    use appliance_types::MIB;

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "appliance-sys-backing-{}-{unique}",
                std::process::id()
            ));
            fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn raw_disk_is_fixed_and_bound() {
        let driver = DryRunDriver::new();
        let mut disk = BackingImage::raw(10 * MIB, "/dev/sdb");
        assert!(disk.fixed());
        assert!(disk.exists());

        disk.create(&driver).unwrap();
        disk.cleanup(&driver).unwrap();
        assert_eq!(disk.device(), Some("/dev/sdb"));
        assert!(driver.commands().is_empty());
    }

    #[test]
    fn sparse_create_grows_file_and_binds_once() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new();
        let file = temp.path.join("nested/disk-sda.raw");
        let mut disk = BackingImage::sparse(&file, 64 * MIB);
        assert!(!disk.exists());

        disk.create(&driver).unwrap();
        disk.create(&driver).unwrap();

        assert!(disk.exists());
        assert_eq!(disk.file_len().unwrap(), 64 * MIB);
        assert_eq!(disk.device(), Some("/dev/loop0"));
        assert_eq!(
            driver.commands(),
            vec![
                "losetup -f".to_string(),
                format!("losetup /dev/loop0 {}", file.display()),
            ]
        );
    }

    #[test]
    fn cleanup_releases_binding_and_keeps_file() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new();
        let mut disk = BackingImage::sparse(temp.path.join("disk.raw"), MIB);
        disk.create(&driver).unwrap();

        disk.cleanup(&driver).unwrap();
        disk.cleanup(&driver).unwrap();

        assert_eq!(disk.device(), None);
        assert!(disk.exists());
        assert_eq!(
            driver.commands().last().map(String::as_str),
            Some("losetup -d /dev/loop0")
        );
        assert_eq!(driver.attached_loops(), 0);
    }

    #[test]
    fn failed_detach_still_clears_device() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new();
        let mut disk = BackingImage::sparse(temp.path.join("disk.raw"), MIB);
        disk.create(&driver).unwrap();

        driver.fail_on("losetup -d");
        assert!(disk.cleanup(&driver).is_err());
        assert_eq!(disk.device(), None);
    }

    #[test]
    fn loop_exhaustion_leaves_image_unbound() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new().with_loop_capacity(0);
        let mut disk = BackingImage::sparse(temp.path.join("disk.raw"), MIB);

        let error = disk.create(&driver).unwrap_err();
        assert!(matches!(error, SysError::ResourceExhausted(_)));
        assert_eq!(disk.device(), None);
    }

    #[test]
    fn attach_failure_is_resource_exhaustion() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new();
        driver.fail_on("losetup /dev/loop");
        let mut disk = BackingImage::loopback(temp.path.join("disk.raw"), MIB);

        let error = disk.create(&driver).unwrap_err();
        assert!(matches!(error, SysError::ResourceExhausted(_)));
        assert_eq!(disk.device(), None);
    }

    #[test]
    fn expand_is_grow_only_and_truncate_is_exact() {
        let temp = TempDir::new();
        let file = temp.path.join("disk.raw");
        let mut disk = BackingImage::sparse(&file, 4 * MIB);
        disk.expand(true, None).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&file)
            .and_then(|mut handle| handle.write_all(b"superblock"))
            .unwrap();

        disk.expand(false, Some(2 * MIB)).unwrap();
        assert_eq!(disk.file_len().unwrap(), 4 * MIB);
        assert_eq!(disk.size(), 4 * MIB);

        disk.expand(false, Some(8 * MIB)).unwrap();
        assert_eq!(disk.file_len().unwrap(), 8 * MIB);
        assert_eq!(disk.size(), 8 * MIB);
        assert_eq!(&fs::read(&file).unwrap()[..10], b"superblock");

        disk.truncate(Some(MIB + 4096)).unwrap();
        assert_eq!(disk.file_len().unwrap(), MIB + 4096);
    }

    #[test]
    fn only_sparse_images_expand() {
        let mut disk = BackingImage::loopback("/nonexistent/disk.raw", MIB);
        assert!(matches!(
            disk.expand(false, None),
            Err(SysError::Configuration(_))
        ));
        let mut raw = BackingImage::raw(MIB, "/dev/sdb");
        assert!(raw.truncate(None).is_err());
    }

    #[test]
    fn stage_moves_unbound_file() {
        let temp = TempDir::new();
        let driver = DryRunDriver::new();
        let mut disk = BackingImage::sparse(temp.path.join("work/disk.raw"), MIB);
        disk.create(&driver).unwrap();

        let dest = temp.path.join("out/appliance-sda.raw");
        assert!(disk.stage_to(&dest).is_err());

        disk.cleanup(&driver).unwrap();
        let staged = disk.stage_to(&dest).unwrap();
        assert_eq!(staged, dest);
        assert!(dest.exists());
        assert!(!temp.path.join("work/disk.raw").exists());
        assert_eq!(disk.file(), Some(dest.as_path()));
    }
}
