// SPDX-License-Identifier: GPL-3.0-only

//! One ext filesystem on one backing image, mounted at one directory

use std::fs;
use std::path::{Path, PathBuf};

use appliance_types::DiskKind;
use tracing::{debug, info, warn};

use crate::backing::BackingImage;
use crate::driver::{BlockDeviceDriver, FormatRequest, ResizeOutcome};
use crate::error::{Result, SysError};
use crate::search::find_minimal_size;

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
pub const DEFAULT_LABEL: &str = "_appliance";

#[derive(Debug)]
pub struct FormattedVolume {
    image: BackingImage,
    mount_dir: PathBuf,
    fstype: String,
    block_size: u64,
    label: String,
    remove_mount_dir: bool,
    mounted: bool,
    created_dir: bool,
}

impl FormattedVolume {
    pub fn new(image: BackingImage, mount_dir: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            image,
            mount_dir: mount_dir.into(),
            fstype: fstype.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            label: DEFAULT_LABEL.to_string(),
            remove_mount_dir: true,
            mounted: false,
            created_dir: false,
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether `unmount` removes a mount directory that `mount` created
    pub fn removing_mount_dir(mut self, remove: bool) -> Self {
        self.remove_mount_dir = remove;
        self
    }

    pub fn image(&self) -> &BackingImage {
        &self.image
    }

    pub fn into_image(self) -> BackingImage {
        self.image
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn fstype(&self) -> &str {
        &self.fstype
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn bound_device(&self) -> Result<String> {
        self.image.device().map(str::to_string).ok_or_else(|| {
            SysError::InvariantViolation(format!(
                "no device bound for {:?}",
                self.mount_dir
            ))
        })
    }

    fn backing_file(&self) -> Result<PathBuf> {
        self.image.file().map(Path::to_path_buf).ok_or_else(|| {
            SysError::Configuration(format!(
                "volume at {:?} has no backing file",
                self.mount_dir
            ))
        })
    }

    /// Ensure the mount directory, format or grow the filesystem, then mount.
    /// No-op when already mounted.
    pub fn mount(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        if self.mounted {
            return Ok(());
        }

        if !self.mount_dir.is_dir() {
            debug!("Creating mount point {:?}", self.mount_dir);
            fs::create_dir_all(&self.mount_dir)?;
            self.created_dir = self.remove_mount_dir;
        }

        self.prepare(driver)?;

        let device = self.bound_device()?;
        info!("Mounting {} at {:?}", device, self.mount_dir);
        driver.mount(&device, &self.mount_dir, Some(&self.fstype))?;
        self.mounted = true;
        Ok(())
    }

    /// A file that survives from an earlier build is grown in place. Anything
    /// else gets a fresh filesystem.
    fn prepare(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        let previous_len = if !self.image.fixed() && self.image.exists() {
            Some(self.image.file_len()?)
        } else {
            None
        };

        self.image.create(driver)?;

        match previous_len {
            Some(len) => self.grow_filesystem(driver, len),
            None => self.format(driver),
        }
    }

    fn format(&self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        let device = self.bound_device()?;
        info!("Formatting {} filesystem on {}", self.fstype, device);
        driver.make_filesystem(&FormatRequest {
            device: &device,
            fstype: &self.fstype,
            label: &self.label,
            block_size: self.block_size,
        })?;

        debug!("Tuning filesystem on {}", device);
        if let Err(e) = driver.tune_filesystem(&device) {
            warn!("Tuning {} failed: {}", device, e);
        }
        Ok(())
    }

    fn grow_filesystem(&mut self, driver: &dyn BlockDeviceDriver, previous_len: u64) -> Result<()> {
        let target = self.image.size();
        if target == previous_len {
            debug!("Filesystem on {:?} already {} bytes", self.image.file(), target);
            return Ok(());
        }

        if target > self.image.file_len()? && self.image.kind() == DiskKind::SparseLoopback {
            self.image.expand(false, Some(target))?;
        }

        let file = self.backing_file()?;
        driver.check_filesystem(&file)?;

        info!("Resizing filesystem on {:?} to {}", file, target);
        resize_to(driver, &file, target)
    }

    /// Unmount if mounted, then drop the mount directory if `mount` created
    /// it. Directory removal errors are ignored.
    pub fn unmount(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        let result = if self.mounted {
            debug!("Unmounting directory {:?}", self.mount_dir);
            driver.unmount(&self.mount_dir).map(|()| self.mounted = false)
        } else {
            Ok(())
        };

        if self.created_dir && !self.mounted {
            if let Err(e) = fs::remove_dir(&self.mount_dir) {
                debug!("Leaving mount point {:?}: {}", self.mount_dir, e);
            }
            self.created_dir = false;
        }

        result
    }

    /// Unmount, then release the backing image. The release is attempted
    /// even when the unmount fails.
    pub fn cleanup(&mut self, driver: &dyn BlockDeviceDriver) -> Result<()> {
        let unmounted = self.unmount(driver);
        let released = self.image.cleanup(driver);
        unmounted.and(released)
    }

    /// Shrink the filesystem and its backing file to the smallest size that
    /// still holds the content. When `target` is above that minimum, the file
    /// and the filesystem are grown back to `target` so both agree. Fixed
    /// images are left alone and return `None`.
    pub fn resparse(&mut self, driver: &dyn BlockDeviceDriver, target: Option<u64>) -> Result<Option<u64>> {
        if self.image.fixed() {
            return Ok(None);
        }

        self.cleanup(driver)?;
        let minimal = self.resize_to_minimal(driver)?;
        self.image.truncate(Some(minimal))?;

        let size = match target {
            Some(target) if target > minimal => {
                self.regrow(driver, target)?;
                target
            }
            _ => minimal,
        };
        info!("Resparsed {:?} to {} bytes", self.image.file(), size);
        Ok(Some(size))
    }

    fn regrow(&mut self, driver: &dyn BlockDeviceDriver, target: u64) -> Result<()> {
        self.image.expand(false, Some(target))?;
        let file = self.backing_file()?;
        debug!("Growing filesystem on {:?} back to {}", file, target);
        resize_to(driver, &file, target)
    }

    fn resize_to_minimal(&self, driver: &dyn BlockDeviceDriver) -> Result<u64> {
        let file = self.backing_file()?;
        driver.check_filesystem(&file)?;

        let top = driver.filesystem_geometry(&file)?.bytes();
        debug!("Searching minimal size for {:?} below {}", file, top);

        let found = find_minimal_size(top, |size| {
            Ok(driver.resize_filesystem(&file, size)? == ResizeOutcome::Resized)
        })?;
        debug!(
            "Minimal size for {:?} is {} after {} probes",
            file, found.size, found.probes
        );
        Ok(found.size)
    }
}

/// Resize where a refusal means the content cannot fit
fn resize_to(driver: &dyn BlockDeviceDriver, file: &Path, target: u64) -> Result<()> {
    match driver.resize_filesystem(file, target)? {
        ResizeOutcome::Resized => Ok(()),
        ResizeOutcome::Refused => Err(SysError::tool(
            format!("resize2fs {}", file.display()),
            "refused",
            format!("filesystem does not fit in {target} bytes"),
        )),
    }
}
