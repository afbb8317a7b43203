// SPDX-License-Identifier: GPL-3.0-only

//! Host-wide exclusion for builds
//!
//! Loop devices and `/dev/mapper` names are global to the host, so only one
//! build may drive them at a time. The lock is an advisory `flock` on a file
//! and is released when the guard drops or the process exits.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SysError};

pub const DEFAULT_LOCK_PATH: &str = "/run/appliance-lab.lock";

#[derive(Debug)]
pub struct HostLock {
    file: File,
    path: PathBuf,
}

impl HostLock {
    /// Take the lock without waiting. Fails with [`SysError::LockHeld`] when
    /// another holder exists.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(SysError::LockHeld(path.to_path_buf()));
            }
            return Err(err.into());
        }

        debug!("Acquired host lock {:?}", path);
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!("Released host lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let path = std::env::temp_dir().join(format!(
            "appliance-sys-lock-{}/build.lock",
            std::process::id()
        ));

        let first = HostLock::acquire(&path).unwrap();
        let err = HostLock::acquire(&path).unwrap_err();
        assert!(matches!(err, SysError::LockHeld(ref held) if *held == path));

        drop(first);
        let again = HostLock::acquire(&path).unwrap();
        assert_eq!(again.path(), path.as_path());

        drop(again);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
