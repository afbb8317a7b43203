use std::path::PathBuf;

use appliance_sys::SysError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    #[error(transparent)]
    Sys(#[from] SysError),
    #[error("privilege required: run with sudo/root for host storage actions")]
    PrivilegeRequired,
    #[error("spec not found for '{spec_name}' in resources/appliance-specs")]
    SpecNotFound { spec_name: String },
    #[error("invalid spec '{spec_name}': {reason}")]
    SpecInvalid { spec_name: String, reason: String },
    #[error("ledger io error for {path:?}: {reason}")]
    LedgerIo { path: PathBuf, reason: String },
    #[error("hook `{command}` failed: {reason}")]
    HookFailed { command: String, reason: String },
    #[error("io error for {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, LabError>;
