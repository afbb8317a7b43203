// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for image engine operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad partition request or disk reference, detected before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No free loop device, or binding one failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{command} failed ({status}): {stderr}")]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    /// Host state disagrees with what was requested
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Required tool not found in PATH: {0}")]
    ToolNotFound(String),

    #[error("Host lock {0:?} is held by another build")]
    LockHeld(PathBuf),
}

impl SysError {
    pub fn tool(command: impl Into<String>, status: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ExternalTool {
            command: command.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SysError>;
