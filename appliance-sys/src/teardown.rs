// SPDX-License-Identifier: GPL-3.0-only

//! Best-effort teardown bookkeeping
//!
//! Release paths attempt every step regardless of earlier failures. Errors are
//! collected here and logged; they are never returned to the caller as a
//! failure.

use tracing::warn;

use crate::error::{Result, SysError};

#[derive(Debug, Default)]
pub struct TeardownReport {
    errors: Vec<(String, SysError)>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the error from `result`, if any, tagged with `context`
    pub fn note(&mut self, context: impl Into<String>, result: Result<()>) {
        if let Err(error) = result {
            let context = context.into();
            warn!("Teardown step '{}' failed: {}", context, error);
            self.errors.push((context, error));
        }
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[(String, SysError)] {
        &self.errors
    }

    /// Contexts of the failed steps, in the order they were attempted
    pub fn failed_steps(&self) -> Vec<&str> {
        self.errors.iter().map(|(context, _)| context.as_str()).collect()
    }
}
