use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};
use crate::spec::workspace_root;

/// Host resources held by an in-progress build. Written once everything is
/// mounted and removed after cleanup, so a leftover file means a build died
/// holding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildState {
    pub spec_name: String,
    pub image_paths: Vec<String>,
    /// Whole-disk loop devices, in disk order
    pub loop_devices: Vec<String>,
    /// Compat partition nodes linked into `/dev/mapper`
    pub device_nodes: Vec<String>,
    /// Mounted directories in unmount order
    pub mount_points: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl BuildState {
    pub fn new(spec_name: &str) -> Self {
        Self {
            spec_name: spec_name.to_string(),
            image_paths: Vec::new(),
            loop_devices: Vec::new(),
            device_nodes: Vec::new(),
            mount_points: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

pub fn base_dir() -> PathBuf {
    workspace_root().join("target/appliance-lab/state")
}

pub fn state_path(spec_name: &str) -> PathBuf {
    base_dir().join(format!("{spec_name}.json"))
}

fn ledger_io<E: ToString>(path: &Path) -> impl FnOnce(E) -> LabError + '_ {
    move |error| LabError::LedgerIo {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

pub fn exists(spec_name: &str) -> bool {
    state_path(spec_name).exists()
}

pub fn load(spec_name: &str) -> Result<BuildState> {
    let path = state_path(spec_name);
    let raw = fs::read_to_string(&path).map_err(ledger_io(&path))?;
    serde_json::from_str(&raw).map_err(ledger_io(&path))
}

/// Write `state` to its ledger file
pub fn save(state: &BuildState) -> Result<PathBuf> {
    let dir = base_dir();
    fs::create_dir_all(&dir).map_err(ledger_io(&dir))?;

    let path = state_path(&state.spec_name);
    let content = serde_json::to_string_pretty(state).map_err(ledger_io(&path))?;
    fs::write(&path, content).map_err(ledger_io(&path))?;
    Ok(path)
}

/// Drop the entry for `spec_name`; a missing entry is not an error
pub fn remove(spec_name: &str) -> Result<()> {
    let path = state_path(spec_name);
    match fs::remove_file(&path) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(ledger_io(&path)(error)),
        _ => Ok(()),
    }
}

/// Spec names with a leftover ledger entry, sorted
pub fn stale_specs() -> Result<Vec<String>> {
    let dir = base_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(ledger_io(&dir)(error)),
    };

    let mut names = entries
        .map(|entry| entry.map(|entry| entry.path()).map_err(ledger_io(&dir)))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string))
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}
