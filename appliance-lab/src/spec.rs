use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use appliance_sys::PartitionPlan;
use appliance_types::{DiskKind, MIB, PartitionRequest, mb_to_bytes};
use serde::{Deserialize, Serialize};

use crate::errors::{LabError, Result};

/// One appliance build, as read from `resources/appliance-specs/<name>.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceSpec {
    pub name: String,
    /// Where working disk images live, relative to the workspace root
    pub artifacts_root: Option<String>,
    /// Where partitions get mounted; defaults to `<artifacts_root>/install_root`
    pub mount_root: Option<String>,
    /// Where finished images are staged
    pub output_dir: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    pub partitions: Vec<PartitionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    #[serde(default)]
    pub kind: DiskKind,
    /// Derived from the partitions when absent
    pub size_mb: Option<u64>,
    /// Block device for `fixed-raw` disks
    pub device: Option<String>,
    /// Image file name for file-backed disks
    pub file_name: Option<String>,
}

impl DiskSpec {
    fn implicit(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DiskKind::SparseLoopback,
            size_mb: None,
            device: None,
            file_name: None,
        }
    }
}

pub fn workspace_root() -> PathBuf {
    if let Ok(value) = std::env::var("APPLIANCE_LAB_WORKSPACE_ROOT") {
        return PathBuf::from(value);
    }

    if let Ok(current_dir) = std::env::current_dir()
        && current_dir.join("resources/appliance-specs").exists()
    {
        return current_dir;
    }

    let manifest_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    if manifest_root.join("resources/appliance-specs").exists() {
        return manifest_root;
    }

    PathBuf::from(".")
}

pub fn specs_root() -> PathBuf {
    workspace_root().join("resources/appliance-specs")
}

pub fn spec_path_for_name(spec_name: &str) -> PathBuf {
    specs_root().join(format!("{}.toml", spec_name))
}

/// Load a spec by bare name, or by path when the argument names a file
pub fn load(spec_ref: &str) -> Result<ApplianceSpec> {
    let path = Path::new(spec_ref);
    if path.extension().is_some_and(|ext| ext == "toml") && path.is_file() {
        return load_path(path);
    }
    load_by_name(spec_ref)
}

pub fn load_by_name(spec_name: &str) -> Result<ApplianceSpec> {
    let path = spec_path_for_name(spec_name);
    if !path.exists() {
        return Err(LabError::SpecNotFound {
            spec_name: spec_name.to_string(),
        });
    }
    load_path(&path)
}

pub fn load_path(path: &Path) -> Result<ApplianceSpec> {
    let spec_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "<unknown>".to_string());

    let raw = fs::read_to_string(path).map_err(|error| LabError::SpecInvalid {
        spec_name: spec_name.clone(),
        reason: error.to_string(),
    })?;

    let spec = parse(&spec_name, &raw)?;
    validate(&spec)?;
    Ok(spec)
}

pub fn parse(spec_name: &str, raw: &str) -> Result<ApplianceSpec> {
    toml::from_str(raw).map_err(|error| LabError::SpecInvalid {
        spec_name: spec_name.to_string(),
        reason: error.to_string(),
    })
}

fn invalid(spec: &ApplianceSpec, reason: impl Into<String>) -> LabError {
    LabError::SpecInvalid {
        spec_name: spec.name.clone(),
        reason: reason.into(),
    }
}

pub fn validate(spec: &ApplianceSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(LabError::SpecInvalid {
            spec_name: "<unknown>".to_string(),
            reason: "name must not be empty".to_string(),
        });
    }

    if spec.partitions.is_empty() {
        return Err(invalid(spec, "partitions must not be empty"));
    }

    let mut names = BTreeSet::new();
    for disk in &spec.disks {
        if !names.insert(disk.name.as_str()) {
            return Err(invalid(spec, format!("disk {} declared twice", disk.name)));
        }
        match disk.kind {
            DiskKind::FixedRaw => {
                if disk.device.is_none() || disk.size_mb.is_none() {
                    return Err(invalid(
                        spec,
                        format!("fixed-raw disk {} needs device and size_mb", disk.name),
                    ));
                }
            }
            DiskKind::Loopback | DiskKind::SparseLoopback => {
                if disk.device.is_some() {
                    return Err(invalid(
                        spec,
                        format!("file-backed disk {} must not name a device", disk.name),
                    ));
                }
            }
        }
    }

    let plan = partition_plan(spec)?;
    let required = plan.required_disk_sizes();
    for disk in &spec.disks {
        let (Some(size_mb), Some(needed)) = (disk.size_mb, required.get(&disk.name)) else {
            continue;
        };
        if mb_to_bytes(size_mb) < *needed {
            return Err(invalid(
                spec,
                format!(
                    "disk {} holds {} MiB but its partitions need {} MiB",
                    disk.name,
                    size_mb,
                    needed / MIB
                ),
            ));
        }
    }

    Ok(())
}

/// Partition requests folded into a plan; malformed requests are spec errors
pub fn partition_plan(spec: &ApplianceSpec) -> Result<PartitionPlan> {
    let mut plan = PartitionPlan::new();
    for request in &spec.partitions {
        plan.add_request(request.clone())
            .map_err(|error| invalid(spec, error.to_string()))?;
    }
    Ok(plan)
}

/// Declared disks plus an implicit sparse disk for every other disk a
/// partition names, each with its size resolved
pub fn resolved_disks(spec: &ApplianceSpec) -> Result<BTreeMap<String, (DiskSpec, u64)>> {
    let required = partition_plan(spec)?.required_disk_sizes();

    let mut disks: BTreeMap<String, DiskSpec> = spec
        .disks
        .iter()
        .map(|disk| (disk.name.clone(), disk.clone()))
        .collect();
    for name in required.keys() {
        disks
            .entry(name.clone())
            .or_insert_with(|| DiskSpec::implicit(name));
    }

    Ok(disks
        .into_iter()
        .map(|(name, disk)| {
            let size = match disk.size_mb {
                Some(size_mb) => mb_to_bytes(size_mb),
                None => required.get(&name).copied().unwrap_or(MIB),
            };
            (name, (disk, size))
        })
        .collect())
}

pub fn artifacts_root(spec: &ApplianceSpec) -> PathBuf {
    match &spec.artifacts_root {
        Some(value) => workspace_root().join(value),
        None => workspace_root().join(format!("target/appliance-lab/images/{}", spec.name)),
    }
}

pub fn mount_root(spec: &ApplianceSpec) -> PathBuf {
    match &spec.mount_root {
        Some(value) => workspace_root().join(value),
        None => artifacts_root(spec).join("install_root"),
    }
}

pub fn output_dir(spec: &ApplianceSpec) -> PathBuf {
    match &spec.output_dir {
        Some(value) => workspace_root().join(value),
        None => workspace_root().join(format!("target/appliance-lab/output/{}", spec.name)),
    }
}

/// Image file name for `disk`, `<spec>-<disk>.raw` unless the spec names one
pub fn image_file_name(spec: &ApplianceSpec, disk: &DiskSpec) -> String {
    disk.file_name
        .clone()
        .unwrap_or_else(|| format!("{}-{}.raw", spec.name, disk.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI: &str = r#"
name = "multi"

[[disks]]
name = "sdb"
size_mb = 512

[[partitions]]
size_mb = 200
mountpoint = "/"

[[partitions]]
size_mb = 100
mountpoint = "/boot"
fstype = "ext2"

[[partitions]]
size_mb = 256
disk = "sdb"
mountpoint = "swap"
"#;

    #[test]
    fn resolves_spec_name_without_extension() {
        let spec = load_by_name("minimal").unwrap();
        assert_eq!(spec.name, "minimal");
        assert!(!spec.partitions.is_empty());
    }

    #[test]
    fn bundled_specs_validate() {
        for name in ["minimal", "multi-disk", "extended"] {
            let spec = load(name).unwrap();
            assert_eq!(spec.name, name);
        }
    }

    #[test]
    fn missing_spec_is_reported_by_name() {
        let err = load_by_name("does-not-exist").unwrap_err();
        assert!(matches!(err, LabError::SpecNotFound { spec_name } if spec_name == "does-not-exist"));
    }

    #[test]
    fn derives_implicit_disks_and_sizes() {
        let spec = parse("multi", MULTI).unwrap();
        validate(&spec).unwrap();

        let disks = resolved_disks(&spec).unwrap();
        let sizes: Vec<(&str, u64)> = disks
            .iter()
            .map(|(name, (_, size))| (name.as_str(), *size))
            .collect();
        assert_eq!(sizes, vec![("sda", 301 * MIB), ("sdb", 512 * MIB)]);
        assert_eq!(disks["sda"].0.kind, DiskKind::SparseLoopback);
        assert_eq!(image_file_name(&spec, &disks["sda"].0), "multi-sda.raw");
    }

    #[test]
    fn rejects_undersized_and_incoherent_disks() {
        let mut spec = parse("multi", MULTI).unwrap();
        spec.disks[0].size_mb = Some(128);
        assert!(matches!(validate(&spec), Err(LabError::SpecInvalid { .. })));

        let mut spec = parse("multi", MULTI).unwrap();
        spec.disks[0].kind = DiskKind::FixedRaw;
        assert!(validate(&spec).is_err());

        spec.disks[0].device = Some("/dev/vdb".to_string());
        validate(&spec).unwrap();
    }

    #[test]
    fn rejects_malformed_partitions() {
        let mut spec = parse("multi", MULTI).unwrap();
        spec.partitions.push(PartitionRequest::new(10, None, "/boot", None));
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("/boot"));

        spec.partitions.clear();
        assert!(validate(&spec).is_err());
    }
}
