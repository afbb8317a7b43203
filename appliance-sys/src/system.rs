// SPDX-License-Identifier: GPL-3.0-only

//! Host driver backed by util-linux, parted, kpartx and e2fsprogs

use std::path::{Path, PathBuf};
use std::process::Command;

use appliance_types::PartitionKind;
use tracing::{debug, warn};
use which::which;

use crate::driver::{BlockDeviceDriver, FilesystemGeometry, FormatRequest, ResizeOutcome};
use crate::error::{Result, SysError};

/// e2fsck exits with 1 when it corrected errors, which still leaves a
/// consistent filesystem.
const FSCK_MAX_OK_STATUS: i32 = 1;

/// resize2fs messages meaning the requested size cannot hold the content
const RESIZE_TOO_SMALL_MARKERS: &[&str] = &["New size smaller than minimum", "No space left on device"];

struct CommandOutput {
    stdout: String,
    stderr: String,
    code: Option<i32>,
    success: bool,
}

/// Runs the real host tools. Requires root.
#[derive(Debug, Default, Clone)]
pub struct SystemDriver;

impl SystemDriver {
    pub fn new() -> Self {
        Self
    }

    fn resolve(tool: &str) -> Result<PathBuf> {
        which(tool).map_err(|_| SysError::ToolNotFound(tool.to_string()))
    }

    fn exec(tool: &str, args: &[&str]) -> Result<CommandOutput> {
        let binary = Self::resolve(tool)?;
        let rendered = render(tool, args);
        debug!("Running {}", rendered);

        let output = Command::new(&binary)
            .args(args)
            .output()
            .map_err(|e| SysError::tool(&rendered, "spawn failed", e.to_string()))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
            success: output.status.success(),
        })
    }

    fn run(tool: &str, args: &[&str]) -> Result<String> {
        let output = Self::exec(tool, args)?;
        if !output.success {
            return Err(SysError::tool(
                render(tool, args),
                status_text(output.code),
                output.stderr.trim(),
            ));
        }
        Ok(output.stdout)
    }
}

pub(crate) fn render(command: &str, args: &[&str]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

fn status_text(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// First column of each non-empty `kpartx -l` line
pub fn parse_kpartx_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Value of a `Field: value` line in `dumpe2fs -h` output
pub fn parse_dumpe2fs_field<'a>(output: &'a str, field: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        line.strip_prefix(field)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// How a finished `resize2fs` run answers. Only the too-small messages are a
/// refusal; any other failure is returned as the error.
pub fn classify_resize(command: &str, code: Option<i32>, stderr: &str) -> Result<ResizeOutcome> {
    if code == Some(0) {
        return Ok(ResizeOutcome::Resized);
    }
    if RESIZE_TOO_SMALL_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
    {
        return Ok(ResizeOutcome::Refused);
    }
    Err(SysError::tool(command, status_text(code), stderr.trim()))
}

fn dumpe2fs_number(output: &str, field: &str, command: &str) -> Result<u64> {
    let value = parse_dumpe2fs_field(output, field).ok_or_else(|| {
        SysError::tool(command, "exit status 0", format!("no '{field}' field in output"))
    })?;
    value.parse().map_err(|_| {
        SysError::tool(
            command,
            "exit status 0",
            format!("unparseable {} '{value}'", field.to_lowercase()),
        )
    })
}

/// Block count and block size from `dumpe2fs -h` output
pub fn parse_geometry(output: &str, command: &str) -> Result<FilesystemGeometry> {
    Ok(FilesystemGeometry {
        block_count: dumpe2fs_number(output, "Block count", command)?,
        block_size: dumpe2fs_number(output, "Block size", command)?,
    })
}

impl BlockDeviceDriver for SystemDriver {
    fn find_free_loop(&self) -> Result<String> {
        let stdout = Self::run("losetup", &["-f"])
            .map_err(|e| SysError::ResourceExhausted(format!("no free loop device: {e}")))?;
        stdout
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| SysError::ResourceExhausted("losetup -f returned no device".to_string()))
    }

    fn attach_loop(&self, device: &str, file: &Path) -> Result<()> {
        let file = path_arg(file);
        Self::run("losetup", &[device, file.as_str()]).map_err(|e| {
            SysError::ResourceExhausted(format!("failed to bind {device} to {file}: {e}"))
        })?;
        Ok(())
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        Self::run("losetup", &["-d", device]).map(|_| ())
    }

    fn write_label(&self, disk: &str) -> Result<()> {
        Self::run("parted", &["-s", disk, "mklabel", "msdos"]).map(|_| ())
    }

    fn create_partition(
        &self,
        disk: &str,
        kind: PartitionKind,
        start_mb: u64,
        end_mb: u64,
    ) -> Result<()> {
        let start = format!("{start_mb}M");
        let end = format!("{end_mb}M");
        Self::run(
            "parted",
            &[
                "-s",
                disk,
                "mkpart",
                kind.as_parted_str(),
                start.as_str(),
                end.as_str(),
            ],
        )
        .map(|_| ())
    }

    fn list_partition_mappings(&self, disk: &str) -> Result<Vec<String>> {
        let stdout = Self::run("kpartx", &["-l", disk])?;
        Ok(parse_kpartx_listing(&stdout))
    }

    fn add_partition_mappings(&self, disk: &str) -> Result<()> {
        Self::run("kpartx", &["-a", disk]).map(|_| ())
    }

    fn remove_partition_mappings(&self, disk: &str) -> Result<()> {
        Self::run("kpartx", &["-d", disk]).map(|_| ())
    }

    fn link_device_node(&self, target: &Path, link: &Path) -> Result<()> {
        debug!("Linking {:?} -> {:?}", link, target);
        std::os::unix::fs::symlink(target, link)?;
        Ok(())
    }

    fn unlink_device_node(&self, link: &Path) -> Result<()> {
        debug!("Removing compat node {:?}", link);
        std::fs::remove_file(link)?;
        Ok(())
    }

    fn make_filesystem(&self, request: &FormatRequest<'_>) -> Result<()> {
        let tool = format!("mkfs.{}", request.fstype);
        let block_size = request.block_size.to_string();
        Self::run(
            &tool,
            &[
                "-F",
                "-L",
                request.label,
                "-m",
                "1",
                "-b",
                block_size.as_str(),
                request.device,
            ],
        )
        .map(|_| ())
    }

    fn tune_filesystem(&self, device: &str) -> Result<()> {
        Self::run(
            "tune2fs",
            &["-c0", "-i0", "-Odir_index", "-ouser_xattr,acl", device],
        )
        .map(|_| ())
    }

    fn check_filesystem(&self, target: &Path) -> Result<()> {
        let target = path_arg(target);
        let args = ["-f", "-y", target.as_str()];
        let output = Self::exec("e2fsck", &args)?;
        match output.code {
            Some(code) if code <= FSCK_MAX_OK_STATUS => {
                if code == FSCK_MAX_OK_STATUS {
                    warn!("e2fsck corrected errors on {}", target);
                }
                Ok(())
            }
            code => Err(SysError::tool(
                render("e2fsck", &args),
                status_text(code),
                output.stderr.trim(),
            )),
        }
    }

    fn filesystem_geometry(&self, target: &Path) -> Result<FilesystemGeometry> {
        let target = path_arg(target);
        let args = ["-h", target.as_str()];
        let stdout = Self::run("dumpe2fs", &args)?;
        parse_geometry(&stdout, &render("dumpe2fs", &args))
    }

    fn resize_filesystem(&self, target: &Path, size_bytes: u64) -> Result<ResizeOutcome> {
        let target = path_arg(target);
        let size = format!("{}K", size_bytes / 1024);
        let args = [target.as_str(), size.as_str()];
        let output = Self::exec("resize2fs", &args)?;
        let outcome = classify_resize(&render("resize2fs", &args), output.code, &output.stderr)?;
        if outcome == ResizeOutcome::Refused {
            debug!("resize2fs refused {} at {}: {}", target, size, output.stderr.trim());
        }
        Ok(outcome)
    }

    fn make_swap(&self, device: &str) -> Result<()> {
        Self::run("mkswap", &[device]).map(|_| ())
    }

    fn mount(&self, device: &str, dir: &Path, fstype: Option<&str>) -> Result<()> {
        let dir = path_arg(dir);
        let mut args = vec![device, dir.as_str()];
        if let Some(fstype) = fstype {
            args.extend(["-t", fstype]);
        }
        Self::run("mount", &args).map(|_| ())
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        let dir = path_arg(dir);
        Self::run("umount", &[dir.as_str()]).map(|_| ())
    }
}
