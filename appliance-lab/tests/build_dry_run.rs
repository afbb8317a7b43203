use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use appliance_lab::ledger::{self, BuildState};
use appliance_lab::orchestrator::{BuildPaths, build_with, cleanup_stale, resparse_image_with};
use appliance_lab::spec::parse;
use appliance_sys::DryRunDriver;
use appliance_types::MIB;

static COUNTER: AtomicU64 = AtomicU64::new(1);

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "appliance-lab-build-{}-{unique}",
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

const SPEC: &str = r#"
name = "webnode"

[[disks]]
name = "sdb"
size_mb = 64

[[partitions]]
size_mb = 32
mountpoint = "/"

[[partitions]]
size_mb = 8
mountpoint = "/boot"
fstype = "ext2"

[[partitions]]
size_mb = 16
disk = "sdb"
mountpoint = "/var"
fstype = "ext4"

[[partitions]]
size_mb = 8
disk = "sdb"
mountpoint = "swap"
"#;

#[test]
fn dry_run_build_stages_every_disk_and_runs_hook() {
    let temp = TempDir::new();
    let spec = parse("webnode", SPEC).unwrap();
    let paths = BuildPaths::under(&temp.path);
    let driver = DryRunDriver::new();

    let report = build_with(
        &spec,
        &driver,
        &paths,
        Some("touch \"$APPLIANCE_ROOT/hook-ran\""),
        false,
    )
    .unwrap();

    assert!(report.suppressed.is_empty(), "{:?}", report.suppressed);
    assert_eq!(
        report.staged,
        vec![
            paths.output_dir.join("webnode-sda.raw"),
            paths.output_dir.join("webnode-sdb.raw"),
        ]
    );
    assert_eq!(fs::metadata(&report.staged[0]).unwrap().len(), 41 * MIB);
    assert_eq!(fs::metadata(&report.staged[1]).unwrap().len(), 64 * MIB);

    let mountpoints: Vec<&str> = report
        .records
        .iter()
        .map(|record| record.mountpoint.as_str())
        .collect();
    assert_eq!(mountpoints, vec!["/", "/boot", "/var", "swap"]);

    assert!(paths.mount_root.join("hook-ran").exists());
    let fstab = fs::read_to_string(paths.mount_root.join("etc/fstab")).unwrap();
    assert_eq!(fstab, report.fstab);
    assert!(fstab.starts_with("/dev/sda1  / ext3"));

    assert_eq!(driver.attached_loops(), 0);
    assert!(driver.mounted().is_empty());
}

#[test]
fn failing_hook_still_tears_down() {
    let temp = TempDir::new();
    let spec = parse("webnode", SPEC).unwrap();
    let paths = BuildPaths::under(&temp.path);
    let driver = DryRunDriver::new();

    let err = build_with(&spec, &driver, &paths, Some("exit 3"), false).unwrap_err();

    assert!(err.to_string().contains("exit 3"));
    assert_eq!(driver.attached_loops(), 0);
    assert!(driver.mounted().is_empty());
    assert!(!paths.output_dir.exists());
}

#[test]
fn stale_ledger_entry_is_released_best_effort() {
    let mut state = BuildState::new("lab-stale-entry");
    state.loop_devices = vec!["/dev/loop7".to_string()];
    state.device_nodes = vec!["/dev/loop71".to_string()];
    state.mount_points = vec!["/srv/build/root".to_string()];
    ledger::save(&state).unwrap();

    let driver = DryRunDriver::new();
    let report = cleanup_stale("lab-stale-entry", &driver, true).unwrap();

    assert_eq!(
        driver.commands(),
        vec![
            "umount /srv/build/root",
            "rm /dev/loop71",
            "kpartx -d /dev/loop7",
            "losetup -d /dev/loop7",
        ]
    );
    // nothing was really held by the recording driver
    assert_eq!(
        report.failed_steps(),
        vec!["umount /srv/build/root", "unlink /dev/loop71", "losetup -d /dev/loop7"]
    );
    assert!(!ledger::exists("lab-stale-entry"));
}

#[test]
fn resparse_shrinks_image_file() {
    let temp = TempDir::new();
    let image = temp.path.join("rootfs.img");
    let file = fs::File::create(&image).unwrap();
    file.set_len(32 * MIB).unwrap();

    let driver = DryRunDriver::new().with_filesystem(32 * MIB / 4096, 6 * MIB);
    let size = resparse_image_with(&driver, &image, None).unwrap();

    assert_eq!(size, Some(6 * MIB));
    assert_eq!(fs::metadata(&image).unwrap().len(), 6 * MIB);
    assert!(!image.with_extension("mnt").exists());
}

#[test]
fn resparse_of_small_block_image_never_grows_the_file() {
    let temp = TempDir::new();
    let image = temp.path.join("boot.img");
    let file = fs::File::create(&image).unwrap();
    file.set_len(8 * MIB).unwrap();

    let driver = DryRunDriver::new()
        .with_filesystem(8 * 1024, 2 * MIB)
        .with_block_size(1024);
    let size = resparse_image_with(&driver, &image, Some(3 * MIB)).unwrap();

    assert_eq!(size, Some(3 * MIB));
    assert_eq!(fs::metadata(&image).unwrap().len(), 3 * MIB);
    let probes = driver.commands_matching("resize2fs");
    assert_eq!(probes[0], format!("resize2fs {} 4096K", image.display()));
    assert_eq!(probes.last(), Some(&format!("resize2fs {} 3072K", image.display())));
}
