use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use appliance_sys::{BackingImage, DryRunDriver, FormattedVolume, PartitionedVolumeSet};
use appliance_types::{DiskKind, MIB};

static COUNTER: AtomicU64 = AtomicU64::new(1);

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "appliance-sys-lifecycle-{}-{unique}",
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
fn two_disk_build_mounts_tears_down_and_stages() {
    let temp = TempDir::new();
    let driver = DryRunDriver::new();

    let mut disks = BTreeMap::new();
    disks.insert(
        "sda".to_string(),
        BackingImage::sparse(temp.path.join("work/disk-sda.raw"), 32 * MIB),
    );
    disks.insert(
        "sdb".to_string(),
        BackingImage::sparse(temp.path.join("work/disk-sdb.raw"), 32 * MIB),
    );

    let mut set = PartitionedVolumeSet::new(disks, temp.path.join("install_root"));
    set.add_partition(16, Some("sda"), "/", None).unwrap();
    set.add_partition(8, Some("sda"), "/boot", Some("ext2")).unwrap();
    set.add_partition(4, Some("sdb"), "swap", None).unwrap();
    set.add_partition(12, Some("sdb"), "/var", Some("ext4")).unwrap();

    set.mount(&driver).unwrap();

    assert_eq!(driver.attached_loops(), 2);
    assert_eq!(set.mount_order(), vec!["/", "/boot", "/var"]);
    assert_eq!(set.first_disk_device().as_deref(), Some("/dev/loop0"));

    let records = set.records();
    let devices: Vec<(&str, Option<&str>)> = records
        .iter()
        .map(|record| (record.mountpoint.as_str(), record.device.as_deref()))
        .collect();
    assert_eq!(
        devices,
        vec![
            ("/", Some("/dev/loop01")),
            ("/boot", Some("/dev/loop02")),
            ("/var", Some("/dev/loop12")),
            ("swap", Some("/dev/loop11")),
        ]
    );

    let fstab = set.fstab();
    assert!(fstab.contains("/dev/sdb2  /var ext4    defaults,noatime 0 0"));
    assert!(fstab.contains("/dev/sdb1  swap swap    defaults,noatime 0 0"));

    // Content written by a collaborator lands under the mounted root
    fs::write(set.root().join("etc-release"), "appliance\n").unwrap();

    let report = set.cleanup(&driver);
    assert!(report.is_clean(), "{:?}", report.failed_steps());
    assert_eq!(driver.attached_loops(), 0);
    assert!(driver.mounted().is_empty());
    assert!(driver.links().is_empty());
    assert!(driver.mapped_disks().is_empty());

    let records = set.disk_records();
    assert!(records.iter().all(|record| record.device.is_none()));
    assert!(records.iter().all(|record| record.kind == DiskKind::SparseLoopback));

    let output = temp.path.join("out");
    for (name, mut image) in set.into_disks() {
        let staged = image
            .stage_to(&output.join(format!("appliance-{name}.raw")))
            .unwrap();
        assert_eq!(fs::metadata(&staged).unwrap().len(), 32 * MIB);
    }
    assert!(!temp.path.join("work/disk-sda.raw").exists());
}

#[test]
fn cleanup_after_failed_mount_still_releases_loops() {
    let temp = TempDir::new();
    let driver = DryRunDriver::new();
    driver.fail_on("mkfs.ext3");

    let mut disks = BTreeMap::new();
    disks.insert(
        "sda".to_string(),
        BackingImage::sparse(temp.path.join("disk-sda.raw"), 16 * MIB),
    );
    let mut set = PartitionedVolumeSet::new(disks, temp.path.join("root"));
    set.add_partition(8, None, "/", None).unwrap();

    assert!(set.mount(&driver).is_err());

    let report = set.cleanup(&driver);
    assert!(report.is_clean());
    assert_eq!(driver.attached_loops(), 0);
    assert_eq!(
        driver.commands_matching("kpartx -d"),
        vec!["kpartx -d /dev/loop0"]
    );
}

#[test]
fn single_volume_is_resparsed_before_staging() {
    let temp = TempDir::new();
    let driver = DryRunDriver::new().with_filesystem(64 * MIB / 4096, 20 * MIB);

    let mut volume = FormattedVolume::new(
        BackingImage::sparse(temp.path.join("rootfs.img"), 64 * MIB),
        temp.path.join("mnt"),
        "ext4",
    )
    .with_label("rootfs");
    volume.mount(&driver).unwrap();

    let size = volume.resparse(&driver, None).unwrap();
    assert_eq!(size, Some(20 * MIB));

    let mut image = volume.into_image();
    let staged = image.stage_to(&temp.path.join("out/rootfs.img")).unwrap();
    assert_eq!(fs::metadata(staged).unwrap().len(), 20 * MIB);
}
