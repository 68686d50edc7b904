// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Mount/boot hijack transactions against in-memory collaborators and a
//! scratch filesystem tree.

use std::{
    cell::RefCell,
    collections::HashSet,
    fs::{self, File},
    path::{Path, PathBuf},
    rc::Rc,
};

use multirom::{
    engine::{DeviceConfig, HookError, MultiRom, RecoveryData, RecoveryHooks},
    partition::{self, Partition, PartitionContent, PartitionManager, Snapshot},
};
use tempfile::TempDir;

#[derive(Default)]
struct PmState {
    parts: Vec<Partition>,
    mounted: HashSet<String>,
    fail_mounts: HashSet<String>,
}

#[derive(Clone, Default)]
struct MockPm(Rc<RefCell<PmState>>);

impl PartitionManager for MockPm {
    fn snapshot(&self) -> Snapshot {
        Snapshot(self.0.borrow().parts.clone())
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.0.borrow_mut().parts = snapshot.0;
    }

    fn find(&self, mount_point: &str) -> Option<Partition> {
        self.0
            .borrow()
            .parts
            .iter()
            .find(|p| p.mount_point == mount_point)
            .cloned()
    }

    fn remove(&mut self, mount_point: &str) -> Option<Partition> {
        let mut state = self.0.borrow_mut();
        let idx = state.parts.iter().position(|p| p.mount_point == mount_point)?;
        Some(state.parts.remove(idx))
    }

    fn insert(&mut self, partition: Partition) {
        self.0.borrow_mut().parts.push(partition);
    }

    fn mount(&mut self, mount_point: &str) -> Result<(), partition::Error> {
        let mut state = self.0.borrow_mut();
        if state.fail_mounts.contains(mount_point) {
            return Err(partition::Error::Mount(
                mount_point.to_string(),
                "injected failure".to_string(),
            ));
        }
        if !state.parts.iter().any(|p| p.mount_point == mount_point) {
            return Err(partition::Error::NoSuchPartition(mount_point.to_string()));
        }
        state.mounted.insert(mount_point.to_string());
        Ok(())
    }

    fn unmount(&mut self, mount_point: &str) -> Result<(), partition::Error> {
        self.0.borrow_mut().mounted.remove(mount_point);
        Ok(())
    }

    fn write_fstab(&mut self) -> Result<(), partition::Error> {
        Ok(())
    }

    fn refresh(&mut self) {}
}

#[derive(Default)]
struct DataState {
    internal_path: String,
    storage_path: String,
}

#[derive(Clone, Default)]
struct MockData(Rc<RefCell<DataState>>);

impl RecoveryData for MockData {
    fn internal_path(&self) -> String {
        self.0.borrow().internal_path.clone()
    }

    fn set_internal_path(&mut self, path: &str) {
        self.0.borrow_mut().internal_path = path.to_string();
    }

    fn storage_path(&self) -> String {
        self.0.borrow().storage_path.clone()
    }

    fn set_storage_path(&mut self, path: &str) {
        self.0.borrow_mut().storage_path = path.to_string();
    }

    fn set_settings_path(&mut self, _path: &str) {}

    fn refresh_backup_dir(&mut self) {}

    fn set_backup_in_progress(&mut self, _active: bool) {}
}

#[derive(Clone, Default)]
struct MockHooks;

impl RecoveryHooks for MockHooks {
    fn install_zip(&mut self, _zip: &Path) -> Result<(), HookError> {
        Ok(())
    }

    fn run_open_recovery_script(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn run_system_image_upgrader(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn request_reboot(&mut self) {}
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    engine: MultiRom,
    pm: MockPm,
    data: MockData,
}

fn block_partition(mount_point: &str, device: &str) -> Partition {
    Partition {
        display_name: mount_point.trim_start_matches('/').to_string(),
        backup_name: mount_point.trim_start_matches('/').to_string(),
        mount_point: mount_point.to_string(),
        fs_type: "ext4".to_string(),
        block_device: Some(PathBuf::from(device)),
        symlink_path: format!("{mount_point}/media"),
        storage_path: format!("{mount_point}/media/0"),
        can_be_backed_up: true,
        content: PartitionContent::Block,
    }
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();

    // Scratch stand-ins for the device tree the engine touches.
    for dir in ["tmp", "mnt", "sbin", "realdata", "dev", "etc"] {
        fs::create_dir(root.join(dir)).unwrap();
    }
    File::create(root.join("sbin/umount")).unwrap();
    fs::write(root.join("etc/mtab"), "").unwrap();
    File::create(root.join("dev/boot0")).unwrap();

    // MultiROM root with one installed Android ROM.
    let multirom = root.join("media/multirom");
    fs::create_dir_all(multirom.join("roms/TestRom")).unwrap();
    for dir in ["system", "data", "cache", "boot"] {
        fs::create_dir(multirom.join("roms/TestRom").join(dir)).unwrap();
    }

    let pm = MockPm::default();
    {
        let mut state = pm.0.borrow_mut();
        state
            .parts
            .push(block_partition("/boot", root.join("dev/boot0").to_str().unwrap()));
        state.parts.push(block_partition("/data", "/dev/block/data0"));
        state
            .parts
            .push(block_partition("/system", "/dev/block/system0"));
        state
            .parts
            .push(block_partition("/cache", "/dev/block/cache0"));
    }

    let data = MockData::default();
    data.0.borrow_mut().internal_path = "/data/media".to_string();
    data.0.borrow_mut().storage_path = "/data/media/0".to_string();

    let dev = DeviceConfig {
        device: "testdev".to_string(),
        realdata: root.join("realdata"),
        tmp: root.join("tmp"),
        mnt: root.join("mnt"),
        sbin: root.join("sbin"),
        mtab: root.join("etc/mtab"),
        media_roots: vec![multirom.clone()],
        default_rotation: 0,
        copy_mrom_fstab: false,
        ramdisk_addr: None,
    };

    let engine = MultiRom::new(
        dev,
        Box::new(pm.clone()),
        Box::new(data.clone()),
        Box::new(MockHooks),
    );

    Fixture {
        _temp: temp,
        root,
        engine,
        pm,
        data,
    }
}

#[test]
fn hijack_and_restore_are_symmetric() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let before = fx.pm.0.borrow().parts.clone();
    let storage_before = fx.data.storage_path();
    let realdata_str = fx.root.join("realdata").to_string_lossy().into_owned();

    fx.engine
        .with_rom_mounts("TestRom", |eng| {
            // The sandboxed view is in place: /sbin/umount is hidden and
            // the storage paths point at the real filesystem.
            assert!(!eng.boot_dev().unwrap().as_os_str().is_empty());
            Ok(())
        })
        .unwrap();

    // Inside the hijack the table had fakes; afterwards it is bitwise
    // equal to the original again.
    assert_eq!(fx.pm.0.borrow().parts, before);
    assert!(fx.root.join("sbin/umount").exists());
    assert!(!fx.root.join("sbin/umount.bak").exists());
    assert_eq!(fx.data.storage_path(), storage_before);
    assert!(!fx.data.storage_path().starts_with(&realdata_str));
}

#[test]
fn hijack_swaps_table_and_settings_while_active() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let realdata_str = fx.root.join("realdata").to_string_lossy().into_owned();
    let pm = fx.pm.clone();
    let data = fx.data.clone();
    let sbin = fx.root.join("sbin");

    fx.engine
        .with_rom_mounts("TestRom", move |_eng| {
            let state = pm.0.borrow();

            // /system and /cache were evicted and replaced by binds.
            let system = state
                .parts
                .iter()
                .find(|p| p.mount_point == "/system")
                .unwrap();
            assert!(matches!(system.content, PartitionContent::Bind { .. }));

            // /data was relabelled to /realdata, non-backup.
            let realdata = state
                .parts
                .iter()
                .find(|p| p.mount_point == realdata_str)
                .unwrap();
            assert!(!realdata.can_be_backed_up);

            // The fake /data is backupable again.
            let fake_data = state
                .parts
                .iter()
                .find(|p| p.mount_point == "/data")
                .unwrap();
            assert!(fake_data.can_be_backed_up);
            assert_eq!(fake_data.display_name, "Data");

            assert!(data.storage_path().starts_with(&realdata_str));
            assert!(!sbin.join("umount").exists());
            assert!(sbin.join("umount.bak").exists());

            Ok(())
        })
        .unwrap();
}

#[test]
fn failed_fake_mount_rolls_everything_back() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let before = fx.pm.0.borrow().parts.clone();
    let storage_before = fx.data.storage_path();
    fx.pm.0.borrow_mut().fail_mounts.insert("/system".to_string());

    let result = fx.engine.with_rom_mounts("TestRom", |_eng| Ok(()));
    assert!(result.is_err());

    assert_eq!(fx.pm.0.borrow().parts, before);
    assert!(fx.root.join("sbin/umount").exists());
    assert!(!fx.root.join("sbin/umount.bak").exists());
    assert_eq!(fx.data.storage_path(), storage_before);
}

#[test]
fn missing_data_partition_fails_conservatively() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    fx.pm.0.borrow_mut().parts.retain(|p| p.mount_point != "/data");
    let before = fx.pm.0.borrow().parts.clone();

    let result = fx.engine.with_rom_mounts("TestRom", |_eng| Ok(()));
    assert!(result.is_err());
    assert_eq!(fx.pm.0.borrow().parts, before);
}

#[test]
fn fake_boot_partition_and_restore() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let boot_dev = fx.root.join("dev/boot0");
    fs::write(&boot_dev, b"real-boot-partition").unwrap();
    let fake = fx.root.join("media/multirom/roms/TestRom/boot.img");

    fx.engine.fake_boot_partition(&fake).unwrap();

    // The device node is now a symlink to the fake, seeded from the old
    // contents, and the breadcrumb records the hijack.
    assert!(boot_dev.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(fs::read(&fake).unwrap(), b"real-boot-partition");
    let crumb = fs::read_to_string(fx.root.join("tmp/mrom_fakebootpart")).unwrap();
    assert_eq!(crumb.trim(), boot_dev.to_str().unwrap());

    // Reentrancy guard.
    assert!(fx.engine.fake_boot_partition(&fake).is_err());

    fx.engine.restore_boot_partition();
    assert!(boot_dev.symlink_metadata().unwrap().file_type().is_file());
    assert_eq!(fs::read(&boot_dev).unwrap(), b"real-boot-partition");
    assert!(!fx.root.join("tmp/mrom_fakebootpart").exists());

    let mut os = boot_dev.into_os_string();
    os.push("-orig");
    assert!(!PathBuf::from(os).exists());
}

#[test]
fn failsafe_restores_after_crash() {
    let mut fx = fixture();

    let boot_dev = fx.root.join("dev/boot0");
    fs::write(&boot_dev, b"stale-fake-file").unwrap();

    let mut orig = boot_dev.clone().into_os_string();
    orig.push("-orig");
    let orig = PathBuf::from(orig);
    fs::write(&orig, b"the-real-node").unwrap();

    fs::write(
        fx.root.join("tmp/mrom_fakebootpart"),
        format!("{}\n", boot_dev.display()),
    )
    .unwrap();

    fx.engine.failsafe_check_boot_partition();

    assert_eq!(fs::read(&boot_dev).unwrap(), b"the-real-node");
    assert!(!orig.exists());
    assert!(!fx.root.join("tmp/mrom_fakebootpart").exists());

    // Idempotent: a second run has nothing to do.
    fx.engine.failsafe_check_boot_partition();
    assert_eq!(fs::read(&boot_dev).unwrap(), b"the-real-node");
}

#[test]
fn failsafe_without_breadcrumb_is_a_noop() {
    let mut fx = fixture();

    let boot_dev = fx.root.join("dev/boot0");
    fs::write(&boot_dev, b"whatever").unwrap();

    fx.engine.failsafe_check_boot_partition();
    assert_eq!(fs::read(&boot_dev).unwrap(), b"whatever");
}

#[test]
fn normalize_and_restore_rom_path_are_paired() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let roms = fx.root.join("media/multirom/roms");
    fs::create_dir(roms.join("My Rom")).unwrap();

    let mut path = roms.join("My Rom");
    fx.engine.normalize_rom_path(&mut path).unwrap();

    assert!(!path.to_string_lossy().contains(' '));
    assert!(path.exists());
    assert!(!roms.join("My Rom").exists());

    // A nested normalize reuses the stored rename.
    let mut again = roms.join("My Rom");
    fx.engine.normalize_rom_path(&mut again).unwrap();
    assert_eq!(again, path);

    fx.engine.restore_rom_path();
    assert!(roms.join("My Rom").exists());
    assert!(!path.exists());
}

#[test]
fn normalize_skips_clean_paths() {
    let mut fx = fixture();
    assert!(fx.engine.folder_exists());

    let roms = fx.root.join("media/multirom/roms");
    let mut path = roms.join("TestRom");
    fx.engine.normalize_rom_path(&mut path).unwrap();
    assert_eq!(path, roms.join("TestRom"));
}

#[test]
fn translate_to_realdata_rewrites_known_prefixes() {
    let fx = fixture();
    let realdata = fx.root.join("realdata");

    let translated = fx
        .engine
        .translate_to_realdata(Path::new("/sdcard/update.zip"));
    assert_eq!(translated, realdata.join("media/update.zip"));

    fs::create_dir_all(realdata.join("media/0")).unwrap();
    let translated = fx
        .engine
        .translate_to_realdata(Path::new("/sdcard/update.zip"));
    assert_eq!(translated, realdata.join("media/0/update.zip"));

    let translated = fx
        .engine
        .translate_to_realdata(Path::new("/data/media/0/multirom/roms/X/boot.img"));
    assert_eq!(translated, realdata.join("media/0/multirom/roms/X/boot.img"));

    let untouched = fx.engine.translate_to_realdata(Path::new("/tmp/foo.zip"));
    assert_eq!(untouched, PathBuf::from("/tmp/foo.zip"));
}
