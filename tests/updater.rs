// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io::Write, path::Path};

use multirom::updater::{self, filter_script};
use zip::{write::SimpleFileOptions, ZipWriter};

const BOOT_DEV: &[u8] = b"/dev/block/mmcblk0p2";

const CLASSIC_SCRIPT: &str = "\
ui_print(\"hello\");
run_program(\"/sbin/busybox\", \"mount\", \"/system\");
format(\"ext4\",\"EMMC\",\"/dev/block/bootdevice/by-name/system\",\"0\",\"/system\");
package_extract_file(\"boot.img\",\"/dev/block/bootdevice/by-name/boot\");
symlink(\"/system/bin/sh\",\"/system/bin/sh\");
";

const CLASSIC_EXPECTED: &str = "\
ui_print(\"hello\");
package_extract_file(\"boot.img\",\"/dev/block/bootdevice/by-name/boot\");
symlink(\"/system/bin/sh\",\"/system/bin/sh\");
";

#[test]
fn sanitize_classic_zip_script() {
    let result = filter_script(CLASSIC_SCRIPT.as_bytes(), BOOT_DEV);

    assert_eq!(result.script, CLASSIC_EXPECTED.as_bytes());
    assert!(result.changed);
    assert!(result.format_system);
}

#[test]
fn filtering_is_idempotent() {
    let first = filter_script(CLASSIC_SCRIPT.as_bytes(), BOOT_DEV);
    let second = filter_script(&first.script, BOOT_DEV);

    assert_eq!(second.script, first.script);
    assert!(!second.changed);
    assert!(!second.format_system);
}

#[test]
fn busybox_mount_binaries_survive() {
    for line in [
        "package_extract_file(\"mount\", \"/system/bin/mount\");",
        "set_perm(0, 0, 0755, \"/system/xbin/umount\");",
        "symlink(\"busybox\", \"/system/bin/mount\");",
    ] {
        let result = filter_script(line.as_bytes(), BOOT_DEV);
        assert!(!result.changed, "dropped: {line}");
    }
}

#[test]
fn mount_and_dd_calls_are_dropped() {
    for line in [
        "mount(\"ext4\", \"EMMC\", \"/dev/block/mmcblk0p9\", \"/system\");",
        "run_program(\"/sbin/mount\", \"-o\", \"rw\", \"/system\");",
        "run_program(\"/sbin/busybox\", \"dd\", \"if=/tmp/boot\"); run_program(\"dd\")",
        "package_extract_file(\"radio.img\", \"/dev/block/platform/msm_sdcc.1/by-name/radio\");",
    ] {
        let result = filter_script(line.as_bytes(), BOOT_DEV);
        assert!(result.changed, "kept: {line}");
        assert!(result.script.is_empty(), "kept: {line}");
    }
}

#[test]
fn boot_image_lines_survive_block_rules() {
    for line in [
        "package_extract_file(\"boot.img\", \"/dev/block/platform/msm_sdcc.1/by-name/boot\");",
        "run_program(\"/tmp/bbootimg\", \"-u\", \"/dev/block/mmcblk0p2\");",
        "assert(package_extract_file(\"zImage\", \"/tmp/zImage\"));",
    ] {
        let result = filter_script(line.as_bytes(), BOOT_DEV);
        assert!(!result.changed, "dropped: {line}");
    }
}

#[test]
fn comments_and_whitespace_are_kept() {
    let script = b"# format everything\n   \nui_print(\"x\");\n";
    let result = filter_script(script, BOOT_DEV);

    // The blank-only line keeps its spaces; empty lines are consumed by
    // tokenization.
    assert_eq!(result.script, b"# format everything\n   \nui_print(\"x\");\n");
    assert!(!result.changed);
}

fn write_test_zip(path: &Path, script: &str) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    let options = SimpleFileOptions::default();

    writer.start_file("system/app/placeholder.txt", options).unwrap();
    writer.write_all(b"payload").unwrap();

    writer.start_file(updater::UPDATER_SCRIPT, options).unwrap();
    writer.write_all(script.as_bytes()).unwrap();

    writer.finish().unwrap();
}

fn read_zip_script(path: &Path) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(updater::UPDATER_SCRIPT).unwrap();
    let mut data = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
    data
}

#[test]
fn sanitize_rewrites_zip_and_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let tmp = temp.path().join("tmp");
    std::fs::create_dir(&tmp).unwrap();

    let zip_path = temp.path().join("update.zip");
    write_test_zip(&zip_path, CLASSIC_SCRIPT);

    let sanitized = updater::sanitize(&zip_path, &tmp, Path::new(
        "/dev/block/mmcblk0p2",
    ))
    .unwrap();

    // Small ZIPs are edited on a copy under tmp, not in place.
    assert_eq!(sanitized.path, tmp.join(updater::SANITIZED_ZIP_NAME));
    assert!(sanitized.changed);
    assert!(sanitized.format_system);
    assert_eq!(read_zip_script(&sanitized.path), CLASSIC_EXPECTED.as_bytes());

    // The other entry is carried over.
    let mut archive = zip::ZipArchive::new(File::open(&sanitized.path).unwrap()).unwrap();
    assert!(archive.by_name("system/app/placeholder.txt").is_ok());
    drop(archive);

    let original = std::fs::read(&sanitized.path).unwrap();
    let again = updater::sanitize(&sanitized.path, &tmp, Path::new(
        "/dev/block/mmcblk0p2",
    ))
    .unwrap();

    assert!(!again.changed);
    assert_eq!(std::fs::read(&again.path).unwrap(), original);
}
