// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use multirom::format::bootimg::{BootImage, BOOT_NAME_SIZE};

fn sample_image() -> BootImage {
    BootImage {
        kernel_addr: 0x1000_8000,
        ramdisk_addr: 0x1100_0000,
        second_addr: 0x1010_0000,
        tags_addr: 0x1000_0100,
        page_size: 2048,
        os_version: 0,
        name: "test".to_string(),
        cmdline: "console=ttyHSL0,115200,n8".to_string(),
        id: [1, 2, 3, 4, 5, 6, 7, 8],
        extra_cmdline: String::new(),
        kernel: b"not-really-a-kernel".to_vec(),
        ramdisk: vec![0xaa; 5000],
        second: Vec::new(),
    }
}

#[test]
fn round_trip() {
    let image = sample_image();

    let mut buf = Vec::new();
    image.to_writer(&mut buf).unwrap();

    // Header page plus page-aligned kernel and ramdisk.
    assert_eq!(buf.len(), 2048 + 2048 + 3 * 2048);
    assert!(buf.starts_with(b"ANDROID!"));

    let parsed = BootImage::from_reader(Cursor::new(buf)).unwrap();
    assert_eq!(parsed, image);
}

#[test]
fn rejects_bad_magic() {
    let image = sample_image();
    let mut buf = Vec::new();
    image.to_writer(&mut buf).unwrap();
    buf[0] = b'X';

    assert!(BootImage::from_reader(Cursor::new(buf)).is_err());
}

#[test]
fn name_stamp_is_truncated() {
    let mut image = sample_image();
    image.set_name("tr_ver1234567890123456789");

    assert_eq!(image.name.len(), BOOT_NAME_SIZE - 1);

    let mut buf = Vec::new();
    image.to_writer(&mut buf).unwrap();
    let parsed = BootImage::from_reader(Cursor::new(buf)).unwrap();
    assert_eq!(parsed.name, image.name);
}
