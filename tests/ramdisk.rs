// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::fs;

use multirom::format::ramdisk::{self, RamdiskFormat};

#[test]
fn magic_detection() {
    assert_eq!(
        RamdiskFormat::from_magic(b"\x1f\x8b\x08\x00").unwrap(),
        RamdiskFormat::Gzip
    );
    assert_eq!(
        RamdiskFormat::from_magic(b"\x02\x21\x4c\x18").unwrap(),
        RamdiskFormat::Lz4Legacy
    );
    assert_eq!(
        RamdiskFormat::from_magic(b"\x5d\x00\x00\x00").unwrap(),
        RamdiskFormat::Lzma
    );
    assert_eq!(
        RamdiskFormat::from_magic(b"\x5d\x00\x00\x80").unwrap(),
        RamdiskFormat::Lzma
    );

    assert!(RamdiskFormat::from_magic(b"\x00\x00\x00\x00").is_err());
    assert!(RamdiskFormat::from_magic(b"\x5d\x00\x00\x01").is_err());
}

#[test]
fn detect_reads_file_magic() {
    let temp = tempfile::tempdir().unwrap();

    let gz = temp.path().join("initrd.img");
    fs::write(&gz, b"\x1f\x8b\x08\x00rest-of-stream").unwrap();
    assert_eq!(ramdisk::detect(&gz).unwrap(), RamdiskFormat::Gzip);

    let junk = temp.path().join("junk.img");
    fs::write(&junk, b"\x00\x00\x00\x00").unwrap();
    assert!(ramdisk::detect(&junk).is_err());

    let short = temp.path().join("short.img");
    fs::write(&short, b"\x1f").unwrap();
    assert!(ramdisk::detect(&short).is_err());
}

#[test]
fn lzma_compression_fails_cleanly() {
    let temp = tempfile::tempdir().unwrap();
    let dest = temp.path().join("initrd.img");

    let err = ramdisk::pack(temp.path(), &dest, RamdiskFormat::Lzma).unwrap_err();
    assert!(matches!(err, ramdisk::Error::LzmaCompression));
    // Nothing may be written before the refusal.
    assert!(!dest.exists());
}
