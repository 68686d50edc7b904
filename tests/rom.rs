// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::fs::{self, File};

use multirom::rom::{self, RomType};

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn classify_internal_android() {
    let temp = tempfile::tempdir().unwrap();
    for dir in ["system", "data", "cache", "boot"] {
        fs::create_dir(temp.path().join(dir)).unwrap();
    }

    assert_eq!(rom::classify(true, temp.path()), RomType::AndroidInternal);
}

#[test]
fn classify_internal_without_boot_is_touch() {
    let temp = tempfile::tempdir().unwrap();
    for dir in ["system", "data", "cache"] {
        fs::create_dir(temp.path().join(dir)).unwrap();
    }

    assert_eq!(rom::classify(true, temp.path()), RomType::UtouchInternal);
}

#[test]
fn classify_internal_ubuntu() {
    let temp = tempfile::tempdir().unwrap();
    fs::create_dir(temp.path().join("root")).unwrap();

    assert_eq!(rom::classify(true, temp.path()), RomType::UbuntuInternal);
}

#[test]
fn classify_external_image_backed() {
    let temp = tempfile::tempdir().unwrap();
    for img in ["system.img", "data.img", "cache.img"] {
        File::create(temp.path().join(img)).unwrap();
    }

    assert_eq!(rom::classify(false, temp.path()), RomType::UtouchUsbImg);

    fs::create_dir(temp.path().join("boot")).unwrap();
    assert_eq!(rom::classify(false, temp.path()), RomType::AndroidUsbImg);
}

#[test]
fn classify_external_ubuntu_variants() {
    let temp = tempfile::tempdir().unwrap();
    File::create(temp.path().join("root.img")).unwrap();
    assert_eq!(rom::classify(false, temp.path()), RomType::UbuntuUsbImg);

    fs::create_dir(temp.path().join("root")).unwrap();
    assert_eq!(rom::classify(false, temp.path()), RomType::UbuntuUsbDir);
}

#[test]
fn classify_empty_is_unknown() {
    let temp = tempfile::tempdir().unwrap();
    assert_eq!(rom::classify(true, temp.path()), RomType::Unknown);
    assert_eq!(rom::classify(false, temp.path()), RomType::Unknown);
}

#[test]
fn list_puts_internal_first() {
    let temp = tempfile::tempdir().unwrap();
    for dir in ["Zeta", "Alpha", "Internal", ".hidden"] {
        fs::create_dir(temp.path().join(dir)).unwrap();
    }
    File::create(temp.path().join("not-a-dir")).unwrap();

    let names = rom::list(temp.path()).unwrap();
    assert_eq!(names, strings(&["Internal", "Alpha", "Zeta"]));
}

#[test]
fn name_collisions_get_numbered() {
    let existing = strings(&["Internal", "cm-13", "cm-13-1"]);
    assert_eq!(rom::unique_name("cm-13", &existing), "cm-13-2");
}

#[test]
fn name_without_collision_is_kept() {
    let existing = strings(&["Internal"]);
    assert_eq!(rom::unique_name("cm-13", &existing), "cm-13");
}

#[test]
fn long_names_are_truncated() {
    let name = rom::unique_name("a-very-long-rom-name-that-keeps-going", &[]);
    assert_eq!(name.len(), rom::MAX_ROM_NAME);
    assert_eq!(name, "a-very-long-rom-name-that-");
}

#[test]
fn long_name_collision_replaces_tail() {
    let base = "a-very-long-rom-name-that-keeps-going";
    let first = rom::unique_name(base, &[]);
    let second = rom::unique_name(base, &[first.clone()]);

    assert_eq!(second.len(), rom::MAX_ROM_NAME);
    assert_eq!(second, "a-very-long-rom-name-tha-1");
    assert_ne!(second, first);
}

#[test]
fn empty_base_falls_back_to_rom() {
    assert_eq!(rom::unique_name("", &[]), "ROM");
}
