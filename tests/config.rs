// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::fs;

use multirom::config::Config;

#[test]
fn missing_file_yields_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let cfg = Config::load(&temp.path().join("multirom.ini"), 90);

    assert_eq!(cfg, Config::new(90));
    assert_eq!(cfg.current_rom, "Internal");
    assert_eq!(cfg.auto_boot_seconds, 5);
    assert_eq!(cfg.brightness, 40);
    assert_eq!(cfg.rotation, 90);
}

#[test]
fn round_trips_through_save_and_load() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("multirom.ini");

    let mut cfg = Config::new(0);
    cfg.current_rom = "CyanogenMod".to_string();
    cfg.auto_boot_seconds = 12;
    cfg.auto_boot_rom = "Ubuntu".to_string();
    cfg.colors = 2;
    cfg.brightness = 80;
    cfg.enable_adb = 1;
    cfg.hide_internal = 1;
    cfg.int_display_name = "Primary".to_string();
    cfg.rotation = 270;

    cfg.save(&path);
    assert_eq!(Config::load(&path, 0), cfg);
}

#[test]
fn unknown_keys_and_noise_are_tolerated() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("multirom.ini");

    fs::write(
        &path,
        "\n\
         current_rom=Slim\n\
         some_future_key=whatever\n\
         brightness=55   \n\
         not a key value line\n\
         auto_boot_seconds=oops\n",
    )
    .unwrap();

    let cfg = Config::load(&path, 0);
    assert_eq!(cfg.current_rom, "Slim");
    assert_eq!(cfg.brightness, 55);
    // Unparsable integers keep their defaults.
    assert_eq!(cfg.auto_boot_seconds, 5);
}

#[test]
fn save_emits_all_fields_in_canonical_order() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("multirom.ini");

    Config::new(0).save(&path);
    let data = fs::read_to_string(&path).unwrap();

    let keys: Vec<&str> = data
        .lines()
        .map(|l| l.split_once('=').unwrap().0)
        .collect();
    assert_eq!(
        keys,
        [
            "current_rom",
            "auto_boot_seconds",
            "auto_boot_rom",
            "colors",
            "brightness",
            "enable_adb",
            "hide_internal",
            "int_display_name",
            "rotation",
        ]
    );
}
