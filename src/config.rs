// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The `multirom.ini` settings file: flat `key=value` lines with a fixed
//! schema. Unknown keys are ignored on read and absent keys keep their
//! defaults, so old and new builds can share the file.

use std::{fmt::Write as _, fs, path::Path};

use tracing::warn;

use crate::rom::INTERNAL_ROM;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub current_rom: String,
    pub auto_boot_seconds: i32,
    pub auto_boot_rom: String,
    pub colors: i32,
    pub brightness: i32,
    pub enable_adb: i32,
    pub hide_internal: i32,
    pub int_display_name: String,
    pub rotation: i32,
}

impl Config {
    pub fn new(default_rotation: i32) -> Self {
        Self {
            current_rom: INTERNAL_ROM.to_string(),
            auto_boot_seconds: 5,
            auto_boot_rom: INTERNAL_ROM.to_string(),
            colors: 0,
            brightness: 40,
            enable_adb: 0,
            hide_internal: 0,
            int_display_name: INTERNAL_ROM.to_string(),
            rotation: default_rotation,
        }
    }

    /// Load from `path`. A missing or unreadable file yields the defaults.
    pub fn load(path: &Path, default_rotation: i32) -> Self {
        let mut cfg = Self::new(default_rotation);

        let Ok(data) = fs::read_to_string(path) else {
            return cfg;
        };

        for line in data.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim_end();

            let int = |field: &mut i32| {
                if let Ok(v) = value.trim().parse() {
                    *field = v;
                }
            };

            match name {
                "current_rom" => cfg.current_rom = value.to_string(),
                "auto_boot_seconds" => int(&mut cfg.auto_boot_seconds),
                "auto_boot_rom" => cfg.auto_boot_rom = value.to_string(),
                "colors" => int(&mut cfg.colors),
                "brightness" => int(&mut cfg.brightness),
                "enable_adb" => int(&mut cfg.enable_adb),
                "hide_internal" => int(&mut cfg.hide_internal),
                "int_display_name" => cfg.int_display_name = value.to_string(),
                "rotation" => int(&mut cfg.rotation),
                _ => {}
            }
        }

        cfg
    }

    /// Write every field in canonical order. Failures are logged but not
    /// surfaced; the recovery keeps running with the in-memory settings.
    pub fn save(&self, path: &Path) {
        let mut out = String::new();
        let _ = writeln!(out, "current_rom={}", self.current_rom);
        let _ = writeln!(out, "auto_boot_seconds={}", self.auto_boot_seconds);
        let _ = writeln!(out, "auto_boot_rom={}", self.auto_boot_rom);
        let _ = writeln!(out, "colors={}", self.colors);
        let _ = writeln!(out, "brightness={}", self.brightness);
        let _ = writeln!(out, "enable_adb={}", self.enable_adb);
        let _ = writeln!(out, "hide_internal={}", self.hide_internal);
        let _ = writeln!(out, "int_display_name={}", self.int_display_name);
        let _ = writeln!(out, "rotation={}", self.rotation);

        if let Err(e) = fs::write(path, out) {
            warn!("Failed to write {path:?}: {e}");
        }
    }
}
