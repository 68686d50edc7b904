// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! ROM type taxonomy and on-disk shape detection.
//!
//! A ROM is a directory under the active roms directory. Its type is the
//! cross product of the OS family and where/how its content is stored:
//! internal storage is always a directory tree, external storage holds
//! either a directory tree or loop-mountable ext4 images.

use std::{cmp::Ordering, io, path::Path};

pub const INTERNAL_ROM: &str = "Internal";
pub const MAX_ROM_NAME: usize = 26;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RomType {
    AndroidInternal,
    AndroidUsbDir,
    AndroidUsbImg,
    UbuntuInternal,
    UbuntuUsbDir,
    UbuntuUsbImg,
    InstallerInternal,
    InstallerUsbDir,
    InstallerUsbImg,
    UtouchInternal,
    UtouchUsbDir,
    UtouchUsbImg,
    Unknown,
}

impl RomType {
    /// The ROM root lives on `/data/media/{,0/}multirom/roms/`.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            Self::AndroidInternal
                | Self::UbuntuInternal
                | Self::InstallerInternal
                | Self::UtouchInternal
        )
    }

    /// Content lives in loop-mounted `*.img` files instead of directories.
    pub fn is_image_backed(self) -> bool {
        matches!(
            self,
            Self::AndroidUsbImg | Self::UbuntuUsbImg | Self::InstallerUsbImg | Self::UtouchUsbImg
        )
    }

    pub fn is_installer(self) -> bool {
        matches!(
            self,
            Self::InstallerInternal | Self::InstallerUsbDir | Self::InstallerUsbImg
        )
    }

    pub fn is_android(self) -> bool {
        matches!(
            self,
            Self::AndroidInternal | Self::AndroidUsbDir | Self::AndroidUsbImg
        )
    }

    pub fn is_ubuntu(self) -> bool {
        matches!(
            self,
            Self::UbuntuInternal | Self::UbuntuUsbDir | Self::UbuntuUsbImg
        )
    }

    pub fn is_utouch(self) -> bool {
        matches!(
            self,
            Self::UtouchInternal | Self::UtouchUsbDir | Self::UtouchUsbImg
        )
    }
}

/// Detect the type of the ROM rooted at `rom_root`. Scripted-installer
/// ROMs share the Ubuntu shapes on disk, so they never come back from
/// detection; their type is only known at install time.
pub fn classify(internal_location: bool, rom_root: &Path) -> RomType {
    let has = |name: &str| rom_root.join(name).exists();

    if internal_location {
        if has("system") && has("data") && has("cache") {
            return if has("boot") {
                RomType::AndroidInternal
            } else {
                RomType::UtouchInternal
            };
        }

        if has("root") {
            return RomType::UbuntuInternal;
        }
    } else {
        if has("system") && has("data") && has("cache") {
            return if has("boot") {
                RomType::AndroidUsbDir
            } else {
                RomType::UtouchUsbDir
            };
        }

        if has("system.img") && has("data.img") && has("cache.img") {
            return if has("boot") {
                RomType::AndroidUsbImg
            } else {
                RomType::UtouchUsbImg
            };
        }

        if has("root") {
            return RomType::UbuntuUsbDir;
        }

        if has("root.img") {
            return RomType::UbuntuUsbImg;
        }
    }

    RomType::Unknown
}

fn rom_order(a: &str, b: &str) -> Ordering {
    if a == INTERNAL_ROM {
        return Ordering::Less;
    }
    if b == INTERNAL_ROM {
        return Ordering::Greater;
    }
    a.cmp(b)
}

/// List the ROM directories under `roms_dir`, "Internal" first, the rest
/// lexicographic. Dotfiles are skipped.
pub fn list(roms_dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in roms_dir.read_dir()? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        names.push(name);
    }

    names.sort_by(|a, b| rom_order(a, b));

    Ok(names)
}

/// Pick a name that does not collide with any existing ROM. The base is
/// truncated to [`MAX_ROM_NAME`]; collision suffixes `-1`, `-2`, … are
/// appended, replacing the tail when the sum would run over the limit.
pub fn unique_name(base: &str, existing: &[String]) -> String {
    let mut name: String = base.chars().take(MAX_ROM_NAME).collect();
    if name.is_empty() {
        name = "ROM".to_string();
    }

    if !existing.iter().any(|e| *e == name) {
        return name;
    }

    for c in 1u32.. {
        let suffix = format!("-{c}");
        let candidate = if name.chars().count() + suffix.len() > MAX_ROM_NAME {
            let keep = MAX_ROM_NAME - suffix.len();
            let head: String = name.chars().take(keep).collect();
            format!("{head}{suffix}")
        } else {
            format!("{name}{suffix}")
        };

        if !existing.iter().any(|e| *e == candidate) {
            return candidate;
        }
    }

    unreachable!()
}
