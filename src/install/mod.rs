// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! ROM installation.
//!
//! `add_rom` allocates the ROM directory skeleton and routes to the
//! pipeline matching the source: a flashable ZIP, a TWRP backup, a Linux
//! rootfs image, a scripted installer bundle, or the Ubuntu Touch
//! two-ZIP pair. Any failure rolls the partially created ROM back.

pub mod android;
pub mod scripted;
pub mod touch;
pub mod ubuntu;

use std::{
    fs::{self, DirBuilder},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    location::INTERNAL_LOCATION,
    rom::{self, RomType},
    runner::CommandExt,
    status, warning,
};

pub use scripted::{HookKind, ScriptedInstaller};

pub const MAX_BASE_FOLDERS: usize = 5;

// Default image sizes in MB.
const SYS_IMG_DEFSIZE: u32 = 640;
const SYS_IMG_MINSIZE: u32 = 450;
const DATA_IMG_DEFSIZE: u32 = 1024;
const DATA_IMG_MINSIZE: u32 = 150;
const CACHE_IMG_DEFSIZE: u32 = 436;
const CACHE_IMG_MINSIZE: u32 = 50;
const TOUCH_DATA_IMG_DEFSIZE: u32 = 2048;
const TOUCH_DATA_IMG_MINSIZE: u32 = 1024;
const UB_DATA_IMG_DEFSIZE: u32 = 4095;
const UB_DATA_IMG_MINSIZE: u32 = 2048;

/// A subdirectory (or loop image) of a ROM's root with its sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseFolder {
    pub name: String,
    pub min_size_mb: u32,
    pub size_mb: u32,
}

impl BaseFolder {
    pub fn new(name: &str, min_size_mb: u32, size_mb: u32) -> Self {
        Self {
            name: name.to_string(),
            min_size_mb,
            size_mb,
        }
    }
}

/// Where a new ROM's content comes from.
#[derive(Clone, Debug)]
pub enum RomSource {
    /// An Android flashable ZIP.
    Zip(PathBuf),
    /// A TWRP backup directory.
    Backup(PathBuf),
    /// A (possibly gzipped, possibly sparse) Linux rootfs image.
    LinuxImage(PathBuf),
    /// A scripted installer bundle; the manifest must be loaded first.
    Scripted,
    /// The Ubuntu Touch device/core ZIP pair.
    UbuntuTouch {
        device_zip: PathBuf,
        core_zip: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InstallOptions {
    /// Boot the new ROM with the kernel of the primary ROM instead of
    /// its own `boot.img`.
    pub share_kernel: bool,
}

impl MultiRom {
    pub fn set_installer(&mut self, installer: Box<dyn ScriptedInstaller>) {
        self.installer = Some(installer);
    }

    pub(crate) fn rom_type_for(&self, source: &RomSource, loc: &str) -> RomType {
        let internal = loc == INTERNAL_LOCATION;
        let ext_fs = loc.contains("(ext");

        macro_rules! pick {
            ($internal:ident, $dir:ident, $img:ident) => {
                if internal {
                    RomType::$internal
                } else if ext_fs {
                    RomType::$dir
                } else {
                    RomType::$img
                }
            };
        }

        match source {
            RomSource::Zip(_) | RomSource::Backup(_) => {
                pick!(AndroidInternal, AndroidUsbDir, AndroidUsbImg)
            }
            RomSource::LinuxImage(_) => pick!(UbuntuInternal, UbuntuUsbDir, UbuntuUsbImg),
            RomSource::Scripted => pick!(InstallerInternal, InstallerUsbDir, InstallerUsbImg),
            RomSource::UbuntuTouch { .. } => pick!(UtouchInternal, UtouchUsbDir, UtouchUsbImg),
        }
    }

    fn base_name_for(&self, source: &RomSource) -> String {
        let stem = |path: &Path| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        match source {
            RomSource::Zip(path) => stem(path),
            RomSource::UbuntuTouch { device_zip, .. } => stem(device_zip),
            RomSource::Backup(path) => {
                let name = path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("bckp_{name}")
            }
            RomSource::LinuxImage(path) => {
                if path.file_name().is_some_and(|n| n == "rootfs.img") {
                    "Ubuntu".to_string()
                } else {
                    stem(path)
                }
            }
            RomSource::Scripted => self
                .installer
                .as_ref()
                .and_then(|i| i.rom_name())
                .unwrap_or_default(),
        }
    }

    fn setup_base_folders(&mut self, source: &RomSource) -> Result<()> {
        self.base_folders.clear();

        let folders = match source {
            RomSource::Scripted => {
                let installer = self.installer.as_ref().ok_or(Error::NoInstaller)?;
                let folders = installer.base_folders();
                folders.into_iter().take(MAX_BASE_FOLDERS).collect()
            }
            RomSource::LinuxImage(_) => {
                vec![BaseFolder::new("root", UB_DATA_IMG_MINSIZE, UB_DATA_IMG_DEFSIZE)]
            }
            RomSource::UbuntuTouch { .. } => vec![
                BaseFolder::new("system", SYS_IMG_MINSIZE, SYS_IMG_DEFSIZE),
                BaseFolder::new("data", TOUCH_DATA_IMG_MINSIZE, TOUCH_DATA_IMG_DEFSIZE),
                BaseFolder::new("cache", CACHE_IMG_MINSIZE, CACHE_IMG_DEFSIZE),
            ],
            RomSource::Zip(_) | RomSource::Backup(_) => vec![
                BaseFolder::new("system", SYS_IMG_MINSIZE, SYS_IMG_DEFSIZE),
                BaseFolder::new("data", DATA_IMG_MINSIZE, DATA_IMG_DEFSIZE),
                BaseFolder::new("cache", CACHE_IMG_MINSIZE, CACHE_IMG_DEFSIZE),
            ],
        };

        for folder in folders {
            if folder.size_mb < folder.min_size_mb {
                return Err(Error::BaseFolderTooSmall {
                    name: folder.name,
                    size: folder.size_mb,
                    min: folder.min_size_mb,
                });
            }

            tracing::debug!(
                "base folder: {} (min: {}MB def: {}MB)",
                folder.name,
                folder.min_size_mb,
                folder.size_mb
            );
            self.base_folders.insert(folder.name.clone(), folder);
        }

        Ok(())
    }

    /// Install a new ROM. On return — success or failure — the install
    /// location is reset to internal storage and the installer manifest
    /// is dropped.
    pub fn add_rom(&mut self, source: RomSource, loc: &str, opts: InstallOptions) -> Result<()> {
        if let Err(e) = self.set_roms_path(loc) {
            let _ = self.set_roms_path(INTERNAL_LOCATION);
            return Err(e);
        }

        let result = self.add_rom_inner(&source, loc, opts);

        rustix::fs::sync();
        let _ = self.set_roms_path(INTERNAL_LOCATION);
        self.installer = None;

        result
    }

    fn add_rom_inner(&mut self, source: &RomSource, loc: &str, opts: InstallOptions) -> Result<()> {
        let existing = self.list_roms()?;
        let base_name = self.base_name_for(source);
        let name = rom::unique_name(&base_name, &existing);

        status!("Installing ROM {}...", name);

        let ty = self.rom_type_for(source, loc);
        self.setup_base_folders(source)?;

        if ty.is_installer() {
            let installer = self.installer.as_ref().ok_or(Error::NoInstaller)?;
            installer
                .check_free_space(self.roms_path()?, ty.is_image_backed())
                .map_err(Error::Hook)?;
        }

        self.create_dirs(&name, ty)?;

        let root = self.roms_path()?.join(&name);
        let result = match source {
            RomSource::Zip(zip) => self.install_android_zip(&name, zip, &root, opts),
            RomSource::Backup(backup) => self.install_from_backup(&name, backup, &root, opts),
            RomSource::LinuxImage(img) => self.install_linux(&name, img, &root, ty),
            RomSource::Scripted => self.install_scripted(&root, ty),
            RomSource::UbuntuTouch {
                device_zip,
                core_zip,
            } => self.install_ubuntu_touch(&name, device_zip, core_zip, &root),
        };

        if result.is_err() {
            status!("Erasing incomplete ROM...");
            if let Err(e) = fs::remove_dir_all(&root) {
                warning!("Failed to erase {:?}: {}", root, e);
            }
        }

        result
    }

    fn create_dirs(&mut self, name: &str, ty: RomType) -> Result<()> {
        let base = self.roms_path()?.join(name);
        DirBuilder::new()
            .mode(0o777)
            .create(&base)
            .map_err(|e| {
                warning!("Failed to create ROM folder!");
                file_err(&base)(e)
            })?;

        status!("Creating folders and images for type {:?}", ty);

        let mkdir = |sub: &str, mode: u32| -> Result<()> {
            let dir = base.join(sub);
            DirBuilder::new().mode(mode).create(&dir).map_err(|e| {
                warning!("Failed to create folder {:?}!", dir);
                file_err(dir)(e)
            })
        };

        match ty {
            RomType::AndroidInternal | RomType::AndroidUsbDir => {
                mkdir("boot", 0o777)?;
                mkdir("system", 0o755)?;
                mkdir("data", 0o771)?;
                mkdir("cache", 0o770)?;
            }
            RomType::UtouchInternal | RomType::UtouchUsbDir => {
                mkdir("system", 0o755)?;
                mkdir("data", 0o771)?;
                mkdir("cache", 0o770)?;
            }
            RomType::AndroidUsbImg => {
                mkdir("boot", 0o777)?;
                self.create_images_from_base(&base)?;
            }
            RomType::UbuntuInternal
            | RomType::UbuntuUsbDir
            | RomType::InstallerInternal
            | RomType::InstallerUsbDir => {
                self.create_dirs_from_base(&base)?;
            }
            RomType::UbuntuUsbImg | RomType::InstallerUsbImg | RomType::UtouchUsbImg => {
                self.create_images_from_base(&base)?;
            }
            RomType::Unknown => {
                warning!("Unknown ROM type!");
                return Err(Error::UnknownRomType(name.to_string()));
            }
        }

        Ok(())
    }

    fn create_dirs_from_base(&self, base: &Path) -> Result<()> {
        for name in self.base_folders.keys() {
            let dir = base.join(name);
            DirBuilder::new().mode(0o777).create(&dir).map_err(|e| {
                warning!("Failed to create folder {:?}!", dir);
                file_err(dir)(e)
            })?;
        }
        Ok(())
    }

    pub(crate) fn create_images_from_base(&self, base: &Path) -> Result<()> {
        for folder in self.base_folders.values() {
            self.create_image(base, &folder.name, folder.size_mb)?;
        }
        Ok(())
    }

    /// `dd` out a zero-filled file and format it as ext4. dd rather than
    /// truncation so running out of space fails here, not at first write.
    fn create_image(&self, base: &Path, name: &str, size_mb: u32) -> Result<()> {
        status!("Creating {}.img...", name);

        let img = base.join(format!("{name}.img"));

        Command::new("dd")
            .arg("if=/dev/zero")
            .arg(format!("of={}", img.display()))
            .arg("bs=1M")
            .arg(format!("count={size_mb}"))
            .run_checked()
            .map_err(|e| {
                warning!("Failed to create {} image, probably not enough space.", name);
                Error::Command(e)
            })?;

        if !img.exists() {
            warning!("Failed to create {} image, probably not enough space.", name);
            return Err(Error::File(
                img,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        Command::new("make_ext4fs")
            .arg("-l")
            .arg(format!("{size_mb}M"))
            .arg(&img)
            .run_checked()?;

        Ok(())
    }
}
