// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Android pipelines: flashing a ZIP into a sandboxed ROM, and restoring
//! a TWRP backup into one.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    install::InstallOptions,
    runner::CommandExt,
    status, updater, warning,
};

impl MultiRom {
    pub(crate) fn install_android_zip(
        &mut self,
        name: &str,
        zip: &Path,
        root: &Path,
        opts: InstallOptions,
    ) -> Result<()> {
        self.flash_zip(name, zip)?;
        self.extract_boot_for_rom(root, opts.share_kernel)
    }

    /// Flash a ZIP into a ROM's sandbox: sanitize the updater-script,
    /// hijack the mounts and the boot partition, hand over to the ZIP
    /// install engine, and put everything back.
    pub fn flash_zip(&mut self, rom: &str, file: &Path) -> Result<()> {
        status!("Flashing ZIP file {}", file.display());
        status!("ROM: {}", rom);

        status!("Preparing ZIP file...");
        let boot_dev = self.boot_dev()?.to_path_buf();
        let sanitized = updater::sanitize(file, &self.dev.tmp, &boot_dev)?;

        self.with_rom_mounts(rom, |eng| {
            let mut boot = eng.roms_path()?.join(rom);
            eng.normalize_rom_path(&mut boot)?;
            boot.push("boot.img");

            let zip_path = eng.translate_to_realdata(&sanitized.path);
            let boot = eng.translate_to_realdata(&boot);

            eng.fake_boot_partition(&boot)?;

            let result = (|| -> Result<()> {
                if sanitized.format_system {
                    status!("Clearing ROM's /system dir");
                    let _ = Command::new("chattr")
                        .args(["-R", "-i", "/system"])
                        .run_ok();
                    crate::util::clear_dir(Path::new("/system"))
                        .map_err(file_err("/system"))?;
                }

                eng.hooks
                    .install_zip(&zip_path)
                    .map_err(|e| {
                        warning!("Failed to install ZIP!");
                        Error::Hook(e)
                    })
                    .map(|()| status!("ZIP successfully installed"))
            })();

            if sanitized.path == eng.dev.tmp.join(updater::SANITIZED_ZIP_NAME) {
                let _ = fs::remove_file(&sanitized.path);
            }

            eng.restore_boot_partition();
            result
        })
    }

    pub(crate) fn install_from_backup(
        &mut self,
        name: &str,
        backup: &Path,
        root: &Path,
        opts: InstallOptions,
    ) -> Result<()> {
        if !backup.join("boot.emmc.win").exists() {
            warning!("Backup must contain boot image!");
            return Err(Error::BackupIncomplete("boot image"));
        }

        let mut has_system = false;
        let mut has_data = false;
        for entry in backup.read_dir().map_err(file_err(backup))? {
            let entry = entry.map_err(file_err(backup))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            if file_name.contains("system.ext4") {
                has_system = true;
            } else if file_name.contains("data.ext4") {
                has_data = true;
            }
        }

        if !has_system {
            warning!("Backup must contain system image!");
            return Err(Error::BackupIncomplete("system image"));
        }

        fs::copy(backup.join("boot.emmc.win"), root.join("boot.img"))
            .map_err(file_err(backup.join("boot.emmc.win")))?;

        self.extract_boot_for_rom(root, opts.share_kernel)?;

        let backup = backup.to_path_buf();
        self.with_rom_mounts(name, move |eng| {
            // The real /data is mounted at /realdata now.
            let backup = if backup.starts_with("/data/media") {
                let rest = backup.strip_prefix("/data").unwrap();
                eng.dev.realdata.join(rest)
            } else {
                backup
            };

            extract_backup_file(&backup, "system")?;
            if has_data {
                extract_backup_file(&backup, "data")?;
            }
            Ok(())
        })
    }
}

/// Extract one partition's backup archive into the hijacked mounts.
/// Supports both a monolithic `<part>.ext4.win` and a split
/// `<part>.ext4.win000`, `…001`, … series.
fn extract_backup_file(backup: &Path, part: &str) -> Result<()> {
    status!("Extracting backup of {} partition...", part);

    let filename = format!("{part}.ext4.win");
    let full_path = backup.join(&filename);

    if full_path.exists() {
        return Command::new("gnutar")
            .arg("-xf")
            .arg(&full_path)
            .arg("-C")
            .arg(format!("/{part}"))
            .run_checked()
            .map_err(Error::Command);
    }

    // Split archives extract relative to /, they carry the partition
    // directory in their paths.
    let mut index = 0u32;
    let mut split: PathBuf;
    loop {
        split = backup.join(format!("{filename}{index:03}"));
        if !split.exists() {
            break;
        }

        status!("Restoring archive #{}...", index + 1);
        Command::new("gnutar")
            .arg("-xf")
            .arg(&split)
            .args(["-C", "/"])
            .run_checked()?;

        index += 1;
    }

    if index == 0 {
        warning!("Failed to locate backup file {:?}", split);
        return Err(Error::BackupArchiveMissing(split));
    }

    Ok(())
}
