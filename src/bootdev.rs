// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The boot partition hijack.
//!
//! During a hijacked flash the boot block device node is replaced with a
//! symlink to a regular file inside the ROM, so whatever the ZIP writes
//! to "the boot partition" lands in the ROM's `boot.img`. A breadcrumb in
//! `/tmp` lets the next recovery start repair the device node if we
//! crash in between.

use std::{
    fs::{self, File},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::warn;

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    runner::CommandExt,
    status, warning,
};

fn orig_path(boot_dev: &Path) -> PathBuf {
    let mut os = boot_dev.as_os_str().to_os_string();
    os.push("-orig");
    PathBuf::from(os)
}

impl MultiRom {
    /// Replace the boot block device with a symlink to `fake_img`.
    /// Refuses to nest. If `fake_img` does not exist yet, it is seeded
    /// with the current boot partition contents so ZIPs that patch the
    /// existing image keep working.
    pub fn fake_boot_partition(&mut self, fake_img: &Path) -> Result<()> {
        let boot_dev = self.boot_dev()?.to_path_buf();
        let orig = orig_path(&boot_dev);

        if orig.exists() {
            warning!("Failed to fake boot partition, {:?} already exists!", orig);
            return Err(Error::BootAlreadyHijacked(orig));
        }

        if !fake_img.exists() {
            File::create(fake_img).map_err(|e| {
                warning!("Failed to create fake boot image file {:?}!", fake_img);
                file_err(fake_img)(e)
            })?;

            if Command::new("dd")
                .arg(format!("if={}", boot_dev.display()))
                .arg(format!("of={}", fake_img.display()))
                .run_ok()
            {
                status!("Current boot sector was used as base for fake boot.img!");
            }
        }

        let breadcrumb = self.dev.breadcrumb();
        fs::write(&breadcrumb, format!("{}\n", boot_dev.display()))
            .map_err(file_err(breadcrumb))?;

        fs::rename(&boot_dev, &orig).map_err(file_err(&boot_dev))?;
        symlink(fake_img, &boot_dev).map_err(file_err(&boot_dev))?;

        Ok(())
    }

    pub fn restore_boot_partition(&mut self) {
        let Ok(boot_dev) = self.boot_dev() else {
            warn!("No boot device known, nothing to restore");
            return;
        };
        let boot_dev = boot_dev.to_path_buf();
        let orig = orig_path(&boot_dev);

        if !orig.exists() {
            warning!(
                "Failed to restore boot partition, {:?} does not exist!",
                orig
            );
            return;
        }

        let _ = fs::remove_file(&boot_dev);
        if let Err(e) = fs::rename(&orig, &boot_dev) {
            warn!("Failed to move {orig:?} back to {boot_dev:?}: {e}");
        }
        let _ = fs::remove_file(self.dev.breadcrumb());
    }

    /// Crash recovery, run at every recovery start. If the breadcrumb
    /// says a hijack was in flight and the device node is still the fake
    /// (a symlink, a leftover regular file, or gone entirely) while the
    /// preserved `-orig` node exists, put the real node back. No-op
    /// otherwise, and idempotent.
    pub fn failsafe_check_boot_partition(&mut self) {
        let breadcrumb = self.dev.breadcrumb();
        let Ok(contents) = fs::read_to_string(&breadcrumb) else {
            return;
        };

        let dev = PathBuf::from(contents.trim());
        if dev.as_os_str().is_empty() {
            return;
        }

        let orig = orig_path(&dev);
        if !orig.exists() {
            return;
        }

        if let Ok(meta) = fs::symlink_metadata(&dev) {
            let ft = meta.file_type();
            if !ft.is_symlink() && !ft.is_file() {
                // The real block node is already in place.
                return;
            }
        }

        status!("Restoring original boot device!");
        status!("Recovery has probably crashed in the middle of MultiROM operation.");

        let _ = fs::remove_file(&dev);
        if let Err(e) = fs::rename(&orig, &dev) {
            warn!("Failed to move {orig:?} back to {dev:?}: {e}");
        }
        let _ = fs::remove_file(&breadcrumb);
    }
}
