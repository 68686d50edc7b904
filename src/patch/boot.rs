// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Trampoline injection into boot images.
//!
//! The trampoline is an init binary that runs before the ROM's real init
//! and re-execs it as `main_init`. Injection unpacks the ramdisk, swaps
//! `init` for the trampoline, relinks `ueventd`/`watchdogd` (which are
//! normally symlinks to `init`) at the original binary, and repacks.

use std::{
    fs::{self, Permissions},
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
    process::Command,
};

use bstr::ByteSlice;
use tracing::{debug, warn};

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    format::{bootimg::BootImage, ramdisk},
    runner::CommandExt,
    status, warning,
};

/// Files carried from the ramdisk into a ROM's `boot/` directory. The
/// SELinux set is needed since Android 4.3.
const BOOT_KEEP_EXACT: &[&str] = &[
    "default.prop",
    "init",
    "main_init",
    "file_contexts",
    "property_contexts",
    "seapp_contexts",
    "sepolicy",
];

impl MultiRom {
    /// Version of the trampoline shipped in the MultiROM root.
    pub fn trampoline_version(&self) -> Option<i32> {
        let base = self.base.as_ref()?;
        self.trampoline_version_of(&base.join("trampoline"), false)
    }

    /// Ask a trampoline binary for its version. The binary is only
    /// executed when it actually looks like a trampoline.
    pub fn trampoline_version_of(&self, path: &Path, silent: bool) -> Option<i32> {
        let report = |msg: &str| {
            if !silent {
                warning!("{}", msg);
            }
        };

        let Ok(bytes) = fs::read(path) else {
            report("Failed to get trampoline version!");
            return None;
        };

        if bytes.find(b"Running trampoline").is_none() {
            report("Failed to get trampoline version!");
            return None;
        }

        let Ok(out) = Command::new(path).arg("-v").run_capture() else {
            report("Failed to get trampoline version!");
            return None;
        };

        match out.trim().parse() {
            Ok(version) => Some(version),
            Err(_) => {
                report("Failed to get trampoline version!");
                None
            }
        }
    }

    /// Inject the device trampoline into the boot image at `img_path`.
    /// With `only_if_older`, an image that already carries an
    /// equal-or-newer trampoline is left alone.
    pub fn inject_boot(&mut self, img_path: &Path, only_if_older: bool) -> Result<()> {
        let trampoline = self.base_path()?.join("trampoline");
        if !trampoline.exists() {
            warning!("{:?} not found!", trampoline);
            return Err(Error::TrampolineMissing(trampoline));
        }

        let scratch = self.dev.boot_scratch();
        let _ = fs::remove_dir_all(&scratch);
        fs::create_dir_all(&scratch).map_err(file_err(&scratch))?;

        let result = self.inject_boot_inner(img_path, only_if_older, &trampoline, &scratch);
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn inject_boot_inner(
        &mut self,
        img_path: &Path,
        only_if_older: bool,
        trampoline: &Path,
        scratch: &Path,
    ) -> Result<()> {
        status!("Extracting boot image...");
        let mut img = BootImage::load(img_path)?;

        let initrd = scratch.join("initrd.img");
        fs::write(&initrd, &img.ramdisk).map_err(file_err(&initrd))?;

        status!("Decompressing ramdisk...");
        let rd = scratch.join("rd");
        fs::create_dir_all(&rd).map_err(file_err(&rd))?;
        let format = ramdisk::unpack(&initrd, &rd)?;

        if only_if_older {
            let rd_ver = self.trampoline_version_of(&rd.join("init"), true);
            let my_ver = self.trampoline_version();

            if let (Some(rd_ver), Some(my_ver)) = (rd_ver, my_ver) {
                if rd_ver >= my_ver {
                    status!(
                        "No need to inject bootimg, it has the newest trampoline (v{})",
                        rd_ver
                    );
                    return Ok(());
                }
            }
        }

        status!("Copying trampoline...");
        if !rd.join("main_init").exists() {
            fs::rename(rd.join("init"), rd.join("main_init"))
                .map_err(file_err(rd.join("init")))?;
        }

        fs::copy(trampoline, rd.join("init")).map_err(file_err(rd.join("init")))?;
        fs::set_permissions(rd.join("init"), Permissions::from_mode(0o750))
            .map_err(file_err(rd.join("init")))?;

        let sbin = rd.join("sbin");
        fs::create_dir_all(&sbin).map_err(file_err(&sbin))?;
        for link in ["ueventd", "watchdogd"] {
            let path = sbin.join(link);
            let _ = fs::remove_file(&path);
            symlink("../main_init", &path).map_err(file_err(path))?;
        }

        if self.dev.copy_mrom_fstab {
            let fstab = self.base_path()?.join("mrom.fstab");
            if let Err(e) = fs::copy(&fstab, rd.join("mrom.fstab")) {
                warn!("Failed to copy {fstab:?}: {e}");
            }
        }

        status!("Compressing ramdisk...");
        ramdisk::pack(&rd, &initrd, format)?;

        status!("Packing boot image");
        img.ramdisk = fs::read(&initrd).map_err(file_err(&initrd))?;

        if let Some(addr) = self.dev.ramdisk_addr {
            img.ramdisk_addr = addr;
        }

        let to_boot_dev = self.boot_dev.as_deref() == Some(img_path);
        if !to_boot_dev {
            // Stamp the header so flash-kernel derivatives can tell this
            // image was already processed. Never on the real partition.
            if let Some(version) = self.trampoline_version() {
                img.set_name(&format!("tr_ver{version}"));
            }
        }

        let newboot = self.dev.tmp.join("newboot.img");
        img.save(&newboot)?;

        if to_boot_dev {
            Command::new("dd")
                .arg("bs=4096")
                .arg(format!("if={}", newboot.display()))
                .arg(format!("of={}", img_path.display()))
                .run_checked()?;
        } else {
            fs::copy(&newboot, img_path).map_err(file_err(img_path))?;
        }

        Ok(())
    }

    /// Unpack the ramdisk of `<base>/boot.img` into `<base>/boot/` and
    /// keep the init files the trampoline needs at boot selection time.
    /// In share-kernel mode the boot image itself is discarded instead of
    /// getting the trampoline.
    pub fn extract_boot_for_rom(&mut self, base: &Path, share_kernel: bool) -> Result<()> {
        status!("Extracting contents of boot.img...");

        let boot_img = base.join("boot.img");
        let img = BootImage::load(&boot_img)?;

        let boot_dir = base.join("boot");
        crate::util::clear_dir(&boot_dir).map_err(file_err(&boot_dir))?;
        fs::create_dir_all(&boot_dir).map_err(file_err(&boot_dir))?;

        let initrd = boot_dir.join("initrd.img");
        fs::write(&initrd, &img.ramdisk).map_err(file_err(&initrd))?;

        let scratch = self.dev.boot_scratch();
        let _ = fs::remove_dir_all(&scratch);
        fs::create_dir_all(&scratch).map_err(file_err(&scratch))?;

        let result = (|| -> Result<()> {
            ramdisk::unpack(&initrd, &scratch)?;

            for entry in fs::read_dir(&scratch).map_err(file_err(&scratch))? {
                let entry = entry.map_err(file_err(&scratch))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();

                let keep = BOOT_KEEP_EXACT.contains(&name.as_ref())
                    || name.ends_with(".rc")
                    || name.starts_with("fstab.");
                if !keep {
                    continue;
                }

                debug!("Keeping boot file {name}");
                fs::copy(entry.path(), boot_dir.join(name.as_ref()))
                    .map_err(file_err(entry.path()))?;
            }

            Ok(())
        })();

        let _ = fs::remove_dir_all(&scratch);
        result?;

        if !boot_dir.join("main_init").exists() {
            fs::rename(boot_dir.join("init"), boot_dir.join("main_init"))
                .map_err(file_err(boot_dir.join("init")))?;
        }

        // Leftovers from older MultiROM versions.
        for stale in ["cmdline", "ramdisk.gz", "zImage"] {
            let _ = fs::remove_file(boot_dir.join(stale));
        }

        if share_kernel {
            fs::remove_file(&boot_img).map_err(file_err(&boot_img))?;
        } else {
            status!("Injecting boot.img..");
            self.inject_boot(&boot_img, false)?;
        }

        Ok(())
    }
}
