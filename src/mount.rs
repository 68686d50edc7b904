// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The mount hijack transaction.
//!
//! `change_mounts` rewires the partition table so that `/system`, `/data`
//! and `/cache` point into the chosen ROM's sandbox while the real
//! userdata reappears as `/realdata`. Everything that runs in between —
//! ZIP installs, backup extraction, wipes — sees only the sandbox.
//! `restore_mounts` is the symmetric teardown; it is best-effort on every
//! step because it also runs when the device is already in a half-broken
//! state.

use std::fs;

use rustix::mount::{unmount, UnmountFlags};
use tracing::warn;

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    partition::{Partition, Snapshot},
    status, warning,
};

impl MultiRom {
    /// Run `f` between a mount hijack and its restore. The restore runs
    /// no matter how `f` exits; a failed hijack has already rolled itself
    /// back.
    pub fn with_rom_mounts<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut MultiRom) -> Result<T>,
    ) -> Result<T> {
        self.change_mounts(name)?;
        let result = f(self);
        self.restore_mounts();
        result
    }

    fn rollback(&mut self, snapshot: Snapshot) {
        self.partitions.restore(snapshot);
        self.partitions.refresh();
    }

    pub(crate) fn change_mounts(&mut self, name: &str) -> Result<()> {
        status!("Changing mounts to ROM {}...", name);

        let ty = self.rom_type(name)?;
        if ty == crate::rom::RomType::Unknown {
            return Err(Error::UnknownRomType(name.to_string()));
        }

        let mut base = self.roms_path()?.join(name);
        self.normalize_rom_path(&mut base)?;

        let realdata_mp = self.dev.realdata.to_string_lossy().into_owned();
        if ty.is_internal() {
            // The sandbox lives on userdata, which is about to move.
            if let Ok(rest) = base.strip_prefix("/data") {
                base = self.dev.realdata.join(rest);
            }
        }

        rustix::fs::sync();
        self.mkdir_0777(&self.dev.realdata)
            .map_err(file_err(&self.dev.realdata))?;

        let snapshot = self.partitions.snapshot();

        for mp in ["/system", "/cache"] {
            let _ = self.partitions.unmount(mp);
            self.partitions.remove(mp);
        }

        let Some(mut realdata) = self.partitions.remove("/data") else {
            warning!("Failed to find data or boot device!");
            self.base = None;
            self.rollback(snapshot);
            return Err(Error::DataPartitionMissing);
        };

        let _ = self.partitions.unmount("/data");

        let fs_type = realdata.fs_type.clone();

        let rebase = |field: &str| -> String {
            match field.strip_prefix("/data") {
                Some(rest) => format!("{realdata_mp}{rest}"),
                None => field.to_string(),
            }
        };

        realdata.display_name = "Realdata".to_string();
        realdata.symlink_path = rebase(&realdata.symlink_path);
        realdata.storage_path = rebase(&realdata.storage_path);
        realdata.mount_point = realdata_mp.clone();
        realdata.can_be_backed_up = false;
        self.partitions.insert(realdata);

        // Point the recovery's storage browser at the real filesystem.
        let internal = self.data.internal_path();
        if internal.starts_with("/data/media") {
            self.data.set_internal_path(&rebase(&internal));
        }
        let storage = self.data.storage_path();
        if storage.starts_with("/data/media") {
            self.data.set_storage_path(&rebase(&storage));
        }

        if let Err(e) = self.partitions.mount(&realdata_mp) {
            warning!("Failed to mount realdata, canceling!");
            self.rollback(snapshot);
            return Err(Error::PartitionMount(realdata_mp, e));
        }

        let mut fakes = if !ty.is_image_backed() {
            ["data", "system", "cache"].map(|sub| {
                Partition::bind(&format!("/{sub}"), &fs_type, base.join(sub))
            })
        } else {
            ["data", "system", "cache"].map(|sub| {
                Partition::image(&format!("/{sub}"), &fs_type, base.join(format!("{sub}.img")))
            })
        };

        // The fake /data has to look like a regular data partition so a
        // subsequent backup picks it up.
        fakes[0].display_name = "Data".to_string();
        fakes[0].backup_name = "data".to_string();
        fakes[0].can_be_backed_up = true;

        for fake in fakes {
            self.partitions.insert(fake);
        }

        if let Err(e) = self.partitions.write_fstab() {
            warn!("Failed to write fstab: {e}");
        }

        for mp in ["/data", "/system", "/cache"] {
            if let Err(e) = self.partitions.mount(mp) {
                warning!("Failed to mount fake partitions, canceling!");
                for undo in ["/data", "/system", "/cache", realdata_mp.as_str()] {
                    let _ = self.partitions.unmount(undo);
                }
                self.rollback(snapshot);
                self.undo_storage_paths();
                return Err(Error::PartitionMount(mp.to_string(), e));
            }
        }

        // We really don't want scripts to be able to write to real
        // partitions.
        let umount_bin = self.dev.sbin.join("umount");
        if let Err(e) = fs::rename(&umount_bin, self.dev.sbin.join("umount.bak")) {
            warn!("Failed to hide {umount_bin:?}: {e}");
        }

        self.mount_snapshot = Some(snapshot);
        Ok(())
    }

    fn mtab_mentions(&self, targets: &[&str]) -> bool {
        let Ok(mtab) = fs::read_to_string(&self.dev.mtab) else {
            return false;
        };

        targets.iter().any(|t| mtab.contains(t))
    }

    fn undo_storage_paths(&mut self) {
        let realdata_mp = self.dev.realdata.to_string_lossy().into_owned();
        let realdata_media = format!("{realdata_mp}/media");

        let unbase = |field: &str| -> Option<String> {
            field
                .strip_prefix(realdata_mp.as_str())
                .map(|rest| format!("/data{rest}"))
        };

        let internal = self.data.internal_path();
        if internal.starts_with(&realdata_media) {
            if let Some(path) = unbase(&internal) {
                self.data.set_internal_path(&path);
            }
        }
        let storage = self.data.storage_path();
        if storage.starts_with(&realdata_media) {
            if let Some(path) = unbase(&storage) {
                self.data.set_storage_path(&path);
            }
        }
    }

    pub(crate) fn restore_mounts(&mut self) {
        status!("Restoring mounts...");

        let umount_bak = self.dev.sbin.join("umount.bak");
        if umount_bak.exists() {
            let _ = fs::rename(&umount_bak, self.dev.sbin.join("umount"));
        }

        rustix::fs::sync();

        // Scripts may have mounted these several times over; we _have_ to
        // unmount it all, but never spin forever on a stuck mount.
        let realdata_mp = self.dev.realdata.to_string_lossy().into_owned();
        let targets = ["/data", "/system", "/cache", "/sdcard", realdata_mp.as_str()];
        let mut attempts = 0;
        while attempts <= 10 && self.mtab_mentions(&targets) {
            attempts += 1;
            for target in ["/system", "/data", "/cache", "/sdcard", realdata_mp.as_str()] {
                let _ = unmount(target, UnmountFlags::DETACH);
            }
        }

        if let Some(snapshot) = self.mount_snapshot.take() {
            self.partitions.restore(snapshot);
        }
        self.partitions.refresh();

        let _ = self.partitions.mount("/data");
        let _ = self.partitions.mount("/cache");

        self.undo_storage_paths();

        self.restore_rom_path();
    }
}
