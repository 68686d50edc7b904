// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Install-location enumeration and selection. External USB storage is
//! mounted at a stable directory under `/mnt` with a filesystem-specific
//! helper; "Internal memory" selects `<root>/roms/`.

use std::{fs, process::Command};

use rustix::mount::{unmount, UnmountFlags};

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    runner::CommandExt,
    status,
};

pub const INTERNAL_LOCATION: &str = "Internal memory";

impl MultiRom {
    /// One line per candidate target: `"Internal memory"`, then
    /// `"<device> (<fs>)"` for every external block device blkid knows.
    pub fn list_install_locations(&self) -> Result<String> {
        let mut out = format!("{INTERNAL_LOCATION}\n");

        let Ok(blkid) = Command::new("blkid").run_capture() else {
            return Ok(out);
        };
        let _ = fs::write(self.dev.tmp.join("blkid.txt"), &blkid);

        for line in blkid.lines() {
            if !line.contains("/dev/block/sd") {
                continue;
            }

            let Some((dev, rest)) = line.split_once(':') else {
                continue;
            };

            let Some(idx) = rest.find("TYPE=\"") else {
                continue;
            };
            let fs_tag = &rest[idx + "TYPE=\"".len()..];
            let Some((fs_tag, _)) = fs_tag.split_once('"') else {
                continue;
            };

            out.push_str(&format!("{dev} ({fs_tag})\n"));
        }

        Ok(out)
    }

    /// Select where new ROMs go and where existing ones are looked up.
    /// Whatever was last mounted at `/mnt` is unmounted first.
    pub fn set_roms_path(&mut self, loc: &str) -> Result<()> {
        let _ = unmount(self.dev.mnt.as_path(), UnmountFlags::empty());

        if loc == INTERNAL_LOCATION {
            let base = self.base_path()?;
            self.roms_dir = Some(base.join("roms"));
            return Ok(());
        }

        let Some((device, _)) = loc.split_once(' ') else {
            self.roms_dir = None;
            return Err(Error::BadLocation(loc.to_string()));
        };

        self.mkdir_0777(&self.dev.mnt)
            .map_err(file_err(&self.dev.mnt))?;

        let mut cmd = if loc.contains("(ntfs") {
            let mut cmd = Command::new("ntfs-3g");
            cmd.arg(device).arg(&self.dev.mnt);
            cmd
        } else if loc.contains("(exfat)") {
            let mut cmd = Command::new("exfat-fuse");
            cmd.args(["-o", "big_writes,max_read=131072,max_write=131072,nonempty"])
                .arg(device)
                .arg(&self.dev.mnt);
            cmd
        } else {
            let mut cmd = Command::new("mount");
            cmd.arg(device).arg(&self.dev.mnt);
            cmd
        };

        cmd.run_checked()
            .map_err(|e| Error::LocationMount(loc.to_string(), e))?;

        let dir = self.dev.mnt.join(format!("multirom-{}", self.dev.device));
        self.mkdir_0777(&dir).map_err(file_err(&dir))?;
        self.roms_dir = Some(dir);

        status!("Install location set to {}", loc);
        Ok(())
    }
}
