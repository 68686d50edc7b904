// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Deferred post-boot scripts. A running ROM can queue work for the next
//! recovery boot by dropping a script into its cache; at recovery start
//! the newest queued script across all ROMs runs inside that ROM's
//! hijacked mounts.

use std::time::SystemTime;

use rustix::mount::{unmount, UnmountFlags};
use tracing::{info, warn};

use crate::{engine::MultiRom, rom::RomType, status};

const ANDROID_SCRIPT: &str = "cache/recovery/openrecoveryscript";
const UTOUCH_SCRIPT: &str = "cache/recovery/ubuntu_command";

struct QueuedScript {
    mtime: SystemTime,
    name: String,
    ty: RomType,
}

impl MultiRom {
    /// Find and run the newest queued cache script, if any. Failures are
    /// logged, never surfaced; recovery startup must go on.
    pub fn execute_cache_scripts(&mut self) {
        if !self.folder_exists() {
            return;
        }

        let Ok(roms) = self.list_roms() else {
            warn!("Failed to open ROMs folder");
            return;
        };

        let Ok(roms_dir) = self.roms_path().map(|p| p.to_path_buf()) else {
            return;
        };

        let mut newest: Option<QueuedScript> = None;
        for name in roms {
            let Ok(ty) = self.rom_type(&name) else {
                continue;
            };

            let marker = if ty.is_android() {
                ANDROID_SCRIPT
            } else if ty.is_utouch() {
                UTOUCH_SCRIPT
            } else {
                continue;
            };

            let Ok(meta) = roms_dir.join(&name).join(marker).metadata() else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };

            if newest.as_ref().map_or(true, |s| mtime > s.mtime) {
                newest = Some(QueuedScript { mtime, name, ty });
            }
        }

        let Some(script) = newest else {
            return;
        };

        info!("Running script for ROM {}, type {:?}", script.name, script.ty);

        if self.change_mounts(&script.name).is_err() {
            return;
        }

        let mut boot = roms_dir.join(&script.name);
        if self.normalize_rom_path(&mut boot).is_err() {
            self.restore_mounts();
            return;
        }
        boot.push("boot.img");
        let boot = self.translate_to_realdata(&boot);

        if self.fake_boot_partition(&boot).is_err() {
            self.restore_mounts();
            return;
        }

        let mut upgrader_ok = false;
        if script.ty.is_android() {
            if let Err(e) = self.hooks.run_open_recovery_script() {
                warn!("openrecoveryscript failed: {e}");
            }
        } else {
            upgrader_ok = match self.hooks.run_system_image_upgrader() {
                Ok(()) => true,
                Err(e) => {
                    warn!("system-image-upgrader failed: {e}");
                    false
                }
            };
            let _ = unmount("/cache/system", UnmountFlags::DETACH);
        }

        self.restore_boot_partition();
        self.restore_mounts();

        if script.ty.is_utouch() {
            let root = roms_dir.join(&script.name);
            if let Err(e) = self.ubuntu_touch_process_boot(&root, "ubuntu-touch-sysimage-init") {
                warn!("Failed to rebuild Ubuntu Touch boot image: {e}");
            }

            if upgrader_ok {
                status!("SUCCESS, rebooting...");
                self.hooks.request_reboot();
            }
        }
    }
}
