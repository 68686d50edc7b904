// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Ubuntu Touch pipeline. Two ZIPs are flashed into the sandbox (the
//! core ZIP needs GNU tar, so `/sbin/tar` is swapped for the duration),
//! then the boot image gets the Ubuntu Touch ramdisk overlay and the
//! Android LXC container is rigged to bind-mount the sandbox.

use std::{
    fs::{self, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
};

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    format::bootimg::BootImage,
    format::ramdisk,
    partition,
    status, util, warning,
};

/// Appended to the LXC container's pre-start hook so the Android side
/// sees the ROM's data/system/cache instead of the real partitions.
const LXC_PRE_START: &str = r#"if [ "$INITRD" = "/boot/android-ramdisk.img" ]; then
    sed -i "/mount_all /d" $LXC_ROOTFS_PATH/init.*.rc
    sed -i "/on nonencrypted/d" $LXC_ROOTFS_PATH/init.rc
    folders="data system cache"
    for dir in $folders; do
        mkdir -p $LXC_ROOTFS_PATH/$dir
        mount -n -o bind,recurse /mrom_dir/$dir $LXC_ROOTFS_PATH/$dir
    done
fi
"#;

impl MultiRom {
    pub(crate) fn install_ubuntu_touch(
        &mut self,
        name: &str,
        device_zip: &Path,
        core_zip: &Path,
        root: &Path,
    ) -> Result<()> {
        status!("Flashing device zip...");
        self.flash_zip(name, device_zip)?;

        status!("Flashing core zip...");
        let tar = self.dev.sbin.join("tar");
        let _ = fs::remove_file(&tar);
        symlink(self.dev.sbin.join("gnutar"), &tar).map_err(file_err(&tar))?;

        let flashed = self.flash_zip(name, core_zip);

        let _ = fs::remove_file(&tar);
        if let Err(e) = symlink(self.dev.sbin.join("busybox"), &tar) {
            warning!("Failed to restore {:?}: {}", tar, e);
        }

        flashed?;

        self.ubuntu_touch_process_boot(root, "ubuntu-touch-init")?;
        self.ubuntu_touch_finalize(root, name)
    }

    /// Rebuild the ROM's boot image with one of the Ubuntu Touch ramdisk
    /// overlays. Scratch files are removed on every exit path.
    pub(crate) fn ubuntu_touch_process_boot(
        &mut self,
        root: &Path,
        overlay_dir: &str,
    ) -> Result<()> {
        status!("Processing boot.img for Ubuntu Touch");

        let tmp_img = self.dev.tmp.join("boot.img");
        let scratch = self.dev.boot_scratch();

        let _ = fs::remove_file(&tmp_img);
        fs::copy(root.join("boot.img"), &tmp_img).map_err(|e| {
            warning!("boot.img was not found!");
            file_err(root.join("boot.img"))(e)
        })?;

        let _ = fs::remove_dir_all(&scratch);
        let result = (|| -> Result<()> {
            fs::create_dir_all(&scratch).map_err(file_err(&scratch))?;

            status!("Extracting boot image...");
            let mut img = BootImage::load(&tmp_img)?;

            let initrd = scratch.join("initrd.img");
            fs::write(&initrd, &img.ramdisk).map_err(file_err(&initrd))?;
            let kernel = scratch.join("zImage");
            fs::write(&kernel, &img.kernel).map_err(file_err(&kernel))?;

            status!("Decompressing ramdisk...");
            let rd = scratch.join("rd");
            fs::create_dir_all(&rd).map_err(file_err(&rd))?;
            let format = ramdisk::unpack(&initrd, &rd)?;

            let overlay = self.base_path()?.join(overlay_dir);
            util::copy_tree(&overlay, &rd).map_err(file_err(overlay))?;
            fs::set_permissions(rd.join("init"), Permissions::from_mode(0o755))
                .map_err(file_err(rd.join("init")))?;

            status!("Compressing ramdisk...");
            ramdisk::pack(&rd, &initrd, format)?;

            fs::copy(&initrd, root.join("initrd.img")).map_err(file_err(&initrd))?;
            fs::copy(&kernel, root.join("zImage")).map_err(file_err(&kernel))?;

            img.ramdisk = fs::read(&initrd).map_err(file_err(&initrd))?;
            img.save(&root.join("boot.img"))?;

            Ok(())
        })();

        let _ = fs::remove_file(&tmp_img);
        let _ = fs::remove_dir_all(&scratch);

        if result.is_err() {
            warning!("Failed to deploy boot.img!");
        }
        result
    }

    fn ubuntu_touch_finalize(&mut self, root: &Path, name: &str) -> Result<()> {
        if let Ok(base) = self.base_path() {
            let _ = fs::copy(
                base.join("infos/ubuntu_touch.txt"),
                root.join("rom_info.txt"),
            );
        }

        let Some(system) = self.partitions.find("/system") else {
            warning!("Couldn't find /system partition!");
            return Err(Error::Partition(partition::Error::NoSuchPartition(
                "/system".to_string(),
            )));
        };

        let Some(sys_block) = system.block_device else {
            warning!("Couldn't find /system partition!");
            return Err(Error::Partition(partition::Error::NoSuchPartition(
                "/system".to_string(),
            )));
        };

        // The container mounts the device through the by-name alias,
        // which does not have the /block component.
        let sys_block = sys_block
            .to_string_lossy()
            .replacen("/block", "", 1);

        self.with_rom_mounts(name, |_eng| {
            fs::create_dir_all("/data/ubuntu/systemorig")
                .map_err(file_err("/data/ubuntu/systemorig"))?;

            let fstab = Path::new("/data/ubuntu/etc/fstab");
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(fstab)
                .map_err(file_err(fstab))?;
            writeln!(f, "{sys_block}\t/systemorig\text4\tro\t0\t0").map_err(file_err(fstab))?;
            writeln!(f, "/system/vendor\t/vendor\tauto\tro,bind\t0\t0").map_err(file_err(fstab))?;

            let pre_start = Path::new("/data/ubuntu/var/lib/lxc/android/pre-start.sh");
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(pre_start)
                .map_err(file_err(pre_start))?;
            f.write_all(LXC_PRE_START.as_bytes())
                .map_err(file_err(pre_start))?;

            Ok(())
        })
    }
}
