// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Ubuntu desktop pipeline: unpack the rootfs tarball out of a (possibly
//! gzipped, sparse) image, patch the initramfs so the trampoline can
//! boot it, and defang flash-kernel so an in-ROM kernel update cannot
//! overwrite the real boot partition.
//!
//! The chroot'd package steps are deliberately best-effort; a ROM with a
//! stale initramfs still boots, a half-restored device does not.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use flate2::read::GzDecoder;
use rustix::mount::{mount_bind, unmount, UnmountFlags};
use tracing::warn;

use crate::{
    engine::{file_err, Error, MultiRom, Result},
    location::INTERNAL_LOCATION,
    rom::RomType,
    runner::CommandExt,
    status, warning,
};

const UB_IMG_MOUNT: &str = "/mnt_ub_img";
const UB_LOOP_MOUNT: &str = "/mnt_ubuntu";

fn is_mounted_at(mtab: &Path, mount_point: &str) -> bool {
    fs::read_to_string(mtab)
        .map(|mtab| mtab.contains(mount_point))
        .unwrap_or(false)
}

/// Decompress `<img>.gz` next to itself, removing the compressed file,
/// like `gzip -d` would.
fn gunzip_in_place(img_path: &Path) -> Result<PathBuf> {
    let out_path = img_path.with_extension("");

    let src = File::open(img_path).map_err(file_err(img_path))?;
    let mut out = File::create(&out_path).map_err(file_err(&out_path))?;
    io::copy(&mut GzDecoder::new(src), &mut out).map_err(file_err(&out_path))?;

    fs::remove_file(img_path).map_err(file_err(img_path))?;
    Ok(out_path)
}

impl MultiRom {
    pub(crate) fn install_linux(
        &mut self,
        name: &str,
        img: &Path,
        root: &Path,
        ty: RomType,
    ) -> Result<()> {
        let dest = if ty == RomType::UbuntuUsbImg {
            self.mount_linux_image(name)?
        } else {
            root.join("root")
        };

        let result = self
            .ubuntu_extract_image(img, &dest)
            .and_then(|()| self.patch_ubuntu_init(&dest))
            .and_then(|()| self.ubuntu_update_initramfs(&dest));

        // Make oem-config run on first boot.
        let oem = dest.join("var/lib/oem-config");
        if fs::create_dir_all(&oem).is_ok() {
            let _ = File::create(oem.join("run"));
        }

        if let Ok(base) = self.base_path() {
            let _ = fs::copy(base.join("infos/ubuntu.txt"), root.join("rom_info.txt"));
        }

        if ty == RomType::UbuntuUsbImg {
            let _ = unmount(UB_LOOP_MOUNT, UnmountFlags::empty());
        }

        result
    }

    fn mount_linux_image(&self, name: &str) -> Result<PathBuf> {
        self.mkdir_0777(Path::new(UB_LOOP_MOUNT))
            .map_err(file_err(UB_LOOP_MOUNT))?;

        let img = self.roms_path()?.join(name).join("root.img");
        Command::new("mount")
            .args(["-o", "loop"])
            .arg(&img)
            .arg(UB_LOOP_MOUNT)
            .run_checked()
            .map_err(|e| {
                warning!("Failed to mount ubuntu image!");
                Error::Command(e)
            })?;

        Ok(PathBuf::from(UB_LOOP_MOUNT))
    }

    fn ubuntu_extract_image(&self, img: &Path, dest: &Path) -> Result<()> {
        let img = if img.extension().is_some_and(|e| e == "gz") {
            status!("Decompressing the image (may take a while)...");
            let img = gunzip_in_place(img)?;
            if !img.exists() {
                warning!("Failed to decompress the image, more space needed?");
                return Err(Error::InvalidLinuxImage("decompression failed"));
            }
            img
        } else {
            img.to_path_buf()
        };

        self.mkdir_0777(Path::new(UB_IMG_MOUNT))
            .map_err(file_err(UB_IMG_MOUNT))?;
        let _ = unmount(UB_IMG_MOUNT, UnmountFlags::DETACH);

        status!("Converting the image (may take a while)...");
        let raw = self.dev.tmp.join("rootfs.img");
        Command::new("simg2img").arg(&img).arg(&raw).run_checked()?;

        Command::new("mount")
            .args(["-o", "loop"])
            .arg(&raw)
            .arg(UB_IMG_MOUNT)
            .run_checked()?;

        let result = (|| -> Result<()> {
            let tarball = Path::new(UB_IMG_MOUNT).join("rootfs.tar.gz");
            if !tarball.exists() {
                warning!("Invalid Ubuntu image (rootfs.tar.gz not found)!");
                return Err(Error::InvalidLinuxImage("rootfs.tar.gz not found"));
            }

            status!("Extracting rootfs.tar.gz (will take a while)...");
            let mut tar = Command::new("gnutar")
                .args(["-x", "--numeric-owner", "-C"])
                .arg(dest)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| crate::runner::Error::Spawn("gnutar".to_string(), e))?;

            {
                let mut stdin = tar.stdin.take().unwrap();
                let tarball_file = File::open(&tarball).map_err(file_err(&tarball))?;
                io::copy(&mut GzDecoder::new(tarball_file), &mut stdin)
                    .map_err(file_err(&tarball))?;
            }

            let tar_status = tar
                .wait()
                .map_err(|e| crate::runner::Error::Spawn("gnutar".to_string(), e))?;
            if !tar_status.success() {
                return Err(Error::InvalidLinuxImage("rootfs extraction failed"));
            }

            Ok(())
        })();

        rustix::fs::sync();
        let _ = unmount(UB_IMG_MOUNT, UnmountFlags::DETACH);
        let _ = fs::remove_file(&raw);

        result?;

        if !dest.join("boot/vmlinuz").exists() {
            warning!("Failed to extract rootfs!");
            return Err(Error::InvalidLinuxImage("no kernel in rootfs"));
        }

        Ok(())
    }

    pub(crate) fn patch_ubuntu_init(&self, root_dir: &Path) -> Result<()> {
        status!("Patching ubuntu init...");

        let init_dir = root_dir.join("usr/share/initramfs-tools");
        let scripts_dir = init_dir.join("scripts");

        if !init_dir.is_dir() || !scripts_dir.is_dir() {
            warning!("init paths do not exist");
            return Err(Error::InvalidLinuxImage("initramfs-tools missing"));
        }

        let base = self.base_path()?;
        fs::copy(base.join("ubuntu-init/init"), init_dir.join("init"))
            .map_err(file_err(base.join("ubuntu-init/init")))?;
        fs::copy(base.join("ubuntu-init/local"), scripts_dir.join("local"))
            .map_err(file_err(base.join("ubuntu-init/local")))?;

        let fstab = root_dir.join("etc/fstab");
        fs::write(&fstab, "none\t/proc\tproc\tnodev,noexec,nosuid\t0\t0\n")
            .map_err(file_err(fstab))?;

        Ok(())
    }

    fn setup_chroot(&self, start: bool, root_dir: &Path) {
        for dir in ["dev", "sys", "proc"] {
            let target = root_dir.join(dir);
            if start {
                if let Err(e) = mount_bind(format!("/{dir}"), &target) {
                    warn!("Failed to bind {dir} into chroot: {e}");
                }
            } else if let Err(e) = unmount(&target, UnmountFlags::empty()) {
                warn!("Failed to unbind {dir} from chroot: {e}");
            }
        }
    }

    pub(crate) fn ubuntu_update_initramfs(&self, root_dir: &Path) -> Result<()> {
        status!("Removing tarball installer...");

        self.setup_chroot(true, root_dir);

        let _ = Command::new("chroot")
            .arg(root_dir)
            .args([
                "apt-get",
                "-y",
                "--force-yes",
                "purge",
                "ac100-tarball-installer",
                "flash-kernel",
            ])
            .run_ok();

        self.ubuntu_disable_flash_kernel(false, root_dir);

        status!("Updating initramfs...");
        let _ = Command::new("chroot")
            .arg(root_dir)
            .args(["update-initramfs", "-u"])
            .run_ok();

        self.fix_initrd_symlink(root_dir);

        self.setup_chroot(false, root_dir);
        Ok(())
    }

    /// Point `/boot/initrd.img` at the first versioned initrd, like the
    /// postinst of a kernel package would.
    fn fix_initrd_symlink(&self, root_dir: &Path) {
        let boot = root_dir.join("boot");
        let Ok(entries) = fs::read_dir(&boot) else {
            return;
        };

        let mut initrds: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("initrd.img-"))
            .collect();
        initrds.sort();

        let Some(first) = initrds.first() else {
            return;
        };

        let link = boot.join("initrd.img");
        let _ = fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(first, &link) {
            warn!("Failed to link {link:?} to {first}: {e}");
        }
    }

    /// We don't want flash-kernel to be active, ever.
    pub(crate) fn ubuntu_disable_flash_kernel(&self, init_chroot: bool, root_dir: &Path) {
        status!("Disabling flash-kernel");

        if init_chroot {
            self.setup_chroot(true, root_dir);
            let _ = Command::new("chroot")
                .arg(root_dir)
                .args(["apt-get", "-y", "--force-yes", "purge", "flash-kernel"])
                .run_ok();
        }

        match Command::new("chroot")
            .arg(root_dir)
            .args(["dpkg", "--set-selections"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(b"flash-kernel hold\n");
                }
                let _ = child.wait();
            }
            Err(e) => warn!("Failed to run dpkg --set-selections: {e}"),
        }

        let environment = root_dir.join("etc/environment");
        let current = fs::read_to_string(&environment).unwrap_or_default();
        if !current.contains("FLASH_KERNEL_SKIP") {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&environment)
                .and_then(|mut f| f.write_all(b"FLASH_KERNEL_SKIP=1\n"));
            if let Err(e) = appended {
                warn!("Failed to update {environment:?}: {e}");
            }
        }

        if init_chroot {
            self.setup_chroot(false, root_dir);
        }
    }

    /// Re-run the init patching on an existing Linux ROM, e.g. after its
    /// kernel was upgraded from inside the ROM.
    pub fn patch_init(&mut self, name: &str) -> Result<()> {
        status!("Patching init for rom {}...", name);

        let ty = self.rom_type(name)?;
        if !ty.is_ubuntu() {
            warning!("This is not ubuntu ROM. ({:?})", ty);
            return Err(Error::NotLinuxRom(name.to_string()));
        }

        let dest = match ty {
            RomType::UbuntuUsbImg => self.mount_linux_image(name)?,
            _ => self.roms_path()?.join(name).join("root"),
        };

        let result = self
            .patch_ubuntu_init(&dest)
            .and_then(|()| self.ubuntu_update_initramfs(&dest));

        rustix::fs::sync();

        // The loop mount may already be gone if an earlier step failed.
        if ty == RomType::UbuntuUsbImg && is_mounted_at(&self.dev.mtab, UB_LOOP_MOUNT) {
            let _ = unmount(UB_LOOP_MOUNT, UnmountFlags::DETACH);
        }

        result
    }

    /// Standalone flash-kernel disable, offered for ROMs installed before
    /// the installer started doing it.
    pub fn disable_flash_kernel(&mut self, name: &str, loc: &str) -> Result<()> {
        let internal = loc == INTERNAL_LOCATION;
        let ext_fs = loc.contains("(ext");
        let image_backed = !internal && !ext_fs;

        let dest = if image_backed {
            self.mount_linux_image(name)?
        } else {
            self.roms_path()?.join(name).join("root")
        };

        self.ubuntu_disable_flash_kernel(true, &dest);

        rustix::fs::sync();

        if image_backed {
            let _ = unmount(UB_LOOP_MOUNT, UnmountFlags::empty());
        }

        Ok(())
    }
}
