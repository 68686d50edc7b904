// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Scripted "installer" bundles. The manifest parser lives outside this
//! crate; it hands over an object that knows its base folders and how to
//! run its hook scripts and extract its payload.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use rustix::mount::{unmount, UnmountFlags};

use crate::{
    engine::{file_err, Error, HookError, MultiRom, Result},
    rom::RomType,
    runner::CommandExt,
    status, warning,
};

const INSTALLER_MOUNT: &str = "/mnt_installer";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    PreInstall,
    PostInstall,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreInstall => "pre_install",
            Self::PostInstall => "post_install",
        }
    }
}

/// The loaded manifest of a scripted installer bundle.
pub trait ScriptedInstaller {
    /// Name requested by the manifest, if any.
    fn rom_name(&self) -> Option<String>;

    /// Text shown to the user before installation starts. `\n` escapes
    /// are literal in the manifest.
    fn install_text(&self) -> Option<String>;

    /// Declared base folders, in manifest order.
    fn base_folders(&self) -> Vec<crate::install::BaseFolder>;

    /// Refuse the install before anything is created.
    fn check_free_space(
        &self,
        dest: &Path,
        image_backed: bool,
    ) -> std::result::Result<(), HookError>;

    fn run_scripts(
        &mut self,
        kind: HookKind,
        base: &Path,
        root: &Path,
    ) -> std::result::Result<(), HookError>;

    /// Extract the manifest's `root_dir` payload into the ROM root.
    fn extract_root_dir(&mut self, root: &Path) -> std::result::Result<(), HookError>;

    /// Extract the per-base-folder tarballs.
    fn extract_tarballs(&mut self, base: &Path) -> std::result::Result<(), HookError>;
}

impl MultiRom {
    pub(crate) fn install_scripted(&mut self, root: &Path, ty: RomType) -> Result<()> {
        let installer = self.installer.as_ref().ok_or(Error::NoInstaller)?;

        if let Some(text) = installer.install_text() {
            status!("{}", text.replace("\\n", "\n"));
        }

        let image_backed = ty.is_image_backed();
        let base = if image_backed {
            self.mount_base_images(root)?
        } else {
            root.to_path_buf()
        };

        let result = (|installer: &mut Box<dyn ScriptedInstaller>| -> Result<()> {
            installer
                .run_scripts(HookKind::PreInstall, &base, root)
                .map_err(Error::Hook)?;
            installer.extract_root_dir(root).map_err(Error::Hook)?;
            installer.extract_tarballs(&base).map_err(Error::Hook)?;
            installer
                .run_scripts(HookKind::PostInstall, &base, root)
                .map_err(Error::Hook)?;
            Ok(())
        })(self.installer.as_mut().ok_or(Error::NoInstaller)?);

        if image_backed {
            self.umount_base_images(&base);
        }

        result
    }

    fn mount_base_images(&self, root: &Path) -> Result<PathBuf> {
        let base = Path::new(INSTALLER_MOUNT);
        self.mkdir_0777(base).map_err(file_err(base))?;

        for name in self.base_folders.keys() {
            let target = base.join(name);
            self.mkdir_0777(&target).map_err(file_err(&target))?;

            let img = root.join(format!("{name}.img"));
            if let Err(e) = Command::new("mount")
                .args(["-o", "loop"])
                .arg(&img)
                .arg(&target)
                .run_checked()
            {
                warning!("Failed to mount image {}.img!", name);
                self.umount_base_images(base);
                return Err(Error::Command(e));
            }
        }

        Ok(base.to_path_buf())
    }

    fn umount_base_images(&self, base: &Path) {
        rustix::fs::sync();

        for name in self.base_folders.keys() {
            let target = base.join(name);
            let _ = unmount(&target, UnmountFlags::DETACH);
            let _ = fs::remove_dir(&target);
        }

        let _ = fs::remove_dir(base);
    }
}
