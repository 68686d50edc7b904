// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The engine handle. All of the former process-wide state (MultiROM
//! root, boot block device, active roms directory, space-rename slot,
//! loaded installer manifest) lives on [`MultiRom`], constructed once at
//! recovery start with the device layout and the recovery's collaborator
//! objects injected.

use std::{
    collections::BTreeMap,
    fs::{self, DirBuilder},
    io,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use tracing::warn;

use crate::{
    config::Config,
    format::{bootimg, ramdisk},
    install::{BaseFolder, ScriptedInstaller},
    partition::{self, PartitionManager, Snapshot},
    rom::{self, RomType},
    runner::{self, CommandExt},
    status, updater, warning,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("MultiROM folder was not found on /data")]
    RootNotFound,
    #[error("Failed to find boot or data device")]
    BootOrDataNotFound,
    #[error("ROM {0:?} does not exist")]
    RomNotFound(String),
    #[error("Could not recognize the layout of ROM {0:?}")]
    UnknownRomType(String),
    #[error("Invalid install location {0:?}")]
    BadLocation(String),
    #[error("Failed to mount install location {0:?}")]
    LocationMount(String, #[source] runner::Error),
    #[error("Failed to find the data partition")]
    DataPartitionMissing,
    #[error("Failed to mount {0:?}")]
    PartitionMount(String, #[source] partition::Error),
    #[error("Boot partition is already hijacked, {0:?} exists")]
    BootAlreadyHijacked(PathBuf),
    #[error("Trampoline binary not found at {0:?}")]
    TrampolineMissing(PathBuf),
    #[error("Backup is missing its {0}")]
    BackupIncomplete(&'static str),
    #[error("Backup archive not found at {0:?}")]
    BackupArchiveMissing(PathBuf),
    #[error("Invalid Linux image: {0}")]
    InvalidLinuxImage(&'static str),
    #[error("ROM {0:?} is not a Linux ROM")]
    NotLinuxRom(String),
    #[error("No installer manifest is loaded")]
    NoInstaller,
    #[error("Base folder {name:?} is too small: {size} MB < {min} MB")]
    BaseFolderTooSmall { name: String, size: u32, min: u32 },
    #[error("Wipe target {0:?} is not recognized")]
    BadWipeTarget(String),
    #[error("{0}")]
    Hook(#[from] HookError),
    #[error("Partition manager error")]
    Partition(#[from] partition::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimg::Error),
    #[error("Ramdisk error")]
    Ramdisk(#[from] ramdisk::Error),
    #[error("Updater script error")]
    Updater(#[from] updater::Error),
    #[error("Command failed")]
    Command(#[from] runner::Error),
    #[error("I/O error on {0:?}")]
    File(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn file_err(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Error {
    let path = path.into();
    move |e| Error::File(path, e)
}

/// Failure reported by one of the recovery's injected engines.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// The recovery's persistent settings that the hijack has to rewrite
/// while `/data` is masked, plus the backup-state knobs.
pub trait RecoveryData {
    fn internal_path(&self) -> String;
    fn set_internal_path(&mut self, path: &str);
    fn storage_path(&self) -> String;
    fn set_storage_path(&mut self, path: &str);
    fn set_settings_path(&mut self, path: &str);
    fn refresh_backup_dir(&mut self);
    fn set_backup_in_progress(&mut self, active: bool);
}

/// External engines owned by the recovery.
pub trait RecoveryHooks {
    /// The ZIP install engine; sees the hijacked mounts.
    fn install_zip(&mut self, zip: &Path) -> std::result::Result<(), HookError>;
    fn run_open_recovery_script(&mut self) -> std::result::Result<(), HookError>;
    fn run_system_image_upgrader(&mut self) -> std::result::Result<(), HookError>;
    fn request_reboot(&mut self);
}

/// Per-device layout and constants. Everything the engine touches
/// outside the MultiROM root is rooted here so tests can point it at a
/// scratch tree.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Name baked into the build, used for the external mount directory.
    pub device: String,
    pub realdata: PathBuf,
    pub tmp: PathBuf,
    pub mnt: PathBuf,
    pub sbin: PathBuf,
    pub mtab: PathBuf,
    /// Candidate MultiROM roots, probed in order.
    pub media_roots: Vec<PathBuf>,
    pub default_rotation: i32,
    /// Ship `mrom.fstab` inside injected ramdisks.
    pub copy_mrom_fstab: bool,
    /// Board-specific ramdisk load address override.
    pub ramdisk_addr: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "generic".to_string(),
            realdata: PathBuf::from("/realdata"),
            tmp: PathBuf::from("/tmp"),
            mnt: PathBuf::from("/mnt"),
            sbin: PathBuf::from("/sbin"),
            mtab: PathBuf::from("/etc/mtab"),
            media_roots: vec![
                PathBuf::from("/data/media/multirom"),
                PathBuf::from("/data/media/0/multirom"),
            ],
            default_rotation: 0,
            copy_mrom_fstab: false,
            ramdisk_addr: None,
        }
    }
}

impl DeviceConfig {
    pub(crate) fn breadcrumb(&self) -> PathBuf {
        self.tmp.join("mrom_fakebootpart")
    }

    pub(crate) fn boot_scratch(&self) -> PathBuf {
        self.tmp.join("boot")
    }
}

pub(crate) struct RenamedRom {
    pub original: PathBuf,
    pub spaceless: PathBuf,
}

pub struct SupportedSystems {
    pub ubuntu: bool,
    pub ubuntu_touch: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WipeTarget {
    System,
    Data,
    Cache,
    Dalvik,
}

impl WipeTarget {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Self::System),
            "data" => Ok(Self::Data),
            "cache" => Ok(Self::Cache),
            "dalvik" => Ok(Self::Dalvik),
            _ => Err(Error::BadWipeTarget(s.to_string())),
        }
    }
}

pub struct MultiRom {
    pub(crate) dev: DeviceConfig,
    pub(crate) partitions: Box<dyn PartitionManager>,
    pub(crate) data: Box<dyn RecoveryData>,
    pub(crate) hooks: Box<dyn RecoveryHooks>,
    pub(crate) base: Option<PathBuf>,
    pub(crate) boot_dev: Option<PathBuf>,
    pub(crate) roms_dir: Option<PathBuf>,
    pub(crate) renamed_rom: Option<RenamedRom>,
    pub(crate) mount_snapshot: Option<Snapshot>,
    pub(crate) installer: Option<Box<dyn ScriptedInstaller>>,
    pub(crate) base_folders: BTreeMap<String, BaseFolder>,
}

impl MultiRom {
    pub fn new(
        dev: DeviceConfig,
        partitions: Box<dyn PartitionManager>,
        data: Box<dyn RecoveryData>,
        hooks: Box<dyn RecoveryHooks>,
    ) -> Self {
        Self {
            dev,
            partitions,
            data,
            hooks,
            base: None,
            boot_dev: None,
            roms_dir: None,
            renamed_rom: None,
            mount_snapshot: None,
            installer: None,
            base_folders: BTreeMap::new(),
        }
    }

    fn find_path(&mut self) {
        self.base = None;
        self.boot_dev = None;
        self.roms_dir = None;

        let boot = self.partitions.find("/boot");
        let data = self.partitions.find("/data");
        let (Some(boot), Some(_)) = (boot, data) else {
            warning!("Failed to find boot or data device!");
            return;
        };

        let Some(boot_dev) = boot.block_device else {
            warning!("Failed to find boot or data device!");
            return;
        };

        if self.partitions.mount("/data").is_err() {
            warning!("Failed to mount /data partition!");
            return;
        }

        self.boot_dev = Some(boot_dev);

        for root in &self.dev.media_roots {
            if root.exists() {
                self.base = Some(root.clone());
                self.roms_dir = Some(root.join("roms"));
                return;
            }
        }
    }

    /// Discover the MultiROM root; cached for the rest of the session.
    pub fn folder_exists(&mut self) -> bool {
        if self.base.is_none() {
            self.find_path();
        }
        self.base.is_some()
    }

    pub fn base_path(&self) -> Result<&Path> {
        self.base.as_deref().ok_or(Error::RootNotFound)
    }

    pub fn roms_path(&self) -> Result<&Path> {
        self.roms_dir.as_deref().ok_or(Error::RootNotFound)
    }

    pub fn boot_dev(&self) -> Result<&Path> {
        self.boot_dev.as_deref().ok_or(Error::BootOrDataNotFound)
    }

    /// Whether the active roms directory lives on internal storage.
    pub(crate) fn internal_location(&self) -> bool {
        self.roms_dir
            .as_ref()
            .is_some_and(|d| !d.starts_with(&self.dev.mnt))
    }

    pub fn list_roms(&self) -> Result<Vec<String>> {
        let roms = self.roms_path()?;
        rom::list(roms).map_err(file_err(roms))
    }

    pub fn rom_type(&self, name: &str) -> Result<RomType> {
        let root = self.roms_path()?.join(name);
        if !root.is_dir() {
            return Err(Error::RomNotFound(name.to_string()));
        }
        Ok(rom::classify(self.internal_location(), &root))
    }

    pub fn load_config(&self) -> Result<Config> {
        let base = self.base_path()?;
        Ok(Config::load(
            &base.join("multirom.ini"),
            self.dev.default_rotation,
        ))
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        let base = self.base_path()?;
        config.save(&base.join("multirom.ini"));
        Ok(())
    }

    pub fn supported_systems(&self) -> Result<SupportedSystems> {
        let base = self.base_path()?;
        Ok(SupportedSystems {
            ubuntu: base.join("infos/ubuntu.txt").exists(),
            ubuntu_touch: base.join("infos/ubuntu_touch.txt").exists(),
        })
    }

    pub fn move_rom(&mut self, from: &str, to: &str) -> Result<()> {
        let roms = self.roms_path()?;
        status!("Moving ROM {:?} to {:?}...", from, to);
        let src = roms.join(from);
        fs::rename(&src, roms.join(to)).map_err(file_err(src))
    }

    pub fn erase(&mut self, name: &str) -> Result<()> {
        let path = self.roms_path()?.join(name);
        status!("Erasing ROM {:?}...", name);

        if let Err(e) = Command::new("chattr")
            .args(["-R", "-i"])
            .arg(&path)
            .run_checked()
        {
            warning!("Failed to remove immutable attribute from that folder!");
            return Err(e.into());
        }

        fs::remove_dir_all(&path).map_err(file_err(path))?;
        rustix::fs::sync();
        Ok(())
    }

    pub fn wipe(&mut self, name: &str, target: WipeTarget) -> Result<()> {
        self.with_rom_mounts(name, |_eng| {
            match target {
                WipeTarget::Dalvik => {
                    for dir in ["/data/dalvik-cache", "/cache/dalvik-cache", "/cache/dc"] {
                        status!("Wiping dalvik: {}...", dir);
                        match fs::remove_dir_all(dir) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => {
                                warning!("ERROR: Failed to erase dalvik!");
                                return Err(file_err(dir)(e));
                            }
                        }
                    }
                }
                _ => {
                    let dir = match target {
                        WipeTarget::System => "/system",
                        WipeTarget::Data => "/data",
                        WipeTarget::Cache => "/cache",
                        WipeTarget::Dalvik => unreachable!(),
                    };
                    status!("Wiping ROM's {}...", dir);
                    crate::util::clear_dir(Path::new(dir)).map_err(|e| {
                        warning!("ERROR: Failed to erase {}!", dir);
                        file_err(dir)(e)
                    })?;
                }
            }

            rustix::fs::sync();
            Ok(())
        })
    }

    /// Rewrite a user-supplied path so it stays valid while `/data` is
    /// remounted as `/realdata`.
    pub fn translate_to_realdata(&self, path: &Path) -> PathBuf {
        let s = path.to_string_lossy();
        let realdata = self.dev.realdata.to_string_lossy();

        if let Some(rest) = s.strip_prefix("/sdcard/") {
            let media = if self.dev.realdata.join("media/0").is_dir() {
                format!("{realdata}/media/0/")
            } else {
                format!("{realdata}/media/")
            };
            return PathBuf::from(format!("{media}{rest}"));
        }

        if s.contains("/data/media/") {
            if let Some(rest) = s.strip_prefix("/data/") {
                return PathBuf::from(format!("{realdata}/{rest}"));
            }
        }

        path.to_path_buf()
    }

    /// If `path` contains spaces, rename it to a space-free sibling so
    /// the embedded installer scripts (which do not quote) survive, and
    /// remember the pair for [`MultiRom::restore_rom_path`]. Strictly
    /// paired with restore; a nested call reuses the stored rename.
    pub fn normalize_rom_path(&mut self, path: &mut PathBuf) -> Result<()> {
        if let Some(renamed) = &self.renamed_rom {
            *path = renamed.spaceless.clone();
            return Ok(());
        }

        let s = path.to_string_lossy();
        if !s.contains(' ') {
            return Ok(());
        }

        let mut candidate = PathBuf::from(s.replace(' ', "-"));
        while candidate.exists() {
            let mut os = candidate.into_os_string();
            os.push("a");
            candidate = PathBuf::from(os);
        }

        fs::rename(&path, &candidate).map_err(file_err(path.clone()))?;

        self.renamed_rom = Some(RenamedRom {
            original: path.clone(),
            spaceless: candidate.clone(),
        });
        *path = candidate;

        Ok(())
    }

    pub fn restore_rom_path(&mut self) {
        let Some(renamed) = self.renamed_rom.take() else {
            return;
        };

        if let Err(e) = fs::rename(&renamed.spaceless, &renamed.original) {
            warn!(
                "Failed to rename {:?} back to {:?}: {e}",
                renamed.spaceless, renamed.original
            );
        }
    }

    pub fn init_backup(&mut self, name: &str) -> Result<()> {
        let had_internal = self.data.storage_path().starts_with("/data");

        self.change_mounts(name)?;

        let mut boot = match self.roms_path() {
            Ok(roms) => roms.join(name),
            Err(e) => {
                self.restore_mounts();
                return Err(e);
            }
        };
        if let Err(e) = self.normalize_rom_path(&mut boot) {
            self.restore_mounts();
            return Err(e);
        }
        boot.push("boot.img");
        let boot = self.translate_to_realdata(&boot);

        if let Err(e) = self.fake_boot_partition(&boot) {
            self.restore_mounts();
            return Err(e);
        }

        self.partitions.refresh();

        if had_internal {
            let realdata_mp = self.dev.realdata.to_string_lossy().into_owned();
            let Some(realdata) = self.partitions.find(&realdata_mp) else {
                warning!("Couldn't find {}!", realdata_mp);
                self.restore_boot_partition();
                self.restore_mounts();
                return Err(Error::Partition(partition::Error::NoSuchPartition(
                    realdata_mp,
                )));
            };

            self.data.set_settings_path(&realdata.storage_path);
            self.data.set_storage_path(&realdata.storage_path);
            self.data.refresh_backup_dir();
        }

        self.data.set_backup_in_progress(true);
        Ok(())
    }

    pub fn deinit_backup(&mut self) {
        let realdata = self.dev.realdata.to_string_lossy().into_owned();
        let had_internal = self.data.storage_path().starts_with(&realdata);

        self.restore_boot_partition();
        self.restore_mounts();

        self.data.set_backup_in_progress(false);

        if had_internal {
            let Some(data) = self.partitions.find("/data") else {
                warning!("Couldn't find /data!");
                return;
            };

            self.data.set_settings_path(&data.storage_path);
            self.data.set_storage_path(&data.storage_path);
            self.data.refresh_backup_dir();
        }
    }

    pub(crate) fn mkdir_0777(&self, path: &Path) -> io::Result<()> {
        match DirBuilder::new().mode(0o777).create(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}
