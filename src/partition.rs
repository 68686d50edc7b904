// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The narrow surface of the recovery's partition manager that the mount
//! hijack needs. The real table is process-global inside the recovery;
//! it is injected here as a trait so the transaction can be exercised
//! against an in-memory double.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No partition is registered at {0:?}")]
    NoSuchPartition(String),
    #[error("Failed to mount {0:?}: {1}")]
    Mount(String, String),
    #[error("Failed to unmount {0:?}: {1}")]
    Unmount(String, String),
    #[error("Failed to write fstab: {0}")]
    Fstab(String),
}

type Result<T> = std::result::Result<T, Error>;

/// What actually backs a partition's mountpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionContent {
    /// A real block device node.
    Block,
    /// A bind mount of a directory inside another mounted filesystem.
    Bind { source: PathBuf },
    /// A loop mount of a regular image file.
    Image { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub display_name: String,
    pub backup_name: String,
    pub mount_point: String,
    pub fs_type: String,
    pub block_device: Option<PathBuf>,
    pub symlink_path: String,
    pub storage_path: String,
    pub can_be_backed_up: bool,
    pub content: PartitionContent,
}

impl Partition {
    pub fn bind(mount_point: &str, fs_type: &str, source: PathBuf) -> Self {
        Self {
            display_name: mount_point.trim_start_matches('/').to_string(),
            backup_name: String::new(),
            mount_point: mount_point.to_string(),
            fs_type: fs_type.to_string(),
            block_device: None,
            symlink_path: String::new(),
            storage_path: mount_point.to_string(),
            can_be_backed_up: false,
            content: PartitionContent::Bind { source },
        }
    }

    pub fn image(mount_point: &str, fs_type: &str, path: PathBuf) -> Self {
        Self {
            content: PartitionContent::Image { path },
            ..Self::bind(mount_point, fs_type, PathBuf::new())
        }
    }
}

/// A deep copy of the whole table, for push/pop around the mount hijack.
#[derive(Clone, Debug, Default)]
pub struct Snapshot(pub Vec<Partition>);

pub trait PartitionManager {
    fn snapshot(&self) -> Snapshot;

    fn restore(&mut self, snapshot: Snapshot);

    fn find(&self, mount_point: &str) -> Option<Partition>;

    fn remove(&mut self, mount_point: &str) -> Option<Partition>;

    fn insert(&mut self, partition: Partition);

    fn mount(&mut self, mount_point: &str) -> Result<()>;

    fn unmount(&mut self, mount_point: &str) -> Result<()>;

    fn write_fstab(&mut self) -> Result<()>;

    /// Recompute derived state (sizes, storage paths) after the table
    /// changed underneath the recovery.
    fn refresh(&mut self);
}
