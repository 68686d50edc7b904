// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::symlink,
    path::Path,
};

use ring::digest::{Context, Digest, SHA256};

fn digest_file(path: &Path) -> io::Result<Digest> {
    let mut file = File::open(path)?;
    let mut context = Context::new(&SHA256);
    let mut buf = [0u8; 8192];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }

    Ok(context.finish())
}

/// Compare two files by digest. Used to decide whether a ROM's boot image
/// still matches what is on the boot partition.
pub fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(digest_file(a)?.as_ref() == digest_file(b)?.as_ref())
}

/// Read the first `N` bytes of a file.
pub fn read_magic<const N: usize>(path: &Path) -> io::Result<[u8; N]> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; N];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Remove the contents of a directory without removing the directory
/// itself. Missing directories are not an error.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

/// Recursively copy a directory tree, preserving permissions and symlinks.
/// Special files are skipped; ramdisk overlay trees only contain regular
/// files, directories, and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)?;
        if let Ok(meta) = src.metadata() {
            let _ = fs::set_permissions(dst, meta.permissions());
        }
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            if dst_path.symlink_metadata().is_ok() {
                fs::remove_file(&dst_path)?;
            }
            symlink(fs::read_link(&src_path)?, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path)?;
        } else {
            tracing::warn!("Skipping special file {:?}", src_path);
        }
    }

    Ok(())
}
