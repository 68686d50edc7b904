// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Sanitizer for third-party flashable ZIPs.
//!
//! The updater-script inside a ZIP was written assuming it owns the real
//! device: it mounts and formats real partitions and dd's boot images to
//! block nodes. Under the mount hijack those lines must go away, while
//! everything that talks about boot image *files* stays, because the boot
//! "partition" is a plain file during a hijacked flash.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use bstr::ByteSlice;
use thiserror::Error;
use zip::{result::ZipError, write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{status, warning};

pub const UPDATER_SCRIPT: &str = "META-INF/com/google/android/updater-script";
pub const SANITIZED_ZIP_NAME: &str = "mr_update.zip";

/// ZIPs below this size are copied to tmpfs before editing; bigger ones
/// are edited in place and become unusable for non-MultiROM flashing.
const COPY_THRESHOLD: u64 = 450 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to find entry {UPDATER_SCRIPT:?} in {0:?}")]
    MissingScript(PathBuf),
    #[error("Zip error in {0:?}")]
    Zip(PathBuf, #[source] ZipError),
    #[error("I/O error on {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct SanitizedZip {
    /// The ZIP to actually flash; either the tmpfs copy or the original.
    pub path: PathBuf,
    pub changed: bool,
    /// The script wanted `format(... "/system")`; the installer wipes the
    /// sandboxed `/system` contents instead.
    pub format_system: bool,
}

/// Substring search where `?` in the needle matches zero or one bytes.
/// Catches both `/system/bin/mount` and `/system/xbin/umount`.
fn wildcard_find(haystack: &[u8], needle: &[u8]) -> bool {
    fn matches_at(hay: &[u8], pat: &[u8]) -> bool {
        let Some((&p, rest)) = pat.split_first() else {
            return true;
        };

        if p == b'?' {
            if matches_at(hay, rest) {
                return true;
            }
            !hay.is_empty() && matches_at(&hay[1..], rest)
        } else {
            match hay.split_first() {
                Some((&h, hrest)) if h == p => matches_at(hrest, rest),
                _ => false,
            }
        }
    }

    if haystack.is_empty() || needle.is_empty() {
        return false;
    }

    (0..haystack.len()).any(|i| matches_at(&haystack[i..], needle))
}

/// Decide whether a (whitespace-trimmed, non-comment) script line has to
/// be dropped. The check order matters: mount and format rules win over
/// the boot-image keep list, which in turn wins over the block-device and
/// dd rules.
fn line_is_blocked(line: &[u8], boot_dev: &[u8]) -> bool {
    if line.contains_str("mount") && !line.contains_str("ui_print") {
        if line.contains_str("run_program")
            || (!wildcard_find(line, b"/system/?bin/?mount") && !line.contains_str("symlink("))
        {
            return true;
        }
    }

    if line.contains_str("format") {
        return true;
    }

    if line.contains_str("boot.img")
        || (!boot_dev.is_empty() && line.contains_str(boot_dev))
        || line.contains_str("bbootimg")
        || line.contains_str("zImage")
    {
        return false;
    }

    if line.contains_str("/dev/block/platform/") {
        return true;
    }

    if line.contains_str("\"dd\"") && line.contains_str("run_program") {
        return true;
    }

    false
}

pub struct FilterResult {
    pub script: Vec<u8>,
    pub changed: bool,
    pub format_system: bool,
}

/// Run the line filter over a whole script. Blank lines are consumed by
/// the tokenization, so filtering is idempotent.
pub fn filter_script(data: &[u8], boot_dev: &[u8]) -> FilterResult {
    let mut out = Vec::with_capacity(data.len());
    let mut changed = false;
    let mut format_system = false;

    for token in data.split(|&b| b == b'\n') {
        if token.is_empty() {
            continue;
        }

        let trimmed = token.trim_start_with(|c| c.is_ascii_whitespace());

        if trimmed.is_empty() || trimmed[0] == b'#' || !line_is_blocked(trimmed, boot_dev) {
            out.extend_from_slice(token);
            out.push(b'\n');
        } else {
            changed = true;

            if trimmed.starts_with(b"format") && trimmed.contains_str("/system") {
                format_system = true;
            }
        }
    }

    FilterResult {
        script: out,
        changed,
        format_system,
    }
}

fn read_script(zip_path: &Path) -> Result<Vec<u8>> {
    let file = File::open(zip_path).map_err(|e| Error::Open(zip_path.to_path_buf(), e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| Error::Zip(zip_path.to_path_buf(), e))?;

    let mut entry = match archive.by_name(UPDATER_SCRIPT) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(Error::MissingScript(zip_path.to_path_buf())),
        Err(e) => return Err(Error::Zip(zip_path.to_path_buf(), e)),
    };

    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|e| Error::File(zip_path.to_path_buf(), e))?;

    Ok(data)
}

/// Rewrite the updater-script entry, carrying every other entry over
/// untouched (and uncompressed-recompressed).
fn replace_script(zip_path: &Path, script: &[u8]) -> Result<()> {
    let zerr = |e| Error::Zip(zip_path.to_path_buf(), e);
    let ferr = |e| Error::File(zip_path.to_path_buf(), e);

    let file = File::open(zip_path).map_err(|e| Error::Open(zip_path.to_path_buf(), e))?;
    let mut archive = ZipArchive::new(file).map_err(zerr)?;

    let staging = zip_path.with_extension("mrnew");
    let out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging)
        .map_err(|e| Error::Open(staging.clone(), e))?;
    let mut writer = ZipWriter::new(out);

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(zerr)?;
        if entry.name() == UPDATER_SCRIPT {
            continue;
        }
        writer.raw_copy_file(entry).map_err(zerr)?;
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(UPDATER_SCRIPT, options).map_err(zerr)?;
    writer.write_all(script).map_err(ferr)?;
    writer.finish().map_err(zerr)?;

    fs::rename(&staging, zip_path).map_err(|e| Error::File(staging, e))
}

/// Sanitize a flashable ZIP before it is handed to the install engine.
pub fn sanitize(zip_path: &Path, tmp: &Path, boot_dev: &Path) -> Result<SanitizedZip> {
    let scratch = tmp.join(SANITIZED_ZIP_NAME);
    if zip_path != scratch {
        let _ = fs::remove_file(&scratch);
    }

    let meta = fs::metadata(zip_path).map_err(|e| Error::Open(zip_path.to_path_buf(), e))?;

    let work = if zip_path == scratch {
        scratch
    } else if meta.len() < COPY_THRESHOLD {
        status!("Copying ZIP to /tmp...");
        fs::copy(zip_path, &scratch).map_err(|e| Error::File(scratch.clone(), e))?;
        scratch
    } else {
        warning!("=======================================================");
        warning!("Modifying the real ZIP, it is too big!");
        warning!("The ZIP file is now unusable for non-MultiROM flashing!");
        warning!("=======================================================");
        zip_path.to_path_buf()
    };

    let data = read_script(&work)?;
    let result = filter_script(&data, boot_dev.as_os_str().as_encoded_bytes());

    if result.changed {
        replace_script(&work, &result.script)?;
    } else {
        status!("No need to change ZIP.");
    }

    Ok(SanitizedZip {
        path: work,
        changed: result.changed,
        format_system: result.format_system,
    })
}
