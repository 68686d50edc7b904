// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Ramdisk (de)compression with format autodetection.
//!
//! The compression format is detected from the first four bytes of the
//! blob. Gzip and LZ4-legacy streams are coded in-process; LZMA-alone
//! ramdisks are decoded through the device `lzma` tool and can never be
//! re-compressed, because the recovery toolchain has no LZMA encoder —
//! that case must fail before any file is touched.
//!
//! The archive itself is CPIO in newc format, materialized to and from a
//! real directory tree by the device `cpio` tool so that file modes,
//! symlinks, and device nodes survive.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use lz4_flex::frame::FrameDecoder;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::util;

static GZIP_MAGIC: &[u8; 2] = b"\x1f\x8b";
static LZ4_LEGACY_MAGIC: &[u8; 4] = b"\x02\x21\x4c\x18";
static LZMA_MAGIC: &[u8; 4] = b"\x5d\x00\x00\x00";
static LZMA_MAGIC_ALT: &[u8; 4] = b"\x5d\x00\x00\x80";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown ramdisk compression: {0:02x?}")]
    UnknownFormat([u8; 4]),
    #[error("Recovery can't compress ramdisk using LZMA")]
    LzmaCompression,
    #[error("Ramdisk does not contain init at its root")]
    NoInit,
    #[error("Failed to run {0:?}")]
    Spawn(&'static str, #[source] io::Error),
    #[error("{0} exited with {1}: {2}")]
    ToolFailed(&'static str, std::process::ExitStatus, String),
    #[error("I/O error on {0:?}")]
    File(PathBuf, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RamdiskFormat {
    Gzip,
    Lz4Legacy,
    Lzma,
}

impl RamdiskFormat {
    pub fn from_magic(magic: &[u8; 4]) -> Result<Self> {
        if &magic[0..2] == GZIP_MAGIC {
            Ok(Self::Gzip)
        } else if magic == LZ4_LEGACY_MAGIC {
            Ok(Self::Lz4Legacy)
        } else if magic == LZMA_MAGIC || magic == LZMA_MAGIC_ALT {
            Ok(Self::Lzma)
        } else {
            Err(Error::UnknownFormat(*magic))
        }
    }
}

/// Detect the compression of the ramdisk blob at `path`.
pub fn detect(path: &Path) -> Result<RamdiskFormat> {
    let magic = util::read_magic::<4>(path).map_err(|e| Error::File(path.to_path_buf(), e))?;
    RamdiskFormat::from_magic(&magic)
}

/// Legacy (pre-frame) LZ4 encoder: a magic word followed by
/// length-prefixed independently compressed blocks.
struct Lz4LegacyEncoder<W: Write> {
    writer: W,
    // The legacy format always uses the max block size.
    buf: Box<[u8]>,
    n_filled: usize,
}

impl<W: Write> Lz4LegacyEncoder<W> {
    fn new(mut writer: W) -> io::Result<Self> {
        writer.write_all(LZ4_LEGACY_MAGIC)?;

        Ok(Self {
            writer,
            buf: vec![0u8; 8 * 1024 * 1024].into_boxed_slice(),
            n_filled: 0,
        })
    }

    fn write_block(&mut self, force: bool) -> io::Result<()> {
        if !force && self.n_filled < self.buf.len() {
            // Block not fully filled yet.
            return Ok(());
        }

        let compressed = lz4_flex::block::compress(&self.buf[..self.n_filled]);

        self.writer
            .write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.writer.write_all(&compressed)?;

        self.n_filled = 0;

        Ok(())
    }

    fn finish(mut self) -> io::Result<W> {
        self.write_block(true)?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for Lz4LegacyEncoder<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            let to_write = buf.len().min(self.buf.len() - self.n_filled);
            self.buf[self.n_filled..self.n_filled + to_write].copy_from_slice(&buf[..to_write]);

            self.n_filled += to_write;
            self.write_block(false)?;

            buf = &buf[to_write..];
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_block(false)
    }
}

fn wait_tool(name: &'static str, mut child: Child) -> Result<()> {
    let mut stderr = String::new();
    if let Some(pipe) = child.stderr.as_mut() {
        let _ = pipe.read_to_string(&mut stderr);
    }

    let status = child.wait().map_err(|e| Error::Spawn(name, e))?;
    if !status.success() {
        return Err(Error::ToolFailed(name, status, stderr.trim().to_string()));
    }

    Ok(())
}

/// Unpack the compressed CPIO blob at `src` into the directory `dest`.
/// Returns the detected format so the caller can re-compress
/// symmetrically. Fails unless `init` exists at the tree root afterwards.
pub fn unpack(src: &Path, dest: &Path) -> Result<RamdiskFormat> {
    let format = detect(src)?;
    debug!("Unpacking {format:?} ramdisk {src:?} into {dest:?}");

    let mut cpio = Command::new("cpio")
        .arg("-i")
        .current_dir(dest)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn("cpio", e))?;

    let mut stdin = cpio.stdin.take().unwrap();
    let feed = (|| -> Result<()> {
        let file = File::open(src).map_err(|e| Error::File(src.to_path_buf(), e))?;

        match format {
            RamdiskFormat::Gzip => {
                io::copy(&mut GzDecoder::new(file), &mut stdin)?;
            }
            RamdiskFormat::Lz4Legacy => {
                io::copy(&mut FrameDecoder::new(file), &mut stdin)?;
            }
            RamdiskFormat::Lzma => {
                // No in-process decoder on the recovery stack; chain the
                // device tool in front of cpio.
                drop(file);
                let mut lzma = Command::new("lzma")
                    .args(["-d", "-c"])
                    .arg(src)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| Error::Spawn("lzma", e))?;

                io::copy(lzma.stdout.as_mut().unwrap(), &mut stdin)?;
                wait_tool("lzma", lzma)?;
            }
        }

        Ok(())
    })();

    drop(stdin);
    let waited = wait_tool("cpio", cpio);
    feed?;
    waited?;

    if !dest.join("init").exists() {
        return Err(Error::NoInit);
    }

    Ok(format)
}

/// Pack the directory `tree` into a compressed newc CPIO blob at `dest`.
pub fn pack(tree: &Path, dest: &Path, format: RamdiskFormat) -> Result<()> {
    if format == RamdiskFormat::Lzma {
        return Err(Error::LzmaCompression);
    }

    debug!("Packing {tree:?} into {format:?} ramdisk {dest:?}");

    let mut file_list = Vec::new();
    for entry in WalkDir::new(tree) {
        let entry = entry.map_err(|e| Error::File(tree.to_path_buf(), e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(tree)
            .expect("walkdir stays under its root");

        if rel.as_os_str().is_empty() {
            file_list.extend_from_slice(b".\n");
        } else {
            file_list.extend_from_slice(b"./");
            file_list.extend_from_slice(rel.as_os_str().as_encoded_bytes());
            file_list.push(b'\n');
        }
    }

    let out = File::create(dest).map_err(|e| Error::File(dest.to_path_buf(), e))?;

    let mut cpio = Command::new("cpio")
        .args(["-o", "-H", "newc"])
        .current_dir(tree)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn("cpio", e))?;

    let mut stdin = cpio.stdin.take().unwrap();
    let mut stdout = cpio.stdout.take().unwrap();

    let compress = thread::scope(|scope| -> Result<()> {
        // cpio reads the file list lazily; feed it from a second thread
        // so a full stdout pipe cannot deadlock us.
        let feeder = scope.spawn(move || {
            let _ = stdin.write_all(&file_list);
        });

        match format {
            RamdiskFormat::Gzip => {
                let mut encoder = GzEncoder::new(out, Compression::default());
                io::copy(&mut stdout, &mut encoder)?;
                encoder.finish()?;
            }
            RamdiskFormat::Lz4Legacy => {
                let mut encoder = Lz4LegacyEncoder::new(out)?;
                io::copy(&mut stdout, &mut encoder)?;
                encoder.finish()?;
            }
            RamdiskFormat::Lzma => unreachable!(),
        }

        feeder.join().expect("feeder thread never panics");
        Ok(())
    });

    let waited = wait_tool("cpio", cpio);
    compress?;
    waited?;

    Ok(())
}
