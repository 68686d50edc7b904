// SPDX-FileCopyrightText: 2024-2025 The MultiROM Contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Android boot image codec, v0 headers only. Every device MultiROM runs
//! on predates header v1; refusing newer headers is safer than silently
//! rewriting fields we do not understand.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    mem,
    path::Path,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use thiserror::Error;
use zerocopy::{little_endian, FromBytes as _, IntoBytes as _};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

/// Maximum size of any individual component, like the kernel. No known
/// MultiROM target comes anywhere near this.
const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unsupported header version: {0}")]
    UnsupportedHeaderVersion(u32),
    #[error("{0:?} field: invalid value: {1}")]
    InvalidFieldValue(&'static str, u32),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("{0:?} field is too long: {1:?}")]
    StringTooLong(&'static str, String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the v0 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawV0 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

fn parse_str(field: &'static str, data: &[u8]) -> Result<String> {
    let data = match data.iter().position(|&b| b == 0) {
        Some(n) => &data[..n],
        None => data,
    };

    str::from_utf8(data)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, data.to_vec(), e))
}

fn encode_str<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    // The NUL terminator needs a byte too.
    if value.len() >= N {
        return Err(Error::StringTooLong(field, value.to_string()));
    }

    let mut buf = [0u8; N];
    buf[..value.len()].copy_from_slice(value.as_bytes());
    Ok(buf)
}

fn padding_for(size: usize, page_size: u32) -> usize {
    let page_size = page_size as usize;
    (page_size - size % page_size) % page_size
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootImage {
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub id: [u32; 8],
    pub extra_cmdline: String,
    pub kernel: Vec<u8>,
    pub ramdisk: Vec<u8>,
    pub second: Vec<u8>,
}

impl BootImage {
    pub fn from_reader(mut reader: impl Read + Seek) -> Result<Self> {
        let mut raw_bytes = [0u8; mem::size_of::<RawV0>()];
        reader.read_exact(&mut raw_bytes)?;

        // The buffer length always matches, so this cannot fail.
        let raw = RawV0::read_from_bytes(raw_bytes.as_slice())
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if raw.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw.magic));
        }

        let header_version = raw.header_version.get();
        if header_version != 0 {
            return Err(Error::UnsupportedHeaderVersion(header_version));
        }

        let page_size = raw.page_size.get();
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidFieldValue("page_size", page_size));
        }

        // The header occupies the first page on its own.
        reader.seek(SeekFrom::Start(u64::from(page_size)))?;

        let mut read_component = |field, size: u32| -> Result<Vec<u8>> {
            if size > COMPONENT_MAX_SIZE {
                return Err(Error::InvalidFieldValue(field, size));
            }

            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data)?;
            reader.seek(SeekFrom::Current(padding_for(data.len(), page_size) as i64))?;
            Ok(data)
        };

        let kernel = read_component("kernel_size", raw.kernel_size.get())?;
        let ramdisk = read_component("ramdisk_size", raw.ramdisk_size.get())?;
        let second = read_component("second_size", raw.second_size.get())?;

        Ok(Self {
            kernel_addr: raw.kernel_addr.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
            second_addr: raw.second_addr.get(),
            tags_addr: raw.tags_addr.get(),
            page_size,
            os_version: raw.os_version.get(),
            name: parse_str("name", &raw.name)?,
            cmdline: parse_str("cmdline", &raw.cmdline)?,
            id: raw.id.map(|v| v.get()),
            extra_cmdline: parse_str("extra_cmdline", &raw.extra_cmdline)?,
            kernel,
            ramdisk,
            second,
        })
    }

    pub fn to_writer(&self, mut writer: impl Write) -> Result<()> {
        let raw = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: (self.kernel.len() as u32).into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: (self.ramdisk.len() as u32).into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: (self.second.len() as u32).into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: little_endian::U32::new(0),
            os_version: self.os_version.into(),
            name: encode_str("name", &self.name)?,
            cmdline: encode_str("cmdline", &self.cmdline)?,
            id: self.id.map(Into::into),
            extra_cmdline: encode_str("extra_cmdline", &self.extra_cmdline)?,
        };

        let raw_bytes = raw.as_bytes();
        writer.write_all(raw_bytes)?;
        write_padding(&mut writer, raw_bytes.len(), self.page_size)?;

        for component in [&self.kernel, &self.ramdisk, &self.second] {
            writer.write_all(component)?;
            write_padding(&mut writer, component.len(), self.page_size)?;
        }

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Stamp the header's name field, truncating to what fits.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.chars().take(BOOT_NAME_SIZE - 1).collect();
    }
}

fn write_padding(mut writer: impl Write, size: usize, page_size: u32) -> io::Result<()> {
    let padding = padding_for(size, page_size);
    let zeros = vec![0u8; padding];
    writer.write_all(&zeros)
}
