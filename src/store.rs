// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Loading and saving the updater's files on the device filesystem.

use hal::{FileError, FileStore};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use ota::job::OtaJobConfig;

use crate::config::{self, PartConfig};
use crate::errors::{FotaError, FotaResult};
use crate::settings::{
    BOOT_FILE, BOOTFAIL_FILE, CONFIG_FILE_MAX_LEN, FOTA_FILE, LASTBOOT_FILE, PART_FILE,
    ROOT_CA_FILE,
};

/// Reads `path` into `buf` and returns it as text.
fn read_text<'b, S: FileStore>(
    fs: &mut S,
    path: &'static str,
    buf: &'b mut [u8],
) -> FotaResult<&'b str> {
    let len = fs
        .read(path, buf)
        .map_err(|cause| FotaError::FileRead { path, cause })?;
    core::str::from_utf8(&buf[..len]).map_err(|e| FotaError::Parse {
        path,
        cause: storage::kv::KvError::Syntax(e.valid_up_to()),
    })
}

fn write_text<S: FileStore>(fs: &mut S, path: &'static str, text: &str) -> FotaResult<()> {
    fs.write(path, text.as_bytes())
        .map_err(|cause| FotaError::FileWrite { path, cause })
}

pub fn load_part_config<S: FileStore>(fs: &mut S) -> FotaResult<PartConfig> {
    let mut buf = [0u8; CONFIG_FILE_MAX_LEN];
    let text = read_text(fs, PART_FILE, &mut buf)?;
    PartConfig::parse(text).map_err(|cause| FotaError::Parse {
        path: PART_FILE,
        cause,
    })
}

pub fn save_part_config<S: FileStore>(fs: &mut S, part: &PartConfig) -> FotaResult<()> {
    let text = part
        .to_file()
        .map_err(|_| FotaError::Format { path: PART_FILE })?;
    write_text(fs, PART_FILE, &text)
}

pub fn load_job<S: FileStore>(fs: &mut S) -> FotaResult<OtaJobConfig> {
    let mut buf = [0u8; CONFIG_FILE_MAX_LEN];
    let text = read_text(fs, FOTA_FILE, &mut buf)?;
    OtaJobConfig::parse(text).map_err(|cause| FotaError::Parse {
        path: FOTA_FILE,
        cause,
    })
}

/// Loads the OTA job, falling back to a blank one (provisioning) when the
/// file is missing or unreadable.
pub fn load_job_or_blank<S: FileStore>(fs: &mut S) -> OtaJobConfig {
    match load_job(fs) {
        Ok(job) => job,
        Err(e) => {
            warn!("No usable OTA job, starting blank. {}", e);
            OtaJobConfig::blank()
        }
    }
}

pub fn save_job<S: FileStore>(fs: &mut S, job: &OtaJobConfig) -> FotaResult<()> {
    let text = job
        .to_file()
        .map_err(|_| FotaError::Format { path: FOTA_FILE })?;
    write_text(fs, FOTA_FILE, &text)
}

/// Image index the bootloader will start, `None` if the pointer is missing.
pub fn read_boot_index<S: FileStore>(fs: &mut S) -> FotaResult<Option<u32>> {
    let mut buf = [0u8; 128];
    let text = match read_text(fs, BOOT_FILE, &mut buf) {
        Ok(text) => text,
        Err(FotaError::FileRead {
            cause: FileError::NotFound,
            ..
        }) => return Ok(None),
        Err(e) => return Err(e),
    };
    config::parse_boot_file(text).map_err(|cause| FotaError::Parse {
        path: BOOT_FILE,
        cause,
    })
}

pub fn write_boot_index<S: FileStore>(fs: &mut S, index: u32) -> FotaResult<()> {
    write_text(fs, BOOT_FILE, &config::boot_file(index))
}

/// Reads a single decimal counter file. Missing or garbled files read as zero.
fn read_counter<S: FileStore>(fs: &mut S, path: &'static str) -> i64 {
    let mut buf = [0u8; 16];
    read_text(fs, path, &mut buf)
        .ok()
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0)
}

fn write_counter<S: FileStore>(fs: &mut S, path: &'static str, value: i64) -> FotaResult<()> {
    let mut text: heapless::String<24> = heapless::String::new();
    core::fmt::Write::write_fmt(&mut text, format_args!("{}\n", value))
        .map_err(|_| FotaError::Format { path })?;
    write_text(fs, path, &text)
}

/// Marks the current boot as good: clears the failure counter and records the
/// image that booted.
pub fn bootpass<S: FileStore>(fs: &mut S) -> FotaResult<()> {
    write_counter(fs, BOOTFAIL_FILE, 0)?;
    set_lastboot(fs)
}

pub fn inc_bootfail<S: FileStore>(fs: &mut S) -> FotaResult<i64> {
    let count = read_counter(fs, BOOTFAIL_FILE) + 1;
    write_counter(fs, BOOTFAIL_FILE, count)?;
    Ok(count)
}

pub fn bootfail_count<S: FileStore>(fs: &mut S) -> i64 {
    read_counter(fs, BOOTFAIL_FILE)
}

/// Copies the boot pointer into the last boot record, -1 when there is none.
pub fn set_lastboot<S: FileStore>(fs: &mut S) -> FotaResult<()> {
    let index = read_boot_index(fs)
        .ok()
        .flatten()
        .map_or(-1, i64::from);
    write_counter(fs, LASTBOOT_FILE, index)
}

pub fn read_last_boot<S: FileStore>(fs: &mut S) -> i64 {
    read_counter(fs, LASTBOOT_FILE)
}

/// Loads the PEM CA certificate into `buf`. A missing file yields an empty
/// certificate, which the TLS layer rejects.
pub fn load_root_ca<'b, S: FileStore>(fs: &mut S, buf: &'b mut [u8]) -> FotaResult<&'b [u8]> {
    match fs.read(ROOT_CA_FILE, buf) {
        Ok(len) => Ok(&buf[..len]),
        Err(FileError::NotFound) => {
            warn!("{} missing", ROOT_CA_FILE);
            Ok(&[])
        }
        Err(cause) => Err(FotaError::FileRead {
            path: ROOT_CA_FILE,
            cause,
        }),
    }
}
