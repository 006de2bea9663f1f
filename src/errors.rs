// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

use hal::FileError;
use ota::DownloadError;
use snafu::Snafu;
use storage::{StorageError, kv::KvError};

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum FotaError {
    #[snafu(display("could not read {path}: {cause:?}"))]
    FileRead {
        path: &'static str,
        cause: FileError,
    },
    #[snafu(display("could not write {path}: {cause:?}"))]
    FileWrite {
        path: &'static str,
        cause: FileError,
    },
    #[snafu(display("malformed {path}: {cause}"))]
    Parse { path: &'static str, cause: KvError },
    #[snafu(display("{path} does not fit its buffer"))]
    Format { path: &'static str },
    #[snafu(display("partition table is full"))]
    TableFull,
    #[snafu(display("not enough free sectors: need {needed}, have {available}"))]
    OutOfSpace { needed: u32, available: u32 },
    #[snafu(display("wifi: {reason}"))]
    Wifi { reason: &'static str },
    #[snafu(display("provisioning link: {reason}"))]
    Provisioning { reason: &'static str },
    #[snafu(display("download failed: {cause:?}"))]
    Download { cause: DownloadError },
    #[snafu(display("sha256 validation failed"))]
    VerificationFailed,
    #[snafu(display("flash: {cause:?}"))]
    Flash { cause: StorageError },
}

pub type FotaResult<T> = Result<T, FotaError>;

impl From<DownloadError> for FotaError {
    fn from(cause: DownloadError) -> Self {
        FotaError::Download { cause }
    }
}

impl From<StorageError> for FotaError {
    fn from(cause: StorageError) -> Self {
        FotaError::Flash { cause }
    }
}
