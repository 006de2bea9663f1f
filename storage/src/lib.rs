#![cfg_attr(not(any(test, feature = "mock")), no_std)]
// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

/// Write-back sector cache in front of the NOR flash
pub mod cache;
/// Reader and writer for the brace delimited `key : value` config files
pub mod kv;
/// RAM backed NOR flash for host tests
#[cfg(any(test, feature = "mock"))]
pub mod mem;

/// Erase unit of the serial flash
pub const SECTOR_SIZE: usize = 4096;
/// Program unit of the serial flash
pub const PAGE_SIZE: usize = 256;
pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageError {
    ReadError,
    WriteError,
    EraseError,
    InternalError,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Base address of the sector containing `address`.
pub const fn sector_base(address: u32) -> u32 {
    address & !(SECTOR_SIZE as u32 - 1)
}

/// Number of sectors needed to hold `len` bytes.
pub const fn sectors_for(len: u32) -> u32 {
    len.div_ceil(SECTOR_SIZE as u32)
}
