// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub use storage::{StorageError, StorageResult};

/// Destination of a downloaded image.
///
/// The download session only knows image relative offsets; where the bytes end
/// up is up to the implementation.
pub trait ImageSink {
    /// Writes data in the given offset, relative to the start of the image
    fn write_image_data(&mut self, offset: u32, data: &[u8]) -> StorageResult<()>;

    /// Makes every byte written so far durable
    fn finalize_image(&mut self) -> StorageResult<()>;

    /// Discards a rejected image, leaving the first `len` bytes of the target area erased
    fn invalidate_image(&mut self, len: u32) -> StorageResult<()>;
}
