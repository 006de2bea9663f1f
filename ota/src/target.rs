// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

use embedded_storage::nor_flash::NorFlash;
use storage::cache::SectorCache;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::otatraits::{ImageSink, StorageResult};

/// Writes an image through the sector cache into the free area of the flash
/// starting at `base`.
pub struct OtaWriter<'a, F, const N: usize> {
    cache: &'a mut SectorCache<F, N>,
    base: u32,
}

impl<'a, F: NorFlash, const N: usize> OtaWriter<'a, F, N> {
    pub fn new(cache: &'a mut SectorCache<F, N>, base: u32) -> Self {
        debug!("OtaWriter targeting flash offset 0x{:06x}", base);
        Self { cache, base }
    }
}

impl<F: NorFlash, const N: usize> ImageSink for OtaWriter<'_, F, N> {
    fn write_image_data(&mut self, offset: u32, data: &[u8]) -> StorageResult<()> {
        self.cache.write(self.base + offset, data)
    }

    fn finalize_image(&mut self) -> StorageResult<()> {
        self.cache.flush_all()
    }

    fn invalidate_image(&mut self, len: u32) -> StorageResult<()> {
        warn!("Invalidating image at 0x{:06x}, {} bytes", self.base, len);
        self.cache.erase_range(self.base, len)
    }
}

#[cfg(test)]
mod target_tests {
    use super::*;
    use storage::mem::MemFlash;

    #[test]
    fn offsets_are_relative_to_base() {
        let flash = MemFlash::new(0x10000);
        let mut cache = SectorCache::<_, 2>::new(flash.clone());
        let mut writer = OtaWriter::new(&mut cache, 0x3000);

        writer.write_image_data(0, b"head").unwrap();
        writer.write_image_data(0x1000, b"tail").unwrap();
        writer.finalize_image().unwrap();

        let contents = flash.contents();
        assert_eq!(&contents[0x3000..0x3004], b"head");
        assert_eq!(&contents[0x4000..0x4004], b"tail");
    }

    #[test]
    fn invalidate_erases_what_was_written() {
        let flash = MemFlash::new(0x10000);
        let mut cache = SectorCache::<_, 1>::new(flash.clone());
        let mut writer = OtaWriter::new(&mut cache, 0x2000);

        writer.write_image_data(0, &[0u8; 0x1800]).unwrap();
        writer.invalidate_image(0x1800).unwrap();
        writer.finalize_image().unwrap();

        assert!(flash.contents()[0x2000..0x4000].iter().all(|&b| b == 0xFF));
    }
}
