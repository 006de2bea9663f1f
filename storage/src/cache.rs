// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! A small write-back cache of whole flash sectors.
//!
//! Writes land in a RAM copy of the sector and only reach the flash when the
//! slot is flushed, either explicitly or because it was picked as the eviction
//! victim. Flushing compares the new contents with what is on flash: if every
//! change only clears bits the dirty pages are programmed in place, otherwise
//! the sector is erased and every non blank page is programmed again.

use embedded_storage::nor_flash::{NorFlash, NorFlashError};

#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::{PAGE_SIZE, PAGES_PER_SECTOR, SECTOR_SIZE, StorageError, StorageResult, sector_base};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Matches the flash contents
    Valid,
    /// Holds writes that have not reached the flash yet
    Dirty,
}

struct Slot {
    address: u32,
    last_used: u32,
    state: SlotState,
    data: [u8; SECTOR_SIZE],
}

impl Slot {
    const fn empty() -> Self {
        Self {
            address: 0,
            last_used: 0,
            state: SlotState::Empty,
            data: [0xFF; SECTOR_SIZE],
        }
    }
}

pub struct SectorCache<F, const N: usize> {
    flash: F,
    slots: [Slot; N],
    clock: u32,
    /// Scratch copy of the on-flash sector used while flushing
    work: [u8; SECTOR_SIZE],
}

impl<F: NorFlash, const N: usize> SectorCache<F, N> {
    const AT_LEAST_ONE_SLOT: () = assert!(N >= 1, "a sector cache needs at least one slot");

    /// Wraps `flash` with `N` empty slots.
    pub fn new(flash: F) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::AT_LEAST_ONE_SLOT;
        Self {
            flash,
            slots: core::array::from_fn(|_| Slot::empty()),
            clock: 0,
            work: [0xFF; SECTOR_SIZE],
        }
    }

    pub fn slot_state(&self, slot: usize) -> Option<(u32, SlotState)> {
        self.slots.get(slot).map(|s| (s.address, s.state))
    }

    fn tick(&mut self) -> u32 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    /// Returns the slot to use for the sector containing `address`: the slot
    /// already holding it, else an empty one, else the least recently used
    /// slot after flushing it.
    pub fn find(&mut self, address: u32) -> StorageResult<usize> {
        let address = sector_base(address);

        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.state != SlotState::Empty && s.address == address)
        {
            return Ok(idx);
        }

        if let Some(idx) = self.slots.iter().position(|s| s.state == SlotState::Empty) {
            return Ok(idx);
        }

        let clock = self.clock;
        let victim = self
            .slots
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| clock.wrapping_sub(s.last_used))
            .map(|(i, _)| i)
            .ok_or(StorageError::InternalError)?;

        debug!(
            "Evicting sector 0x{:06x} from slot {}",
            self.slots[victim].address, victim
        );
        self.flush(victim)?;
        self.slots[victim].state = SlotState::Empty;
        Ok(victim)
    }

    /// Makes the sector containing `address` resident and returns its slot.
    pub fn load(&mut self, address: u32) -> StorageResult<usize> {
        let address = sector_base(address);
        let idx = self.find(address)?;
        let slot = &mut self.slots[idx];
        if slot.state == SlotState::Empty {
            self.flash.read(address, &mut slot.data).map_err(|e| {
                error!("Flash read at 0x{:06x} failed: {:?}", address, e.kind());
                StorageError::ReadError
            })?;
            slot.address = address;
            slot.state = SlotState::Valid;
        }
        Ok(idx)
    }

    /// Reads `buf.len()` bytes starting at `address`, through the cache.
    pub fn read(&mut self, mut address: u32, buf: &mut [u8]) -> StorageResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let offset = address as usize % SECTOR_SIZE;
            let n = (buf.len() - done).min(SECTOR_SIZE - offset);
            let idx = self.load(address)?;
            let now = self.tick();
            let slot = &mut self.slots[idx];
            buf[done..done + n].copy_from_slice(&slot.data[offset..offset + n]);
            slot.last_used = now;
            done += n;
            address += n as u32;
        }
        Ok(())
    }

    /// Writes `data` at `address` into the cache. Writes may span sectors.
    pub fn write(&mut self, mut address: u32, data: &[u8]) -> StorageResult<()> {
        let mut done = 0;
        while done < data.len() {
            let offset = address as usize % SECTOR_SIZE;
            let n = (data.len() - done).min(SECTOR_SIZE - offset);
            let idx = self.load(address)?;
            let now = self.tick();
            let slot = &mut self.slots[idx];
            slot.data[offset..offset + n].copy_from_slice(&data[done..done + n]);
            slot.state = SlotState::Dirty;
            slot.last_used = now;
            done += n;
            address += n as u32;
        }
        Ok(())
    }

    /// Writes a dirty slot back to flash. Clean and empty slots are left alone.
    pub fn flush(&mut self, idx: usize) -> StorageResult<()> {
        let slot = self.slots.get_mut(idx).ok_or(StorageError::InternalError)?;
        if slot.state != SlotState::Dirty {
            return Ok(());
        }
        program_sector(&mut self.flash, &mut self.work, slot.address, &slot.data)?;
        slot.state = SlotState::Valid;
        Ok(())
    }

    pub fn flush_all(&mut self) -> StorageResult<()> {
        for idx in 0..N {
            self.flush(idx)?;
        }
        Ok(())
    }

    /// Forgets any cached sector inside `[start, start + len)` without writing it back.
    pub fn discard_range(&mut self, start: u32, len: u32) {
        let end = start.saturating_add(len);
        for slot in self.slots.iter_mut() {
            let inside = slot.address >= sector_base(start) && slot.address < end;
            if slot.state != SlotState::Empty && inside {
                slot.state = SlotState::Empty;
            }
        }
    }

    /// Erases every sector overlapping `[start, start + len)`, dropping cached copies first.
    pub fn erase_range(&mut self, start: u32, len: u32) -> StorageResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.discard_range(start, len);
        let from = sector_base(start);
        let to = sector_base(start.saturating_add(len - 1)) + SECTOR_SIZE as u32;
        info!("Erasing flash 0x{:06x}..0x{:06x}", from, to);
        self.flash.erase(from, to).map_err(|e| {
            error!("Flash erase 0x{:06x}..0x{:06x} failed: {:?}", from, to, e.kind());
            StorageError::EraseError
        })
    }
}

/// Pages needing a program cycle if `new` can be reached from `old` by
/// clearing bits only, `None` if some bit has to go from 0 to 1.
fn pages_to_program(new: &[u8; SECTOR_SIZE], old: &[u8; SECTOR_SIZE]) -> Option<u32> {
    let mut pages = 0u32;
    for (page, (n, o)) in new
        .chunks_exact(PAGE_SIZE)
        .zip(old.chunks_exact(PAGE_SIZE))
        .enumerate()
    {
        for (&n, &o) in n.iter().zip(o) {
            if n & !o != 0 {
                return None;
            }
            if n != o {
                pages |= 1 << page;
            }
        }
    }
    Some(pages)
}

/// Pages of a freshly erased sector that are not blank.
fn non_blank_pages(data: &[u8; SECTOR_SIZE]) -> u32 {
    data.chunks_exact(PAGE_SIZE)
        .enumerate()
        .filter(|(_, page)| page.iter().any(|&b| b != 0xFF))
        .fold(0, |acc, (page, _)| acc | 1 << page)
}

fn program_sector<F: NorFlash>(
    flash: &mut F,
    work: &mut [u8; SECTOR_SIZE],
    address: u32,
    data: &[u8; SECTOR_SIZE],
) -> StorageResult<()> {
    flash.read(address, work).map_err(|e| {
        error!("Flash read at 0x{:06x} failed: {:?}", address, e.kind());
        StorageError::ReadError
    })?;

    let pages = match pages_to_program(data, work) {
        Some(pages) => pages,
        None => {
            flash
                .erase(address, address + SECTOR_SIZE as u32)
                .map_err(|e| {
                    error!("Flash erase at 0x{:06x} failed: {:?}", address, e.kind());
                    StorageError::EraseError
                })?;
            non_blank_pages(data)
        }
    };

    for page in (0..PAGES_PER_SECTOR).filter(|p| pages & (1 << p) != 0) {
        let offset = page * PAGE_SIZE;
        flash
            .write(address + offset as u32, &data[offset..offset + PAGE_SIZE])
            .map_err(|e| {
                error!(
                    "Flash program at 0x{:06x} failed: {:?}",
                    address + offset as u32,
                    e.kind()
                );
                StorageError::WriteError
            })?;
    }
    Ok(())
}
