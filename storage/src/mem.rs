// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::cell::RefCell;
use std::rc::Rc;

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use crate::SECTOR_SIZE;

struct Inner {
    data: Vec<u8>,
    erases: usize,
    programs: usize,
}

/// NOR flash in RAM. Programming can only clear bits, erasing sets a whole
/// sector back to 0xFF. Clones share the same memory.
#[derive(Clone)]
pub struct MemFlash {
    inner: Rc<RefCell<Inner>>,
}

impl MemFlash {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                data: vec![0xFF; size],
                erases: 0,
                programs: 0,
            })),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    /// Sectors erased so far
    pub fn erase_count(&self) -> usize {
        self.inner.borrow().erases
    }

    /// Program operations so far
    pub fn program_count(&self) -> usize {
        self.inner.borrow().programs
    }

    fn check(&self, offset: u32, len: usize) -> Result<(), NorFlashErrorKind> {
        match (offset as usize).checked_add(len) {
            Some(end) if end <= self.inner.borrow().data.len() => Ok(()),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }
}

impl ErrorType for MemFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.inner.borrow().data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.inner.borrow().data.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE as u32 != 0 || to % SECTOR_SIZE as u32 != 0 || to < from {
            return Err(NorFlashErrorKind::NotAligned);
        }
        self.check(from, (to - from) as usize)?;
        let mut inner = self.inner.borrow_mut();
        inner.data[from as usize..to as usize].fill(0xFF);
        inner.erases += (to - from) as usize / SECTOR_SIZE;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len())?;
        let mut inner = self.inner.borrow_mut();
        let start = offset as usize;
        for (cell, &b) in inner.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= b;
        }
        inner.programs += 1;
        Ok(())
    }
}
