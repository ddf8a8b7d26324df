/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::cell::Cell;
use core::fmt;
use std::rc::Rc;

use super::{Endianness, lane_shift};

/// A named block of memory shared between address spaces, banks and devices.
///
/// Bytes are stored in bus address order. Cloning a share produces another handle
/// to the same memory.
#[derive(Clone)]
pub struct MemoryShare {
    name: Rc<str>,
    cells: Rc<[Cell<u8>]>,
}

impl MemoryShare {
    /// Create a zero-filled share.
    pub fn new(name: &str, len: usize) -> Self {
        MemoryShare::filled(name, len, 0)
    }

    pub fn filled(name: &str, len: usize, value: u8) -> Self {
        let cells = (0..len).map(|_| Cell::new(value)).collect();
        MemoryShare { name: name.into(), cells }
    }

    pub fn from_slice(name: &str, data: &[u8]) -> Self {
        let cells = data.iter().copied().map(Cell::new).collect();
        MemoryShare { name: name.into(), cells }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn get(&self, offset: usize) -> Option<u8> {
        self.cells.get(offset).map(Cell::get)
    }

    /// # Panics
    /// Panics if `offset` is out of bounds.
    #[inline]
    pub fn read_byte(&self, offset: usize) -> u8 {
        self.cells[offset].get()
    }

    /// # Panics
    /// Panics if `offset` is out of bounds.
    #[inline]
    pub fn write_byte(&self, offset: usize, value: u8) {
        self.cells[offset].set(value)
    }

    pub fn fill(&self, value: u8) {
        for cell in self.cells.iter() {
            cell.set(value);
        }
    }

    /// # Panics
    /// Panics if `data` doesn't fit at `offset`.
    pub fn copy_from_slice(&self, offset: usize, data: &[u8]) {
        let cells = &self.cells[offset..offset + data.len()];
        for (cell, &byte) in cells.iter().zip(data) {
            cell.set(byte);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.cells.iter().map(Cell::get).collect()
    }

    /// Whether both handles refer to the same memory.
    pub fn ptr_eq(&self, other: &MemoryShare) -> bool {
        Rc::ptr_eq(&self.cells, &other.cells)
    }

    /// Load a `bytes`-wide value stored at `offset`.
    #[inline]
    pub(crate) fn load(&self, offset: usize, bytes: usize, endianness: Endianness) -> Option<u64> {
        let cells = self.cells.get(offset..offset.checked_add(bytes)?)?;
        let mut value = 0u64;
        for (pos, cell) in cells.iter().enumerate() {
            value |= u64::from(cell.get()) << lane_shift(endianness, pos, 1, bytes);
        }
        Some(value)
    }

    /// Store bits of `data` selected by `mask` as a `bytes`-wide value at `offset`.
    /// Returns `false` if the value doesn't fit.
    #[inline]
    pub(crate) fn store(&self, offset: usize, bytes: usize, endianness: Endianness, data: u64, mask: u64) -> bool {
        let cells = match offset.checked_add(bytes).and_then(|end| self.cells.get(offset..end)) {
            Some(cells) => cells,
            None => return false
        };
        for (pos, cell) in cells.iter().enumerate() {
            let shift = lane_shift(endianness, pos, 1, bytes);
            let bits = (mask >> shift) as u8;
            if bits != 0 {
                cell.set((cell.get() & !bits) | ((data >> shift) as u8 & bits));
            }
        }
        true
    }
}

impl fmt::Debug for MemoryShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryShare")
         .field("name", &self.name)
         .field("len", &self.len())
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_load_store() {
        let share = MemoryShare::from_slice("ram", &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(share.load(0, 4, Endianness::Little), Some(0x4433_2211));
        assert_eq!(share.load(0, 4, Endianness::Big), Some(0x1122_3344));
        assert_eq!(share.load(2, 2, Endianness::Little), Some(0x4433));
        assert_eq!(share.load(3, 2, Endianness::Little), None);
        assert!(share.store(0, 2, Endianness::Big, 0xaabb, 0x00ff));
        assert_eq!(share.to_vec(), vec![0x11, 0xbb, 0x33, 0x44]);
        assert!(share.store(2, 2, Endianness::Little, 0xffff, 0x0f0f));
        assert_eq!(share.to_vec(), vec![0x11, 0xbb, 0x3f, 0x4f]);
        assert!(!share.store(4, 1, Endianness::Little, 0, 0xff));
    }

    #[test]
    fn share_handles() {
        let share = MemoryShare::filled("nvram", 8, 0xff);
        let other = share.clone();
        other.write_byte(3, 0x42);
        assert_eq!(share.read_byte(3), 0x42);
        assert!(share.ptr_eq(&other));
        assert!(!share.ptr_eq(&MemoryShare::new("nvram", 8)));
        share.copy_from_slice(6, &[1, 2]);
        assert_eq!(other.get(7), Some(2));
        assert_eq!(other.get(8), None);
        share.fill(0);
        assert_eq!(other.to_vec(), vec![0;8]);
        assert_eq!(share.name(), "nvram");
        assert_eq!(share.len(), 8);
    }
}
