/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::cell::{Cell, RefCell};
use core::fmt;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::ConfigError;
use super::MemoryShare;

/// An indirect memory handler which target can be swapped at runtime.
///
/// A bank is installed once into one or more address spaces. Selecting another entry
/// or base redirects all of them at once in `O(1)`, without touching the handler tables.
/// Each native access reads the target exactly once, so a swap is never observed
/// partially.
///
/// Cloning a bank produces another handle to the same bank.
#[derive(Clone)]
pub struct MemoryBank {
    inner: Rc<BankInner>
}

struct BankInner {
    name: String,
    entries: RefCell<Vec<Option<BankTarget>>>,
    current: RefCell<Option<BankTarget>>,
    entry: Cell<Option<usize>>,
}

#[derive(Clone)]
pub(crate) struct BankTarget {
    pub share: MemoryShare,
    pub offset: usize,
}

impl MemoryBank {
    /// Create a bank with no target. Reads from it return the unmapped value of the space,
    /// writes are discarded.
    pub fn new(name: &str) -> Self {
        MemoryBank {
            inner: Rc::new(BankInner {
                name: name.into(),
                entries: RefCell::new(Vec::new()),
                current: RefCell::new(None),
                entry: Cell::new(None)
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configure `count` entries starting at `first`, the n-th pointing at
    /// `offset + n * stride` of `share`.
    pub fn configure_entries(&self, first: usize, count: usize, share: &MemoryShare, offset: usize, stride: usize) {
        for n in 0..count {
            self.configure_entry(first + n, share, offset + n * stride);
        }
    }

    pub fn configure_entry(&self, entry: usize, share: &MemoryShare, offset: usize) {
        let mut entries = self.inner.entries.borrow_mut();
        if entries.len() <= entry {
            entries.resize(entry + 1, None);
        }
        let target = BankTarget { share: share.clone(), offset };
        entries[entry] = Some(target.clone());
        if self.inner.entry.get() == Some(entry) {
            *self.inner.current.borrow_mut() = Some(target);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    /// Select a configured entry.
    pub fn set_entry(&self, entry: usize) -> Result<(), ConfigError> {
        let target = match self.inner.entries.borrow().get(entry) {
            Some(Some(target)) => target.clone(),
            _ => return Err(ConfigError::UnknownBankEntry { bank: self.inner.name.clone(), entry })
        };
        trace!("bank `{}`: entry {}", self.inner.name, entry);
        *self.inner.current.borrow_mut() = Some(target);
        self.inner.entry.set(Some(entry));
        Ok(())
    }

    /// The selected entry, if the target was selected by an entry.
    pub fn entry(&self) -> Option<usize> {
        self.inner.entry.get()
    }

    /// Point the bank directly at `offset` of `share`.
    pub fn set_base(&self, share: &MemoryShare, offset: usize) {
        *self.inner.current.borrow_mut() = Some(BankTarget { share: share.clone(), offset });
        self.inner.entry.set(None);
    }

    /// Detach the bank from its target.
    pub fn clear(&self) {
        *self.inner.current.borrow_mut() = None;
        self.inner.entry.set(None);
    }

    /// The current target: the share and the offset of the bank's first byte.
    pub fn base(&self) -> Option<(MemoryShare, usize)> {
        self.target().map(|target| (target.share, target.offset))
    }

    pub fn ptr_eq(&self, other: &MemoryBank) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub(crate) fn target(&self) -> Option<BankTarget> {
        self.inner.current.borrow().clone()
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBank")
         .field("name", &self.inner.name)
         .field("entry", &self.inner.entry.get())
         .field("entries", &self.entry_count())
         .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_entries() {
        let rom = MemoryShare::from_slice("rom", &[0, 1, 2, 3, 4, 5, 6, 7]);
        let bank = MemoryBank::new("bank1");
        assert!(bank.base().is_none());
        bank.configure_entries(0, 4, &rom, 0, 2);
        assert_eq!(bank.entry_count(), 4);
        bank.set_entry(2).unwrap();
        assert_eq!(bank.entry(), Some(2));
        let (share, offset) = bank.base().unwrap();
        assert!(share.ptr_eq(&rom));
        assert_eq!(offset, 4);
        assert!(matches!(bank.set_entry(4), Err(ConfigError::UnknownBankEntry { entry: 4, .. })));
        assert_eq!(bank.entry(), Some(2));
        // reconfiguring the selected entry retargets the bank
        bank.configure_entry(2, &rom, 6);
        assert_eq!(bank.base().unwrap().1, 6);
        bank.set_base(&rom, 1);
        assert_eq!(bank.entry(), None);
        assert_eq!(bank.base().unwrap().1, 1);
        bank.clear();
        assert!(bank.base().is_none());
        let other = bank.clone();
        assert!(other.ptr_eq(&bank));
    }

    #[test]
    fn bank_sparse_entries() {
        let ram = MemoryShare::new("ram", 16);
        let bank = MemoryBank::new("sparse");
        bank.configure_entry(3, &ram, 8);
        assert_eq!(bank.entry_count(), 4);
        assert!(bank.set_entry(1).is_err());
        assert!(bank.set_entry(3).is_ok());
    }
}
