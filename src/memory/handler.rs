/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Handler kinds and the range table.
use std::rc::Rc;

use arrayvec::ArrayVec;

use super::{AddressSpace, MemoryBank, MemoryShare, Word};

/// A read callback: `(offset, mask) -> value`, where `offset` is counted in handler-sized units
/// from the start of the installed range.
pub(crate) type ReadFn = Rc<dyn Fn(u64, u64) -> u64>;
/// A write callback: `(offset, data, mask)`.
pub(crate) type WriteFn = Rc<dyn Fn(u64, u64, u64)>;
/// A tap callback: `(address, data, mask)` of a native bus unit. The data may be modified.
pub(crate) type TapFn = Rc<dyn Fn(u64, &mut u64, u64)>;

/// The kind of a handler installed at an address. See [AddressSpace::read_handler_kind].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Returns the unmapped value, accesses are counted and logged.
    Unmapped,
    /// Returns the unmapped value silently.
    Nop,
    Memory,
    Bank,
    /// A callback of the given width in bits.
    Delegate(u32),
    /// Forwarded to a nested address space.
    Space,
    /// A tap passing accesses through to the handler below it.
    Tap,
}

#[derive(Clone)]
pub(crate) enum ReadHandler {
    Unmapped,
    Nop,
    Memory { share: MemoryShare, offset: usize },
    Bank(MemoryBank),
    Delegate { bytes: usize, read: ReadFn },
    Space(Rc<AddressSpace>),
    Tap { id: u64, tap: TapFn, lower: Rc<ReadHandler> },
}

#[derive(Clone)]
pub(crate) enum WriteHandler {
    Unmapped,
    Nop,
    Memory { share: MemoryShare, offset: usize },
    Bank(MemoryBank),
    Delegate { bytes: usize, write: WriteFn },
    Space(Rc<AddressSpace>),
    Tap { id: u64, tap: TapFn, lower: Rc<WriteHandler> },
}

impl ReadHandler {
    /// Wrap a typed read callback.
    pub fn delegate<T, F>(read: F) -> Self
        where T: Word, F: Fn(u64, T) -> T + 'static
    {
        let read: ReadFn = Rc::new(move |offset: u64, mask: u64| read(offset, T::from_u64(mask)).to_u64());
        ReadHandler::Delegate { bytes: T::BYTES, read }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            ReadHandler::Unmapped => HandlerKind::Unmapped,
            ReadHandler::Nop => HandlerKind::Nop,
            ReadHandler::Memory {..} => HandlerKind::Memory,
            ReadHandler::Bank(..) => HandlerKind::Bank,
            ReadHandler::Delegate { bytes, .. } => HandlerKind::Delegate((bytes * 8) as u32),
            ReadHandler::Space(..) => HandlerKind::Space,
            ReadHandler::Tap {..} => HandlerKind::Tap,
        }
    }
}

impl WriteHandler {
    /// Wrap a typed write callback.
    pub fn delegate<T, F>(write: F) -> Self
        where T: Word, F: Fn(u64, T, T) + 'static
    {
        let write: WriteFn = Rc::new(move |offset: u64, data: u64, mask: u64| {
            write(offset, T::from_u64(data), T::from_u64(mask))
        });
        WriteHandler::Delegate { bytes: T::BYTES, write }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            WriteHandler::Unmapped => HandlerKind::Unmapped,
            WriteHandler::Nop => HandlerKind::Nop,
            WriteHandler::Memory {..} => HandlerKind::Memory,
            WriteHandler::Bank(..) => HandlerKind::Bank,
            WriteHandler::Delegate { bytes, .. } => HandlerKind::Delegate((bytes * 8) as u32),
            WriteHandler::Space(..) => HandlerKind::Space,
            WriteHandler::Tap {..} => HandlerKind::Tap,
        }
    }
}

/// Handlers which can be wrapped by a tap.
pub(crate) trait Passthrough: Sized {
    fn tap(id: u64, tap: TapFn, lower: Rc<Self>) -> Self;
    /// The id, the callback and the lower handler of a tap.
    fn tap_parts(&self) -> Option<(u64, &TapFn, &Rc<Self>)>;
}

macro_rules! impl_passthrough {
    ($($handler:ident),*) => {$(
        impl Passthrough for $handler {
            #[inline]
            fn tap(id: u64, tap: TapFn, lower: Rc<Self>) -> Self {
                $handler::Tap { id, tap, lower }
            }

            #[inline]
            fn tap_parts(&self) -> Option<(u64, &TapFn, &Rc<Self>)> {
                match self {
                    $handler::Tap { id, tap, lower } => Some((*id, tap, lower)),
                    _ => None
                }
            }
        }
    )*};
}

impl_passthrough!(ReadHandler, WriteHandler);

/// The chain of `handler` without the tap `id`, or `None` if the tap isn't in the chain.
/// Taps above the removed one are rebuilt with the same ids and callbacks.
fn untap<H: Passthrough>(handler: &Rc<H>, id: u64) -> Option<Rc<H>> {
    let (tap_id, tap, lower) = handler.tap_parts()?;
    if tap_id == id {
        return Some(Rc::clone(lower))
    }
    untap(lower, id).map(|lower| Rc::new(H::tap(tap_id, Rc::clone(tap), lower)))
}

/// A range of addresses resolved to a handler.
///
/// `origin` is the address the handler was installed at: offsets passed to the handler
/// are counted from it. Pieces of a split entry keep the original `origin`.
pub(crate) struct Entry<H> {
    pub start: u64,
    pub end: u64,
    pub origin: u64,
    pub handler: Rc<H>,
}

impl<H> Clone for Entry<H> {
    fn clone(&self) -> Self {
        Entry { start: self.start, end: self.end, origin: self.origin, handler: Rc::clone(&self.handler) }
    }
}

/// Sorted, contiguous, non-overlapping entries covering `0..=addr_mask`.
pub(crate) struct HandlerTable<H> {
    entries: Vec<Entry<H>>,
}

impl<H> HandlerTable<H> {
    pub fn new(addr_mask: u64, handler: H) -> Self {
        let entry = Entry { start: 0, end: addr_mask, origin: 0, handler: Rc::new(handler) };
        HandlerTable { entries: vec![entry] }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Entry<H>] {
        &self.entries
    }

    /// Find the index of the entry containing `address` with a binary search.
    /// Returns the index and the number of visited entries.
    ///
    /// # Panics
    /// Panics if `address` is beyond the table.
    #[inline]
    pub fn lookup(&self, address: u64) -> (usize, u32) {
        let (mut lo, mut hi) = (0, self.entries.len());
        let mut steps = 0;
        while lo < hi {
            steps += 1;
            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];
            if address < entry.start {
                hi = mid;
            }
            else if address > entry.end {
                lo = mid + 1;
            }
            else {
                return (mid, steps)
            }
        }
        panic!("address {:#x} is beyond the handler table", address)
    }

    #[inline]
    pub fn get(&self, address: u64) -> &Entry<H> {
        &self.entries[self.lookup(address).0]
    }

    /// Install `handler` over `start..=end`, splitting the entries at both ends of the range.
    pub fn install(&mut self, start: u64, end: u64, origin: u64, handler: Rc<H>) {
        debug_assert!(start <= end);
        let (first, _) = self.lookup(start);
        let (last, _) = self.lookup(end);
        let mut pieces: ArrayVec<Entry<H>, 3> = ArrayVec::new();
        let head = &self.entries[first];
        if head.start < start {
            pieces.push(Entry { start: head.start, end: start - 1, ..head.clone() });
        }
        pieces.push(Entry { start, end, origin, handler });
        let tail = &self.entries[last];
        if tail.end > end {
            pieces.push(Entry { start: end + 1, end: tail.end, ..tail.clone() });
        }
        self.entries.splice(first..=last, pieces);
    }

    /// The entries overlapping `start..=end`, clipped to it.
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<Entry<H>> {
        let (first, _) = self.lookup(start);
        let (last, _) = self.lookup(end);
        self.entries[first..=last].iter().map(|entry| Entry {
            start: entry.start.max(start),
            end: entry.end.min(end),
            ..entry.clone()
        }).collect()
    }

    /// Merge neighbours sharing the handler and the origin, the pieces of a single install.
    fn coalesce(&mut self) {
        self.entries.dedup_by(|next, prev| {
            if prev.origin == next.origin && Rc::ptr_eq(&prev.handler, &next.handler) {
                prev.end = next.end;
                true
            }
            else {
                false
            }
        });
    }
}

impl<H: Passthrough> HandlerTable<H> {
    /// Remove the tap `id` from every entry, restoring the handlers below it.
    /// Returns the number of entries the tap was found in.
    pub fn untap(&mut self, id: u64) -> usize {
        let mut found = 0;
        for entry in self.entries.iter_mut() {
            if let Some(handler) = untap(&entry.handler, id) {
                entry.handler = handler;
                found += 1;
            }
        }
        if found != 0 {
            self.coalesce();
        }
        found
    }
}
