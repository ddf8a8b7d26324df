/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Declarative address maps.
use core::fmt;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::ConfigError;
use super::handler::{ReadHandler, WriteHandler};
use super::{AddressSpace, HandlerKind, MemoryBank, MemoryShare, Word};

/// A list of address ranges with their handlers, installed at once with
/// [AddressSpace::install_map].
///
/// ```
/// use emucore::memory::{AddressMap, MemoryShare};
///
/// let rom = MemoryShare::from_slice("rom", &[0xc3, 0x00, 0x00]);
/// let mut map = AddressMap::new();
/// map.range(0x0000, 0x3fff).rom(&rom);
/// map.range(0x4000, 0x7fff).ram_anon().mirror(0x8000);
/// map.range(0xc000, 0xc0ff).read::<u8, _>(|offset, _| offset as u8).nop_write();
/// assert_eq!(map.len(), 3);
/// ```
///
/// Ranges of a single map must not overlap: a conflicting range is reported by
/// [AddressMap::validate] as [ConfigError::OverlappingRange].
#[derive(Clone, Default)]
pub struct AddressMap {
    entries: Vec<MapEntry>,
}

/// A single range of an [AddressMap].
#[derive(Clone)]
pub struct MapEntry {
    start: u64,
    end: u64,
    mirror: u64,
    read: MapSide<ReadHandler>,
    write: MapSide<WriteHandler>,
    share: Option<MemoryShare>,
    share_offset: usize,
    submap: Option<AddressMap>,
}

/// A checked install of a single side, submaps after their parents.
enum Install {
    Read { start: u64, end: u64, mirror: u64, handler: ReadHandler },
    Write { start: u64, end: u64, mirror: u64, handler: WriteHandler },
}

#[derive(Clone)]
enum MapSide<H> {
    /// Leave the side as it is.
    Keep,
    /// The memory share of the entry.
    Memory,
    Handler(H),
}

impl AddressMap {
    pub fn new() -> Self {
        AddressMap::default()
    }

    /// Append a range and return it for configuration.
    pub fn range(&mut self, start: u64, end: u64) -> &mut MapEntry {
        self.entries.push(MapEntry {
            start,
            end,
            mirror: 0,
            read: MapSide::Keep,
            write: MapSide::Keep,
            share: None,
            share_offset: 0,
            submap: None
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that no two ranges overlap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ranges: Vec<(u64, u64)> = self.entries.iter().map(|e| (e.start, e.end)).collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let ((first_start, first_end), (second_start, second_end)) = (pair[0], pair[1]);
            if second_start <= first_end {
                return Err(ConfigError::OverlappingRange { first_start, first_end, second_start, second_end })
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl MapEntry {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Repeat the range at every combination of the `mirror` address bits.
    pub fn mirror(&mut self, mirror: u64) -> &mut Self {
        self.mirror = mirror;
        self
    }

    /// Read-only memory backed by `share`.
    pub fn rom(&mut self, share: &MemoryShare) -> &mut Self {
        self.share = Some(share.clone());
        self.read = MapSide::Memory;
        self
    }

    /// Read-write memory backed by `share`.
    pub fn ram(&mut self, share: &MemoryShare) -> &mut Self {
        self.share = Some(share.clone());
        self.read = MapSide::Memory;
        self.write = MapSide::Memory;
        self
    }

    /// Read-write memory backed by a zero-filled share allocated when the map is installed.
    pub fn ram_anon(&mut self) -> &mut Self {
        self.share = None;
        self.read = MapSide::Memory;
        self.write = MapSide::Memory;
        self
    }

    /// Write-only memory backed by `share`.
    pub fn writeonly(&mut self, share: &MemoryShare) -> &mut Self {
        self.share = Some(share.clone());
        self.write = MapSide::Memory;
        self
    }

    /// Leave the write side of the range untouched.
    pub fn readonly(&mut self) -> &mut Self {
        self.write = MapSide::Keep;
        self
    }

    /// The offset in the memory share of the first byte of the range.
    pub fn share_offset(&mut self, offset: usize) -> &mut Self {
        self.share_offset = offset;
        self
    }

    pub fn bank(&mut self, bank: &MemoryBank) -> &mut Self {
        self.read_bank(bank).write_bank(bank)
    }

    pub fn read_bank(&mut self, bank: &MemoryBank) -> &mut Self {
        self.read = MapSide::Handler(ReadHandler::Bank(bank.clone()));
        self
    }

    pub fn write_bank(&mut self, bank: &MemoryBank) -> &mut Self {
        self.write = MapSide::Handler(WriteHandler::Bank(bank.clone()));
        self
    }

    /// A read callback, see [AddressSpace::install_read_handler].
    pub fn read<T, F>(&mut self, read: F) -> &mut Self
        where T: Word, F: Fn(u64, T) -> T + 'static
    {
        self.read = MapSide::Handler(ReadHandler::delegate::<T, F>(read));
        self
    }

    /// A write callback, see [AddressSpace::install_write_handler].
    pub fn write<T, F>(&mut self, write: F) -> &mut Self
        where T: Word, F: Fn(u64, T, T) + 'static
    {
        self.write = MapSide::Handler(WriteHandler::delegate::<T, F>(write));
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.nop_read().nop_write()
    }

    pub fn nop_read(&mut self) -> &mut Self {
        self.read = MapSide::Handler(ReadHandler::Nop);
        self
    }

    pub fn nop_write(&mut self) -> &mut Self {
        self.write = MapSide::Handler(WriteHandler::Nop);
        self
    }

    pub fn unmap(&mut self) -> &mut Self {
        self.unmap_read().unmap_write()
    }

    pub fn unmap_read(&mut self) -> &mut Self {
        self.read = MapSide::Handler(ReadHandler::Unmapped);
        self
    }

    pub fn unmap_write(&mut self) -> &mut Self {
        self.write = MapSide::Handler(WriteHandler::Unmapped);
        self
    }

    /// Forward the range to a nested address space.
    pub fn space(&mut self, space: &Rc<AddressSpace>) -> &mut Self {
        self.read = MapSide::Handler(ReadHandler::Space(Rc::clone(space)));
        self.write = MapSide::Handler(WriteHandler::Space(Rc::clone(space)));
        self
    }

    /// Install the ranges of `map` relative to the start of this range.
    pub fn submap(&mut self, map: AddressMap) -> &mut Self {
        self.submap = Some(map);
        self
    }
}

impl<H> MapSide<H> {
    fn describe(&self, kind: impl Fn(&H) -> HandlerKind) -> String {
        match self {
            MapSide::Keep => "keep".into(),
            MapSide::Memory => "memory".into(),
            MapSide::Handler(handler) => format!("{:?}", kind(handler))
        }
    }
}

impl fmt::Debug for MapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapEntry")
         .field("start", &format_args!("{:#x}", self.start))
         .field("end", &format_args!("{:#x}", self.end))
         .field("mirror", &format_args!("{:#x}", self.mirror))
         .field("read", &self.read.describe(ReadHandler::kind))
         .field("write", &self.write.describe(WriteHandler::kind))
         .field("submap", &self.submap)
         .finish()
    }
}

impl AddressSpace {
    /// Install all ranges of `map` at their addresses.
    pub fn install_map(&self, map: &AddressMap) -> Result<(), ConfigError> {
        self.install_map_at(0, 0, map)
    }

    /// Install all ranges of `map` offset by `base`, with additional `mirror` bits.
    ///
    /// Every range, including the ranges of submaps, is checked before any of them is
    /// installed: on error the space is left untouched.
    pub fn install_map_at(&self, base: u64, mirror: u64, map: &AddressMap) -> Result<(), ConfigError> {
        let mut plan = Vec::new();
        self.plan_map(base, mirror, map, &mut plan)?;
        debug!("{}: installing {} map ranges at {:#x}", self.name(), plan.len(), base);
        for step in plan {
            match step {
                Install::Read { start, end, mirror, handler } => self.put_read(start, end, mirror, handler),
                Install::Write { start, end, mirror, handler } => self.put_write(start, end, mirror, handler),
            }
        }
        Ok(())
    }

    fn plan_map(&self, base: u64, mirror: u64, map: &AddressMap, plan: &mut Vec<Install>) -> Result<(), ConfigError> {
        map.validate()?;
        for entry in map.entries.iter() {
            let (start, end) = match (base.checked_add(entry.start), base.checked_add(entry.end)) {
                (Some(start), Some(end)) => (start, end),
                _ => return Err(ConfigError::InvalidRange {
                    space: self.name().into(), start: entry.start, end: entry.end, reason: "the map base overflows" })
            };
            let mirror = entry.mirror | mirror;
            self.check_range(start, end, mirror)?;
            let needs_share = matches!(entry.read, MapSide::Memory) || matches!(entry.write, MapSide::Memory);
            let share = match &entry.share {
                Some(share) => Some(share.clone()),
                None if needs_share => Some(self.anonymous_share(start, end)?),
                None => None
            };
            let offset = entry.share_offset;
            let read = match (&entry.read, &share) {
                (MapSide::Memory, Some(share)) => Some(ReadHandler::Memory { share: share.clone(), offset }),
                (MapSide::Handler(handler), _) => Some(handler.clone()),
                _ => None
            };
            if let Some(handler) = read {
                self.check_read(start, end, mirror, &handler)?;
                plan.push(Install::Read { start, end, mirror, handler });
            }
            let write = match (&entry.write, &share) {
                (MapSide::Memory, Some(share)) => Some(WriteHandler::Memory { share: share.clone(), offset }),
                (MapSide::Handler(handler), _) => Some(handler.clone()),
                _ => None
            };
            if let Some(handler) = write {
                self.check_write(start, end, mirror, &handler)?;
                plan.push(Install::Write { start, end, mirror, handler });
            }
            if let Some(submap) = &entry.submap {
                let size = end - start;
                if let Some(outside) = submap.entries.iter().find(|sub| sub.end > size) {
                    return Err(ConfigError::InvalidRange {
                        space: self.name().into(),
                        start: start.wrapping_add(outside.start),
                        end: start.wrapping_add(outside.end),
                        reason: "outside of the parent range"
                    })
                }
                self.plan_map(start, mirror, submap, plan)?;
            }
        }
        Ok(())
    }

    fn anonymous_share(&self, start: u64, end: u64) -> Result<MemoryShare, ConfigError> {
        let len = (end - start).checked_add(1).and_then(|len| usize::try_from(len).ok());
        match len {
            Some(len) => Ok(MemoryShare::new(&format!("{}:{:x}", self.name(), start), len)),
            None => Err(ConfigError::InvalidRange {
                space: self.name().into(), start, end, reason: "too large for an anonymous memory share" })
        }
    }
}
