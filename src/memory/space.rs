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
use super::handler::{Entry, HandlerTable, Passthrough, ReadHandler, TapFn, WriteHandler};
use super::{
    Endianness, HandlerKind, MemoryBank, MemoryShare, SpaceConfig, Word,
    lane_mask, lane_shift, mirrors
};

/// The maximum number of mirror bits of a single installation.
pub const MAX_MIRROR_BITS: u32 = 12;

/// A logical memory or I/O address space.
///
/// All methods take `&self`: spaces are shared with [Rc] between the owning device,
/// the devices accessing them and the spaces they are nested in. Installing handlers
/// from within a handler is allowed, the new handler is used from the next access on.
pub struct AddressSpace {
    config: SpaceConfig,
    addr_mask: u64,
    bytes: usize,
    unmap: u64,
    log_unmap: Cell<bool>,
    read: RefCell<HandlerTable<ReadHandler>>,
    write: RefCell<HandlerTable<WriteHandler>>,
    no_side_effects: Cell<u32>,
    unmapped_reads: Cell<u64>,
    unmapped_writes: Cell<u64>,
    next_tap: Cell<u64>,
}

/// Identifies the taps installed by one of the `install_*_tap` methods.
///
/// Pass it to [TapHandle::remove] to take the tap out of the space it was installed in.
#[must_use]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TapHandle {
    id: u64,
    read: bool,
    write: bool,
}

struct SideEffectsGuard<'a>(&'a Cell<u32>);

impl Drop for SideEffectsGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

impl AddressSpace {
    /// Create an address space with every address unmapped.
    pub fn new(config: SpaceConfig) -> Result<Self, ConfigError> {
        if !matches!(config.data_width, 8 | 16 | 32 | 64) {
            return Err(ConfigError::InvalidSpace {
                space: config.name, reason: "the data width must be 8, 16, 32 or 64 bits" })
        }
        if config.addr_width == 0 || config.addr_width > 64 {
            return Err(ConfigError::InvalidSpace {
                space: config.name, reason: "the address width must be between 1 and 64 bits" })
        }
        let bytes = config.bus_bytes();
        let addr_mask = config.addr_mask();
        if addr_mask < (bytes - 1) as u64 {
            return Err(ConfigError::InvalidSpace {
                space: config.name, reason: "the address width is narrower than the data bus" })
        }
        let unmap = config.unmap_value & lane_mask(bytes);
        let log_unmap = Cell::new(config.log_unmap);
        Ok(AddressSpace {
            config,
            addr_mask,
            bytes,
            unmap,
            log_unmap,
            read: RefCell::new(HandlerTable::new(addr_mask, ReadHandler::Unmapped)),
            write: RefCell::new(HandlerTable::new(addr_mask, WriteHandler::Unmapped)),
            no_side_effects: Cell::new(0),
            unmapped_reads: Cell::new(0),
            unmapped_writes: Cell::new(0),
            next_tap: Cell::new(0)
        })
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn endianness(&self) -> Endianness {
        self.config.endianness
    }

    pub fn data_width(&self) -> u32 {
        self.config.data_width
    }

    pub fn addr_width(&self) -> u32 {
        self.config.addr_width
    }

    #[inline]
    pub fn addr_mask(&self) -> u64 {
        self.addr_mask
    }

    /// The value read from unmapped addresses, truncated to the data bus width.
    pub fn unmap_value(&self) -> u64 {
        self.unmap
    }

    pub fn set_log_unmap(&self, log_unmap: bool) {
        self.log_unmap.set(log_unmap);
    }

    /// The number of unmapped reads performed with side effects enabled.
    pub fn unmapped_reads(&self) -> u64 {
        self.unmapped_reads.get()
    }

    /// The number of unmapped writes performed with side effects enabled.
    pub fn unmapped_writes(&self) -> u64 {
        self.unmapped_writes.get()
    }

    /// Whether the current access is a debugger access. Handlers with side effects
    /// (e.g. clearing a status on read) should not apply them.
    #[inline]
    pub fn side_effects_disabled(&self) -> bool {
        self.no_side_effects.get() != 0
    }

    /// Run `f` with side effects disabled.
    pub fn with_side_effects_disabled<R, F: FnOnce() -> R>(&self, f: F) -> R {
        self.no_side_effects.set(self.no_side_effects.get() + 1);
        let _guard = SideEffectsGuard(&self.no_side_effects);
        f()
    }

    #[inline]
    pub fn is_valid_address(&self, address: u64) -> bool {
        address & !self.addr_mask == 0
    }

    /*-- installation --*/

    /// Install read-only memory: `offset` is the position in `share` of the byte at `start`.
    pub fn install_rom(&self, start: u64, end: u64, mirror: u64, share: &MemoryShare, offset: usize) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Memory { share: share.clone(), offset })
    }

    /// Install write-only memory.
    pub fn install_writeonly(&self, start: u64, end: u64, mirror: u64, share: &MemoryShare, offset: usize) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Memory { share: share.clone(), offset })
    }

    /// Install read-write memory.
    pub fn install_ram(&self, start: u64, end: u64, mirror: u64, share: &MemoryShare, offset: usize) -> Result<(), ConfigError> {
        self.install_rom(start, end, mirror, share, offset)?;
        self.install_writeonly(start, end, mirror, share, offset)
    }

    pub fn install_read_bank(&self, start: u64, end: u64, mirror: u64, bank: &MemoryBank) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Bank(bank.clone()))
    }

    pub fn install_write_bank(&self, start: u64, end: u64, mirror: u64, bank: &MemoryBank) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Bank(bank.clone()))
    }

    pub fn install_readwrite_bank(&self, start: u64, end: u64, mirror: u64, bank: &MemoryBank) -> Result<(), ConfigError> {
        self.install_read_bank(start, end, mirror, bank)?;
        self.install_write_bank(start, end, mirror, bank)
    }

    /// Install a read callback of width `T`.
    ///
    /// The callback receives the offset from `start` counted in `T`-sized units and the mask
    /// of the requested bits. A callback narrower than the data bus is invoked once for each
    /// of its sub-units with a non-zero mask.
    pub fn install_read_handler<T, F>(&self, start: u64, end: u64, mirror: u64, read: F) -> Result<(), ConfigError>
        where T: Word, F: Fn(u64, T) -> T + 'static
    {
        self.install_read(start, end, mirror, ReadHandler::delegate::<T, F>(read))
    }

    /// Install a write callback of width `T` receiving `(offset, data, mask)`.
    pub fn install_write_handler<T, F>(&self, start: u64, end: u64, mirror: u64, write: F) -> Result<(), ConfigError>
        where T: Word, F: Fn(u64, T, T) + 'static
    {
        self.install_write(start, end, mirror, WriteHandler::delegate::<T, F>(write))
    }

    pub fn install_readwrite_handler<T, R, W>(
            &self,
            start: u64,
            end: u64,
            mirror: u64,
            read: R,
            write: W
        ) -> Result<(), ConfigError>
        where T: Word, R: Fn(u64, T) -> T + 'static, W: Fn(u64, T, T) + 'static
    {
        self.install_read_handler(start, end, mirror, read)?;
        self.install_write_handler(start, end, mirror, write)
    }

    /// Forward reads and writes to `space` at `address - start`.
    pub fn install_space(&self, start: u64, end: u64, mirror: u64, space: &Rc<AddressSpace>) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Space(Rc::clone(space)))?;
        self.install_write(start, end, mirror, WriteHandler::Space(Rc::clone(space)))
    }

    pub fn unmap_read(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Unmapped)
    }

    pub fn unmap_write(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Unmapped)
    }

    pub fn unmap_readwrite(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.unmap_read(start, end, mirror)?;
        self.unmap_write(start, end, mirror)
    }

    pub fn nop_read(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.install_read(start, end, mirror, ReadHandler::Nop)
    }

    pub fn nop_write(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.install_write(start, end, mirror, WriteHandler::Nop)
    }

    pub fn nop_readwrite(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        self.nop_read(start, end, mirror)?;
        self.nop_write(start, end, mirror)
    }

    /// Install a read tap over `start..=end`.
    ///
    /// The tap is called with the address, the data and the mask of every native unit read
    /// from the range, after the handler below it, and may modify the data. The handlers
    /// below keep their offsets, so a tap spanning several handlers leaves their
    /// addressing untouched.
    pub fn install_read_tap<F>(&self, start: u64, end: u64, mirror: u64, tap: F) -> Result<TapHandle, ConfigError>
        where F: Fn(u64, &mut u64, u64) + 'static
    {
        self.check_range(start, end, mirror)?;
        let id = self.tap_id();
        tap_table(&mut self.read.borrow_mut(), id, Rc::new(tap), start, end, mirror);
        debug!("{}: read tap {} at {:#x}-{:#x} mirror {:#x}", self.config.name, id, start, end, mirror);
        Ok(TapHandle { id, read: true, write: false })
    }

    /// Install a write tap over `start..=end`. The tap is called before the handler below it
    /// and may modify the data being written.
    pub fn install_write_tap<F>(&self, start: u64, end: u64, mirror: u64, tap: F) -> Result<TapHandle, ConfigError>
        where F: Fn(u64, &mut u64, u64) + 'static
    {
        self.check_range(start, end, mirror)?;
        let id = self.tap_id();
        tap_table(&mut self.write.borrow_mut(), id, Rc::new(tap), start, end, mirror);
        debug!("{}: write tap {} at {:#x}-{:#x} mirror {:#x}", self.config.name, id, start, end, mirror);
        Ok(TapHandle { id, read: false, write: true })
    }

    /// Install a read and a write tap over `start..=end`, removed together by a single handle.
    pub fn install_readwrite_tap<R, W>(
            &self,
            start: u64,
            end: u64,
            mirror: u64,
            read: R,
            write: W
        ) -> Result<TapHandle, ConfigError>
        where R: Fn(u64, &mut u64, u64) + 'static, W: Fn(u64, &mut u64, u64) + 'static
    {
        self.check_range(start, end, mirror)?;
        let id = self.tap_id();
        tap_table(&mut self.read.borrow_mut(), id, Rc::new(read), start, end, mirror);
        tap_table(&mut self.write.borrow_mut(), id, Rc::new(write), start, end, mirror);
        debug!("{}: readwrite tap {} at {:#x}-{:#x} mirror {:#x}", self.config.name, id, start, end, mirror);
        Ok(TapHandle { id, read: true, write: true })
    }

    fn tap_id(&self) -> u64 {
        let id = self.next_tap.get();
        self.next_tap.set(id + 1);
        id
    }

    pub(crate) fn install_read(&self, start: u64, end: u64, mirror: u64, handler: ReadHandler) -> Result<(), ConfigError> {
        self.check_read(start, end, mirror, &handler)?;
        self.put_read(start, end, mirror, handler);
        Ok(())
    }

    pub(crate) fn install_write(&self, start: u64, end: u64, mirror: u64, handler: WriteHandler) -> Result<(), ConfigError> {
        self.check_write(start, end, mirror, &handler)?;
        self.put_write(start, end, mirror, handler);
        Ok(())
    }

    pub(crate) fn check_read(&self, start: u64, end: u64, mirror: u64, handler: &ReadHandler) -> Result<(), ConfigError> {
        self.check_range(start, end, mirror)?;
        match handler {
            ReadHandler::Memory { share, offset } => self.check_share(start, end, share, *offset),
            ReadHandler::Delegate { bytes, .. } => self.check_handler_width(*bytes),
            ReadHandler::Space(space) => self.check_nested(space),
            _ => Ok(())
        }
    }

    pub(crate) fn check_write(&self, start: u64, end: u64, mirror: u64, handler: &WriteHandler) -> Result<(), ConfigError> {
        self.check_range(start, end, mirror)?;
        match handler {
            WriteHandler::Memory { share, offset } => self.check_share(start, end, share, *offset),
            WriteHandler::Delegate { bytes, .. } => self.check_handler_width(*bytes),
            WriteHandler::Space(space) => self.check_nested(space),
            _ => Ok(())
        }
    }

    /// Install a handler already checked with [AddressSpace::check_read].
    pub(crate) fn put_read(&self, start: u64, end: u64, mirror: u64, handler: ReadHandler) {
        let kind = handler.kind();
        let handler = Rc::new(handler);
        let mut table = self.read.borrow_mut();
        for m in mirrors(mirror) {
            table.install(start | m, end | m, start | m, Rc::clone(&handler));
        }
        debug!("{}: read {:?} at {:#x}-{:#x} mirror {:#x}", self.config.name, kind, start, end, mirror);
    }

    /// Install a handler already checked with [AddressSpace::check_write].
    pub(crate) fn put_write(&self, start: u64, end: u64, mirror: u64, handler: WriteHandler) {
        let kind = handler.kind();
        let handler = Rc::new(handler);
        let mut table = self.write.borrow_mut();
        for m in mirrors(mirror) {
            table.install(start | m, end | m, start | m, Rc::clone(&handler));
        }
        debug!("{}: write {:?} at {:#x}-{:#x} mirror {:#x}", self.config.name, kind, start, end, mirror);
    }

    pub(crate) fn check_range(&self, start: u64, end: u64, mirror: u64) -> Result<(), ConfigError> {
        let space = || self.config.name.clone();
        if start > end {
            return Err(ConfigError::InvalidRange { space: space(), start, end, reason: "the range is reversed" })
        }
        if end > self.addr_mask {
            return Err(ConfigError::InvalidRange { space: space(), start, end, reason: "outside of the address width" })
        }
        let align = (self.bytes - 1) as u64;
        if start & align != 0 || end & align != align {
            return Err(ConfigError::Misaligned { space: space(), start, end, bytes: self.bytes })
        }
        if mirror != 0 {
            let invalid = |reason| ConfigError::InvalidMirror { space: space(), start, end, mirror, reason };
            if mirror & !self.addr_mask != 0 {
                return Err(invalid("outside of the address width"))
            }
            if mirror & align != 0 {
                return Err(invalid("not aligned to the data bus"))
            }
            let diff = start ^ end;
            let varying = if diff == 0 { 0 } else { u64::MAX >> diff.leading_zeros() };
            if mirror & (start | end | varying) != 0 {
                return Err(invalid("overlaps the range address bits"))
            }
            if mirror.count_ones() > MAX_MIRROR_BITS {
                return Err(invalid("too many mirrors"))
            }
        }
        Ok(())
    }

    fn check_share(&self, start: u64, end: u64, share: &MemoryShare, offset: usize) -> Result<(), ConfigError> {
        let needed = u128::from(end - start) + 1 + offset as u128;
        if needed > share.len() as u128 {
            return Err(ConfigError::ShareTooSmall {
                space: self.config.name.clone(), share: share.name().into(), len: share.len(), start, end })
        }
        Ok(())
    }

    fn check_handler_width(&self, bytes: usize) -> Result<(), ConfigError> {
        if bytes > self.bytes {
            return Err(ConfigError::HandlerTooWide {
                space: self.config.name.clone(), bits: (bytes * 8) as u32, bus_bits: self.config.data_width })
        }
        Ok(())
    }

    fn check_nested(&self, space: &AddressSpace) -> Result<(), ConfigError> {
        if space.bytes != self.bytes {
            return Err(ConfigError::SpaceWidthMismatch {
                space: self.config.name.clone(),
                target: space.config.name.clone(),
                target_bits: space.config.data_width,
                bus_bits: self.config.data_width
            })
        }
        Ok(())
    }

    /*-- introspection --*/

    pub fn read_handler_kind(&self, address: u64) -> HandlerKind {
        self.check_address(address);
        self.read.borrow().get(address).handler.kind()
    }

    pub fn write_handler_kind(&self, address: u64) -> HandlerKind {
        self.check_address(address);
        self.write.borrow().get(address).handler.kind()
    }

    /// The number of ranges of the read handler table.
    pub fn read_entry_count(&self) -> usize {
        self.read.borrow().len()
    }

    /// The number of ranges of the write handler table.
    pub fn write_entry_count(&self) -> usize {
        self.write.borrow().len()
    }

    /// The number of entries visited to resolve a read from `address`.
    pub fn read_lookup_steps(&self, address: u64) -> u32 {
        self.check_address(address);
        self.read.borrow().lookup(address).1
    }

    /*-- access --*/

    /// Read a `T`-wide value from `address`. Only the bits set in `mask` are meaningful.
    ///
    /// # Panics
    /// Panics if `address` is beyond the address width: this is a bug of the accessing device.
    #[inline]
    pub fn read<T: Word>(&self, address: u64, mask: T) -> T {
        self.check_address(address);
        T::from_u64(self.read_access(address, T::BYTES, mask.to_u64()))
    }

    /// Write the bits of `data` selected by `mask` at `address`.
    ///
    /// # Panics
    /// Panics if `address` is beyond the address width: this is a bug of the accessing device.
    #[inline]
    pub fn write<T: Word>(&self, address: u64, data: T, mask: T) {
        self.check_address(address);
        self.write_access(address, T::BYTES, data.to_u64(), mask.to_u64())
    }

    /// Read without side effects: unmapped reads are neither logged nor counted
    /// and handlers see [AddressSpace::side_effects_disabled].
    pub fn read_debug<T: Word>(&self, address: u64) -> T {
        self.with_side_effects_disabled(|| self.read(address, T::MAX))
    }

    /// Write with side effects disabled.
    pub fn write_debug<T: Word>(&self, address: u64, data: T) {
        self.with_side_effects_disabled(|| self.write(address, data, T::MAX))
    }

    #[inline]
    pub fn read_byte(&self, address: u64) -> u8 {
        self.read(address, u8::MAX)
    }

    #[inline]
    pub fn read_word(&self, address: u64) -> u16 {
        self.read(address, u16::MAX)
    }

    #[inline]
    pub fn read_dword(&self, address: u64) -> u32 {
        self.read(address, u32::MAX)
    }

    #[inline]
    pub fn read_qword(&self, address: u64) -> u64 {
        self.read(address, u64::MAX)
    }

    #[inline]
    pub fn write_byte(&self, address: u64, data: u8) {
        self.write(address, data, u8::MAX)
    }

    #[inline]
    pub fn write_word(&self, address: u64, data: u16) {
        self.write(address, data, u16::MAX)
    }

    #[inline]
    pub fn write_dword(&self, address: u64, data: u32) {
        self.write(address, data, u32::MAX)
    }

    #[inline]
    pub fn write_qword(&self, address: u64, data: u64) {
        self.write(address, data, u64::MAX)
    }

    #[inline(always)]
    fn check_address(&self, address: u64) {
        if !self.is_valid_address(address) {
            error!("{}: access at {:#x} beyond the {}-bit address width", self.config.name, address, self.config.addr_width);
            panic!("{}: address {:#x} is beyond the {}-bit address width",
                    self.config.name, address, self.config.addr_width);
        }
    }

    fn read_access(&self, address: u64, size: usize, mask: u64) -> u64 {
        let bytes = self.bytes;
        let endianness = self.config.endianness;
        let offset = (address & (bytes - 1) as u64) as usize;
        if offset == 0 && size == bytes {
            return self.read_native(address, mask)
        }
        if offset + size <= bytes {
            let shift = lane_shift(endianness, offset, size, bytes);
            let value = self.read_native(address - offset as u64, mask << shift);
            return (value >> shift) & lane_mask(size)
        }
        let base = address - offset as u64;
        let mut result = 0;
        for unit in 0..(offset + size + bytes - 1) / bytes {
            let first = (unit * bytes).saturating_sub(offset);
            let last = ((unit + 1) * bytes - offset).min(size);
            let mut unit_mask = 0;
            for k in first..last {
                let ushift = lane_shift(endianness, offset + k - unit * bytes, 1, bytes);
                let vshift = lane_shift(endianness, k, 1, size);
                unit_mask |= ((mask >> vshift) & 0xff) << ushift;
            }
            if unit_mask == 0 {
                continue
            }
            let unit_address = base.wrapping_add((unit * bytes) as u64) & self.addr_mask;
            let value = self.read_native(unit_address, unit_mask);
            for k in first..last {
                let ushift = lane_shift(endianness, offset + k - unit * bytes, 1, bytes);
                let vshift = lane_shift(endianness, k, 1, size);
                result |= ((value >> ushift) & 0xff) << vshift;
            }
        }
        result
    }

    fn write_access(&self, address: u64, size: usize, data: u64, mask: u64) {
        let bytes = self.bytes;
        let endianness = self.config.endianness;
        let offset = (address & (bytes - 1) as u64) as usize;
        if offset == 0 && size == bytes {
            return self.write_native(address, data, mask)
        }
        if offset + size <= bytes {
            let shift = lane_shift(endianness, offset, size, bytes);
            return self.write_native(address - offset as u64, data << shift, mask << shift)
        }
        let base = address - offset as u64;
        for unit in 0..(offset + size + bytes - 1) / bytes {
            let first = (unit * bytes).saturating_sub(offset);
            let last = ((unit + 1) * bytes - offset).min(size);
            let (mut unit_data, mut unit_mask) = (0, 0);
            for k in first..last {
                let ushift = lane_shift(endianness, offset + k - unit * bytes, 1, bytes);
                let vshift = lane_shift(endianness, k, 1, size);
                unit_data |= ((data >> vshift) & 0xff) << ushift;
                unit_mask |= ((mask >> vshift) & 0xff) << ushift;
            }
            if unit_mask != 0 {
                let unit_address = base.wrapping_add((unit * bytes) as u64) & self.addr_mask;
                self.write_native(unit_address, unit_data, unit_mask);
            }
        }
    }

    /// Read a native unit at an aligned `address`.
    pub(crate) fn read_native(&self, address: u64, mask: u64) -> u64 {
        if mask == 0 {
            return 0
        }
        let (handler, origin) = {
            let table = self.read.borrow();
            let entry = table.get(address);
            (Rc::clone(&entry.handler), entry.origin)
        };
        self.read_dispatch(&handler, address, address - origin, mask)
    }

    fn read_dispatch(&self, handler: &ReadHandler, address: u64, offset: u64, mask: u64) -> u64 {
        let endianness = self.config.endianness;
        match handler {
            ReadHandler::Unmapped => {
                self.unmapped_read(address, mask);
                self.unmap
            }
            ReadHandler::Nop => self.unmap,
            ReadHandler::Memory { share, offset: base } => {
                share_offset(*base, offset).and_then(|at| share.load(at, self.bytes, endianness))
                                           .unwrap_or(self.unmap)
            }
            ReadHandler::Bank(bank) => match bank.target() {
                Some(target) => {
                    share_offset(target.offset, offset).and_then(|at| target.share.load(at, self.bytes, endianness))
                                                       .unwrap_or(self.unmap)
                }
                None => self.unmap
            }
            ReadHandler::Delegate { bytes, read } => self.read_delegate(*bytes, &**read, offset, mask),
            ReadHandler::Space(space) => {
                let address = offset & space.addr_mask;
                if self.side_effects_disabled() {
                    space.with_side_effects_disabled(|| space.read_native(address, mask))
                }
                else {
                    space.read_native(address, mask)
                }
            }
            ReadHandler::Tap { tap, lower, .. } => {
                let mut data = self.read_dispatch(lower, address, offset, mask);
                tap(address, &mut data, mask);
                data & lane_mask(self.bytes)
            }
        }
    }

    /// Write a native unit at an aligned `address`.
    pub(crate) fn write_native(&self, address: u64, data: u64, mask: u64) {
        if mask == 0 {
            return
        }
        let (handler, origin) = {
            let table = self.write.borrow();
            let entry = table.get(address);
            (Rc::clone(&entry.handler), entry.origin)
        };
        self.write_dispatch(&handler, address, address - origin, data, mask)
    }

    fn write_dispatch(&self, handler: &WriteHandler, address: u64, offset: u64, data: u64, mask: u64) {
        let endianness = self.config.endianness;
        match handler {
            WriteHandler::Unmapped => self.unmapped_write(address, data, mask),
            WriteHandler::Nop => {}
            WriteHandler::Memory { share, offset: base } => {
                if let Some(at) = share_offset(*base, offset) {
                    share.store(at, self.bytes, endianness, data, mask);
                }
            }
            WriteHandler::Bank(bank) => {
                if let Some(target) = bank.target() {
                    if let Some(at) = share_offset(target.offset, offset) {
                        target.share.store(at, self.bytes, endianness, data, mask);
                    }
                }
            }
            WriteHandler::Delegate { bytes, write } => self.write_delegate(*bytes, &**write, offset, data, mask),
            WriteHandler::Space(space) => {
                let address = offset & space.addr_mask;
                if self.side_effects_disabled() {
                    space.with_side_effects_disabled(|| space.write_native(address, data, mask))
                }
                else {
                    space.write_native(address, data, mask)
                }
            }
            WriteHandler::Tap { tap, lower, .. } => {
                let mut data = data;
                tap(address, &mut data, mask);
                self.write_dispatch(lower, address, offset, data & lane_mask(self.bytes), mask)
            }
        }
    }

    fn read_delegate(&self, size: usize, read: &dyn Fn(u64, u64) -> u64, offset: u64, mask: u64) -> u64 {
        let lane = lane_mask(size);
        let first = offset / size as u64;
        if size == self.bytes {
            return read(first, mask) & lane
        }
        let mut value = 0;
        for pos in 0..self.bytes / size {
            let shift = lane_shift(self.config.endianness, pos * size, size, self.bytes);
            let lane_bits = (mask >> shift) & lane;
            if lane_bits != 0 {
                value |= (read(first + pos as u64, lane_bits) & lane) << shift;
            }
        }
        value
    }

    fn write_delegate(&self, size: usize, write: &dyn Fn(u64, u64, u64), offset: u64, data: u64, mask: u64) {
        let lane = lane_mask(size);
        let first = offset / size as u64;
        if size == self.bytes {
            return write(first, data & lane, mask)
        }
        for pos in 0..self.bytes / size {
            let shift = lane_shift(self.config.endianness, pos * size, size, self.bytes);
            let lane_bits = (mask >> shift) & lane;
            if lane_bits != 0 {
                write(first + pos as u64, (data >> shift) & lane, lane_bits);
            }
        }
    }

    fn unmapped_read(&self, address: u64, mask: u64) {
        if self.side_effects_disabled() {
            return
        }
        self.unmapped_reads.set(self.unmapped_reads.get() + 1);
        if self.log_unmap.get() {
            debug!("{}: unmapped read from {:#x} & {:#x}", self.config.name, address, mask);
        }
    }

    fn unmapped_write(&self, address: u64, data: u64, mask: u64) {
        if self.side_effects_disabled() {
            return
        }
        self.unmapped_writes.set(self.unmapped_writes.get() + 1);
        if self.log_unmap.get() {
            debug!("{}: unmapped write {:#x} to {:#x} & {:#x}", self.config.name, data, address, mask);
        }
    }
}

impl TapHandle {
    /// Remove the tap from `space`, restoring the handlers it was installed over.
    ///
    /// Taps installed over this one stay in place. Ranges of the tap already replaced by other
    /// installs are left alone. Returns `false` if the tap is no longer found in `space`.
    pub fn remove(self, space: &AddressSpace) -> bool {
        let mut found = 0;
        if self.read {
            found += space.read.borrow_mut().untap(self.id);
        }
        if self.write {
            found += space.write.borrow_mut().untap(self.id);
        }
        debug!("{}: tap {} removed from {} ranges", space.config.name, self.id, found);
        found != 0
    }
}

/// The position in a memory share of `offset` from `base`, if it is addressable.
#[inline]
fn share_offset(base: usize, offset: u64) -> Option<usize> {
    usize::try_from(offset).ok()?.checked_add(base)
}

/// Wrap every handler piece over each mirror of `start..=end` in a tap, keeping the origins.
fn tap_table<H: Passthrough>(table: &mut HandlerTable<H>, id: u64, tap: TapFn, start: u64, end: u64, mirror: u64) {
    for m in mirrors(mirror) {
        for Entry { start: first, end: last, origin, handler } in table.overlapping(start | m, end | m) {
            table.install(first, last, origin, Rc::new(H::tap(id, Rc::clone(&tap), handler)));
        }
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
         .field("name", &self.config.name)
         .field("endianness", &self.config.endianness)
         .field("data_width", &self.config.data_width)
         .field("addr_width", &self.config.addr_width)
         .field("read_entries", &self.read_entry_count())
         .field("write_entries", &self.write_entry_count())
         .finish()
    }
}
