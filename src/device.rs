/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The device composition model.
//!
//! A machine is a tree of devices identified by tags: the root is `":"`, its children are `":name"`,
//! their children `":name:child"` and so on. A device exposes capabilities through an
//! [InterfaceSet] and declares references to other devices with [RequiredDevice] and
//! [OptionalDevice]. References are resolved before any device starts, and devices start and
//! reset after everything they require.
//!
//! ```text
//!   MachineConfig --add_device--> [ Device ] --register_interfaces--> InterfaceSet
//!        |                            |                               ExecuteUnit?
//!      build()                  device_finders                        MemoryInterface?
//!        |                            |                               NvramInterface?
//!        v                            v
//!     Machine <---- start order <-- required references
//! ```
use core::any::{Any, type_name};
use core::cell::RefCell;
use std::rc::{Rc, Weak};

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::{ConfigError, SchedulerError, StateError};
use crate::memory::{AddressSpace, SpaceConfig, SpaceNum, Word};
use crate::save::{SaveRegistry, StateItem};
use crate::scheduler::{Scheduler, TimerId, UnitId};

mod finder;
mod interface;
mod registry;

pub use finder::{FinderEntry, FinderList, OptionalDevice, RequiredDevice, Resolution};
pub use interface::InterfaceSet;
pub use registry::{DeviceFactory, DeviceTypeRegistry};

/// A component of an emulated machine.
///
/// All hooks have empty defaults. The lifecycle is:
/// [device_config_complete][Device::device_config_complete],
/// reference resolution, [device_start][Device::device_start],
/// [device_reset][Device::device_reset], and [device_stop][Device::device_stop] when the
/// machine is stopped.
pub trait Device: Any {
    /// Called once all devices were added, in declaration order.
    fn device_config_complete(&mut self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Declare references to other devices.
    fn device_finders(&self, _finders: &mut FinderList) {}

    /// Called in dependency order, after all references were resolved and address maps installed.
    fn device_start(&mut self, _ctx: &mut StartContext<'_>) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Called in dependency order after the start and on each soft reset.
    fn device_reset(&mut self, _scheduler: &mut Scheduler) {}

    fn device_stop(&mut self) {}

    fn device_clock_changed(&mut self, _clock: u32) {}

    fn device_pre_save(&mut self) {}

    fn device_post_load(&mut self) {}

    /// Register the capabilities of the device.
    ///
    /// A device is always registered as its own type and as `dyn Device`.
    /// Implementations add trait objects, e.g.:
    ///
    /// ```
    /// # use std::{cell::RefCell, rc::Rc};
    /// # use emucore::device::{Device, InterfaceSet};
    /// # use emucore::scheduler::{ExecuteUnit, Scheduler};
    /// struct Cpu;
    ///
    /// impl ExecuteUnit for Cpu {
    ///     fn execute(&mut self, cycles: u64, _: &mut Scheduler) -> u64 { cycles }
    /// }
    ///
    /// impl Device for Cpu {
    ///     fn register_interfaces(this: &Rc<RefCell<Self>>, set: &mut InterfaceSet) {
    ///         set.add::<dyn ExecuteUnit>(this.clone());
    ///     }
    /// }
    /// ```
    fn register_interfaces(_this: &Rc<RefCell<Self>>, _set: &mut InterfaceSet) where Self: Sized {}
}

/// A device with address spaces.
pub trait MemoryInterface {
    fn memory_space(&self, space: SpaceNum) -> Option<Rc<AddressSpace>>;
}

/// A device with non-volatile memory persisted by the front end.
pub trait NvramInterface {
    /// Initialize the contents when there is no saved image.
    fn nvram_default(&mut self);

    fn nvram_read(&mut self, data: &[u8]) -> Result<(), StateError>;

    fn nvram_write(&mut self, data: &mut Vec<u8>);
}

/// A set of address spaces of a device, indexed by [SpaceNum].
#[derive(Debug, Default, Clone)]
pub struct MemorySpaces {
    spaces: [Option<Rc<AddressSpace>>;4],
}

impl MemorySpaces {
    pub fn new() -> Self {
        MemorySpaces::default()
    }

    /// Create an address space from `config` and assign it to `num`.
    pub fn add(&mut self, num: SpaceNum, config: SpaceConfig) -> Result<Rc<AddressSpace>, ConfigError> {
        let space = Rc::new(AddressSpace::new(config)?);
        self.spaces[num as usize] = Some(Rc::clone(&space));
        Ok(space)
    }

    pub fn get(&self, num: SpaceNum) -> Option<&Rc<AddressSpace>> {
        self.spaces[num as usize].as_ref()
    }

    /// # Panics
    /// Panics if there is no space `num`.
    pub fn space(&self, num: SpaceNum) -> &Rc<AddressSpace> {
        match self.get(num) {
            Some(space) => space,
            None => panic!("no {} address space", num)
        }
    }
}

impl MemoryInterface for MemorySpaces {
    fn memory_space(&self, space: SpaceNum) -> Option<Rc<AddressSpace>> {
        self.get(space).cloned()
    }
}

/// Resolve a device `path` relative to the device tagged `base`.
///
/// * `":a:b"` - an absolute tag,
/// * `"b"` - a child of `base`,
/// * `"^b"` - a sibling of `base`, each additional `^` goes one level up,
/// * `""` - `base` itself.
///
/// ```
/// use emucore::device::subtag;
/// assert_eq!(subtag(":", "cpu"), ":cpu");
/// assert_eq!(subtag(":board:cpu", "^pio"), ":board:pio");
/// assert_eq!(subtag(":board:cpu", "^^ram"), ":ram");
/// assert_eq!(subtag(":board", ":cpu"), ":cpu");
/// ```
pub fn subtag(base: &str, path: &str) -> String {
    let mut tag: String = if path.starts_with(':') { String::new() } else { base.trim_end_matches(':').into() };
    let mut rest = path.trim_start_matches(':');
    while let Some(up) = rest.strip_prefix('^') {
        match tag.rfind(':') {
            Some(pos) => tag.truncate(pos),
            None => tag.clear()
        }
        rest = up;
    }
    for name in rest.split(':').filter(|name| !name.is_empty()) {
        tag.push(':');
        tag.push_str(name);
    }
    if tag.is_empty() {
        tag.push(':');
    }
    tag
}

/// Bind a device method as a read callback for an [AddressMap][crate::memory::AddressMap].
///
/// The callback holds a weak reference: once the device is dropped it reads all ones.
///
/// # Panics
/// The callback panics if the device is already borrowed when the access happens.
pub fn read_method<D, T, F>(device: &Rc<RefCell<D>>, method: F) -> impl Fn(u64, T) -> T + 'static
    where D: 'static, T: Word, F: Fn(&mut D, u64, T) -> T + 'static
{
    let weak: Weak<RefCell<D>> = Rc::downgrade(device);
    move |offset, mask| match weak.upgrade() {
        Some(device) => method(&mut device.borrow_mut(), offset, mask),
        None => T::MAX
    }
}

/// Bind a device method as a write callback for an [AddressMap][crate::memory::AddressMap].
///
/// # Panics
/// The callback panics if the device is already borrowed when the access happens.
pub fn write_method<D, T, F>(device: &Rc<RefCell<D>>, method: F) -> impl Fn(u64, T, T) + 'static
    where D: 'static, T: Word, F: Fn(&mut D, u64, T, T) + 'static
{
    let weak: Weak<RefCell<D>> = Rc::downgrade(device);
    move |offset, data, mask| {
        if let Some(device) = weak.upgrade() {
            method(&mut device.borrow_mut(), offset, data, mask)
        }
    }
}

/// The environment of [Device::device_start].
pub struct StartContext<'a> {
    tag: &'a str,
    clock: u32,
    unit: Option<UnitId>,
    interfaces: &'a InterfaceSet,
    scheduler: &'a mut Scheduler,
    save: &'a mut SaveRegistry,
}

impl<'a> StartContext<'a> {
    pub(crate) fn new(
            tag: &'a str,
            clock: u32,
            unit: Option<UnitId>,
            interfaces: &'a InterfaceSet,
            scheduler: &'a mut Scheduler,
            save: &'a mut SaveRegistry
        ) -> Self
    {
        StartContext { tag, clock, unit, interfaces, scheduler, save }
    }

    pub fn tag(&self) -> &str {
        self.tag
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// The execution unit of the device, if it provides one.
    pub fn unit(&self) -> Option<UnitId> {
        self.unit
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        self.scheduler
    }

    /// Register a save state item named `"{tag}/{name}"`.
    pub fn save_item<I: Into<StateItem>>(&mut self, name: &str, item: I) -> Result<(), ConfigError> {
        self.save.register(self.tag, name, item)
    }

    /// Allocate a timer invoking `callback` on the device of type `D` being started.
    ///
    /// The timer holds a weak reference to the device.
    pub fn timer_alloc<D, F>(&mut self, name: &str, mut callback: F) -> Result<TimerId, ConfigError>
        where D: Device, F: FnMut(&mut D, &mut Scheduler, u64) -> Result<(), SchedulerError> + 'static
    {
        let device = match self.interfaces.get::<D>() {
            Some(device) => device,
            None => return Err(ConfigError::Device {
                device: self.tag.into(), message: format!("not a device of type {}", type_name::<D>()) })
        };
        let weak = Rc::downgrade(&device);
        let name = format!("{}/{}", self.tag, name);
        Ok(self.scheduler.timer_alloc(name, move |scheduler: &mut Scheduler, param| {
            match weak.upgrade() {
                Some(device) => callback(&mut device.borrow_mut(), scheduler, param),
                None => Ok(())
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Endianness;

    #[test]
    fn device_subtags() {
        assert_eq!(subtag(":", ""), ":");
        assert_eq!(subtag(":", "cpu"), ":cpu");
        assert_eq!(subtag(":", ":cpu"), ":cpu");
        assert_eq!(subtag(":a", "b:c"), ":a:b:c");
        assert_eq!(subtag(":a:b", "^c"), ":a:c");
        assert_eq!(subtag(":a:b:c", "^^d"), ":a:d");
        assert_eq!(subtag(":a", "^^b"), ":b");
        assert_eq!(subtag(":a:b", "^"), ":a");
        assert_eq!(subtag(":a:", "b:"), ":a:b");
        assert_eq!(subtag(":a", ""), ":a");
    }

    struct Regs {
        value: u8,
        writes: u32,
    }

    #[test]
    fn device_methods_as_handlers() {
        let regs = Rc::new(RefCell::new(Regs { value: 0x10, writes: 0 }));
        let read = read_method(&regs, |regs: &mut Regs, offset, _mask: u8| regs.value + offset as u8);
        let write = write_method(&regs, |regs: &mut Regs, _offset, data: u8, _mask| {
            regs.value = data;
            regs.writes += 1;
        });
        let mut spaces = MemorySpaces::new();
        let io = spaces.add(SpaceNum::Io, SpaceConfig::new("io", Endianness::Little, 8, 8)).unwrap();
        io.install_readwrite_handler(0x40, 0x43, 0, read, write).unwrap();
        assert_eq!(io.read_byte(0x42), 0x12);
        io.write_byte(0x40, 0x20);
        assert_eq!(io.read_byte(0x41), 0x21);
        assert_eq!(regs.borrow().writes, 1);
        assert!(spaces.memory_space(SpaceNum::Program).is_none());
        assert!(Rc::ptr_eq(spaces.space(SpaceNum::Io), &io));
        drop(regs);
        assert_eq!(io.read_byte(0x40), 0xff);
    }
}
