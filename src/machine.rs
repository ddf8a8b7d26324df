/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Machine configuration and lifecycle.
//!
//! A [MachineConfig] collects devices and address maps. [MachineConfig::build] validates the
//! configuration and brings the machine up in strictly ordered phases:
//!
//! 1. [Device::device_config_complete] for every device,
//! 2. reference resolution, start ordering, execution unit registration and address map installation,
//! 3. [Device::device_start] in dependency order,
//! 4. [Device::device_reset] in dependency order.
//!
//! Any error aborts the construction: there are no partially built machines.
use core::any::type_name;
use core::cell::RefCell;
use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

#[cfg(feature = "serde")] use serde::{Serialize, Deserialize};

use crate::device::{
    subtag, Device, DeviceTypeRegistry, FinderList, InterfaceSet, MemoryInterface, NvramInterface,
    Resolution, StartContext
};
use crate::error::{ConfigError, EmuError, SchedulerError};
use crate::memory::{AddressMap, SpaceNum};
use crate::save::{SaveRegistry, StateSnapshot};
use crate::scheduler::{ExecuteUnit, Scheduler, DEFAULT_QUANTUM_HZ};
use crate::time::{Duration, Instant};

mod devices;

pub use devices::Devices;
use devices::{start_order, ClockSource, DeviceEntry};

/// The tag of the root device.
pub const ROOT_TAG: &str = ":";

/// Machine-wide options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MachineOptions {
    /// The longest timeslice when no unit requires tighter interleaving.
    pub default_quantum: Duration,
    /// When `false`, unmapped accesses are not logged in any address space.
    pub log_unmap: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            default_quantum: Duration::from_hz(DEFAULT_QUANTUM_HZ),
            log_unmap: true
        }
    }
}

impl MachineOptions {
    #[inline(always)]
    pub fn with_default_quantum(mut self, default_quantum: Duration) -> Self {
        self.default_quantum = default_quantum;
        self
    }

    #[inline(always)]
    pub fn with_log_unmap(mut self, log_unmap: bool) -> Self {
        self.log_unmap = log_unmap;
        self
    }
}

struct Root;

impl Device for Root {}

type MapBuilder = Box<dyn FnOnce(&mut AddressMap, &Devices) -> Result<(), ConfigError>>;

struct MapConfig {
    tag: String,
    space: SpaceNum,
    builder: MapBuilder,
}

/// The configuration of a machine.
pub struct MachineConfig {
    name: String,
    options: MachineOptions,
    devices: Devices,
    maps: Vec<MapConfig>,
}

impl MachineConfig {
    /// Create a configuration with a root device tagged `":"`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        let mut config = MachineConfig {
            name: name.into(),
            options: MachineOptions::default(),
            devices: Devices::default(),
            maps: Vec::new()
        };
        let root = Rc::new(RefCell::new(Root));
        let mut interfaces = InterfaceSet::new();
        interfaces.add::<dyn Device>(root.clone());
        let device: Rc<RefCell<dyn Device>> = root;
        let entry = DeviceEntry::new(ROOT_TAG.into(), None, ClockSource::Fixed(0), device, interfaces);
        // an empty table never contains a duplicate
        let _ = config.devices.push(entry);
        config
    }

    pub fn with_options(mut self, options: MachineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut MachineOptions {
        &mut self.options
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Add `device` as a child named `name` of the device tagged `owner`. Returns the new tag.
    pub fn add_device<D: Device>(&mut self, owner: &str, name: &str, clock: u32, device: D) -> Result<String, ConfigError> {
        self.insert_device(owner, name, ClockSource::Fixed(clock), device)
    }

    /// Add `device` clocked at `num / den` of the clock of its owner.
    ///
    /// The clock is resolved when the machine is built, after the owner's clock is known,
    /// and follows the owner's clock changes while the machine runs.
    pub fn add_derived_device<D: Device>(
            &mut self,
            owner: &str,
            name: &str,
            num: u32,
            den: u32,
            device: D
        ) -> Result<String, ConfigError>
    {
        if den == 0 {
            return Err(ConfigError::InvalidClock { device: subtag(owner, name), reason: "the clock divider is 0" })
        }
        self.insert_device(owner, name, ClockSource::Derived { num, den }, device)
    }

    /// Replace the configured clock of the device tagged `tag` with a fixed `clock`.
    /// Devices deriving their clocks from it follow when the machine is built.
    pub fn set_clock(&mut self, tag: &str, clock: u32) -> Result<(), ConfigError> {
        let index = self.devices.position(tag).ok_or_else(|| ConfigError::UnknownDevice(tag.into()))?;
        let entry = &mut self.devices.entries_mut()[index];
        entry.source = ClockSource::Fixed(clock);
        entry.unscaled = clock;
        entry.clock = scale_clock(clock, entry.scale);
        Ok(())
    }

    fn insert_device<D: Device>(&mut self, owner: &str, name: &str, clock: ClockSource, device: D) -> Result<String, ConfigError> {
        let owner_index = match self.devices.position(owner) {
            Some(index) => index,
            None => return Err(ConfigError::UnknownDevice(owner.into()))
        };
        if name.is_empty() || name.contains([':', '^']) {
            return Err(ConfigError::Device { device: owner.into(), message: format!("invalid device name `{}`", name) })
        }
        let tag = subtag(owner, name);
        if self.devices.contains(&tag) {
            return Err(ConfigError::DuplicateTag(tag))
        }
        let device = Rc::new(RefCell::new(device));
        let mut interfaces = InterfaceSet::new();
        interfaces.add(Rc::clone(&device));
        interfaces.add::<dyn Device>(device.clone());
        D::register_interfaces(&device, &mut interfaces);
        debug!("{}: {} clocked {:?}: {:?}", tag, type_name::<D>(), clock, interfaces);
        let entry = DeviceEntry::new(tag.clone(), Some(owner_index), clock, device, interfaces);
        self.devices.push(entry)?;
        Ok(tag)
    }

    /// Add a device of a registered type.
    pub fn add_registered(
            &mut self,
            registry: &DeviceTypeRegistry,
            owner: &str,
            name: &str,
            shortname: &str,
            clock: u32
        ) -> Result<String, ConfigError>
    {
        registry.create(self, shortname, owner, name, clock)
    }

    /// Configure the address map of the space `space` of the device tagged `tag`.
    ///
    /// The builder runs after all references are resolved, so it can bind handlers
    /// to any device of the machine.
    pub fn set_address_map<F>(&mut self, tag: &str, space: SpaceNum, builder: F)
        where F: FnOnce(&mut AddressMap, &Devices) -> Result<(), ConfigError> + 'static
    {
        self.maps.push(MapConfig { tag: tag.into(), space, builder: Box::new(builder) });
    }

    /// Validate the configuration and start the machine.
    pub fn build(self) -> Result<Machine, EmuError> {
        let machine = self.name.clone();
        self.build_machine().map_err(|source| {
            error!("{}: configuration error: {}", machine, source);
            EmuError::Config { machine, source }
        })
    }

    fn build_machine(self) -> Result<Machine, ConfigError> {
        let MachineConfig { name, options, mut devices, maps } = self;

        for entry in devices.entries() {
            entry.device.borrow_mut().device_config_complete()?;
        }

        resolve_clocks(&mut devices)?;
        resolve_references(&mut devices)?;
        let order = start_order(devices.entries())?;
        trace!("{}: start order: {:?}", name,
               order.iter().map(|&i| devices.entries()[i].tag.as_str()).collect::<Vec<_>>());

        let mut scheduler = Scheduler::new(options.default_quantum);
        for entry in devices.entries_mut() {
            if let Some(unit) = entry.interfaces.get::<dyn ExecuteUnit>() {
                if entry.clock == 0 {
                    return Err(ConfigError::NoClock { device: entry.tag.clone() })
                }
                entry.unit = Some(scheduler.add_unit(entry.tag.clone(), entry.clock, unit)?);
            }
        }

        if !options.log_unmap {
            for (_, memory) in devices.devices_with::<dyn MemoryInterface>() {
                let memory = memory.borrow();
                for num in SpaceNum::ALL {
                    if let Some(space) = memory.memory_space(num) {
                        space.set_log_unmap(false);
                    }
                }
            }
        }

        for MapConfig { tag, space: num, builder } in maps {
            let space = devices.space(&tag, num)?;
            let mut map = AddressMap::new();
            builder(&mut map, &devices)?;
            space.install_map(&map)?;
            debug!("{}: {} map of {} ranges installed", tag, num, map.len());
        }

        let mut save = SaveRegistry::new();
        for &index in order.iter() {
            let entry = &devices.entries()[index];
            let mut ctx = StartContext::new(
                &entry.tag, entry.clock, entry.unit, &entry.interfaces, &mut scheduler, &mut save);
            entry.device.borrow_mut().device_start(&mut ctx)?;
            if let Some(unit) = entry.unit {
                scheduler.start_unit(unit)?;
            }
        }

        for &index in order.iter() {
            if let Some(nvram) = devices.entries()[index].interfaces.get::<dyn NvramInterface>() {
                nvram.borrow_mut().nvram_default();
            }
        }

        let mut machine = Machine { name, devices, order, scheduler, save, halted: false, stopped: false };
        machine.reset_devices();
        info!("{}: started with {} devices", machine.name, machine.devices.len());
        Ok(machine)
    }
}

impl fmt::Debug for MachineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineConfig")
         .field("name", &self.name)
         .field("options", &self.options)
         .field("devices", &self.devices)
         .field("maps", &self.maps.len())
         .finish()
    }
}

/// Resolve the clocks in declaration order: owners are always declared before their children.
fn resolve_clocks(devices: &mut Devices) -> Result<(), ConfigError> {
    for index in 0..devices.len() {
        let entry = &devices.entries()[index];
        let clock = match entry.source {
            ClockSource::Fixed(clock) => clock,
            ClockSource::Derived { num, den } => {
                let owner = entry.owner.map_or(0, |owner| devices.entries()[owner].clock);
                let clock = derive_clock(owner, num, den).ok_or_else(|| ConfigError::InvalidClock {
                    device: entry.tag.clone(), reason: "the derived clock overflows" })?;
                trace!("{}: {} Hz derived as {}/{} of {} Hz", entry.tag, clock, num, den, owner);
                clock
            }
        };
        let entry = &mut devices.entries_mut()[index];
        entry.unscaled = clock;
        entry.clock = scale_clock(clock, entry.scale);
    }
    Ok(())
}

fn derive_clock(owner: u32, num: u32, den: u32) -> Option<u32> {
    u32::try_from(u64::from(owner) * u64::from(num) / u64::from(den)).ok()
}

/// Scaled clocks are rounded toward zero and saturate at `u32::MAX`.
fn scale_clock(unscaled: u32, scale: f64) -> u32 {
    (f64::from(unscaled) * scale) as u32
}

fn resolve_references(devices: &mut Devices) -> Result<(), ConfigError> {
    let mut all_deps = Vec::with_capacity(devices.len());
    for entry in devices.entries() {
        let mut finders = FinderList::new();
        entry.device.borrow().device_finders(&mut finders);
        let mut deps = Vec::new();
        for finder in finders.entries() {
            let tag = subtag(&entry.tag, finder.path());
            let target = devices.position(&tag);
            let resolution = finder.resolve(target.map(|index| &devices.entries()[index].interfaces));
            match (resolution, target) {
                (Resolution::Found, Some(index)) => {
                    trace!("{}: `{}` resolved to {}", entry.tag, finder.path(), tag);
                    if finder.is_required() && !deps.contains(&index) {
                        deps.push(index);
                    }
                }
                (Resolution::MissingInterface(interface), _) if finder.is_required() => {
                    return Err(ConfigError::MissingInterface { device: entry.tag.clone(), tag, interface })
                }
                (Resolution::MissingInterface(interface), _) => {
                    warn!("{}: optional device `{}` doesn't provide {}", entry.tag, tag, interface);
                }
                _ if finder.is_required() => {
                    return Err(ConfigError::MissingRequired {
                        device: entry.tag.clone(), path: finder.path().into(), tag })
                }
                _ => {
                    warn!("{}: optional device `{}` not found", entry.tag, tag);
                }
            }
        }
        all_deps.push(deps);
    }
    for (entry, deps) in devices.entries_mut().iter_mut().zip(all_deps) {
        entry.deps = deps;
    }
    Ok(())
}

/// A running machine.
pub struct Machine {
    name: String,
    devices: Devices,
    order: Vec<usize>,
    scheduler: Scheduler,
    save: SaveRegistry,
    halted: bool,
    stopped: bool,
}

impl Machine {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The base time of the scheduler.
    pub fn time(&self) -> Instant {
        self.scheduler.time()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    pub fn save_registry(&self) -> &SaveRegistry {
        &self.save
    }

    /// Whether the machine stopped after a fatal error or [Machine::stop].
    pub fn is_halted(&self) -> bool {
        self.halted || self.stopped
    }

    /// Run until the base time reaches `limit`.
    ///
    /// A contract violation is fatal: it is logged, returned as [EmuError::Fatal],
    /// and the machine refuses to run any further.
    pub fn run_until(&mut self, limit: Instant) -> Result<(), EmuError> {
        if self.is_halted() {
            return Err(EmuError::Halted { machine: self.name.clone() })
        }
        match self.scheduler.run_until(limit) {
            Ok(()) => Ok(()),
            Err(source) => {
                error!("{}: fatal error at {}: {}", self.name, self.scheduler.time(), source);
                self.halted = true;
                Err(EmuError::Fatal { machine: self.name.clone(), source })
            }
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> Result<(), EmuError> {
        self.run_until(self.scheduler.time() + duration)
    }

    /// Soft reset: reset all devices in dependency order.
    pub fn reset(&mut self) {
        info!("{}: reset at {}", self.name, self.scheduler.time());
        self.reset_devices();
    }

    /// Stop all devices in reverse dependency order. The machine can't run afterwards.
    pub fn stop(&mut self) {
        if self.stopped {
            return
        }
        for &index in self.order.iter().rev() {
            let entry = &self.devices.entries()[index];
            entry.device.borrow_mut().device_stop();
            if let Some(unit) = entry.unit {
                // units are registered by the machine
                let _ = self.scheduler.stop_unit(unit);
            }
        }
        self.stopped = true;
        info!("{}: stopped at {}", self.name, self.scheduler.time());
    }

    /// Change the unscaled clock of the device tagged `tag`.
    ///
    /// The clock scale of the device is kept. The new clock applies to the execution unit
    /// of the device and to every device deriving its clock from it. A derived device given
    /// an explicit clock stops following its owner.
    pub fn set_clock(&mut self, tag: &str, clock: u32) -> Result<(), EmuError> {
        let index = self.device_index(tag)?;
        let scale = self.devices.entries()[index].scale;
        self.update_clocks(index, clock, scale).map_err(|source| self.config_error(source))?;
        self.devices.entries_mut()[index].source = ClockSource::Fixed(clock);
        Ok(())
    }

    /// Scale the clock of the device tagged `tag` by `scale`, e.g. to overclock it.
    /// Devices deriving their clocks from it follow.
    pub fn set_clock_scale(&mut self, tag: &str, scale: f64) -> Result<(), EmuError> {
        let index = self.device_index(tag)?;
        if !(scale.is_finite() && scale > 0.0) {
            let source = ConfigError::InvalidClock { device: tag.into(), reason: "the scale must be a positive number" };
            return Err(self.config_error(source))
        }
        let unscaled = self.devices.entries()[index].unscaled;
        self.update_clocks(index, unscaled, scale).map_err(|source| self.config_error(source))
    }

    /// Apply new clocks to the device at `index` and its derived descendants.
    ///
    /// All new clocks are computed and checked before any of them is applied.
    fn update_clocks(&mut self, index: usize, unscaled: u32, scale: f64) -> Result<(), ConfigError> {
        let mut plan = vec![(index, unscaled, scale, scale_clock(unscaled, scale))];
        let mut next = 0;
        while let Some(&(owner, _, _, owner_clock)) = plan.get(next) {
            for child in self.devices.children(owner) {
                let entry = &self.devices.entries()[child];
                if let ClockSource::Derived { num, den } = entry.source {
                    let unscaled = derive_clock(owner_clock, num, den).ok_or_else(|| ConfigError::InvalidClock {
                        device: entry.tag.clone(), reason: "the derived clock overflows" })?;
                    plan.push((child, unscaled, entry.scale, scale_clock(unscaled, entry.scale)));
                }
            }
            next += 1;
        }
        if let Some(&(stalled, ..)) = plan.iter().find(|&&(i, .., clock)| clock == 0 && self.devices.entries()[i].unit.is_some()) {
            let unit = self.devices.entries()[stalled].tag.clone();
            return Err(SchedulerError::InvalidClock { unit }.into())
        }
        for (i, unscaled, scale, clock) in plan {
            let entry = &mut self.devices.entries_mut()[i];
            if let Some(unit) = entry.unit {
                self.scheduler.set_unit_clock(unit, clock)?;
            }
            entry.unscaled = unscaled;
            entry.scale = scale;
            entry.clock = clock;
            debug!("{}: clock changed to {} Hz ({} Hz scaled by {})", entry.tag, clock, unscaled, scale);
            entry.device.borrow_mut().device_clock_changed(clock);
        }
        Ok(())
    }

    fn device_index(&self, tag: &str) -> Result<usize, EmuError> {
        self.devices.position(tag).ok_or_else(|| self.config_error(ConfigError::UnknownDevice(tag.into())))
    }

    fn config_error(&self, source: ConfigError) -> EmuError {
        EmuError::Config { machine: self.name.clone(), source }
    }

    pub fn tags(&self) -> impl Iterator<Item=&str> {
        self.devices.tags()
    }

    pub fn device<D: Device>(&self, tag: &str) -> Option<Rc<RefCell<D>>> {
        self.devices.device::<D>(tag)
    }

    pub fn interface<I: ?Sized + 'static>(&self, tag: &str) -> Option<Rc<RefCell<I>>> {
        self.devices.interface::<I>(tag)
    }

    pub fn devices_with<I: ?Sized + 'static>(&self) -> impl Iterator<Item=(&str, Rc<RefCell<I>>)> {
        self.devices.devices_with::<I>()
    }

    /// Capture the registered state of all devices.
    pub fn save_state(&mut self) -> StateSnapshot {
        for &index in self.order.iter() {
            self.devices.entries()[index].device.borrow_mut().device_pre_save();
        }
        self.save.snapshot()
    }

    /// Restore the registered state of all devices. Nothing is modified if the snapshot
    /// doesn't match the registered items.
    pub fn load_state(&mut self, snapshot: &StateSnapshot) -> Result<(), EmuError> {
        self.save.restore(snapshot).map_err(|source| EmuError::State { machine: self.name.clone(), source })?;
        for &index in self.order.iter() {
            self.devices.entries()[index].device.borrow_mut().device_post_load();
        }
        Ok(())
    }

    /// The non-volatile memory images of all devices providing [NvramInterface], by tag.
    pub fn nvram_save(&self) -> BTreeMap<String, Vec<u8>> {
        self.devices.devices_with::<dyn NvramInterface>().map(|(tag, nvram)| {
            let mut data = Vec::new();
            nvram.borrow_mut().nvram_write(&mut data);
            (tag.to_string(), data)
        }).collect()
    }

    /// Load non-volatile memory images. Devices missing from `images` are set to their defaults.
    pub fn nvram_load(&mut self, images: &BTreeMap<String, Vec<u8>>) -> Result<(), EmuError> {
        for (tag, nvram) in self.devices.devices_with::<dyn NvramInterface>() {
            let mut nvram = nvram.borrow_mut();
            match images.get(tag) {
                Some(data) => nvram.nvram_read(data)
                                   .map_err(|source| EmuError::State { machine: self.name.clone(), source })?,
                None => nvram.nvram_default()
            }
        }
        Ok(())
    }

    fn reset_devices(&mut self) {
        for &index in self.order.iter() {
            self.devices.entries()[index].device.borrow_mut().device_reset(&mut self.scheduler);
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
         .field("name", &self.name)
         .field("time", &self.scheduler.time())
         .field("devices", &self.devices)
         .field("halted", &self.is_halted())
         .finish()
    }
}
