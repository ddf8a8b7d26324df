/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::cell::RefCell;
use core::fmt;
use std::collections::HashMap;
use std::rc::Rc;

use crate::device::{Device, InterfaceSet, MemoryInterface};
use crate::error::ConfigError;
use crate::memory::{AddressSpace, SpaceNum};
use crate::scheduler::UnitId;
use crate::time::Duration;

/// How the unscaled clock of a device is configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ClockSource {
    Fixed(u32),
    /// `num / den` of the owner's clock.
    Derived { num: u32, den: u32 },
}

pub(super) struct DeviceEntry {
    pub tag: String,
    // index of the owning device, `None` for the root
    pub owner: Option<usize>,
    pub source: ClockSource,
    pub unscaled: u32,
    pub scale: f64,
    /// The effective clock: `unscaled * scale`.
    pub clock: u32,
    pub device: Rc<RefCell<dyn Device>>,
    pub interfaces: InterfaceSet,
    // indexes of the devices this one requires
    pub deps: Vec<usize>,
    pub unit: Option<UnitId>,
}

impl DeviceEntry {
    pub fn new(
            tag: String,
            owner: Option<usize>,
            source: ClockSource,
            device: Rc<RefCell<dyn Device>>,
            interfaces: InterfaceSet
        ) -> Self
    {
        // derived clocks are resolved when the machine is built
        let clock = match source {
            ClockSource::Fixed(clock) => clock,
            ClockSource::Derived {..} => 0
        };
        DeviceEntry {
            tag, owner, source, unscaled: clock, scale: 1.0, clock, device, interfaces, deps: Vec::new(), unit: None
        }
    }
}

/// The devices of a machine by their tags.
#[derive(Default)]
pub struct Devices {
    entries: Vec<DeviceEntry>,
    index: HashMap<String, usize>,
}

impl Devices {
    pub(super) fn push(&mut self, entry: DeviceEntry) -> Result<usize, ConfigError> {
        if self.index.contains_key(&entry.tag) {
            return Err(ConfigError::DuplicateTag(entry.tag))
        }
        let index = self.entries.len();
        self.index.insert(entry.tag.clone(), index);
        self.entries.push(entry);
        Ok(index)
    }

    pub(super) fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub(super) fn entries_mut(&mut self) -> &mut [DeviceEntry] {
        &mut self.entries
    }

    pub(super) fn position(&self, tag: &str) -> Option<usize> {
        self.index.get(tag).copied()
    }

    pub(super) fn entry(&self, tag: &str) -> Result<&DeviceEntry, ConfigError> {
        match self.position(tag) {
            Some(index) => Ok(&self.entries[index]),
            None => Err(ConfigError::UnknownDevice(tag.into()))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.index.contains_key(tag)
    }

    /// Tags in declaration order.
    pub fn tags(&self) -> impl Iterator<Item=&str> {
        self.entries.iter().map(|entry| entry.tag.as_str())
    }

    /// The effective clock of the device tagged `tag` in Hz.
    pub fn clock(&self, tag: &str) -> Option<u32> {
        self.position(tag).map(|index| self.entries[index].clock)
    }

    /// The clock of the device before its scale factor is applied.
    pub fn unscaled_clock(&self, tag: &str) -> Option<u32> {
        self.position(tag).map(|index| self.entries[index].unscaled)
    }

    pub fn clock_scale(&self, tag: &str) -> Option<f64> {
        self.position(tag).map(|index| self.entries[index].scale)
    }

    /// The duration of `clocks` cycles of the device tagged `tag`.
    /// A device without a clock never completes a cycle: the result is [Duration::NEVER].
    pub fn clocks_to_time(&self, tag: &str, clocks: u64) -> Option<Duration> {
        self.clock(tag).map(|clock| match clock {
            0 => Duration::NEVER,
            clock => Duration::from_ticks(clocks, clock)
        })
    }

    /// The number of whole cycles of the device tagged `tag` completed within `duration`.
    pub fn time_to_clocks(&self, tag: &str, duration: Duration) -> Option<u64> {
        self.clock(tag).map(|clock| match clock {
            0 => 0,
            clock => duration.as_ticks(clock)
        })
    }

    /// Indexes of the devices owned by the device at `owner`.
    pub(super) fn children(&self, owner: usize) -> impl Iterator<Item=usize> + '_ {
        self.entries.iter().enumerate()
            .filter(move |(_, entry)| entry.owner == Some(owner))
            .map(|(index, _)| index)
    }

    /// The device tagged `tag` as its concrete type.
    pub fn device<D: Device>(&self, tag: &str) -> Option<Rc<RefCell<D>>> {
        self.interface::<D>(tag)
    }

    /// The capability `I` of the device tagged `tag`.
    pub fn interface<I: ?Sized + 'static>(&self, tag: &str) -> Option<Rc<RefCell<I>>> {
        self.position(tag).and_then(|index| self.entries[index].interfaces.get::<I>())
    }

    /// All devices providing the capability `I`, in declaration order.
    pub fn devices_with<I: ?Sized + 'static>(&self) -> impl Iterator<Item=(&str, Rc<RefCell<I>>)> {
        self.entries.iter().filter_map(|entry| {
            entry.interfaces.get::<I>().map(|iface| (entry.tag.as_str(), iface))
        })
    }

    /// The address space `num` of the device tagged `tag`.
    pub fn space(&self, tag: &str, num: SpaceNum) -> Result<Rc<AddressSpace>, ConfigError> {
        let entry = self.entry(tag)?;
        let memory = match entry.interfaces.get::<dyn MemoryInterface>() {
            Some(memory) => memory,
            None => return Err(ConfigError::MissingInterface {
                device: tag.into(), tag: tag.into(), interface: "MemoryInterface" })
        };
        let space = memory.borrow().memory_space(num);
        space.ok_or_else(|| ConfigError::NoAddressSpace { device: tag.into(), space: num })
    }
}

impl fmt::Debug for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
         .entries(self.entries.iter().map(|entry| (&entry.tag, &entry.interfaces)))
         .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Visiting,
    Done
}

/// Order devices so that each comes after the devices it requires. Independent devices keep
/// their declaration order.
pub(super) fn start_order(entries: &[DeviceEntry]) -> Result<Vec<usize>, ConfigError> {
    let mut marks = vec![Mark::New; entries.len()];
    let mut order = Vec::with_capacity(entries.len());
    let mut path = Vec::new();
    for index in 0..entries.len() {
        visit(index, entries, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

fn visit(
        index: usize,
        entries: &[DeviceEntry],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>
    ) -> Result<(), ConfigError>
{
    match marks[index] {
        Mark::Done => return Ok(()),
        Mark::Visiting => {
            let pos = path.iter().position(|&i| i == index).unwrap_or(0);
            let mut cycle: Vec<String> = path[pos..].iter().map(|&i| entries[i].tag.clone()).collect();
            cycle.push(entries[index].tag.clone());
            return Err(ConfigError::CircularDependency(cycle))
        }
        Mark::New => {}
    }
    marks[index] = Mark::Visiting;
    path.push(index);
    for &dep in entries[index].deps.iter() {
        visit(dep, entries, marks, path, order)?;
    }
    path.pop();
    marks[index] = Mark::Done;
    order.push(index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Device for Nothing {}

    fn entries(deps: &[&[usize]]) -> Vec<DeviceEntry> {
        deps.iter().enumerate().map(|(n, deps)| {
            let device: Rc<RefCell<dyn Device>> = Rc::new(RefCell::new(Nothing));
            let mut entry = DeviceEntry::new(
                format!(":d{}", n), None, ClockSource::Fixed(0), device, InterfaceSet::new());
            entry.deps = deps.to_vec();
            entry
        }).collect()
    }

    #[test]
    fn devices_start_order() {
        assert_eq!(start_order(&entries(&[&[1], &[2], &[]])).unwrap(), vec![2, 1, 0]);
        assert_eq!(start_order(&entries(&[&[], &[], &[]])).unwrap(), vec![0, 1, 2]);
        assert_eq!(start_order(&entries(&[&[2], &[], &[], &[1]])).unwrap(), vec![2, 0, 1, 3]);
        match start_order(&entries(&[&[], &[2], &[3], &[1]])) {
            Err(ConfigError::CircularDependency(path)) => assert_eq!(path, vec![":d1", ":d2", ":d3", ":d1"]),
            other => panic!("unexpected: {:?}", other)
        }
    }
}
