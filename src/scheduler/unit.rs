/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Execution units.
use core::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
#[cfg(feature = "serde")] use serde::{Serialize, Deserialize};

use crate::time::{Duration, Instant};
use super::Scheduler;

/// The interface of devices consuming emulated time by running.
pub trait ExecuteUnit {
    /// Run for at most `cycles` cycles of the unit's own clock and return the number of
    /// cycles actually consumed.
    ///
    /// A unit may consume less than requested (e.g. when it halts or wants to yield
    /// to a synchronization request), in which case the remainder is requested again in
    /// the next timeslice. Consuming more is a contract violation that halts the scheduler.
    ///
    /// While running, [Scheduler::now] returns the unit's local time and the unit may
    /// schedule timers, suspend itself or other units, or trigger events.
    fn execute(&mut self, cycles: u64, scheduler: &mut Scheduler) -> u64;
}

bitflags! {
    /// Reasons for a unit being suspended. A unit runs only when no reason is set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct SuspendReason: u8 {
        /// Halted by an input line.
        const HALT    = 0b0000_0001;
        /// Held in reset.
        const RESET   = 0b0000_0010;
        /// Spinning until a timer resumes it.
        const SPIN    = 0b0000_0100;
        /// Waiting for a trigger.
        const TRIGGER = 0b0000_1000;
        /// Disabled by configuration.
        const DISABLE = 0b0001_0000;
        /// Stopped by a debugger.
        const DEBUG   = 0b0010_0000;
        /// The clock is stopped.
        const CLOCK   = 0b0100_0000;
    }
}

/// The state of an execution unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnitState {
    /// Not started yet or stopped.
    Stopped,
    Running,
    Suspended
}

/// An index of a registered execution unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub(super) usize);

impl UnitId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

pub(super) struct UnitSlot {
    pub name: String,
    pub unit: Rc<RefCell<dyn ExecuteUnit>>,
    pub clock: u32,
    pub started: bool,
    pub suspend: SuspendReason,
    pub trigger: Option<u32>,
    // local time = base + cycles at clock
    pub base: Instant,
    pub cycles: u64,
    pub total_cycles: u64,
}

impl UnitSlot {
    pub fn new(name: String, clock: u32, unit: Rc<RefCell<dyn ExecuteUnit>>, now: Instant) -> Self {
        UnitSlot {
            name,
            unit,
            clock,
            started: false,
            suspend: SuspendReason::empty(),
            trigger: None,
            base: now,
            cycles: 0,
            total_cycles: 0
        }
    }

    #[inline]
    pub fn local_time(&self) -> Instant {
        self.base + Duration::from_ticks(self.cycles, self.clock)
    }

    #[inline]
    pub fn state(&self) -> UnitState {
        if !self.started {
            UnitState::Stopped
        }
        else if self.suspend.is_empty() {
            UnitState::Running
        }
        else {
            UnitState::Suspended
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == UnitState::Running
    }

    /// Move the base to the current local time, so the clock can change without drift.
    pub fn rebase(&mut self) {
        self.base = self.local_time();
        self.cycles = 0;
    }

    /// The number of cycles counted from the base that fit before `target`.
    #[inline]
    pub fn cycles_until(&self, target: Instant) -> u64 {
        match target.checked_duration_since(self.base) {
            Some(delta) => delta.as_ticks(self.clock),
            None => 0
        }
    }

    /// Follow the emulated time without running.
    pub fn eat_until(&mut self, target: Instant) {
        let cycles = self.cycles_until(target);
        if cycles > self.cycles {
            self.cycles = cycles;
        }
    }
}
