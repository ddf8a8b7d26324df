/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! The event driven scheduler.
//!
//! The [Scheduler] interleaves independently clocked [execution units][ExecuteUnit] and
//! dispatches timer callbacks. Emulated time advances in timeslices:
//!
//! 1. The end of the timeslice is the earliest of: the next timer expiry, the current
//!    quantum after the base time and the run limit.
//! 2. Each running unit which local time is behind the end of the timeslice executes the number
//!    of its own clock cycles that fits before that instant. A unit which consumes less than
//!    requested moves the end of the timeslice back to its own local time, so no unit after
//!    it runs ahead.
//! 3. The base time moves to the end of the timeslice and every timer expiring at or before it
//!    fires in the order of expiry, ties broken by the order of scheduling.
//!
//! Local time of each unit is derived from the number of cycles it consumed since its clock
//! was last changed, so no rounding errors accumulate.
use core::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::SchedulerError;
use crate::time::{Duration, Instant};

mod timer;
mod unit;

pub use timer::{TimerCallback, TimerId};
pub use unit::{ExecuteUnit, SuspendReason, UnitId, UnitState};
use timer::{QueueKey, TimerSlot};
use unit::UnitSlot;

/// The number of timeslices per second with the default quantum.
pub const DEFAULT_QUANTUM_HZ: u32 = 60;

/// The scheduler of timers and execution units.
pub struct Scheduler {
    base_time: Instant,
    // the end of the current timeslice
    target: Instant,
    timers: Vec<TimerSlot>,
    free_timers: Vec<usize>,
    queue: BTreeSet<QueueKey>,
    next_seq: u64,
    firing: Option<TimerId>,
    units: Vec<UnitSlot>,
    executing: Option<UnitId>,
    default_quantum: Duration,
    // temporary quanta with their expiry
    quanta: Vec<(Duration, Instant)>,
    perfect_unit: Option<UnitId>,
    running: bool,
    aborted: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(Duration::from_hz(DEFAULT_QUANTUM_HZ))
    }
}

impl Scheduler {
    /// Create a scheduler with the given default quantum.
    pub fn new(default_quantum: Duration) -> Self {
        Scheduler {
            base_time: Instant::ZERO,
            target: Instant::ZERO,
            timers: Vec::new(),
            free_timers: Vec::new(),
            queue: BTreeSet::new(),
            next_seq: 0,
            firing: None,
            units: Vec::new(),
            executing: None,
            default_quantum: sanitize_quantum(default_quantum),
            quanta: Vec::new(),
            perfect_unit: None,
            running: false,
            aborted: false
        }
    }

    /// The base time: the end of the last completed timeslice.
    #[inline]
    pub fn time(&self) -> Instant {
        self.base_time
    }

    /// The current time: the local time of the executing unit if called from within
    /// [ExecuteUnit::execute], the base time otherwise.
    #[inline]
    pub fn now(&self) -> Instant {
        match self.executing {
            Some(UnitId(index)) => self.units[index].local_time(),
            None => self.base_time
        }
    }

    /// Run until the base time reaches `limit`. Timers expiring exactly at `limit` fire.
    ///
    /// Fails on the first contract violation, leaving the scheduler at the time it occurred.
    pub fn run_until(&mut self, limit: Instant) -> Result<(), SchedulerError> {
        if self.running {
            return Err(SchedulerError::Reentrant)
        }
        if limit < self.base_time {
            return Err(SchedulerError::LimitInPast { limit, now: self.base_time })
        }
        self.running = true;
        let result = self.run_loop(limit);
        self.running = false;
        self.executing = None;
        result
    }

    /// Run for `duration` from the base time.
    pub fn run_for(&mut self, duration: Duration) -> Result<(), SchedulerError> {
        self.run_until(self.base_time + duration)
    }

    fn run_loop(&mut self, limit: Instant) -> Result<(), SchedulerError> {
        // synchronization requests from outside of the loop
        self.fire_due_timers()?;
        while self.base_time < limit {
            self.timeslice(limit)?;
        }
        Ok(())
    }

    fn timeslice(&mut self, limit: Instant) -> Result<(), SchedulerError> {
        let quantum_end = self.base_time + self.current_quantum();
        self.target = self.next_timer_expire().min(limit).min(quantum_end);
        self.aborted = false;
        trace!("timeslice {} -> {}", self.base_time, self.target);

        for index in 0..self.units.len() {
            let slot = &self.units[index];
            if !slot.is_running() {
                continue
            }
            let until = slot.cycles_until(self.target);
            if until <= slot.cycles {
                continue
            }
            let requested = until - slot.cycles;
            let unit = Rc::clone(&slot.unit);
            self.executing = Some(UnitId(index));
            let consumed = unit.borrow_mut().execute(requested, self);
            self.executing = None;

            let slot = &mut self.units[index];
            if consumed > requested {
                error!("{}: consumed {} cycles of {} requested", slot.name, consumed, requested);
                return Err(SchedulerError::UnitOverrun { unit: slot.name.clone(), requested, consumed })
            }
            slot.cycles += consumed;
            slot.total_cycles += consumed;
            if consumed < requested {
                let local = slot.local_time();
                if local > self.base_time && local < self.target {
                    self.target = local;
                }
            }
        }

        self.base_time = self.target;
        for slot in self.units.iter_mut() {
            if slot.started && !slot.suspend.is_empty() {
                slot.eat_until(self.base_time);
            }
        }
        let now = self.base_time;
        self.quanta.retain(|&(_, expire)| expire > now);
        self.fire_due_timers()
    }

    /// Called whenever a timer is scheduled at `expire`: an earlier timer shortens
    /// the current timeslice for the units which haven't run yet.
    fn lower_target(&mut self, expire: Instant) {
        if self.executing.is_some() && expire < self.target {
            self.target = expire.max(self.base_time);
            self.aborted = true;
        }
    }

    /// Request the executing unit to return as soon as possible.
    pub fn abort_timeslice(&mut self) {
        if self.executing.is_some() {
            self.aborted = true;
        }
    }

    /// Whether the executing unit should return early, because a synchronization point
    /// was scheduled before the end of its timeslice.
    #[inline]
    pub fn timeslice_aborted(&self) -> bool {
        self.aborted
    }

    /// The number of cycles the executing unit may still run in the current timeslice.
    pub fn cycles_left(&self, consumed: u64) -> u64 {
        match self.executing {
            Some(UnitId(index)) => {
                let slot = &self.units[index];
                slot.cycles_until(self.target).saturating_sub(slot.cycles + consumed)
            }
            None => 0
        }
    }

    /*-- quantum --*/

    /// The length of the next timeslice, unless a timer expires sooner.
    pub fn current_quantum(&self) -> Duration {
        let mut quantum = self.default_quantum;
        for &(q, _) in self.quanta.iter() {
            quantum = quantum.min(q);
        }
        if let Some(UnitId(index)) = self.perfect_unit {
            quantum = quantum.min(Duration::from_hz(self.units[index].clock));
        }
        quantum
    }

    pub fn default_quantum(&self) -> Duration {
        self.default_quantum
    }

    pub fn set_default_quantum(&mut self, quantum: Duration) {
        self.default_quantum = sanitize_quantum(quantum);
    }

    /// Use a smaller `quantum` for the next `duration` of emulated time.
    pub fn add_quantum(&mut self, quantum: Duration, duration: Duration) {
        let expire = self.now() + duration;
        self.quanta.push((sanitize_quantum(quantum), expire));
    }

    /// Temporarily increase the interleaving of all units: for the next `duration` timeslices
    /// last at most `timeslice`.
    pub fn boost_interleave(&mut self, timeslice: Duration, duration: Duration) {
        debug!("interleave boosted to {} for {}", timeslice, duration);
        self.add_quantum(timeslice, duration);
    }

    /// Limit timeslices to a single cycle of the given unit, so no unit ever runs
    /// ahead of it by more than one of its cycles. `None` restores normal interleaving.
    pub fn set_perfect_quantum(&mut self, unit: Option<UnitId>) -> Result<(), SchedulerError> {
        if let Some(id) = unit {
            self.unit_slot(id)?;
        }
        self.perfect_unit = unit;
        Ok(())
    }

    /*-- execution units --*/

    /// Register an execution unit. The unit is stopped until [Scheduler::start_unit] is called.
    pub fn add_unit<S: Into<String>>(
            &mut self,
            name: S,
            clock: u32,
            unit: Rc<RefCell<dyn ExecuteUnit>>
        ) -> Result<UnitId, SchedulerError>
    {
        let name = name.into();
        if clock == 0 {
            return Err(SchedulerError::InvalidClock { unit: name })
        }
        debug!("{}: execution unit at {} Hz", name, clock);
        self.units.push(UnitSlot::new(name, clock, unit, self.base_time));
        Ok(UnitId(self.units.len() - 1))
    }

    /// Start the unit at the current base time.
    pub fn start_unit(&mut self, id: UnitId) -> Result<(), SchedulerError> {
        let now = self.base_time;
        let slot = self.unit_slot_mut(id)?;
        if !slot.started {
            slot.started = true;
            slot.base = now;
            slot.cycles = 0;
        }
        Ok(())
    }

    pub fn stop_unit(&mut self, id: UnitId) -> Result<(), SchedulerError> {
        let slot = self.unit_slot_mut(id)?;
        slot.started = false;
        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn unit_by_name(&self, name: &str) -> Option<UnitId> {
        self.units.iter().position(|slot| slot.name == name).map(UnitId)
    }

    pub fn unit_name(&self, id: UnitId) -> Result<&str, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.name.as_str())
    }

    /// The unit which [ExecuteUnit::execute] is currently running.
    #[inline]
    pub fn executing_unit(&self) -> Option<UnitId> {
        self.executing
    }

    pub fn unit_state(&self, id: UnitId) -> Result<UnitState, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.state())
    }

    pub fn unit_local_time(&self, id: UnitId) -> Result<Instant, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.local_time())
    }

    /// The number of cycles the unit has actually executed.
    pub fn unit_total_cycles(&self, id: UnitId) -> Result<u64, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.total_cycles)
    }

    pub fn unit_clock(&self, id: UnitId) -> Result<u32, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.clock)
    }

    /// Change the unit's clock. The local time is rebased at the moment of the change.
    pub fn set_unit_clock(&mut self, id: UnitId, clock: u32) -> Result<(), SchedulerError> {
        let slot = self.unit_slot_mut(id)?;
        if clock == 0 {
            return Err(SchedulerError::InvalidClock { unit: slot.name.clone() })
        }
        slot.rebase();
        slot.clock = clock;
        debug!("{}: clock changed to {} Hz", slot.name, clock);
        Ok(())
    }

    pub fn suspend(&mut self, id: UnitId, reason: SuspendReason) -> Result<(), SchedulerError> {
        let slot = self.unit_slot_mut(id)?;
        slot.suspend |= reason;
        if self.executing == Some(id) {
            self.aborted = true;
        }
        Ok(())
    }

    /// Clear the suspend `reason`. A unit resumed with no reasons left continues from the current
    /// base time, the time it spent suspended is skipped.
    pub fn resume(&mut self, id: UnitId, reason: SuspendReason) -> Result<(), SchedulerError> {
        let now = self.base_time;
        let slot = self.unit_slot_mut(id)?;
        slot.suspend.remove(reason);
        if reason.contains(SuspendReason::TRIGGER) {
            slot.trigger = None;
        }
        if slot.suspend.is_empty() {
            slot.eat_until(now);
        }
        Ok(())
    }

    pub fn is_suspended(&self, id: UnitId, reason: SuspendReason) -> Result<bool, SchedulerError> {
        self.unit_slot(id).map(|slot| slot.suspend.intersects(reason))
    }

    /// Suspend the unit until [Scheduler::trigger] is called with the same `trigger` id.
    pub fn suspend_until_trigger(&mut self, id: UnitId, trigger: u32) -> Result<(), SchedulerError> {
        self.suspend(id, SuspendReason::TRIGGER)?;
        self.units[id.0].trigger = Some(trigger);
        Ok(())
    }

    /// Resume all units waiting for `trigger`.
    pub fn trigger(&mut self, trigger: u32) {
        let now = self.base_time;
        for slot in self.units.iter_mut().filter(|slot| slot.trigger == Some(trigger)) {
            trace!("{}: triggered by {}", slot.name, trigger);
            slot.trigger = None;
            slot.suspend.remove(SuspendReason::TRIGGER);
            if slot.suspend.is_empty() {
                slot.eat_until(now);
            }
        }
        if self.executing.is_some() {
            self.aborted = true;
        }
    }

    /// Suspend the unit for `duration` from now.
    pub fn spin_until_time(&mut self, id: UnitId, duration: Duration) -> Result<(), SchedulerError> {
        self.suspend(id, SuspendReason::SPIN)?;
        self.timer_set(duration, id.0 as u64, move |sched, _| sched.resume(id, SuspendReason::SPIN))?;
        Ok(())
    }

    fn unit_slot(&self, id: UnitId) -> Result<&UnitSlot, SchedulerError> {
        self.units.get(id.0).ok_or_else(|| SchedulerError::UnknownUnit(format!("#{}", id.0)))
    }

    fn unit_slot_mut(&mut self, id: UnitId) -> Result<&mut UnitSlot, SchedulerError> {
        self.units.get_mut(id.0).ok_or_else(|| SchedulerError::UnknownUnit(format!("#{}", id.0)))
    }
}

#[inline]
fn sanitize_quantum(quantum: Duration) -> Duration {
    quantum.max(Duration::from_raw(0, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs in chunks of `step` cycles, logging the local time of every chunk.
    struct Stepper {
        step: u64,
        log: Rc<RefCell<Vec<(char, Instant)>>>,
        name: char,
    }

    impl ExecuteUnit for Stepper {
        fn execute(&mut self, cycles: u64, sched: &mut Scheduler) -> u64 {
            let mut done = 0;
            while done < cycles {
                let chunk = self.step.min(cycles - done);
                done += chunk;
                self.log.borrow_mut().push((self.name, sched.now()));
                if sched.timeslice_aborted() {
                    break
                }
            }
            done
        }
    }

    struct Greedy;

    impl ExecuteUnit for Greedy {
        fn execute(&mut self, cycles: u64, _sched: &mut Scheduler) -> u64 {
            cycles + 1
        }
    }

    struct Lazy;

    impl ExecuteUnit for Lazy {
        fn execute(&mut self, _cycles: u64, _sched: &mut Scheduler) -> u64 {
            0
        }
    }

    fn stepper(name: char, step: u64, log: &Rc<RefCell<Vec<(char, Instant)>>>) -> Rc<RefCell<dyn ExecuteUnit>> {
        Rc::new(RefCell::new(Stepper { step, log: Rc::clone(log), name }))
    }

    #[test]
    fn scheduler_overrun_is_fatal() {
        let mut sched = Scheduler::default();
        let id = sched.add_unit("greedy", 1000, Rc::new(RefCell::new(Greedy))).unwrap();
        sched.start_unit(id).unwrap();
        match sched.run_for(Duration::from_secs(1)) {
            Err(SchedulerError::UnitOverrun { unit, consumed, requested }) => {
                assert_eq!(unit, "greedy");
                assert_eq!(consumed, requested + 1);
            }
            res => panic!("unexpected: {:?}", res)
        }
        assert_eq!(sched.time(), Instant::ZERO);
    }

    #[test]
    fn scheduler_lazy_unit_doesnt_stall() {
        let mut sched = Scheduler::default();
        let id = sched.add_unit("lazy", 1000, Rc::new(RefCell::new(Lazy))).unwrap();
        sched.start_unit(id).unwrap();
        sched.run_for(Duration::from_millis(100)).unwrap();
        assert_eq!(sched.time(), Instant::ZERO + Duration::from_millis(100));
        assert_eq!(sched.unit_total_cycles(id).unwrap(), 0);
        assert_eq!(sched.unit_local_time(id).unwrap(), Instant::ZERO);
    }

    #[test]
    fn scheduler_invalid_inputs() {
        let mut sched = Scheduler::default();
        assert!(matches!(sched.add_unit("zero", 0, Rc::new(RefCell::new(Lazy))),
                         Err(SchedulerError::InvalidClock { .. })));
        sched.run_for(Duration::from_millis(1)).unwrap();
        assert!(matches!(sched.run_until(Instant::ZERO), Err(SchedulerError::LimitInPast { .. })));
        assert!(sched.unit_state(UnitId(3)).is_err());
    }

    #[test]
    fn scheduler_suspend_eats_time() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        let id = sched.add_unit("cpu", 1000, stepper('a', 1000, &log)).unwrap();
        assert_eq!(sched.unit_state(id).unwrap(), UnitState::Stopped);
        sched.start_unit(id).unwrap();
        assert_eq!(sched.unit_state(id).unwrap(), UnitState::Running);
        sched.suspend(id, SuspendReason::HALT | SuspendReason::RESET).unwrap();
        sched.run_for(Duration::from_millis(500)).unwrap();
        assert_eq!(sched.unit_state(id).unwrap(), UnitState::Suspended);
        assert_eq!(sched.unit_total_cycles(id).unwrap(), 0);
        sched.resume(id, SuspendReason::HALT).unwrap();
        assert!(sched.is_suspended(id, SuspendReason::RESET).unwrap());
        sched.resume(id, SuspendReason::RESET).unwrap();
        assert_eq!(sched.unit_local_time(id).unwrap(), Instant::ZERO + Duration::from_millis(500));
        sched.run_for(Duration::from_millis(500)).unwrap();
        assert_eq!(sched.unit_total_cycles(id).unwrap(), 500);
    }

    #[test]
    fn scheduler_trigger_and_spin() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        let a = sched.add_unit("a", 1000, stepper('a', 1000, &log)).unwrap();
        let b = sched.add_unit("b", 1000, stepper('b', 1000, &log)).unwrap();
        sched.start_unit(a).unwrap();
        sched.start_unit(b).unwrap();
        sched.suspend_until_trigger(a, 7).unwrap();
        sched.spin_until_time(b, Duration::from_millis(250)).unwrap();
        sched.run_for(Duration::from_millis(500)).unwrap();
        assert_eq!(sched.unit_total_cycles(a).unwrap(), 0);
        assert_eq!(sched.unit_total_cycles(b).unwrap(), 250);
        sched.trigger(7);
        assert_eq!(sched.unit_state(a).unwrap(), UnitState::Running);
        sched.run_for(Duration::from_millis(500)).unwrap();
        assert_eq!(sched.unit_total_cycles(a).unwrap(), 500);
        assert_eq!(sched.unit_total_cycles(b).unwrap(), 750);
    }

    #[test]
    fn scheduler_clock_change_rebases() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        let id = sched.add_unit("cpu", 3, stepper('a', 1, &log)).unwrap();
        sched.start_unit(id).unwrap();
        sched.run_for(Duration::from_secs(1)).unwrap();
        assert_eq!(sched.unit_total_cycles(id).unwrap(), 3);
        sched.set_unit_clock(id, 7).unwrap();
        assert!(sched.set_unit_clock(id, 0).is_err());
        sched.run_for(Duration::from_secs(2)).unwrap();
        assert_eq!(sched.unit_total_cycles(id).unwrap(), 3 + 14);
        assert_eq!(sched.unit_local_time(id).unwrap(), Instant::ZERO + Duration::from_secs(3));
        assert_eq!(sched.unit_clock(id).unwrap(), 7);
    }

    #[test]
    fn scheduler_perfect_quantum_alternates() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        let a = sched.add_unit("a", 1000, stepper('a', 1, &log)).unwrap();
        let b = sched.add_unit("b", 1000, stepper('b', 1, &log)).unwrap();
        sched.start_unit(a).unwrap();
        sched.start_unit(b).unwrap();
        sched.set_perfect_quantum(Some(a)).unwrap();
        assert_eq!(sched.current_quantum(), Duration::from_millis(1));
        sched.run_for(Duration::from_millis(4)).unwrap();
        let names: String = log.borrow().iter().map(|&(n, _)| n).collect();
        assert_eq!(names, "abababab");
        sched.set_perfect_quantum(None).unwrap();
        assert_eq!(sched.current_quantum(), Duration::from_hz(DEFAULT_QUANTUM_HZ));
    }

    #[test]
    fn scheduler_boost_interleave_expires() {
        let mut sched = Scheduler::default();
        sched.boost_interleave(Duration::from_micros(100), Duration::from_millis(1));
        assert_eq!(sched.current_quantum(), Duration::from_micros(100));
        sched.run_for(Duration::from_millis(1)).unwrap();
        assert_eq!(sched.current_quantum(), Duration::from_hz(DEFAULT_QUANTUM_HZ));
    }

    #[test]
    fn scheduler_timer_from_unit_shortens_timeslice() {
        struct Syncer {
            fired: Rc<RefCell<Vec<Instant>>>,
            done: bool,
        }
        impl ExecuteUnit for Syncer {
            fn execute(&mut self, cycles: u64, sched: &mut Scheduler) -> u64 {
                if self.done {
                    return cycles
                }
                self.done = true;
                // run 10 cycles and request a synchronization
                let fired = Rc::clone(&self.fired);
                let consumed = 10.min(cycles);
                sched.timer_set(Duration::from_ticks(consumed, 1000), 0, move |sched, _| {
                    fired.borrow_mut().push(sched.now());
                    Ok(())
                }).unwrap();
                assert!(sched.timeslice_aborted());
                consumed
            }
        }
        let fired = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::default();
        let a = sched.add_unit("a", 1000, Rc::new(RefCell::new(Syncer { fired: Rc::clone(&fired), done: false }))).unwrap();
        let b = sched.add_unit("b", 1000, stepper('b', 1000, &log)).unwrap();
        sched.start_unit(a).unwrap();
        sched.start_unit(b).unwrap();
        sched.run_for(Duration::from_millis(100)).unwrap();
        let at = Instant::ZERO + Duration::from_millis(10);
        assert_eq!(*fired.borrow(), vec![at]);
        // b has run only up to the synchronization point in the first timeslice
        assert_eq!(log.borrow()[0], ('b', Instant::ZERO));
        assert_eq!(log.borrow()[1].1, at);
        assert_eq!(sched.unit_total_cycles(b).unwrap(), 100);
    }
}
