/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Timers.
use core::fmt;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::SchedulerError;
use crate::time::{Duration, Instant};
use super::Scheduler;

/// A timer callback. Invoked with the scheduler and the timer's parameter.
pub type TimerCallback = Box<dyn FnMut(&mut Scheduler, u64) -> Result<(), SchedulerError>>;

/// A handle of an allocated timer.
///
/// Handles of removed timers become stale: every operation on them fails with
/// [SchedulerError::UnknownTimer].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({}#{})", self.index, self.generation)
    }
}

pub(super) struct TimerSlot {
    name: String,
    generation: u32,
    live: bool,
    // taken out while the callback is running
    callback: Option<TimerCallback>,
    temporary: bool,
    enabled: bool,
    param: u64,
    start: Instant,
    expire: Instant,
    period: Duration,
    seq: u64,
}

/// Queue key: ordered by expiry, then by the order of scheduling.
pub(super) type QueueKey = (Instant, u64, u32);

impl TimerSlot {
    #[inline]
    fn is_periodic(&self) -> bool {
        !self.period.is_zero() && !self.period.is_never()
    }

    #[inline]
    fn key(&self, index: usize) -> QueueKey {
        (self.expire, self.seq, index as u32)
    }
}

impl Scheduler {
    /// Allocate a persistent timer. The timer is disabled until adjusted.
    pub fn timer_alloc<S, F>(&mut self, name: S, callback: F) -> TimerId
        where S: Into<String>,
              F: FnMut(&mut Scheduler, u64) -> Result<(), SchedulerError> + 'static
    {
        self.alloc_timer(name.into(), Box::new(callback), false)
    }

    /// Schedule a temporary one-shot timer firing after `delay`. The timer is removed
    /// after it fires.
    pub fn timer_set<F>(&mut self, delay: Duration, param: u64, callback: F) -> Result<TimerId, SchedulerError>
        where F: FnMut(&mut Scheduler, u64) -> Result<(), SchedulerError> + 'static
    {
        let id = self.alloc_timer("temporary".into(), Box::new(callback), true);
        self.timer_adjust(id, delay, param, Duration::ZERO)?;
        Ok(id)
    }

    /// Request all execution units to catch up with the current time before `callback`
    /// is invoked.
    pub fn synchronize<F>(&mut self, param: u64, callback: F) -> Result<TimerId, SchedulerError>
        where F: FnMut(&mut Scheduler, u64) -> Result<(), SchedulerError> + 'static
    {
        self.timer_set(Duration::ZERO, param, callback)
    }

    /// Schedule the timer to fire after `delay` from [Scheduler::now], then every `period`.
    ///
    /// A `period` of [Duration::ZERO] or [Duration::NEVER] makes a one-shot timer.
    /// A `delay` of [Duration::NEVER] disables the timer.
    pub fn timer_adjust(&mut self, id: TimerId, delay: Duration, param: u64, period: Duration) -> Result<(), SchedulerError> {
        let now = self.now();
        self.schedule_timer(id, now, now + delay, param, period)
    }

    /// Schedule the timer to fire at the absolute instant `at`, then every `period`.
    ///
    /// Scheduling before [Scheduler::now] fails with [SchedulerError::TimerInPast].
    pub fn timer_adjust_at(&mut self, id: TimerId, at: Instant, param: u64, period: Duration) -> Result<(), SchedulerError> {
        let now = self.now();
        if at < now {
            let timer = self.timer_slot(id)?.name.clone();
            error!("timer `{}` scheduled at {} in the past of {}", timer, at, now);
            return Err(SchedulerError::TimerInPast { timer, expire: at, now })
        }
        self.schedule_timer(id, now, at, param, period)
    }

    /// Schedule the timer after `delay` keeping its parameter and period.
    pub fn timer_reset(&mut self, id: TimerId, delay: Duration) -> Result<(), SchedulerError> {
        let slot = self.timer_slot(id)?;
        let (param, period) = (slot.param, slot.period);
        self.timer_adjust(id, delay, param, period)
    }

    /// Enable or disable the timer, returning the previous state.
    ///
    /// A re-enabled timer keeps its previous expiry time if it's still ahead of
    /// [Scheduler::now]. A periodic timer which missed its expiry while disabled skips
    /// the missed periods and fires next at the first period boundary not before `now`.
    /// Re-enabling a one-shot timer after its expiry fails with [SchedulerError::TimerInPast]
    /// and the timer stays disabled.
    pub fn timer_enable(&mut self, id: TimerId, enable: bool) -> Result<bool, SchedulerError> {
        let index = self.timer_index(id)?;
        let was_enabled = self.timers[index].enabled;
        if enable && !was_enabled && !self.timers[index].expire.is_never() {
            let now = self.now();
            let seq = self.next_sequence();
            let slot = &mut self.timers[index];
            if slot.expire < now {
                if !slot.is_periodic() {
                    error!("timer `{}` re-enabled at {} after its expiry at {}", slot.name, now, slot.expire);
                    return Err(SchedulerError::TimerInPast { timer: slot.name.clone(), expire: slot.expire, now })
                }
                let missed = (now - slot.expire).periods_ceil(slot.period);
                slot.start = slot.expire + slot.period.saturating_mul(missed - 1);
                slot.expire = slot.expire + slot.period.saturating_mul(missed);
                debug!("timer `{}` re-armed at {} skipping {} periods", slot.name, slot.expire, missed);
            }
            slot.seq = seq;
            slot.enabled = true;
            let key = slot.key(index);
            self.queue.insert(key);
            self.lower_target(key.0);
        }
        else if !enable && was_enabled {
            self.dequeue_timer(index);
            self.timers[index].enabled = false;
        }
        Ok(was_enabled)
    }

    /// Disable the timer. Cancelling a timer whose callback is currently running
    /// only prevents its further firings.
    pub fn timer_cancel(&mut self, id: TimerId) -> Result<(), SchedulerError> {
        self.timer_enable(id, false).map(drop)
    }

    /// Remove the timer. The handle becomes stale.
    pub fn timer_remove(&mut self, id: TimerId) -> Result<(), SchedulerError> {
        let index = self.timer_index(id)?;
        self.release_timer(index);
        Ok(())
    }

    pub fn timer_enabled(&self, id: TimerId) -> Result<bool, SchedulerError> {
        self.timer_slot(id).map(|slot| slot.enabled)
    }

    pub fn timer_name(&self, id: TimerId) -> Result<&str, SchedulerError> {
        self.timer_slot(id).map(|slot| slot.name.as_str())
    }

    pub fn timer_param(&self, id: TimerId) -> Result<u64, SchedulerError> {
        self.timer_slot(id).map(|slot| slot.param)
    }

    pub fn timer_period(&self, id: TimerId) -> Result<Duration, SchedulerError> {
        self.timer_slot(id).map(|slot| slot.period)
    }

    /// The instant the timer fires next or [Instant::NEVER] if it's disabled.
    pub fn timer_expire(&self, id: TimerId) -> Result<Instant, SchedulerError> {
        self.timer_slot(id).map(|slot| if slot.enabled { slot.expire } else { Instant::NEVER })
    }

    /// The time left until the timer fires or [Duration::NEVER] if it's disabled.
    pub fn timer_remaining(&self, id: TimerId) -> Result<Duration, SchedulerError> {
        let expire = self.timer_expire(id)?;
        Ok(expire.saturating_duration_since(self.now()))
    }

    /// The time elapsed since the timer was last scheduled or last fired.
    pub fn timer_elapsed(&self, id: TimerId) -> Result<Duration, SchedulerError> {
        let start = self.timer_slot(id)?.start;
        Ok(self.now().saturating_duration_since(start))
    }

    /// The number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timers.iter().filter(|slot| slot.live).count()
    }

    /// The timer which callback is currently being invoked.
    pub fn firing_timer(&self) -> Option<TimerId> {
        self.firing
    }

    pub(super) fn next_timer_expire(&self) -> Instant {
        match self.queue.first() {
            Some(&(expire, ..)) => expire,
            None => Instant::NEVER
        }
    }

    /// Fire every timer expiring at or before the base time, in queue order.
    ///
    /// Timers scheduled by callbacks at or before the base time are fired in the same pass.
    pub(super) fn fire_due_timers(&mut self) -> Result<(), SchedulerError> {
        while let Some(&key) = self.queue.first() {
            let (expire, _, index) = key;
            if expire > self.base_time {
                break
            }
            self.queue.remove(&key);
            let index = index as usize;
            let seq = self.next_sequence();
            let slot = &mut self.timers[index];
            let id = TimerId { index: index as u32, generation: slot.generation };
            let param = slot.param;
            if slot.is_periodic() {
                slot.start = expire;
                slot.expire = expire + slot.period;
                slot.seq = seq;
                let key = slot.key(index);
                self.queue.insert(key);
            }
            else {
                slot.enabled = false;
            }
            let slot = &mut self.timers[index];
            trace!("timer `{}` fired at {}", slot.name, expire);
            let mut callback = match slot.callback.take() {
                Some(callback) => callback,
                None => continue
            };
            let firing = self.firing.replace(id);
            let result = callback(self, param);
            self.firing = firing;
            let slot = &mut self.timers[index];
            if slot.generation == id.generation {
                if slot.temporary && !slot.enabled {
                    self.release_timer(index);
                }
                else {
                    slot.callback = Some(callback);
                }
            }
            if let Err(err) = result {
                error!("timer `{}` failed: {}", self.timer_label(index, id), err);
                return Err(err)
            }
        }
        Ok(())
    }

    fn timer_label(&self, index: usize, id: TimerId) -> &str {
        match self.timers.get(index) {
            Some(slot) if slot.generation == id.generation => &slot.name,
            _ => "removed"
        }
    }

    fn alloc_timer(&mut self, name: String, callback: TimerCallback, temporary: bool) -> TimerId {
        let now = self.now();
        let mut slot = TimerSlot {
            name,
            generation: 0,
            live: true,
            callback: Some(callback),
            temporary,
            enabled: false,
            param: 0,
            start: now,
            expire: Instant::NEVER,
            period: Duration::ZERO,
            seq: 0
        };
        match self.free_timers.pop() {
            Some(index) => {
                slot.generation = self.timers[index].generation;
                let id = TimerId { index: index as u32, generation: slot.generation };
                self.timers[index] = slot;
                id
            }
            None => {
                self.timers.push(slot);
                TimerId { index: (self.timers.len() - 1) as u32, generation: 0 }
            }
        }
    }

    fn schedule_timer(
            &mut self,
            id: TimerId,
            start: Instant,
            expire: Instant,
            param: u64,
            period: Duration
        ) -> Result<(), SchedulerError>
    {
        let index = self.timer_index(id)?;
        self.dequeue_timer(index);
        let seq = self.next_sequence();
        let slot = &mut self.timers[index];
        slot.param = param;
        slot.period = period;
        slot.start = start;
        slot.expire = expire;
        slot.seq = seq;
        slot.enabled = !expire.is_never();
        if slot.enabled {
            debug!("timer `{}` scheduled at {}", slot.name, expire);
            let key = slot.key(index);
            self.queue.insert(key);
            self.lower_target(expire);
        }
        Ok(())
    }

    fn dequeue_timer(&mut self, index: usize) {
        let slot = &self.timers[index];
        if slot.enabled {
            let key = slot.key(index);
            self.queue.remove(&key);
        }
    }

    fn release_timer(&mut self, index: usize) {
        self.dequeue_timer(index);
        let slot = &mut self.timers[index];
        slot.live = false;
        slot.enabled = false;
        slot.callback = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_timers.push(index);
    }

    #[inline]
    fn next_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn timer_index(&self, id: TimerId) -> Result<usize, SchedulerError> {
        match self.timers.get(id.index as usize) {
            Some(slot) if slot.live && slot.generation == id.generation => Ok(id.index as usize),
            _ => Err(SchedulerError::UnknownTimer(id))
        }
    }

    fn timer_slot(&self, id: TimerId) -> Result<&TimerSlot, SchedulerError> {
        self.timer_index(id).map(|index| &self.timers[index])
    }
}
