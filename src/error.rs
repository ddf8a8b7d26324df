/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Error types.
//!
//! * [ConfigError] - detected while a machine is being configured, before any emulated time passes.
//! * [SchedulerError] - runtime contract violations, fatal to the running machine.
//! * [StateError] - a saved state or an NVRAM image doesn't match the registered items.
//! * [EmuError] - any of the above, tagged with the name of the machine.
use thiserror::Error;

use crate::memory::SpaceNum;
use crate::scheduler::TimerId;
use crate::time::Instant;

/// A configuration error. Aborts the machine construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{space}: invalid address space configuration: {reason}")]
    InvalidSpace { space: String, reason: &'static str },
    #[error("{space}: invalid range {start:#x}-{end:#x}: {reason}")]
    InvalidRange { space: String, start: u64, end: u64, reason: &'static str },
    #[error("{space}: range {start:#x}-{end:#x} is not aligned to the {bytes}-byte data bus")]
    Misaligned { space: String, start: u64, end: u64, bytes: usize },
    #[error("{space}: invalid mirror {mirror:#x} for range {start:#x}-{end:#x}: {reason}")]
    InvalidMirror { space: String, start: u64, end: u64, mirror: u64, reason: &'static str },
    #[error("{space}: a {bits}-bit handler is wider than the {bus_bits}-bit data bus")]
    HandlerTooWide { space: String, bits: u32, bus_bits: u32 },
    #[error("{space}: memory share `{share}` of {len} bytes is too small for range {start:#x}-{end:#x}")]
    ShareTooSmall { space: String, share: String, len: usize, start: u64, end: u64 },
    #[error("{space}: forwarded space `{target}` has a {target_bits}-bit data bus, expected {bus_bits}")]
    SpaceWidthMismatch { space: String, target: String, target_bits: u32, bus_bits: u32 },
    #[error("address map ranges {first_start:#x}-{first_end:#x} and {second_start:#x}-{second_end:#x} overlap")]
    OverlappingRange { first_start: u64, first_end: u64, second_start: u64, second_end: u64 },
    #[error("memory bank `{bank}` has no entry {entry}")]
    UnknownBankEntry { bank: String, entry: usize },
    #[error("duplicate device tag `{0}`")]
    DuplicateTag(String),
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    #[error("unknown device type `{0}`")]
    UnknownDeviceType(String),
    #[error("duplicate device type `{0}`")]
    DuplicateDeviceType(String),
    #[error("{device}: required device `{path}` not found at `{tag}`")]
    MissingRequired { device: String, path: String, tag: String },
    #[error("{device}: device `{tag}` doesn't provide {interface}")]
    MissingInterface { device: String, tag: String, interface: &'static str },
    #[error("circular device dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("{device}: no {space:?} address space")]
    NoAddressSpace { device: String, space: SpaceNum },
    #[error("{device}: an execution unit needs a non-zero clock")]
    NoClock { device: String },
    #[error("{device}: invalid clock: {reason}")]
    InvalidClock { device: String, reason: &'static str },
    #[error("duplicate save state item `{0}`")]
    DuplicateSaveItem(String),
    #[error("{device}: {message}")]
    Device { device: String, message: String },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// A runtime contract violation. Halts the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{unit}: consumed {consumed} cycles while only {requested} were requested")]
    UnitOverrun { unit: String, requested: u64, consumed: u64 },
    #[error("timer `{timer}` scheduled at {expire}, in the past of {now}")]
    TimerInPast { timer: String, expire: Instant, now: Instant },
    #[error("run limit {limit} is in the past of {now}")]
    LimitInPast { limit: Instant, now: Instant },
    #[error("stale or unknown timer {0:?}")]
    UnknownTimer(TimerId),
    #[error("unknown execution unit `{0}`")]
    UnknownUnit(String),
    #[error("{unit}: a clock must not be 0 Hz")]
    InvalidClock { unit: String },
    #[error("the scheduler is already running")]
    Reentrant,
    #[error("{device}: {message}")]
    Device { device: String, message: String },
}

/// A save state or NVRAM restoration error.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown state item `{0}`")]
    UnknownItem(String),
    #[error("state item `{0}` is missing")]
    MissingItem(String),
    #[error("state item `{name}`: expected {expected}, found {found}")]
    KindMismatch { name: String, expected: &'static str, found: &'static str },
    #[error("state item `{name}`: expected {expected} bytes, found {found}")]
    SizeMismatch { name: String, expected: usize, found: usize },
    #[error("{device}: invalid NVRAM image: {message}")]
    Nvram { device: String, message: String },
}

/// An error tagged with the machine name.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("{machine}: configuration error: {source}")]
    Config { machine: String, source: ConfigError },
    #[error("{machine}: fatal error: {source}")]
    Fatal { machine: String, source: SchedulerError },
    #[error("{machine}: halted after a fatal error")]
    Halted { machine: String },
    #[error("{machine}: {source}")]
    State { machine: String, source: StateError },
}
