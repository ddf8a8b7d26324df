/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Address spaces and memory access dispatch.
//!
//! An [AddressSpace] routes accesses of 8, 16, 32 or 64 bits to handlers installed over
//! address ranges. Each side (read and write) keeps a sorted table of ranges covering the whole
//! address space, so every address resolves to exactly one handler in `O(log n)`.
//!
//! ```text
//!                    ______________________________________
//!   read/write      |            AddressSpace              |
//!  ---------------> | width adaptation + byte lane masks   |
//!   (addr, mask)    |______________________________________|
//!                       |         |         |          |
//!                  [ Memory ] [  Bank  ] [Delegate] [ Space ]
//!                   share      swappable   closures   nested
//!                              target                 space
//! ```
//!
//! Installing a handler over a range shadows whatever was there before only within that range.
//! Accesses wider than the data bus or not aligned to it are split into native accesses,
//! and handlers narrower than the data bus receive one call per sub-unit with a non-zero mask.
//! Native units with an all-zero mask are never accessed.
//!
//! A tap wraps the handlers over a range without replacing them: it sees every native access
//! and can modify the data. Removing it with its [TapHandle] restores the handlers below.
use core::fmt;

#[cfg(feature = "serde")] use serde::{Serialize, Deserialize};

mod bank;
mod handler;
mod map;
mod share;
mod space;

pub use bank::MemoryBank;
pub use handler::HandlerKind;
pub use map::{AddressMap, MapEntry};
pub use share::MemoryShare;
pub use space::{AddressSpace, TapHandle};

/// The byte order of a data bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Endianness {
    Little,
    Big
}

/// Identifies an address space of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SpaceNum {
    Program,
    Data,
    Io,
    /// Decrypted opcodes.
    Opcodes
}

impl SpaceNum {
    pub const ALL: [SpaceNum;4] = [SpaceNum::Program, SpaceNum::Data, SpaceNum::Io, SpaceNum::Opcodes];

    pub fn name(self) -> &'static str {
        match self {
            SpaceNum::Program => "program",
            SpaceNum::Data    => "data",
            SpaceNum::Io      => "io",
            SpaceNum::Opcodes => "opcodes",
        }
    }
}

impl fmt::Display for SpaceNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The configuration of an [AddressSpace].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpaceConfig {
    pub name: String,
    pub endianness: Endianness,
    /// The width of the data bus in bits: 8, 16, 32 or 64.
    pub data_width: u32,
    /// The width of the byte address in bits: 1 to 64.
    pub addr_width: u32,
    /// The value read from unmapped addresses, truncated to the data bus width.
    pub unmap_value: u64,
    /// Whether unmapped accesses are logged.
    pub log_unmap: bool,
}

impl SpaceConfig {
    /// Create a configuration reading all-ones from unmapped addresses.
    pub fn new<S: Into<String>>(name: S, endianness: Endianness, data_width: u32, addr_width: u32) -> Self {
        SpaceConfig {
            name: name.into(),
            endianness,
            data_width,
            addr_width,
            unmap_value: u64::MAX,
            log_unmap: true
        }
    }

    pub fn with_unmap_value(mut self, unmap_value: u64) -> Self {
        self.unmap_value = unmap_value;
        self
    }

    pub fn with_log_unmap(mut self, log_unmap: bool) -> Self {
        self.log_unmap = log_unmap;
        self
    }

    /// The highest valid address.
    pub fn addr_mask(&self) -> u64 {
        if self.addr_width >= 64 {
            u64::MAX
        }
        else {
            (1u64 << self.addr_width) - 1
        }
    }

    /// The width of the data bus in bytes.
    pub fn bus_bytes(&self) -> usize {
        (self.data_width / 8) as usize
    }
}

/// Unsigned integers transferred over a data bus.
pub trait Word: Copy + Eq + Default + fmt::Debug + fmt::LowerHex + 'static {
    const BITS: u32;
    const BYTES: usize;
    const MAX: Self;
    /// Zero-extend to 64 bits.
    fn to_u64(self) -> u64;
    /// Truncate from 64 bits.
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_word {
    ($($ty:ty),*) => {$(
        impl Word for $ty {
            const BITS: u32 = <$ty>::BITS;
            const BYTES: usize = core::mem::size_of::<$ty>();
            const MAX: Self = <$ty>::MAX;
            #[inline(always)]
            fn to_u64(self) -> u64 {
                self as u64
            }
            #[inline(always)]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    )*};
}

impl_word!(u8, u16, u32, u64);

/// A mask of the lowest `bytes` bytes.
#[inline(always)]
pub(crate) fn lane_mask(bytes: usize) -> u64 {
    if bytes >= 8 {
        u64::MAX
    }
    else {
        (1u64 << (bytes * 8)) - 1
    }
}

/// The bit shift of a `size`-byte lane starting at byte `offset` within a `bytes`-wide value.
#[inline(always)]
pub(crate) fn lane_shift(endianness: Endianness, offset: usize, size: usize, bytes: usize) -> u32 {
    match endianness {
        Endianness::Little => (offset * 8) as u32,
        Endianness::Big => ((bytes - offset - size) * 8) as u32,
    }
}

/// Iterate over all combinations of the `mirror` bits, starting with 0.
pub(crate) fn mirrors(mirror: u64) -> impl Iterator<Item=u64> {
    let mut next = Some(0u64);
    core::iter::from_fn(move || {
        let current = next?;
        let following = current.wrapping_sub(mirror) & mirror;
        next = if following == 0 { None } else { Some(following) };
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_lanes() {
        assert_eq!(lane_mask(1), 0xff);
        assert_eq!(lane_mask(4), 0xffff_ffff);
        assert_eq!(lane_mask(8), u64::MAX);
        assert_eq!(lane_shift(Endianness::Little, 1, 1, 4), 8);
        assert_eq!(lane_shift(Endianness::Big, 1, 1, 4), 16);
        assert_eq!(lane_shift(Endianness::Big, 0, 2, 4), 16);
        assert_eq!(lane_shift(Endianness::Little, 2, 2, 4), 16);
    }

    #[test]
    fn memory_mirrors() {
        assert_eq!(mirrors(0).collect::<Vec<_>>(), vec![0]);
        assert_eq!(mirrors(0x2400).collect::<Vec<_>>(), vec![0, 0x400, 0x2000, 0x2400]);
        assert_eq!(mirrors(u64::MAX << 60).count(), 16);
    }

    #[test]
    fn memory_space_config() {
        let config = SpaceConfig::new("program", Endianness::Big, 16, 24).with_unmap_value(0);
        assert_eq!(config.addr_mask(), 0xff_ffff);
        assert_eq!(config.bus_bytes(), 2);
        assert_eq!(config.unmap_value, 0);
        assert!(config.log_unmap);
        assert_eq!(SpaceConfig::new("wide", Endianness::Little, 64, 64).addr_mask(), u64::MAX);
        assert_eq!(SpaceNum::Io.to_string(), "io");
        assert_eq!(<u16 as Word>::from_u64(0x1_2345), 0x2345);
    }
}
