/*
    memory_test: Test program for the emucore library.
    Copyright (C) 2019-2024  Rafal Michalski

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
//! Address space dispatch properties.
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use rand::prelude::*;
use emucore::{AddressSpace, MemoryBank, MemoryShare};
use emucore::memory::{AddressMap, Endianness, HandlerKind, SpaceConfig, TapHandle};

fn space(endianness: Endianness, data_width: u32, addr_width: u32) -> AddressSpace {
    AddressSpace::new(SpaceConfig::new("test", endianness, data_width, addr_width)).unwrap()
}

#[test]
fn memory_unmapped_and_ram() {
    let sp = AddressSpace::new(
        SpaceConfig::new("program", Endianness::Little, 8, 16).with_unmap_value(0xff)).unwrap();
    assert_eq!(sp.read_byte(0x0000), 0xff);
    assert_eq!(sp.read_byte(0xffff), 0xff);
    let ram = MemoryShare::new("ram", 0x1000);
    sp.install_ram(0x8000, 0x8fff, 0, &ram, 0).unwrap();
    assert_eq!(sp.read_byte(0x8010), 0x00);
    sp.write_byte(0x8010, 0x42);
    assert_eq!(sp.read_byte(0x8010), 0x42);
    assert_eq!(ram.read_byte(0x10), 0x42);
    assert_eq!(sp.read_byte(0x9000), 0xff);
    assert_eq!(sp.read_byte(0x7fff), 0xff);
}

#[test]
fn memory_shadowing_restores() {
    let sp = space(Endianness::Little, 8, 16);
    let a = MemoryShare::filled("a", 0x4000, 0xaa);
    let b = MemoryShare::filled("b", 0x100, 0xbb);
    sp.install_rom(0x4000, 0x7fff, 0, &a, 0).unwrap();
    a.write_byte(0x1234, 0x12);
    a.write_byte(0x1334, 0x34);
    let before: Vec<u8> = (0x3f00..0x8100).map(|addr| sp.read_byte(addr)).collect();

    sp.install_rom(0x5200, 0x52ff, 0, &b, 0).unwrap();
    for addr in 0x3f00..0x8100u64 {
        let expected = match addr {
            0x5200..=0x52ff => 0xbb,
            _ => before[(addr - 0x3f00) as usize]
        };
        assert_eq!(sp.read_byte(addr), expected, "at {:#x}", addr);
    }
    assert_eq!(sp.read_byte(0x5234), 0xbb);
    assert_eq!(sp.read_byte(0x5334), 0x34);

    // reinstalling the original handler over the hole brings the exact offsets back
    sp.install_rom(0x5200, 0x52ff, 0, &a, 0x1200).unwrap();
    let after: Vec<u8> = (0x3f00..0x8100).map(|addr| sp.read_byte(addr)).collect();
    assert_eq!(before, after);
}

#[test]
fn memory_narrow_handler_packing() {
    for endianness in [Endianness::Little, Endianness::Big] {
        let sp = space(endianness, 32, 16);
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        sp.install_read_handler::<u8, _>(0x2000, 0x2fff, 0, move |offset, _| {
            counter.set(counter.get() + 1);
            (offset as u8).wrapping_mul(7).wrapping_add(3)
        }).unwrap();
        for base in (0x2000..0x2100).step_by(4) {
            let bytes: Vec<u8> = (0..4).map(|k| sp.read_byte(base + k)).collect();
            let packed = match endianness {
                Endianness::Little => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                Endianness::Big => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            };
            calls.set(0);
            assert_eq!(sp.read_dword(base), packed);
            assert_eq!(calls.get(), 4);
        }
        assert_eq!(sp.read_handler_kind(0x2000), HandlerKind::Delegate(8));
    }
}

#[test]
fn memory_random_access_matches_bytes() {
    let mut rng = StdRng::seed_from_u64(0xbeef);
    for (endianness, data_width) in [(Endianness::Little, 8), (Endianness::Little, 32),
                                     (Endianness::Big, 16), (Endianness::Big, 64)] {
        let sp = space(endianness, data_width, 10);
        let ram = MemoryShare::new("ram", 1024);
        sp.install_ram(0, 0x3ff, 0, &ram, 0).unwrap();
        let mut model = vec![0u8; 1024];
        for _ in 0..2000 {
            let size = [1usize, 2, 4, 8][rng.gen_range(0..4)];
            let address = rng.gen_range(0..1024u64);
            let data: u64 = rng.gen();
            let mask: u64 = if rng.gen_bool(0.3) { rng.gen() } else { u64::MAX };
            let shift = |k: usize| match endianness {
                Endianness::Little => k * 8,
                Endianness::Big => (size - 1 - k) * 8,
            };
            match size {
                1 => sp.write(address, data as u8, mask as u8),
                2 => sp.write(address, data as u16, mask as u16),
                4 => sp.write(address, data as u32, mask as u32),
                _ => sp.write(address, data, mask),
            }
            for k in 0..size {
                let cell = &mut model[(address as usize + k) & 0x3ff];
                let bits = (mask >> shift(k)) as u8;
                *cell = (*cell & !bits) | ((data >> shift(k)) as u8 & bits);
            }
            let target = rng.gen_range(0..1024u64);
            let expected = (0..size).fold(0u64, |acc, k| {
                acc | u64::from(model[(target as usize + k) & 0x3ff]) << shift(k)
            });
            let value = match size {
                1 => u64::from(sp.read_byte(target)),
                2 => u64::from(sp.read_word(target)),
                4 => u64::from(sp.read_dword(target)),
                _ => sp.read_qword(target),
            };
            assert_eq!(value, expected, "{:?} {}-bit bus: {} bytes at {:#x}", endianness, data_width, size, target);
        }
        assert_eq!(ram.to_vec(), model);
    }
}

#[test]
fn memory_bank_swap_is_atomic() {
    let sp = Rc::new(space(Endianness::Little, 32, 16));
    let a = MemoryShare::filled("a", 0x1000, 0x11);
    let b = MemoryShare::filled("b", 0x1000, 0x22);
    let bank = MemoryBank::new("bank");
    bank.configure_entry(0, &a, 0);
    bank.configure_entry(1, &b, 0);
    bank.set_entry(0).unwrap();
    sp.install_read_bank(0x1000, 0x1fff, 0, &bank).unwrap();
    let switch = bank.clone();
    sp.install_read_handler::<u32, _>(0x0ffc, 0x0fff, 0, move |_, _| {
        switch.set_entry(1).unwrap();
        0
    }).unwrap();

    assert_eq!(sp.read_dword(0x1000), 0x1111_1111);
    bank.set_entry(1).unwrap();
    assert_eq!(sp.read_dword(0x1000), 0x2222_2222);
    bank.set_entry(0).unwrap();
    assert_eq!(sp.read_dword(0x1000), 0x1111_1111);
    // the first native unit swaps the bank, the second one sees the new target as a whole
    assert_eq!(sp.read_qword(0x0ffc), 0x2222_2222_0000_0000);
    assert_eq!(bank.entry(), Some(1));
    bank.set_entry(0).unwrap();
    // a unit without requested lanes is not accessed at all
    assert_eq!(sp.read::<u64>(0x0ffe, 0xffff_ffff_ffff_0000), 0x1111_1111_1111_0000);
    assert_eq!(bank.entry(), Some(0));
}

fn max_steps(ranges: u64) -> u32 {
    let sp = space(Endianness::Little, 8, 32);
    let mut map = AddressMap::new();
    for n in 0..ranges {
        map.range(n * 0x100, n * 0x100 + 0x7f).nop();
    }
    sp.install_map(&map).unwrap();
    assert_eq!(sp.read_entry_count() as u64, ranges * 2);
    (0..ranges * 0x100).step_by(0x41).map(|addr| sp.read_lookup_steps(addr)).max().unwrap_or(0)
}

#[test]
fn memory_lookup_is_logarithmic() {
    let small = max_steps(16);
    let large = max_steps(4096);
    assert!(small <= 6, "{} steps", small);
    assert!(large <= 14, "{} steps", large);
    // 256 times more ranges, only a few more steps
    assert!(large <= small + 8, "{} vs {} steps", large, small);
}

#[test]
fn memory_tap_sees_and_passes_accesses() {
    let sp = space(Endianness::Little, 16, 16);
    let ram = MemoryShare::new("ram", 0x1000);
    sp.install_ram(0x8000, 0x8fff, 0, &ram, 0).unwrap();
    let entries = (sp.read_entry_count(), sp.write_entry_count());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let (reads, writes) = (Rc::clone(&seen), Rc::clone(&seen));
    let handle: TapHandle = sp.install_readwrite_tap(0x8000, 0x80ff, 0,
        move |address, data: &mut u64, mask| reads.borrow_mut().push(('r', address, *data, mask)),
        move |address, data: &mut u64, mask| writes.borrow_mut().push(('w', address, *data, mask))
    ).unwrap();
    assert_eq!(sp.read_handler_kind(0x8000), HandlerKind::Tap);
    assert_eq!(sp.write_handler_kind(0x80ff), HandlerKind::Tap);
    assert_eq!(sp.read_handler_kind(0x8100), HandlerKind::Memory);

    sp.write_word(0x8010, 0x1234);
    sp.write_byte(0x8013, 0x56);
    assert_eq!(sp.read_word(0x8010), 0x1234);
    assert_eq!(ram.read_byte(0x13), 0x56);
    // taps see native units with their lane masks
    assert_eq!(*seen.borrow(), vec![
        ('w', 0x8010, 0x1234, 0xffff),
        ('w', 0x8012, 0x5600, 0xff00),
        ('r', 0x8010, 0x1234, 0xffff)]);
    sp.write_word(0x8100, 0x9999);
    assert_eq!(seen.borrow().len(), 3);

    assert!(handle.remove(&sp));
    assert_eq!(sp.read_handler_kind(0x8000), HandlerKind::Memory);
    assert_eq!(sp.write_handler_kind(0x8000), HandlerKind::Memory);
    assert_eq!((sp.read_entry_count(), sp.write_entry_count()), entries);
    assert_eq!(sp.read_word(0x8010), 0x1234);
    assert_eq!(seen.borrow().len(), 3);
}

#[test]
fn memory_tap_modifies_data() {
    let sp = space(Endianness::Little, 8, 16);
    let ram = MemoryShare::new("ram", 0x100);
    sp.install_ram(0x0000, 0x00ff, 0, &ram, 0).unwrap();
    let read_tap = sp.install_read_tap(0x0000, 0x00ff, 0, |_, data: &mut u64, _| *data |= 0x80).unwrap();
    let write_tap = sp.install_write_tap(0x0040, 0x007f, 0, |_, data: &mut u64, _| *data &= 0x0f).unwrap();
    sp.write_byte(0x0041, 0x3c);
    sp.write_byte(0x0081, 0x3c);
    assert_eq!(ram.read_byte(0x41), 0x0c);
    assert_eq!(ram.read_byte(0x81), 0x3c);
    assert_eq!(sp.read_byte(0x0041), 0x8c);
    assert!(read_tap.remove(&sp));
    assert_eq!(sp.read_byte(0x0041), 0x0c);
    assert!(write_tap.remove(&sp));
    sp.write_byte(0x0041, 0x3c);
    assert_eq!(sp.read_byte(0x0041), 0x3c);
}

#[test]
fn memory_tap_over_split_range_keeps_origins() {
    let sp = space(Endianness::Little, 8, 16);
    sp.install_read_handler::<u8, _>(0x1000, 0x1fff, 0, |offset, _| (offset >> 8) as u8).unwrap();
    let rom = MemoryShare::filled("rom", 0x100, 0xaa);
    sp.install_rom(0x1800, 0x18ff, 0, &rom, 0).unwrap();
    assert_eq!(sp.read_entry_count(), 5);
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let handle = sp.install_read_tap(0x1700, 0x19ff, 0, move |_, _: &mut u64, _| counter.set(counter.get() + 1)).unwrap();
    assert_eq!(sp.read_entry_count(), 7);
    // both pieces of the callback still count offsets from 0x1000
    assert_eq!(sp.read_byte(0x1705), 7);
    assert_eq!(sp.read_byte(0x1805), 0xaa);
    assert_eq!(sp.read_byte(0x1905), 9);
    assert_eq!(sp.read_byte(0x1a05), 10);
    assert_eq!(calls.get(), 3);
    assert!(handle.remove(&sp));
    assert_eq!(sp.read_entry_count(), 5);
    assert_eq!(sp.read_handler_kind(0x1700), HandlerKind::Delegate(8));
    assert_eq!(sp.read_handler_kind(0x1800), HandlerKind::Memory);
    assert_eq!(sp.read_byte(0x1705), 7);
    assert_eq!(sp.read_byte(0x1905), 9);
    assert_eq!(calls.get(), 3);
}

#[test]
fn memory_tap_stacking_and_mirrors() {
    let sp = space(Endianness::Little, 8, 16);
    let ram = MemoryShare::filled("ram", 0x100, 1);
    sp.install_ram(0x0000, 0x00ff, 0x0300, &ram, 0).unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let (lower, upper) = (Rc::clone(&order), Rc::clone(&order));
    let first = sp.install_read_tap(0x0000, 0x00ff, 0x0100, move |address, _: &mut u64, _| {
        lower.borrow_mut().push((1, address))
    }).unwrap();
    let second = sp.install_read_tap(0x0080, 0x01ff, 0, move |address, _: &mut u64, _| {
        upper.borrow_mut().push((2, address))
    }).unwrap();
    sp.read_byte(0x0190);
    sp.read_byte(0x0290);
    sp.read_byte(0x0010);
    assert_eq!(*order.borrow(), vec![(1, 0x0190), (2, 0x0190), (1, 0x0010)]);
    order.borrow_mut().clear();

    // the upper tap survives the removal of the one below it
    assert!(first.remove(&sp));
    sp.read_byte(0x0190);
    sp.read_byte(0x0010);
    assert_eq!(*order.borrow(), vec![(2, 0x0190)]);
    // a tap replaced by another install has nothing left to remove
    sp.install_ram(0x0000, 0x01ff, 0, &MemoryShare::new("other", 0x200), 0).unwrap();
    assert!(!second.remove(&sp));
    assert_eq!(sp.read_handler_kind(0x0190), HandlerKind::Memory);
    assert!(sp.install_read_tap(0x0001, 0x0000, 0, |_, _: &mut u64, _| {}).is_err());
}
