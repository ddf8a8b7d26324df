// To see the estimated access rate run with:
//
// cargo +nightly bench --bench dispatch -- --nocapture
#![feature(test)]
extern crate test;
use test::{black_box, Bencher, stats::Summary};

use emucore::*;
use emucore::memory::{Endianness, SpaceConfig};
use emucore::scheduler::ExecuteUnit;

const ACCESSES: u64 = 100_000;

fn banked_space(data_width: u32) -> AddressSpace {
    let space = AddressSpace::new(SpaceConfig::new("bench", Endianness::Little, data_width, 16)).unwrap();
    let ram = MemoryShare::new("ram", 0x8000);
    let rom = MemoryShare::filled("rom", 0x4000 * 4, 0x5a);
    let bank = MemoryBank::new("bank");
    bank.configure_entries(0, 4, &rom, 0, 0x4000);
    bank.set_entry(1).unwrap();
    space.install_ram(0x0000, 0x7fff, 0, &ram, 0).unwrap();
    space.install_read_bank(0x8000, 0xbfff, 0, &bank).unwrap();
    space.install_readwrite_handler(0xc000, 0xc0ff, 0x3f00,
        |offset: u64, _mask: u8| offset as u8,
        |_offset: u64, data: u8, _mask: u8| { black_box(data); }).unwrap();
    space
}

fn bench_accesses<F: FnMut(&AddressSpace, u64)>(ben: &mut Bencher, space: &AddressSpace, mut access: F) {
    let Summary { median, .. } = ben.bench(|ben| {
        ben.iter(|| {
            let mut address = 0u64;
            for _ in 0..ACCESSES {
                access(space, address);
                address = address.wrapping_add(0x1235) & 0xfffc;
            }
        });
    }).unwrap();
    let time = median / 1.0e9;
    eprintln!("Median time: {} s accesses/s: {}", time, ACCESSES as f64/time);
}

#[bench]
fn bench_dispatch_native_byte(ben: &mut Bencher) {
    let space = banked_space(8);
    bench_accesses(ben, &space, |space, address| {
        black_box(space.read_byte(address));
        space.write_byte(address & 0x7fff, address as u8);
    });
}

#[bench]
fn bench_dispatch_wide_on_narrow(ben: &mut Bencher) {
    let space = banked_space(8);
    bench_accesses(ben, &space, |space, address| {
        black_box(space.read_dword(address));
    });
}

#[bench]
fn bench_dispatch_narrow_on_wide(ben: &mut Bencher) {
    let space = banked_space(32);
    bench_accesses(ben, &space, |space, address| {
        black_box(space.read_byte(address | 1));
        space.write_word(address & 0x7ffe, address as u16);
    });
}

struct Spinner;

impl ExecuteUnit for Spinner {
    fn execute(&mut self, cycles: u64, _: &mut Scheduler) -> u64 {
        black_box(cycles)
    }
}

#[bench]
fn bench_scheduler_timers(ben: &mut Bencher) {
    use std::{cell::RefCell, rc::Rc};
    let mut sched = Scheduler::default();
    for clock in [3_579_545, 1_789_772, 44_100] {
        let unit = sched.add_unit(format!("unit{}", clock), clock, Rc::new(RefCell::new(Spinner))).unwrap();
        sched.start_unit(unit).unwrap();
    }
    for hz in [60, 15_734, 7_919] {
        let timer = sched.timer_alloc(format!("timer{}", hz), |_, param| { black_box(param); Ok(()) });
        let period = Duration::from_hz(hz);
        sched.timer_adjust(timer, period, hz.into(), period).unwrap();
    }
    ben.iter(|| {
        sched.run_for(Duration::from_millis(10)).unwrap();
    });
}
