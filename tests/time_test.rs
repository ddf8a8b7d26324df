/*
    time_test: Test program for the emucore library.
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
//! Time base properties.
use rand::prelude::*;
use emucore::{Duration, Instant};

#[test]
fn time_ticks_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x1234_5678);
    let mut freqs: Vec<u32> = vec![1, 2, 3, 7, 60, 44_100, 1_000_000, 3_579_545, u32::MAX - 1, u32::MAX];
    freqs.extend((0..200).map(|_| rng.gen_range(1..=u32::MAX)));
    for hz in freqs {
        let mut ticks: Vec<u64> = vec![0, 1, u64::from(hz) - 1, u64::from(hz), u64::from(u32::MAX)];
        ticks.extend((0..200).map(|_| rng.gen_range(0..=u64::from(u32::MAX))));
        for t in ticks {
            let duration = Duration::from_ticks(t, hz);
            assert!(!duration.is_never(), "{} ticks at {} Hz", t, hz);
            assert_eq!(duration.as_ticks(hz), t, "{} ticks at {} Hz", t, hz);
        }
    }
}

#[test]
fn time_ticks_never_overshoot() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..1000 {
        let hz = rng.gen_range(1..=u32::MAX);
        let duration = Duration::from_raw(rng.gen_range(0..1000), rng.gen());
        let ticks = duration.as_ticks(hz);
        assert!(Duration::from_ticks(ticks, hz) <= duration);
        assert!(Duration::from_ticks(ticks + 1, hz) > duration);
    }
}

#[test]
fn time_instants_are_ordered() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut now = Instant::ZERO;
    for _ in 0..1000 {
        let step = Duration::from_ticks(rng.gen_range(0..1_000_000), rng.gen_range(1..=100_000_000));
        let next = now + step;
        assert!(next >= now);
        assert_eq!(next - now, step);
        assert_eq!(next.duration_since(now), step);
        now = next;
    }
    assert!(now < Instant::NEVER);
    assert!(Instant::NEVER.is_never());
}
