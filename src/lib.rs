/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    emucore is free software: you can redistribute it and/or modify it under
    the terms of the GNU Lesser General Public License (LGPL) as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    emucore is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
/*! # Emucore

`emucore` crate provides the substrate for multi-device emulators: the time base, the scheduler,
the address space dispatch and the device composition model. It doesn't emulate any particular chip.

```text
                     ______________
                    |              |
   MachineConfig -->|   Machine    |----> save_state / nvram_save
                    |______________|
                      |          |
            __________|__        |_______________________
           |             |       |                       |
           |  Scheduler  |       |  Devices (by tag)     |
           |_____________|       |_______________________|
             |        |            |          |
          timers    units  <-- ExecuteUnit  MemoryInterface --> AddressSpace
                                                                 |  |  |  |
                                                   memory  bank  delegate  nested space
```

The building blocks:

* [time] - [Duration] and [Instant] with 2^-64 s resolution, converting exactly to and from clock ticks.
* [scheduler] - [Scheduler]: timers firing in time order, execution units run in timeslices bounded
  by the next timer and the interleave quantum.
* [memory] - [AddressSpace]: memory, banks, callbacks and nested spaces installed over address
  ranges, with width adaptation and byte lane masks. Taps observe accesses to a range.
* [device] - the [Device] trait with capability queries and references to other devices.
* [machine] - [MachineConfig] and [Machine]: device clocks, dependency ordered start and reset.
* [save] - save state registration.

## Example

```
use std::{cell::RefCell, rc::Rc};
use emucore::*;
use emucore::device::{InterfaceSet, MemoryInterface, MemorySpaces};
use emucore::memory::{Endianness, SpaceConfig, SpaceNum};
use emucore::scheduler::ExecuteUnit;

// Sums bytes of its program space, a byte per cycle.
struct Summer {
    spaces: MemorySpaces,
    pc: u64,
    sum: u64,
}

impl ExecuteUnit for Summer {
    fn execute(&mut self, cycles: u64, _: &mut Scheduler) -> u64 {
        let program = self.spaces.space(SpaceNum::Program);
        for _ in 0..cycles {
            self.sum += u64::from(program.read_byte(self.pc));
            self.pc = (self.pc + 1) & 0xff;
        }
        cycles
    }
}

impl MemoryInterface for Summer {
    fn memory_space(&self, num: SpaceNum) -> Option<Rc<AddressSpace>> {
        self.spaces.memory_space(num)
    }
}

impl Device for Summer {
    fn register_interfaces(this: &Rc<RefCell<Self>>, set: &mut InterfaceSet) {
        set.add::<dyn ExecuteUnit>(this.clone());
        set.add::<dyn MemoryInterface>(this.clone());
    }
}

let mut spaces = MemorySpaces::new();
spaces.add(SpaceNum::Program,
           SpaceConfig::new("program", Endianness::Little, 8, 8).with_unmap_value(0)).unwrap();
let mut config = MachineConfig::new("summer");
config.add_device(":", "cpu", 1_000, Summer { spaces, pc: 0, sum: 0 }).unwrap();
let rom = MemoryShare::from_slice("rom", &[1;16]);
config.set_address_map(":cpu", SpaceNum::Program, move |map, _| {
    map.range(0x00, 0x0f).rom(&rom);
    Ok(())
});
let mut machine = config.build().unwrap();
machine.run_for(Duration::from_millis(100)).unwrap();
let cpu = machine.device::<Summer>(":cpu").unwrap();
assert_eq!(cpu.borrow().pc, 100);
assert_eq!(cpu.borrow().sum, 16);
```
*/
pub mod device;
pub mod error;
pub mod machine;
pub mod memory;
pub mod save;
pub mod scheduler;
pub mod time;

pub use device::Device;
pub use error::{ConfigError, EmuError, SchedulerError, StateError};
pub use machine::{Machine, MachineConfig, MachineOptions};
pub use memory::{AddressMap, AddressSpace, MemoryBank, MemoryShare};
pub use scheduler::Scheduler;
pub use time::{Duration, Instant};
