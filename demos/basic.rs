//! This example shows basic usage of a TCP-based `gb-gdbstub`.
//!
//! Run it, then attach with something like:
//!
//! ```text
//! gdb -ex 'target remote localhost:55555'
//! ```

extern crate env_logger;
extern crate gb_gdbstub;

use gb_gdbstub::{Cpu, Debugger, GdbStub};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A toy target: 64 KiB of memory executed as one no-op per address.
struct ToyCpu {
    a: u8,
    b: u8,
    c: u8,
    d: u8,
    e: u8,
    h: u8,
    l: u8,
    sp: u16,
    pc: u16,
    mem: Vec<u8>,
}

impl ToyCpu {
    fn new() -> Self {
        ToyCpu {
            a: 0x01,
            b: 0x00,
            c: 0x13,
            d: 0x00,
            e: 0xd8,
            h: 0x01,
            l: 0x4d,
            sp: 0xfffe,
            pc: 0x0100,
            mem: vec![0; 0x10000],
        }
    }

    /// "Executes" the instruction at the current PC.
    fn step(&mut self) {
        self.pc = self.pc.wrapping_add(1);
    }
}

impl Cpu for ToyCpu {
    fn a(&self) -> u8 {
        self.a
    }
    fn b(&self) -> u8 {
        self.b
    }
    fn c(&self) -> u8 {
        self.c
    }
    fn d(&self) -> u8 {
        self.d
    }
    fn e(&self) -> u8 {
        self.e
    }
    fn h(&self) -> u8 {
        self.h
    }
    fn l(&self) -> u8 {
        self.l
    }
    fn sp(&self) -> u16 {
        self.sp
    }
    fn pc(&self) -> u16 {
        self.pc
    }
    fn read_mem(&self, addr: u16) -> u8 {
        self.mem[addr as usize]
    }
    fn write_mem(&mut self, addr: u16, value: u8) {
        self.mem[addr as usize] = value;
    }
}

fn main() {
    env_logger::init();

    let debugger = Arc::new(Debugger::new(ToyCpu::new()));

    let stub = GdbStub::new(debugger.clone());
    stub.spawn().expect("failed to spawn the gdb stub thread");

    println!("Emulating; attach gdb on port 55555.");

    // The emulator loop: check for breakpoints at every instruction
    // boundary and park while the debugger holds us.
    loop {
        let pc = debugger.cpu().pc();
        debugger.check_breakpoints(u32::from(pc));
        debugger.wait_while_halted();

        debugger.cpu().step();
        thread::sleep(Duration::from_millis(1));
    }
}
