//! Debugger control block: the state shared between the emulator thread
//! and the protocol thread.
//!
//! The emulator calls `check_breakpoints` with the current program
//! counter before dispatching each instruction, then `wait_while_halted`.
//! When a breakpoint fires (or a step range is left) the emulator parks
//! itself on the halt condition until the stub resumes it.

use buffer::Buffer;
use hex;
use stop::StopReason;
use targets::{Cpu, REGISTERS};

use std::cmp;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Top of the emulated address space; the bus is 64 KiB.
const MEM_LAST: u64 = 0xffff;

/// A code breakpoint.
///
/// `uses` of -1 makes the breakpoint sticky. A positive count fires that
/// many times, the entry is dropped on the last hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u32,
    pub uses: i64,
    pub enabled: bool,
}

impl Breakpoint {
    /// A sticky breakpoint at `address`.
    pub fn new(address: u32) -> Self {
        Breakpoint::with_uses(address, -1)
    }

    pub fn with_uses(address: u32, uses: i64) -> Self {
        Breakpoint {
            address,
            uses,
            enabled: true,
        }
    }
}

/// Everything guarded by the halt mutex.
struct State {
    breakpoints: HashMap<u32, Vec<Breakpoint>>,
    /// Inclusive PC range for a ranged step, `(-1, -1)` when unset.
    step_range: (i64, i64),
    is_halted: bool,
    stop_reason: Option<StopReason>,
}

type HaltHook = Box<dyn Fn(&StopReason) + Send + Sync>;

/// Single per-emulator debugger instance.
///
/// Owns the CPU behind a mutex. The emulator steps it through `cpu()`;
/// the protocol thread only touches CPU state while the emulator is
/// parked on the halt condition, so the lock is uncontended in practice.
pub struct Debugger<C: Cpu> {
    cpu: Mutex<C>,
    state: Mutex<State>,
    halt_cond: Condvar,
    halt_hook: Mutex<Option<HaltHook>>,
}

impl<C: Cpu> Debugger<C> {
    pub fn new(cpu: C) -> Self {
        Debugger {
            cpu: Mutex::new(cpu),
            state: Mutex::new(State {
                breakpoints: HashMap::new(),
                step_range: (-1, -1),
                is_halted: false,
                stop_reason: None,
            }),
            halt_cond: Condvar::new(),
            halt_hook: Mutex::new(None),
        }
    }

    /// Locks and returns the emulated CPU.
    ///
    /// The emulator must drop the guard before calling
    /// `wait_while_halted`, otherwise the stub cannot inspect CPU state
    /// while the emulator is parked.
    pub fn cpu(&self) -> MutexGuard<C> {
        self.cpu.lock().unwrap()
    }

    pub fn add_breakpoint(&self, bp: Breakpoint) {
        debug!("adding breakpoint at {:#06x} (uses {})", bp.address, bp.uses);
        let mut state = self.state.lock().unwrap();
        state
            .breakpoints
            .entry(bp.address)
            .or_insert_with(Vec::new)
            .push(bp);
    }

    /// Removes one specific entry from the list at its address.
    pub fn remove_breakpoint(&self, bp: &Breakpoint) {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.breakpoints.get_mut(&bp.address) {
            if let Some(pos) = list.iter().position(|other| other == bp) {
                list.remove(pos);
            }
        }
    }

    /// Removes every breakpoint at `address`.
    pub fn remove_breakpoints(&self, address: u32) {
        debug!("clearing breakpoints at {:#06x}", address);
        let mut state = self.state.lock().unwrap();
        state.breakpoints.remove(&address);
    }

    /// Arms a ranged step: execution halts at the first PC outside
    /// `lo..=hi`. `(-1, -1)` disarms.
    pub fn set_step_range(&self, lo: i64, hi: i64) {
        let mut state = self.state.lock().unwrap();
        state.step_range = (lo, hi);
    }

    /// Called by the emulator before each instruction at PC `address`.
    ///
    /// Fires enabled breakpoints at the address (counting down one-shot
    /// entries), checks the step range, and halts with the breakpoint
    /// stop reason if anything hit.
    pub fn check_breakpoints(&self, address: u32) {
        let mut should_halt = false;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(list) = state.breakpoints.get_mut(&address) {
                let mut expired = false;
                for bp in list.iter_mut() {
                    if !bp.enabled {
                        continue;
                    }
                    should_halt = true;
                    if bp.uses > 1 {
                        bp.uses -= 1;
                    } else if bp.uses == 1 {
                        // Last permitted hit; drop the entry below.
                        bp.uses = 0;
                        expired = true;
                    }
                }
                if expired {
                    list.retain(|bp| bp.uses != 0);
                }
            }

            let (lo, hi) = state.step_range;
            if lo != -1 {
                let address = i64::from(address);
                if address < lo || address > hi {
                    should_halt = true;
                    state.step_range = (-1, -1);
                }
            }
        }

        if should_halt {
            self.halt(StopReason::breakpoint());
        }
    }

    /// Stops execution: the next `wait_while_halted` call blocks until
    /// `unhalt`. Reports `reason` to an attached client.
    pub fn halt(&self, reason: StopReason) {
        debug!("halting: {:?}", reason);
        {
            let mut state = self.state.lock().unwrap();
            state.is_halted = true;
            state.stop_reason = Some(reason.clone());
        }
        if let Some(hook) = self.halt_hook.lock().unwrap().as_ref() {
            hook(&reason);
        }
    }

    /// Clears the stop reason and releases the emulator thread.
    pub fn unhalt(&self) {
        debug!("resuming execution");
        let mut state = self.state.lock().unwrap();
        state.is_halted = false;
        state.stop_reason = None;
        self.halt_cond.notify_all();
    }

    /// Parks the calling (emulator) thread until the debugger resumes it.
    pub fn wait_while_halted(&self) {
        let mut state = self.state.lock().unwrap();
        while state.is_halted {
            state = self.halt_cond.wait(state).unwrap();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap().is_halted
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.lock().unwrap().stop_reason.clone()
    }

    /// Installs the callback that pushes stop replies to the connected
    /// client. Invoked on the thread that triggered the halt.
    pub fn set_halt_hook(&self, hook: HaltHook) {
        *self.halt_hook.lock().unwrap() = Some(hook);
    }

    pub fn clear_halt_hook(&self) {
        *self.halt_hook.lock().unwrap() = None;
    }

    /// Encodes all registers in table order, little-endian per register.
    pub fn encode_registers(&self, out: &mut Buffer) {
        let cpu = self.cpu.lock().unwrap();
        for layout in REGISTERS.iter() {
            let value = (layout.read)(&*cpu);
            hex::encode_uint(value, layout.bits / 8, out, true);
        }
    }

    /// Encodes `len` bytes of memory starting at `address` as hex.
    ///
    /// Bytes past the end of the 64 KiB bus are skipped, truncating the
    /// reply; so is anything that doesn't fit a bounded output buffer.
    pub fn encode_memory(&self, out: &mut Buffer, address: u64, len: u64) {
        if address > MEM_LAST {
            return;
        }
        let end = cmp::min(address.saturating_add(len), MEM_LAST + 1);
        let cpu = self.cpu.lock().unwrap();
        for addr in address..end {
            let byte = cpu.read_mem(addr as u16);
            let pair = [hex::encode_nybble(byte >> 4), hex::encode_nybble(byte)];
            if !out.write(&pair) {
                break;
            }
        }
    }

    /// Decodes the hex payload of `packet` and writes `len` bytes to
    /// memory at `address`. Missing payload bytes are written as zero;
    /// bytes past the end of the bus are dropped.
    pub fn write_memory(&self, address: u64, len: u64, packet: &mut Buffer) {
        if address > MEM_LAST {
            return;
        }
        let bytes = hex::decode_bytes(packet);
        let mut cpu = self.cpu.lock().unwrap();
        for offset in 0..len {
            let addr = address + offset;
            if addr > MEM_LAST {
                break;
            }
            let byte = bytes.get(offset as usize).cloned().unwrap_or(0);
            cpu.write_mem(addr as u16, byte);
        }
    }
}
