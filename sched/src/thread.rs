//! Per-thread scheduling state: saved CPU registers, call stack, tick
//! accounting, and the profiling event log consumed by the profile writer.

use emu_addr::GuestAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stable index of a [`Thread`] within the scheduler's thread arena. Threads
/// are never removed from the arena (only marked [`ThreadState::Dead`]), so
/// a `ThreadIndex` a [`crate::blocker::Blocker`] captured at registration
/// time stays valid for the scheduler's whole lifetime.
pub type ThreadIndex = usize;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next thread id for a process (monotonically increasing,
/// never reused within a run).
pub fn allocate_tid() -> u32 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a thread, driven exclusively by the scheduler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Ready to run, waiting for a worker.
    Runnable,
    /// Currently executing on a worker.
    Running,
    /// Waiting on a [`crate::blocker::Blocker`].
    Blocked,
    /// Terminated; retained for profiling and `wait4` until reaped.
    Dead,
}

/// The guest's saved integer/vector/x87 register file, installed and read
/// out only at context-switch boundaries by the scheduler; the running
/// worker mutates it directly through a borrowed reference during a slice.
#[derive(Debug, Clone)]
pub struct CpuState {
    /// General-purpose registers, indexed by the interpreter's own register
    /// numbering (RAX..R15).
    pub regs: [u64; 16],
    /// RFLAGS.
    pub flags: u64,
    /// XMM0..XMM15, 16 bytes each.
    pub xmm: [[u8; 16]; 16],
    /// The x87 register stack, ST(0)..ST(7), 10 bytes each (80-bit extended).
    pub x87: [[u8; 10]; 8],
    /// MXCSR.
    pub mxcsr: u32,
    /// FS segment base, used for thread-local storage.
    pub fs_base: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            regs: [0; 16],
            flags: 0,
            xmm: [[0; 16]; 16],
            x87: [[0; 10]; 8],
            mxcsr: 0x1F80,
            fs_base: 0,
        }
    }
}

/// RAX by convention in this interpreter's register numbering.
pub const RAX: usize = 0;

/// A call event: tick count and callee address, recorded on every `call`.
pub type CallEvent = (u64, u64);
/// A syscall event: tick count and syscall number.
pub type SyscallEvent = (u64, u64);

/// A single guest thread.
#[derive(Debug, Clone)]
pub struct Thread {
    pid: i32,
    tid: u32,
    state: ThreadState,
    cpu: CpuState,
    call_stack: Vec<GuestAddr>,
    tick_count: u64,
    ticks_until_switch: u64,
    exit_status: Option<i32>,
    clear_child_tid: Option<GuestAddr>,
    profiling: bool,
    call_events: Vec<CallEvent>,
    ret_events: Vec<u64>,
    syscall_events: Vec<SyscallEvent>,
}

impl Thread {
    /// Construct a new thread in the `Runnable` state.
    pub fn new(pid: i32, tid: u32, profiling: bool) -> Self {
        Self {
            pid,
            tid,
            state: ThreadState::Runnable,
            cpu: CpuState::default(),
            call_stack: Vec::new(),
            tick_count: 0,
            ticks_until_switch: 0,
            exit_status: None,
            clear_child_tid: None,
            profiling,
            call_events: Vec::new(),
            ret_events: Vec::new(),
            syscall_events: Vec::new(),
        }
    }

    /// Process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Thread id.
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Force a state transition. Only the scheduler core should call this.
    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Borrow the saved CPU state.
    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    /// Mutably borrow the saved CPU state (the running worker's register
    /// image during a slice).
    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    /// Push a return address onto the call stack and, if profiling, record
    /// a call event at the current tick.
    pub fn push_call(&mut self, return_address: GuestAddr, callee: GuestAddr) {
        self.call_stack.push(return_address);
        if self.profiling {
            self.call_events.push((self.tick_count, callee.as_u64()));
        }
    }

    /// Pop a return address off the call stack, if any, recording a ret
    /// event if profiling.
    pub fn pop_return(&mut self) -> Option<GuestAddr> {
        let addr = self.call_stack.pop();
        if addr.is_some() && self.profiling {
            self.ret_events.push(self.tick_count);
        }
        addr
    }

    /// Current call stack, deepest frame last.
    pub fn call_stack(&self) -> &[GuestAddr] {
        &self.call_stack
    }

    /// Record a syscall event if profiling is enabled.
    pub fn record_syscall(&mut self, number: u64) {
        if self.profiling {
            self.syscall_events.push((self.tick_count, number));
        }
    }

    /// Advance the tick counter by `n` and decrement the remaining slice
    /// budget, saturating at zero.
    pub fn tick(&mut self, n: u64) {
        self.tick_count += n;
        self.ticks_until_switch = self.ticks_until_switch.saturating_sub(n);
    }

    /// Total ticks retired since creation.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Ticks remaining before this thread must yield back to the scheduler.
    pub fn ticks_remaining(&self) -> u64 {
        self.ticks_until_switch
    }

    /// Grant a fresh slice of `ticks`.
    pub fn grant_slice(&mut self, ticks: u64) {
        self.ticks_until_switch = ticks;
    }

    /// Mark the thread dead with the given exit status.
    pub fn terminate(&mut self, status: i32) {
        self.state = ThreadState::Dead;
        self.exit_status = Some(status);
    }

    /// Exit status, once terminated.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// The address to zero and futex-wake on thread exit (`set_tid_address`).
    pub fn clear_child_tid(&self) -> Option<GuestAddr> {
        self.clear_child_tid
    }

    /// Set the clear-child-tid address.
    pub fn set_clear_child_tid(&mut self, addr: Option<GuestAddr>) {
        self.clear_child_tid = addr;
    }

    /// Call events recorded so far, `(tick, callee_address)`.
    pub fn call_events(&self) -> &[CallEvent] {
        &self.call_events
    }

    /// Ret events recorded so far (tick only).
    pub fn ret_events(&self) -> &[u64] {
        &self.ret_events
    }

    /// Syscall events recorded so far, `(tick, syscall_number)`.
    pub fn syscall_events(&self) -> &[SyscallEvent] {
        &self.syscall_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_and_ret_are_symmetric() {
        let mut t = Thread::new(1, allocate_tid(), true);
        t.push_call(GuestAddr::new(0x1005), GuestAddr::new(0x2000));
        assert_eq!(t.call_stack(), &[GuestAddr::new(0x1005)]);
        assert_eq!(t.pop_return(), Some(GuestAddr::new(0x1005)));
        assert_eq!(t.call_events(), &[(0, 0x2000)]);
        assert_eq!(t.ret_events(), &[0]);
    }

    #[test]
    fn slice_accounting_saturates() {
        let mut t = Thread::new(1, allocate_tid(), false);
        t.grant_slice(10);
        t.tick(15);
        assert_eq!(t.ticks_remaining(), 0);
        assert_eq!(t.tick_count(), 15);
    }
}
