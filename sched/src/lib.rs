//! # Scheduler & Thread-Blocker System
//!
//! A cooperative, multi-worker scheduler that multiplexes guest threads
//! over a small pool of host workers, blocks threads on typed wait
//! conditions, and wakes them when their predicates become true or their
//! deadlines expire.

#![warn(missing_docs)]

mod blocker;
mod fs_timer;
mod scheduler;
mod thread;

pub use blocker::{apply_wake, Blocker, BlockerRegistry, WakeResult};
pub use fs_timer::{read_timespec, FakeTimeSource, FsPoll, HostFsPoll, HostTimeSource, PollEvents, TimeSource};
pub use scheduler::{
    DefaultProcessTable, GuestExecutor, ProcessTable, SchedError, SchedulerCore, SchedulerHandle,
    StepOutcome, ATOMIC_SLICE_TICKS, DEFAULT_SLICE_TICKS,
};
pub use thread::{allocate_tid, CpuState, Thread, ThreadIndex, ThreadState, RAX};
