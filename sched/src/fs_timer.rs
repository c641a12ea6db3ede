//! Trait seams to the (out-of-scope) virtual filesystem and timer
//! subsystems, plus real host-backed default implementations so blocker
//! predicates are genuinely exercisable in tests.

use emu_addr::PreciseTime;
use emu_vmm::{Vmm, VmmError};
use std::time::Instant;

bitflags::bitflags! {
    /// Readiness bits reported by [`FsPoll`], matching `poll(2)`'s subset
    /// this scheduler cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        /// Readable without blocking.
        const READABLE = 1 << 0;
        /// Writable without blocking.
        const WRITABLE = 1 << 1;
        /// An error condition is pending.
        const ERROR = 1 << 2;
    }
}

/// Non-blocking readiness queries the Blocker Registry issues against the
/// (externally owned) virtual filesystem.
pub trait FsPoll: Send + Sync {
    /// Poll `fd` for the subset of `interested` that is ready right now.
    fn poll(&self, fd: i32, interested: PollEvents) -> PollEvents;

    /// Whether `fd` has data available to read.
    fn can_read(&self, fd: i32) -> bool {
        self.poll(fd, PollEvents::READABLE).contains(PollEvents::READABLE)
    }

    /// Whether `fd` can accept a write without blocking.
    fn can_write(&self, fd: i32) -> bool {
        self.poll(fd, PollEvents::WRITABLE).contains(PollEvents::WRITABLE)
    }
}

/// Monotonic clock the Blocker Registry compares sleep/timeout deadlines
/// against.
pub trait TimeSource: Send + Sync {
    /// Current time, as seen by this clock.
    fn now(&self) -> PreciseTime;
}

/// An [`FsPoll`] backed by real host file descriptors via `nix::poll`.
#[derive(Debug, Default)]
pub struct HostFsPoll;

impl FsPoll for HostFsPoll {
    fn poll(&self, fd: i32, interested: PollEvents) -> PollEvents {
        use nix::poll::{PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;

        let mut flags = PollFlags::empty();
        if interested.contains(PollEvents::READABLE) {
            flags |= PollFlags::POLLIN;
        }
        if interested.contains(PollEvents::WRITABLE) {
            flags |= PollFlags::POLLOUT;
        }

        // SAFETY: the fd is only borrowed for the duration of this poll
        // call and is never closed through this borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, flags)];
        let ready = nix::poll::poll(&mut fds, PollTimeout::ZERO).unwrap_or(0);
        if ready == 0 {
            return PollEvents::empty();
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let mut out = PollEvents::empty();
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            out |= PollEvents::READABLE;
        }
        if revents.contains(PollFlags::POLLOUT) {
            out |= PollEvents::WRITABLE;
        }
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            out |= PollEvents::ERROR;
        }
        out
    }
}

/// A [`TimeSource`] backed by `std::time::Instant`, anchored at
/// construction so `PreciseTime::ZERO` means "when this scheduler started".
#[derive(Debug)]
pub struct HostTimeSource {
    epoch: Instant,
}

impl Default for HostTimeSource {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl TimeSource for HostTimeSource {
    fn now(&self) -> PreciseTime {
        let elapsed = self.epoch.elapsed();
        PreciseTime::new(elapsed.as_secs(), elapsed.subsec_nanos())
    }
}

/// A fake [`TimeSource`] a test can advance deterministically.
#[derive(Debug, Default)]
pub struct FakeTimeSource {
    now: std::sync::Mutex<PreciseTime>,
}

impl FakeTimeSource {
    /// A clock starting at `PreciseTime::ZERO`.
    pub fn new() -> Self {
        Self { now: std::sync::Mutex::new(PreciseTime::ZERO) }
    }

    /// Jump the clock forward to `t` (must not go backwards).
    pub fn advance_to(&self, t: PreciseTime) {
        *self.now.lock().unwrap() = t;
    }
}

impl TimeSource for FakeTimeSource {
    fn now(&self) -> PreciseTime {
        *self.now.lock().unwrap()
    }
}

/// Read a Linux `struct timespec` (two little-endian `u64`s: seconds, then
/// nanoseconds truncated to 32 bits of range but stored as 8 bytes per the
/// x86-64 ABI) out of guest memory at `addr`.
pub fn read_timespec(vmm: &Vmm, addr: emu_addr::GuestAddr) -> Result<PreciseTime, VmmError> {
    let secs = u64::from_le_bytes(vmm.read_sized(addr, 8)?.try_into().unwrap());
    let nanos = u64::from_le_bytes(vmm.read_sized(addr.saturating_add(8), 8)?.try_into().unwrap());
    Ok(PreciseTime::new(secs, nanos as u32))
}
