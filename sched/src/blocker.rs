//! Typed wait conditions and the registry that evaluates them.

use crate::fs_timer::{FsPoll, PollEvents, TimeSource};
use crate::thread::{ThreadIndex, ThreadState, RAX};
use emu_addr::{GuestAddr, PreciseTime};
use emu_vmm::Vmm;
use std::collections::HashMap;

/// Result carried back into the waking thread's RAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// The predicate was satisfied normally.
    Success(u64),
    /// The blocker's deadline expired first.
    TimedOut,
}

impl WakeResult {
    fn rax_value(self) -> u64 {
        match self {
            WakeResult::Success(v) => v,
            WakeResult::TimedOut => (-(ETIMEDOUT as i64)) as u64,
        }
    }
}

/// `ETIMEDOUT` on Linux x86-64, inlined so this crate doesn't need a direct
/// `libc` dependency for one constant.
const ETIMEDOUT: i32 = 110;

/// A thread parked on a typed wait condition.
pub enum Blocker {
    /// Waiting for the 32-bit word at `addr` to change from `expected`, or
    /// for a matching `futex_wake`.
    Futex { thread: ThreadIndex, addr: GuestAddr, expected: u32, deadline: Option<PreciseTime> },
    /// Waiting for any of `fds` to become ready for its requested events.
    Poll { thread: ThreadIndex, fds: Vec<(i32, PollEvents)>, deadline: Option<PreciseTime> },
    /// Waiting for any fd in `fds` to become ready (select semantics).
    Select { thread: ThreadIndex, fds: Vec<i32>, deadline: Option<PreciseTime> },
    /// Waiting on an epoll instance `epfd`.
    EpollWait { thread: ThreadIndex, epfd: i32, watched: Vec<(i32, PollEvents)>, deadline: Option<PreciseTime> },
    /// Sleeping until `deadline`.
    Sleep { thread: ThreadIndex, deadline: PreciseTime },
    /// Waiting for `child_pid` to become `Dead`.
    Wait4 { thread: ThreadIndex, child_pid: i32 },
    /// Waiting for `fd` to have data available.
    Read { thread: ThreadIndex, fd: i32 },
}

impl Blocker {
    /// The thread this blocker is parking.
    pub fn thread(&self) -> ThreadIndex {
        match self {
            Blocker::Futex { thread, .. }
            | Blocker::Poll { thread, .. }
            | Blocker::Select { thread, .. }
            | Blocker::EpollWait { thread, .. }
            | Blocker::Sleep { thread, .. }
            | Blocker::Wait4 { thread, .. }
            | Blocker::Read { thread, .. } => *thread,
        }
    }

    fn deadline_expired(deadline: Option<PreciseTime>, now: PreciseTime) -> bool {
        deadline.is_some_and(|d| now >= d)
    }

    /// Evaluate this blocker's predicate. Returns `Some(result)` once it can
    /// unblock.
    fn evaluate(
        &self,
        vmm: &Vmm,
        fs: &dyn FsPoll,
        now: PreciseTime,
        wake_targets: &HashMap<(GuestAddr, u32), usize>,
    ) -> Option<WakeResult> {
        match self {
            Blocker::Futex { addr, expected, deadline, .. } => {
                if Self::deadline_expired(*deadline, now) {
                    return Some(WakeResult::TimedOut);
                }
                let current =
                    vmm.read_sized(*addr, 4).ok().map(|b| u32::from_le_bytes(b.try_into().unwrap()));
                match current {
                    Some(value) if value != *expected => Some(WakeResult::Success(0)),
                    _ => {
                        if wake_targets.get(&(*addr, *expected)).is_some_and(|&n| n > 0) {
                            Some(WakeResult::Success(0))
                        } else {
                            None
                        }
                    }
                }
            }
            Blocker::Poll { fds, deadline, .. } => {
                let ready: u64 = fds
                    .iter()
                    .filter(|(fd, want)| !fs.poll(*fd, *want).is_empty())
                    .count() as u64;
                if ready > 0 {
                    Some(WakeResult::Success(ready))
                } else if Self::deadline_expired(*deadline, now) {
                    Some(WakeResult::Success(0))
                } else {
                    None
                }
            }
            Blocker::Select { fds, deadline, .. } => {
                let ready = fds.iter().any(|fd| fs.can_read(*fd) || fs.can_write(*fd));
                if ready {
                    Some(WakeResult::Success(1))
                } else if Self::deadline_expired(*deadline, now) {
                    Some(WakeResult::Success(0))
                } else {
                    None
                }
            }
            Blocker::EpollWait { watched, deadline, .. } => {
                let ready: u64 =
                    watched.iter().filter(|(fd, want)| !fs.poll(*fd, *want).is_empty()).count() as u64;
                if ready > 0 {
                    Some(WakeResult::Success(ready))
                } else if Self::deadline_expired(*deadline, now) {
                    Some(WakeResult::Success(0))
                } else {
                    None
                }
            }
            Blocker::Sleep { deadline, .. } => {
                if now >= *deadline {
                    Some(WakeResult::Success(0))
                } else {
                    None
                }
            }
            Blocker::Wait4 { .. } => None, // resolved by the registry, which knows other threads' states
            Blocker::Read { fd, .. } => {
                if fs.can_read(*fd) {
                    Some(WakeResult::Success(0))
                } else {
                    None
                }
            }
        }
    }
}

/// The collection of currently-parked blockers, evaluated in insertion
/// order on every scheduler pass.
#[derive(Default)]
pub struct BlockerRegistry {
    blockers: Vec<Blocker>,
    pending_futex_wakes: HashMap<(GuestAddr, u32), usize>,
}

impl BlockerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { blockers: Vec::new(), pending_futex_wakes: HashMap::new() }
    }

    /// Park a thread on `blocker`.
    pub fn register(&mut self, blocker: Blocker) {
        self.blockers.push(blocker);
    }

    /// Record that `count` waiters on `(addr, expected)` should be woken on
    /// the next pass — used by `futex_wake` issued from another thread's
    /// slice, which does not hold a reference to the waiting blocker.
    pub fn record_wake(&mut self, addr: GuestAddr, expected: u32, count: usize) {
        *self.pending_futex_wakes.entry((addr, expected)).or_insert(0) += count;
    }

    /// Whether any thread is currently parked.
    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }

    /// Number of parked blockers.
    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    /// Evaluate every blocker's predicate in insertion order; for each that
    /// resolves, remove it and return `(thread_index, result)`. Threads
    /// blocked on `Wait4` resolve by consulting `thread_is_dead`.
    pub fn try_wake_all(
        &mut self,
        vmm: &Vmm,
        fs: &dyn FsPoll,
        now: PreciseTime,
        thread_is_dead: impl Fn(i32) -> bool,
    ) -> Vec<(ThreadIndex, WakeResult)> {
        let mut woken = Vec::new();
        let mut remaining = Vec::with_capacity(self.blockers.len());
        for blocker in self.blockers.drain(..) {
            let result = if let Blocker::Wait4 { child_pid, .. } = &blocker {
                thread_is_dead(*child_pid).then_some(WakeResult::Success(0))
            } else {
                blocker.evaluate(vmm, fs, now, &self.pending_futex_wakes)
            };
            match result {
                Some(result) => woken.push((blocker.thread(), result)),
                None => remaining.push(blocker),
            }
        }
        self.blockers = remaining;
        self.pending_futex_wakes.clear();
        woken
    }
}

/// Apply a [`WakeResult`] to the woken thread: transition to `Runnable` and
/// set RAX.
pub fn apply_wake(thread: &mut crate::thread::Thread, result: WakeResult) {
    thread.set_state(ThreadState::Runnable);
    thread.cpu_mut().regs[RAX] = result.rax_value();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_timer::FakeTimeSource;
    use emu_vmm::{Permission, Vmm};

    struct NoFs;
    impl FsPoll for NoFs {
        fn poll(&self, _fd: i32, _interested: PollEvents) -> PollEvents {
            PollEvents::empty()
        }
    }

    #[test]
    fn sleep_wakes_only_once_deadline_passes() {
        let vmm = Vmm::new(GuestAddr::new(0), GuestAddr::new(0x1000_0000));
        let clock = FakeTimeSource::new();
        let mut registry = BlockerRegistry::new();
        registry.register(Blocker::Sleep { thread: 0, deadline: PreciseTime::new(1000, 0) });

        clock.advance_to(PreciseTime::new(500, 0));
        let woken = registry.try_wake_all(&vmm, &NoFs, clock.now(), |_| false);
        assert!(woken.is_empty());

        clock.advance_to(PreciseTime::new(1500, 0));
        let woken = registry.try_wake_all(&vmm, &NoFs, clock.now(), |_| false);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].1, WakeResult::Success(0));
    }

    #[test]
    fn futex_wakes_on_value_change() {
        let vmm = Vmm::new(GuestAddr::new(0), GuestAddr::new(0x1000_0000));
        let addr = vmm.mmap(None, 0x1000, Permission::READ | Permission::WRITE, false, "futex").unwrap();
        vmm.write_sized(addr, &1u32.to_le_bytes()).unwrap();

        let mut registry = BlockerRegistry::new();
        registry.register(Blocker::Futex { thread: 0, addr, expected: 1, deadline: None });
        let woken = registry.try_wake_all(&vmm, &NoFs, PreciseTime::ZERO, |_| false);
        assert!(woken.is_empty());

        vmm.write_sized(addr, &2u32.to_le_bytes()).unwrap();
        let woken = registry.try_wake_all(&vmm, &NoFs, PreciseTime::ZERO, |_| false);
        assert_eq!(woken.len(), 1);
    }

    #[test]
    fn wait4_resolves_from_child_state() {
        let vmm = Vmm::new(GuestAddr::new(0), GuestAddr::new(0x1000_0000));
        let mut registry = BlockerRegistry::new();
        registry.register(Blocker::Wait4 { thread: 0, child_pid: 42 });
        let woken = registry.try_wake_all(&vmm, &NoFs, PreciseTime::ZERO, |pid| pid == 42);
        assert_eq!(woken.len(), 1);
    }
}
