//! Worker pool, pick-next policy, time-slice accounting, and cancellation.

use crate::blocker::{apply_wake, Blocker, BlockerRegistry};
use crate::fs_timer::{FsPoll, TimeSource};
use crate::thread::{Thread, ThreadIndex, ThreadState};
use emu_addr::GuestAddr;
use emu_vmm::Vmm;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Default time slice, in retired guest instructions ("ticks"), granted to
/// a userspace-only worker.
pub const DEFAULT_SLICE_TICKS: u64 = 1_000_000;

/// Time slice granted when a thread is about to run on the atomic-capable
/// worker (worker 0), kept short because LOCK-prefixed instructions
/// serialize all guest threads against it.
pub const ATOMIC_SLICE_TICKS: u64 = 100;

/// Errors raised by the scheduler core.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// `pick_next` found no runnable thread, no blocked thread, and no dead
    /// thread — a thread set that should be unreachable.
    #[error("scheduler found no thread in any known state")]
    Inconsistent,
    /// Every alive thread is blocked and none can ever become runnable — a
    /// deadlock the original implementation treats as fatal.
    #[error("deadlock: all threads blocked, no blocker can resolve")]
    Deadlock,
}

/// What a slice of guest execution ended with. Returned by
/// [`GuestExecutor::run_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The thread's tick budget ran out between basic blocks.
    SliceExpired,
    /// The thread issued a syscall, identified by its number.
    Syscall(u64),
    /// The thread blocked. The executor is expected to have already called
    /// [`SchedulerHandle::register_blocker`] with the predicate before
    /// returning this variant.
    Blocked,
    /// The thread called `exit`/`exit_group` with the given status.
    Exited(i32),
}

/// The seam to the (out-of-scope) CPU interpreter: executes guest
/// instructions for up to `ticks` retired instructions, starting wherever
/// `thread`'s saved state left off, and reports why it stopped.
///
/// Implementors that block a thread must call back into the
/// [`SchedulerHandle`] they were constructed with to register the
/// [`Blocker`] *before* returning [`StepOutcome::Blocked`] — the scheduler
/// core only transitions thread state on the reconciliation pass, it does
/// not know the predicate.
pub trait GuestExecutor: Send + Sync {
    /// Run `thread` for up to `ticks` instructions.
    fn run_slice(&self, thread: &mut Thread, ticks: u64) -> StepOutcome;
}

/// Stands in for clone-as-new-process: allocates a pid and deep-copies an
/// address space so the new process does not share pages with its parent.
pub trait ProcessTable: Send + Sync {
    /// Allocate the next process id.
    fn allocate_pid(&self) -> i32;

    /// Deep-copy every mapped region of `parent` into a freshly constructed
    /// address space.
    fn fork_address_space(&self, parent: &Vmm) -> Arc<Vmm>;
}

/// A [`ProcessTable`] that performs the deep copy by replaying `parent`'s
/// region snapshot through `mmap` and a region-by-region `copy_from_mmu` /
/// `copy_to_mmu` pair, matching the source's "deep copy driven by the VMM's
/// copyToMmu loop".
#[derive(Default)]
pub struct DefaultProcessTable {
    next_pid: AtomicI32,
}

impl DefaultProcessTable {
    /// A process table starting pid allocation at 2 (pid 1 is the initial
    /// process created directly by [`SchedulerCore::new`]).
    pub fn new() -> Self {
        Self { next_pid: AtomicI32::new(2) }
    }
}

impl ProcessTable for DefaultProcessTable {
    fn allocate_pid(&self) -> i32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    fn fork_address_space(&self, parent: &Vmm) -> Arc<Vmm> {
        let child = Arc::new(Vmm::new(GuestAddr::new(0), GuestAddr::new(u64::MAX)));
        for (base, length, perms, name) in parent.region_snapshot() {
            let _ = child.mmap(Some(base), length, perms, true, name);
            let mut buf = vec![0u8; length as usize];
            if parent.copy_from_mmu(base, &mut buf).is_ok() {
                let _ = child.copy_to_mmu(base, &buf);
            }
        }
        child
    }
}

struct SchedulerState {
    threads: Vec<Thread>,
    blockers: BlockerRegistry,
    pinned_to_worker0: HashSet<ThreadIndex>,
    aborted: bool,
}

impl SchedulerState {
    fn all_dead(&self) -> bool {
        !self.threads.is_empty() && self.threads.iter().all(|t| t.state() == ThreadState::Dead)
    }

    fn has_runnable(&self, worker_id: usize) -> bool {
        self.threads.iter().enumerate().any(|(i, t)| {
            t.state() == ThreadState::Runnable && (worker_id == 0 || !self.pinned_to_worker0.contains(&i))
        })
    }

    fn has_blocked(&self) -> bool {
        self.threads.iter().any(|t| t.state() == ThreadState::Blocked)
    }
}

/// A handle an externally-supplied [`GuestExecutor`] uses to register
/// blockers and wake futex waiters without needing direct access to the
/// scheduler's internal lock.
#[derive(Clone)]
pub struct SchedulerHandle {
    state: Arc<Mutex<SchedulerState>>,
    has_runnable: Arc<Condvar>,
}

impl SchedulerHandle {
    /// Park the current thread on `blocker`, called by a [`GuestExecutor`]
    /// just before returning [`StepOutcome::Blocked`].
    pub fn register_blocker(&self, blocker: Blocker) {
        self.state.lock().unwrap().blockers.register(blocker);
    }

    /// Record that `count` futex waiters on `(addr, expected)` should wake
    /// on the next pass, and nudge any idle worker to re-check.
    pub fn futex_wake(&self, addr: GuestAddr, expected: u32, count: usize) {
        self.state.lock().unwrap().blockers.record_wake(addr, expected, count);
        self.has_runnable.notify_all();
    }
}

/// What `pick_next` decided for a worker.
enum PickOutcome {
    Run(ThreadIndex, u64),
    Wait,
    Exit,
    Abort,
}

/// Cooperative, multi-worker scheduler over a pool of guest threads.
pub struct SchedulerCore<E: GuestExecutor> {
    state: Arc<Mutex<SchedulerState>>,
    has_runnable: Arc<Condvar>,
    executor: E,
    vmm: Arc<Vmm>,
    fs: Arc<dyn FsPoll>,
    clock: Arc<dyn TimeSource>,
    cancel: Arc<AtomicBool>,
    worker_count: usize,
}

impl<E: GuestExecutor + 'static> SchedulerCore<E> {
    /// Build a scheduler with `worker_count` workers (worker 0 is
    /// syscall/atomic-capable; the rest run plain userspace slices only).
    pub fn new(
        executor: E,
        vmm: Arc<Vmm>,
        fs: Arc<dyn FsPoll>,
        clock: Arc<dyn TimeSource>,
        worker_count: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                threads: Vec::new(),
                blockers: BlockerRegistry::new(),
                pinned_to_worker0: HashSet::new(),
                aborted: false,
            })),
            has_runnable: Arc::new(Condvar::new()),
            executor,
            vmm,
            fs,
            clock,
            cancel: Arc::new(AtomicBool::new(false)),
            worker_count: worker_count.max(1),
        }
    }

    /// A handle a [`GuestExecutor`] implementation can clone and hold onto.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { state: self.state.clone(), has_runnable: self.has_runnable.clone() }
    }

    /// A cancellation flag; setting it (e.g. from a SIGINT handler) makes
    /// every worker ABORT on its next scheduler-mutex acquisition.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Register a new thread, returning its arena index.
    pub fn add_thread(&self, pid: i32, profiling: bool) -> ThreadIndex {
        let tid = crate::thread::allocate_tid();
        let mut state = self.state.lock().unwrap();
        state.threads.push(Thread::new(pid, tid, profiling));
        let idx = state.threads.len() - 1;
        drop(state);
        self.has_runnable.notify_all();
        idx
    }

    /// Number of threads ever created (alive or dead).
    pub fn thread_count(&self) -> usize {
        self.state.lock().unwrap().threads.len()
    }

    /// Current lifecycle state of thread `idx`.
    pub fn thread_state(&self, idx: ThreadIndex) -> ThreadState {
        self.state.lock().unwrap().threads[idx].state()
    }

    /// Exit status of thread `idx`, once it has died.
    pub fn exit_status(&self, idx: ThreadIndex) -> Option<i32> {
        self.state.lock().unwrap().threads[idx].exit_status()
    }

    /// Value currently saved in thread `idx`'s RAX.
    pub fn rax(&self, idx: ThreadIndex) -> u64 {
        self.state.lock().unwrap().threads[idx].cpu().regs[crate::thread::RAX]
    }

    /// A read-only clone of thread `idx`, including its recorded call/ret/
    /// syscall events, for profiling output. While the thread is mid-slice
    /// (its storage temporarily swapped out by a worker) this returns the
    /// placeholder rather than blocking, so callers should only rely on it
    /// once the run has finished.
    pub fn thread_snapshot(&self, idx: ThreadIndex) -> Thread {
        self.state.lock().unwrap().threads[idx].clone()
    }

    /// Run every worker on the calling thread's behalf via real OS threads,
    /// blocking until every guest thread is dead or the run is cancelled.
    pub fn run(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let this = self.clone();
            handles.push(std::thread::spawn(move || this.run_worker(worker_id)));
        }
        for h in handles {
            let _ = h.join();
        }
    }

    fn run_worker(&self, worker_id: usize) {
        loop {
            let mut state = self.state.lock().unwrap();
            loop {
                if self.cancel.load(Ordering::SeqCst) {
                    state.aborted = true;
                }
                if state.aborted {
                    log::warn!("worker {worker_id}: scheduler aborted, exiting run loop");
                    return;
                }
                let now = self.clock.now();
                self.try_wake_all_locked(&mut state, now);
                if state.has_runnable(worker_id) || state.all_dead() {
                    break;
                }
                if state.has_blocked() {
                    state = self.has_runnable.wait(state).unwrap();
                } else {
                    break;
                }
            }

            match self.pick_next(&mut state, worker_id) {
                PickOutcome::Exit => return,
                PickOutcome::Abort => return,
                PickOutcome::Wait => {
                    let _ = self.has_runnable.wait(state).unwrap();
                }
                PickOutcome::Run(idx, ticks) => {
                    let mut placeholder = Thread::new(0, 0, false);
                    // The placeholder must never be picked by another worker
                    // while this slice is in flight; `Thread::new` defaults
                    // to `Runnable`, which `pick_next` would happily select.
                    placeholder.set_state(ThreadState::Running);
                    let mut thread = std::mem::replace(&mut state.threads[idx], placeholder);
                    drop(state);

                    thread.grant_slice(ticks);
                    let outcome = self.executor.run_slice(&mut thread, ticks);

                    let mut state = self.state.lock().unwrap();
                    self.reconcile(&mut state, idx, thread, outcome, worker_id);
                }
            }
        }
    }

    fn try_wake_all_locked(&self, state: &mut SchedulerState, now: emu_addr::PreciseTime) {
        let dead_pids: Vec<i32> =
            state.threads.iter().filter(|t| t.state() == ThreadState::Dead).map(Thread::pid).collect();
        let woken = state.blockers.try_wake_all(&self.vmm, self.fs.as_ref(), now, |pid| dead_pids.contains(&pid));
        for (idx, result) in woken {
            apply_wake(&mut state.threads[idx], result);
            state.pinned_to_worker0.remove(&idx);
        }
        if !state.threads.is_empty() {
            self.has_runnable.notify_all();
        }
    }

    fn pick_next(&self, state: &mut SchedulerState, worker_id: usize) -> PickOutcome {
        if state.all_dead() {
            return PickOutcome::Exit;
        }
        let idx = state.threads.iter().enumerate().find_map(|(i, t)| {
            let eligible = worker_id == 0 || !state.pinned_to_worker0.contains(&i);
            (t.state() == ThreadState::Runnable && eligible).then_some(i)
        });
        match idx {
            Some(i) => {
                state.threads[i].set_state(ThreadState::Running);
                // The short slice is for the thread's syscall/atomic turn on
                // worker 0, not merely for running on worker 0: a thread that
                // happens to land there without being pinned (e.g. the sole
                // worker in a single-worker config) still gets the full
                // userspace slice.
                let ticks = if worker_id == 0 && state.pinned_to_worker0.contains(&i) {
                    ATOMIC_SLICE_TICKS
                } else {
                    DEFAULT_SLICE_TICKS
                };
                PickOutcome::Run(i, ticks)
            }
            None if state.has_blocked() => PickOutcome::Wait,
            None => PickOutcome::Wait,
        }
    }

    fn reconcile(
        &self,
        state: &mut SchedulerState,
        idx: ThreadIndex,
        mut thread: Thread,
        outcome: StepOutcome,
        worker_id: usize,
    ) {
        match outcome {
            StepOutcome::SliceExpired => {
                if thread.state() == ThreadState::Running {
                    thread.set_state(ThreadState::Runnable);
                }
            }
            StepOutcome::Syscall(number) => {
                thread.record_syscall(number);
                if worker_id == 0 {
                    thread.set_state(ThreadState::Runnable);
                    state.pinned_to_worker0.remove(&idx);
                } else {
                    // Only worker 0 may service syscalls; requeue pinned so
                    // the next pick routes it there.
                    thread.set_state(ThreadState::Runnable);
                    state.pinned_to_worker0.insert(idx);
                }
            }
            StepOutcome::Blocked => {
                thread.set_state(ThreadState::Blocked);
            }
            StepOutcome::Exited(status) => {
                thread.terminate(status);
                if let Some(clear_addr) = thread.clear_child_tid() {
                    if self.vmm.write_sized(clear_addr, &0u32.to_le_bytes()).is_ok() {
                        self.handle().futex_wake(clear_addr, 0, 1);
                    }
                }
            }
        }
        state.threads[idx] = thread;
        self.has_runnable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_timer::{FakeTimeSource, HostFsPoll};
    use emu_vmm::Vmm;

    struct ImmediateExit(i32);
    impl GuestExecutor for ImmediateExit {
        fn run_slice(&self, _thread: &mut Thread, _ticks: u64) -> StepOutcome {
            StepOutcome::Exited(self.0)
        }
    }

    #[test]
    fn scheduler_progress_runs_a_runnable_thread() {
        let vmm = Arc::new(Vmm::new(GuestAddr::new(0), GuestAddr::new(0x1000_0000)));
        let scheduler = Arc::new(SchedulerCore::new(
            ImmediateExit(7),
            vmm,
            Arc::new(HostFsPoll),
            Arc::new(FakeTimeSource::new()),
            1,
        ));
        let idx = scheduler.add_thread(1, false);
        scheduler.run();
        assert_eq!(scheduler.thread_state(idx), ThreadState::Dead);
        assert_eq!(scheduler.exit_status(idx), Some(7));
    }

    struct CountingExecutor {
        calls: std::sync::atomic::AtomicU32,
    }
    impl GuestExecutor for CountingExecutor {
        fn run_slice(&self, _thread: &mut Thread, _ticks: u64) -> StepOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                StepOutcome::Exited(0)
            } else {
                StepOutcome::SliceExpired
            }
        }
    }

    #[test]
    fn slice_expiry_requeues_runnable_until_exit() {
        let vmm = Arc::new(Vmm::new(GuestAddr::new(0), GuestAddr::new(0x1000_0000)));
        let scheduler = Arc::new(SchedulerCore::new(
            CountingExecutor { calls: std::sync::atomic::AtomicU32::new(0) },
            vmm,
            Arc::new(HostFsPoll),
            Arc::new(FakeTimeSource::new()),
            1,
        ));
        let idx = scheduler.add_thread(1, false);
        scheduler.run();
        assert_eq!(scheduler.thread_state(idx), ThreadState::Dead);
    }
}
