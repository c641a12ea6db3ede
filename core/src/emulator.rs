//! The top-level [`Emulator`]: one address space, one disassembly cache,
//! one scheduler, wired together the way the worker loop expects.

use crate::config::Config;
use crate::error::EmuError;
use emu_addr::GuestAddr;
use emu_dbbc::Dbbc;
use emu_profile::ProfileDocument;
use emu_sched::{
    DefaultProcessTable, FsPoll, GuestExecutor, HostFsPoll, HostTimeSource, ProcessTable,
    SchedulerCore, SchedulerHandle, ThreadIndex, ThreadState, TimeSource,
};
use emu_vmm::Vmm;
use std::sync::Arc;

/// Owns the three core subsystems for a single emulated process tree:
/// the address space, the basic-block cache layered over it, and the
/// scheduler that drives guest execution through an injected
/// [`GuestExecutor`].
pub struct Emulator<E: GuestExecutor> {
    config: Config,
    vmm: Arc<Vmm>,
    dbbc: Arc<Dbbc>,
    scheduler: Arc<SchedulerCore<E>>,
    process_table: Arc<dyn ProcessTable>,
}

impl<E: GuestExecutor + 'static> Emulator<E> {
    /// Build an emulator: a fresh address space, a disassembly cache
    /// registered as its observer, and a scheduler wired to an executor
    /// built from that same address space and cache.
    ///
    /// Executors nearly always need to fetch basic blocks through the same
    /// `Dbbc` the scheduler is driving, so construction is two-phased:
    /// `build_executor` receives the freshly created `Vmm`/`Dbbc` pair and
    /// returns the `GuestExecutor` to wire in.
    pub fn new(
        config: Config,
        build_executor: impl FnOnce(Arc<Vmm>, Arc<Dbbc>) -> E,
    ) -> Result<Self, EmuError> {
        let vmm = Arc::new(Vmm::new(
            GuestAddr::new(config.user_start),
            GuestAddr::new(config.user_end),
        ));
        let dbbc = Arc::new(Dbbc::new(vmm.clone())?);
        vmm.add_observer(dbbc.clone());
        let executor = build_executor(vmm.clone(), dbbc.clone());

        let fs: Arc<dyn FsPoll> = Arc::new(HostFsPoll);
        let clock: Arc<dyn TimeSource> = Arc::new(HostTimeSource::default());
        let scheduler = Arc::new(SchedulerCore::new(
            executor,
            vmm.clone(),
            fs,
            clock,
            config.worker_count,
        ));

        Ok(Self {
            config,
            vmm,
            dbbc,
            scheduler,
            process_table: Arc::new(DefaultProcessTable::new()),
        })
    }

    /// The shared address space.
    pub fn vmm(&self) -> &Arc<Vmm> {
        &self.vmm
    }

    /// The shared disassembly & basic-block cache.
    pub fn dbbc(&self) -> &Arc<Dbbc> {
        &self.dbbc
    }

    /// The scheduler core.
    pub fn scheduler(&self) -> &Arc<SchedulerCore<E>> {
        &self.scheduler
    }

    /// The process table used to fork new address spaces.
    pub fn process_table(&self) -> &Arc<dyn ProcessTable> {
        &self.process_table
    }

    /// The configuration this emulator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle a [`GuestExecutor`] can clone and use to register blockers
    /// or wake futex waiters.
    pub fn scheduler_handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Spawn the initial thread of the initial process (pid 1).
    pub fn spawn_main_thread(&self) -> ThreadIndex {
        self.scheduler.add_thread(1, self.config.profiling_enabled)
    }

    /// Run the scheduler to completion (every thread dead, or cancelled).
    pub fn run(&self) {
        self.scheduler.run();
    }

    /// Request cooperative cancellation, as a SIGINT handler would.
    pub fn cancel(&self) {
        self.scheduler.cancellation_flag().store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Snapshot every thread's profiling events into a single document,
    /// given a symbol resolver. Meant to be called once the run has
    /// finished; threads still mid-slice report whatever was recorded up
    /// to their last reconciliation.
    pub fn profile(&self, resolve: impl FnMut(u64) -> Option<String>) -> ProfileDocument {
        let count = self.scheduler.thread_count();
        let threads: Vec<_> = (0..count).map(|idx| self.scheduler.thread_snapshot(idx)).collect();
        ProfileDocument::build(threads.iter(), resolve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_sched::{StepOutcome, Thread};

    struct ImmediateExit;
    impl GuestExecutor for ImmediateExit {
        fn run_slice(&self, _thread: &mut Thread, _ticks: u64) -> StepOutcome {
            StepOutcome::Exited(0)
        }
    }

    #[test]
    fn wires_dbbc_as_vmm_observer_and_runs_to_completion() {
        let emu = Emulator::new(Config::default(), |_vmm, _dbbc| ImmediateExit).unwrap();
        let idx = emu.spawn_main_thread();
        emu.run();
        assert_eq!(emu.scheduler().thread_state(idx), ThreadState::Dead);
    }

    #[test]
    fn exec_region_invalidates_dbbc_cache_through_vmm() {
        let emu = Emulator::new(Config::default(), |_vmm, _dbbc| ImmediateExit).unwrap();
        let base = emu
            .vmm()
            .mmap(None, 0x1000, emu_vmm::Permission::READ | emu_vmm::Permission::WRITE | emu_vmm::Permission::EXEC, false, "code")
            .unwrap();
        emu.vmm().write_sized(base, &[0x90, 0x90, 0xC3]).unwrap();
        emu.dbbc().get_basic_block(base).unwrap();
        assert_eq!(emu.dbbc().cached_section_count(), 1);
        emu.vmm().mprotect(base, 0x1000, emu_vmm::Permission::READ | emu_vmm::Permission::WRITE).unwrap();
        assert_eq!(emu.dbbc().cached_section_count(), 0);
    }
}
