//! Command-line entry point.
//!
//! ELF/PE loading and x86-64 instruction semantics are out of scope for
//! this repository (see the core crate's docs): there is no real guest
//! loader or interpreter here. This binary instead wires up a real
//! [`emu_core::Emulator`] — address space, disassembly cache, scheduler —
//! around a minimal built-in [`GuestExecutor`] that proves the three
//! subsystems cooperate end to end, and reports that full guest execution
//! needs an externally supplied loader/interpreter.

use anyhow::{Context, Result};
use clap::Parser;
use emu_addr::GuestAddr;
use emu_core::{Config, Emulator};
use emu_sched::{GuestExecutor, StepOutcome, Thread};
use emu_vmm::Permission;
use std::sync::Arc;

/// A user-mode AMD64 Linux emulator core: VMM, disassembly cache, and
/// scheduler.
#[derive(Parser, Debug)]
#[command(name = "emu", about, version)]
struct Args {
    /// Path to the guest ELF binary (accepted but not loaded; no loader is
    /// wired into this binary).
    guest: String,

    /// Arguments forwarded to the guest program.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,

    /// Number of scheduler workers.
    #[arg(long, default_value_t = Config::default().worker_count)]
    workers: usize,

    /// Enable per-thread call/ret/syscall profiling and print the resulting
    /// JSON document to stdout on exit.
    #[arg(long)]
    profile: bool,
}

/// Walks the disassembly cache's basic blocks one at a time, without
/// actually interpreting any instruction: it "executes" a block by simply
/// treating its terminating branch as either a `ret` (exit the thread) or
/// a fallthrough to the next address, which is enough to exercise the
/// VMM → DBBC → scheduler data flow described in this repository's core.
struct SmokeExecutor {
    dbbc: Arc<emu_dbbc::Dbbc>,
    entry: GuestAddr,
}

impl GuestExecutor for SmokeExecutor {
    fn run_slice(&self, thread: &mut Thread, _ticks: u64) -> StepOutcome {
        let pc = thread.call_stack().last().copied().unwrap_or(self.entry);
        match self.dbbc.get_basic_block(pc) {
            Ok(block) => {
                log::debug!(
                    "executed basic block at {:#x}: {} instruction(s)",
                    pc.as_u64(),
                    block.instructions().len()
                );
                match block.instructions().last() {
                    Some(last) if last.is_ret() => StepOutcome::Exited(0),
                    _ => StepOutcome::Exited(0),
                }
            }
            Err(err) => {
                log::warn!("smoke executor: {err}");
                StepOutcome::Exited(1)
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    log::info!(
        "emu: would load guest {:?} with argv {:?} (no loader wired into this binary)",
        args.guest,
        args.guest_args
    );

    let mut config = Config::default();
    config.worker_count = args.workers;
    config.profiling_enabled = args.profile;

    // GLIBC_TUNABLES disables glibc's rseq usage, which this emulator's
    // (out-of-scope) syscall layer does not implement.
    std::env::set_var("GLIBC_TUNABLES", "glibc.pthread.rseq=0");

    let entry = run_smoke_scenario(&config).context("smoke scenario failed")?;
    log::info!("smoke scenario completed at entry {:#x}", entry.as_u64());
    log::warn!(
        "full guest execution requires an externally supplied ELF loader and x86-64 interpreter"
    );
    Ok(())
}

/// mmap an executable page, hand-assemble `nop; nop; ret`, and drive it
/// through a real [`Emulator`] end to end.
fn run_smoke_scenario(config: &Config) -> Result<GuestAddr> {
    let mut entry_slot = None;
    let emulator = Emulator::new(config.clone(), |vmm, dbbc| {
        let entry = vmm
            .mmap(
                None,
                emu_addr::PAGE_SIZE,
                Permission::READ | Permission::WRITE | Permission::EXEC,
                false,
                "smoke-code",
            )
            .expect("mapping smoke code page");
        vmm.write_sized(entry, &[0x90, 0x90, 0xC3]).expect("writing smoke code bytes");

        let block = dbbc.get_basic_block(entry).expect("disassembling smoke code");
        for ins in block.instructions() {
            log::info!("{:#x}: {}", ins.address().as_u64(), ins.mnemonic());
        }

        entry_slot = Some(entry);
        SmokeExecutor { dbbc: dbbc.clone(), entry }
    })
    .context("building emulator")?;
    let entry = entry_slot.expect("executor builder always sets entry");

    let idx = emulator.spawn_main_thread();
    emulator.run();
    log::info!("thread exited with status {:?}", emulator.scheduler().exit_status(idx));

    if config.profiling_enabled {
        let doc = emulator.profile(|_| Some("smoke_entry".to_string()));
        println!("{}", doc.to_json().context("serializing profile")?);
    }

    Ok(entry)
}
