//! # Emulator Core
//!
//! Wires the virtual memory manager, disassembly & basic-block cache, and
//! scheduler & thread-blocker system into a single [`Emulator`], with a
//! config layer and an aggregated error type shared by every caller above
//! this crate (the CPU interpreter, syscall dispatcher, and CLI entry
//! point, none of which live here).

#![warn(missing_docs)]

mod config;
mod elf_flags;
mod emulator;
mod error;

pub use config::Config;
pub use elf_flags::permission_from_elf_flags;
pub use emulator::Emulator;
pub use error::EmuError;
