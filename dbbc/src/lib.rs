//! # Disassembly & Basic-Block Cache
//!
//! Converts raw guest bytes, fetched through the VMM, into a semantic
//! instruction stream grouped into basic blocks, cached by guest address
//! and invalidated when the VMM reports the backing memory lost EXEC.

#![warn(missing_docs)]

mod engine;
mod instruction;
mod section;

pub use engine::{Dbbc, DbbcError};
pub use instruction::{Instruction, Operand};
pub use section::{ExecutableSection, SectionStore};
