//! Decoded instruction representation, independent of the disassembler
//! crate used to produce it.

use emu_addr::GuestAddr;

/// One decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A sign-extended immediate value.
    Immediate(i64),
    /// A register, identified by the disassembler's own register id.
    Register(u16),
    /// A memory-encoding operand (base/index/disp not decomposed further).
    Memory,
    /// A register-or-memory operand whose exact form wasn't distinguished.
    RegisterOrMemory,
}

/// A single decoded x86-64 instruction.
///
/// Operand list is capped at three entries, matching the widest x86-64
/// instruction encodings actually emitted by compilers (four-operand forms
/// like `IMUL r, r/m, imm` do occur but are rare enough that the cache
/// truncates rather than growing every instruction by another slot).
#[derive(Debug, Clone)]
pub struct Instruction {
    address: GuestAddr,
    length: u8,
    mnemonic: String,
    operands: Vec<Operand>,
    is_branch: bool,
    is_call: bool,
    is_fixed_destination_jump: bool,
    is_ret: bool,
    is_syscall_or_trap: bool,
}

impl Instruction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: GuestAddr,
        length: u8,
        mnemonic: String,
        operands: Vec<Operand>,
        is_branch: bool,
        is_call: bool,
        is_fixed_destination_jump: bool,
        is_ret: bool,
        is_syscall_or_trap: bool,
    ) -> Self {
        Self {
            address,
            length,
            mnemonic,
            operands,
            is_branch,
            is_call,
            is_fixed_destination_jump,
            is_ret,
            is_syscall_or_trap,
        }
    }

    /// Guest address this instruction was decoded at.
    pub fn address(&self) -> GuestAddr {
        self.address
    }

    /// Encoded length in bytes.
    pub fn length(&self) -> u8 {
        self.length
    }

    /// The address immediately following this instruction.
    pub fn next_address(&self) -> GuestAddr {
        self.address.saturating_add(u64::from(self.length))
    }

    /// Disassembler mnemonic, e.g. `"mov"`, `"jne"`, `"syscall"`.
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Decoded operands, in encoding order.
    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    /// Whether this instruction ends a basic block: call, ret, jmp, jcc,
    /// syscall, or ud2.
    pub fn is_branch(&self) -> bool {
        self.is_branch
    }

    /// Whether this is a `call` instruction specifically.
    pub fn is_call(&self) -> bool {
        self.is_call
    }

    /// Whether this is a `ret` instruction specifically.
    pub fn is_ret(&self) -> bool {
        self.is_ret
    }

    /// Whether this is an unconditional jump/call to a statically known
    /// destination (direct, not through a register or memory operand).
    pub fn is_fixed_destination_jump(&self) -> bool {
        self.is_fixed_destination_jump
    }

    /// Whether this is `syscall`, `int`, `iret`, or `ud2` — a branch that
    /// leaves the basic block without a conventional jump target.
    pub fn is_syscall_or_trap(&self) -> bool {
        self.is_syscall_or_trap
    }
}
