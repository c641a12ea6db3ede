//! Disassembly & basic-block cache engine.
//!
//! Fetches guest bytes through the VMM, disassembles them with `capstone`,
//! and trims the result to basic-block boundaries. Registers as a
//! [`VmmObserver`] so it can drop cached sections the instant the bytes
//! backing them stop being executable.

use crate::instruction::{Instruction, Operand};
use crate::section::{ExecutableSection, SectionStore};
use capstone::arch::x86::X86OperandType;
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Insn, InsnGroupId};
use emu_addr::GuestAddr;
use emu_vmm::{Permission, Vmm, VmmObserver};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// Maximum span, in bytes, fetched from the VMM for a single disassembly
/// attempt (matches the original cache's fetch cap).
const MAX_FETCH_SPAN: u64 = 0x100;

/// How many `(address, section)` pairs the destination cursor cache keeps.
const CURSOR_CACHE_LEN: usize = 8;

/// Errors raised by the disassembly cache.
#[derive(Debug, thiserror::Error)]
pub enum DbbcError {
    /// `addr` is not currently executable.
    #[error("address {0:x} is not executable")]
    NotExecutable(GuestAddr),
    /// The VMM reported the bytes at `addr` as unmapped entirely.
    #[error("address {0:x} is not mapped")]
    Unmapped(GuestAddr),
    /// `addr` does not fall on an instruction boundary within the decoded
    /// bytes, so the trimmed prefix up to the first branch is empty.
    #[error("empty instruction prefix at {0:x}: address is not an instruction boundary")]
    EmptyPrefix(GuestAddr),
    /// The architectural disassembler rejected the input bytes.
    #[error("disassembly failed at {0:x}: {1}")]
    DisassemblyFailed(GuestAddr, String),
}

/// Disassembly & Basic-Block Cache engine.
pub struct Dbbc {
    vmm: Arc<Vmm>,
    disassembler: Mutex<Capstone>,
    sections: RwLock<SectionStore>,
    cursor_cache: Mutex<VecDeque<(u64, Arc<ExecutableSection>)>>,
}

impl Dbbc {
    /// Build a cache that fetches bytes through `vmm`.
    pub fn new(vmm: Arc<Vmm>) -> Result<Self, DbbcError> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build()
            .map_err(|e| DbbcError::DisassemblyFailed(GuestAddr::NULL, e.to_string()))?;
        Ok(Self {
            vmm,
            disassembler: Mutex::new(cs),
            sections: RwLock::new(SectionStore::new()),
            cursor_cache: Mutex::new(VecDeque::with_capacity(CURSOR_CACHE_LEN)),
        })
    }

    /// Return the basic block (instructions from `addr` up to and
    /// including the first branch) starting at `addr`, disassembling and
    /// caching fresh bytes if nothing usable is cached yet.
    pub fn get_basic_block(&self, addr: GuestAddr) -> Result<Arc<ExecutableSection>, DbbcError> {
        if let Some(hit) = self.cursor_lookup(addr) {
            return Ok(hit);
        }

        if !self.vmm.is_executable(addr) {
            return Err(DbbcError::NotExecutable(addr));
        }

        loop {
            if let Some(section) = self.sections.read().unwrap().containing(addr) {
                if let Some(idx) = section.instruction_at(addr) {
                    let block = extract_block(&section, idx);
                    self.cursor_insert(addr, block.clone());
                    return Ok(block);
                }
                // addr isn't an instruction boundary in the cached section;
                // fall through and re-disassemble, same as the original.
            }

            let section = self.fetch_and_decode(addr)?;
            let mut sections = self.sections.write().unwrap();
            sections.remove_overlapping(section.begin(), section.end());
            sections.insert(section);
            drop(sections);
            // Loop back: the freshly inserted section now contains addr.
        }
    }

    /// Tell the cache a `call` to `addr` is about to execute, pre-warming
    /// the destination cursor.
    pub fn notify_call(&self, addr: GuestAddr) -> Result<Arc<ExecutableSection>, DbbcError> {
        self.get_basic_block(addr)
    }

    /// Tell the cache a `ret` is returning to `addr`.
    pub fn notify_ret(&self, addr: GuestAddr) -> Result<Arc<ExecutableSection>, DbbcError> {
        self.get_basic_block(addr)
    }

    /// Tell the cache an unconditional or conditional jump landed on `addr`.
    pub fn notify_jmp(&self, addr: GuestAddr) -> Result<Arc<ExecutableSection>, DbbcError> {
        self.get_basic_block(addr)
    }

    /// Flush the destination cursor cache, e.g. when the scheduler installs
    /// a different thread's saved state. `new_pc` is pre-warmed into the
    /// (now empty) cache when the lookup succeeds, saving the interpreter a
    /// round trip on its very next fetch.
    pub fn context_switch(&self, new_pc: GuestAddr) {
        self.cursor_cache.lock().unwrap().clear();
        let _ = self.get_basic_block(new_pc);
    }

    /// Number of sections currently cached (for tests/diagnostics).
    pub fn cached_section_count(&self) -> usize {
        self.sections.read().unwrap().len()
    }

    fn cursor_lookup(&self, addr: GuestAddr) -> Option<Arc<ExecutableSection>> {
        let cache = self.cursor_cache.lock().unwrap();
        cache.iter().find(|(a, _)| *a == addr.as_u64()).map(|(_, s)| s.clone())
    }

    fn cursor_insert(&self, addr: GuestAddr, section: Arc<ExecutableSection>) {
        let mut cache = self.cursor_cache.lock().unwrap();
        if cache.len() >= CURSOR_CACHE_LEN {
            cache.pop_front();
        }
        cache.push_back((addr.as_u64(), section));
    }

    fn fetch_and_decode(&self, addr: GuestAddr) -> Result<Arc<ExecutableSection>, DbbcError> {
        let cap = {
            let sections = self.sections.read().unwrap();
            sections.next_begin_at_or_after(addr.saturating_add(1))
        };
        let span = cap
            .map(|next_begin| (next_begin - addr).min(MAX_FETCH_SPAN))
            .unwrap_or(MAX_FETCH_SPAN)
            .max(1);

        let mut buf = vec![0u8; span as usize];
        self.vmm.copy_from_mmu(addr, &mut buf).map_err(|_| DbbcError::Unmapped(addr))?;

        let cs = self.disassembler.lock().unwrap();
        let decoded = cs
            .disasm_all(&buf, addr.as_u64())
            .map_err(|e| DbbcError::DisassemblyFailed(addr, e.to_string()))?;
        let mut instructions = Vec::with_capacity(decoded.len());
        for insn in decoded.iter() {
            instructions.push(decode_instruction(&cs, insn));
        }
        drop(cs);

        if instructions.is_empty() {
            return Err(DbbcError::EmptyPrefix(addr));
        }

        let trimmed = trim_to_last_branch(instructions);
        if trimmed.is_empty() {
            return Err(DbbcError::EmptyPrefix(addr));
        }

        let origin_name = self
            .vmm
            .is_readable(addr)
            .then(|| "anon".to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Arc::new(ExecutableSection::new(origin_name, trimmed)))
    }
}

impl VmmObserver for Dbbc {
    fn on_region_protection_change(
        &self,
        base: GuestAddr,
        length: u64,
        before: Permission,
        after: Permission,
    ) {
        if before.contains(Permission::EXEC) == after.contains(Permission::EXEC) {
            return;
        }
        if !after.contains(Permission::EXEC) {
            self.sections.write().unwrap().remove_fully_within(base, length);
            self.cursor_cache.lock().unwrap().retain(|(addr, _)| *addr < base.as_u64() || *addr >= base.as_u64() + length);
        }
    }

    fn on_region_destruction(&self, base: GuestAddr, length: u64, prot: Permission) {
        if !prot.contains(Permission::EXEC) {
            return;
        }
        self.sections.write().unwrap().remove_fully_within(base, length);
        self.cursor_cache.lock().unwrap().retain(|(addr, _)| *addr < base.as_u64() || *addr >= base.as_u64() + length);
    }
}

/// Build a block-sized [`ExecutableSection`] from the cached section's
/// instructions, starting at `idx`, up to and including the first branch.
fn extract_block(section: &ExecutableSection, idx: usize) -> Arc<ExecutableSection> {
    let mut out = Vec::new();
    for ins in &section.instructions()[idx..] {
        let is_branch = ins.is_branch();
        out.push(ins.clone());
        if is_branch {
            break;
        }
    }
    Arc::new(ExecutableSection::new(section.origin_name().to_string(), out))
}

/// Walk instructions, splitting on branches, retaining only the run up to
/// (and including) the last complete basic block. Mirrors the original
/// cache's `ExecutableSection::trim`.
fn trim_to_last_branch(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut last_boundary = None;
    for (i, ins) in instructions.iter().enumerate() {
        if ins.is_branch() && i + 1 != instructions.len() {
            last_boundary = Some(i + 1);
        }
    }
    match last_boundary {
        Some(boundary) => instructions.into_iter().take(boundary).collect(),
        None => {
            // No interior branch: keep the whole run only if it itself ends
            // in a branch (a single block fetch landed exactly at the end).
            if instructions.last().is_some_and(Instruction::is_branch) {
                instructions
            } else {
                Vec::new()
            }
        }
    }
}

fn decode_instruction(cs: &Capstone, insn: &Insn) -> Instruction {
    let address = GuestAddr::new(insn.address());
    let length = insn.len() as u8;
    let mnemonic = insn.mnemonic().unwrap_or("").to_string();

    let detail = cs.insn_detail(insn).ok();
    let groups: Vec<InsnGroupId> =
        detail.as_ref().map(|d| d.groups().to_vec()).unwrap_or_default();
    let group_names: Vec<String> =
        groups.iter().filter_map(|g| cs.group_name(*g)).collect();

    let is_jump = group_names.iter().any(|n| n == "jump");
    let is_call = group_names.iter().any(|n| n == "call");
    let is_ret = group_names.iter().any(|n| n == "ret");
    let is_int = group_names.iter().any(|n| n == "int");
    let is_iret = group_names.iter().any(|n| n == "iret");
    let is_branch_relative = group_names.iter().any(|n| n == "branch_relative");
    let is_ud2 = mnemonic == "ud2";
    let is_syscall = mnemonic == "syscall" || mnemonic == "sysenter";

    let is_syscall_or_trap = is_syscall || is_int || is_iret || is_ud2;
    let is_branch = is_jump || is_call || is_ret || is_syscall_or_trap;

    let operands = detail
        .as_ref()
        .map(|d| {
            d.arch_detail()
                .operands()
                .iter()
                .take(3)
                .map(classify_operand)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let is_fixed_destination_jump =
        (is_jump || is_call) && is_branch_relative && operands.iter().any(|o| matches!(o, Operand::Immediate(_)));

    Instruction::new(
        address,
        length,
        mnemonic,
        operands,
        is_branch,
        is_call,
        is_fixed_destination_jump,
        is_ret,
        is_syscall_or_trap,
    )
}

fn classify_operand(op: &ArchOperand) -> Operand {
    match op {
        ArchOperand::X86Operand(x86_op) => match x86_op.op_type {
            X86OperandType::Imm(v) => Operand::Immediate(v),
            X86OperandType::Reg(r) => Operand::Register(r.0),
            X86OperandType::Mem(_) => Operand::Memory,
            _ => Operand::RegisterOrMemory,
        },
        _ => Operand::RegisterOrMemory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_addr::PAGE_SIZE;

    fn nop_nop_ret() -> [u8; 3] {
        [0x90, 0x90, 0xC3]
    }

    fn setup() -> (Arc<Vmm>, GuestAddr) {
        let vmm = Arc::new(Vmm::new(GuestAddr::new(0), GuestAddr::new(0x0001_0000_0000)));
        let base = vmm
            .mmap(None, PAGE_SIZE, Permission::READ | Permission::WRITE | Permission::EXEC, false, "code")
            .unwrap();
        vmm.write_sized(base, &nop_nop_ret()).unwrap();
        (vmm, base)
    }

    #[test]
    fn fetches_and_caches_a_basic_block() {
        let (vmm, base) = setup();
        let dbbc = Dbbc::new(vmm).unwrap();
        let block = dbbc.get_basic_block(base).unwrap();
        assert_eq!(block.instructions().len(), 3);
        assert!(block.instructions().last().unwrap().is_ret());
    }

    #[test]
    fn invalidates_on_exec_loss() {
        let (vmm, base) = setup();
        let dbbc = Arc::new(Dbbc::new(vmm.clone()).unwrap());
        vmm.add_observer(dbbc.clone());
        dbbc.get_basic_block(base).unwrap();
        assert_eq!(dbbc.cached_section_count(), 1);
        vmm.mprotect(base, PAGE_SIZE, Permission::READ | Permission::WRITE).unwrap();
        assert_eq!(dbbc.cached_section_count(), 0);
        assert!(matches!(dbbc.get_basic_block(base), Err(DbbcError::NotExecutable(_))));
    }

    #[test]
    fn determinism_across_repeated_calls() {
        let (vmm, base) = setup();
        let dbbc = Dbbc::new(vmm).unwrap();
        let first = dbbc.get_basic_block(base).unwrap();
        let second = dbbc.get_basic_block(base).unwrap();
        assert_eq!(first.instructions().len(), second.instructions().len());
    }
}
