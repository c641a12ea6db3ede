//! Executable section storage: the three synchronized views the original
//! disassembly cache kept (an owning list, a by-begin index, a by-end
//! index), collapsed here into two `BTreeMap`s since `Arc` sharing makes
//! a separate owning list unnecessary.

use crate::instruction::Instruction;
use emu_addr::GuestAddr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A disassembled, trimmed run of instructions: `[begin, end)` in the guest
/// address space, ending at a branch whenever trimming succeeded.
#[derive(Debug)]
pub struct ExecutableSection {
    begin: GuestAddr,
    end: GuestAddr,
    origin_name: String,
    instructions: Vec<Instruction>,
}

impl ExecutableSection {
    pub(crate) fn new(origin_name: String, instructions: Vec<Instruction>) -> Self {
        let begin = instructions.first().map(Instruction::address).unwrap_or(GuestAddr::NULL);
        let end = instructions.last().map(Instruction::next_address).unwrap_or(begin);
        Self { begin, end, origin_name, instructions }
    }

    /// Start of the section.
    pub fn begin(&self) -> GuestAddr {
        self.begin
    }

    /// End of the section (next-address of the last instruction).
    pub fn end(&self) -> GuestAddr {
        self.end
    }

    /// Name of the region this section was disassembled from.
    pub fn origin_name(&self) -> &str {
        &self.origin_name
    }

    /// Decoded instructions, in ascending address order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Whether `addr` falls within `[begin, end)`.
    pub fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Index of the instruction starting exactly at `addr`, if one exists.
    pub fn instruction_at(&self, addr: GuestAddr) -> Option<usize> {
        // Instructions are address-sorted; binary search for the boundary.
        self.instructions
            .binary_search_by(|ins| ins.address().as_u64().cmp(&addr.as_u64()))
            .ok()
    }
}

/// Sorted, dual-indexed store of [`ExecutableSection`]s.
#[derive(Default)]
pub struct SectionStore {
    by_begin: BTreeMap<u64, Arc<ExecutableSection>>,
    by_end: BTreeMap<u64, Arc<ExecutableSection>>,
}

impl SectionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self { by_begin: BTreeMap::new(), by_end: BTreeMap::new() }
    }

    /// Insert a freshly disassembled section.
    pub fn insert(&mut self, section: Arc<ExecutableSection>) {
        self.by_begin.insert(section.begin().as_u64(), section.clone());
        self.by_end.insert(section.end().as_u64(), section);
    }

    /// The section whose `[begin, end)` contains `addr`, found in O(log n)
    /// via the by-end index (first section ending strictly after `addr`).
    pub fn containing(&self, addr: GuestAddr) -> Option<Arc<ExecutableSection>> {
        self.by_end
            .range(addr.as_u64() + 1..)
            .next()
            .map(|(_, s)| s.clone())
            .filter(|s| s.contains(addr))
    }

    /// The first section whose begin is `>= addr`, used to cap disassembly
    /// ranges so a fresh fetch never overlaps already-cached bytes.
    pub fn next_begin_at_or_after(&self, addr: GuestAddr) -> Option<GuestAddr> {
        self.by_begin.range(addr.as_u64()..).next().map(|(&k, _)| GuestAddr::new(k))
    }

    /// Remove every section fully contained within `[base, base+length)`.
    /// Used on invalidation: loss of EXEC permission or region destruction.
    pub fn remove_fully_within(&mut self, base: GuestAddr, length: u64) {
        let range_end = base.saturating_add(length);
        let doomed: Vec<u64> = self
            .by_begin
            .iter()
            .filter(|(_, s)| s.begin() >= base && s.end() <= range_end)
            .map(|(&k, _)| k)
            .collect();
        for key in doomed {
            if let Some(section) = self.by_begin.remove(&key) {
                self.by_end.remove(&section.end().as_u64());
            }
        }
    }

    /// Remove whatever section (if any) overlaps `[begin, end)`, used to
    /// keep the global order intact before inserting a freshly-decoded
    /// section over previously-cached bytes.
    pub fn remove_overlapping(&mut self, begin: GuestAddr, end: GuestAddr) {
        let doomed: Vec<u64> = self
            .by_begin
            .iter()
            .filter(|(_, s)| s.begin() < end && begin < s.end())
            .map(|(&k, _)| k)
            .collect();
        for key in doomed {
            if let Some(section) = self.by_begin.remove(&key) {
                self.by_end.remove(&section.end().as_u64());
            }
        }
    }

    /// Number of cached sections.
    pub fn len(&self) -> usize {
        self.by_begin.len()
    }

    /// Whether the store holds no sections.
    pub fn is_empty(&self) -> bool {
        self.by_begin.is_empty()
    }
}
