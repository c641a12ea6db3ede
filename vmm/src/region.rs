//! # Region Store
//!
//! Owns the set of mapped [`Region`]s for one address space: an ordered,
//! non-overlapping collection split and merged as permissions and mappings
//! change.

use emu_addr::GuestAddr;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Permissions a [`Region`] grants the guest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
    }
}

/// A page-aligned, contiguous, same-permission, same-name span of the guest
/// address space.
///
/// Invariant (iv): any region with READ or WRITE holds a byte buffer of
/// exactly `length` bytes; a region with no permissions may omit it.
#[derive(Debug, Clone)]
pub struct Region {
    base: GuestAddr,
    length: u64,
    perms: Permission,
    name: String,
    bytes: Option<Box<[u8]>>,
}

impl Region {
    /// Construct a region, zero-initialising its backing storage if it is
    /// readable or writable.
    pub fn new(base: GuestAddr, length: u64, perms: Permission, name: impl Into<String>) -> Self {
        let bytes = if perms.intersects(Permission::READ | Permission::WRITE) {
            Some(vec![0u8; length as usize].into_boxed_slice())
        } else {
            None
        };
        Self { base, length, perms, name: name.into(), bytes }
    }

    /// Base address (page-aligned).
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// Length in bytes (a page multiple).
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Exclusive end address.
    pub fn end(&self) -> GuestAddr {
        self.base.saturating_add(self.length)
    }

    /// Current permission set.
    pub fn perms(&self) -> Permission {
        self.perms
    }

    /// Region name (e.g. `"heap"`, `"[anon]"`, an ELF section name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `addr` falls within `[base, end)`.
    pub fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether `[base, end)` overlaps `other`'s span at all.
    pub fn overlaps(&self, other_base: GuestAddr, other_len: u64) -> bool {
        let other_end = other_base.saturating_add(other_len);
        self.base < other_end && other_base < self.end()
    }

    /// Raw pointer to byte `offset` in this region's backing storage, if any.
    pub(crate) fn byte_ptr(&self) -> Option<*mut u8> {
        self.bytes.as_ref().map(|b| b.as_ptr() as *mut u8)
    }

    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.bytes.as_deref_mut()
    }

    fn set_perms(&mut self, perms: Permission) {
        // Gaining READ/WRITE on a region that lost its buffer (both permissions
        // dropped earlier) would need fresh zeroed storage; in practice this
        // only happens via mprotect, which never clears the buffer once a
        // region owns one, so we keep any storage we already have.
        if self.bytes.is_none() && perms.intersects(Permission::READ | Permission::WRITE) {
            self.bytes = Some(vec![0u8; self.length as usize].into_boxed_slice());
        }
        self.perms = perms;
    }

    fn mergeable_with(&self, next: &Region) -> bool {
        self.end() == next.base && self.perms == next.perms && self.name == next.name
    }

    /// Split this region at `addr`, returning the right-hand half. `addr`
    /// must lie strictly inside the region.
    fn split_at(&mut self, addr: GuestAddr) -> Region {
        debug_assert!(addr > self.base && addr < self.end());
        let right_len = self.end() - addr;
        let right_bytes = self.bytes.as_ref().map(|b| {
            let off = (addr - self.base) as usize;
            b[off..].to_vec().into_boxed_slice()
        });
        let right = Region {
            base: addr,
            length: right_len,
            perms: self.perms,
            name: self.name.clone(),
            bytes: right_bytes,
        };
        self.length = addr - self.base;
        if let Some(b) = &self.bytes {
            self.bytes = Some(b[..self.length as usize].to_vec().into_boxed_slice());
        }
        right
    }
}

/// Errors raised purely by region-store bookkeeping.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegionStoreError {
    /// The requested span overlaps an already-mapped region.
    #[error("region overlaps an existing mapping")]
    Overlap,
    /// No region with that base/name exists.
    #[error("no such region")]
    NotFound,
}

/// The ordered collection of [`Region`]s that make up one address space.
///
/// Kept as a `BTreeMap` keyed by base address so containment lookup,
/// in-order iteration, and split-point lookup are all O(log n).
#[derive(Default)]
pub struct RegionStore {
    regions: BTreeMap<u64, Region>,
}

impl RegionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self { regions: BTreeMap::new() }
    }

    /// Insert `region` if it does not overlap any existing region.
    pub fn add(&mut self, region: Region) -> Result<(), RegionStoreError> {
        if self.overlaps_any(region.base(), region.length()) {
            return Err(RegionStoreError::Overlap);
        }
        self.regions.insert(region.base().as_u64(), region);
        Ok(())
    }

    /// Insert `region`, first splitting any overlapping neighbours at its
    /// boundaries and removing whatever is fully covered by its span.
    /// Returns the permissions of every region that was fully or partially
    /// displaced, for the caller's policy checks (e.g. refusing to displace
    /// executable memory implicitly).
    pub fn add_fixed(&mut self, region: Region) -> Vec<Permission> {
        let base = region.base();
        let end = region.end();
        self.split(base);
        self.split(end);
        let mut displaced = Vec::new();
        let covered: Vec<u64> = self
            .regions
            .range(..)
            .filter(|(_, r)| r.base() >= base && r.end() <= end)
            .map(|(&k, r)| {
                displaced.push(r.perms());
                k
            })
            .collect();
        for k in covered {
            self.regions.remove(&k);
        }
        self.regions.insert(base.as_u64(), region);
        displaced
    }

    /// Remove and return the region exactly matching `base`/`size`.
    pub fn take_by_base(&mut self, base: GuestAddr, size: u64) -> Option<Region> {
        let region = self.regions.get(&base.as_u64())?;
        if region.length() != size {
            return None;
        }
        self.regions.remove(&base.as_u64())
    }

    /// Remove and return the (first) region with the given name.
    pub fn take_by_name(&mut self, name: &str) -> Option<Region> {
        let key = *self.regions.iter().find(|(_, r)| r.name() == name)?.0;
        self.regions.remove(&key)
    }

    /// Find the region containing `addr`, if any.
    pub fn find_containing(&self, addr: GuestAddr) -> Option<&Region> {
        self.regions
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    /// Mutable variant of [`Self::find_containing`].
    pub fn find_containing_mut(&mut self, addr: GuestAddr) -> Option<&mut Region> {
        let key = *self
            .regions
            .range(..=addr.as_u64())
            .next_back()
            .map(|(k, _)| k)?;
        self.regions.get_mut(&key).filter(|r| r.contains(addr))
    }

    /// Find the region with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&Region> {
        self.regions.values().find(|r| r.name() == name)
    }

    /// All regions whose span intersects `[base, base+len)`, in address order.
    pub fn regions_overlapping(&self, base: GuestAddr, len: u64) -> Vec<&Region> {
        self.regions.values().filter(|r| r.overlaps(base, len)).collect()
    }

    fn overlaps_any(&self, base: GuestAddr, len: u64) -> bool {
        self.regions.values().any(|r| r.overlaps(base, len))
    }

    /// If `addr` lies strictly inside a region, split it in two at `addr`.
    /// No-op if `addr` is a region boundary or unmapped.
    pub fn split(&mut self, addr: GuestAddr) {
        let Some(key) = self
            .regions
            .range(..addr.as_u64())
            .next_back()
            .map(|(&k, _)| k)
        else {
            return;
        };
        let region = self.regions.get_mut(&key).unwrap();
        if addr <= region.base() || addr >= region.end() {
            return;
        }
        let right = region.split_at(addr);
        self.regions.insert(right.base().as_u64(), right);
    }

    /// Mutate the permission set of the region based at `base`.
    pub fn set_perms(&mut self, base: GuestAddr, perms: Permission) -> Result<(), RegionStoreError> {
        let region = self.regions.get_mut(&base.as_u64()).ok_or(RegionStoreError::NotFound)?;
        region.set_perms(perms);
        Ok(())
    }

    /// Sweep adjacent region pairs and fuse any that share `end == base`,
    /// permissions, and name.
    pub fn merge(&mut self) {
        loop {
            let bases: Vec<u64> = self.regions.keys().copied().collect();
            let mut merged_any = false;
            for pair in bases.windows(2) {
                let (a_key, b_key) = (pair[0], pair[1]);
                let mergeable = match (self.regions.get(&a_key), self.regions.get(&b_key)) {
                    (Some(a), Some(b)) => a.mergeable_with(b),
                    _ => false,
                };
                if mergeable {
                    let b = self.regions.remove(&b_key).unwrap();
                    let a = self.regions.get_mut(&a_key).unwrap();
                    a.length += b.length;
                    if let (Some(ab), Some(bb)) = (&mut a.bytes, b.bytes) {
                        ab.to_mut_vec_extend(&bb);
                        let _ = bb;
                    }
                    merged_any = true;
                    break;
                }
            }
            if !merged_any {
                break;
            }
        }
    }

    /// Grow the region named `"heap"` to end at `new_end`, if that does not
    /// overlap any other mapped region. Returns the resulting heap end
    /// (unchanged if growth was rejected or `new_end` is not past the
    /// current end — shrinking is not supported).
    pub fn grow_heap(&mut self, new_end: GuestAddr) -> Option<GuestAddr> {
        let base = self.find_by_name("heap")?.base();
        let current_end = self.find_by_name("heap")?.end();
        if new_end <= current_end {
            return Some(current_end);
        }
        let grown_len = new_end - base;
        let would_overlap = self
            .regions
            .values()
            .filter(|r| r.name() != "heap")
            .any(|r| r.overlaps(current_end, new_end - current_end));
        if would_overlap {
            return Some(current_end);
        }
        let heap = self.regions.get_mut(&base.as_u64())?;
        if let Some(b) = &mut heap.bytes {
            let mut v = b.to_vec();
            v.resize(grown_len as usize, 0);
            heap.bytes = Some(v.into_boxed_slice());
        }
        heap.length = grown_len;
        Some(new_end)
    }

    /// Iterate regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }
}

trait BoxSliceExt {
    fn to_mut_vec_extend(&mut self, extra: &[u8]);
}

impl BoxSliceExt for Box<[u8]> {
    fn to_mut_vec_extend(&mut self, extra: &[u8]) {
        let mut v = self.to_vec();
        v.extend_from_slice(extra);
        *self = v.into_boxed_slice();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(base: u64, len: u64, perms: Permission, name: &str) -> Region {
        Region::new(GuestAddr::new(base), len, perms, name)
    }

    #[test]
    fn add_rejects_overlap() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x1000, Permission::READ, "a")).unwrap();
        assert_eq!(
            store.add(mk(0x1800, 0x1000, Permission::READ, "b")),
            Err(RegionStoreError::Overlap)
        );
    }

    #[test]
    fn split_then_merge_round_trips() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x3000, Permission::READ | Permission::WRITE, "a")).unwrap();
        store.split(GuestAddr::new(0x2000));
        assert_eq!(store.iter().count(), 2);
        store.merge();
        assert_eq!(store.iter().count(), 1);
        assert_eq!(store.iter().next().unwrap().length(), 0x3000);
    }

    #[test]
    fn merge_requires_matching_name_and_perms() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x1000, Permission::READ, "a")).unwrap();
        store.add(mk(0x2000, 0x1000, Permission::READ, "b")).unwrap();
        store.merge();
        assert_eq!(store.iter().count(), 2);
    }

    #[test]
    fn add_fixed_splits_and_erases_covered() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x3000, Permission::READ, "a")).unwrap();
        let displaced = store.add_fixed(mk(0x1800, 0x1000, Permission::READ | Permission::WRITE, "b"));
        assert_eq!(displaced, vec![Permission::READ]);
        // left remainder [0x1000,0x1800) and right remainder [0x2800,0x4000) remain.
        assert_eq!(store.iter().count(), 3);
    }

    #[test]
    fn grow_heap_rejects_overlap() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x1000, Permission::READ | Permission::WRITE, "heap")).unwrap();
        store.add(mk(0x3000, 0x1000, Permission::READ, "mapped")).unwrap();
        let result = store.grow_heap(GuestAddr::new(0x4000));
        assert_eq!(result, Some(GuestAddr::new(0x2000)));
    }

    #[test]
    fn grow_heap_no_op_when_shrinking() {
        let mut store = RegionStore::new();
        store.add(mk(0x1000, 0x2000, Permission::READ | Permission::WRITE, "heap")).unwrap();
        assert_eq!(store.grow_heap(GuestAddr::new(0x1000)), Some(GuestAddr::new(0x3000)));
    }
}
