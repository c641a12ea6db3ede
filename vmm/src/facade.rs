//! # VMM Facade
//!
//! [`Vmm`] is the single entry point the rest of the emulator talks to:
//! `mmap`/`munmap`/`mprotect`/`brk` for address-space shape, sized
//! read/write for guest memory access, and an observer hook so the
//! disassembly cache can invalidate itself when code memory changes
//! shape or loses EXEC.

use crate::region::{Permission, Region, RegionStore, RegionStoreError};
use crate::lookup::PageLookup;
use emu_addr::{page_round_up, GuestAddr, PAGE_SIZE};
use std::sync::{Arc, RwLock};

/// Errors raised by the VMM facade.
#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    /// No free range of the requested size exists.
    #[error("out of address space")]
    OutOfMemory,
    /// `addr` is not mapped.
    #[error("address {0:x} is not mapped")]
    Unmapped(GuestAddr),
    /// The access violates the region's permissions.
    #[error("access to {0:x} denied by region permissions")]
    PermissionDenied(GuestAddr),
    /// No region matches the requested selector (e.g. `brk` with no heap).
    #[error("no such region")]
    NoSuchRegion,
    /// The requested mapping would overlap an existing one.
    #[error("region overlaps an existing mapping")]
    Overlap,
    /// The requested range is not fully mapped (a hole exists inside it).
    #[error("range contains an unmapped hole")]
    Hole,
    /// `munmap` was asked to unmap executable memory directly; the caller
    /// must `mprotect` away EXEC first so the disassembly cache is notified.
    #[error("cannot munmap executable memory directly; mprotect away EXEC first")]
    ExecUnmapRequiresExplicit,
    /// The address or length is invalid (e.g. below the null-page guard).
    #[error("invalid address or length")]
    InvalidAddress,
    /// A sub-128-bit access spans more than one region.
    #[error("access at {0:x} of width {1} spans more than one region")]
    CrossRegionSpanTooWide(GuestAddr, u32),
}

/// Observes structural changes to a [`Vmm`]'s address space.
///
/// Default method bodies are no-ops so implementors only need to override
/// the events they care about. Callbacks run after the mutation has
/// completed and the VMM's internal lock has been released, so an observer
/// may freely call back into read-only `Vmm` methods (but must not attempt
/// to mutate the address space from inside the callback).
pub trait VmmObserver: Send + Sync {
    /// A region spanning `[base, base+length)` was created with `prot`.
    fn on_region_creation(&self, base: GuestAddr, length: u64, prot: Permission) {
        let _ = (base, length, prot);
    }

    /// A region's permissions changed from `before` to `after`.
    fn on_region_protection_change(
        &self,
        base: GuestAddr,
        length: u64,
        before: Permission,
        after: Permission,
    ) {
        let _ = (base, length, before, after);
    }

    /// A region spanning `[base, base+length)` (which had `prot`) was torn down.
    fn on_region_destruction(&self, base: GuestAddr, length: u64, prot: Permission) {
        let _ = (base, length, prot);
    }
}

enum Event {
    Creation(GuestAddr, u64, Permission),
    ProtectionChange(GuestAddr, u64, Permission, Permission),
    Destruction(GuestAddr, u64, Permission),
}

struct Inner {
    regions: RegionStore,
    lookup: PageLookup,
}

/// The guest's virtual address space: one per emulated process.
pub struct Vmm {
    inner: RwLock<Inner>,
    observers: RwLock<Vec<Arc<dyn VmmObserver>>>,
    user_start: GuestAddr,
    user_end: GuestAddr,
}

impl Vmm {
    /// Construct an empty address space spanning `[user_start, user_end)`,
    /// reserving page zero so a null-hint mmap never lands there.
    pub fn new(user_start: GuestAddr, user_end: GuestAddr) -> Self {
        Self {
            inner: RwLock::new(Inner { regions: RegionStore::new(), lookup: PageLookup::new() }),
            observers: RwLock::new(Vec::new()),
            user_start,
            user_end,
        }
    }

    /// Register an observer; it receives every subsequent structural event.
    pub fn add_observer(&self, observer: Arc<dyn VmmObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().unwrap().clone();
        for event in events {
            for obs in &observers {
                match event {
                    Event::Creation(base, len, prot) => obs.on_region_creation(base, len, prot),
                    Event::ProtectionChange(base, len, before, after) => {
                        obs.on_region_protection_change(base, len, before, after)
                    }
                    Event::Destruction(base, len, prot) => obs.on_region_destruction(base, len, prot),
                }
            }
        }
    }

    /// Map `length` bytes (rounded up to a page) with `prot`, at `hint` if
    /// given and `fixed`, or at the first sufficiently large gap otherwise.
    pub fn mmap(
        &self,
        hint: Option<GuestAddr>,
        length: u64,
        prot: Permission,
        fixed: bool,
        name: impl Into<String>,
    ) -> Result<GuestAddr, VmmError> {
        let length = page_round_up(length.max(1));
        let name = name.into();
        let mut inner = self.inner.write().unwrap();

        let base = match (hint, fixed) {
            (Some(hint), true) => {
                if hint < self.user_start || hint.saturating_add(length) > self.user_end {
                    return Err(VmmError::InvalidAddress);
                }
                if inner
                    .regions
                    .regions_overlapping(hint, length)
                    .iter()
                    .any(|r| r.perms().contains(Permission::EXEC))
                {
                    return Err(VmmError::ExecUnmapRequiresExplicit);
                }
                let region = Region::new(hint, length, prot, name);
                inner.regions.add_fixed(region);
                inner.lookup.set_region(inner.regions.find_containing(hint).unwrap());
                hint
            }
            (Some(hint), false) => {
                let region = Region::new(hint, length, prot, name);
                inner.regions.add(region).map_err(map_region_err)?;
                inner.lookup.set_region(inner.regions.find_containing(hint).unwrap());
                hint
            }
            (None, _) => {
                let found = find_free_range(&inner.regions, self.user_start, self.user_end, length)
                    .ok_or(VmmError::OutOfMemory)?;
                let region = Region::new(found, length, prot, name);
                inner.regions.add(region).map_err(map_region_err)?;
                inner.lookup.set_region(inner.regions.find_containing(found).unwrap());
                found
            }
        };

        inner.regions.merge();
        // Re-sync lookup after merge since merge may have re-keyed storage.
        if let Some(r) = inner.regions.find_containing(base) {
            inner.lookup.set_region(r);
        }
        drop(inner);
        self.notify(vec![Event::Creation(base, length, prot)]);
        Ok(base)
    }

    /// Unmap `[addr, addr+length)`. Executable memory cannot be unmapped
    /// directly; `mprotect` away EXEC first so the disassembly cache sees
    /// the loss of EXEC and invalidates before the bytes disappear.
    pub fn munmap(&self, addr: GuestAddr, length: u64) -> Result<(), VmmError> {
        let length = page_round_up(length.max(1));
        let mut inner = self.inner.write().unwrap();

        let overlapping = inner.regions.regions_overlapping(addr, length);
        if overlapping.iter().any(|r| r.perms().contains(Permission::EXEC)) {
            return Err(VmmError::ExecUnmapRequiresExplicit);
        }

        inner.regions.split(addr);
        inner.regions.split(addr.saturating_add(length));

        let mut events = Vec::new();
        let covered: Vec<(GuestAddr, u64)> = inner
            .regions
            .regions_overlapping(addr, length)
            .iter()
            .map(|r| (r.base(), r.length()))
            .collect();
        for (base, len) in covered {
            if let Some(region) = inner.regions.take_by_base(base, len) {
                inner.lookup.clear_region(&region);
                events.push(Event::Destruction(region.base(), region.length(), region.perms()));
            }
        }
        inner.regions.merge();
        drop(inner);
        self.notify(events);
        Ok(())
    }

    /// Change permissions over `[addr, addr+length)`, which must be fully
    /// mapped with no gaps.
    pub fn mprotect(&self, addr: GuestAddr, length: u64, prot: Permission) -> Result<(), VmmError> {
        let length = page_round_up(length.max(1));
        let mut inner = self.inner.write().unwrap();

        let range_end = addr.saturating_add(length);
        let mapped_len: u64 = inner
            .regions
            .regions_overlapping(addr, length)
            .iter()
            .map(|r| {
                let lo = r.base().max(addr);
                let hi = r.end().min(range_end);
                hi.as_u64().saturating_sub(lo.as_u64())
            })
            .sum();
        if mapped_len < length {
            return Err(VmmError::Hole);
        }

        inner.regions.split(addr);
        inner.regions.split(addr.saturating_add(length));

        let mut events = Vec::new();
        let bases: Vec<(GuestAddr, u64, Permission)> = inner
            .regions
            .regions_overlapping(addr, length)
            .iter()
            .map(|r| (r.base(), r.length(), r.perms()))
            .collect();
        for (base, len, before) in bases {
            inner.regions.set_perms(base, prot).map_err(map_region_err)?;
            if let Some(r) = inner.regions.find_containing(base) {
                inner.lookup.set_region(r);
            }
            if before != prot {
                events.push(Event::ProtectionChange(base, len, before, prot));
            }
        }
        inner.regions.merge();
        drop(inner);
        self.notify(events);
        Ok(())
    }

    /// Grow the break past `new` if given, or report the current break if
    /// `new` is `None`. Shrinking is not supported and is a no-op that
    /// returns the unchanged current break, matching the reference
    /// implementation's documented behaviour.
    pub fn brk(&self, new: Option<GuestAddr>) -> Result<GuestAddr, VmmError> {
        let mut inner = self.inner.write().unwrap();
        let heap = inner.regions.find_by_name("heap").ok_or(VmmError::NoSuchRegion)?;
        let current_end = heap.end();
        let Some(new) = new else {
            return Ok(current_end);
        };
        let result = inner.regions.grow_heap(new).ok_or(VmmError::NoSuchRegion)?;
        if let Some(r) = inner.regions.find_by_name("heap") {
            let r = r.base();
            if let Some(r) = inner.regions.find_containing(r) {
                inner.lookup.set_region(r);
            }
        }
        Ok(result)
    }

    /// Read `width_bytes` from `addr`, which must lie entirely within one
    /// readable region except at width 16 (128-bit), which may span two
    /// consecutive regions.
    pub fn read_sized(&self, addr: GuestAddr, width_bytes: u32) -> Result<Vec<u8>, VmmError> {
        let inner = self.inner.read().unwrap();
        let spans = self.bulk_spans(&inner, addr, u64::from(width_bytes))?;
        if spans.len() > 1 && width_bytes != 16 {
            return Err(VmmError::CrossRegionSpanTooWide(addr, width_bytes));
        }
        let mut out = Vec::with_capacity(width_bytes as usize);
        for (region_base, offset, len) in spans {
            let region =
                inner.regions.find_containing(region_base).ok_or(VmmError::Unmapped(addr))?;
            if !region.perms().contains(Permission::READ) {
                return Err(VmmError::PermissionDenied(addr));
            }
            let bytes = region.bytes().ok_or(VmmError::Unmapped(addr))?;
            out.extend_from_slice(&bytes[offset as usize..offset as usize + len as usize]);
        }
        Ok(out)
    }

    /// Write `data` to `addr`; same one-or-two-region rule as [`Self::read_sized`].
    pub fn write_sized(&self, addr: GuestAddr, data: &[u8]) -> Result<(), VmmError> {
        let width = data.len() as u32;
        let mut inner = self.inner.write().unwrap();
        let spans = self.bulk_spans(&inner, addr, u64::from(width))?;
        if spans.len() > 1 && width != 16 {
            return Err(VmmError::CrossRegionSpanTooWide(addr, width));
        }
        let mut written = 0usize;
        for (region_base, offset, len) in spans {
            let region = inner
                .regions
                .find_containing_mut(region_base)
                .ok_or(VmmError::Unmapped(addr))?;
            if !region.perms().contains(Permission::WRITE) {
                return Err(VmmError::PermissionDenied(addr));
            }
            let bytes = region.bytes_mut().ok_or(VmmError::Unmapped(addr))?;
            bytes[offset as usize..offset as usize + len as usize]
                .copy_from_slice(&data[written..written + len as usize]);
            written += len as usize;
        }
        Ok(())
    }

    /// Copy `len` bytes from the guest into `dst`, crossing as many regions
    /// as necessary (used for bulk transfers like `memcpy` emulation, not
    /// subject to the two-region limit sized access obeys).
    pub fn copy_from_mmu(&self, addr: GuestAddr, dst: &mut [u8]) -> Result<(), VmmError> {
        let inner = self.inner.read().unwrap();
        let mut remaining = dst.len() as u64;
        let mut cursor = addr;
        let mut written = 0usize;
        while remaining > 0 {
            let region = inner.regions.find_containing(cursor).ok_or(VmmError::Unmapped(cursor))?;
            if !region.perms().contains(Permission::READ) {
                return Err(VmmError::PermissionDenied(cursor));
            }
            let offset = (cursor - region.base()) as usize;
            let avail = (region.length() as usize - offset) as u64;
            let take = remaining.min(avail);
            let bytes = region.bytes().ok_or(VmmError::Unmapped(cursor))?;
            dst[written..written + take as usize]
                .copy_from_slice(&bytes[offset..offset + take as usize]);
            written += take as usize;
            remaining -= take;
            cursor = cursor.saturating_add(take);
        }
        Ok(())
    }

    /// Copy `src` into the guest, crossing as many regions as necessary.
    pub fn copy_to_mmu(&self, addr: GuestAddr, src: &[u8]) -> Result<(), VmmError> {
        let mut inner = self.inner.write().unwrap();
        let mut remaining = src.len() as u64;
        let mut cursor = addr;
        let mut read = 0usize;
        while remaining > 0 {
            let region =
                inner.regions.find_containing_mut(cursor).ok_or(VmmError::Unmapped(cursor))?;
            if !region.perms().contains(Permission::WRITE) {
                return Err(VmmError::PermissionDenied(cursor));
            }
            let offset = (cursor - region.base()) as usize;
            let avail = (region.length() as usize - offset) as u64;
            let take = remaining.min(avail);
            let bytes = region.bytes_mut().ok_or(VmmError::Unmapped(cursor))?;
            bytes[offset..offset + take as usize]
                .copy_from_slice(&src[read..read + take as usize]);
            read += take as usize;
            remaining -= take;
            cursor = cursor.saturating_add(take);
        }
        Ok(())
    }

    /// Whether `addr` is currently readable.
    pub fn is_readable(&self, addr: GuestAddr) -> bool {
        self.inner.read().unwrap().lookup.read_ptr(addr).is_some()
    }

    /// A snapshot of every mapped region's `(base, length, perms, name)`, in
    /// address order. Used by address-space-cloning collaborators (process
    /// fork) that need to replay the whole mapping elsewhere.
    pub fn region_snapshot(&self) -> Vec<(GuestAddr, u64, Permission, String)> {
        self.inner
            .read()
            .unwrap()
            .regions
            .iter()
            .map(|r| (r.base(), r.length(), r.perms(), r.name().to_string()))
            .collect()
    }

    /// Whether `addr` is currently executable.
    pub fn is_executable(&self, addr: GuestAddr) -> bool {
        self.inner
            .read()
            .unwrap()
            .regions
            .find_containing(addr)
            .is_some_and(|r| r.perms().contains(Permission::EXEC))
    }

    /// Compute the 1-or-2-region decomposition of `[addr, addr+len)` as
    /// `(region_base, offset_in_region, sub_len)` triples.
    fn bulk_spans(
        &self,
        inner: &Inner,
        addr: GuestAddr,
        len: u64,
    ) -> Result<Vec<(GuestAddr, u64, u64)>, VmmError> {
        let mut spans = Vec::new();
        let mut remaining = len;
        let mut cursor = addr;
        while remaining > 0 {
            let region = inner.regions.find_containing(cursor).ok_or(VmmError::Unmapped(cursor))?;
            let offset = cursor - region.base();
            let avail = region.length() - offset;
            let take = remaining.min(avail);
            spans.push((region.base(), offset, take));
            remaining -= take;
            cursor = cursor.saturating_add(take);
            if spans.len() > 2 {
                return Err(VmmError::CrossRegionSpanTooWide(addr, len as u32));
            }
        }
        Ok(spans)
    }
}

fn map_region_err(err: RegionStoreError) -> VmmError {
    match err {
        RegionStoreError::Overlap => VmmError::Overlap,
        RegionStoreError::NotFound => VmmError::NoSuchRegion,
    }
}

fn find_free_range(
    regions: &RegionStore,
    user_start: GuestAddr,
    user_end: GuestAddr,
    length: u64,
) -> Option<GuestAddr> {
    let mut cursor = user_start.saturating_add(PAGE_SIZE); // keep page zero reserved
    for region in regions.iter() {
        if region.base() >= cursor && region.base().as_u64() - cursor.as_u64() >= length {
            return Some(cursor);
        }
        if region.end() > cursor {
            cursor = region.end();
        }
    }
    if user_end.as_u64().saturating_sub(cursor.as_u64()) >= length {
        Some(cursor)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmm() -> Vmm {
        Vmm::new(GuestAddr::new(0), GuestAddr::new(0x0001_0000_0000))
    }

    #[test]
    fn sized_round_trip_all_widths() {
        let vmm = vmm();
        let base = vmm.mmap(None, 0x2000, Permission::READ | Permission::WRITE, false, "rw").unwrap();
        for width in [1u32, 2, 4, 8, 16] {
            let data: Vec<u8> = (0..width as u8).collect();
            vmm.write_sized(base, &data).unwrap();
            let read = vmm.read_sized(base, width).unwrap();
            assert_eq!(read, data);
        }
    }

    #[test]
    fn unaligned_128_may_cross_one_boundary() {
        let vmm = vmm();
        let a = vmm.mmap(None, PAGE_SIZE, Permission::READ | Permission::WRITE, false, "a").unwrap();
        let b = vmm.mmap(Some(a.saturating_add(PAGE_SIZE)), PAGE_SIZE, Permission::READ | Permission::WRITE, true, "b").unwrap();
        let straddle = a.saturating_add(PAGE_SIZE - 8);
        let data = vec![0xAB; 16];
        vmm.write_sized(straddle, &data).unwrap();
        let read = vmm.read_sized(straddle, 16).unwrap();
        assert_eq!(read, data);
        let _ = b;
    }

    #[test]
    fn scenario_mmap_mprotect_rw_to_r() {
        let vmm = vmm();
        let base = vmm.mmap(None, 8192, Permission::READ | Permission::WRITE, false, "heap-like").unwrap();
        vmm.write_sized(base, &42u32.to_le_bytes()).unwrap();
        vmm.mprotect(base, 8192, Permission::READ).unwrap();
        let read = u32::from_le_bytes(vmm.read_sized(base, 4).unwrap().try_into().unwrap());
        assert_eq!(read, 42);
        assert!(vmm.write_sized(base, &1u32.to_le_bytes()).is_err());
    }

    #[test]
    fn scenario_brk_growth_and_shrink_noop() {
        let vmm = vmm();
        let heap_base =
            vmm.mmap(None, 0x1000, Permission::READ | Permission::WRITE, false, "heap").unwrap();
        let grown = vmm.brk(Some(heap_base.saturating_add(0x3000))).unwrap();
        assert_eq!(grown, heap_base.saturating_add(0x3000));
        let shrink = vmm.brk(Some(heap_base)).unwrap();
        assert_eq!(shrink, heap_base.saturating_add(0x3000));
    }

    #[test]
    fn munmap_refuses_exec_without_mprotect() {
        let vmm = vmm();
        let base = vmm.mmap(None, PAGE_SIZE, Permission::READ | Permission::EXEC, false, "code").unwrap();
        assert!(matches!(vmm.munmap(base, PAGE_SIZE), Err(VmmError::ExecUnmapRequiresExplicit)));
        vmm.mprotect(base, PAGE_SIZE, Permission::READ).unwrap();
        assert!(vmm.munmap(base, PAGE_SIZE).is_ok());
    }

    #[test]
    fn observer_sees_destruction_after_unlock() {
        struct Counter(std::sync::atomic::AtomicU32);
        impl VmmObserver for Counter {
            fn on_region_destruction(&self, _base: GuestAddr, _length: u64, _prot: Permission) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let vmm = vmm();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicU32::new(0)));
        vmm.add_observer(counter.clone());
        let base = vmm.mmap(None, PAGE_SIZE, Permission::READ, false, "tmp").unwrap();
        vmm.munmap(base, PAGE_SIZE).unwrap();
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn mprotect_over_a_hole_fails() {
        let vmm = vmm();
        let base = vmm.mmap(None, PAGE_SIZE, Permission::READ, false, "a").unwrap();
        assert!(matches!(
            vmm.mprotect(base, PAGE_SIZE * 2, Permission::READ | Permission::WRITE),
            Err(VmmError::Hole)
        ));
    }
}
