//! # Guest Address & Time Primitives
//!
//! Small, dependency-free types shared by every emulator crate: the guest
//! virtual address newtype used throughout the VMM/DBBC/scheduler, the page
//! size constants they all agree on, and the monotonic timestamp type the
//! scheduler's timed blockers compare against.

#![warn(missing_docs)]

use core::fmt;
use core::ops::{Add, Sub};

/// Page size in bytes (4 KiB, matching the System V x86-64 ABI).
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`, used to turn an address into a page index.
pub const PAGE_SHIFT: u32 = 12;

/// A guest virtual address.
///
/// Architecture-independent in name only: this repository only targets
/// AMD64 guests, but keeping the address behind a newtype (rather than a
/// bare `u64`) keeps guest and host pointer arithmetic from being mixed up
/// by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GuestAddr(u64);

impl GuestAddr {
    /// The null guest page; mmap requests landing here are rejected.
    pub const NULL: Self = Self(0);

    /// Wrap a raw guest address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Get the raw address as a `usize` (for indexing host buffers).
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Page index (`addr >> PAGE_SHIFT`) this address falls in.
    #[inline]
    pub const fn page_index(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Offset within this address's page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Whether this address is aligned to `align` (which must be a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Round this address up to the next multiple of `align`.
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Round this address down to a multiple of `align`.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add a byte offset, saturating instead of wrapping past `u64::MAX`.
    #[inline]
    pub const fn saturating_add(self, offset: u64) -> Self {
        Self(self.0.saturating_add(offset))
    }
}

impl fmt::LowerHex for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for GuestAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<u64> for GuestAddr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self {
        Self(self.0 - rhs)
    }
}

impl Sub<GuestAddr> for GuestAddr {
    type Output = u64;
    fn sub(self, rhs: GuestAddr) -> u64 {
        self.0 - rhs.0
    }
}

/// Round `len` up to a page multiple.
#[inline]
pub const fn page_round_up(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A monotonic (seconds, nanoseconds) timestamp, comparable across the
/// scheduler's `Sleep` blockers and whatever `TimeSource` produced them.
///
/// Saturating arithmetic: a deadline computed from a guest-supplied
/// relative timeout can never panic the host by overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PreciseTime {
    /// Whole seconds.
    pub seconds: u64,
    /// Nanoseconds within the current second, in `[0, 1_000_000_000)`.
    pub nanos: u32,
}

const NANOS_PER_SEC: u32 = 1_000_000_000;

impl PreciseTime {
    /// Construct from a seconds/nanoseconds pair, normalizing overflowing nanos.
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        let extra_secs = (nanos / NANOS_PER_SEC) as u64;
        Self {
            seconds: seconds.saturating_add(extra_secs),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    /// The zero timestamp.
    pub const ZERO: Self = Self { seconds: 0, nanos: 0 };

    /// Add a duration, saturating at `u64::MAX` seconds.
    pub const fn saturating_add(self, other: PreciseTime) -> Self {
        let mut nanos = self.nanos + other.nanos;
        let mut carry = 0u64;
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            carry = 1;
        }
        Self {
            seconds: self.seconds.saturating_add(other.seconds).saturating_add(carry),
            nanos,
        }
    }

    /// Construct from a whole number of milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis / 1000, ((millis % 1000) * 1_000_000) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_index_and_offset_round_trip() {
        let a = GuestAddr::new(0x12345);
        assert_eq!(a.page_index(), 0x12);
        assert_eq!(a.page_offset(), 0x345);
    }

    #[test]
    fn align_up_down() {
        let a = GuestAddr::new(0x1001);
        assert_eq!(a.align_down(PAGE_SIZE), GuestAddr::new(0x1000));
        assert_eq!(a.align_up(PAGE_SIZE), GuestAddr::new(0x2000));
        assert!(GuestAddr::new(0x1000).is_aligned(PAGE_SIZE));
        assert!(!a.is_aligned(PAGE_SIZE));
    }

    #[test]
    fn page_round_up_exact_multiple_is_unchanged() {
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE + 1), PAGE_SIZE * 2);
    }

    #[test]
    fn precise_time_orders_and_saturates() {
        let a = PreciseTime::new(1, 500_000_000);
        let b = PreciseTime::new(2, 0);
        assert!(a < b);
        let sum = a.saturating_add(a);
        assert_eq!(sum, PreciseTime::new(3, 0));
        let huge = PreciseTime::new(u64::MAX, 0);
        assert_eq!(huge.saturating_add(PreciseTime::new(1, 0)).seconds, u64::MAX);
    }

    #[test]
    fn from_millis() {
        assert_eq!(PreciseTime::from_millis(1500), PreciseTime::new(1, 500_000_000));
    }
}
