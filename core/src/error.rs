//! Top-level error taxonomy, aggregating each subsystem's errors and tagging
//! whether a caller should treat the failure as fatal (fault-class) or
//! report it to the guest as an errno (errno-class).

use emu_dbbc::DbbcError;
use emu_sched::SchedError;
use emu_vmm::VmmError;

/// Any error the emulator core can raise, aggregated from its three
/// subsystems.
#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    /// A virtual memory manager error.
    #[error(transparent)]
    Vmm(#[from] VmmError),
    /// A disassembly cache error.
    #[error(transparent)]
    Dbbc(#[from] DbbcError),
    /// A scheduler error.
    #[error(transparent)]
    Sched(#[from] SchedError),
}

impl EmuError {
    /// Whether this error should be treated as fatal to the whole emulator
    /// (fault-class, e.g. `SchedError::Inconsistent`) rather than reported
    /// back to the guest as a syscall errno (errno-class, e.g.
    /// `VmmError::PermissionDenied`).
    ///
    /// Mirrors the reference implementation's split between conditions that
    /// abort the emulator process and conditions a syscall handler
    /// translates into a negative return value.
    pub fn is_fault(&self) -> bool {
        match self {
            EmuError::Vmm(_) => false,
            EmuError::Dbbc(e) => matches!(e, DbbcError::DisassemblyFailed(_, _)),
            EmuError::Sched(_) => true,
        }
    }

    /// The Linux errno this error maps to when reported to the guest, or
    /// `None` for a fault-class error that has no errno meaning.
    pub fn errno(&self) -> Option<i32> {
        match self {
            EmuError::Vmm(e) => Some(match e {
                VmmError::OutOfMemory => 12,              // ENOMEM
                VmmError::Unmapped(_) => 14,              // EFAULT
                VmmError::PermissionDenied(_) => 13,      // EACCES
                VmmError::NoSuchRegion => 22,             // EINVAL
                VmmError::Overlap => 16,                  // EBUSY
                VmmError::Hole => 14,                     // EFAULT
                VmmError::ExecUnmapRequiresExplicit => 22, // EINVAL
                VmmError::InvalidAddress => 22,           // EINVAL
                VmmError::CrossRegionSpanTooWide(_, _) => 14, // EFAULT
            }),
            EmuError::Dbbc(e) => match e {
                DbbcError::NotExecutable(_) => Some(14), // EFAULT
                DbbcError::Unmapped(_) => Some(14),      // EFAULT
                DbbcError::EmptyPrefix(_) => Some(14),   // EFAULT
                DbbcError::DisassemblyFailed(_, _) => None,
            },
            EmuError::Sched(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_addr::GuestAddr;

    #[test]
    fn vmm_errors_are_errno_class() {
        let err = EmuError::from(VmmError::PermissionDenied(GuestAddr::new(0x1000)));
        assert!(!err.is_fault());
        assert_eq!(err.errno(), Some(13));
    }

    #[test]
    fn scheduler_errors_are_fault_class() {
        let err = EmuError::from(SchedError::Deadlock);
        assert!(err.is_fault());
        assert_eq!(err.errno(), None);
    }
}
