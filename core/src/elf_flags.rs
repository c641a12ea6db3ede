//! The one fact about ELF this crate owns: mapping a program header's
//! `PF_R`/`PF_W`/`PF_X` flags onto the VMM's [`Permission`] set. Parsing the
//! ELF file itself is a loader's job and stays out of scope here.

use emu_vmm::Permission;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Convert an ELF program header's `p_flags` into the VMM's permission bits.
pub fn permission_from_elf_flags(p_flags: u32) -> Permission {
    let mut perms = Permission::empty();
    if p_flags & PF_R != 0 {
        perms |= Permission::READ;
    }
    if p_flags & PF_W != 0 {
        perms |= Permission::WRITE;
    }
    if p_flags & PF_X != 0 {
        perms |= Permission::EXEC;
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_rx_text_segment() {
        assert_eq!(permission_from_elf_flags(PF_R | PF_X), Permission::READ | Permission::EXEC);
    }

    #[test]
    fn maps_rw_data_segment() {
        assert_eq!(permission_from_elf_flags(PF_R | PF_W), Permission::READ | Permission::WRITE);
    }

    #[test]
    fn maps_no_access() {
        assert_eq!(permission_from_elf_flags(0), Permission::empty());
    }
}
