//! Sv39/Sv48 address translation
//!
//! Page-table walk with PTE A/D update via read-modify-write on the table
//! page. The walk reads and writes page-table memory through the state
//! access, so every PTE touched by a logged step carries a proof.

use super::csr::*;
use crate::access::StateAccess;
use crate::pma::PmaKind;
use crate::state::{PRV_M, PRV_S, PRV_U};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAccess {
    Fetch,
    Load,
    Store,
}

impl VmAccess {
    pub fn page_fault_cause(self) -> u64 {
        match self {
            VmAccess::Fetch => CAUSE_FETCH_PAGE_FAULT,
            VmAccess::Load => CAUSE_LOAD_PAGE_FAULT,
            VmAccess::Store => CAUSE_STORE_PAGE_FAULT,
        }
    }

    pub fn access_fault_cause(self) -> u64 {
        match self {
            VmAccess::Fetch => CAUSE_INSN_ACCESS_FAULT,
            VmAccess::Load => CAUSE_LOAD_ACCESS_FAULT,
            VmAccess::Store => CAUSE_STORE_ACCESS_FAULT,
        }
    }

    pub fn misaligned_cause(self) -> u64 {
        match self {
            VmAccess::Fetch => CAUSE_INSN_ADDRESS_MISALIGNED,
            VmAccess::Load => CAUSE_LOAD_ADDRESS_MISALIGNED,
            VmAccess::Store => CAUSE_STORE_ADDRESS_MISALIGNED,
        }
    }
}

/// Translates a virtual address, returning the physical address or `None`
/// on a page fault.
pub fn translate_virtual_address<A: StateAccess>(
    a: &mut A,
    vaddr: u64,
    access: VmAccess,
) -> Result<Option<u64>, A::Error> {
    let mut prv = a.read_iflags_prv()?;
    let mstatus = a.read_mstatus()?;

    // MPRV redirects data accesses to the MPP privilege; fetches ignore it.
    if access != VmAccess::Fetch && mstatus & MSTATUS_MPRV != 0 {
        prv = ((mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT) as u8;
    }
    if prv == PRV_M {
        return Ok(Some(vaddr));
    }

    let satp = a.read_satp()?;
    let levels = match satp >> SATP_MODE_SHIFT {
        SATP_MODE_BARE => return Ok(Some(vaddr)),
        SATP_MODE_SV39 => 3u32,
        SATP_MODE_SV48 => 4u32,
        _ => return Ok(None),
    };

    // The virtual address must be correctly sign-extended.
    let va_bits = 12 + 9 * levels;
    let shift = 64 - va_bits;
    if (((vaddr as i64) << shift) >> shift) as u64 != vaddr {
        return Ok(None);
    }

    let mut pte_addr = (satp & SATP_PPN_MASK) << 12;
    for i in (0..levels).rev() {
        let vpn = (vaddr >> (12 + 9 * i)) & 0x1FF;
        pte_addr += vpn * 8;

        // Page tables can only live in plain memory.
        let view = a.find_pma_entry(pte_addr, 8)?;
        if view.kind != PmaKind::Memory {
            return Ok(None);
        }
        let pte = a.read_memory(pte_addr, view.index, 3)?;

        if pte & PTE_V == 0 {
            return Ok(None);
        }
        let xwr = (pte >> 1) & 7;
        if xwr == 0 {
            pte_addr = ((pte >> PTE_PPN_SHIFT) & SATP_PPN_MASK) << 12;
            continue;
        }
        // Writable-but-not-readable is reserved.
        if xwr & 0b010 != 0 && xwr & 0b001 == 0 {
            return Ok(None);
        }

        let u_page = pte & PTE_U != 0;
        match prv {
            PRV_U => {
                if !u_page {
                    return Ok(None);
                }
            }
            PRV_S => {
                // S-mode never executes from U pages and only touches
                // their data under SUM.
                if u_page && (access == VmAccess::Fetch || mstatus & MSTATUS_SUM == 0) {
                    return Ok(None);
                }
            }
            _ => {}
        }
        let allowed = match access {
            VmAccess::Fetch => xwr & 0b100 != 0,
            VmAccess::Load => xwr & 0b001 != 0 || (xwr & 0b100 != 0 && mstatus & MSTATUS_MXR != 0),
            VmAccess::Store => xwr & 0b010 != 0,
        };
        if !allowed {
            return Ok(None);
        }

        let ppn = (pte >> PTE_PPN_SHIFT) & SATP_PPN_MASK;
        // A superpage leaf must have its low PPN bits clear.
        if i > 0 && ppn & ((1u64 << (9 * i)) - 1) != 0 {
            return Ok(None);
        }

        // Set A (and D on stores) atomically on the table page.
        let mut new_pte = pte | PTE_A;
        if access == VmAccess::Store {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            a.write_memory(pte_addr, view.index, new_pte, 3)?;
        }

        let vmask = (1u64 << (12 + 9 * i)) - 1;
        return Ok(Some(((ppn << 12) & !vmask) | (vaddr & vmask)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DirectAccess;
    use crate::pma::{PmaEntry, PMA_RAM_START};
    use crate::state::MachineState;

    fn unerr<T>(r: Result<T, std::convert::Infallible>) -> T {
        match r {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    fn machine_with_ram(len: u64) -> MachineState {
        let mut state = MachineState::new();
        state.register_pma(PmaEntry::ram(PMA_RAM_START, len).unwrap()).unwrap();
        state
    }

    fn write_pte(state: &mut MachineState, paddr: u64, pte: u64) {
        let index = state.find_pma_index(paddr, 8).unwrap();
        state.pma_write(index, paddr, pte, 3);
    }

    #[test]
    fn machine_mode_is_untranslated() {
        let mut state = machine_with_ram(0x4000);
        state.satp = SATP_MODE_SV39 << SATP_MODE_SHIFT;
        let mut a = DirectAccess::new(&mut state);
        assert_eq!(unerr(translate_virtual_address(&mut a, 0x1234, VmAccess::Load)), Some(0x1234));
    }

    #[test]
    fn sv39_full_walk() {
        let mut state = machine_with_ram(0x10000);
        // Three-level walk to a 4 KiB page at vaddr with vpn2=0, vpn1=2,
        // vpn0=0.
        let root = PMA_RAM_START;
        let table1 = PMA_RAM_START + 0x1000;
        let table0 = PMA_RAM_START + 0x2000;
        let data_page = PMA_RAM_START + 0x3000;
        write_pte(&mut state, root, (table1 >> 12) << PTE_PPN_SHIFT | PTE_V);
        write_pte(&mut state, table1 + 2 * 8, (table0 >> 12) << PTE_PPN_SHIFT | PTE_V);
        write_pte(
            &mut state,
            table0,
            (data_page >> 12) << PTE_PPN_SHIFT | PTE_V | PTE_R | PTE_W | PTE_X,
        );
        state.satp = (SATP_MODE_SV39 << SATP_MODE_SHIFT) | (root >> 12);
        state.iflags.prv = PRV_S;

        let mut a = DirectAccess::new(&mut state);
        let vaddr = 2 << 21; // vpn1 = 2
        assert_eq!(
            unerr(translate_virtual_address(&mut a, vaddr | 0x123, VmAccess::Load)),
            Some(data_page + 0x123)
        );
        // The walk set A on the leaf PTE.
        let pte = state.read_word(table0).unwrap();
        assert_ne!(pte & PTE_A, 0);
        assert_eq!(pte & PTE_D, 0);

        // A store also sets D.
        let mut a = DirectAccess::new(&mut state);
        assert!(unerr(translate_virtual_address(&mut a, vaddr, VmAccess::Store)).is_some());
        let pte = state.read_word(table0).unwrap();
        assert_ne!(pte & PTE_D, 0);
    }

    #[test]
    fn user_page_blocked_for_s_without_sum() {
        let mut state = machine_with_ram(0x10000);
        let root = PMA_RAM_START;
        let table1 = PMA_RAM_START + 0x1000;
        let table0 = PMA_RAM_START + 0x2000;
        let data_page = PMA_RAM_START + 0x3000;
        write_pte(&mut state, root, (table1 >> 12) << PTE_PPN_SHIFT | PTE_V);
        write_pte(&mut state, table1, (table0 >> 12) << PTE_PPN_SHIFT | PTE_V);
        write_pte(
            &mut state,
            table0,
            (data_page >> 12) << PTE_PPN_SHIFT | PTE_V | PTE_R | PTE_X | PTE_U,
        );
        state.satp = (SATP_MODE_SV39 << SATP_MODE_SHIFT) | (root >> 12);
        state.iflags.prv = PRV_S;

        let mut a = DirectAccess::new(&mut state);
        assert_eq!(unerr(translate_virtual_address(&mut a, 0, VmAccess::Load)), None);

        state.mstatus |= MSTATUS_SUM;
        let mut a = DirectAccess::new(&mut state);
        assert_eq!(unerr(translate_virtual_address(&mut a, 0, VmAccess::Load)), Some(data_page));
        // Fetching from a U page in S mode fails even under SUM.
        state.mstatus |= MSTATUS_MXR;
        let mut a = DirectAccess::new(&mut state);
        assert_eq!(unerr(translate_virtual_address(&mut a, 0, VmAccess::Fetch)), None);
    }

    #[test]
    fn badly_sign_extended_vaddr_faults() {
        let mut state = machine_with_ram(0x4000);
        state.satp = (SATP_MODE_SV39 << SATP_MODE_SHIFT) | (PMA_RAM_START >> 12);
        state.iflags.prv = PRV_S;
        let mut a = DirectAccess::new(&mut state);
        assert_eq!(
            unerr(translate_virtual_address(&mut a, 1 << 45, VmAccess::Load)),
            None
        );
    }
}
