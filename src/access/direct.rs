//! Fast state access
//!
//! Mutates the machine state in place and uses the TLB. This is the backend
//! behind `run`; nothing is recorded.

use std::convert::Infallible;

use super::{StateAccess, TlbHit};
use crate::devices::htif;
use crate::merkle::PAGE_SIZE;
use crate::state::{MachineState, TlbSet, TLB_SIZE};

pub struct DirectAccess<'a> {
    s: &'a mut MachineState,
}

impl<'a> DirectAccess<'a> {
    pub fn new(s: &'a mut MachineState) -> Self {
        DirectAccess { s }
    }
}

macro_rules! direct_reg_ro {
    ($read:ident, $($field:ident).+) => {
        fn $read(&mut self) -> Result<u64, Infallible> {
            Ok(self.s.$($field).+)
        }
    };
}

macro_rules! direct_reg {
    ($read:ident, $write:ident, $($field:ident).+) => {
        fn $read(&mut self) -> Result<u64, Infallible> {
            Ok(self.s.$($field).+)
        }
        fn $write(&mut self, val: u64) -> Result<(), Infallible> {
            self.s.$($field).+ = val;
            Ok(())
        }
    };
}

impl StateAccess for DirectAccess<'_> {
    type Error = Infallible;

    fn read_x(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self.s.x[i])
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), Infallible> {
        debug_assert!(i != 0);
        self.s.x[i] = val;
        Ok(())
    }

    direct_reg!(read_pc, write_pc, pc);
    direct_reg!(read_mcycle, write_mcycle, mcycle);
    direct_reg!(read_minstret, write_minstret, minstret);
    direct_reg!(read_mstatus, write_mstatus, mstatus);
    direct_reg!(read_mtvec, write_mtvec, mtvec);
    direct_reg!(read_mscratch, write_mscratch, mscratch);
    direct_reg!(read_mepc, write_mepc, mepc);
    direct_reg!(read_mcause, write_mcause, mcause);
    direct_reg!(read_mtval, write_mtval, mtval);
    direct_reg!(read_misa, write_misa, misa);
    direct_reg!(read_mie, write_mie, mie);
    direct_reg!(read_mip, write_mip, mip);
    direct_reg!(read_medeleg, write_medeleg, medeleg);
    direct_reg!(read_mideleg, write_mideleg, mideleg);
    direct_reg!(read_mcounteren, write_mcounteren, mcounteren);
    direct_reg!(read_stvec, write_stvec, stvec);
    direct_reg!(read_sscratch, write_sscratch, sscratch);
    direct_reg!(read_sepc, write_sepc, sepc);
    direct_reg!(read_scause, write_scause, scause);
    direct_reg!(read_stval, write_stval, stval);
    direct_reg!(read_satp, write_satp, satp);
    direct_reg!(read_scounteren, write_scounteren, scounteren);
    direct_reg!(read_ilrsc, write_ilrsc, ilrsc);
    direct_reg!(read_clint_mtimecmp, write_clint_mtimecmp, clint.mtimecmp);
    direct_reg!(read_htif_tohost, write_htif_tohost, htif.tohost);
    direct_reg!(read_htif_fromhost, write_htif_fromhost, htif.fromhost);
    direct_reg_ro!(read_htif_ihalt, htif.ihalt);
    direct_reg_ro!(read_htif_iconsole, htif.iconsole);
    direct_reg_ro!(read_htif_iyield, htif.iyield);

    fn read_mvendorid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::shadow::MVENDORID)
    }

    fn read_marchid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::shadow::MARCHID)
    }

    fn read_mimpid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::shadow::MIMPID)
    }

    fn read_iflags_prv(&mut self) -> Result<u8, Infallible> {
        Ok(self.s.iflags.prv)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), Infallible> {
        self.s.iflags.prv = val & 3;
        Ok(())
    }

    fn read_iflags_i(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.i)
    }

    fn set_iflags_i(&mut self) -> Result<(), Infallible> {
        self.s.iflags.i = true;
        Ok(())
    }

    fn reset_iflags_i(&mut self) -> Result<(), Infallible> {
        self.s.iflags.i = false;
        Ok(())
    }

    fn read_iflags_y(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.y)
    }

    fn set_iflags_y(&mut self) -> Result<(), Infallible> {
        self.s.iflags.y = true;
        Ok(())
    }

    fn reset_iflags_y(&mut self) -> Result<(), Infallible> {
        self.s.iflags.y = false;
        Ok(())
    }

    fn read_iflags_h(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.h)
    }

    fn set_iflags_h(&mut self) -> Result<(), Infallible> {
        self.s.iflags.h = true;
        Ok(())
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self.s.pmas.get(i).map_or(0, |pma| pma.istart()))
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self.s.pmas.get(i).map_or(0, |pma| pma.ilength()))
    }

    fn pma_unpack_error(&mut self, index: usize, reason: &'static str) -> Infallible {
        unreachable!("registered PMA {index} failed to unpack: {reason}");
    }

    fn read_memory(&mut self, paddr: u64, pma_index: usize, size_log2: u32) -> Result<u64, Infallible> {
        Ok(self.s.pma_read(pma_index, paddr, size_log2))
    }

    fn write_memory(
        &mut self,
        paddr: u64,
        pma_index: usize,
        val: u64,
        size_log2: u32,
    ) -> Result<(), Infallible> {
        self.s.pma_write(pma_index, paddr, val, size_log2);
        Ok(())
    }

    fn console_putchar(&mut self, ch: u8) {
        htif::host_putchar(ch);
    }

    fn tlb_lookup(&mut self, set: TlbSet, vaddr: u64) -> Option<TlbHit> {
        let idx = ((vaddr >> 12) as usize) & (TLB_SIZE - 1);
        let entry = self.s.tlb_set(set)[idx];
        if entry.vaddr_page == vaddr & !(PAGE_SIZE as u64 - 1) {
            Some(TlbHit { paddr_page: entry.paddr_page, pma_index: entry.pma_index })
        } else {
            None
        }
    }

    fn tlb_replace(&mut self, set: TlbSet, vaddr_page: u64, paddr_page: u64, pma_index: usize) {
        let idx = ((vaddr_page >> 12) as usize) & (TLB_SIZE - 1);
        self.s.tlb_set(set)[idx] =
            crate::state::TlbEntry { vaddr_page, paddr_page, pma_index };
    }

    fn flush_tlb(&mut self) {
        self.s.init_tlb();
    }

    fn flush_tlb_vaddr(&mut self, vaddr: u64) {
        self.s.flush_tlb_vaddr(vaddr);
    }

    fn get_brk(&self) -> bool {
        self.s.get_brk()
    }

    fn set_brk(&mut self) {
        self.s.set_brk();
    }

    fn or_brk_with_mip_mie(&mut self) {
        self.s.or_brk_with_mip_mie();
    }

    fn or_brk_with_iflags_h(&mut self) {
        self.s.or_brk_with_iflags_h();
    }

    fn or_brk_with_iflags_y(&mut self) {
        self.s.or_brk_with_iflags_y();
    }

    fn set_brk_from_all(&mut self) {
        self.s.set_brk_from_all();
    }

    fn is_done(&mut self, mcycle_end: u64) -> bool {
        self.s.is_done(mcycle_end)
    }
}
