//! Logging state access
//!
//! Drives the machine state exactly like the fast backend, while recording
//! every word access in order. The first mention of every address is a read
//! provable against the root in effect at that moment; writes update the
//! Merkle tree page immediately so later proofs anchor in the evolved root.

use std::convert::Infallible;

use super::log::{AccessLog, AccessType, Bracket, BracketType, LogType, WordAccess};
use super::StateAccess;
use crate::devices::htif;
use crate::merkle::{Hash, MerkleTree, PAGE_SIZE, LOG2_WORD_SIZE};
use crate::pma::{PMA_CLINT_START, PMA_HTIF_START, PMA_SHADOW_START};
use crate::shadow;
use crate::state::{
    MachineState, IFLAGS_H_MASK, IFLAGS_I_MASK, IFLAGS_PRV_MASK, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK,
};

pub struct LoggedAccess<'a> {
    s: &'a mut MachineState,
    tree: &'a mut MerkleTree,
    log: AccessLog,
    root: Hash,
}

impl<'a> LoggedAccess<'a> {
    /// The tree must reflect the current machine state; every proof in the
    /// log anchors in its root.
    pub fn new(s: &'a mut MachineState, tree: &'a mut MerkleTree, log_type: LogType) -> Self {
        let root = tree.root_hash();
        LoggedAccess { s, tree, log: AccessLog::new(log_type), root }
    }

    /// Consumes the backend, returning the log and the final root.
    pub fn finish(self) -> (AccessLog, Hash) {
        (self.log, self.root)
    }

    fn note_of(&self, text: &'static str) -> Option<String> {
        if self.log.log_type.annotations {
            Some(text.to_owned())
        } else {
            None
        }
    }

    fn log_read(&mut self, paligned: u64, val: u64, text: &'static str) {
        debug_assert_eq!(paligned & 7, 0);
        let proof = if self.log.log_type.proofs {
            let proof = self
                .tree
                .get_proof(paligned, LOG2_WORD_SIZE)
                .expect("word addresses are proof-aligned");
            debug_assert_eq!(proof.root_hash, self.root);
            Some(proof)
        } else {
            None
        };
        self.log.accesses.push(WordAccess {
            access_type: AccessType::Read,
            address: paligned,
            read: val,
            written: val,
            proof,
            note: self.note_of(text),
        });
    }

    fn log_write(&mut self, paligned: u64, old: u64, new: u64, text: &'static str) {
        debug_assert_eq!(paligned & 7, 0);
        let proof = if self.log.log_type.proofs {
            let proof = self
                .tree
                .get_proof(paligned, LOG2_WORD_SIZE)
                .expect("word addresses are proof-aligned");
            debug_assert_eq!(proof.root_hash, self.root);
            Some(proof)
        } else {
            None
        };
        self.log.accesses.push(WordAccess {
            access_type: AccessType::Write,
            address: paligned,
            read: old,
            written: new,
            proof,
            note: self.note_of(text),
        });
    }

    /// Re-hashes the page holding `paddr` after a state mutation, advancing
    /// the rolling root.
    fn update_tree_page(&mut self, paddr: u64) {
        let index = self
            .s
            .find_pma_index(paddr, 8)
            .expect("written word belongs to a registered range");
        let pma_start = self.s.pmas[index].start();
        let page_offset = (paddr - pma_start) & !(PAGE_SIZE as u64 - 1);
        let mut scratch = [0u8; PAGE_SIZE];
        if let Some(page) = self.s.peek_page(index, page_offset, &mut scratch) {
            let page: &[u8; PAGE_SIZE] = page.try_into().expect("peek returns whole pages");
            self.tree.update_page(pma_start + page_offset, page);
        }
        self.root = self.tree.root_hash();
    }

    fn read_iflags(&mut self, text: &'static str) -> u64 {
        let val = self.s.read_iflags();
        self.log_read(PMA_SHADOW_START + shadow::offset::IFLAGS, val, text);
        val
    }

    fn write_iflags(&mut self, new: u64, text: &'static str) {
        let addr = PMA_SHADOW_START + shadow::offset::IFLAGS;
        let old = self.s.read_iflags();
        self.log_write(addr, old, new, text);
        self.s.write_iflags(new);
        self.update_tree_page(addr);
    }
}

macro_rules! logged_csr_ro {
    ($read:ident, $($field:ident).+, $off:expr, $note:literal) => {
        fn $read(&mut self) -> Result<u64, Infallible> {
            let val = self.s.$($field).+;
            self.log_read($off, val, $note);
            Ok(val)
        }
    };
}

macro_rules! logged_csr {
    ($read:ident, $write:ident, $($field:ident).+, $off:expr, $note:literal) => {
        fn $read(&mut self) -> Result<u64, Infallible> {
            let val = self.s.$($field).+;
            self.log_read($off, val, $note);
            Ok(val)
        }
        fn $write(&mut self, val: u64) -> Result<(), Infallible> {
            let old = self.s.$($field).+;
            self.log_write($off, old, val, $note);
            self.s.$($field).+ = val;
            self.update_tree_page($off);
            Ok(())
        }
    };
}

impl StateAccess for LoggedAccess<'_> {
    type Error = Infallible;

    const ANNOTATIONS: bool = true;

    fn push_bracket(&mut self, bracket_type: BracketType, text: &str) {
        if self.log.log_type.annotations {
            self.log.brackets.push(Bracket {
                bracket_type,
                r#where: self.log.accesses.len(),
                text: text.to_owned(),
            });
        }
    }

    fn make_scoped_note(&mut self, text: &str) {
        if self.log.log_type.annotations {
            self.log.notes.push(text.to_owned());
        }
    }

    fn read_x(&mut self, i: usize) -> Result<u64, Infallible> {
        let val = self.s.x[i];
        self.log_read(PMA_SHADOW_START + shadow::register_rel_addr(i), val, "x");
        Ok(val)
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), Infallible> {
        debug_assert!(i != 0);
        let addr = PMA_SHADOW_START + shadow::register_rel_addr(i);
        let old = self.s.x[i];
        self.log_write(addr, old, val, "x");
        self.s.x[i] = val;
        self.update_tree_page(addr);
        Ok(())
    }

    logged_csr!(read_pc, write_pc, pc, PMA_SHADOW_START + shadow::offset::PC, "pc");
    logged_csr!(read_mcycle, write_mcycle, mcycle, PMA_SHADOW_START + shadow::offset::MCYCLE, "mcycle");
    logged_csr!(read_minstret, write_minstret, minstret, PMA_SHADOW_START + shadow::offset::MINSTRET, "minstret");
    logged_csr!(read_mstatus, write_mstatus, mstatus, PMA_SHADOW_START + shadow::offset::MSTATUS, "mstatus");
    logged_csr!(read_mtvec, write_mtvec, mtvec, PMA_SHADOW_START + shadow::offset::MTVEC, "mtvec");
    logged_csr!(read_mscratch, write_mscratch, mscratch, PMA_SHADOW_START + shadow::offset::MSCRATCH, "mscratch");
    logged_csr!(read_mepc, write_mepc, mepc, PMA_SHADOW_START + shadow::offset::MEPC, "mepc");
    logged_csr!(read_mcause, write_mcause, mcause, PMA_SHADOW_START + shadow::offset::MCAUSE, "mcause");
    logged_csr!(read_mtval, write_mtval, mtval, PMA_SHADOW_START + shadow::offset::MTVAL, "mtval");
    logged_csr!(read_misa, write_misa, misa, PMA_SHADOW_START + shadow::offset::MISA, "misa");
    logged_csr!(read_mie, write_mie, mie, PMA_SHADOW_START + shadow::offset::MIE, "mie");
    logged_csr!(read_mip, write_mip, mip, PMA_SHADOW_START + shadow::offset::MIP, "mip");
    logged_csr!(read_medeleg, write_medeleg, medeleg, PMA_SHADOW_START + shadow::offset::MEDELEG, "medeleg");
    logged_csr!(read_mideleg, write_mideleg, mideleg, PMA_SHADOW_START + shadow::offset::MIDELEG, "mideleg");
    logged_csr!(read_mcounteren, write_mcounteren, mcounteren, PMA_SHADOW_START + shadow::offset::MCOUNTEREN, "mcounteren");
    logged_csr!(read_stvec, write_stvec, stvec, PMA_SHADOW_START + shadow::offset::STVEC, "stvec");
    logged_csr!(read_sscratch, write_sscratch, sscratch, PMA_SHADOW_START + shadow::offset::SSCRATCH, "sscratch");
    logged_csr!(read_sepc, write_sepc, sepc, PMA_SHADOW_START + shadow::offset::SEPC, "sepc");
    logged_csr!(read_scause, write_scause, scause, PMA_SHADOW_START + shadow::offset::SCAUSE, "scause");
    logged_csr!(read_stval, write_stval, stval, PMA_SHADOW_START + shadow::offset::STVAL, "stval");
    logged_csr!(read_satp, write_satp, satp, PMA_SHADOW_START + shadow::offset::SATP, "satp");
    logged_csr!(read_scounteren, write_scounteren, scounteren, PMA_SHADOW_START + shadow::offset::SCOUNTEREN, "scounteren");
    logged_csr!(read_ilrsc, write_ilrsc, ilrsc, PMA_SHADOW_START + shadow::offset::ILRSC, "ilrsc");
    logged_csr!(read_clint_mtimecmp, write_clint_mtimecmp, clint.mtimecmp, PMA_CLINT_START + crate::devices::clint::CLINT_MTIMECMP_REL_ADDR, "clint.mtimecmp");
    logged_csr!(read_htif_tohost, write_htif_tohost, htif.tohost, PMA_HTIF_START + htif::HTIF_TOHOST_REL_ADDR, "htif.tohost");
    logged_csr!(read_htif_fromhost, write_htif_fromhost, htif.fromhost, PMA_HTIF_START + htif::HTIF_FROMHOST_REL_ADDR, "htif.fromhost");
    logged_csr_ro!(read_htif_ihalt, htif.ihalt, PMA_HTIF_START + htif::HTIF_IHALT_REL_ADDR, "htif.ihalt");
    logged_csr_ro!(read_htif_iconsole, htif.iconsole, PMA_HTIF_START + htif::HTIF_ICONSOLE_REL_ADDR, "htif.iconsole");
    logged_csr_ro!(read_htif_iyield, htif.iyield, PMA_HTIF_START + htif::HTIF_IYIELD_REL_ADDR, "htif.iyield");

    fn read_mvendorid(&mut self) -> Result<u64, Infallible> {
        let val = shadow::MVENDORID;
        self.log_read(PMA_SHADOW_START + shadow::offset::MVENDORID, val, "mvendorid");
        Ok(val)
    }

    fn read_marchid(&mut self) -> Result<u64, Infallible> {
        let val = shadow::MARCHID;
        self.log_read(PMA_SHADOW_START + shadow::offset::MARCHID, val, "marchid");
        Ok(val)
    }

    fn read_mimpid(&mut self) -> Result<u64, Infallible> {
        let val = shadow::MIMPID;
        self.log_read(PMA_SHADOW_START + shadow::offset::MIMPID, val, "mimpid");
        Ok(val)
    }

    fn read_iflags_prv(&mut self) -> Result<u8, Infallible> {
        let iflags = self.read_iflags("iflags.PRV");
        Ok(((iflags & IFLAGS_PRV_MASK) >> IFLAGS_PRV_SHIFT) as u8)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.PRV (superfluous)");
        let new = (old & !IFLAGS_PRV_MASK) | (((val as u64) << IFLAGS_PRV_SHIFT) & IFLAGS_PRV_MASK);
        self.write_iflags(new, "iflags.PRV");
        Ok(())
    }

    fn read_iflags_i(&mut self) -> Result<bool, Infallible> {
        Ok(self.read_iflags("iflags.I") & IFLAGS_I_MASK != 0)
    }

    fn set_iflags_i(&mut self) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.I (superfluous)");
        self.write_iflags(old | IFLAGS_I_MASK, "iflags.I");
        Ok(())
    }

    fn reset_iflags_i(&mut self) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.I (superfluous)");
        self.write_iflags(old & !IFLAGS_I_MASK, "iflags.I");
        Ok(())
    }

    fn read_iflags_y(&mut self) -> Result<bool, Infallible> {
        Ok(self.read_iflags("iflags.Y") & IFLAGS_Y_MASK != 0)
    }

    fn set_iflags_y(&mut self) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.Y (superfluous)");
        self.write_iflags(old | IFLAGS_Y_MASK, "iflags.Y");
        Ok(())
    }

    fn reset_iflags_y(&mut self) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.Y (superfluous)");
        self.write_iflags(old & !IFLAGS_Y_MASK, "iflags.Y");
        Ok(())
    }

    fn read_iflags_h(&mut self) -> Result<bool, Infallible> {
        Ok(self.read_iflags("iflags.H") & IFLAGS_H_MASK != 0)
    }

    fn set_iflags_h(&mut self) -> Result<(), Infallible> {
        let old = self.read_iflags("iflags.H (superfluous)");
        self.write_iflags(old | IFLAGS_H_MASK, "iflags.H");
        Ok(())
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, Infallible> {
        let val = self.s.pmas.get(i).map_or(0, |pma| pma.istart());
        self.log_read(PMA_SHADOW_START + shadow::pma_rel_addr(i), val, "pma.istart");
        Ok(val)
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, Infallible> {
        let val = self.s.pmas.get(i).map_or(0, |pma| pma.ilength());
        self.log_read(PMA_SHADOW_START + shadow::pma_rel_addr(i) + 8, val, "pma.ilength");
        Ok(val)
    }

    fn pma_unpack_error(&mut self, index: usize, reason: &'static str) -> Infallible {
        unreachable!("registered PMA {index} failed to unpack: {reason}");
    }

    fn read_memory(&mut self, paddr: u64, pma_index: usize, size_log2: u32) -> Result<u64, Infallible> {
        let paligned = paddr & !7;
        let val64 = self.s.pma_read(pma_index, paligned, 3);
        self.log_read(paligned, val64, "memory");
        let shift = (paddr & 7) * 8;
        let val = val64 >> shift;
        Ok(match size_log2 {
            0 => val & 0xFF,
            1 => val & 0xFFFF,
            2 => val & 0xFFFF_FFFF,
            _ => val,
        })
    }

    fn write_memory(
        &mut self,
        paddr: u64,
        pma_index: usize,
        val: u64,
        size_log2: u32,
    ) -> Result<(), Infallible> {
        let paligned = paddr & !7;
        if size_log2 < 3 {
            let old = self.s.pma_read(pma_index, paligned, 3);
            self.log_read(paligned, old, "memory (superfluous)");
            let shift = (paddr & 7) * 8;
            let mask = ((1u128 << (8 << size_log2)) - 1) as u64;
            let new = (old & !(mask << shift)) | ((val & mask) << shift);
            self.log_write(paligned, old, new, "memory");
            self.s.pma_write(pma_index, paligned, new, 3);
        } else {
            let old = self.s.pma_read(pma_index, paligned, 3);
            self.log_write(paligned, old, val, "memory");
            self.s.pma_write(pma_index, paligned, val, 3);
        }
        self.update_tree_page(paligned);
        Ok(())
    }

    fn console_putchar(&mut self, ch: u8) {
        htif::host_putchar(ch);
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
