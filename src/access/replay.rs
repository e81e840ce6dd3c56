//! Replay state access
//!
//! Re-drives the interpreter from a recorded access log. Every access the
//! interpreter makes pops the next log entry and is checked for type,
//! address and, when proofs are enabled, for consistency with the rolling
//! root hash. No machine state exists on this side: values come from the
//! log, and PMA descriptors are rebuilt from the logged istart/ilength
//! words.

use super::log::{AccessError, AccessLog, AccessType, WordAccess};
use super::StateAccess;
use crate::devices::{clint, htif};
use crate::merkle::{hash_word, roll_hash_up, Hash, MerkleTree, LOG2_WORD_SIZE};
use crate::pma::{PMA_CLINT_START, PMA_HTIF_START, PMA_SHADOW_START};
use crate::shadow;
use crate::state::{
    IFLAGS_H_MASK, IFLAGS_I_MASK, IFLAGS_PRV_MASK, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK,
};

pub struct ReplayAccess<'a> {
    accesses: &'a [WordAccess],
    next: usize,
    verify_proofs: bool,
    root: Hash,
    /// The mock done flag: false for exactly one inner iteration.
    done: bool,
}

impl<'a> ReplayAccess<'a> {
    pub fn new(log: &'a AccessLog, verify_proofs: bool) -> Result<Self, AccessError> {
        if verify_proofs && !log.log_type.proofs {
            return Err(AccessError::MissingProofs);
        }
        let root = match log.accesses.first() {
            Some(access) if verify_proofs => match &access.proof {
                Some(proof) => proof.root_hash,
                None => return Err(AccessError::MissingProofs),
            },
            _ => MerkleTree::new().root_hash(),
        };
        Ok(ReplayAccess { accesses: &log.accesses, next: 0, verify_proofs, root, done: false })
    }

    /// Root hash after every replayed write.
    pub fn root_hash(&self) -> Hash {
        self.root
    }

    /// Checks that the whole log was consumed.
    pub fn finish(&self) -> Result<(), AccessError> {
        if self.next != self.accesses.len() {
            return Err(AccessError::TooManyAccesses {
                count: self.accesses.len(),
                consumed: self.next,
            });
        }
        Ok(())
    }

    /// 1-based index of the access being checked, for error reports.
    fn report_index(&self) -> usize {
        self.next + 1
    }

    fn next_access(&self) -> Result<&'a WordAccess, AccessError> {
        self.accesses
            .get(self.next)
            .ok_or(AccessError::TooFewAccesses { index: self.report_index() })
    }

    fn check_proof(&self, access: &WordAccess) -> Result<(), AccessError> {
        let index = self.report_index();
        let proof = match &access.proof {
            Some(proof) => proof,
            None => return Err(AccessError::MissingProofs),
        };
        if proof.address != access.address || proof.log2_size != LOG2_WORD_SIZE {
            return Err(AccessError::ProofAddressMismatch { index });
        }
        if proof.root_hash != self.root {
            return Err(AccessError::RootHashMismatch { index });
        }
        let target = hash_word(access.read);
        if target != proof.target_hash {
            return Err(AccessError::TargetHashMismatch { index });
        }
        let rolled = roll_hash_up(proof.address, LOG2_WORD_SIZE, target, &proof.sibling_hashes);
        if rolled != proof.root_hash {
            return Err(AccessError::ProofMismatch { index });
        }
        Ok(())
    }

    fn check_read(&mut self, paligned: u64, what: &'static str) -> Result<u64, AccessError> {
        debug_assert_eq!(paligned & 7, 0);
        let access = self.next_access()?;
        let index = self.report_index();
        if access.access_type != AccessType::Read {
            return Err(AccessError::TypeMismatch {
                index,
                expected: AccessType::Read,
                found: access.access_type,
                what,
            });
        }
        if access.address != paligned {
            return Err(AccessError::AddressMismatch {
                index,
                expected: paligned,
                found: access.address,
                what,
            });
        }
        if self.verify_proofs {
            self.check_proof(access)?;
        }
        self.next += 1;
        Ok(access.read)
    }

    fn check_write(&mut self, paligned: u64, val: u64, what: &'static str) -> Result<(), AccessError> {
        debug_assert_eq!(paligned & 7, 0);
        let access = self.next_access()?;
        let index = self.report_index();
        if access.access_type != AccessType::Write {
            return Err(AccessError::TypeMismatch {
                index,
                expected: AccessType::Write,
                found: access.access_type,
                what,
            });
        }
        if access.address != paligned {
            return Err(AccessError::AddressMismatch {
                index,
                expected: paligned,
                found: access.address,
                what,
            });
        }
        if access.written != val {
            return Err(AccessError::WrittenValueMismatch { index });
        }
        if self.verify_proofs {
            self.check_proof(access)?;
            let proof = access.proof.as_ref().expect("checked above");
            self.root = roll_hash_up(
                proof.address,
                LOG2_WORD_SIZE,
                hash_word(access.written),
                &proof.sibling_hashes,
            );
        }
        self.next += 1;
        Ok(())
    }

    fn read_iflags(&mut self, what: &'static str) -> Result<u64, AccessError> {
        self.check_read(PMA_SHADOW_START + shadow::offset::IFLAGS, what)
    }

    fn write_iflags_rmw(
        &mut self,
        set: u64,
        clear: u64,
        read_what: &'static str,
        write_what: &'static str,
    ) -> Result<(), AccessError> {
        let addr = PMA_SHADOW_START + shadow::offset::IFLAGS;
        let old = self.check_read(addr, read_what)?;
        let new = (old | set) & !clear;
        self.check_write(addr, new, write_what)
    }
}

macro_rules! replay_csr_ro {
    ($read:ident, $off:expr, $note:literal) => {
        fn $read(&mut self) -> Result<u64, AccessError> {
            self.check_read($off, $note)
        }
    };
}

macro_rules! replay_csr {
    ($read:ident, $write:ident, $off:expr, $note:literal) => {
        fn $read(&mut self) -> Result<u64, AccessError> {
            self.check_read($off, $note)
        }
        fn $write(&mut self, val: u64) -> Result<(), AccessError> {
            self.check_write($off, val, $note)
        }
    };
}

impl StateAccess for ReplayAccess<'_> {
    type Error = AccessError;

    fn read_x(&mut self, i: usize) -> Result<u64, AccessError> {
        self.check_read(PMA_SHADOW_START + shadow::register_rel_addr(i), "x")
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), AccessError> {
        debug_assert!(i != 0);
        self.check_write(PMA_SHADOW_START + shadow::register_rel_addr(i), val, "x")
    }

    replay_csr!(read_pc, write_pc, PMA_SHADOW_START + shadow::offset::PC, "pc");
    replay_csr!(read_mcycle, write_mcycle, PMA_SHADOW_START + shadow::offset::MCYCLE, "mcycle");
    replay_csr!(read_minstret, write_minstret, PMA_SHADOW_START + shadow::offset::MINSTRET, "minstret");
    replay_csr!(read_mstatus, write_mstatus, PMA_SHADOW_START + shadow::offset::MSTATUS, "mstatus");
    replay_csr!(read_mtvec, write_mtvec, PMA_SHADOW_START + shadow::offset::MTVEC, "mtvec");
    replay_csr!(read_mscratch, write_mscratch, PMA_SHADOW_START + shadow::offset::MSCRATCH, "mscratch");
    replay_csr!(read_mepc, write_mepc, PMA_SHADOW_START + shadow::offset::MEPC, "mepc");
    replay_csr!(read_mcause, write_mcause, PMA_SHADOW_START + shadow::offset::MCAUSE, "mcause");
    replay_csr!(read_mtval, write_mtval, PMA_SHADOW_START + shadow::offset::MTVAL, "mtval");
    replay_csr!(read_misa, write_misa, PMA_SHADOW_START + shadow::offset::MISA, "misa");
    replay_csr!(read_mie, write_mie, PMA_SHADOW_START + shadow::offset::MIE, "mie");
    replay_csr!(read_mip, write_mip, PMA_SHADOW_START + shadow::offset::MIP, "mip");
    replay_csr!(read_medeleg, write_medeleg, PMA_SHADOW_START + shadow::offset::MEDELEG, "medeleg");
    replay_csr!(read_mideleg, write_mideleg, PMA_SHADOW_START + shadow::offset::MIDELEG, "mideleg");
    replay_csr!(read_mcounteren, write_mcounteren, PMA_SHADOW_START + shadow::offset::MCOUNTEREN, "mcounteren");
    replay_csr!(read_stvec, write_stvec, PMA_SHADOW_START + shadow::offset::STVEC, "stvec");
    replay_csr!(read_sscratch, write_sscratch, PMA_SHADOW_START + shadow::offset::SSCRATCH, "sscratch");
    replay_csr!(read_sepc, write_sepc, PMA_SHADOW_START + shadow::offset::SEPC, "sepc");
    replay_csr!(read_scause, write_scause, PMA_SHADOW_START + shadow::offset::SCAUSE, "scause");
    replay_csr!(read_stval, write_stval, PMA_SHADOW_START + shadow::offset::STVAL, "stval");
    replay_csr!(read_satp, write_satp, PMA_SHADOW_START + shadow::offset::SATP, "satp");
    replay_csr!(read_scounteren, write_scounteren, PMA_SHADOW_START + shadow::offset::SCOUNTEREN, "scounteren");
    replay_csr!(read_ilrsc, write_ilrsc, PMA_SHADOW_START + shadow::offset::ILRSC, "ilrsc");
    replay_csr_ro!(read_mvendorid, PMA_SHADOW_START + shadow::offset::MVENDORID, "mvendorid");
    replay_csr_ro!(read_marchid, PMA_SHADOW_START + shadow::offset::MARCHID, "marchid");
    replay_csr_ro!(read_mimpid, PMA_SHADOW_START + shadow::offset::MIMPID, "mimpid");
    replay_csr!(read_clint_mtimecmp, write_clint_mtimecmp, PMA_CLINT_START + clint::CLINT_MTIMECMP_REL_ADDR, "clint.mtimecmp");
    replay_csr!(read_htif_tohost, write_htif_tohost, PMA_HTIF_START + htif::HTIF_TOHOST_REL_ADDR, "htif.tohost");
    replay_csr!(read_htif_fromhost, write_htif_fromhost, PMA_HTIF_START + htif::HTIF_FROMHOST_REL_ADDR, "htif.fromhost");
    replay_csr_ro!(read_htif_ihalt, PMA_HTIF_START + htif::HTIF_IHALT_REL_ADDR, "htif.ihalt");
    replay_csr_ro!(read_htif_iconsole, PMA_HTIF_START + htif::HTIF_ICONSOLE_REL_ADDR, "htif.iconsole");
    replay_csr_ro!(read_htif_iyield, PMA_HTIF_START + htif::HTIF_IYIELD_REL_ADDR, "htif.iyield");

    fn read_iflags_prv(&mut self) -> Result<u8, AccessError> {
        let iflags = self.read_iflags("iflags.PRV")?;
        Ok(((iflags & IFLAGS_PRV_MASK) >> IFLAGS_PRV_SHIFT) as u8)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), AccessError> {
        let addr = PMA_SHADOW_START + shadow::offset::IFLAGS;
        let old = self.check_read(addr, "iflags.PRV (superfluous)")?;
        let new = (old & !IFLAGS_PRV_MASK) | (((val as u64) << IFLAGS_PRV_SHIFT) & IFLAGS_PRV_MASK);
        self.check_write(addr, new, "iflags.PRV")
    }

    fn read_iflags_i(&mut self) -> Result<bool, AccessError> {
        Ok(self.read_iflags("iflags.I")? & IFLAGS_I_MASK != 0)
    }

    fn set_iflags_i(&mut self) -> Result<(), AccessError> {
        self.write_iflags_rmw(IFLAGS_I_MASK, 0, "iflags.I (superfluous)", "iflags.I")
    }

    fn reset_iflags_i(&mut self) -> Result<(), AccessError> {
        self.write_iflags_rmw(0, IFLAGS_I_MASK, "iflags.I (superfluous)", "iflags.I")
    }

    fn read_iflags_y(&mut self) -> Result<bool, AccessError> {
        Ok(self.read_iflags("iflags.Y")? & IFLAGS_Y_MASK != 0)
    }

    fn set_iflags_y(&mut self) -> Result<(), AccessError> {
        self.write_iflags_rmw(IFLAGS_Y_MASK, 0, "iflags.Y (superfluous)", "iflags.Y")
    }

    fn reset_iflags_y(&mut self) -> Result<(), AccessError> {
        self.write_iflags_rmw(0, IFLAGS_Y_MASK, "iflags.Y (superfluous)", "iflags.Y")
    }

    fn read_iflags_h(&mut self) -> Result<bool, AccessError> {
        Ok(self.read_iflags("iflags.H")? & IFLAGS_H_MASK != 0)
    }

    fn set_iflags_h(&mut self) -> Result<(), AccessError> {
        self.write_iflags_rmw(IFLAGS_H_MASK, 0, "iflags.H (superfluous)", "iflags.H")
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, AccessError> {
        self.check_read(PMA_SHADOW_START + shadow::pma_rel_addr(i), "pma.istart")
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, AccessError> {
        self.check_read(PMA_SHADOW_START + shadow::pma_rel_addr(i) + 8, "pma.ilength")
    }

    fn pma_unpack_error(&mut self, _index: usize, reason: &'static str) -> AccessError {
        AccessError::InvalidPmaFlags { index: self.report_index(), reason }
    }

    fn read_memory(&mut self, paddr: u64, _pma_index: usize, size_log2: u32) -> Result<u64, AccessError> {
        let paligned = paddr & !7;
        let val64 = self.check_read(paligned, "memory")?;
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
        _pma_index: usize,
        val: u64,
        size_log2: u32,
    ) -> Result<(), AccessError> {
        let paligned = paddr & !7;
        if size_log2 < 3 {
            let old = self.check_read(paligned, "memory (superfluous)")?;
            let shift = (paddr & 7) * 8;
            let mask = ((1u128 << (8 << size_log2)) - 1) as u64;
            let new = (old & !(mask << shift)) | ((val & mask) << shift);
            self.check_write(paligned, new, "memory")
        } else {
            self.check_write(paligned, val, "memory")
        }
    }

    fn get_brk(&self) -> bool {
        // The mock state always breaks the inner loop after one retire.
        true
    }

    fn set_brk(&mut self) {}
    fn or_brk_with_mip_mie(&mut self) {}
    fn or_brk_with_iflags_h(&mut self) {}
    fn or_brk_with_iflags_y(&mut self) {}
    fn set_brk_from_all(&mut self) {}

    fn is_done(&mut self, _mcycle_end: u64) -> bool {
        let done = self.done;
        self.done = true;
        done
    }
}
