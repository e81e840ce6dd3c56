//! State access abstraction
//!
//! The interpreter is generic over [`StateAccess`], a capability set with
//! one read/write pair per piece of machine state. Three backends implement
//! it: [`direct::DirectAccess`] mutates the state in place, `logged::
//! LoggedAccess` records every word access with a Merkle proof, and
//! `replay::ReplayAccess` re-drives the interpreter from a recorded log,
//! checking every access against it. Dispatch is static so the per-word hot
//! path monomorphizes away.

pub mod direct;
pub mod log;
pub mod logged;
pub mod replay;

pub use direct::DirectAccess;
pub use log::{AccessError, AccessLog, AccessType, Bracket, BracketType, LogType, WordAccess};
pub use logged::LoggedAccess;
pub use replay::ReplayAccess;

use crate::pma::{PmaView, PMA_MAX};
use crate::state::TlbSet;

/// A fast-path translation hit.
#[derive(Debug, Clone, Copy)]
pub struct TlbHit {
    pub paddr_page: u64,
    pub pma_index: usize,
}

/// Capability set the interpreter runs against.
///
/// Every method that touches verifiable state returns `Result` so the
/// replay backend can refuse a forged log; the direct and logged backends
/// use an uninhabited error type and compile down to plain accesses.
pub trait StateAccess {
    type Error;

    /// True when the backend collects annotations; guards formatting work
    /// on the hot path.
    const ANNOTATIONS: bool = false;

    fn push_bracket(&mut self, _bracket_type: BracketType, _text: &str) {}
    fn make_scoped_note(&mut self, _text: &str) {}

    // Register file. Writes to x0 are a caller bug.
    fn read_x(&mut self, i: usize) -> Result<u64, Self::Error>;
    fn write_x(&mut self, i: usize, val: u64) -> Result<(), Self::Error>;

    fn read_pc(&mut self) -> Result<u64, Self::Error>;
    fn write_pc(&mut self, val: u64) -> Result<(), Self::Error>;

    fn read_mvendorid(&mut self) -> Result<u64, Self::Error>;
    fn read_marchid(&mut self) -> Result<u64, Self::Error>;
    fn read_mimpid(&mut self) -> Result<u64, Self::Error>;

    fn read_mcycle(&mut self) -> Result<u64, Self::Error>;
    fn write_mcycle(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_minstret(&mut self) -> Result<u64, Self::Error>;
    fn write_minstret(&mut self, val: u64) -> Result<(), Self::Error>;

    fn read_mstatus(&mut self) -> Result<u64, Self::Error>;
    fn write_mstatus(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mtvec(&mut self) -> Result<u64, Self::Error>;
    fn write_mtvec(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mscratch(&mut self) -> Result<u64, Self::Error>;
    fn write_mscratch(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mepc(&mut self) -> Result<u64, Self::Error>;
    fn write_mepc(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mcause(&mut self) -> Result<u64, Self::Error>;
    fn write_mcause(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mtval(&mut self) -> Result<u64, Self::Error>;
    fn write_mtval(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_misa(&mut self) -> Result<u64, Self::Error>;
    fn write_misa(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mie(&mut self) -> Result<u64, Self::Error>;
    fn write_mie(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mip(&mut self) -> Result<u64, Self::Error>;
    fn write_mip(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_medeleg(&mut self) -> Result<u64, Self::Error>;
    fn write_medeleg(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mideleg(&mut self) -> Result<u64, Self::Error>;
    fn write_mideleg(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_mcounteren(&mut self) -> Result<u64, Self::Error>;
    fn write_mcounteren(&mut self, val: u64) -> Result<(), Self::Error>;

    fn read_stvec(&mut self) -> Result<u64, Self::Error>;
    fn write_stvec(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_sscratch(&mut self) -> Result<u64, Self::Error>;
    fn write_sscratch(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_sepc(&mut self) -> Result<u64, Self::Error>;
    fn write_sepc(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_scause(&mut self) -> Result<u64, Self::Error>;
    fn write_scause(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_stval(&mut self) -> Result<u64, Self::Error>;
    fn write_stval(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_satp(&mut self) -> Result<u64, Self::Error>;
    fn write_satp(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_scounteren(&mut self) -> Result<u64, Self::Error>;
    fn write_scounteren(&mut self, val: u64) -> Result<(), Self::Error>;

    fn read_ilrsc(&mut self) -> Result<u64, Self::Error>;
    fn write_ilrsc(&mut self, val: u64) -> Result<(), Self::Error>;

    // iflags fields, accessed as read-modify-write on the packed word.
    fn read_iflags_prv(&mut self) -> Result<u8, Self::Error>;
    fn write_iflags_prv(&mut self, val: u8) -> Result<(), Self::Error>;
    fn read_iflags_i(&mut self) -> Result<bool, Self::Error>;
    fn set_iflags_i(&mut self) -> Result<(), Self::Error>;
    fn reset_iflags_i(&mut self) -> Result<(), Self::Error>;
    fn read_iflags_y(&mut self) -> Result<bool, Self::Error>;
    fn set_iflags_y(&mut self) -> Result<(), Self::Error>;
    fn reset_iflags_y(&mut self) -> Result<(), Self::Error>;
    fn read_iflags_h(&mut self) -> Result<bool, Self::Error>;
    fn set_iflags_h(&mut self) -> Result<(), Self::Error>;

    fn read_clint_mtimecmp(&mut self) -> Result<u64, Self::Error>;
    fn write_clint_mtimecmp(&mut self, val: u64) -> Result<(), Self::Error>;

    fn read_htif_tohost(&mut self) -> Result<u64, Self::Error>;
    fn write_htif_tohost(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_htif_fromhost(&mut self) -> Result<u64, Self::Error>;
    fn write_htif_fromhost(&mut self, val: u64) -> Result<(), Self::Error>;
    fn read_htif_ihalt(&mut self) -> Result<u64, Self::Error>;
    fn read_htif_iconsole(&mut self) -> Result<u64, Self::Error>;
    fn read_htif_iyield(&mut self) -> Result<u64, Self::Error>;

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, Self::Error>;
    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, Self::Error>;

    /// Converts a PMA descriptor inconsistency into the backend's error.
    /// Only a forged log can produce one; the live registry is validated at
    /// construction.
    fn pma_unpack_error(&mut self, index: usize, reason: &'static str) -> Self::Error;

    /// Finds the range containing `[paddr, paddr + len)` by scanning the
    /// projected descriptors, exactly as a verifier must.
    fn find_pma_entry(&mut self, paddr: u64, len: u64) -> Result<PmaView, Self::Error> {
        for i in 0..PMA_MAX {
            let istart = self.read_pma_istart(i)?;
            let ilength = self.read_pma_ilength(i)?;
            if ilength == 0 {
                return Ok(PmaView::empty(i));
            }
            let start = istart & crate::pma::PMA_ISTART_START_MASK;
            if ilength >= len && paddr >= start && paddr - start <= ilength - len {
                return PmaView::unpack(i, istart, ilength)
                    .map_err(|reason| self.pma_unpack_error(i, reason));
            }
        }
        Ok(PmaView::empty(PMA_MAX))
    }

    /// Reads a naturally aligned value of `2^size_log2` bytes from a memory
    /// range. `pma_index` was obtained from [`Self::find_pma_entry`] or a
    /// TLB hit.
    fn read_memory(&mut self, paddr: u64, pma_index: usize, size_log2: u32)
        -> Result<u64, Self::Error>;

    /// Writes a naturally aligned value into a memory range.
    fn write_memory(
        &mut self,
        paddr: u64,
        pma_index: usize,
        val: u64,
        size_log2: u32,
    ) -> Result<(), Self::Error>;

    /// Host side of the HTIF console; never part of the verifiable state.
    fn console_putchar(&mut self, _ch: u8) {}

    // Translation cache. Backends that must see every access in the log
    // leave these as the no-op defaults, so every load, store and fetch
    // goes through the full walk.
    fn tlb_lookup(&mut self, _set: TlbSet, _vaddr: u64) -> Option<TlbHit> {
        None
    }
    fn tlb_replace(&mut self, _set: TlbSet, _vaddr_page: u64, _paddr_page: u64, _pma_index: usize) {}
    fn flush_tlb(&mut self) {}
    fn flush_tlb_vaddr(&mut self, _vaddr: u64) {}

    // Loop control over the (possibly mocked) host-only state.
    fn get_brk(&self) -> bool;
    fn set_brk(&mut self);
    fn or_brk_with_mip_mie(&mut self);
    fn or_brk_with_iflags_h(&mut self);
    fn or_brk_with_iflags_y(&mut self);
    fn set_brk_from_all(&mut self);
    fn is_done(&mut self, mcycle_end: u64) -> bool;
}
