//! RV64IMA interpreter
//!
//! One inner iteration per retired instruction; the outer loop runs the
//! interrupt pass and decides whether control goes back to the host. The
//! whole interpreter is generic over the state access, so the same code
//! drives direct execution, log generation and log replay.

pub mod csr;
pub mod decode;
pub mod execute;
pub mod mmu;
pub mod trap;

use crate::access::StateAccess;
use crate::devices::clint::{self, rtc_cycles_to_time, RTC_FREQ_DIV};
use crate::devices::htif;
use crate::merkle::PAGE_SIZE;
use crate::pma::{PmaDid, PmaKind};
use crate::state::TlbSet;
use csr::*;
use execute::{execute_insn, ExecStatus};
use mmu::{translate_virtual_address, VmAccess};
use trap::{raise_exception, raise_interrupt_if_any};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Raises the timer interrupt once its time arrives. This lives in the
/// interpreter, not the host loop, so a logged step and a fast run see
/// the same machine state evolution.
fn check_timer_interrupt<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let mcycle = a.read_mcycle()?;
    let mtimecmp = a.read_clint_mtimecmp()?;
    if rtc_cycles_to_time(mcycle) >= mtimecmp {
        let mip = a.read_mip()?;
        if mip & MIP_MTIP == 0 {
            a.write_mip(mip | MIP_MTIP)?;
            // The timer wakes an idle CPU.
            a.reset_iflags_i()?;
            a.set_brk_from_all();
        }
    }
    Ok(())
}

/// Runs the machine until mcycle reaches `mcycle_end` or the state access
/// breaks the loop (halt, yield, idle, pending interrupt handled by the
/// host). The outer loop runs once per RTC tick batch and on every break.
pub fn interpret<A: StateAccess>(a: &mut A, mcycle_end: u64) -> Result<(), A::Error> {
    if a.read_iflags_h()? {
        return Ok(());
    }
    if a.is_done(mcycle_end) {
        return Ok(());
    }
    loop {
        check_timer_interrupt(a)?;
        raise_interrupt_if_any(a)?;
        loop {
            let mcycle = match fetch_insn(a)? {
                Some((insn, pc)) => {
                    let status = execute_insn(a, pc, insn)?;
                    let mcycle = a.read_mcycle()?.wrapping_add(1);
                    a.write_mcycle(mcycle)?;
                    if status == ExecStatus::Retired {
                        let minstret = a.read_minstret()?.wrapping_add(1);
                        a.write_minstret(minstret)?;
                    }
                    mcycle
                }
                None => {
                    // The failed fetch raised its exception; it still
                    // consumes a cycle.
                    let mcycle = a.read_mcycle()?.wrapping_add(1);
                    a.write_mcycle(mcycle)?;
                    mcycle
                }
            };
            if a.get_brk() {
                break;
            }
            if a.is_done(mcycle_end) {
                return Ok(());
            }
            if mcycle % RTC_FREQ_DIV == 0 {
                // Tick boundary: give the timer a chance.
                break;
            }
        }
        // The inner loop broke; rebuild brk and decide what to do.
        a.set_brk_from_all();
        if a.is_done(mcycle_end) {
            return Ok(());
        }
        if a.read_iflags_h()? {
            return Ok(());
        }
        if a.read_iflags_i()? || a.read_iflags_y()? {
            return Ok(());
        }
    }
}

/// Fetches the instruction at pc. `None` means a fetch exception was
/// raised and pc now points at the handler.
fn fetch_insn<A: StateAccess>(a: &mut A) -> Result<Option<(u32, u64)>, A::Error> {
    let pc = a.read_pc()?;
    if pc & 3 != 0 {
        raise_exception(a, CAUSE_INSN_ADDRESS_MISALIGNED, pc)?;
        return Ok(None);
    }
    if let Some(hit) = a.tlb_lookup(TlbSet::Code, pc) {
        let insn = a.read_memory(hit.paddr_page | (pc & PAGE_MASK), hit.pma_index, 2)?;
        return Ok(Some((insn as u32, pc)));
    }
    let paddr = match translate_virtual_address(a, pc, VmAccess::Fetch)? {
        Some(paddr) => paddr,
        None => {
            raise_exception(a, CAUSE_FETCH_PAGE_FAULT, pc)?;
            return Ok(None);
        }
    };
    let view = a.find_pma_entry(paddr, 4)?;
    if view.kind != PmaKind::Memory || !view.flags.x {
        raise_exception(a, CAUSE_INSN_ACCESS_FAULT, pc)?;
        return Ok(None);
    }
    a.tlb_replace(TlbSet::Code, pc & !PAGE_MASK, paddr & !PAGE_MASK, view.index);
    let insn = a.read_memory(paddr, view.index, 2)?;
    Ok(Some((insn as u32, pc)))
}

/// Reads through the virtual address space. `None` means an exception was
/// raised.
pub(crate) fn read_virtual_memory<A: StateAccess>(
    a: &mut A,
    vaddr: u64,
    size_log2: u32,
) -> Result<Option<u64>, A::Error> {
    let size = 1u64 << size_log2;
    if vaddr & (size - 1) != 0 {
        raise_exception(a, CAUSE_LOAD_ADDRESS_MISALIGNED, vaddr)?;
        return Ok(None);
    }
    if let Some(hit) = a.tlb_lookup(TlbSet::Read, vaddr) {
        let val = a.read_memory(hit.paddr_page | (vaddr & PAGE_MASK), hit.pma_index, size_log2)?;
        return Ok(Some(val));
    }
    let paddr = match translate_virtual_address(a, vaddr, VmAccess::Load)? {
        Some(paddr) => paddr,
        None => {
            raise_exception(a, CAUSE_LOAD_PAGE_FAULT, vaddr)?;
            return Ok(None);
        }
    };
    let view = a.find_pma_entry(paddr, size)?;
    if !view.flags.r {
        raise_exception(a, CAUSE_LOAD_ACCESS_FAULT, vaddr)?;
        return Ok(None);
    }
    match view.kind {
        PmaKind::Memory => {
            a.tlb_replace(TlbSet::Read, vaddr & !PAGE_MASK, paddr & !PAGE_MASK, view.index);
            Ok(Some(a.read_memory(paddr, view.index, size_log2)?))
        }
        PmaKind::Device => {
            let offset = paddr - view.start;
            match device_read(a, view.flags.did, offset, size_log2)? {
                Some(val) => Ok(Some(val)),
                None => {
                    raise_exception(a, CAUSE_LOAD_ACCESS_FAULT, vaddr)?;
                    Ok(None)
                }
            }
        }
        PmaKind::Empty => {
            raise_exception(a, CAUSE_LOAD_ACCESS_FAULT, vaddr)?;
            Ok(None)
        }
    }
}

/// Writes through the virtual address space. `Some(())` means the store
/// completed; `None` means an exception was raised.
pub(crate) fn write_virtual_memory<A: StateAccess>(
    a: &mut A,
    vaddr: u64,
    val: u64,
    size_log2: u32,
) -> Result<Option<()>, A::Error> {
    let size = 1u64 << size_log2;
    if vaddr & (size - 1) != 0 {
        raise_exception(a, CAUSE_STORE_ADDRESS_MISALIGNED, vaddr)?;
        return Ok(None);
    }
    if let Some(hit) = a.tlb_lookup(TlbSet::Write, vaddr) {
        a.write_memory(hit.paddr_page | (vaddr & PAGE_MASK), hit.pma_index, val, size_log2)?;
        return Ok(Some(()));
    }
    let paddr = match translate_virtual_address(a, vaddr, VmAccess::Store)? {
        Some(paddr) => paddr,
        None => {
            raise_exception(a, CAUSE_STORE_PAGE_FAULT, vaddr)?;
            return Ok(None);
        }
    };
    let view = a.find_pma_entry(paddr, size)?;
    if !view.flags.w {
        raise_exception(a, CAUSE_STORE_ACCESS_FAULT, vaddr)?;
        return Ok(None);
    }
    match view.kind {
        PmaKind::Memory => {
            a.tlb_replace(TlbSet::Write, vaddr & !PAGE_MASK, paddr & !PAGE_MASK, view.index);
            a.write_memory(paddr, view.index, val, size_log2)?;
            Ok(Some(()))
        }
        PmaKind::Device => {
            let offset = paddr - view.start;
            if device_write(a, view.flags.did, offset, val, size_log2)? {
                Ok(Some(()))
            } else {
                raise_exception(a, CAUSE_STORE_ACCESS_FAULT, vaddr)?;
                Ok(None)
            }
        }
        PmaKind::Empty => {
            raise_exception(a, CAUSE_STORE_ACCESS_FAULT, vaddr)?;
            Ok(None)
        }
    }
}

/// Devices speak a 32-bit bus. 64-bit accesses split into low and high
/// words; anything narrower is refused.
fn device_read<A: StateAccess>(
    a: &mut A,
    did: PmaDid,
    offset: u64,
    size_log2: u32,
) -> Result<Option<u64>, A::Error> {
    match size_log2 {
        2 => {
            let val = match did {
                PmaDid::Clint => clint::mmio_read(a, offset)?,
                PmaDid::Htif => htif::mmio_read(a, offset)?,
                _ => return Ok(None),
            };
            Ok(Some(val as u64))
        }
        3 => {
            let (lo, hi) = match did {
                PmaDid::Clint => (clint::mmio_read(a, offset)?, clint::mmio_read(a, offset + 4)?),
                PmaDid::Htif => (htif::mmio_read(a, offset)?, htif::mmio_read(a, offset + 4)?),
                _ => return Ok(None),
            };
            Ok(Some((lo as u64) | ((hi as u64) << 32)))
        }
        _ => Ok(None),
    }
}

fn device_write<A: StateAccess>(
    a: &mut A,
    did: PmaDid,
    offset: u64,
    val: u64,
    size_log2: u32,
) -> Result<bool, A::Error> {
    match size_log2 {
        2 => {
            match did {
                PmaDid::Clint => clint::mmio_write(a, offset, val as u32)?,
                PmaDid::Htif => htif::mmio_write(a, offset, val as u32)?,
                _ => return Ok(false),
            }
            Ok(true)
        }
        3 => {
            // Low word first, then the high word, which is where HTIF
            // command dispatch hangs.
            match did {
                PmaDid::Clint => {
                    clint::mmio_write(a, offset, val as u32)?;
                    clint::mmio_write(a, offset + 4, (val >> 32) as u32)?;
                }
                PmaDid::Htif => {
                    htif::mmio_write(a, offset, val as u32)?;
                    htif::mmio_write(a, offset + 4, (val >> 32) as u32)?;
                }
                _ => return Ok(false),
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}
