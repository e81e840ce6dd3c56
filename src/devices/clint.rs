//! CLINT - Core Local Interruptor
//!
//! Provides the machine timer. `mtime` is not independent state: it is
//! derived from mcycle at a fixed frequency divider, so only `mtimecmp` is
//! materialized into the Merkle space.

use crate::access::StateAccess;
use crate::cpu::csr::MIP_MTIP;
use crate::merkle::PAGE_SIZE;
use crate::state::MachineState;

/// mcycle ticks per timer tick. This cannot change.
pub const RTC_FREQ_DIV: u64 = 100;

// CLINT memory map (relative to the CLINT base)
pub const CLINT_MTIMECMP_REL_ADDR: u64 = 0x4000;
pub const CLINT_MTIME_REL_ADDR: u64 = 0xBFF8;

pub fn rtc_cycles_to_time(mcycle: u64) -> u64 {
    mcycle / RTC_FREQ_DIV
}

pub fn rtc_time_to_cycles(time: u64) -> u64 {
    time.saturating_mul(RTC_FREQ_DIV)
}

/// 32-bit bus read. Unknown offsets read as zero.
pub fn mmio_read<A: StateAccess>(a: &mut A, offset: u64) -> Result<u32, A::Error> {
    let val = match offset {
        0x4000 => a.read_clint_mtimecmp()? as u32,
        0x4004 => (a.read_clint_mtimecmp()? >> 32) as u32,
        0xBFF8 => rtc_cycles_to_time(a.read_mcycle()?) as u32,
        0xBFFC => (rtc_cycles_to_time(a.read_mcycle()?) >> 32) as u32,
        _ => 0,
    };
    Ok(val)
}

/// 32-bit bus write. Writing either half of mtimecmp clears the pending
/// timer interrupt. Unknown offsets are ignored.
pub fn mmio_write<A: StateAccess>(a: &mut A, offset: u64, val: u32) -> Result<(), A::Error> {
    match offset {
        0x4000 => {
            let mtimecmp = a.read_clint_mtimecmp()?;
            a.write_clint_mtimecmp((mtimecmp & !0xFFFF_FFFF) | val as u64)?;
            reset_mtip(a)?;
        }
        0x4004 => {
            let mtimecmp = a.read_clint_mtimecmp()?;
            a.write_clint_mtimecmp((mtimecmp & 0xFFFF_FFFF) | ((val as u64) << 32))?;
            reset_mtip(a)?;
        }
        _ => {}
    }
    Ok(())
}

fn reset_mtip<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let mip = a.read_mip()?;
    a.write_mip(mip & !MIP_MTIP)?;
    a.set_brk_from_all();
    Ok(())
}

/// Materializes one CLINT page for Merkle hashing. Only the page holding
/// mtimecmp ever differs from pristine.
pub fn peek(state: &MachineState, page_offset: u64, page: &mut [u8; PAGE_SIZE]) -> bool {
    if page_offset == CLINT_MTIMECMP_REL_ADDR & !(PAGE_SIZE as u64 - 1) {
        page.fill(0);
        let at = (CLINT_MTIMECMP_REL_ADDR as usize) & (PAGE_SIZE - 1);
        page[at..at + 8].copy_from_slice(&state.clint.mtimecmp.to_le_bytes());
        true
    } else {
        false
    }
}
