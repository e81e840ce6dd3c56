//! Trap handling
//!
//! Exceptions and interrupts vector through mtvec/stvec, honoring the
//! medeleg/mideleg delegation masks and saving the interrupt-enable stack
//! in mstatus. Everything goes through the state access so trap paths are
//! logged and replayed like any other state change.

use super::csr::*;
use crate::access::{BracketType, StateAccess};
use crate::state::{ILRSC_NONE, PRV_M, PRV_S};

/// Changes the privilege level, invalidating cached translations.
pub fn set_prv<A: StateAccess>(a: &mut A, prv: u8) -> Result<(), A::Error> {
    a.flush_tlb();
    a.write_iflags_prv(prv)
}

/// Raises an exception or delivers an interrupt: picks the target
/// privilege from the delegation masks, saves the interrupt-enable stack,
/// kills any LR reservation and vectors to the handler.
pub fn raise_exception<A: StateAccess>(a: &mut A, cause: u64, tval: u64) -> Result<(), A::Error> {
    if A::ANNOTATIONS {
        a.push_bracket(BracketType::Begin, "raise exception");
    }
    let is_interrupt = cause & CAUSE_INTERRUPT_FLAG != 0;
    let bit = cause & !CAUSE_INTERRUPT_FLAG;
    let prv = a.read_iflags_prv()?;

    // Any trap invalidates an outstanding reservation.
    a.write_ilrsc(ILRSC_NONE)?;

    let deleg = if is_interrupt { a.read_mideleg()? } else { a.read_medeleg()? };
    let delegate_to_s = prv <= PRV_S && bit < 64 && (deleg >> bit) & 1 != 0;

    let pc = a.read_pc()?;
    if delegate_to_s {
        a.write_scause(cause)?;
        a.write_sepc(pc)?;
        a.write_stval(tval)?;

        let mut mstatus = a.read_mstatus()?;
        if mstatus & MSTATUS_SIE != 0 {
            mstatus |= MSTATUS_SPIE;
        } else {
            mstatus &= !MSTATUS_SPIE;
        }
        if prv == PRV_S {
            mstatus |= MSTATUS_SPP;
        } else {
            mstatus &= !MSTATUS_SPP;
        }
        mstatus &= !MSTATUS_SIE;
        a.write_mstatus(mstatus)?;
        if prv != PRV_S {
            set_prv(a, PRV_S)?;
        }

        let stvec = a.read_stvec()?;
        let vector = if is_interrupt && stvec & 3 == 1 {
            (stvec & !3) + bit * 4
        } else {
            stvec & !3
        };
        a.write_pc(vector)?;
    } else {
        a.write_mcause(cause)?;
        a.write_mepc(pc)?;
        a.write_mtval(tval)?;

        let mut mstatus = a.read_mstatus()?;
        if mstatus & MSTATUS_MIE != 0 {
            mstatus |= MSTATUS_MPIE;
        } else {
            mstatus &= !MSTATUS_MPIE;
        }
        mstatus = (mstatus & !MSTATUS_MPP) | ((prv as u64) << MSTATUS_MPP_SHIFT);
        mstatus &= !MSTATUS_MIE;
        a.write_mstatus(mstatus)?;
        if prv != PRV_M {
            set_prv(a, PRV_M)?;
        }

        let mtvec = a.read_mtvec()?;
        let vector = if is_interrupt && mtvec & 3 == 1 {
            (mtvec & !3) + bit * 4
        } else {
            mtvec & !3
        };
        a.write_pc(vector)?;
    }
    if A::ANNOTATIONS {
        a.push_bracket(BracketType::End, "raise exception");
    }
    Ok(())
}

/// Mask of interrupts that are pending, enabled, and unmasked for the
/// current privilege level.
pub fn get_pending_irq_mask<A: StateAccess>(a: &mut A) -> Result<u64, A::Error> {
    let mip = a.read_mip()?;
    let mie = a.read_mie()?;
    let pending = mip & mie;
    if pending == 0 {
        return Ok(0);
    }
    let enabled = match a.read_iflags_prv()? {
        PRV_M => {
            let mstatus = a.read_mstatus()?;
            if mstatus & MSTATUS_MIE != 0 {
                !a.read_mideleg()?
            } else {
                0
            }
        }
        PRV_S => {
            let mstatus = a.read_mstatus()?;
            let mideleg = a.read_mideleg()?;
            // Non-delegated interrupts always preempt S mode; delegated
            // ones respect SIE.
            let mut enabled = !mideleg;
            if mstatus & MSTATUS_SIE != 0 {
                enabled |= mideleg;
            }
            enabled
        }
        // All interrupts preempt U mode.
        _ => !0,
    };
    Ok(pending & enabled)
}

/// Delivers the highest-priority pending interrupt, if any.
pub fn raise_interrupt_if_any<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let mask = get_pending_irq_mask(a)?;
    if mask == 0 {
        return Ok(());
    }
    // External before software before timer, machine before supervisor.
    const PRIORITY: [u64; 6] =
        [IRQ_M_EXT, IRQ_M_SOFT, IRQ_M_TIMER, IRQ_S_EXT, IRQ_S_SOFT, IRQ_S_TIMER];
    for irq in PRIORITY {
        if mask & (1 << irq) != 0 {
            return raise_exception(a, CAUSE_INTERRUPT_FLAG | irq, 0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DirectAccess;
    use crate::state::{MachineState, PRV_M, PRV_U};

    fn unerr<T>(r: Result<T, std::convert::Infallible>) -> T {
        match r {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    #[test]
    fn exception_vectors_to_mtvec() {
        let mut state = MachineState::new();
        state.pc = 0x8000_0010;
        state.mtvec = 0x8000_1000;
        state.mstatus |= MSTATUS_MIE;
        let mut a = DirectAccess::new(&mut state);
        unerr(raise_exception(&mut a, CAUSE_ILLEGAL_INSN, 0xBAD));
        assert_eq!(state.pc, 0x8000_1000);
        assert_eq!(state.mcause, CAUSE_ILLEGAL_INSN);
        assert_eq!(state.mepc, 0x8000_0010);
        assert_eq!(state.mtval, 0xBAD);
        assert_eq!(state.mstatus & MSTATUS_MIE, 0);
        assert_ne!(state.mstatus & MSTATUS_MPIE, 0);
        assert_eq!((state.mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT, PRV_M as u64);
    }

    #[test]
    fn delegated_exception_reaches_s_mode() {
        let mut state = MachineState::new();
        state.pc = 0x100;
        state.stvec = 0x2000;
        state.medeleg = 1 << CAUSE_ILLEGAL_INSN;
        state.iflags.prv = PRV_U;
        let mut a = DirectAccess::new(&mut state);
        unerr(raise_exception(&mut a, CAUSE_ILLEGAL_INSN, 0));
        assert_eq!(state.iflags.prv, PRV_S);
        assert_eq!(state.pc, 0x2000);
        assert_eq!(state.scause, CAUSE_ILLEGAL_INSN);
        assert_eq!(state.sepc, 0x100);
        assert_eq!(state.mstatus & MSTATUS_SPP, 0, "trapped from U");
    }

    #[test]
    fn trap_kills_reservation() {
        let mut state = MachineState::new();
        state.ilrsc = 0x8000_0000;
        let mut a = DirectAccess::new(&mut state);
        unerr(raise_exception(&mut a, CAUSE_BREAKPOINT, 0));
        assert_eq!(state.ilrsc, ILRSC_NONE);
    }

    #[test]
    fn vectored_interrupt_offsets_by_cause() {
        let mut state = MachineState::new();
        state.mtvec = 0x8000_0001; // vectored mode
        state.mip = MIP_MTIP;
        state.mie = MIP_MTIP;
        state.mstatus |= MSTATUS_MIE;
        let mut a = DirectAccess::new(&mut state);
        unerr(raise_interrupt_if_any(&mut a));
        assert_eq!(state.mcause, CAUSE_INTERRUPT_FLAG | IRQ_M_TIMER);
        assert_eq!(state.pc, 0x8000_0000 + IRQ_M_TIMER * 4);
    }

    #[test]
    fn masked_interrupt_stays_pending() {
        let mut state = MachineState::new();
        state.mip = MIP_MTIP;
        state.mie = MIP_MTIP;
        // MIE clear in M mode masks everything.
        let mut a = DirectAccess::new(&mut state);
        assert_eq!(unerr(get_pending_irq_mask(&mut a)), 0);
    }
}
