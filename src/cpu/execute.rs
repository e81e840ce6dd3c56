//! Instruction execution (RV64IMA + Zifencei)
//!
//! Every handler reads operands and writes results through the state
//! access and finishes by writing the next pc. Exceptions never escape:
//! they redirect pc through the trap machinery and report `Trapped`.

use super::csr::*;
use super::decode::*;
use super::mmu::{translate_virtual_address, VmAccess};
use super::trap::{raise_exception, set_prv};
use super::{read_virtual_memory, write_virtual_memory};
use crate::access::StateAccess;
use crate::devices::clint::rtc_cycles_to_time;
use crate::pma::PmaKind;
use crate::state::{ILRSC_NONE, PRV_M, PRV_S, PRV_U};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The instruction retired; minstret advances.
    Retired,
    /// An exception was raised; pc points at the handler.
    Trapped,
}

fn mnemonic(insn: u32) -> &'static str {
    match opcode(insn) {
        OP_LUI => "lui",
        OP_AUIPC => "auipc",
        OP_JAL => "jal",
        OP_JALR => "jalr",
        OP_BRANCH => "branch",
        OP_LOAD => "load",
        OP_STORE => "store",
        OP_OP_IMM => "op-imm",
        OP_OP_IMM_32 => "op-imm-32",
        OP_OP => "op",
        OP_OP_32 => "op-32",
        OP_MISC_MEM => "fence",
        OP_SYSTEM => "system",
        OP_AMO => "amo",
        _ => "illegal",
    }
}

pub fn execute_insn<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    if A::ANNOTATIONS {
        a.make_scoped_note(mnemonic(insn));
    }
    match opcode(insn) {
        OP_LUI => {
            write_rd(a, insn, imm_u(insn) as u64)?;
            advance(a, pc)
        }
        OP_AUIPC => {
            write_rd(a, insn, pc.wrapping_add(imm_u(insn) as u64))?;
            advance(a, pc)
        }
        OP_JAL => {
            write_rd(a, insn, pc.wrapping_add(4))?;
            a.write_pc(pc.wrapping_add(imm_j(insn) as u64))?;
            Ok(ExecStatus::Retired)
        }
        OP_JALR => {
            if funct3(insn) != 0 {
                return illegal(a, insn);
            }
            let target = a.read_x(rs1(insn))?.wrapping_add(imm_i(insn) as u64) & !1;
            write_rd(a, insn, pc.wrapping_add(4))?;
            a.write_pc(target)?;
            Ok(ExecStatus::Retired)
        }
        OP_BRANCH => execute_branch(a, pc, insn),
        OP_LOAD => execute_load(a, pc, insn),
        OP_STORE => execute_store(a, pc, insn),
        OP_OP_IMM => execute_op_imm(a, pc, insn),
        OP_OP_IMM_32 => execute_op_imm_32(a, pc, insn),
        OP_OP => execute_op(a, pc, insn),
        OP_OP_32 => execute_op_32(a, pc, insn),
        OP_MISC_MEM => match funct3(insn) {
            // FENCE and FENCE.I have nothing to order in a single hart.
            0 | 1 => advance(a, pc),
            _ => illegal(a, insn),
        },
        OP_SYSTEM => execute_system(a, pc, insn),
        OP_AMO => execute_amo(a, pc, insn),
        _ => illegal(a, insn),
    }
}

fn advance<A: StateAccess>(a: &mut A, pc: u64) -> Result<ExecStatus, A::Error> {
    a.write_pc(pc.wrapping_add(4))?;
    Ok(ExecStatus::Retired)
}

fn illegal<A: StateAccess>(a: &mut A, insn: u32) -> Result<ExecStatus, A::Error> {
    raise_exception(a, CAUSE_ILLEGAL_INSN, insn as u64)?;
    Ok(ExecStatus::Trapped)
}

fn write_rd<A: StateAccess>(a: &mut A, insn: u32, val: u64) -> Result<(), A::Error> {
    let rd = rd(insn);
    if rd != 0 {
        a.write_x(rd, val)?;
    }
    Ok(())
}

fn execute_branch<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let lhs = a.read_x(rs1(insn))?;
    let rhs = a.read_x(rs2(insn))?;
    let taken = match funct3(insn) {
        FUNCT3_BEQ => lhs == rhs,
        FUNCT3_BNE => lhs != rhs,
        FUNCT3_BLT => (lhs as i64) < (rhs as i64),
        FUNCT3_BGE => (lhs as i64) >= (rhs as i64),
        FUNCT3_BLTU => lhs < rhs,
        FUNCT3_BGEU => lhs >= rhs,
        _ => return illegal(a, insn),
    };
    if taken {
        a.write_pc(pc.wrapping_add(imm_b(insn) as u64))?;
        Ok(ExecStatus::Retired)
    } else {
        advance(a, pc)
    }
}

fn execute_load<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let vaddr = a.read_x(rs1(insn))?.wrapping_add(imm_i(insn) as u64);
    let (size_log2, signed) = match funct3(insn) {
        FUNCT3_LB => (0, true),
        FUNCT3_LH => (1, true),
        FUNCT3_LW => (2, true),
        FUNCT3_LD => (3, true),
        FUNCT3_LBU => (0, false),
        FUNCT3_LHU => (1, false),
        FUNCT3_LWU => (2, false),
        _ => return illegal(a, insn),
    };
    let val = match read_virtual_memory(a, vaddr, size_log2)? {
        Some(val) => val,
        None => return Ok(ExecStatus::Trapped),
    };
    let val = if signed { sign_extend(val, size_log2) } else { val };
    write_rd(a, insn, val)?;
    advance(a, pc)
}

fn execute_store<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let vaddr = a.read_x(rs1(insn))?.wrapping_add(imm_s(insn) as u64);
    let val = a.read_x(rs2(insn))?;
    let size_log2 = match funct3(insn) {
        0b000 => 0,
        0b001 => 1,
        0b010 => 2,
        0b011 => 3,
        _ => return illegal(a, insn),
    };
    match write_virtual_memory(a, vaddr, val, size_log2)? {
        Some(()) => advance(a, pc),
        None => Ok(ExecStatus::Trapped),
    }
}

fn sign_extend(val: u64, size_log2: u32) -> u64 {
    match size_log2 {
        0 => val as u8 as i8 as i64 as u64,
        1 => val as u16 as i16 as i64 as u64,
        2 => val as u32 as i32 as i64 as u64,
        _ => val,
    }
}

fn execute_op_imm<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let lhs = a.read_x(rs1(insn))?;
    let imm = imm_i(insn) as u64;
    let shamt = (imm & 0x3F) as u32;
    let funct6 = (insn >> 26) & 0x3F;
    let result = match funct3(insn) {
        FUNCT3_ADD_SUB => lhs.wrapping_add(imm),
        FUNCT3_SLT => ((lhs as i64) < (imm as i64)) as u64,
        FUNCT3_SLTU => (lhs < imm) as u64,
        FUNCT3_XOR => lhs ^ imm,
        FUNCT3_OR => lhs | imm,
        FUNCT3_AND => lhs & imm,
        FUNCT3_SLL => {
            if funct6 != 0 {
                return illegal(a, insn);
            }
            lhs << shamt
        }
        FUNCT3_SRL_SRA => match funct6 {
            0b000000 => lhs >> shamt,
            0b010000 => ((lhs as i64) >> shamt) as u64,
            _ => return illegal(a, insn),
        },
        _ => return illegal(a, insn),
    };
    write_rd(a, insn, result)?;
    advance(a, pc)
}

fn execute_op_imm_32<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let lhs = a.read_x(rs1(insn))? as u32;
    let imm = imm_i(insn);
    let shamt = (imm & 0x1F) as u32;
    let result: u32 = match funct3(insn) {
        FUNCT3_ADD_SUB => lhs.wrapping_add(imm as u32),
        FUNCT3_SLL => {
            if funct7(insn) != 0 {
                return illegal(a, insn);
            }
            lhs << shamt
        }
        FUNCT3_SRL_SRA => match funct7(insn) {
            0b0000000 => lhs >> shamt,
            0b0100000 => ((lhs as i32) >> shamt) as u32,
            _ => return illegal(a, insn),
        },
        _ => return illegal(a, insn),
    };
    write_rd(a, insn, result as i32 as i64 as u64)?;
    advance(a, pc)
}

fn execute_op<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let lhs = a.read_x(rs1(insn))?;
    let rhs = a.read_x(rs2(insn))?;
    let shamt = (rhs & 0x3F) as u32;
    let result = match (funct7(insn), funct3(insn)) {
        (0b0000000, FUNCT3_ADD_SUB) => lhs.wrapping_add(rhs),
        (0b0100000, FUNCT3_ADD_SUB) => lhs.wrapping_sub(rhs),
        (0b0000000, FUNCT3_SLL) => lhs << shamt,
        (0b0000000, FUNCT3_SLT) => ((lhs as i64) < (rhs as i64)) as u64,
        (0b0000000, FUNCT3_SLTU) => (lhs < rhs) as u64,
        (0b0000000, FUNCT3_XOR) => lhs ^ rhs,
        (0b0000000, FUNCT3_SRL_SRA) => lhs >> shamt,
        (0b0100000, FUNCT3_SRL_SRA) => ((lhs as i64) >> shamt) as u64,
        (0b0000000, FUNCT3_OR) => lhs | rhs,
        (0b0000000, FUNCT3_AND) => lhs & rhs,
        (0b0000001, funct3) => mul_div_op(lhs, rhs, funct3),
        _ => return illegal(a, insn),
    };
    write_rd(a, insn, result)?;
    advance(a, pc)
}

fn mul_div_op(lhs: u64, rhs: u64, funct3: u32) -> u64 {
    match funct3 {
        0b000 => lhs.wrapping_mul(rhs),
        0b001 => (((lhs as i64 as i128) * (rhs as i64 as i128)) >> 64) as u64,
        0b010 => (((lhs as i64 as i128) * (rhs as u128 as i128)) >> 64) as u64,
        0b011 => (((lhs as u128) * (rhs as u128)) >> 64) as u64,
        0b100 => {
            // div
            if rhs == 0 {
                u64::MAX
            } else {
                (lhs as i64).wrapping_div(rhs as i64) as u64
            }
        }
        0b101 => {
            // divu
            if rhs == 0 {
                u64::MAX
            } else {
                lhs / rhs
            }
        }
        0b110 => {
            // rem
            if rhs == 0 {
                lhs
            } else {
                (lhs as i64).wrapping_rem(rhs as i64) as u64
            }
        }
        _ => {
            // remu
            if rhs == 0 {
                lhs
            } else {
                lhs % rhs
            }
        }
    }
}

fn execute_op_32<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let lhs = a.read_x(rs1(insn))? as u32;
    let rhs = a.read_x(rs2(insn))? as u32;
    let shamt = rhs & 0x1F;
    let result: u32 = match (funct7(insn), funct3(insn)) {
        (0b0000000, FUNCT3_ADD_SUB) => lhs.wrapping_add(rhs),
        (0b0100000, FUNCT3_ADD_SUB) => lhs.wrapping_sub(rhs),
        (0b0000000, FUNCT3_SLL) => lhs << shamt,
        (0b0000000, FUNCT3_SRL_SRA) => lhs >> shamt,
        (0b0100000, FUNCT3_SRL_SRA) => ((lhs as i32) >> shamt) as u32,
        (0b0000001, 0b000) => lhs.wrapping_mul(rhs),
        (0b0000001, 0b100) => {
            if rhs == 0 {
                u32::MAX
            } else {
                (lhs as i32).wrapping_div(rhs as i32) as u32
            }
        }
        (0b0000001, 0b101) => {
            if rhs == 0 {
                u32::MAX
            } else {
                lhs / rhs
            }
        }
        (0b0000001, 0b110) => {
            if rhs == 0 {
                lhs
            } else {
                (lhs as i32).wrapping_rem(rhs as i32) as u32
            }
        }
        (0b0000001, 0b111) => {
            if rhs == 0 {
                lhs
            } else {
                lhs % rhs
            }
        }
        _ => return illegal(a, insn),
    };
    write_rd(a, insn, result as i32 as i64 as u64)?;
    advance(a, pc)
}

fn execute_system<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    match funct3(insn) {
        0 => match insn {
            0x0000_0073 => {
                // ECALL
                let prv = a.read_iflags_prv()?;
                raise_exception(a, CAUSE_ECALL_BASE + prv as u64, 0)?;
                Ok(ExecStatus::Trapped)
            }
            0x0010_0073 => {
                // EBREAK
                raise_exception(a, CAUSE_BREAKPOINT, pc)?;
                Ok(ExecStatus::Trapped)
            }
            0x1020_0073 => execute_sret(a, insn),
            0x3020_0073 => execute_mret(a, insn),
            0x1050_0073 => execute_wfi(a, pc, insn),
            _ if funct7(insn) == 0b0001001 && rd(insn) == 0 => execute_sfence_vma(a, pc, insn),
            _ => illegal(a, insn),
        },
        0b001 | 0b010 | 0b011 | 0b101 | 0b110 | 0b111 => execute_csr(a, pc, insn),
        _ => illegal(a, insn),
    }
}

fn execute_sret<A: StateAccess>(a: &mut A, insn: u32) -> Result<ExecStatus, A::Error> {
    let prv = a.read_iflags_prv()?;
    if prv < PRV_S {
        return illegal(a, insn);
    }
    let mut mstatus = a.read_mstatus()?;
    if prv == PRV_S && mstatus & MSTATUS_TSR != 0 {
        return illegal(a, insn);
    }
    let spp = ((mstatus & MSTATUS_SPP) >> 8) as u8;
    if mstatus & MSTATUS_SPIE != 0 {
        mstatus |= MSTATUS_SIE;
    } else {
        mstatus &= !MSTATUS_SIE;
    }
    mstatus |= MSTATUS_SPIE;
    mstatus &= !MSTATUS_SPP;
    a.write_mstatus(mstatus)?;
    if spp != prv {
        set_prv(a, spp)?;
    }
    let sepc = a.read_sepc()?;
    a.write_pc(sepc)?;
    Ok(ExecStatus::Retired)
}

fn execute_mret<A: StateAccess>(a: &mut A, insn: u32) -> Result<ExecStatus, A::Error> {
    let prv = a.read_iflags_prv()?;
    if prv < PRV_M {
        return illegal(a, insn);
    }
    let mut mstatus = a.read_mstatus()?;
    let mpp = ((mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT) as u8;
    if mstatus & MSTATUS_MPIE != 0 {
        mstatus |= MSTATUS_MIE;
    } else {
        mstatus &= !MSTATUS_MIE;
    }
    mstatus |= MSTATUS_MPIE;
    mstatus &= !MSTATUS_MPP;
    a.write_mstatus(mstatus)?;
    if mpp != prv {
        set_prv(a, mpp)?;
    }
    let mepc = a.read_mepc()?;
    a.write_pc(mepc)?;
    Ok(ExecStatus::Retired)
}

fn execute_wfi<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let prv = a.read_iflags_prv()?;
    if prv == PRV_U {
        return illegal(a, insn);
    }
    let mstatus = a.read_mstatus()?;
    if prv == PRV_S && mstatus & MSTATUS_TW != 0 {
        return illegal(a, insn);
    }
    a.set_iflags_i()?;
    a.set_brk();
    advance(a, pc)
}

fn execute_sfence_vma<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let prv = a.read_iflags_prv()?;
    if prv == PRV_U {
        return illegal(a, insn);
    }
    let mstatus = a.read_mstatus()?;
    if prv == PRV_S && mstatus & MSTATUS_TVM != 0 {
        return illegal(a, insn);
    }
    if rs1(insn) == 0 {
        a.flush_tlb();
    } else {
        let vaddr = a.read_x(rs1(insn))?;
        a.flush_tlb_vaddr(vaddr);
    }
    advance(a, pc)
}

fn execute_csr<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let csraddr = csr_index(insn);
    let funct3 = funct3(insn);
    // Immediate forms take rs1 as a zero-extended immediate.
    let arg = if funct3 & 0b100 != 0 {
        rs1(insn) as u64
    } else {
        a.read_x(rs1(insn))?
    };
    let old = match read_csr(a, csraddr)? {
        Some(old) => old,
        None => return illegal(a, insn),
    };
    let write = match funct3 & 0b11 {
        0b01 => Some(arg),
        // CSRRS/CSRRC leave the register alone when rs1 is x0.
        0b10 => (rs1(insn) != 0).then_some(old | arg),
        _ => (rs1(insn) != 0).then_some(old & !arg),
    };
    if let Some(new) = write {
        if !write_csr(a, csraddr, new)? {
            return illegal(a, insn);
        }
    }
    write_rd(a, insn, old)?;
    advance(a, pc)
}

fn counter_enabled<A: StateAccess>(a: &mut A, prv: u8, bit: u64) -> Result<bool, A::Error> {
    if prv < PRV_M {
        if a.read_mcounteren()? & bit == 0 {
            return Ok(false);
        }
        if prv < PRV_S && a.read_scounteren()? & bit == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_csr<A: StateAccess>(a: &mut A, csraddr: u32) -> Result<Option<u64>, A::Error> {
    let prv = a.read_iflags_prv()?;
    if ((csraddr >> 8) & 3) as u8 > prv {
        return Ok(None);
    }
    let val = match csraddr {
        CSR_CYCLE => {
            if !counter_enabled(a, prv, COUNTEREN_CY)? {
                return Ok(None);
            }
            a.read_mcycle()?
        }
        CSR_TIME => {
            if !counter_enabled(a, prv, COUNTEREN_TM)? {
                return Ok(None);
            }
            rtc_cycles_to_time(a.read_mcycle()?)
        }
        CSR_INSTRET => {
            if !counter_enabled(a, prv, COUNTEREN_IR)? {
                return Ok(None);
            }
            a.read_minstret()?
        }
        CSR_SSTATUS => a.read_mstatus()? & SSTATUS_R_MASK,
        CSR_SIE => a.read_mie()? & a.read_mideleg()?,
        CSR_STVEC => a.read_stvec()?,
        CSR_SCOUNTEREN => a.read_scounteren()?,
        CSR_SSCRATCH => a.read_sscratch()?,
        CSR_SEPC => a.read_sepc()?,
        CSR_SCAUSE => a.read_scause()?,
        CSR_STVAL => a.read_stval()?,
        CSR_SIP => a.read_mip()? & a.read_mideleg()?,
        CSR_SATP => {
            if prv == PRV_S && a.read_mstatus()? & MSTATUS_TVM != 0 {
                return Ok(None);
            }
            a.read_satp()?
        }
        CSR_MVENDORID => a.read_mvendorid()?,
        CSR_MARCHID => a.read_marchid()?,
        CSR_MIMPID => a.read_mimpid()?,
        CSR_MHARTID => 0,
        CSR_MSTATUS => a.read_mstatus()?,
        CSR_MISA => a.read_misa()?,
        CSR_MEDELEG => a.read_medeleg()?,
        CSR_MIDELEG => a.read_mideleg()?,
        CSR_MIE => a.read_mie()?,
        CSR_MTVEC => a.read_mtvec()?,
        CSR_MCOUNTEREN => a.read_mcounteren()?,
        CSR_MSCRATCH => a.read_mscratch()?,
        CSR_MEPC => a.read_mepc()?,
        CSR_MCAUSE => a.read_mcause()?,
        CSR_MTVAL => a.read_mtval()?,
        CSR_MIP => a.read_mip()?,
        CSR_MCYCLE => a.read_mcycle()?,
        CSR_MINSTRET => a.read_minstret()?,
        _ => return Ok(None),
    };
    Ok(Some(val))
}

/// Updates mstatus with masked bits, invalidating translations when the
/// bits the walker consults change.
fn update_mstatus<A: StateAccess>(a: &mut A, val: u64, mask: u64) -> Result<(), A::Error> {
    let old = a.read_mstatus()?;
    let new = (old & !mask) | (val & mask);
    if (old ^ new) & (MSTATUS_MPRV | MSTATUS_SUM | MSTATUS_MXR | MSTATUS_MPP) != 0 {
        a.flush_tlb();
    }
    a.write_mstatus(new)
}

const MEDELEG_W_MASK: u64 = 0xFFFF & !(1 << 11);
const MIDELEG_W_MASK: u64 = MIP_SSIP | MIP_STIP | MIP_SEIP;
const MIE_W_MASK: u64 = MIP_MSIP | MIP_MTIP | MIP_MEIP | MIP_SSIP | MIP_STIP | MIP_SEIP;

fn write_tvec(val: u64) -> u64 {
    // Direct and vectored modes only.
    if val & 3 <= 1 {
        val
    } else {
        val & !3
    }
}

fn write_csr<A: StateAccess>(a: &mut A, csraddr: u32, val: u64) -> Result<bool, A::Error> {
    if (csraddr >> 10) & 3 == 3 {
        // Read-only space.
        return Ok(false);
    }
    let prv = a.read_iflags_prv()?;
    if ((csraddr >> 8) & 3) as u8 > prv {
        return Ok(false);
    }
    match csraddr {
        CSR_SSTATUS => update_mstatus(a, val, SSTATUS_W_MASK)?,
        CSR_SIE => {
            let mideleg = a.read_mideleg()?;
            let mie = a.read_mie()?;
            a.write_mie((mie & !mideleg) | (val & mideleg))?;
            a.set_brk_from_all();
        }
        CSR_STVEC => a.write_stvec(write_tvec(val))?,
        CSR_SCOUNTEREN => a.write_scounteren(val & COUNTEREN_MASK)?,
        CSR_SSCRATCH => a.write_sscratch(val)?,
        CSR_SEPC => a.write_sepc(val & !1)?,
        CSR_SCAUSE => a.write_scause(val)?,
        CSR_STVAL => a.write_stval(val)?,
        CSR_SIP => {
            let mask = MIP_SSIP & a.read_mideleg()?;
            let mip = a.read_mip()?;
            a.write_mip((mip & !mask) | (val & mask))?;
            a.set_brk_from_all();
        }
        CSR_SATP => {
            if prv == PRV_S && a.read_mstatus()? & MSTATUS_TVM != 0 {
                return Ok(false);
            }
            let mode = val >> SATP_MODE_SHIFT;
            // Unsupported modes leave satp untouched.
            if matches!(mode, SATP_MODE_BARE | SATP_MODE_SV39 | SATP_MODE_SV48) {
                a.write_satp((val & SATP_PPN_MASK) | (mode << SATP_MODE_SHIFT))?;
                a.flush_tlb();
            }
        }
        CSR_MSTATUS => update_mstatus(a, val, MSTATUS_W_MASK)?,
        CSR_MISA => {}
        CSR_MEDELEG => a.write_medeleg(val & MEDELEG_W_MASK)?,
        CSR_MIDELEG => {
            a.write_mideleg(val & MIDELEG_W_MASK)?;
        }
        CSR_MIE => {
            let mie = a.read_mie()?;
            a.write_mie((mie & !MIE_W_MASK) | (val & MIE_W_MASK))?;
            a.set_brk_from_all();
        }
        CSR_MTVEC => a.write_mtvec(write_tvec(val))?,
        CSR_MCOUNTEREN => a.write_mcounteren(val & COUNTEREN_MASK)?,
        CSR_MSCRATCH => a.write_mscratch(val)?,
        CSR_MEPC => a.write_mepc(val & !1)?,
        CSR_MCAUSE => a.write_mcause(val)?,
        CSR_MTVAL => a.write_mtval(val)?,
        CSR_MIP => {
            let mask = MIP_SSIP | MIP_STIP;
            let mip = a.read_mip()?;
            a.write_mip((mip & !mask) | (val & mask))?;
            a.set_brk_from_all();
        }
        CSR_MCYCLE => a.write_mcycle(val)?,
        CSR_MINSTRET => a.write_minstret(val)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn execute_amo<A: StateAccess>(a: &mut A, pc: u64, insn: u32) -> Result<ExecStatus, A::Error> {
    let size_log2 = match funct3(insn) {
        0b010 => 2,
        0b011 => 3,
        _ => return illegal(a, insn),
    };
    match funct5(insn) {
        FUNCT5_LR => execute_lr(a, pc, insn, size_log2),
        FUNCT5_SC => execute_sc(a, pc, insn, size_log2),
        FUNCT5_AMOSWAP => execute_amo_op(a, pc, insn, size_log2, |_, b| b),
        FUNCT5_AMOADD => execute_amo_op(a, pc, insn, size_log2, |x, b| x.wrapping_add(b)),
        FUNCT5_AMOXOR => execute_amo_op(a, pc, insn, size_log2, |x, b| x ^ b),
        FUNCT5_AMOAND => execute_amo_op(a, pc, insn, size_log2, |x, b| x & b),
        FUNCT5_AMOOR => execute_amo_op(a, pc, insn, size_log2, |x, b| x | b),
        FUNCT5_AMOMIN => {
            execute_amo_op(a, pc, insn, size_log2, |x, b| {
                if (x as i64) < (b as i64) {
                    x
                } else {
                    b
                }
            })
        }
        FUNCT5_AMOMAX => {
            execute_amo_op(a, pc, insn, size_log2, |x, b| {
                if (x as i64) > (b as i64) {
                    x
                } else {
                    b
                }
            })
        }
        FUNCT5_AMOMINU => execute_amo_op(a, pc, insn, size_log2, |x, b| x.min(b)),
        FUNCT5_AMOMAXU => execute_amo_op(a, pc, insn, size_log2, |x, b| x.max(b)),
        _ => illegal(a, insn),
    }
}

/// Resolves an AMO target: alignment, translation and PMA checks, all with
/// store semantics.
fn amo_target<A: StateAccess>(
    a: &mut A,
    vaddr: u64,
    size_log2: u32,
) -> Result<Option<(u64, usize)>, A::Error> {
    let size = 1u64 << size_log2;
    if vaddr & (size - 1) != 0 {
        raise_exception(a, CAUSE_STORE_ADDRESS_MISALIGNED, vaddr)?;
        return Ok(None);
    }
    let paddr = match translate_virtual_address(a, vaddr, VmAccess::Store)? {
        Some(paddr) => paddr,
        None => {
            raise_exception(a, CAUSE_STORE_PAGE_FAULT, vaddr)?;
            return Ok(None);
        }
    };
    let view = a.find_pma_entry(paddr, size)?;
    if view.kind != PmaKind::Memory || !view.flags.r || !view.flags.w {
        raise_exception(a, CAUSE_STORE_ACCESS_FAULT, vaddr)?;
        return Ok(None);
    }
    Ok(Some((paddr, view.index)))
}

fn execute_lr<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: u32,
    size_log2: u32,
) -> Result<ExecStatus, A::Error> {
    let vaddr = a.read_x(rs1(insn))?;
    let size = 1u64 << size_log2;
    if vaddr & (size - 1) != 0 {
        raise_exception(a, CAUSE_LOAD_ADDRESS_MISALIGNED, vaddr)?;
        return Ok(ExecStatus::Trapped);
    }
    let paddr = match translate_virtual_address(a, vaddr, VmAccess::Load)? {
        Some(paddr) => paddr,
        None => {
            raise_exception(a, CAUSE_LOAD_PAGE_FAULT, vaddr)?;
            return Ok(ExecStatus::Trapped);
        }
    };
    let view = a.find_pma_entry(paddr, size)?;
    if view.kind != PmaKind::Memory || !view.flags.r {
        raise_exception(a, CAUSE_LOAD_ACCESS_FAULT, vaddr)?;
        return Ok(ExecStatus::Trapped);
    }
    let val = a.read_memory(paddr, view.index, size_log2)?;
    a.write_ilrsc(paddr)?;
    write_rd(a, insn, sign_extend(val, size_log2))?;
    advance(a, pc)
}

fn execute_sc<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: u32,
    size_log2: u32,
) -> Result<ExecStatus, A::Error> {
    let vaddr = a.read_x(rs1(insn))?;
    let val = a.read_x(rs2(insn))?;
    let (paddr, pma_index) = match amo_target(a, vaddr, size_log2)? {
        Some(target) => target,
        None => return Ok(ExecStatus::Trapped),
    };
    let reserved = a.read_ilrsc()?;
    let success = reserved == paddr;
    if success {
        a.write_memory(paddr, pma_index, val, size_log2)?;
    }
    a.write_ilrsc(ILRSC_NONE)?;
    write_rd(a, insn, !success as u64)?;
    advance(a, pc)
}

fn execute_amo_op<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: u32,
    size_log2: u32,
    op: fn(u64, u64) -> u64,
) -> Result<ExecStatus, A::Error> {
    let vaddr = a.read_x(rs1(insn))?;
    let rhs = a.read_x(rs2(insn))?;
    let (paddr, pma_index) = match amo_target(a, vaddr, size_log2)? {
        Some(target) => target,
        None => return Ok(ExecStatus::Trapped),
    };
    let old = sign_extend(a.read_memory(paddr, pma_index, size_log2)?, size_log2);
    let new = if size_log2 == 2 {
        op(old, sign_extend(rhs, 2)) & 0xFFFF_FFFF
    } else {
        op(old, rhs)
    };
    a.write_memory(paddr, pma_index, new, size_log2)?;
    write_rd(a, insn, old)?;
    advance(a, pc)
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

    fn machine() -> MachineState {
        let mut state = MachineState::new();
        state.register_pma(PmaEntry::ram(PMA_RAM_START, 0x4000).unwrap()).unwrap();
        state.pc = PMA_RAM_START;
        state
    }

    fn exec(state: &mut MachineState, insn: u32) -> ExecStatus {
        let pc = state.pc;
        let mut a = DirectAccess::new(state);
        unerr(execute_insn(&mut a, pc, insn))
    }

    #[test]
    fn add_and_advance() {
        let mut state = machine();
        state.x[1] = 5;
        state.x[2] = 7;
        // add x3, x1, x2
        assert_eq!(exec(&mut state, 0x002081B3), ExecStatus::Retired);
        assert_eq!(state.x[3], 12);
        assert_eq!(state.pc, PMA_RAM_START + 4);
    }

    #[test]
    fn writes_to_x0_are_dropped() {
        let mut state = machine();
        state.x[1] = 5;
        // addi x0, x1, 1
        exec(&mut state, 0x00108013);
        assert_eq!(state.x[0], 0);
    }

    #[test]
    fn division_edge_cases() {
        assert_eq!(mul_div_op(5, 0, 0b100), u64::MAX);
        assert_eq!(mul_div_op(5, 0, 0b110), 5);
        assert_eq!(mul_div_op(i64::MIN as u64, u64::MAX, 0b100), i64::MIN as u64);
        assert_eq!(mul_div_op(i64::MIN as u64, u64::MAX, 0b110), 0);
        assert_eq!(mul_div_op(7, 2, 0b100), 3);
    }

    #[test]
    fn addiw_sign_extends() {
        let mut state = machine();
        state.x[1] = 0x7FFF_FFFF;
        // addiw x2, x1, 1
        exec(&mut state, 0x0010811B);
        assert_eq!(state.x[2], 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn store_then_load_round_trip() {
        let mut state = machine();
        state.x[1] = PMA_RAM_START + 0x100;
        state.x[2] = 0x1122_3344_5566_7788;
        // sd x2, 0(x1)
        assert_eq!(exec(&mut state, 0x0020B023), ExecStatus::Retired);
        // ld x3, 0(x1)
        assert_eq!(exec(&mut state, 0x0000B183), ExecStatus::Retired);
        assert_eq!(state.x[3], 0x1122_3344_5566_7788);
    }

    #[test]
    fn misaligned_load_traps() {
        let mut state = machine();
        state.mtvec = PMA_RAM_START + 0x1000;
        state.x[1] = PMA_RAM_START + 1;
        // ld x3, 0(x1)
        assert_eq!(exec(&mut state, 0x0000B183), ExecStatus::Trapped);
        assert_eq!(state.mcause, CAUSE_LOAD_ADDRESS_MISALIGNED);
        assert_eq!(state.mtval, PMA_RAM_START + 1);
        assert_eq!(state.pc, PMA_RAM_START + 0x1000);
    }

    #[test]
    fn csrrw_swaps() {
        let mut state = machine();
        state.mscratch = 0xAA;
        state.x[1] = 0xBB;
        // csrrw x2, mscratch, x1
        exec(&mut state, 0x34009173);
        assert_eq!(state.x[2], 0xAA);
        assert_eq!(state.mscratch, 0xBB);
    }

    #[test]
    fn csr_priv_violation_is_illegal() {
        let mut state = machine();
        state.iflags.prv = PRV_U;
        state.mtvec = PMA_RAM_START + 0x1000;
        // csrrw x2, mscratch, x1 from U mode
        assert_eq!(exec(&mut state, 0x34009173), ExecStatus::Trapped);
        assert_eq!(state.mcause, CAUSE_ILLEGAL_INSN);
    }

    #[test]
    fn lr_sc_success_and_reset() {
        let mut state = machine();
        let addr = PMA_RAM_START + 0x200;
        state.x[2] = addr;
        state.x[4] = 77;
        // lr.d x1, (x2)
        exec(&mut state, 0x1001_30AF);
        assert_eq!(state.ilrsc, addr);
        // sc.d x3, x4, (x2)
        exec(&mut state, 0x1841_31AF);
        assert_eq!(state.x[3], 0, "sc must succeed");
        assert_eq!(state.read_word(addr), Some(77));
        assert_eq!(state.ilrsc, ILRSC_NONE);
    }

    #[test]
    fn sc_without_reservation_fails() {
        let mut state = machine();
        let addr = PMA_RAM_START + 0x200;
        state.x[2] = addr;
        state.x[4] = 77;
        // sc.d x3, x4, (x2)
        exec(&mut state, 0x1841_31AF);
        assert_eq!(state.x[3], 1);
        assert_eq!(state.read_word(addr), Some(0));
    }

    #[test]
    fn amoadd_returns_old_value() {
        let mut state = machine();
        let addr = PMA_RAM_START + 0x300;
        let index = state.find_pma_index(addr, 8).unwrap();
        state.pma_write(index, addr, 40, 3);
        state.x[2] = addr;
        state.x[4] = 2;
        // amoadd.d x1, x4, (x2)
        exec(&mut state, 0x0041_30AF);
        assert_eq!(state.x[1], 40);
        assert_eq!(state.read_word(addr), Some(42));
    }

    #[test]
    fn satp_write_flushes_the_tlb() {
        let mut state = machine();
        state.x[1] = PMA_RAM_START + 0x100;
        // ld x3, 0(x1) installs a read TLB entry.
        exec(&mut state, 0x0000B183);
        let idx = ((PMA_RAM_START >> 12) as usize) & 0xFF;
        assert_eq!(state.tlb_read[idx].vaddr_page, PMA_RAM_START);

        // csrrw x0, satp, x0
        assert_eq!(exec(&mut state, 0x18001073), ExecStatus::Retired);
        assert_eq!(state.tlb_read[idx].vaddr_page, u64::MAX);
    }

    #[test]
    fn sfence_vma_flushes_the_tlb() {
        let mut state = machine();
        state.x[1] = PMA_RAM_START + 0x100;
        exec(&mut state, 0x0000B183);
        let idx = ((PMA_RAM_START >> 12) as usize) & 0xFF;
        assert_eq!(state.tlb_read[idx].vaddr_page, PMA_RAM_START);

        // sfence.vma x0, x0
        assert_eq!(exec(&mut state, 0x1200_0073), ExecStatus::Retired);
        assert_eq!(state.tlb_read[idx].vaddr_page, u64::MAX);
    }

    #[test]
    fn wfi_sets_idle_and_breaks() {
        let mut state = machine();
        assert_eq!(exec(&mut state, 0x1050_0073), ExecStatus::Retired);
        assert!(state.iflags.i);
        assert!(state.brk);
    }

    #[test]
    fn mret_restores_privilege() {
        let mut state = machine();
        state.mstatus |= (PRV_U as u64) << MSTATUS_MPP_SHIFT | MSTATUS_MPIE;
        state.mepc = PMA_RAM_START + 0x40;
        assert_eq!(exec(&mut state, 0x3020_0073), ExecStatus::Retired);
        assert_eq!(state.iflags.prv, PRV_U);
        assert_eq!(state.pc, PMA_RAM_START + 0x40);
        assert_ne!(state.mstatus & MSTATUS_MIE, 0);
    }
}
