//! Instruction semantics for both encodings.
//!
//! Each handler performs its memory accesses before touching registers, so a faulting
//! instruction leaves the register file unchanged.

use geovm_mem::{Width, CONSOLE_INPUT, CONSOLE_OUTPUT};
use geovm_mmu::Privilege;
use tracing::debug;

use crate::bus::CpuBus;
use crate::csr::{
    self, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_MPP_SHIFT, MSTATUS_SIE, MSTATUS_SPIE,
    MSTATUS_SPP,
};
use crate::engine::{Engine, Flow};
use crate::error::{ExecError, HaltReason};
use crate::legacy;
use crate::rv32::{self, CsrOp, CsrSource, LoadKind, StoreKind};

impl<B: CpuBus> Engine<B> {
    pub(crate) fn exec_legacy(
        &mut self,
        insn: legacy::Instruction,
        pc: u32,
    ) -> Result<Flow, ExecError> {
        use legacy::Instruction as I;

        match insn {
            I::Nop => {}
            I::MovImm { dst, imm } => self.set_reg(dst.into(), u32::from(imm)),
            I::MovReg { dst, src } => self.set_reg(dst.into(), self.reg(src.into())),
            I::Alu {
                op,
                dst,
                src1,
                src2,
            } => {
                let value = op.apply(self.reg(src1.into()), self.reg(src2.into()));
                self.set_reg(dst.into(), value);
            }
            I::Load { dst, addr } => {
                let value = self.mem_load(self.reg(addr.into()), Width::Word)?;
                self.set_reg(dst.into(), value as u32);
            }
            I::LoadConsole { dst } => {
                let value = self.mem_load(self.console_addr(CONSOLE_INPUT), Width::Byte)?;
                self.set_reg(dst.into(), value as u32);
            }
            I::Store { addr, src } => {
                let value = self.reg(src.into());
                self.mem_store(self.reg(addr.into()), Width::Word, u64::from(value))?;
            }
            I::StoreConsole { src } => {
                let value = self.reg(src.into()) & 0xff;
                self.mem_store(self.console_addr(CONSOLE_OUTPUT), Width::Byte, u64::from(value))?;
            }
            I::Jmp { target } => {
                return Ok(Flow::Jump(
                    self.text_base().wrapping_add(u32::from(target) * 4),
                ));
            }
            I::Beq { a, b, offset } => {
                if self.reg(a.into()) == self.reg(b.into()) {
                    return Ok(Flow::Jump(branch_target(pc, i32::from(offset) * 4)));
                }
            }
            I::Bne { a, b, offset } => {
                if self.reg(a.into()) != self.reg(b.into()) {
                    return Ok(Flow::Jump(branch_target(pc, i32::from(offset) * 4)));
                }
            }
            I::Halt => return Ok(Flow::Halt(HaltReason::Halt)),
        }
        Ok(Flow::Next)
    }

    pub(crate) fn exec_rv32(&mut self, insn: rv32::Instruction, pc: u32) -> Result<Flow, ExecError> {
        use rv32::Instruction as I;

        let link = pc.wrapping_add(4);
        match insn {
            I::Lui { rd, imm } => self.set_reg(rd.into(), imm),
            I::Auipc { rd, imm } => self.set_reg(rd.into(), pc.wrapping_add(imm)),
            I::Jal { rd, offset } => {
                self.set_reg(rd.into(), link);
                return Ok(Flow::Jump(branch_target(pc, offset)));
            }
            I::Jalr { rd, rs1, offset } => {
                // Target is computed before the link write in case rd == rs1.
                let target = self.reg(rs1.into()).wrapping_add_signed(offset) & !1;
                self.set_reg(rd.into(), link);
                return Ok(Flow::Jump(target));
            }
            I::Branch {
                cond,
                rs1,
                rs2,
                offset,
            } => {
                if cond.taken(self.reg(rs1.into()), self.reg(rs2.into())) {
                    return Ok(Flow::Jump(branch_target(pc, offset)));
                }
            }
            I::Load {
                kind,
                rd,
                rs1,
                offset,
            } => {
                let addr = self.reg(rs1.into()).wrapping_add_signed(offset);
                let value = match kind {
                    LoadKind::Byte => self.mem_load(addr, Width::Byte)? as u8 as i8 as i32 as u32,
                    LoadKind::Half => self.mem_load(addr, Width::Half)? as u16 as i16 as i32 as u32,
                    LoadKind::Word => self.mem_load(addr, Width::Word)? as u32,
                    LoadKind::ByteUnsigned => self.mem_load(addr, Width::Byte)? as u32,
                    LoadKind::HalfUnsigned => self.mem_load(addr, Width::Half)? as u32,
                };
                self.set_reg(rd.into(), value);
            }
            I::Store {
                kind,
                rs1,
                rs2,
                offset,
            } => {
                let addr = self.reg(rs1.into()).wrapping_add_signed(offset);
                let width = match kind {
                    StoreKind::Byte => Width::Byte,
                    StoreKind::Half => Width::Half,
                    StoreKind::Word => Width::Word,
                };
                let value = u64::from(self.reg(rs2.into())) & width.mask();
                self.mem_store(addr, width, value)?;
            }
            I::OpImm { op, rd, rs1, imm } => {
                let value = op.apply(self.reg(rs1.into()), imm as u32);
                self.set_reg(rd.into(), value);
            }
            I::Op { op, rd, rs1, rs2 } => {
                let value = op.apply(self.reg(rs1.into()), self.reg(rs2.into()));
                self.set_reg(rd.into(), value);
            }
            I::Fence | I::FenceI | I::Wfi => {}
            I::Ecall => return self.syscall(pc),
            I::Ebreak => return Ok(Flow::Halt(HaltReason::Breakpoint)),
            I::Mret => return Ok(self.mret()),
            I::Sret => return Ok(self.sret()),
            I::SfenceVma { .. } => self.bus.sfence_vma(),
            I::Csr { op, rd, csr, src } => self.exec_csr(op, rd, csr, src),
        }
        Ok(Flow::Next)
    }

    fn exec_csr(&mut self, op: CsrOp, rd: u8, addr: u16, src: CsrSource) {
        let old = self.csr(addr);
        let (operand, operand_is_zero_reg) = match src {
            CsrSource::Reg(rs1) => (self.reg(rs1.into()), rs1 == 0),
            CsrSource::Imm(imm) => (u32::from(imm), imm == 0),
        };
        // CSRRS/CSRRC with x0 (or a zero immediate) read without writing.
        let writes = op == CsrOp::ReadWrite || !operand_is_zero_reg;
        let new = match op {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old | operand,
            CsrOp::ReadClear => old & !operand,
        };

        if writes {
            if csr::is_read_only(addr) || addr == csr::MISA {
                debug!(pc = self.pc, csr = addr, "write to read-only csr ignored");
            } else {
                self.csrs.set(addr, new);
            }
        }
        if addr == csr::SATP {
            self.bus.set_satp(self.csrs.get(csr::SATP));
        }
        self.set_reg(rd.into(), old);
    }

    fn mret(&mut self) -> Flow {
        let mstatus = self.csrs.mstatus();
        let target = Privilege::from_bits((mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT);
        let mut next = mstatus & !(MSTATUS_MIE | MSTATUS_MPP);
        if mstatus & MSTATUS_MPIE != 0 {
            next |= MSTATUS_MIE;
        }
        next |= MSTATUS_MPIE;
        self.csrs.set_mstatus(next);
        self.set_privilege(target);
        Flow::Jump(self.csrs.get(csr::MEPC))
    }

    fn sret(&mut self) -> Flow {
        let mstatus = self.csrs.mstatus();
        let target = if mstatus & MSTATUS_SPP != 0 {
            Privilege::Supervisor
        } else {
            Privilege::User
        };
        let mut next = mstatus & !(MSTATUS_SIE | MSTATUS_SPP);
        if mstatus & MSTATUS_SPIE != 0 {
            next |= MSTATUS_SIE;
        }
        next |= MSTATUS_SPIE;
        self.csrs.set_mstatus(next);
        self.set_privilege(target);
        Flow::Jump(self.csrs.get(csr::SEPC))
    }
}

#[inline]
fn branch_target(pc: u32, offset: i32) -> u32 {
    pc.wrapping_add_signed(offset)
}
