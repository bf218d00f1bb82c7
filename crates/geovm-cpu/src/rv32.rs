//! RV32 subset decoder: RV32I, the M extension, and the handful of privileged instructions
//! needed to run a small supervisor.

use crate::error::DecodeError;

pub const OPCODE_LOAD: u8 = 0x03;
pub const OPCODE_MISC_MEM: u8 = 0x0f;
pub const OPCODE_OP_IMM: u8 = 0x13;
pub const OPCODE_AUIPC: u8 = 0x17;
pub const OPCODE_STORE: u8 = 0x23;
pub const OPCODE_OP: u8 = 0x33;
pub const OPCODE_LUI: u8 = 0x37;
pub const OPCODE_BRANCH: u8 = 0x63;
pub const OPCODE_JALR: u8 = 0x67;
pub const OPCODE_JAL: u8 = 0x6f;
pub const OPCODE_SYSTEM: u8 = 0x73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

impl AluOp {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        let (sa, sb) = (a as i32, b as i32);
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Sll => a << (b & 31),
            AluOp::Slt => u32::from(sa < sb),
            AluOp::Sltu => u32::from(a < b),
            AluOp::Xor => a ^ b,
            AluOp::Srl => a >> (b & 31),
            AluOp::Sra => (sa >> (b & 31)) as u32,
            AluOp::Or => a | b,
            AluOp::And => a & b,
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::Mulh => ((i64::from(sa) * i64::from(sb)) >> 32) as u32,
            AluOp::Mulhsu => (i64::from(sa).wrapping_mul(i64::from(b)) >> 32) as u32,
            AluOp::Mulhu => ((u64::from(a) * u64::from(b)) >> 32) as u32,
            AluOp::Div => match sb {
                0 => u32::MAX,
                _ => sa.wrapping_div(sb) as u32,
            },
            AluOp::Divu => a.checked_div(b).unwrap_or(u32::MAX),
            AluOp::Rem => match sb {
                0 => a,
                _ => sa.wrapping_rem(sb) as u32,
            },
            AluOp::Remu => a.checked_rem(b).unwrap_or(a),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl BranchCond {
    pub fn taken(self, a: u32, b: u32) -> bool {
        match self {
            BranchCond::Eq => a == b,
            BranchCond::Ne => a != b,
            BranchCond::Lt => (a as i32) < (b as i32),
            BranchCond::Ge => (a as i32) >= (b as i32),
            BranchCond::Ltu => a < b,
            BranchCond::Geu => a >= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Byte,
    Half,
    Word,
    ByteUnsigned,
    HalfUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Byte,
    Half,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

/// Second CSR operand: a register for `CSRRW/S/C`, a 5-bit zero-extended immediate for the
/// `I` forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrSource {
    Reg(u8),
    Imm(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Lui { rd: u8, imm: u32 },
    Auipc { rd: u8, imm: u32 },
    Jal { rd: u8, offset: i32 },
    Jalr { rd: u8, rs1: u8, offset: i32 },
    Branch { cond: BranchCond, rs1: u8, rs2: u8, offset: i32 },
    Load { kind: LoadKind, rd: u8, rs1: u8, offset: i32 },
    Store { kind: StoreKind, rs1: u8, rs2: u8, offset: i32 },
    OpImm { op: AluOp, rd: u8, rs1: u8, imm: i32 },
    Op { op: AluOp, rd: u8, rs1: u8, rs2: u8 },
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    Wfi,
    Mret,
    Sret,
    SfenceVma { rs1: u8, rs2: u8 },
    Csr { op: CsrOp, rd: u8, csr: u16, src: CsrSource },
}

#[inline]
pub const fn opcode(word: u32) -> u8 {
    (word & 0x7f) as u8
}

#[inline]
pub const fn rd(word: u32) -> u8 {
    ((word >> 7) & 0x1f) as u8
}

#[inline]
pub const fn rs1(word: u32) -> u8 {
    ((word >> 15) & 0x1f) as u8
}

#[inline]
pub const fn rs2(word: u32) -> u8 {
    ((word >> 20) & 0x1f) as u8
}

#[inline]
const fn funct3(word: u32) -> u32 {
    (word >> 12) & 0x7
}

#[inline]
const fn funct7(word: u32) -> u32 {
    word >> 25
}

#[inline]
const fn imm_i(word: u32) -> i32 {
    (word as i32) >> 20
}

#[inline]
const fn imm_s(word: u32) -> i32 {
    (((word & 0xfe00_0000) as i32) >> 20) | ((word >> 7) & 0x1f) as i32
}

#[inline]
const fn imm_b(word: u32) -> i32 {
    (((word & 0x8000_0000) as i32) >> 19)
        | ((word & 0x80) << 4) as i32
        | ((word >> 20) & 0x7e0) as i32
        | ((word >> 7) & 0x1e) as i32
}

#[inline]
const fn imm_u(word: u32) -> u32 {
    word & 0xffff_f000
}

#[inline]
const fn imm_j(word: u32) -> i32 {
    (((word & 0x8000_0000) as i32) >> 11)
        | (word & 0x000f_f000) as i32
        | ((word >> 9) & 0x800) as i32
        | ((word >> 20) & 0x7fe) as i32
}

pub fn decode(word: u32) -> Result<Instruction, DecodeError> {
    let op = opcode(word);
    let unknown = DecodeError::UnknownOpcode { word, opcode: op };
    let (rd, rs1, rs2) = (rd(word), rs1(word), rs2(word));

    let insn = match op {
        OPCODE_LUI => Instruction::Lui {
            rd,
            imm: imm_u(word),
        },
        OPCODE_AUIPC => Instruction::Auipc {
            rd,
            imm: imm_u(word),
        },
        OPCODE_JAL => Instruction::Jal {
            rd,
            offset: imm_j(word),
        },
        OPCODE_JALR if funct3(word) == 0 => Instruction::Jalr {
            rd,
            rs1,
            offset: imm_i(word),
        },
        OPCODE_BRANCH => {
            let cond = match funct3(word) {
                0 => BranchCond::Eq,
                1 => BranchCond::Ne,
                4 => BranchCond::Lt,
                5 => BranchCond::Ge,
                6 => BranchCond::Ltu,
                7 => BranchCond::Geu,
                _ => return Err(unknown),
            };
            Instruction::Branch {
                cond,
                rs1,
                rs2,
                offset: imm_b(word),
            }
        }
        OPCODE_LOAD => {
            let kind = match funct3(word) {
                0 => LoadKind::Byte,
                1 => LoadKind::Half,
                2 => LoadKind::Word,
                4 => LoadKind::ByteUnsigned,
                5 => LoadKind::HalfUnsigned,
                _ => return Err(unknown),
            };
            Instruction::Load {
                kind,
                rd,
                rs1,
                offset: imm_i(word),
            }
        }
        OPCODE_STORE => {
            let kind = match funct3(word) {
                0 => StoreKind::Byte,
                1 => StoreKind::Half,
                2 => StoreKind::Word,
                _ => return Err(unknown),
            };
            Instruction::Store {
                kind,
                rs1,
                rs2,
                offset: imm_s(word),
            }
        }
        OPCODE_OP_IMM => {
            let imm = imm_i(word);
            let shamt = i32::from(rs2);
            let (op, imm) = match (funct3(word), funct7(word)) {
                (0, _) => (AluOp::Add, imm),
                (2, _) => (AluOp::Slt, imm),
                (3, _) => (AluOp::Sltu, imm),
                (4, _) => (AluOp::Xor, imm),
                (6, _) => (AluOp::Or, imm),
                (7, _) => (AluOp::And, imm),
                (1, 0x00) => (AluOp::Sll, shamt),
                (5, 0x00) => (AluOp::Srl, shamt),
                (5, 0x20) => (AluOp::Sra, shamt),
                _ => return Err(unknown),
            };
            Instruction::OpImm { op, rd, rs1, imm }
        }
        OPCODE_OP => {
            let op = match (funct7(word), funct3(word)) {
                (0x00, 0) => AluOp::Add,
                (0x20, 0) => AluOp::Sub,
                (0x00, 1) => AluOp::Sll,
                (0x00, 2) => AluOp::Slt,
                (0x00, 3) => AluOp::Sltu,
                (0x00, 4) => AluOp::Xor,
                (0x00, 5) => AluOp::Srl,
                (0x20, 5) => AluOp::Sra,
                (0x00, 6) => AluOp::Or,
                (0x00, 7) => AluOp::And,
                (0x01, 0) => AluOp::Mul,
                (0x01, 1) => AluOp::Mulh,
                (0x01, 2) => AluOp::Mulhsu,
                (0x01, 3) => AluOp::Mulhu,
                (0x01, 4) => AluOp::Div,
                (0x01, 5) => AluOp::Divu,
                (0x01, 6) => AluOp::Rem,
                (0x01, 7) => AluOp::Remu,
                _ => return Err(unknown),
            };
            Instruction::Op { op, rd, rs1, rs2 }
        }
        OPCODE_MISC_MEM => match funct3(word) {
            0 => Instruction::Fence,
            1 => Instruction::FenceI,
            _ => return Err(unknown),
        },
        OPCODE_SYSTEM => decode_system(word, rd, rs1, rs2).ok_or(unknown)?,
        _ => return Err(unknown),
    };
    Ok(insn)
}

fn decode_system(word: u32, rd: u8, rs1: u8, rs2: u8) -> Option<Instruction> {
    let csr = (word >> 20) as u16;
    let csr_op = |op, src| Some(Instruction::Csr { op, rd, csr, src });
    match funct3(word) {
        0 if funct7(word) == 0x09 && rd == 0 => Some(Instruction::SfenceVma { rs1, rs2 }),
        0 if rd != 0 || rs1 != 0 => None,
        0 => match csr {
            0x000 => Some(Instruction::Ecall),
            0x001 => Some(Instruction::Ebreak),
            0x102 => Some(Instruction::Sret),
            0x302 => Some(Instruction::Mret),
            0x105 => Some(Instruction::Wfi),
            _ => None,
        },
        1 => csr_op(CsrOp::ReadWrite, CsrSource::Reg(rs1)),
        2 => csr_op(CsrOp::ReadSet, CsrSource::Reg(rs1)),
        3 => csr_op(CsrOp::ReadClear, CsrSource::Reg(rs1)),
        5 => csr_op(CsrOp::ReadWrite, CsrSource::Imm(rs1)),
        6 => csr_op(CsrOp::ReadSet, CsrSource::Imm(rs1)),
        7 => csr_op(CsrOp::ReadClear, CsrSource::Imm(rs1)),
        _ => None,
    }
}

/// Instruction encoders, used by tests and by hosts assembling small guest programs.
pub mod asm {
    use super::*;

    #[inline]
    pub const fn r_type(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u8) -> u32 {
        (funct7 << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((rd as u32) << 7)
            | opcode as u32
    }

    #[inline]
    pub const fn i_type(imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u8) -> u32 {
        (((imm as u32) & 0xfff) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((rd as u32) << 7)
            | opcode as u32
    }

    #[inline]
    pub const fn s_type(imm: i32, rs2: u8, rs1: u8, funct3: u32, opcode: u8) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7f) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((imm & 0x1f) << 7)
            | opcode as u32
    }

    #[inline]
    pub const fn b_type(imm: i32, rs2: u8, rs1: u8, funct3: u32) -> u32 {
        let imm = imm as u32;
        (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3f) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | (((imm >> 1) & 0xf) << 8)
            | (((imm >> 11) & 1) << 7)
            | OPCODE_BRANCH as u32
    }

    #[inline]
    pub const fn u_type(imm: u32, rd: u8, opcode: u8) -> u32 {
        (imm & 0xffff_f000) | ((rd as u32) << 7) | opcode as u32
    }

    #[inline]
    pub const fn j_type(imm: i32, rd: u8) -> u32 {
        let imm = imm as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 12) & 0xff) << 12)
            | ((rd as u32) << 7)
            | OPCODE_JAL as u32
    }

    pub const fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
        i_type(imm, rs1, 0, rd, OPCODE_OP_IMM)
    }

    pub const fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
        r_type(0, rs2, rs1, 0, rd, OPCODE_OP)
    }

    pub const fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
        r_type(0x20, rs2, rs1, 0, rd, OPCODE_OP)
    }

    pub const fn mul(rd: u8, rs1: u8, rs2: u8) -> u32 {
        r_type(0x01, rs2, rs1, 0, rd, OPCODE_OP)
    }

    pub const fn div(rd: u8, rs1: u8, rs2: u8) -> u32 {
        r_type(0x01, rs2, rs1, 4, rd, OPCODE_OP)
    }

    pub const fn lui(rd: u8, imm: u32) -> u32 {
        u_type(imm, rd, OPCODE_LUI)
    }

    pub const fn auipc(rd: u8, imm: u32) -> u32 {
        u_type(imm, rd, OPCODE_AUIPC)
    }

    pub const fn jal(rd: u8, offset: i32) -> u32 {
        j_type(offset, rd)
    }

    pub const fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
        i_type(offset, rs1, 0, rd, OPCODE_JALR)
    }

    pub const fn beq(rs1: u8, rs2: u8, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 0)
    }

    pub const fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 1)
    }

    pub const fn blt(rs1: u8, rs2: u8, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 4)
    }

    pub const fn lw(rd: u8, rs1: u8, offset: i32) -> u32 {
        i_type(offset, rs1, 2, rd, OPCODE_LOAD)
    }

    pub const fn lbu(rd: u8, rs1: u8, offset: i32) -> u32 {
        i_type(offset, rs1, 4, rd, OPCODE_LOAD)
    }

    pub const fn lb(rd: u8, rs1: u8, offset: i32) -> u32 {
        i_type(offset, rs1, 0, rd, OPCODE_LOAD)
    }

    pub const fn sw(rs2: u8, rs1: u8, offset: i32) -> u32 {
        s_type(offset, rs2, rs1, 2, OPCODE_STORE)
    }

    pub const fn sb(rs2: u8, rs1: u8, offset: i32) -> u32 {
        s_type(offset, rs2, rs1, 0, OPCODE_STORE)
    }

    pub const fn csrrw(rd: u8, csr: u16, rs1: u8) -> u32 {
        i_type(csr as i32, rs1, 1, rd, OPCODE_SYSTEM)
    }

    pub const fn csrrs(rd: u8, csr: u16, rs1: u8) -> u32 {
        i_type(csr as i32, rs1, 2, rd, OPCODE_SYSTEM)
    }

    pub const fn csrrc(rd: u8, csr: u16, rs1: u8) -> u32 {
        i_type(csr as i32, rs1, 3, rd, OPCODE_SYSTEM)
    }

    pub const fn csrrwi(rd: u8, csr: u16, imm: u8) -> u32 {
        i_type(csr as i32, imm, 5, rd, OPCODE_SYSTEM)
    }

    pub const fn csrrsi(rd: u8, csr: u16, imm: u8) -> u32 {
        i_type(csr as i32, imm, 6, rd, OPCODE_SYSTEM)
    }

    pub const fn csrrci(rd: u8, csr: u16, imm: u8) -> u32 {
        i_type(csr as i32, imm, 7, rd, OPCODE_SYSTEM)
    }

    pub const ECALL: u32 = 0x0000_0073;
    pub const EBREAK: u32 = 0x0010_0073;
    pub const MRET: u32 = 0x3020_0073;
    pub const SRET: u32 = 0x1020_0073;
    pub const WFI: u32 = 0x1050_0073;
    pub const SFENCE_VMA: u32 = 0x1200_0073;
    pub const FENCE: u32 = 0x0ff0_000f;
}

#[cfg(test)]
mod tests {
    use super::asm::*;
    use super::*;

    #[test]
    fn decodes_known_words() {
        // addi a0, zero, 42
        assert_eq!(
            decode(0x02a0_0513),
            Ok(Instruction::OpImm {
                op: AluOp::Add,
                rd: 10,
                rs1: 0,
                imm: 42
            })
        );
        // auipc t0, 0x1
        assert_eq!(
            decode(0x0000_1297),
            Ok(Instruction::Auipc { rd: 5, imm: 0x1000 })
        );
        assert_eq!(decode(ECALL), Ok(Instruction::Ecall));
        assert_eq!(decode(MRET), Ok(Instruction::Mret));
        assert_eq!(
            decode(SFENCE_VMA),
            Ok(Instruction::SfenceVma { rs1: 0, rs2: 0 })
        );
    }

    #[test]
    fn immediates_round_trip_through_encoders() {
        for offset in [-4096, -2, 0, 2, 8, 4094] {
            assert_eq!(
                decode(beq(1, 2, offset)),
                Ok(Instruction::Branch {
                    cond: BranchCond::Eq,
                    rs1: 1,
                    rs2: 2,
                    offset
                })
            );
        }
        for offset in [-(1 << 20), -4, 0, 4, (1 << 20) - 2] {
            assert_eq!(decode(jal(1, offset)), Ok(Instruction::Jal { rd: 1, offset }));
        }
        for offset in [-2048, -1, 0, 2047] {
            assert_eq!(
                decode(sw(3, 4, offset)),
                Ok(Instruction::Store {
                    kind: StoreKind::Word,
                    rs1: 4,
                    rs2: 3,
                    offset
                })
            );
        }
    }

    #[test]
    fn csr_forms() {
        assert_eq!(
            decode(csrrw(1, 0x180, 2)),
            Ok(Instruction::Csr {
                op: CsrOp::ReadWrite,
                rd: 1,
                csr: 0x180,
                src: CsrSource::Reg(2)
            })
        );
        assert_eq!(
            decode(csrrwi(0, 0x305, 7)),
            Ok(Instruction::Csr {
                op: CsrOp::ReadWrite,
                rd: 0,
                csr: 0x305,
                src: CsrSource::Imm(7)
            })
        );
    }

    #[test]
    fn rejects_reserved_encodings() {
        for word in [
            0x0000_0000,                         // all zeros
            r_type(0x40, 1, 1, 0, 1, OPCODE_OP), // bad funct7
            i_type(0x400, 1, 1, 1, OPCODE_OP_IMM), // slli with funct7 != 0
            b_type(8, 1, 1, 2),                  // funct3 2 is not a branch
            i_type(0, 0, 4, 0, OPCODE_SYSTEM),   // funct3 4
        ] {
            assert!(matches!(
                decode(word),
                Err(DecodeError::UnknownOpcode { .. })
            ));
        }
    }

    #[test]
    fn m_extension_edge_cases() {
        assert_eq!(AluOp::Div.apply(7, 0), u32::MAX);
        assert_eq!(AluOp::Divu.apply(7, 0), u32::MAX);
        assert_eq!(AluOp::Rem.apply(7, 0), 7);
        assert_eq!(AluOp::Remu.apply(7, 0), 7);
        assert_eq!(AluOp::Div.apply(i32::MIN as u32, -1i32 as u32), i32::MIN as u32);
        assert_eq!(AluOp::Rem.apply(i32::MIN as u32, -1i32 as u32), 0);
        assert_eq!(AluOp::Div.apply(-7i32 as u32, 2), -3i32 as u32);
        assert_eq!(AluOp::Rem.apply(-7i32 as u32, 2), -1i32 as u32);
        assert_eq!(AluOp::Mulh.apply(-1i32 as u32, -1i32 as u32), 0);
        assert_eq!(AluOp::Mulhu.apply(u32::MAX, u32::MAX), 0xffff_fffe);
        assert_eq!(AluOp::Mulhsu.apply(-1i32 as u32, u32::MAX), u32::MAX);
        assert_eq!(AluOp::Sra.apply(0x8000_0000, 4), 0xf800_0000);
        assert_eq!(AluOp::Slt.apply(-1i32 as u32, 0), 1);
        assert_eq!(AluOp::Sltu.apply(-1i32 as u32, 0), 0);
    }
}
