//! The legacy 4-field encoding: each little-endian word is `[opcode, dst, src1, src2]`.

use crate::error::DecodeError;

pub const OP_NOP: u8 = 0x00;
pub const OP_MOV: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_SUB: u8 = 0x03;
pub const OP_MUL: u8 = 0x04;
pub const OP_DIV: u8 = 0x05;
pub const OP_AND: u8 = 0x06;
pub const OP_OR: u8 = 0x07;
pub const OP_XOR: u8 = 0x08;
pub const OP_SHL: u8 = 0x09;
pub const OP_SHR: u8 = 0x0A;
pub const OP_LOAD: u8 = 0x10;
pub const OP_STORE: u8 = 0x11;
pub const OP_JMP: u8 = 0x20;
pub const OP_BEQ: u8 = 0x21;
pub const OP_BNE: u8 = 0x22;
pub const OP_HALT: u8 = 0xFF;

/// Register field value routing `LOAD` / `STORE` to the console window.
pub const CONSOLE_REGISTER: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl AluOp {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::Div => a.checked_div(b).unwrap_or(u32::MAX),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => a << (b & 31),
            AluOp::Shr => a >> (b & 31),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    /// `src2 == 0`: the `src1` field is an immediate.
    MovImm { dst: u8, imm: u8 },
    MovReg { dst: u8, src: u8 },
    Alu { op: AluOp, dst: u8, src1: u8, src2: u8 },
    /// `R[dst] = mem32[R[addr]]`.
    Load { dst: u8, addr: u8 },
    /// `R[dst] = console input byte`.
    LoadConsole { dst: u8 },
    /// `mem32[R[addr]] = R[src]`.
    Store { addr: u8, src: u8 },
    /// Low byte of `R[src]` to console output.
    StoreConsole { src: u8 },
    /// Absolute jump to word index `target` of the text segment.
    Jmp { target: u16 },
    /// Relative branch by `offset` words when `R[a] == R[b]`.
    Beq { a: u8, b: u8, offset: i8 },
    Bne { a: u8, b: u8, offset: i8 },
    Halt,
}

/// Splits a word into `[opcode, dst, src1, src2]`.
#[inline]
pub const fn fields(word: u32) -> [u8; 4] {
    word.to_le_bytes()
}

#[inline]
pub const fn encode(opcode: u8, dst: u8, src1: u8, src2: u8) -> u32 {
    u32::from_le_bytes([opcode, dst, src1, src2])
}

pub fn decode(word: u32) -> Result<Instruction, DecodeError> {
    let [opcode, dst, src1, src2] = fields(word);
    let reg = |field: u8| {
        if field < 32 {
            Ok(field)
        } else {
            Err(DecodeError::BadRegister { word, field })
        }
    };

    let alu = |op| -> Result<Instruction, DecodeError> {
        Ok(Instruction::Alu {
            op,
            dst: reg(dst)?,
            src1: reg(src1)?,
            src2: reg(src2)?,
        })
    };

    match opcode {
        OP_NOP => Ok(Instruction::Nop),
        OP_MOV if src2 == 0 => Ok(Instruction::MovImm {
            dst: reg(dst)?,
            imm: src1,
        }),
        OP_MOV => Ok(Instruction::MovReg {
            dst: reg(dst)?,
            src: reg(src1)?,
        }),
        OP_ADD => alu(AluOp::Add),
        OP_SUB => alu(AluOp::Sub),
        OP_MUL => alu(AluOp::Mul),
        OP_DIV => alu(AluOp::Div),
        OP_AND => alu(AluOp::And),
        OP_OR => alu(AluOp::Or),
        OP_XOR => alu(AluOp::Xor),
        OP_SHL => alu(AluOp::Shl),
        OP_SHR => alu(AluOp::Shr),
        OP_LOAD if src1 == CONSOLE_REGISTER => Ok(Instruction::LoadConsole { dst: reg(dst)? }),
        OP_LOAD => Ok(Instruction::Load {
            dst: reg(dst)?,
            addr: reg(src1)?,
        }),
        OP_STORE if dst == CONSOLE_REGISTER => Ok(Instruction::StoreConsole { src: reg(src1)? }),
        OP_STORE => Ok(Instruction::Store {
            addr: reg(dst)?,
            src: reg(src1)?,
        }),
        OP_JMP => Ok(Instruction::Jmp {
            target: u16::from_le_bytes([src1, src2]),
        }),
        OP_BEQ => Ok(Instruction::Beq {
            a: reg(dst)?,
            b: reg(src1)?,
            offset: src2 as i8,
        }),
        OP_BNE => Ok(Instruction::Bne {
            a: reg(dst)?,
            b: reg(src1)?,
            offset: src2 as i8,
        }),
        OP_HALT => Ok(Instruction::Halt),
        _ => Err(DecodeError::UnknownOpcode { word, opcode }),
    }
}
