use geovm_mem::Width;

/// Snapshot passed to the instruction hook before the instruction has any side effect.
#[derive(Debug, Clone, Copy)]
pub struct InstructionTrace<'a> {
    pub pc: u32,
    pub word: u32,
    /// Legacy: the opcode byte. RV32: the 7-bit major opcode.
    pub opcode: u8,
    /// Legacy: `[dst, src1, src2]`. RV32: `[rd, rs1, rs2]` fields.
    pub operands: [u8; 3],
    pub registers: &'a [u32; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Fetch,
    Read,
    Write,
}

/// One bus access made on behalf of the instruction at `pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub addr: u32,
    pub kind: AccessKind,
    pub width: Width,
    pub value: u64,
    pub pc: u32,
}

/// Destination of syscall `write` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

pub(crate) type InstructionHook = Box<dyn FnMut(&InstructionTrace<'_>)>;
pub(crate) type MemoryHook = Box<dyn FnMut(&MemoryAccess)>;
pub(crate) type SyscallOutput = Box<dyn FnMut(OutputStream, &[u8])>;
