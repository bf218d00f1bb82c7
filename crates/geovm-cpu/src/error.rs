use geovm_mem::MemoryError;
use geovm_mmu::TranslateFault;
use thiserror::Error;

/// An instruction word that could not be decoded. Executed as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{opcode:02x} in instruction 0x{word:08x}")]
    UnknownOpcode { word: u32, opcode: u8 },

    #[error("register field 0x{field:02x} out of range in instruction 0x{word:08x}")]
    BadRegister { word: u32, field: u8 },
}

/// A failure that stops execution (or, for translation faults, traps into the guest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("translation fault: {0}")]
    Translation(#[from] TranslateFault),
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Legacy `HALT` instruction.
    Halt,
    /// `exit` / `exit_group` syscall.
    Exit { code: i32 },
    /// `EBREAK`.
    Breakpoint,
    Error(ExecError),
    /// Halted state restored from a [`crate::CpuSnapshot`].
    Restored,
}
