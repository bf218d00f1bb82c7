//! The geovm interpreter: a 32-register hart that executes either the legacy 4-field
//! encoding or an RV32IM subset with machine/supervisor CSRs, traps and host syscalls.
//!
//! [`Engine`] is generic over a [`CpuBus`]. Use [`Engine::flat`] for identity-mapped
//! memory or [`Engine::paged`] to route every access through the Sv32 MMU.

#![forbid(unsafe_code)]

mod bus;
pub mod csr;
mod engine;
mod error;
mod exec;
pub mod legacy;
mod paging_bus;
pub mod rv32;
mod snapshot;
pub mod syscall;
mod trace;

pub use bus::CpuBus;
pub use engine::{
    Diagnostic, DiagnosticKind, Engine, LoadedImage, RunExit, StepExit, MAX_DIAGNOSTICS,
};
pub use error::{DecodeError, ExecError, HaltReason};
pub use paging_bus::PagingBus;
pub use snapshot::CpuSnapshot;
pub use trace::{AccessKind, InstructionTrace, MemoryAccess, OutputStream};

pub use geovm_image::{Image, Isa, LoadError, LoaderLimits};
pub use geovm_mem::{Memory, MemoryBus, MemoryLayout, Width};
pub use geovm_mmu::{AccessType, Privilege, TranslateFault};

#[cfg(test)]
mod tests;
