//! geovm: a small virtual machine with a legacy 4-field ISA, an RV32IM subset, segmented memory
//! with console and framebuffer windows, and optional Sv32 translation.
//!
//! [`Machine`] picks the memory bus at runtime from a [`MachineConfig`]. Hosts that know the bus
//! statically can use [`geovm_cpu::Engine`] directly.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use geovm_cpu::{
    AccessKind, CpuSnapshot, Diagnostic, DiagnosticKind, Engine, ExecError, HaltReason,
    InstructionTrace, LoadedImage, MemoryAccess, OutputStream, PagingBus, RunExit, StepExit,
};
pub use geovm_image::{Image, ImageHeader, Isa, LoadError, LoaderLimits};
pub use geovm_mem::{
    DirtyRect, FramebufferError, LayoutError, Memory, MemoryBus, MemoryError, MemoryLayout,
    Resolution, Segment,
};
pub use geovm_mmu::{MmuStats, Privilege, TranslateFault};

/// Cycle budget used when a caller does not pass one.
pub const DEFAULT_MAX_CYCLES: u64 = 10_000_000;

/// Everything needed to build a [`Machine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub layout: MemoryLayout,
    /// Route accesses through the MMU. Translation is still off until the guest sets `satp`.
    pub enable_mmu: bool,
    pub limits: LoaderLimits,
    /// Budget for [`Machine::run_to_completion`].
    pub max_cycles: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            layout: MemoryLayout::default(),
            enable_mmu: false,
            limits: LoaderLimits::default(),
            max_cycles: DEFAULT_MAX_CYCLES,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid memory layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("failed to load image: {0}")]
    Load(#[from] LoadError),
}

/// An engine over either flat or paged memory.
#[derive(Debug)]
pub enum Machine {
    Flat(Engine<Memory>),
    Paged(Engine<PagingBus<Memory>>),
}

macro_rules! dispatch {
    ($self:expr, $engine:ident => $body:expr) => {
        match $self {
            Machine::Flat($engine) => $body,
            Machine::Paged($engine) => $body,
        }
    };
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Result<Self, MachineError> {
        let mut machine = if config.enable_mmu {
            Machine::Paged(Engine::paged(config.layout.clone())?)
        } else {
            Machine::Flat(Engine::flat(config.layout.clone())?)
        };
        dispatch!(&mut machine, e => e.set_loader_limits(config.limits));
        Ok(machine)
    }

    /// Build a machine and load `image` into it.
    pub fn with_image(config: &MachineConfig, image: &[u8]) -> Result<Self, MachineError> {
        let mut machine = Self::new(config)?;
        machine.load(image)?;
        Ok(machine)
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, Machine::Paged(_))
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<LoadedImage, LoadError> {
        dispatch!(self, e => e.load(bytes))
    }

    pub fn reset(&mut self) {
        dispatch!(self, e => e.reset())
    }

    pub fn step(&mut self) -> StepExit {
        dispatch!(self, e => e.step())
    }

    pub fn run(&mut self, max_cycles: u64) -> RunExit {
        dispatch!(self, e => e.run(max_cycles))
    }

    /// Run until the guest halts or `max_cycles` steps have elapsed, servicing injected
    /// interrupts along the way.
    pub fn run_to_completion(&mut self, max_cycles: u64) -> RunExit {
        let start = self.cycles();
        loop {
            let spent = self.cycles().saturating_sub(start);
            let remaining = max_cycles.saturating_sub(spent);
            if remaining == 0 {
                return RunExit::BudgetExhausted;
            }
            match self.run(remaining) {
                RunExit::Interrupted { .. } => continue,
                exit => return exit,
            }
        }
    }

    pub fn inject_interrupt(&mut self, cause: u32) {
        dispatch!(self, e => e.inject_interrupt(cause))
    }

    pub fn pc(&self) -> u32 {
        dispatch!(self, e => e.pc())
    }

    pub fn reg(&self, index: usize) -> u32 {
        dispatch!(self, e => e.reg(index))
    }

    pub fn cycles(&self) -> u64 {
        dispatch!(self, e => e.cycles())
    }

    pub fn instructions_executed(&self) -> u64 {
        dispatch!(self, e => e.instructions_executed())
    }

    pub fn is_halted(&self) -> bool {
        dispatch!(self, e => e.is_halted())
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        dispatch!(self, e => e.halt_reason())
    }

    pub fn last_error(&self) -> Option<&ExecError> {
        dispatch!(self, e => e.last_error())
    }

    pub fn isa(&self) -> Isa {
        dispatch!(self, e => e.isa())
    }

    pub fn privilege(&self) -> Privilege {
        dispatch!(self, e => e.privilege())
    }

    pub fn csr(&self, addr: u16) -> u32 {
        dispatch!(self, e => e.csr(addr))
    }

    pub fn get_state(&self) -> CpuSnapshot {
        dispatch!(self, e => e.get_state())
    }

    pub fn load_state(&mut self, snapshot: &CpuSnapshot) {
        dispatch!(self, e => e.load_state(snapshot))
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        dispatch!(self, e => e.take_diagnostics())
    }

    pub fn memory(&self) -> &Memory {
        dispatch!(self, e => e.memory())
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        dispatch!(self, e => e.memory_mut())
    }

    /// TLB and page-walk counters, if the MMU is enabled.
    pub fn mmu_stats(&self) -> Option<MmuStats> {
        match self {
            Machine::Flat(_) => None,
            Machine::Paged(e) => Some(e.bus().mmu().stats()),
        }
    }

    pub fn set_console_output(&mut self, sink: impl FnMut(u8) + 'static) {
        dispatch!(self, e => e.set_console_output(sink))
    }

    pub fn set_console_input(&mut self, source: impl FnMut() -> Option<u8> + 'static) {
        dispatch!(self, e => e.set_console_input(source))
    }

    pub fn set_syscall_output(&mut self, sink: impl FnMut(OutputStream, &[u8]) + 'static) {
        dispatch!(self, e => e.set_syscall_output(sink))
    }

    pub fn set_instruction_hook(&mut self, hook: impl FnMut(&InstructionTrace<'_>) + 'static) {
        dispatch!(self, e => e.set_instruction_hook(hook))
    }

    pub fn set_memory_hook(&mut self, hook: impl FnMut(&MemoryAccess) + 'static) {
        dispatch!(self, e => e.set_memory_hook(hook))
    }
}
