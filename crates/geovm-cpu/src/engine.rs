use std::collections::VecDeque;
use std::fmt;

use geovm_image::{Image, ImageHeader, Isa, LoadError, LoaderLimits};
use geovm_mem::{LayoutError, Memory, MemoryBus, MemoryLayout, Segment, Width};
use geovm_mmu::{AccessType, Privilege, TranslateFault};
use tracing::{debug, info, warn};

use crate::bus::CpuBus;
use crate::csr::{
    self, CsrFile, CAUSE_FETCH_PAGE_FAULT, CAUSE_INTERRUPT, CAUSE_LOAD_PAGE_FAULT,
    CAUSE_STORE_PAGE_FAULT, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_MPP_SHIFT,
};
use crate::error::{DecodeError, ExecError, HaltReason};
use crate::paging_bus::PagingBus;
use crate::snapshot::CpuSnapshot;
use crate::trace::{
    AccessKind, InstructionHook, InstructionTrace, MemoryAccess, MemoryHook, OutputStream,
    SyscallOutput,
};
use crate::{legacy, rv32};

/// Diagnostics kept before the oldest entries are dropped.
pub const MAX_DIAGNOSTICS: usize = 64;

/// Outcome of a single [`Engine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// One instruction retired.
    Retired,
    /// A translation fault was delivered to the guest trap handler.
    Trapped { cause: u32 },
    /// A host-injected interrupt was consumed at this boundary.
    Interrupted { cause: u32 },
    Halted(HaltReason),
}

/// Why [`Engine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Halted(HaltReason),
    BudgetExhausted,
    Interrupted { cause: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Decode(DecodeError),
    UnknownSyscall { number: u32 },
}

/// A non-fatal problem recorded while executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub pc: u32,
    pub kind: DiagnosticKind,
}

/// Result of a successful [`Engine::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub header: ImageHeader,
    /// Initial program counter (`text_base + entry_point`).
    pub entry_pc: u32,
}

/// Control flow produced by executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(u32),
    Halt(HaltReason),
}

/// A single-hart interpreter over a [`CpuBus`].
pub struct Engine<B> {
    pub(crate) bus: B,
    layout: MemoryLayout,
    limits: LoaderLimits,
    regs: [u32; 32],
    pub(crate) pc: u32,
    pub(crate) csrs: CsrFile,
    privilege: Privilege,
    isa: Isa,
    cycles: u64,
    instret: u64,
    halted: bool,
    halt_reason: Option<HaltReason>,
    last_error: Option<ExecError>,
    pending_interrupts: VecDeque<u32>,
    diagnostics: VecDeque<Diagnostic>,
    instruction_hook: Option<InstructionHook>,
    memory_hook: Option<MemoryHook>,
    pub(crate) syscall_output: Option<SyscallOutput>,
}

impl<B> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("isa", &self.isa)
            .field("privilege", &self.privilege)
            .field("cycles", &self.cycles)
            .field("halted", &self.halted)
            .field("halt_reason", &self.halt_reason)
            .finish_non_exhaustive()
    }
}

impl Engine<Memory> {
    /// An engine without address translation.
    pub fn flat(layout: MemoryLayout) -> Result<Self, LayoutError> {
        Ok(Self::new(Memory::new(layout)?))
    }
}

impl Engine<PagingBus<Memory>> {
    /// An engine whose accesses go through the Sv32 MMU once `satp.MODE` is set.
    pub fn paged(layout: MemoryLayout) -> Result<Self, LayoutError> {
        Ok(Self::new(PagingBus::new(Memory::new(layout)?)))
    }
}

impl<B: CpuBus<Phys = Memory>> Engine<B> {
    pub fn new(bus: B) -> Self {
        let layout = bus.phys().layout().clone();
        let mut engine = Self {
            bus,
            pc: layout.text_base() as u32,
            layout,
            limits: LoaderLimits::default(),
            regs: [0; 32],
            csrs: CsrFile::new(),
            privilege: Privilege::Machine,
            isa: Isa::Legacy,
            cycles: 0,
            instret: 0,
            halted: false,
            halt_reason: None,
            last_error: None,
            pending_interrupts: VecDeque::new(),
            diagnostics: VecDeque::new(),
            instruction_hook: None,
            memory_hook: None,
            syscall_output: None,
        };
        engine.bus.set_privilege(Privilege::Machine);
        engine
    }

    #[inline]
    pub fn memory(&self) -> &Memory {
        self.bus.phys()
    }

    #[inline]
    pub fn memory_mut(&mut self) -> &mut Memory {
        self.bus.phys_mut()
    }

    pub fn set_console_output(&mut self, sink: impl FnMut(u8) + 'static) {
        self.memory_mut().set_console_output(sink);
    }

    pub fn set_console_input(&mut self, source: impl FnMut() -> Option<u8> + 'static) {
        self.memory_mut().set_console_input(source);
    }

    /// Zero registers, CSRs, counters and memory; drop translation state, pending interrupts
    /// and diagnostics. Host callbacks stay installed.
    pub fn reset(&mut self) {
        self.reset_cpu();
        self.bus.phys_mut().reset();
    }

    /// Validate `bytes` as an image and, only if it is acceptable, reset the engine and load
    /// it. A rejected image leaves all state untouched.
    pub fn load(&mut self, bytes: &[u8]) -> Result<LoadedImage, LoadError> {
        let image = Image::parse_with_limits(bytes, &self.limits)?;
        self.load_image(&image)
    }

    pub fn load_image(&mut self, image: &Image) -> Result<LoadedImage, LoadError> {
        let text = self.layout.segment_range(Segment::Text);
        let text_len = text.end - text.start;
        let instructions = image.words().len() as u64;
        let too_large = LoadError::ImageTooLarge {
            instructions,
            limit: text_len / 4,
        };
        if image.payload_len() > text_len {
            return Err(too_large);
        }
        let entry_point = image.entry_point();
        let entry_ok = if instructions == 0 {
            entry_point == 0
        } else {
            entry_point % 4 == 0 && entry_point < image.payload_len()
        };
        if !entry_ok {
            return Err(LoadError::BadEntryPoint {
                entry_point,
                instructions,
            });
        }

        self.reset();
        for (i, &word) in image.words().iter().enumerate() {
            self.bus
                .phys_mut()
                .write_u32(text.start + i as u64 * 4, word)
                .map_err(|_| too_large.clone())?;
        }
        self.isa = image.isa();
        self.pc = (text.start + entry_point) as u32;
        if self.isa == Isa::Rv32 {
            self.regs[2] = self.layout.stack_top() as u32;
        }

        info!(
            isa = %self.isa,
            instructions,
            entry_pc = self.pc,
            timestamp = image.header().timestamp,
            "loaded image"
        );
        Ok(LoadedImage {
            header: *image.header(),
            entry_pc: self.pc,
        })
    }
}

impl<B: CpuBus> Engine<B> {
    fn reset_cpu(&mut self) {
        self.regs = [0; 32];
        self.pc = self.layout.text_base() as u32;
        self.csrs.clear();
        self.privilege = Privilege::Machine;
        self.isa = Isa::Legacy;
        self.cycles = 0;
        self.instret = 0;
        self.halted = false;
        self.halt_reason = None;
        self.last_error = None;
        self.pending_interrupts.clear();
        self.diagnostics.clear();
        self.bus.reset_translation();
        self.bus.set_privilege(Privilege::Machine);
    }

    #[inline]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    #[inline]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    #[inline]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn set_loader_limits(&mut self, limits: LoaderLimits) {
        self.limits = limits;
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// Register `index` (0..32). Out-of-range indices read as zero.
    #[inline]
    pub fn reg(&self, index: usize) -> u32 {
        self.regs.get(index).copied().unwrap_or(0)
    }

    /// Writes to register 0 and to out-of-range indices are discarded.
    #[inline]
    pub fn set_reg(&mut self, index: usize, value: u32) {
        if index != 0 && index < self.regs.len() {
            self.regs[index] = value;
        }
    }

    #[inline]
    pub fn registers(&self) -> &[u32; 32] {
        &self.regs
    }

    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[inline]
    pub fn instructions_executed(&self) -> u64 {
        self.instret
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    #[inline]
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_reason
    }

    #[inline]
    pub fn last_error(&self) -> Option<&ExecError> {
        self.last_error.as_ref()
    }

    #[inline]
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    #[inline]
    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Read a CSR the way a `CSRR*` instruction would, including the read-only counter views.
    pub fn csr(&self, addr: u16) -> u32 {
        match addr {
            csr::CYCLE => self.cycles as u32,
            csr::CYCLEH => (self.cycles >> 32) as u32,
            csr::INSTRET => self.instret as u32,
            csr::INSTRETH => (self.instret >> 32) as u32,
            csr::MHARTID => 0,
            csr::MISA => csr::MISA_RV32IM,
            _ => self.csrs.get(addr),
        }
    }

    /// Host-side CSR write. Read-only CSRs are left unchanged; `satp` is forwarded to the bus.
    pub fn set_csr(&mut self, addr: u16, value: u32) {
        if csr::is_read_only(addr) || addr == csr::MISA {
            return;
        }
        self.csrs.set(addr, value);
        if addr == csr::SATP {
            self.bus.set_satp(value);
        }
    }

    pub fn set_instruction_hook(&mut self, hook: impl FnMut(&InstructionTrace<'_>) + 'static) {
        self.instruction_hook = Some(Box::new(hook));
    }

    pub fn clear_instruction_hook(&mut self) {
        self.instruction_hook = None;
    }

    pub fn set_memory_hook(&mut self, hook: impl FnMut(&MemoryAccess) + 'static) {
        self.memory_hook = Some(Box::new(hook));
    }

    pub fn clear_memory_hook(&mut self) {
        self.memory_hook = None;
    }

    /// Receiver for bytes written by the guest `write` syscall.
    pub fn set_syscall_output(&mut self, sink: impl FnMut(OutputStream, &[u8]) + 'static) {
        self.syscall_output = Some(Box::new(sink));
    }

    /// Drain recorded diagnostics, oldest first.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.drain(..).collect()
    }

    /// Queue an interrupt; it is taken at the next instruction boundary.
    pub fn inject_interrupt(&mut self, cause: u32) {
        self.pending_interrupts.push_back(cause & !CAUSE_INTERRUPT);
    }

    pub fn get_state(&self) -> CpuSnapshot {
        CpuSnapshot {
            pc: self.pc,
            registers: self.regs,
            halted: self.halted,
            cycles: self.cycles,
            instructions_executed: self.instret,
        }
    }

    pub fn load_state(&mut self, snapshot: &CpuSnapshot) {
        self.pc = snapshot.pc;
        self.regs = snapshot.registers;
        self.regs[0] = 0;
        self.halted = snapshot.halted;
        self.halt_reason = snapshot.halted.then_some(HaltReason::Restored);
        self.last_error = None;
        self.cycles = snapshot.cycles;
        self.instret = snapshot.instructions_executed;
    }

    /// Execute instructions until the engine halts, an interrupt is consumed, or
    /// `max_cycles` steps have been taken.
    pub fn run(&mut self, max_cycles: u64) -> RunExit {
        for _ in 0..max_cycles {
            match self.step() {
                StepExit::Retired | StepExit::Trapped { .. } => {}
                StepExit::Interrupted { cause } => return RunExit::Interrupted { cause },
                StepExit::Halted(reason) => return RunExit::Halted(reason),
            }
        }
        match self.halt_reason {
            Some(reason) if self.halted => RunExit::Halted(reason),
            _ => RunExit::BudgetExhausted,
        }
    }

    pub fn step(&mut self) -> StepExit {
        if self.halted {
            return StepExit::Halted(self.halt_reason.unwrap_or(HaltReason::Restored));
        }
        if let Some(cause) = self.pending_interrupts.pop_front() {
            self.take_interrupt(cause);
            return StepExit::Interrupted { cause };
        }

        let pc = self.pc;
        let word = match self.bus.fetch(pc) {
            Ok(word) => word,
            Err(err) => return self.fault(err),
        };
        self.notify_memory(pc, AccessKind::Fetch, Width::Word, u64::from(word));
        self.trace_instruction(pc, word);

        let flow = match self.isa {
            Isa::Legacy => match legacy::decode(word) {
                Ok(insn) => self.exec_legacy(insn, pc),
                Err(err) => {
                    self.decode_failed(pc, err);
                    Ok(Flow::Next)
                }
            },
            Isa::Rv32 => match rv32::decode(word) {
                Ok(insn) => self.exec_rv32(insn, pc),
                Err(err) => {
                    self.decode_failed(pc, err);
                    Ok(Flow::Next)
                }
            },
        };

        match flow {
            Ok(Flow::Next) => {
                self.pc = pc.wrapping_add(4);
                self.retire();
                StepExit::Retired
            }
            Ok(Flow::Jump(target)) => {
                self.pc = target;
                self.retire();
                StepExit::Retired
            }
            Ok(Flow::Halt(reason)) => {
                self.pc = pc.wrapping_add(4);
                self.retire();
                self.halt(reason);
                StepExit::Halted(reason)
            }
            Err(err) => self.fault(err),
        }
    }

    #[inline]
    fn retire(&mut self) {
        self.cycles = self.cycles.wrapping_add(1);
        self.instret = self.instret.wrapping_add(1);
    }

    fn halt(&mut self, reason: HaltReason) {
        self.halted = true;
        self.halt_reason = Some(reason);
        debug!(pc = self.pc, ?reason, "halted");
    }

    /// Deliver a translation fault to the guest if it installed a handler; otherwise stop.
    fn fault(&mut self, err: ExecError) -> StepExit {
        if let ExecError::Translation(fault) = err {
            if self.csrs.get(csr::MTVEC) != 0 {
                let cause = page_fault_cause(&fault);
                debug!(pc = self.pc, cause, vaddr = fault.vaddr(), "page fault trap");
                self.enter_trap(cause, fault.vaddr());
                return StepExit::Trapped { cause };
            }
        }
        self.last_error = Some(err);
        self.halt(HaltReason::Error(err));
        StepExit::Halted(HaltReason::Error(err))
    }

    fn take_interrupt(&mut self, cause: u32) {
        let enabled = self.csrs.mstatus() & MSTATUS_MIE != 0;
        let handler = self.csrs.get(csr::MTVEC);
        if enabled && handler != 0 {
            debug!(pc = self.pc, cause, "interrupt trap");
            self.enter_trap(CAUSE_INTERRUPT | cause, 0);
        } else {
            debug!(pc = self.pc, cause, enabled, "interrupt dropped");
        }
    }

    /// Machine-mode trap entry at the current `pc`.
    pub(crate) fn enter_trap(&mut self, cause: u32, tval: u32) {
        let mut mstatus = self.csrs.mstatus();
        let mie = mstatus & MSTATUS_MIE != 0;
        mstatus &= !(MSTATUS_MPP | MSTATUS_MPIE | MSTATUS_MIE);
        mstatus |= self.privilege.bits() << MSTATUS_MPP_SHIFT;
        if mie {
            mstatus |= MSTATUS_MPIE;
        }
        self.csrs.set_mstatus(mstatus);
        self.csrs.set(csr::MEPC, self.pc);
        self.csrs.set(csr::MCAUSE, cause);
        self.csrs.set(csr::MTVAL, tval);
        self.set_privilege(Privilege::Machine);
        self.pc = self.csrs.get(csr::MTVEC) & !3;
    }

    pub(crate) fn set_privilege(&mut self, privilege: Privilege) {
        self.privilege = privilege;
        self.bus.set_privilege(privilege);
    }

    fn decode_failed(&mut self, pc: u32, err: DecodeError) {
        warn!(pc, isa = %self.isa, error = %err, "undecodable instruction executed as no-op");
        self.push_diagnostic(pc, DiagnosticKind::Decode(err));
    }

    pub(crate) fn push_diagnostic(&mut self, pc: u32, kind: DiagnosticKind) {
        if self.diagnostics.len() == MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(Diagnostic { pc, kind });
    }

    fn trace_instruction(&mut self, pc: u32, word: u32) {
        let Some(hook) = self.instruction_hook.as_mut() else {
            return;
        };
        let (opcode, operands) = match self.isa {
            Isa::Legacy => {
                let [op, dst, src1, src2] = legacy::fields(word);
                (op, [dst, src1, src2])
            }
            Isa::Rv32 => (
                rv32::opcode(word),
                [rv32::rd(word), rv32::rs1(word), rv32::rs2(word)],
            ),
        };
        hook(&InstructionTrace {
            pc,
            word,
            opcode,
            operands,
            registers: &self.regs,
        });
    }

    fn notify_memory(&mut self, addr: u32, kind: AccessKind, width: Width, value: u64) {
        if let Some(hook) = self.memory_hook.as_mut() {
            hook(&MemoryAccess {
                addr,
                kind,
                width,
                value,
                pc: self.pc,
            });
        }
    }

    pub(crate) fn mem_load(&mut self, vaddr: u32, width: Width) -> Result<u64, ExecError> {
        let value = self.bus.load(vaddr, width, AccessType::Read)?;
        self.notify_memory(vaddr, AccessKind::Read, width, value);
        Ok(value)
    }

    pub(crate) fn mem_store(&mut self, vaddr: u32, width: Width, value: u64) -> Result<(), ExecError> {
        self.bus.store(vaddr, width, value)?;
        self.notify_memory(vaddr, AccessKind::Write, width, value);
        Ok(())
    }

    #[inline]
    pub(crate) fn console_addr(&self, offset: u64) -> u32 {
        (self.layout.console_base + offset) as u32
    }

    #[inline]
    pub(crate) fn text_base(&self) -> u32 {
        self.layout.text_base() as u32
    }
}

fn page_fault_cause(fault: &TranslateFault) -> u32 {
    match fault.access() {
        AccessType::Execute => CAUSE_FETCH_PAGE_FAULT,
        AccessType::Read => CAUSE_LOAD_PAGE_FAULT,
        AccessType::Write => CAUSE_STORE_PAGE_FAULT,
    }
}
