use std::cell::RefCell;
use std::rc::Rc;

use geovm_image::{Image, Isa, LoadError};
use geovm_mem::{MemoryBus, MemoryLayout, Segment};
use geovm_mmu::{Privilege, PTE_A, PTE_D, PTE_R, PTE_V, PTE_W, PTE_X, SATP_MODE};

use crate::csr::{self, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_MPP_SHIFT};
use crate::legacy::{encode, OP_ADD, OP_HALT, OP_JMP, OP_MOV, OP_NOP, OP_STORE, CONSOLE_REGISTER};
use crate::rv32::asm::*;
use crate::{
    DiagnosticKind, Engine, ExecError, HaltReason, OutputStream, RunExit, StepExit,
    TranslateFault,
};

fn flat() -> Engine<geovm_mem::Memory> {
    Engine::flat(MemoryLayout::default()).unwrap()
}

fn load(engine: &mut Engine<impl crate::CpuBus<Phys = geovm_mem::Memory>>, isa: Isa, words: &[u32]) {
    let bytes = Image::new(isa, words.to_vec()).to_bytes();
    engine.load(&bytes).unwrap();
}

#[test]
fn layouts_beyond_32_bit_addresses_are_rejected() {
    let high_console = MemoryLayout {
        console_base: 0x1_0000_0000,
        ..MemoryLayout::default()
    };
    assert!(matches!(
        Engine::flat(high_console.clone()),
        Err(geovm_mem::LayoutError::AddressOverflow { name: "console", .. })
    ));
    assert!(Engine::paged(high_console).is_err());

    let high_ram = MemoryLayout {
        ram_base: 0xffff_0000,
        ..MemoryLayout::default()
    };
    assert!(matches!(
        Engine::flat(high_ram),
        Err(geovm_mem::LayoutError::AddressOverflow { name: "ram", .. })
    ));
}

#[test]
fn legacy_add_program() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Legacy,
        &[
            encode(OP_MOV, 1, 5, 0),
            encode(OP_MOV, 2, 7, 0),
            encode(OP_ADD, 3, 1, 2),
        ],
    );

    // Zeroed text past the program decodes as NOP.
    assert_eq!(engine.run(16), RunExit::BudgetExhausted);
    assert_eq!(engine.reg(3), 12);
    assert!(!engine.is_halted());
    assert_eq!(engine.halt_reason(), None);
}

#[test]
fn halt_counts_every_retired_instruction() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Legacy,
        &[encode(OP_NOP, 0, 0, 0), encode(OP_MOV, 1, 1, 0), encode(OP_HALT, 0, 0, 0)],
    );

    assert_eq!(engine.run(100), RunExit::Halted(HaltReason::Halt));
    assert_eq!(engine.cycles(), 3);
    assert_eq!(engine.instructions_executed(), 3);
    assert_eq!(engine.step(), StepExit::Halted(HaltReason::Halt));
    assert_eq!(engine.cycles(), 3);
}

#[test]
fn rejected_image_leaves_state_untouched() {
    let mut engine = flat();
    load(&mut engine, Isa::Legacy, &[encode(OP_MOV, 4, 9, 0)]);
    engine.step();
    let state = engine.get_state();
    let ram = engine.memory().ram_bytes();

    let mut bytes = Image::new(Isa::Legacy, vec![0; 4]).to_bytes();
    bytes[..4].copy_from_slice(b"NOPE");
    assert!(matches!(engine.load(&bytes), Err(LoadError::BadMagic { .. })));

    assert_eq!(engine.get_state(), state);
    assert_eq!(engine.memory().ram_bytes(), ram);
}

#[test]
fn oversized_image_is_rejected_before_reset() {
    let layout = MemoryLayout {
        text_size: 0x1000,
        ..MemoryLayout::default()
    };
    let mut engine = Engine::flat(layout).unwrap();
    engine.set_reg(5, 1);

    let image = Image::new(Isa::Legacy, vec![0; 0x401]);
    assert_eq!(
        engine.load_image(&image),
        Err(LoadError::ImageTooLarge {
            instructions: 0x401,
            limit: 0x400
        })
    );
    assert_eq!(engine.reg(5), 1);
}

#[test]
fn console_store_reaches_callback_not_ram() {
    let mut engine = flat();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    engine.set_console_output(move |byte| sink.borrow_mut().push(byte));
    load(
        &mut engine,
        Isa::Legacy,
        &[
            encode(OP_MOV, 1, 65, 0),
            encode(OP_STORE, CONSOLE_REGISTER, 1, 0),
            encode(OP_HALT, 0, 0, 0),
        ],
    );
    let text = engine.layout().segment_range(Segment::Text);
    let before = engine.memory().ram_bytes()[text.start as usize..text.end as usize].to_vec();

    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Halt));
    assert_eq!(*seen.borrow(), vec![65]);
    let after = engine.memory().ram_bytes()[text.start as usize..text.end as usize].to_vec();
    assert_eq!(before, after);
}

#[test]
fn console_load_reads_pending_input() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Legacy,
        &[
            encode(crate::legacy::OP_LOAD, 2, CONSOLE_REGISTER, 0),
            encode(OP_HALT, 0, 0, 0),
        ],
    );
    engine.memory_mut().push_console_input(b"z");
    engine.run(10);
    assert_eq!(engine.reg(2), u32::from(b'z'));
}

#[test]
fn legacy_jump_is_relative_to_text_base() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Legacy,
        &[
            encode(OP_JMP, 0, 3, 0),
            encode(OP_MOV, 1, 1, 0),
            encode(OP_HALT, 0, 0, 0),
            encode(OP_MOV, 2, 2, 0),
            encode(OP_HALT, 0, 0, 0),
        ],
    );
    engine.run(10);
    assert_eq!(engine.reg(1), 0);
    assert_eq!(engine.reg(2), 2);
}

#[test]
fn undecodable_word_is_a_recorded_noop() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Legacy,
        &[0x0000_00EE, encode(OP_MOV, 1, 3, 0), encode(OP_HALT, 0, 0, 0)],
    );
    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Halt));
    assert_eq!(engine.reg(1), 3);
    assert_eq!(engine.cycles(), 3);

    let diagnostics = engine.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].pc, 0);
    assert!(matches!(diagnostics[0].kind, DiagnosticKind::Decode(_)));
    assert!(engine.take_diagnostics().is_empty());
}

#[test]
fn writes_to_register_zero_are_discarded() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[addi(0, 0, 5), add(0, 0, 0), lui(0, 0x1000), EBREAK],
    );
    engine.run(10);
    assert_eq!(engine.reg(0), 0);

    engine.set_reg(0, 9);
    assert_eq!(engine.reg(0), 0);
}

#[test]
fn rv32_arithmetic_and_stack_pointer() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(5, 0, 6),
            addi(6, 0, -7),
            mul(7, 5, 6),
            div(8, 7, 5),
            sub(9, 5, 6),
            EBREAK,
        ],
    );
    assert_eq!(engine.reg(2), engine.layout().stack_top() as u32);

    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Breakpoint));
    assert_eq!(engine.reg(7) as i32, -42);
    assert_eq!(engine.reg(8) as i32, -7);
    assert_eq!(engine.reg(9), 13);
}

#[test]
fn rv32_loads_sign_extend() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            lui(5, 0x0002_0000),
            addi(6, 0, -1),
            sb(6, 5, 0),
            lb(7, 5, 0),
            lbu(8, 5, 0),
            sw(6, 5, 4),
            lw(9, 5, 4),
            EBREAK,
        ],
    );
    engine.run(20);
    assert_eq!(engine.reg(7), u32::MAX);
    assert_eq!(engine.reg(8), 0xff);
    assert_eq!(engine.reg(9), u32::MAX);
}

#[test]
fn jal_links_and_jalr_returns() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            jal(1, 12),      // 0x00 -> 0x0c
            addi(10, 10, 1), // 0x04
            EBREAK,          // 0x08
            addi(11, 0, 2),  // 0x0c
            jalr(0, 1, 0),   // back to 0x04
        ],
    );
    assert_eq!(engine.run(20), RunExit::Halted(HaltReason::Breakpoint));
    assert_eq!(engine.reg(1), 4);
    assert_eq!(engine.reg(10), 1);
    assert_eq!(engine.reg(11), 2);
}

#[test]
fn write_syscall_then_exit() {
    let mut engine = flat();
    let out = Rc::new(RefCell::new(Vec::new()));
    let sink = out.clone();
    engine.set_syscall_output(move |stream, bytes| sink.borrow_mut().push((stream, bytes.to_vec())));
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(10, 0, 1),
            addi(11, 0, 0x24),
            addi(12, 0, 2),
            addi(17, 0, 64),
            ECALL,
            add(20, 10, 0),
            addi(10, 0, 7),
            addi(17, 0, 93),
            ECALL,
            u32::from_le_bytes(*b"hi\0\0"),
        ],
    );

    assert_eq!(engine.run(50), RunExit::Halted(HaltReason::Exit { code: 7 }));
    assert_eq!(engine.reg(20), 2);
    assert_eq!(*out.borrow(), vec![(OutputStream::Stdout, b"hi".to_vec())]);
}

#[test]
fn write_to_unknown_fd_returns_ebadf() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[addi(10, 0, 5), addi(17, 0, 64), ECALL, EBREAK],
    );
    engine.run(10);
    assert_eq!(engine.reg(10) as i32, -9);
}

#[test]
fn unknown_syscall_is_diagnosed_and_skipped() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[addi(10, 0, 3), addi(17, 0, 999), ECALL, EBREAK],
    );
    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Breakpoint));
    assert_eq!(engine.reg(10), 3);
    let diagnostics = engine.take_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].pc, 8);
    assert_eq!(
        diagnostics[0].kind,
        DiagnosticKind::UnknownSyscall { number: 999 }
    );
}

#[test]
fn counters_and_read_only_csrs() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(0, 0, 0),
            csrrs(5, csr::CYCLE, 0),
            addi(6, 0, 1),
            csrrw(7, csr::MHARTID, 6),
            csrrs(8, csr::MISA, 0),
            csrrw(0, csr::MSCRATCH, 6),
            csrrs(9, csr::MSCRATCH, 0),
            EBREAK,
        ],
    );
    engine.run(20);
    assert_eq!(engine.reg(5), 1);
    assert_eq!(engine.reg(7), 0);
    assert_eq!(engine.csr(csr::MHARTID), 0);
    assert_eq!(engine.reg(8), csr::MISA_RV32IM);
    assert_eq!(engine.reg(9), 1);
}

#[test]
fn mret_drops_to_user_mode() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(5, 0, 0x10),
            csrrw(0, csr::MEPC, 5),
            MRET,
            EBREAK,
            addi(6, 0, 1), // 0x10
            EBREAK,
        ],
    );
    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Breakpoint));
    assert_eq!(engine.reg(6), 1);
    assert_eq!(engine.privilege(), Privilege::User);
    assert_eq!(engine.csr(csr::MSTATUS) & MSTATUS_MPIE, MSTATUS_MPIE);
}

#[test]
fn sret_returns_to_supervisor_when_spp_set() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(5, 0, 0x14),
            csrrw(0, csr::SEPC, 5),
            addi(5, 0, 0x100), // SPP
            csrrs(0, csr::SSTATUS, 5),
            SRET,
            EBREAK, // 0x14
        ],
    );
    engine.run(10);
    assert_eq!(engine.privilege(), Privilege::Supervisor);
    assert_eq!(engine.csr(csr::MSTATUS) & csr::MSTATUS_SPP, 0);
}

#[test]
fn interrupt_traps_when_enabled_and_mret_resumes() {
    let mut engine = flat();
    let mut words = vec![
        addi(5, 0, 0x40),
        csrrw(0, csr::MTVEC, 5),
        addi(5, 0, MSTATUS_MIE as i32),
        csrrs(0, csr::MSTATUS, 5),
        addi(10, 10, 1), // 0x10
        jal(0, -4),
    ];
    words.resize(16, addi(0, 0, 0));
    words.push(MRET); // 0x40
    load(&mut engine, Isa::Rv32, &words);

    for _ in 0..4 {
        assert_eq!(engine.step(), StepExit::Retired);
    }
    let cycles = engine.cycles();
    engine.inject_interrupt(7);
    assert_eq!(engine.step(), StepExit::Interrupted { cause: 7 });
    assert_eq!(engine.cycles(), cycles);
    assert_eq!(engine.pc(), 0x40);
    assert_eq!(engine.csr(csr::MEPC), 0x10);
    assert_eq!(engine.csr(csr::MCAUSE), 0x8000_0007);
    let mstatus = engine.csr(csr::MSTATUS);
    assert_eq!(mstatus & MSTATUS_MIE, 0);
    assert_eq!(mstatus & MSTATUS_MPIE, MSTATUS_MPIE);
    assert_eq!((mstatus & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT, 3);

    assert_eq!(engine.step(), StepExit::Retired);
    assert_eq!(engine.pc(), 0x10);
    assert_eq!(engine.csr(csr::MSTATUS) & MSTATUS_MIE, MSTATUS_MIE);
}

#[test]
fn masked_interrupt_is_dropped() {
    let mut engine = flat();
    load(&mut engine, Isa::Legacy, &[encode(OP_HALT, 0, 0, 0)]);
    engine.inject_interrupt(3);
    assert_eq!(engine.run(10), RunExit::Interrupted { cause: 3 });
    assert_eq!(engine.pc(), 0);
    assert_eq!(engine.csr(csr::MCAUSE), 0);
    assert_eq!(engine.run(10), RunExit::Halted(HaltReason::Halt));
}

#[test]
fn out_of_bounds_access_halts_with_error() {
    let mut engine = flat();
    load(
        &mut engine,
        Isa::Rv32,
        &[lui(5, 0x4000_0000), lw(6, 5, 0), EBREAK],
    );
    let exit = engine.run(10);
    assert!(matches!(exit, RunExit::Halted(HaltReason::Error(ExecError::Memory(_)))));
    assert!(engine.last_error().is_some());
    assert_eq!(engine.pc(), 4);
    assert_eq!(engine.cycles(), 1);
}

/// Identity-maps the first 4 MiB with a megapage rooted at physical `0x4_0000`.
const ROOT: u64 = 0x4_0000;

fn page_fault_program() -> Vec<u32> {
    let mut words = vec![
        addi(5, 0, 0x40),
        csrrw(0, csr::MTVEC, 5),
        lui(6, SATP_MODE),
        addi(6, 6, (ROOT >> 12) as i32),
        csrrw(0, csr::SATP, 6),
        lui(7, 0x0040_0000),
        lw(8, 7, 0), // 0x18
    ];
    words.resize(16, addi(0, 0, 0));
    words.extend([addi(9, 0, 1), EBREAK]); // 0x40
    words
}

#[test]
fn page_fault_traps_into_handler() {
    let mut engine = Engine::paged(MemoryLayout::default()).unwrap();
    load(&mut engine, Isa::Rv32, &page_fault_program());
    engine
        .memory_mut()
        .write_u32(ROOT, PTE_V | PTE_R | PTE_W | PTE_X | PTE_A | PTE_D)
        .unwrap();

    assert_eq!(engine.run(100), RunExit::Halted(HaltReason::Breakpoint));
    assert_eq!(engine.reg(9), 1);
    assert_eq!(engine.reg(8), 0);
    assert_eq!(engine.csr(csr::MCAUSE), csr::CAUSE_LOAD_PAGE_FAULT);
    assert_eq!(engine.csr(csr::MEPC), 0x18);
    assert_eq!(engine.csr(csr::MTVAL), 0x0040_0000);
    assert!(engine.bus().mmu().stats().page_walks >= 1);
}

#[test]
fn page_fault_without_handler_halts() {
    let mut engine = Engine::paged(MemoryLayout::default()).unwrap();
    let mut words = page_fault_program();
    words[1] = addi(0, 0, 0);
    load(&mut engine, Isa::Rv32, &words);
    engine
        .memory_mut()
        .write_u32(ROOT, PTE_V | PTE_R | PTE_W | PTE_X | PTE_A | PTE_D)
        .unwrap();

    let exit = engine.run(100);
    assert!(matches!(
        exit,
        RunExit::Halted(HaltReason::Error(ExecError::Translation(
            TranslateFault::PageNotPresent { vaddr: 0x0040_0000, .. }
        )))
    ));
}

#[test]
fn trap_loop_is_bounded_by_run_budget() {
    let mut engine = Engine::paged(MemoryLayout::default()).unwrap();
    // Translation on with an empty root table: every fetch faults, including the handler's.
    load(
        &mut engine,
        Isa::Rv32,
        &[
            addi(5, 0, 0x40),
            csrrw(0, csr::MTVEC, 5),
            lui(6, SATP_MODE),
            addi(6, 6, (ROOT >> 12) as i32),
            csrrw(0, csr::SATP, 6),
        ],
    );
    assert_eq!(engine.run(64), RunExit::BudgetExhausted);
    assert_eq!(engine.csr(csr::MCAUSE), csr::CAUSE_FETCH_PAGE_FAULT);
    assert_eq!(engine.cycles(), 5);
}

#[test]
fn hooks_observe_instructions_and_accesses() {
    let mut engine = flat();
    let pcs = Rc::new(RefCell::new(Vec::new()));
    let accesses = Rc::new(RefCell::new(Vec::new()));
    let (p, a) = (pcs.clone(), accesses.clone());
    engine.set_instruction_hook(move |t| p.borrow_mut().push((t.pc, t.opcode, t.registers[1])));
    engine.set_memory_hook(move |m| a.borrow_mut().push((m.kind, m.addr)));
    load(
        &mut engine,
        Isa::Legacy,
        &[encode(OP_MOV, 1, 9, 0), encode(OP_HALT, 0, 0, 0)],
    );
    engine.run(10);

    // Registers are captured before the instruction's effects.
    assert_eq!(*pcs.borrow(), vec![(0, OP_MOV, 0), (4, OP_HALT, 9)]);
    assert_eq!(
        *accesses.borrow(),
        vec![(crate::AccessKind::Fetch, 0), (crate::AccessKind::Fetch, 4)]
    );
}

#[test]
fn snapshot_restore_forces_zero_register() {
    let mut engine = flat();
    load(&mut engine, Isa::Legacy, &[encode(OP_MOV, 1, 4, 0)]);
    engine.step();

    let mut state = engine.get_state();
    assert_eq!(state.registers[1], 4);
    assert_eq!(state.cycles, 1);
    state.registers[0] = 77;
    state.halted = true;
    engine.load_state(&state);

    assert_eq!(engine.reg(0), 0);
    assert_eq!(engine.reg(1), 4);
    assert_eq!(engine.step(), StepExit::Halted(HaltReason::Restored));

    let json = serde_json::to_string(&engine.get_state()).unwrap();
    let back: crate::CpuSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, engine.get_state());
}

#[test]
fn reset_clears_cpu_and_memory() {
    let mut engine = flat();
    load(&mut engine, Isa::Legacy, &[encode(OP_MOV, 1, 4, 0), encode(OP_HALT, 0, 0, 0)]);
    engine.run(10);
    engine.reset();

    assert!(!engine.is_halted());
    assert_eq!(engine.cycles(), 0);
    assert_eq!(engine.reg(1), 0);
    assert_eq!(engine.isa(), Isa::Legacy);
    assert!(engine.memory().ram_bytes().iter().all(|&b| b == 0));
}
