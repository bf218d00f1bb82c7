//! Host-serviced `ECALL`s. The number is in `a7`, arguments in `a0..a5`, the result in `a0`.

use geovm_mem::Width;
use tracing::{trace, warn};

use crate::bus::CpuBus;
use crate::engine::{DiagnosticKind, Engine, Flow};
use crate::error::{ExecError, HaltReason};
use crate::trace::OutputStream;

pub const SYS_WRITE: u32 = 64;
pub const SYS_EXIT: u32 = 93;
pub const SYS_EXIT_GROUP: u32 = 94;

/// Largest number of bytes a single `write` copies out.
pub const WRITE_MAX: u32 = 4096;

pub const EBADF: i32 = 9;

pub const REG_A0: usize = 10;
pub const REG_A1: usize = 11;
pub const REG_A2: usize = 12;
pub const REG_A7: usize = 17;

impl<B: CpuBus> Engine<B> {
    pub(crate) fn syscall(&mut self, pc: u32) -> Result<Flow, ExecError> {
        let number = self.reg(REG_A7);
        match number {
            SYS_WRITE => self.sys_write()?,
            SYS_EXIT | SYS_EXIT_GROUP => {
                let code = self.reg(REG_A0) as i32;
                return Ok(Flow::Halt(HaltReason::Exit { code }));
            }
            _ => {
                warn!(pc, number, "unknown syscall ignored");
                self.push_diagnostic(pc, DiagnosticKind::UnknownSyscall { number });
            }
        }
        Ok(Flow::Next)
    }

    fn sys_write(&mut self) -> Result<(), ExecError> {
        let stream = match self.reg(REG_A0) {
            1 => OutputStream::Stdout,
            2 => OutputStream::Stderr,
            fd => {
                trace!(fd, "write to unsupported fd");
                self.set_reg(REG_A0, (-EBADF) as u32);
                return Ok(());
            }
        };
        let buf = self.reg(REG_A1);
        let len = self.reg(REG_A2).min(WRITE_MAX);

        let mut bytes = Vec::with_capacity(len as usize);
        for i in 0..len {
            bytes.push(self.mem_load(buf.wrapping_add(i), Width::Byte)? as u8);
        }
        if let Some(sink) = self.syscall_output.as_mut() {
            sink(stream, &bytes);
        }
        self.set_reg(REG_A0, len);
        Ok(())
    }
}
