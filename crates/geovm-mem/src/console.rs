use std::collections::VecDeque;
use std::fmt;

/// Size of the console MMIO window in bytes.
pub const CONSOLE_WINDOW_LEN: u64 = 4;

/// Window offset of the output register (write-only; reads return 0).
pub const CONSOLE_OUTPUT: u64 = 0;
/// Window offset of the input register (read pops one byte, 0 when empty).
pub const CONSOLE_INPUT: u64 = 1;
/// Window offset of the status register.
pub const CONSOLE_STATUS: u64 = 2;

pub const STATUS_OUTPUT_READY: u8 = 1 << 0;
pub const STATUS_INPUT_AVAILABLE: u8 = 1 << 1;

type OutputSink = Box<dyn FnMut(u8)>;
type InputSource = Box<dyn FnMut() -> Option<u8>>;

/// Byte-granular console device behind the console window.
///
/// Input is served from a host-fed queue first and then from the optional input callback.
#[derive(Default)]
pub struct Console {
    output: Option<OutputSink>,
    input: Option<InputSource>,
    pending: VecDeque<u8>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("has_output", &self.output.is_some())
            .field("has_input", &self.input.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Console {
    pub fn set_output(&mut self, sink: impl FnMut(u8) + 'static) {
        self.output = Some(Box::new(sink));
    }

    pub fn set_input(&mut self, source: impl FnMut() -> Option<u8> + 'static) {
        self.input = Some(Box::new(source));
    }

    /// Queue bytes for the guest to read from the input register.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Emit one byte to the host output callback. Dropped when no callback is installed.
    pub fn emit(&mut self, byte: u8) {
        if let Some(out) = self.output.as_mut() {
            out(byte);
        }
    }

    /// Pop one input byte, or 0 when none is available.
    pub fn pop_input(&mut self) -> u8 {
        self.poll();
        self.pending.pop_front().unwrap_or(0)
    }

    pub fn input_available(&mut self) -> bool {
        self.poll();
        !self.pending.is_empty()
    }

    fn poll(&mut self) {
        if self.pending.is_empty() {
            if let Some(byte) = self.input.as_mut().and_then(|source| source()) {
                self.pending.push_back(byte);
            }
        }
    }

    pub(crate) fn read_byte(&mut self, offset: u64) -> u8 {
        match offset {
            CONSOLE_INPUT => self.pop_input(),
            CONSOLE_STATUS => {
                let mut status = STATUS_OUTPUT_READY;
                if self.input_available() {
                    status |= STATUS_INPUT_AVAILABLE;
                }
                status
            }
            _ => 0,
        }
    }

    pub(crate) fn write_byte(&mut self, offset: u64, value: u8) {
        if offset == CONSOLE_OUTPUT {
            self.emit(value);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
    }
}
