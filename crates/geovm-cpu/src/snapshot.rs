use serde::{Deserialize, Serialize};

/// Architectural state captured by [`crate::Engine::get_state`].
///
/// Memory, CSRs and translation state are not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub pc: u32,
    pub registers: [u32; 32],
    pub halted: bool,
    pub cycles: u64,
    pub instructions_executed: u64,
}
