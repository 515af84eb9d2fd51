use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::components::alu::Flags;
use crate::error::ExecutionError;
use crate::isa::IrqLine;
use crate::types::Nibble;

/// Interrupt controller registers, persisted as-is in saved state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterruptState {
    pub irq_mask: [bool; 4],
    pub irq_status: [bool; 4],
    pub enabled: bool,
    pub in_handler: bool,
    #[serde(rename = "SavedPC")]
    pub saved_pc: Nibble,
    pub saved_flags: Flags,
}

/// Four maskable lines, no nesting.
///
/// A line is taken when interrupts are enabled, the line is unmasked and
/// requested, and no handler is running. Lower line numbers win. Entering
/// a handler clears that line's request bit.
#[derive(Debug, Clone, Default)]
pub struct InterruptController {
    state: InterruptState,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, line: IrqLine) {
        self.state.irq_status[line.index()] = true;
        debug!(%line, "interrupt requested");
    }

    pub fn set_mask(&mut self, line: IrqLine, enabled: bool) {
        self.state.irq_mask[line.index()] = enabled;
    }

    pub fn enable(&mut self) {
        self.state.enabled = true;
    }

    pub fn disable(&mut self) {
        self.state.enabled = false;
    }

    pub fn pending(&self) -> Option<IrqLine> {
        if !self.state.enabled || self.state.in_handler {
            return None;
        }
        (0..IrqLine::COUNT)
            .find(|&i| self.state.irq_status[i] && self.state.irq_mask[i])
            .and_then(|i| IrqLine::new(i as u8).ok())
    }

    /// Saves the resume address and flags and enters the handler.
    /// Returns: the handler address
    pub fn enter(&mut self, line: IrqLine, resume_pc: Nibble, flags: Flags) -> Nibble {
        self.state.saved_pc = resume_pc;
        self.state.saved_flags = flags;
        self.state.in_handler = true;
        self.state.irq_status[line.index()] = false;
        let vector = line.vector();
        debug!(%line, %vector, resume = %resume_pc, "interrupt taken");
        vector
    }

    /// Leaves the handler.
    /// Returns: (saved PC, saved flags)
    pub fn leave(&mut self) -> Result<(Nibble, Flags), ExecutionError> {
        if !self.state.in_handler {
            return Err(ExecutionError::NotInInterrupt);
        }
        self.state.in_handler = false;
        Ok((self.state.saved_pc, self.state.saved_flags))
    }

    pub fn state(&self) -> &InterruptState {
        &self.state
    }

    pub fn restore(&mut self, state: InterruptState) {
        self.state = state;
    }

    pub fn clear(&mut self) {
        self.state = InterruptState::default();
    }
}
