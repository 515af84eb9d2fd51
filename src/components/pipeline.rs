//! Three-stage fetch/decode/execute pipeline.
//!
//! One [`Pipeline::tick`] is one clock cycle:
//!
//! 1. A pending interrupt wins: the handler is entered, all stages are
//!    flushed and nothing else happens.
//! 2. The instruction in execute completes. A taken jump, call, return or
//!    interrupt return flushes the younger stages and leaves PC where the
//!    instruction put it. A halt flushes and stops.
//! 3. If decode reads a register the completed instruction writes, a
//!    bubble goes into execute and decode, fetch and PC hold for one tick.
//! 4. Otherwise decode moves to execute, the fetched word is decoded, the
//!    word at PC is fetched and PC advances.

use std::mem;

use tracing::debug;

use crate::error::{EmuError, Result};
use crate::isa::{self, Instruction, IrqLine};
use crate::types::Nibble;

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Raw word from memory, decoded by the codec in the next stage.
    Word(Nibble),
    /// Instruction from an assembled program and its source line.
    Decoded { instruction: Instruction, line: usize },
}

/// Contents of the fetch stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSlot {
    pub pc: Nibble,
    pub fetched: Fetched,
}

/// Decode or execute stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRecord {
    pub valid: bool,
    pub done: bool,
    pub pc: Nibble,
    pub instruction: Instruction,
    pub raw: Option<Nibble>,
    pub line: Option<usize>,
}

impl StageRecord {
    fn decoded(slot: FetchSlot) -> Self {
        let (instruction, raw, line) = match slot.fetched {
            Fetched::Word(word) => (isa::decode(word), Some(word), None),
            Fetched::Decoded { instruction, line } => (instruction, None, Some(line)),
        };
        Self {
            valid: true,
            done: false,
            pc: slot.pc,
            instruction,
            raw,
            line,
        }
    }

    fn locate(&self, error: EmuError) -> EmuError {
        match self.line {
            Some(line) => EmuError::Run {
                line,
                source: Box::new(error),
            },
            None => EmuError::RunAt {
                address: self.pc,
                source: Box::new(error),
            },
        }
    }
}

/// What an executed instruction did to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Jumped,
    Halted,
}

/// The machine the pipeline drives.
pub trait Executor {
    fn pc(&self) -> Nibble;
    fn advance_pc(&mut self);
    /// Next word or instruction at `pc`; `None` past the end of the source.
    fn fetch(&mut self, pc: Nibble) -> Option<Fetched>;
    fn execute(&mut self, instruction: &Instruction, at: Nibble) -> Result<Flow>;
    fn pending_interrupt(&self) -> Option<IrqLine>;
    /// Enters the handler and points PC at it.
    /// Returns: the handler address
    fn enter_interrupt(&mut self, line: IrqLine, resume_pc: Nibble) -> Nibble;
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completed: Option<StageRecord>,
    pub interrupt: Option<(IrqLine, Nibble)>,
    pub stalled: bool,
    pub redirected: bool,
    pub halted: bool,
    /// Nothing left in flight and nothing more to fetch.
    pub drained: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cycles: u64,
    pub retired: u64,
    pub stalls: u64,
    pub flushes: u64,
    pub interrupts: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    fetch: Option<FetchSlot>,
    decode: StageRecord,
    execute: StageRecord,
    stats: PipelineStats,
}

/// True when `decode` reads the register `execute` writes.
pub fn hazard(decode: &Instruction, execute: &Instruction) -> bool {
    execute
        .destination()
        .map_or(false, |dst| decode.sources().contains(&dst))
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick<E: Executor>(&mut self, cpu: &mut E) -> Result<TickReport> {
        self.stats.cycles += 1;
        let mut report = TickReport::default();

        if let Some(line) = cpu.pending_interrupt() {
            let resume = self.oldest_pc().unwrap_or_else(|| cpu.pc());
            let vector = cpu.enter_interrupt(line, resume);
            self.flush();
            self.stats.interrupts += 1;
            report.interrupt = Some((line, vector));
            return Ok(report);
        }

        let stall = self.decode.valid
            && self.execute.valid
            && hazard(&self.decode.instruction, &self.execute.instruction);

        if self.execute.valid && self.execute.done {
            let record = mem::take(&mut self.execute);
            debug!(pc = %record.pc, instruction = %crate::asm::format_instruction(&record.instruction), "EXECUTE");
            let flow = match cpu.execute(&record.instruction, record.pc) {
                Ok(flow) => flow,
                Err(e) => {
                    self.flush();
                    return Err(record.locate(e));
                }
            };
            self.stats.retired += 1;
            report.completed = Some(record);
            match flow {
                Flow::Next => {}
                Flow::Jumped => {
                    self.flush();
                    report.redirected = true;
                    return Ok(report);
                }
                Flow::Halted => {
                    self.flush();
                    report.halted = true;
                    return Ok(report);
                }
            }
        }

        if stall {
            self.stats.stalls += 1;
            report.stalled = true;
            debug!(pc = %self.decode.pc, "STALL");
            return Ok(report);
        }

        if self.decode.valid {
            self.execute = mem::take(&mut self.decode);
            self.execute.done = true;
        }
        if let Some(slot) = self.fetch.take() {
            self.decode = StageRecord::decoded(slot);
        }

        let pc = cpu.pc();
        self.fetch = cpu.fetch(pc).map(|fetched| FetchSlot { pc, fetched });
        if self.fetch.is_some() {
            cpu.advance_pc();
        }
        report.drained = self.is_empty();
        Ok(report)
    }

    /// Address of the oldest instruction still in flight.
    fn oldest_pc(&self) -> Option<Nibble> {
        if self.execute.valid {
            Some(self.execute.pc)
        } else if self.decode.valid {
            Some(self.decode.pc)
        } else {
            self.fetch.as_ref().map(|slot| slot.pc)
        }
    }

    pub fn flush(&mut self) {
        if !self.is_empty() {
            self.stats.flushes += 1;
        }
        self.fetch = None;
        self.decode = StageRecord::default();
        self.execute = StageRecord::default();
    }

    pub fn is_empty(&self) -> bool {
        self.fetch.is_none() && !self.decode.valid && !self.execute.valid
    }

    pub fn fetch_stage(&self) -> Option<&FetchSlot> {
        self.fetch.as_ref()
    }

    pub fn decode_stage(&self) -> &StageRecord {
        &self.decode
    }

    pub fn execute_stage(&self) -> &StageRecord {
        &self.execute
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
