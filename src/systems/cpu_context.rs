use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::{error, info, warn};

use crate::asm::{self, Command, HostCommand, Program, Syntax};
use crate::component::Component;
use crate::components::alu::Flags;
use crate::components::interrupts::InterruptState;
use crate::components::pipeline::{Flow, Pipeline, StageRecord, TickReport};
use crate::components::terminal::KeyBuffer;
use crate::error::{ParseError, Result};
use crate::isa::{Instruction, Reg};
use crate::system_config::CpuConfig;
use crate::systems::datapath::{Datapath, Engine};
use crate::systems::state::CpuState;
use crate::types::Nibble;

/// How input lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One lenient command per line, executed immediately.
    #[default]
    Shell,
    /// Strict syntax, `|`-separated instructions and `name:` labels.
    Pipeline,
}

impl Mode {
    pub fn prompt(self) -> &'static str {
        match self {
            Mode::Shell => "SHELL> ",
            Mode::Pipeline => "PIPE|> ",
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted,
    Drained,
    CycleLimit,
    Stopped,
    /// An instruction failed; the error is kept in [`CpuContext::last_error`].
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Halted => "halted",
            RunOutcome::Drained => "end of program",
            RunOutcome::CycleLimit => "cycle limit reached",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub cycles: u64,
    pub retired: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} cycles, {} instructions retired", self.outcome, self.cycles, self.retired)
    }
}

/// The whole simulated machine plus the interactive front end state.
///
/// Every operation takes `&mut self`; concurrent users share one
/// `Arc<Mutex<CpuContext>>` so a tick is atomic with respect to commands.
pub struct CpuContext {
    config: CpuConfig,
    datapath: Datapath,
    pipeline: Pipeline,
    program: Option<Program>,
    mode: Mode,
    running: bool,
    clocked: bool,
    last_outcome: Option<RunOutcome>,
    last_error: Option<String>,
}

impl CpuContext {
    pub fn new(config: CpuConfig) -> Result<Self> {
        config.validate()?;
        let datapath = Datapath::new(&config)?;
        info!(name = %config.name, "machine created");
        Ok(Self {
            config,
            datapath,
            pipeline: Pipeline::new(),
            program: None,
            mode: Mode::Shell,
            running: false,
            clocked: false,
            last_outcome: None,
            last_error: None,
        })
    }

    /// Executes one line of user input.
    ///
    /// A line ending in `:`, starting with `;` or containing `|` switches a
    /// shell session into pipeline mode first.
    /// Returns: text to show the user, if any
    pub fn execute_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if self.mode == Mode::Shell && looks_like_pipeline(line) {
            info!("pipeline syntax detected, switching modes");
            self.mode = Mode::Pipeline;
        }
        match self.mode {
            Mode::Shell => self.dispatch(line, Syntax::Shell),
            Mode::Pipeline => self.execute_pipeline_line(line),
        }
    }

    fn execute_pipeline_line(&mut self, line: &str) -> Result<Option<String>> {
        let code = line.split(';').next().unwrap_or_default();
        let mut output = Vec::new();
        for segment in code.split('|').map(str::trim).filter(|s| !s.is_empty()) {
            let segment = match segment.split_once(':') {
                Some((name, rest)) => {
                    let name = name.trim();
                    if !asm::is_label_name(name) {
                        return Err(ParseError::InvalidLabel(name.to_string()).into());
                    }
                    let pc = self.datapath.pc();
                    self.datapath.bind_label(name, pc);
                    rest.trim()
                }
                None => segment,
            };
            if segment.is_empty() {
                continue;
            }
            if let Some(text) = self.dispatch(segment, Syntax::Pipeline)? {
                output.push(text);
            }
        }
        Ok((!output.is_empty()).then(|| output.join("\n")))
    }

    fn dispatch(&mut self, text: &str, syntax: Syntax) -> Result<Option<String>> {
        match asm::parse_line(text, syntax)? {
            None => Ok(None),
            Some(Command::Exec(instruction)) => {
                self.execute_instruction(&instruction)?;
                Ok(None)
            }
            Some(Command::Host(command)) => self.host(command),
        }
    }

    /// Executes one instruction immediately, outside the pipeline.
    /// PC only changes when the instruction transfers control.
    pub fn execute_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        let at = self.datapath.pc();
        let flow = self.datapath.execute(instruction, at, None);
        self.datapath.end_cycle();
        if flow? == Flow::Halted {
            self.running = false;
            self.pipeline.flush();
            self.last_outcome = Some(RunOutcome::Halted);
        }
        Ok(())
    }

    fn host(&mut self, command: HostCommand) -> Result<Option<String>> {
        let text = match command {
            HostCommand::Run => {
                if self.clocked {
                    self.start_run();
                    "running on the clock".to_string()
                } else {
                    self.run()?.to_string()
                }
            }
            HostCommand::Step => {
                let report = self.step()?;
                self.describe_tick(&report)
            }
            HostCommand::Stop => {
                self.stop();
                "stopped".to_string()
            }
            HostCommand::Reset => {
                self.reset();
                "reset".to_string()
            }
            HostCommand::Regs => self.regs_report(),
            HostCommand::Mem => self.memory_report(Nibble::ZERO, Nibble::MAX),
            HostCommand::MemRange(from, to) => self.memory_report(from, to),
            HostCommand::Save(path) => {
                self.save_state(&path)?;
                format!("state saved to {}", path.display())
            }
            HostCommand::Load(path) => {
                self.load_state(&path)?;
                format!("state loaded from {}", path.display())
            }
            HostCommand::Program(path) => {
                let count = self.load_program_file(&path)?;
                format!("{count} instructions loaded from {}", path.display())
            }
            HostCommand::Key(text) => {
                self.key_buffer().push_str(&text);
                format!("{} key(s) queued", text.len())
            }
            HostCommand::Screen => self.screen(),
            HostCommand::Help => asm::help_text(),
            HostCommand::Perf => self.perf_report(),
            HostCommand::Shell => {
                self.mode = Mode::Shell;
                "shell mode".to_string()
            }
            HostCommand::Pipeline => {
                self.mode = Mode::Pipeline;
                "pipeline mode".to_string()
            }
        };
        Ok(Some(text))
    }

    /// Prepares a pipelined run from address 0.
    pub fn start_run(&mut self) {
        self.pipeline.flush();
        self.datapath.set_pc(Nibble::ZERO);
        self.datapath.clear_call_stack();
        self.running = true;
        self.last_outcome = None;
        self.last_error = None;
        info!(
            source = if self.program.is_some() { "program" } else { "memory" },
            "run started"
        );
    }

    /// Runs to completion on the caller's thread, bounded by
    /// `run.max_cycles`.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.start_run();
        let retired_before = self.pipeline.stats().retired;
        let mut cycles = 0;
        let outcome = loop {
            if !self.running {
                break self.last_outcome.unwrap_or(RunOutcome::Stopped);
            }
            if cycles >= self.config.run.max_cycles {
                warn!(cycles, "run hit the cycle limit");
                self.running = false;
                self.pipeline.flush();
                break RunOutcome::CycleLimit;
            }
            self.step()?;
            cycles += 1;
        };
        Ok(RunSummary {
            outcome,
            cycles,
            retired: self.pipeline.stats().retired - retired_before,
        })
    }

    /// Advances the pipeline one clock tick.
    pub fn step(&mut self) -> Result<TickReport> {
        let mut engine = Engine {
            datapath: &mut self.datapath,
            program: self.program.as_ref(),
        };
        let result = self.pipeline.tick(&mut engine);
        self.datapath.end_cycle();
        match result {
            Ok(report) => {
                if report.halted {
                    self.finish(RunOutcome::Halted);
                } else if report.drained {
                    self.finish(RunOutcome::Drained);
                }
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "run stopped");
                self.running = false;
                self.last_outcome = Some(RunOutcome::Failed);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn finish(&mut self, outcome: RunOutcome) {
        if self.running {
            info!(?outcome, "run finished");
        }
        self.running = false;
        self.last_outcome = Some(outcome);
    }

    pub fn stop(&mut self) {
        if self.running {
            self.finish(RunOutcome::Stopped);
        }
    }

    /// PC cleared, registers float, RAM/flags/interrupts/call stack
    /// cleared, pipeline flushed. Labels and the loaded program stay.
    pub fn reset(&mut self) {
        self.datapath.reset();
        self.pipeline.flush();
        self.running = false;
        self.last_outcome = None;
        self.last_error = None;
    }

    /// Stable copy of the architectural state. Floating registers report
    /// their latched bits and device ports are not read.
    pub fn snapshot(&self) -> CpuState {
        let registers = self.datapath.registers();
        CpuState {
            registers: Reg::ALL.map(|reg| registers.peek(reg)),
            pc: self.datapath.pc(),
            memory: self.datapath.bus().snapshot(),
            labels: self.datapath.labels().clone(),
            call_stack: self.datapath.call_stack().to_vec(),
            flags: self.datapath.alu().flags(),
            interrupts: self.datapath.alu().interrupts().state().clone(),
        }
    }

    /// Replaces the whole architectural state.
    pub fn restore(&mut self, state: CpuState) -> Result<()> {
        self.datapath.set_call_stack(state.call_stack)?;
        for (reg, value) in Reg::ALL.into_iter().zip(state.registers) {
            self.datapath.registers_mut().write(reg, value);
        }
        self.datapath.set_pc(state.pc);
        self.datapath.bus_mut().restore(&state.memory);
        self.datapath.set_labels(state.labels);
        let alu = self.datapath.alu_mut();
        alu.set_flags(state.flags);
        alu.interrupts_mut().restore(state.interrupts);
        alu.invalidate_compare_cache();
        self.pipeline.flush();
        self.running = false;
        Ok(())
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        self.snapshot().write_to(path)
    }

    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        let state = CpuState::read_from(path)?;
        self.restore(state)
    }

    /// Saves to the configured state file when autosave is on.
    /// Returns: true when a file was written
    pub fn autosave(&self) -> Result<bool> {
        if !self.config.state.autosave {
            return Ok(false);
        }
        self.save_state(&self.config.state.file)?;
        Ok(true)
    }

    /// Assembles program text and makes it the fetch source for `run`.
    /// Returns: number of instructions
    pub fn load_program_source(&mut self, source: &str) -> Result<usize> {
        let program = Program::assemble(source)?;
        Ok(self.install_program(program))
    }

    pub fn load_program_file(&mut self, path: &Path) -> Result<usize> {
        let program = Program::from_file(path)?;
        Ok(self.install_program(program))
    }

    fn install_program(&mut self, program: Program) -> usize {
        for (name, address) in program.labels() {
            self.datapath.bind_label(name, *address);
        }
        let len = program.len();
        self.pipeline.flush();
        self.program = Some(program);
        len
    }

    /// Forgets the loaded program; `run` fetches from memory again.
    pub fn unload_program(&mut self) {
        self.program = None;
        self.pipeline.flush();
    }

    pub fn regs_report(&self) -> String {
        let registers = self.datapath.registers();
        let regs: Vec<String> = Reg::ALL
            .iter()
            .map(|&reg| {
                let marker = if registers.is_floating(reg) { "~" } else { "" };
                format!("{reg}: {}{marker}", registers.peek(reg))
            })
            .collect();
        let flags = self.flags();
        let irq = self.interrupts();
        let bits = |set: &[bool; 4]| set.iter().map(|&b| if b { '1' } else { '0' }).collect::<String>();
        let stack: Vec<String> = self.call_stack().iter().map(Nibble::to_string).collect();
        format!(
            "{}\nPC: {}  Z: {}  C: {}\nIRQ: enabled={} mask={} status={} in_handler={}\ncall stack: [{}]\nrun: {}",
            regs.join("  "),
            self.pc(),
            u8::from(flags.zero),
            u8::from(flags.carry),
            irq.enabled,
            bits(&irq.irq_mask),
            bits(&irq.irq_status),
            irq.in_handler,
            stack.join(", "),
            self.run_status()
        )
    }

    /// Dumps `from..=to` (either order) without touching device ports.
    pub fn memory_report(&self, from: Nibble, to: Nibble) -> String {
        let (low, high) = if from.index() <= to.index() { (from, to) } else { (to, from) };
        let bus = self.datapath.bus();
        let map = bus.map();
        (low.index()..=high.index())
            .map(|index| {
                let address = Nibble::from_low_bits(index as u8);
                let tag = if address == map.key_status {
                    "  key status"
                } else if address == map.key_data {
                    "  key data"
                } else if address == map.char_out {
                    "  char out"
                } else if index < map.rom_size {
                    "  rom"
                } else if index >= map.span() {
                    "  unmapped"
                } else {
                    ""
                };
                format!("{address} ({index:>2}): {}{tag}", bus.peek(address))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn perf_report(&self) -> String {
        let stats = self.pipeline.stats();
        let alu = self.datapath.alu();
        let bus = self.datapath.bus().stats();
        let (reg_hits, reg_misses) = self.datapath.registers().cache_stats();
        let last_op = alu.last_op().map_or("-", |op| op.mnemonic());
        format!(
            "last ALU op: {last_op} in {:?} ({} total)\n\
             compare cache hits: {}\n\
             register cache: {reg_hits} hits, {reg_misses} misses\n\
             pipeline: {} cycles, {} retired, {} stalls, {} flushes, {} interrupts\n\
             bus: {} reads, {} writes, {} fetches",
            alu.last_op_time(),
            alu.operations(),
            alu.compare_cache().hits(),
            stats.cycles,
            stats.retired,
            stats.stalls,
            stats.flushes,
            stats.interrupts,
            bus.reads,
            bus.writes,
            bus.fetches
        )
    }

    /// Terminal screen contents without trailing blank rows.
    pub fn screen(&self) -> String {
        let mut lines = self.datapath.bus().terminal().screen_lines();
        while lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        lines.join("\n")
    }

    fn describe_tick(&self, report: &TickReport) -> String {
        if let Some((line, vector)) = report.interrupt {
            return format!("{line} taken, PC = {vector}");
        }
        let mut parts = Vec::new();
        if let Some(record) = &report.completed {
            parts.push(format!("executed {} @ {}", asm::format_instruction(&record.instruction), record.pc));
        }
        if report.stalled {
            parts.push("stalled".to_string());
        }
        if report.halted {
            parts.push("halted".to_string());
        } else if report.drained {
            parts.push("pipeline drained".to_string());
        }
        parts.push(self.pipeline_summary());
        parts.join("\n")
    }

    /// One-line view of the three stages.
    pub fn pipeline_summary(&self) -> String {
        let fetch = self
            .pipeline
            .fetch_stage()
            .map_or("-".to_string(), |slot| format!("@{}", slot.pc));
        let stage = |record: &StageRecord| {
            if record.valid {
                format!("{} @{}", asm::format_instruction(&record.instruction), record.pc)
            } else {
                "-".to_string()
            }
        };
        format!(
            "fetch [{fetch}] decode [{}] execute [{}] PC = {}",
            stage(self.pipeline.decode_stage()),
            stage(self.pipeline.execute_stage()),
            self.pc()
        )
    }

    pub fn register(&self, reg: Reg) -> Nibble {
        self.datapath.registers().peek(reg)
    }

    pub fn pc(&self) -> Nibble {
        self.datapath.pc()
    }

    pub fn flags(&self) -> Flags {
        self.datapath.alu().flags()
    }

    pub fn interrupts(&self) -> &InterruptState {
        self.datapath.alu().interrupts().state()
    }

    pub fn call_stack(&self) -> &[Nibble] {
        self.datapath.call_stack()
    }

    pub fn labels(&self) -> &BTreeMap<String, Nibble> {
        self.datapath.labels()
    }

    pub fn datapath(&self) -> &Datapath {
        &self.datapath
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    pub fn key_buffer(&self) -> KeyBuffer {
        self.datapath.bus().terminal().key_buffer()
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn prompt(&self) -> &'static str {
        self.mode.prompt()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.last_outcome
    }

    /// Error that ended the last run, located by program line or address.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// "running", "idle", or how the last run ended.
    pub fn run_status(&self) -> String {
        match (self.running, self.last_outcome, &self.last_error) {
            (true, _, _) => "running".to_string(),
            (false, Some(RunOutcome::Failed), Some(error)) => format!("failed: {error}"),
            (false, Some(outcome), _) => outcome.to_string(),
            (false, None, _) => "idle".to_string(),
        }
    }

    /// With a clock attached, `run` only starts the machine and the clock
    /// thread drives it.
    pub fn set_clocked(&mut self, clocked: bool) {
        self.clocked = clocked;
    }
}

fn looks_like_pipeline(line: &str) -> bool {
    line.ends_with(':') || line.starts_with(';') || line.contains('|')
}
