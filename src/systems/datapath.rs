use std::collections::BTreeMap;

use tracing::debug;

use crate::asm::Program;
use crate::bus::{MemoryBus, MemoryMap};
use crate::component::Component;
use crate::components::alu::Alu;
use crate::components::pipeline::{Executor, Fetched, Flow};
use crate::components::registers::{ProgramCounter, RegisterFile};
use crate::error::{EmuError, ExecutionError, Result};
use crate::isa::{AluOp, Cond, Instruction, IrqLine, MemRef, Reg, Source, Target};
use crate::system_config::CpuConfig;
use crate::types::Nibble;

/// Deepest allowed call nesting.
pub const CALL_STACK_DEPTH: usize = 16;

/// Architectural state plus the instruction semantics.
///
/// Both front ends end up here: shell commands call [`Datapath::execute`]
/// directly, the pipeline calls it through [`Engine`].
pub struct Datapath {
    registers: RegisterFile,
    pc: ProgramCounter,
    alu: Alu,
    bus: MemoryBus,
    labels: BTreeMap<String, Nibble>,
    call_stack: Vec<Nibble>,
}

impl Datapath {
    pub fn new(config: &CpuConfig) -> Result<Self> {
        let map = MemoryMap::from_config(&config.memory)?;
        let mut bus = MemoryBus::new(map);
        bus.load_rom(&config.rom_words()?)?;
        Ok(Self {
            registers: RegisterFile::new(&config.registers),
            pc: ProgramCounter::new(),
            alu: Alu::new(&config.alu),
            bus,
            labels: BTreeMap::new(),
            call_stack: Vec::new(),
        })
    }

    /// Executes one instruction located at `at`.
    /// `program_len` is set while running an assembled program and bounds
    /// return addresses.
    pub fn execute(&mut self, instruction: &Instruction, at: Nibble, program_len: Option<usize>) -> Result<Flow> {
        match instruction {
            Instruction::Nop => Ok(Flow::Next),
            Instruction::Alu { op, dst, src } => self.execute_alu(*op, *dst, src),
            Instruction::Mov { dst, src } => {
                let value = self.read_source(src);
                self.registers.write(*dst, value);
                Ok(Flow::Next)
            }
            Instruction::Load { dst, addr } => self.execute_load(*dst, addr),
            Instruction::Store { addr, src } => self.execute_store(addr, *src),
            Instruction::Jump { cond, target } => self.execute_jump(*cond, target),
            Instruction::Call { target } => self.execute_call(target, at),
            Instruction::Ret => self.execute_ret(program_len),
            Instruction::Irq { line } => {
                self.alu.interrupts_mut().raise(*line);
                Ok(Flow::Next)
            }
            Instruction::Mask { line, enabled } => {
                self.alu.interrupts_mut().set_mask(*line, *enabled);
                Ok(Flow::Next)
            }
            Instruction::Ei => {
                self.alu.interrupts_mut().enable();
                Ok(Flow::Next)
            }
            Instruction::Di => {
                self.alu.interrupts_mut().disable();
                Ok(Flow::Next)
            }
            Instruction::Iret => {
                let (pc, flags) = self.alu.interrupts_mut().leave()?;
                self.pc.write(pc);
                self.alu.set_flags(flags);
                Ok(Flow::Jumped)
            }
            Instruction::Halt => Ok(Flow::Halted),
        }
    }

    fn execute_alu(&mut self, op: AluOp, dst: Reg, src: &Source) -> Result<Flow> {
        let a = self.registers.read(dst);
        let b = self.read_source(src);
        let output = self.alu.execute(op, a, b);
        if op.writes_result() {
            self.registers.write(dst, output.result);
        }
        Ok(Flow::Next)
    }

    fn execute_load(&mut self, dst: Reg, addr: &MemRef) -> Result<Flow> {
        let address = self.address(addr);
        let value = self.bus.read(address);
        self.registers.write(dst, value);
        Ok(Flow::Next)
    }

    fn execute_store(&mut self, addr: &MemRef, src: Reg) -> Result<Flow> {
        let address = self.address(addr);
        let value = self.registers.read(src);
        self.bus.write(address, value, true);
        Ok(Flow::Next)
    }

    /// Flags are only read here, never cleared.
    fn execute_jump(&mut self, cond: Cond, target: &Target) -> Result<Flow> {
        let flags = self.alu.flags();
        let taken = match cond {
            Cond::Always => true,
            Cond::Zero => flags.zero,
            Cond::NotZero => !flags.zero,
            Cond::Carry => flags.carry,
        };
        if !taken {
            return Ok(Flow::Next);
        }
        let destination = self.resolve_target(target)?;
        self.pc.write(destination);
        Ok(Flow::Jumped)
    }

    fn execute_call(&mut self, target: &Target, at: Nibble) -> Result<Flow> {
        if self.call_stack.len() >= CALL_STACK_DEPTH {
            return Err(ExecutionError::CallStackOverflow(self.call_stack.len()).into());
        }
        let destination = self.resolve_target(target)?;
        let (return_address, _) = at.increment();
        self.call_stack.push(return_address);
        self.pc.write(destination);
        debug!(%destination, %return_address, depth = self.call_stack.len(), "call");
        Ok(Flow::Jumped)
    }

    fn execute_ret(&mut self, program_len: Option<usize>) -> Result<Flow> {
        let address = self.call_stack.pop().ok_or(ExecutionError::EmptyCallStack)?;
        if let Some(len) = program_len {
            if address.index() >= len {
                return Err(ExecutionError::ReturnOutOfRange { address, len }.into());
            }
        }
        self.pc.write(address);
        Ok(Flow::Jumped)
    }

    fn read_source(&mut self, src: &Source) -> Nibble {
        match src {
            Source::Reg(reg) => self.registers.read(*reg),
            Source::Imm(value) => *value,
            Source::Mem(addr) => {
                let address = self.address(addr);
                self.bus.read(address)
            }
        }
    }

    fn address(&mut self, addr: &MemRef) -> Nibble {
        match addr {
            MemRef::Direct(address) => *address,
            MemRef::Indirect(reg) => self.registers.read(*reg),
        }
    }

    fn resolve_target(&mut self, target: &Target) -> Result<Nibble> {
        match target {
            Target::Reg(reg) => Ok(self.registers.read(*reg)),
            Target::Addr(address) => Ok(*address),
            Target::Label(name) => self
                .labels
                .get(name)
                .copied()
                .ok_or_else(|| EmuError::UndefinedLabel(name.clone())),
        }
    }

    /// Enters the handler for `line`, saving `resume_pc` and the flags.
    pub fn enter_interrupt(&mut self, line: IrqLine, resume_pc: Nibble) -> Nibble {
        let flags = self.alu.flags();
        let vector = self.alu.interrupts_mut().enter(line, resume_pc, flags);
        self.pc.write(vector);
        vector
    }

    /// Closes a clock cycle: drops single-cycle write enables.
    pub fn end_cycle(&mut self) {
        self.bus.sync();
    }

    pub fn bind_label(&mut self, name: &str, address: Nibble) {
        self.labels.insert(name.to_string(), address);
    }

    pub fn labels(&self) -> &BTreeMap<String, Nibble> {
        &self.labels
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, Nibble>) {
        self.labels = labels;
    }

    pub fn call_stack(&self) -> &[Nibble] {
        &self.call_stack
    }

    pub fn set_call_stack(&mut self, stack: Vec<Nibble>) -> Result<()> {
        if stack.len() > CALL_STACK_DEPTH {
            return Err(ExecutionError::CallStackOverflow(stack.len()).into());
        }
        self.call_stack = stack;
        Ok(())
    }

    pub fn clear_call_stack(&mut self) {
        self.call_stack.clear();
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn pc(&self) -> Nibble {
        self.pc.read()
    }

    pub fn set_pc(&mut self, address: Nibble) {
        self.pc.write(address);
    }

    pub fn alu(&self) -> &Alu {
        &self.alu
    }

    pub fn alu_mut(&mut self) -> &mut Alu {
        &mut self.alu
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut MemoryBus {
        &mut self.bus
    }
}

impl Component for Datapath {
    fn name(&self) -> &str {
        "DATAPATH"
    }

    /// PC cleared, registers float, flags/interrupts/RAM/terminal cleared.
    /// Labels survive.
    fn reset(&mut self) {
        self.registers.reset();
        self.pc.reset();
        self.alu.reset();
        self.bus.reset();
        self.call_stack.clear();
    }
}

/// Pipeline view of the datapath, fetching from an assembled program when
/// one is given and from memory otherwise.
pub struct Engine<'a> {
    pub datapath: &'a mut Datapath,
    pub program: Option<&'a Program>,
}

impl Executor for Engine<'_> {
    fn pc(&self) -> Nibble {
        self.datapath.pc()
    }

    fn advance_pc(&mut self) {
        self.datapath.pc.increment();
    }

    /// A program source is exhausted once PC has wrapped past its last
    /// address; memory keeps fetching around the ring.
    fn fetch(&mut self, pc: Nibble) -> Option<Fetched> {
        match self.program {
            Some(_) if self.datapath.pc.has_wrapped() => None,
            Some(program) => program.get(pc.index()).map(|entry| Fetched::Decoded {
                instruction: entry.instruction.clone(),
                line: entry.line,
            }),
            None => Some(Fetched::Word(self.datapath.bus.fetch(pc))),
        }
    }

    fn execute(&mut self, instruction: &Instruction, at: Nibble) -> Result<Flow> {
        self.datapath.execute(instruction, at, self.program.map(Program::len))
    }

    fn pending_interrupt(&self) -> Option<IrqLine> {
        self.datapath.alu.interrupts().pending()
    }

    fn enter_interrupt(&mut self, line: IrqLine, resume_pc: Nibble) -> Nibble {
        self.datapath.enter_interrupt(line, resume_pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_config::RegisterConfig;

    fn n(value: u8) -> Nibble {
        Nibble::from_u8(value).unwrap()
    }

    fn datapath() -> Datapath {
        let mut config = CpuConfig::default();
        config.registers = RegisterConfig {
            settle_time_ms: 0,
            seed: Some(1),
            cache_enabled: true,
        };
        Datapath::new(&config).unwrap()
    }

    fn run(dp: &mut Datapath, instruction: Instruction) -> Result<Flow> {
        let at = dp.pc();
        let flow = dp.execute(&instruction, at, None);
        dp.end_cycle();
        flow
    }

    #[test]
    fn test_alu_writes_destination_but_cmp_does_not() {
        let mut dp = datapath();
        dp.registers_mut().write(Reg::R0, n(9));
        run(&mut dp, Instruction::Alu { op: AluOp::Sub, dst: Reg::R0, src: Source::Imm(n(4)) }).unwrap();
        assert_eq!(dp.registers().peek(Reg::R0), n(5));

        run(&mut dp, Instruction::Alu { op: AluOp::Cmp, dst: Reg::R0, src: Source::Imm(n(5)) }).unwrap();
        assert_eq!(dp.registers().peek(Reg::R0), n(5));
        assert!(dp.alu().flags().zero);
    }

    #[test]
    fn test_mov_and_jump_leave_flags_alone() {
        let mut dp = datapath();
        dp.registers_mut().write(Reg::R0, n(15));
        run(&mut dp, Instruction::Alu { op: AluOp::Add, dst: Reg::R0, src: Source::Imm(n(1)) }).unwrap();
        let flags = dp.alu().flags();
        run(&mut dp, Instruction::Mov { dst: Reg::R1, src: Source::Imm(n(3)) }).unwrap();
        let flow = run(&mut dp, Instruction::Jump { cond: Cond::Zero, target: Target::Addr(n(7)) }).unwrap();
        assert_eq!(flow, Flow::Jumped);
        assert_eq!(dp.pc(), n(7));
        assert_eq!(dp.alu().flags(), flags);
    }

    #[test]
    fn test_untaken_jump_is_next() {
        let mut dp = datapath();
        dp.registers_mut().write(Reg::R0, n(1));
        run(&mut dp, Instruction::Alu { op: AluOp::Or, dst: Reg::R0, src: Source::Imm(n(0)) }).unwrap();
        let flow = run(&mut dp, Instruction::Jump { cond: Cond::Zero, target: Target::Addr(n(7)) }).unwrap();
        assert_eq!(flow, Flow::Next);
        assert_eq!(dp.pc(), Nibble::ZERO);
    }

    #[test]
    fn test_call_and_ret_use_the_stack() {
        let mut dp = datapath();
        dp.set_pc(n(3));
        run(&mut dp, Instruction::Call { target: Target::Addr(n(9)) }).unwrap();
        assert_eq!(dp.pc(), n(9));
        assert_eq!(dp.call_stack(), &[n(4)]);
        run(&mut dp, Instruction::Ret).unwrap();
        assert_eq!(dp.pc(), n(4));

        let err = run(&mut dp, Instruction::Ret).unwrap_err();
        assert!(matches!(err, EmuError::Execution(ExecutionError::EmptyCallStack)));
    }

    #[test]
    fn test_return_outside_program_fails() {
        let mut dp = datapath();
        dp.set_call_stack(vec![n(6)]).unwrap();
        let err = dp.execute(&Instruction::Ret, n(0), Some(4)).unwrap_err();
        assert!(matches!(
            err,
            EmuError::Execution(ExecutionError::ReturnOutOfRange { len: 4, .. })
        ));
    }

    #[test]
    fn test_call_stack_depth_is_limited() {
        let mut dp = datapath();
        for _ in 0..CALL_STACK_DEPTH {
            run(&mut dp, Instruction::Call { target: Target::Addr(n(0)) }).unwrap();
        }
        let err = run(&mut dp, Instruction::Call { target: Target::Addr(n(0)) }).unwrap_err();
        assert!(matches!(err, EmuError::Execution(ExecutionError::CallStackOverflow(16))));
    }

    #[test]
    fn test_undefined_label_is_an_error() {
        let mut dp = datapath();
        let err = run(&mut dp, Instruction::Jump { cond: Cond::Always, target: Target::Label("x".into()) }).unwrap_err();
        assert!(matches!(err, EmuError::UndefinedLabel(ref name) if name == "x"));
        dp.bind_label("x", n(2));
        run(&mut dp, Instruction::Jump { cond: Cond::Always, target: Target::Label("x".into()) }).unwrap();
        assert_eq!(dp.pc(), n(2));
    }

    #[test]
    fn test_iret_restores_pc_and_flags() {
        let mut dp = datapath();
        dp.alu_mut().set_flags(crate::components::alu::Flags { zero: true, carry: true });
        let vector = dp.enter_interrupt(IrqLine::new(2).unwrap(), n(5));
        assert_eq!(vector, n(8));
        assert_eq!(dp.pc(), n(8));
        dp.alu_mut().set_flags(Default::default());

        assert_eq!(run(&mut dp, Instruction::Iret).unwrap(), Flow::Jumped);
        assert_eq!(dp.pc(), n(5));
        assert!(dp.alu().flags().zero && dp.alu().flags().carry);
    }

    #[test]
    fn test_reset_clears_pc_and_floats_registers() {
        let mut config = CpuConfig::default();
        config.registers.settle_time_ms = 10_000;
        let mut dp = Datapath::new(&config).unwrap();
        dp.set_pc(n(9));
        dp.bind_label("keep", n(1));
        dp.reset();
        assert_eq!(dp.pc(), Nibble::ZERO);
        assert!(dp.registers().is_floating(Reg::R2));
        assert_eq!(dp.labels().get("keep"), Some(&n(1)));
    }
}
