//! Staged execution: hazards, interrupts and program runs.

mod mocks;

use emu4::components::alu::Flags;
use emu4::components::pipeline::{Executor, Fetched, Flow, Pipeline};
use emu4::error::{EmuError, ExecutionError};
use emu4::isa::{self, Instruction, IrqLine, MemRef, Reg, Source};
use emu4::systems::cpu_context::RunOutcome;
use emu4::types::Nibble;
use mocks::*;

/// Feeds a fixed instruction list and executes nothing but bookkeeping.
struct Script {
    pc: Nibble,
    program: Vec<Instruction>,
    executed: Vec<Nibble>,
}

impl Script {
    fn new(program: Vec<Instruction>) -> Self {
        Self {
            pc: Nibble::ZERO,
            program,
            executed: Vec::new(),
        }
    }
}

impl Executor for Script {
    fn pc(&self) -> Nibble {
        self.pc
    }

    fn advance_pc(&mut self) {
        self.pc = self.pc.increment().0;
    }

    fn fetch(&mut self, pc: Nibble) -> Option<Fetched> {
        self.program.get(pc.index()).map(|instruction| Fetched::Decoded {
            instruction: instruction.clone(),
            line: pc.index() + 1,
        })
    }

    fn execute(&mut self, _instruction: &Instruction, at: Nibble) -> emu4::Result<Flow> {
        self.executed.push(at);
        Ok(Flow::Next)
    }

    fn pending_interrupt(&self) -> Option<IrqLine> {
        None
    }

    fn enter_interrupt(&mut self, line: IrqLine, _resume_pc: Nibble) -> Nibble {
        line.vector()
    }
}

#[test]
fn load_use_hazard_inserts_one_bubble() {
    let load = Instruction::Load {
        dst: Reg::R0,
        addr: MemRef::Indirect(Reg::R1),
    };
    let add = Instruction::Alu {
        op: isa::AluOp::Add,
        dst: Reg::R0,
        src: Source::Reg(Reg::R2),
    };
    let mut script = Script::new(vec![load, add]);
    let mut pipeline = Pipeline::new();

    let mut stalls = Vec::new();
    for _ in 0..8 {
        let report = pipeline.tick(&mut script).unwrap();
        if report.stalled {
            stalls.push(pipeline.decode_stage().pc);
            assert!(!pipeline.execute_stage().valid, "bubble, not a stale add");
        }
        if report.drained {
            break;
        }
    }
    assert_eq!(stalls, vec![n(1)]);
    assert_eq!(script.executed, vec![n(0), n(1)]);
    assert_eq!(pipeline.stats().stalls, 1);
}

#[test]
fn independent_instructions_do_not_stall() {
    let mut script = Script::new(vec![
        Instruction::Mov {
            dst: Reg::R0,
            src: Source::Imm(n(1)),
        },
        Instruction::Mov {
            dst: Reg::R1,
            src: Source::Imm(n(2)),
        },
        Instruction::Nop,
    ]);
    let mut pipeline = Pipeline::new();
    while !pipeline.tick(&mut script).unwrap().drained {}
    assert_eq!(pipeline.stats().stalls, 0);
    assert_eq!(pipeline.stats().retired, 3);
}

#[test]
fn memory_run_decodes_binary_words() {
    let mut config = deterministic_config();
    config.memory.rom_size = 4;
    config.memory.ram_size = 9;
    config.memory.rom_image = vec!["mov r0 r1".into(), "add r0 r1".into(), "0000".into(), "hlt".into()];
    let mut cpu = emu4::CpuContext::new(config).unwrap();
    cpu.execute_line("mov r1 0011").unwrap();

    let summary = cpu.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Halted);
    assert_eq!(cpu.register(Reg::R0), n(6));
    assert_eq!(summary.retired, 4);
}

#[test]
fn interrupt_round_trip_restores_pc_and_flags() {
    let mut cpu = context();
    cpu.load_program_source(
        "nop\n\
         nop\n\
         nop\n\
         nop\n\
         mov r2 1111\n\
         iret\n",
    )
    .unwrap();
    cpu.execute_line("mov r0 0").unwrap();
    cpu.execute_line("sub r0 1").unwrap();
    let flags = cpu.flags();
    assert_eq!(flags, Flags { zero: false, carry: false });

    cpu.execute_line("mask 1 1").unwrap();
    cpu.execute_line("ei").unwrap();
    cpu.start_run();
    cpu.step().unwrap();
    cpu.step().unwrap();
    let resume = cpu.pipeline().decode_stage().pc;
    assert_eq!(resume, Nibble::ZERO);

    cpu.execute_line("irq 1").unwrap();
    let report = cpu.step().unwrap();
    assert_eq!(report.interrupt, Some((IrqLine::new(1).unwrap(), n(4))));
    assert_eq!(cpu.pc(), n(4));
    assert!(cpu.interrupts().in_handler);
    assert!(!cpu.interrupts().irq_status[1], "request cleared on entry");

    cpu.execute_line("add r0 1").unwrap();
    assert_ne!(cpu.flags(), flags);

    let mut returned = false;
    for _ in 0..12 {
        let report = cpu.step().unwrap();
        if report.completed.as_ref().map(|c| &c.instruction) == Some(&Instruction::Iret) {
            returned = true;
            break;
        }
    }
    assert!(returned);
    assert_eq!(cpu.pc(), resume);
    assert_eq!(cpu.flags(), flags);
    assert_eq!(cpu.register(Reg::R2), n(15));
    assert!(!cpu.interrupts().in_handler);
}

#[test]
fn masked_or_disabled_lines_are_ignored() {
    let mut cpu = context();
    cpu.load_program_source("nop\nnop\n").unwrap();
    cpu.execute_line("irq 0").unwrap();
    cpu.execute_line("ei").unwrap();
    cpu.start_run();
    let report = cpu.step().unwrap();
    assert_eq!(report.interrupt, None, "line 0 is masked");

    cpu.execute_line("mask 0 1").unwrap();
    cpu.execute_line("di").unwrap();
    assert_eq!(cpu.step().unwrap().interrupt, None, "interrupts disabled");
}

#[test]
fn program_subroutine_call() {
    let mut cpu = context();
    cpu.load_program_source(
        "mov r0 0\n\
         call double\n\
         call double\n\
         hlt\n\
         double:\n\
         add r0 0010\n\
         ret\n",
    )
    .unwrap();
    let summary = cpu.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Halted);
    assert_eq!(cpu.register(Reg::R0), n(4));
    assert!(cpu.call_stack().is_empty());
}

#[test]
fn return_outside_the_program_stops_the_run() {
    let mut cpu = context();
    cpu.load_program_source("mov r0 1\nret\n").unwrap();
    cpu.start_run();
    exec_all(&mut cpu, &["mov r3 1100", "jmp r3", "call 0"]);
    assert_eq!(cpu.call_stack(), &[n(13)]);

    let mut error = None;
    for _ in 0..10 {
        if let Err(e) = cpu.step() {
            error = Some(e);
            break;
        }
    }
    let error = error.expect("ret to 1101 must fail");
    assert!(matches!(error, EmuError::Run { line: 2, .. }));
    assert!(matches!(
        error.root(),
        EmuError::Execution(ExecutionError::ReturnOutOfRange { len: 2, .. })
    ));
    assert!(!cpu.is_running());
}

#[test]
fn undefined_label_fails_assembly() {
    let mut cpu = context();
    let err = cpu.load_program_source("jmp missing\n").unwrap_err();
    assert!(matches!(err.root(), EmuError::UndefinedLabel(name) if name == "missing"));
    assert!(cpu.program().is_none());
}

#[test]
fn step_command_reports_stage_contents() {
    let mut cpu = context();
    cpu.load_program_source("mov r0 1\nmov r1 2\n").unwrap();
    cpu.execute_line("step").unwrap();
    let text = cpu.execute_line("step").unwrap().unwrap();
    assert!(text.contains("decode [mov r0 0001 @0000]"), "{text}");
    assert!(text.contains("fetch [@0001]"), "{text}");
}

fn full_length_program() -> String {
    format!("mov r0 0000\nadd r0 0001\n{}", "nop\n".repeat(14))
}

#[test]
fn full_length_program_drains_instead_of_wrapping() {
    let mut cpu = context();
    assert_eq!(cpu.load_program_source(&full_length_program()).unwrap(), 16);

    let summary = cpu.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Drained);
    assert_eq!(summary.retired, 16);
    assert_eq!(cpu.register(Reg::R0), n(1), "ran exactly once");
}

#[test]
fn jump_after_wrap_fetches_again() {
    let mut cpu = context();
    cpu.load_program_source(&full_length_program()).unwrap();
    cpu.run().unwrap();
    assert!(cpu.pipeline().is_empty());

    exec_all(&mut cpu, &["mov r3 1111", "jmp r3"]);
    let mut fetched = false;
    for _ in 0..3 {
        cpu.step().unwrap();
        fetched |= cpu.pipeline().fetch_stage().is_some();
    }
    assert!(fetched, "writing PC re-arms the program source");
}

#[test]
fn failed_run_records_the_failing_line() {
    let mut cpu = context();
    cpu.load_program_source("nop\nret\n").unwrap();
    let err = cpu.run().unwrap_err();
    assert!(matches!(err, EmuError::Run { line: 2, .. }));
    assert_eq!(cpu.last_outcome(), Some(RunOutcome::Failed));
    assert!(cpu.run_status().starts_with("failed: line 2"), "{}", cpu.run_status());
    assert!(cpu.regs_report().contains("run: failed: line 2"));

    exec_all(&mut cpu, &["reset"]);
    assert_eq!(cpu.last_error(), None);
    assert_eq!(cpu.run_status(), "idle");
}
