//! Text front end: command parsing, instruction formatting and program
//! assembly.
//!
//! Two operand syntaxes exist. The interactive shell is lenient (decimal,
//! hex and binary literals), pipeline lines are strict (4-digit binary
//! immediates only). Both accept `rN`, `[rN]`, `[addr]` and labels.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{EmuError, ParseError, Result};
use crate::isa::{AluOp, Cond, Instruction, IrqLine, MemRef, Reg, Source, Target};
use crate::types::Nibble;

/// Operand syntax accepted by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Syntax {
    #[default]
    Shell,
    Pipeline,
}

/// Host-side command with no binary encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Run,
    Step,
    Stop,
    Reset,
    Regs,
    Mem,
    MemRange(Nibble, Nibble),
    Save(PathBuf),
    Load(PathBuf),
    Program(PathBuf),
    Key(String),
    Screen,
    Help,
    Perf,
    Shell,
    Pipeline,
}

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exec(Instruction),
    Host(HostCommand),
}

/// Mnemonic table: name, operand count, help line.
pub const MNEMONICS: &[(&str, usize, &str)] = &[
    ("add", 2, "add <reg> <src>        dst = dst + src"),
    ("sub", 2, "sub <reg> <src>        dst = dst - src"),
    ("mul", 2, "mul <reg> <src>        dst = dst * src (low 4 bits)"),
    ("and", 2, "and <reg> <src>        bitwise and"),
    ("or", 2, "or <reg> <src>         bitwise or"),
    ("xor", 2, "xor <reg> <src>        bitwise xor"),
    ("cmp", 2, "cmp <reg> <src>        set flags from reg - src"),
    ("mov", 2, "mov <reg> <src>        copy a value into a register"),
    ("load", 2, "load <reg> [addr]      read memory"),
    ("store", 2, "store [addr] <reg>     write memory"),
    ("jmp", 1, "jmp <target>           jump"),
    ("jz", 1, "jz <target>            jump if zero"),
    ("jnz", 1, "jnz <target>           jump if not zero"),
    ("jc", 1, "jc <target>            jump if carry"),
    ("call", 1, "call <target>          push return address and jump"),
    ("ret", 0, "ret                    pop return address"),
    ("irq", 1, "irq <line>             raise interrupt line 0-3"),
    ("mask", 2, "mask <line> <0|1>      unmask (1) or mask (0) a line"),
    ("ei", 0, "ei                     enable interrupts"),
    ("di", 0, "di                     disable interrupts"),
    ("iret", 0, "iret                   return from interrupt"),
    ("nop", 0, "nop                    do nothing"),
    ("hlt", 0, "hlt                    halt the running program"),
    ("run", 0, "run                    run the loaded program"),
    ("step", 0, "step                   advance the pipeline one tick"),
    ("stop", 0, "stop                   stop a clocked run"),
    ("reset", 0, "reset                  clear PC, registers float until settled"),
    ("regs", 0, "regs                   show registers and flags"),
    ("mem", 0, "mem                    dump all memory"),
    ("memrange", 2, "memrange <from> <to>   dump part of memory"),
    ("save", 1, "save <file>            save machine state"),
    ("loadf", 1, "loadf <file>           load machine state"),
    ("program", 1, "program <file>         load program source"),
    ("key", 1, "key <text>             type text into the terminal"),
    ("screen", 0, "screen                 show the terminal screen"),
    ("help", 0, "help                   this list"),
    ("perf", 0, "perf                   performance counters"),
    ("shell", 0, "shell                  switch to shell mode"),
    ("pipeline", 0, "pipeline               switch to pipeline mode"),
];

pub fn operand_count(mnemonic: &str) -> Option<usize> {
    MNEMONICS
        .iter()
        .find(|(name, _, _)| *name == mnemonic)
        .map(|(_, count, _)| *count)
}

pub fn help_text() -> String {
    MNEMONICS
        .iter()
        .map(|(_, _, help)| *help)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses one command. Returns `None` for blank and comment-only text.
pub fn parse_line(line: &str, syntax: Syntax) -> Result<Option<Command>> {
    let code = strip_comment(line);
    let tokens: Vec<&str> = code
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .collect();
    let Some((&head, operands)) = tokens.split_first() else {
        return Ok(None);
    };

    let mnemonic = head.to_ascii_lowercase();
    if mnemonic == "key" {
        return key_text(code, head).map(Some);
    }
    let expected = operand_count(&mnemonic).ok_or_else(|| ParseError::UnknownMnemonic(head.to_string()))?;
    if operands.len() != expected {
        return Err(ParseError::OperandCount {
            mnemonic,
            expected,
            found: operands.len(),
        }
        .into());
    }

    let parser = OperandParser {
        mnemonic: &mnemonic,
        syntax,
    };
    parser.build(operands).map(Some)
}

/// `key` takes the rest of the line verbatim, inner spaces included.
fn key_text(code: &str, head: &str) -> Result<Command> {
    let text = code.trim_start().strip_prefix(head).unwrap_or_default().trim();
    if text.is_empty() {
        return Err(ParseError::OperandCount {
            mnemonic: "key".to_string(),
            expected: 1,
            found: 0,
        }
        .into());
    }
    Ok(Command::Host(HostCommand::Key(text.to_string())))
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

pub fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct OperandParser<'a> {
    mnemonic: &'a str,
    syntax: Syntax,
}

impl OperandParser<'_> {
    fn build(&self, ops: &[&str]) -> Result<Command> {
        let exec = |instruction: Instruction| -> Result<Command> { Ok(Command::Exec(instruction)) };
        let host = |command: HostCommand| -> Result<Command> { Ok(Command::Host(command)) };

        match self.mnemonic {
            "add" | "sub" | "mul" | "and" | "or" | "xor" | "cmp" => {
                let op = match self.mnemonic {
                    "add" => AluOp::Add,
                    "sub" => AluOp::Sub,
                    "mul" => AluOp::Mul,
                    "and" => AluOp::And,
                    "or" => AluOp::Or,
                    "xor" => AluOp::Xor,
                    _ => AluOp::Cmp,
                };
                exec(Instruction::Alu {
                    op,
                    dst: self.register(ops[0])?,
                    src: self.source(ops[1])?,
                })
            }
            "mov" => exec(Instruction::Mov {
                dst: self.register(ops[0])?,
                src: self.source(ops[1])?,
            }),
            "load" => exec(Instruction::Load {
                dst: self.register(ops[0])?,
                addr: self.memory(ops[1])?,
            }),
            "store" => exec(Instruction::Store {
                addr: self.memory(ops[0])?,
                src: self.register(ops[1])?,
            }),
            "jmp" | "jz" | "jnz" | "jc" => {
                let cond = match self.mnemonic {
                    "jmp" => Cond::Always,
                    "jz" => Cond::Zero,
                    "jnz" => Cond::NotZero,
                    _ => Cond::Carry,
                };
                exec(Instruction::Jump {
                    cond,
                    target: self.target(ops[0])?,
                })
            }
            "call" => exec(Instruction::Call {
                target: self.target(ops[0])?,
            }),
            "ret" => exec(Instruction::Ret),
            "irq" => exec(Instruction::Irq {
                line: self.irq_line(ops[0])?,
            }),
            "mask" => exec(Instruction::Mask {
                line: self.irq_line(ops[0])?,
                enabled: self.switch(ops[1])?,
            }),
            "ei" => exec(Instruction::Ei),
            "di" => exec(Instruction::Di),
            "iret" => exec(Instruction::Iret),
            "nop" => exec(Instruction::Nop),
            "hlt" => exec(Instruction::Halt),
            "run" => host(HostCommand::Run),
            "step" => host(HostCommand::Step),
            "stop" => host(HostCommand::Stop),
            "reset" => host(HostCommand::Reset),
            "regs" => host(HostCommand::Regs),
            "mem" => host(HostCommand::Mem),
            "memrange" => host(HostCommand::MemRange(self.literal(ops[0])?, self.literal(ops[1])?)),
            "save" => host(HostCommand::Save(PathBuf::from(ops[0]))),
            "loadf" => host(HostCommand::Load(PathBuf::from(ops[0]))),
            "program" => host(HostCommand::Program(PathBuf::from(ops[0]))),
            "screen" => host(HostCommand::Screen),
            "help" => host(HostCommand::Help),
            "perf" => host(HostCommand::Perf),
            "shell" => host(HostCommand::Shell),
            "pipeline" => host(HostCommand::Pipeline),
            other => Err(ParseError::UnknownMnemonic(other.to_string()).into()),
        }
    }

    fn invalid(&self, operand: &str) -> ParseError {
        ParseError::InvalidOperand {
            mnemonic: self.mnemonic.to_string(),
            operand: operand.to_string(),
        }
    }

    /// `Ok(None)` when the token does not look like a register at all.
    fn try_register(&self, token: &str) -> Result<Option<Reg>> {
        let lower = token.to_ascii_lowercase();
        let Some(digits) = lower.strip_prefix('r') else {
            return Ok(None);
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        digits
            .parse::<usize>()
            .ok()
            .and_then(Reg::from_index)
            .map(Some)
            .ok_or_else(|| ParseError::UnknownRegister(token.to_string()).into())
    }

    fn register(&self, token: &str) -> Result<Reg> {
        self.try_register(token)?.ok_or_else(|| self.invalid(token).into())
    }

    /// Numeric literal validated into 0..=15.
    fn literal(&self, token: &str) -> Result<Nibble> {
        if let Some(value) = Nibble::parse_binary(token) {
            return Ok(value);
        }
        if self.syntax == Syntax::Pipeline {
            return Err(self.invalid(token).into());
        }

        let lower = token.to_ascii_lowercase();
        let parsed = if let Some(hex) = lower.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)
        } else if let Some(bin) = lower.strip_prefix("0b") {
            u32::from_str_radix(bin, 2)
        } else {
            lower.parse::<u32>()
        };
        match parsed {
            Ok(value) => u8::try_from(value)
                .ok()
                .and_then(Nibble::from_u8)
                .ok_or_else(|| ParseError::OutOfRange(token.to_string()).into()),
            Err(_) => Err(self.invalid(token).into()),
        }
    }

    fn memory(&self, token: &str) -> Result<MemRef> {
        let inner = token
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| self.invalid(token))?;
        match self.try_register(inner)? {
            Some(reg) => Ok(MemRef::Indirect(reg)),
            None => Ok(MemRef::Direct(self.literal(inner)?)),
        }
    }

    fn source(&self, token: &str) -> Result<Source> {
        if token.starts_with('[') {
            return Ok(Source::Mem(self.memory(token)?));
        }
        match self.try_register(token)? {
            Some(reg) => Ok(Source::Reg(reg)),
            None => Ok(Source::Imm(self.literal(token)?)),
        }
    }

    fn target(&self, token: &str) -> Result<Target> {
        if let Some(reg) = self.try_register(token)? {
            return Ok(Target::Reg(reg));
        }
        if let Some(name) = token.strip_prefix('@') {
            return if is_label_name(name) {
                Ok(Target::Label(name.to_string()))
            } else {
                Err(ParseError::InvalidLabel(name.to_string()).into())
            };
        }
        if token.starts_with(|c: char| c.is_ascii_digit()) {
            return Ok(Target::Addr(self.literal(token)?));
        }
        if is_label_name(token) {
            Ok(Target::Label(token.to_string()))
        } else {
            Err(self.invalid(token).into())
        }
    }

    fn irq_line(&self, token: &str) -> Result<IrqLine> {
        let value = self.literal(token)?;
        IrqLine::new(value.value()).map_err(|_| self.invalid(token).into())
    }

    fn switch(&self, token: &str) -> Result<bool> {
        match self.literal(token)?.value() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.invalid(token).into()),
        }
    }
}

fn format_mem(addr: &MemRef) -> String {
    match addr {
        MemRef::Direct(value) => format!("[{value}]"),
        MemRef::Indirect(reg) => format!("[{reg}]"),
    }
}

fn format_source(src: &Source) -> String {
    match src {
        Source::Reg(reg) => reg.to_string(),
        Source::Imm(value) => value.to_string(),
        Source::Mem(addr) => format_mem(addr),
    }
}

fn format_target(target: &Target) -> String {
    match target {
        Target::Reg(reg) => reg.to_string(),
        Target::Addr(addr) => addr.to_string(),
        Target::Label(name) => format!("@{name}"),
    }
}

/// Renders an instruction as text both syntaxes parse back to the same
/// instruction: literals as 4-digit binary, labels as `@name`.
pub fn format_instruction(instruction: &Instruction) -> String {
    let mnemonic = instruction.mnemonic();
    match instruction {
        Instruction::Alu { dst, src, .. } | Instruction::Mov { dst, src } => {
            format!("{mnemonic} {dst} {}", format_source(src))
        }
        Instruction::Load { dst, addr } => format!("{mnemonic} {dst} {}", format_mem(addr)),
        Instruction::Store { addr, src } => format!("{mnemonic} {} {src}", format_mem(addr)),
        Instruction::Jump { target, .. } | Instruction::Call { target } => {
            format!("{mnemonic} {}", format_target(target))
        }
        Instruction::Irq { line } => format!("{mnemonic} {}", line.as_nibble()),
        Instruction::Mask { line, enabled } => {
            let flag = if *enabled { Nibble::ONE } else { Nibble::ZERO };
            format!("{mnemonic} {} {flag}", line.as_nibble())
        }
        _ => mnemonic.to_string(),
    }
}

/// One assembled program line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLine {
    pub instruction: Instruction,
    /// 1-based line in the source text.
    pub line: usize,
}

/// Assembled program: at most 16 instructions, labels already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    lines: Vec<ProgramLine>,
    labels: BTreeMap<String, Nibble>,
}

impl Program {
    pub const MAX_LEN: usize = 16;

    /// Assembles program source: one instruction or `name:` label per line,
    /// `;` starts a comment. A label names the next instruction's index.
    pub fn assemble(source: &str) -> Result<Program> {
        let mut lines = Vec::new();
        let mut labels = BTreeMap::new();

        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            let code = strip_comment(raw).trim();
            if code.is_empty() {
                continue;
            }
            if let Some(name) = code.strip_suffix(':') {
                let name = name.trim();
                if !is_label_name(name) {
                    return Err(at_line(line, ParseError::InvalidLabel(name.to_string()).into()));
                }
                let address = u8::try_from(lines.len())
                    .ok()
                    .and_then(Nibble::from_u8)
                    .ok_or_else(|| at_line(line, ParseError::OutOfRange(format!("{name}:")).into()))?;
                labels.insert(name.to_string(), address);
                continue;
            }
            match parse_line(code, Syntax::Shell).map_err(|e| at_line(line, e))? {
                Some(Command::Exec(instruction)) => lines.push(ProgramLine { instruction, line }),
                Some(Command::Host(_)) => {
                    let head = code.split_whitespace().next().unwrap_or(code);
                    return Err(at_line(line, ParseError::HostCommandInProgram(head.to_string()).into()));
                }
                None => {}
            }
        }

        if lines.len() > Self::MAX_LEN {
            return Err(ParseError::ProgramTooLong(lines.len()).into());
        }

        for entry in &mut lines {
            resolve_labels(&mut entry.instruction, &labels).map_err(|e| at_line(entry.line, e))?;
        }

        Ok(Program { lines, labels })
    }

    pub fn from_file(path: &Path) -> Result<Program> {
        let source = fs::read_to_string(path).map_err(|e| EmuError::io(path, e))?;
        let program = Self::assemble(&source)?;
        info!(path = %path.display(), instructions = program.len(), "program assembled");
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ProgramLine> {
        self.lines.get(index)
    }

    pub fn lines(&self) -> &[ProgramLine] {
        &self.lines
    }

    pub fn labels(&self) -> &BTreeMap<String, Nibble> {
        &self.labels
    }
}

fn at_line(line: usize, error: EmuError) -> EmuError {
    EmuError::Run {
        line,
        source: Box::new(error),
    }
}

/// Replaces label targets with their addresses.
pub fn resolve_labels(instruction: &mut Instruction, labels: &BTreeMap<String, Nibble>) -> Result<()> {
    if let Instruction::Jump { target, .. } | Instruction::Call { target } = instruction {
        if let Target::Label(name) = &*target {
            let address = labels
                .get(name.as_str())
                .copied()
                .ok_or_else(|| EmuError::UndefinedLabel(name.clone()))?;
            *target = Target::Addr(address);
        }
    }
    Ok(())
}
