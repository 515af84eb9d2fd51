//! Instruction set: the closed instruction enum and the 4-bit binary codec.
//!
//! A 4-bit word has no room for operand fields next to a 4-bit opcode, so
//! each binary opcode carries fixed implicit operands: `r0` is the
//! destination and first source, `r1` the second source or memory
//! pointer, `r3` the jump target. Everything else exists only in text form
//! (see [`crate::asm`]).

use std::fmt;

use crate::error::{EmuError, ExecutionError, Result};
use crate::types::Nibble;

/// General purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
}

impl Reg {
    pub const ALL: [Reg; 4] = [Reg::R0, Reg::R1, Reg::R2, Reg::R3];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Reg> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.index())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }

    /// Compare only sets flags; every other op writes its destination.
    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Jump condition, read from the ALU flags at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Always,
    Zero,
    NotZero,
    Carry,
}

impl Cond {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Always => "jmp",
            Cond::Zero => "jz",
            Cond::NotZero => "jnz",
            Cond::Carry => "jc",
        }
    }
}

/// Interrupt request line 0-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrqLine(u8);

impl IrqLine {
    pub const COUNT: usize = 4;

    pub fn new(line: u8) -> std::result::Result<Self, ExecutionError> {
        if usize::from(line) < Self::COUNT {
            Ok(IrqLine(line))
        } else {
            Err(ExecutionError::InvalidIrqLine(line))
        }
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Handler address `line * 4`: the line number shifted left two bits.
    pub fn vector(self) -> Nibble {
        let line = Nibble::from_low_bits(self.0).bits();
        Nibble::from_bits([line[2], line[3], false, false])
    }

    pub fn as_nibble(self) -> Nibble {
        Nibble::from_low_bits(self.0)
    }
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemRef {
    Direct(Nibble),
    Indirect(Reg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Reg(Reg),
    Imm(Nibble),
    Mem(MemRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Reg(Reg),
    Addr(Nibble),
    Label(String),
}

/// An architectural instruction. Host-side commands live in
/// [`crate::asm::HostCommand`] and never reach the codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Instruction {
    #[default]
    Nop,
    Alu {
        op: AluOp,
        dst: Reg,
        src: Source,
    },
    Mov {
        dst: Reg,
        src: Source,
    },
    Load {
        dst: Reg,
        addr: MemRef,
    },
    Store {
        addr: MemRef,
        src: Reg,
    },
    Jump {
        cond: Cond,
        target: Target,
    },
    Call {
        target: Target,
    },
    Ret,
    Irq {
        line: IrqLine,
    },
    Mask {
        line: IrqLine,
        enabled: bool,
    },
    Ei,
    Di,
    Iret,
    Halt,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Alu { op, .. } => op.mnemonic(),
            Instruction::Mov { .. } => "mov",
            Instruction::Load { .. } => "load",
            Instruction::Store { .. } => "store",
            Instruction::Jump { cond, .. } => cond.mnemonic(),
            Instruction::Call { .. } => "call",
            Instruction::Ret => "ret",
            Instruction::Irq { .. } => "irq",
            Instruction::Mask { .. } => "mask",
            Instruction::Ei => "ei",
            Instruction::Di => "di",
            Instruction::Iret => "iret",
            Instruction::Halt => "hlt",
        }
    }

    /// Register written by this instruction, if any.
    pub fn destination(&self) -> Option<Reg> {
        match self {
            Instruction::Alu { op, dst, .. } if op.writes_result() => Some(*dst),
            Instruction::Mov { dst, .. } | Instruction::Load { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Registers read by this instruction, including address registers.
    pub fn sources(&self) -> Vec<Reg> {
        fn mem(addr: &MemRef) -> Option<Reg> {
            match addr {
                MemRef::Indirect(reg) => Some(*reg),
                MemRef::Direct(_) => None,
            }
        }
        fn source(src: &Source) -> Option<Reg> {
            match src {
                Source::Reg(reg) => Some(*reg),
                Source::Mem(addr) => mem(addr),
                Source::Imm(_) => None,
            }
        }
        fn target(target: &Target) -> Option<Reg> {
            match target {
                Target::Reg(reg) => Some(*reg),
                _ => None,
            }
        }

        match self {
            Instruction::Alu { dst, src, .. } => [Some(*dst), source(src)].into_iter().flatten().collect(),
            Instruction::Mov { src, .. } => source(src).into_iter().collect(),
            Instruction::Load { addr, .. } => mem(addr).into_iter().collect(),
            Instruction::Store { addr, src } => [mem(addr), Some(*src)].into_iter().flatten().collect(),
            Instruction::Jump { target: t, .. } | Instruction::Call { target: t } => target(t).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// True for instructions that may redirect PC.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. } | Instruction::Call { .. } | Instruction::Ret | Instruction::Iret
        )
    }
}

/// Opcode class, selected by the word's high bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Codes 0-7: arithmetic and logic.
    Alu,
    /// Codes 8-15: memory, move and control transfer.
    Transfer,
}

macro_rules! define_opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal;)*) => {
        /// Binary opcodes, ordered by code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name = $code,)*
        }

        impl Opcode {
            pub const ALL: [Opcode; 16] = [$(Opcode::$name,)*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = EmuError;

            fn try_from(code: u8) -> Result<Self> {
                match code {
                    $($code => Ok(Opcode::$name),)*
                    other => Err(EmuError::UnknownOpcode(other)),
                }
            }
        }
    };
}

define_opcodes! {
    Nop = 0, "nop";
    Add = 1, "add";
    Sub = 2, "sub";
    Mul = 3, "mul";
    And = 4, "and";
    Or = 5, "or";
    Xor = 6, "xor";
    Cmp = 7, "cmp";
    Load = 8, "load";
    Store = 9, "store";
    Mov = 10, "mov";
    Jmp = 11, "jmp";
    Jz = 12, "jz";
    Jnz = 13, "jnz";
    Iret = 14, "iret";
    Hlt = 15, "hlt";
}

impl Opcode {
    pub fn from_word(word: Nibble) -> Opcode {
        Self::ALL[word.index()]
    }

    pub fn word(self) -> Nibble {
        Nibble::from_low_bits(self as u8)
    }

    pub fn class(self) -> OpClass {
        if self.word().bit(0) {
            OpClass::Transfer
        } else {
            OpClass::Alu
        }
    }

    /// The instruction this opcode stands for, implicit operands filled in.
    pub fn instruction(self) -> Instruction {
        let alu = |op| Instruction::Alu {
            op,
            dst: Reg::R0,
            src: Source::Reg(Reg::R1),
        };
        let jump = |cond| Instruction::Jump {
            cond,
            target: Target::Reg(Reg::R3),
        };
        match self {
            Opcode::Nop => Instruction::Nop,
            Opcode::Add => alu(AluOp::Add),
            Opcode::Sub => alu(AluOp::Sub),
            Opcode::Mul => alu(AluOp::Mul),
            Opcode::And => alu(AluOp::And),
            Opcode::Or => alu(AluOp::Or),
            Opcode::Xor => alu(AluOp::Xor),
            Opcode::Cmp => alu(AluOp::Cmp),
            Opcode::Load => Instruction::Load {
                dst: Reg::R0,
                addr: MemRef::Indirect(Reg::R1),
            },
            Opcode::Store => Instruction::Store {
                addr: MemRef::Indirect(Reg::R1),
                src: Reg::R0,
            },
            Opcode::Mov => Instruction::Mov {
                dst: Reg::R0,
                src: Source::Reg(Reg::R1),
            },
            Opcode::Jmp => jump(Cond::Always),
            Opcode::Jz => jump(Cond::Zero),
            Opcode::Jnz => jump(Cond::NotZero),
            Opcode::Iret => Instruction::Iret,
            Opcode::Hlt => Instruction::Halt,
        }
    }
}

/// Decodes a fetched word. Every 4-bit pattern is a valid opcode.
pub fn decode(word: Nibble) -> Instruction {
    Opcode::from_word(word).instruction()
}

/// Encodes an instruction into its binary word.
/// Fails with [`EmuError::Encoding`] when the operands differ from the
/// opcode's implicit ones or the instruction has no binary form at all.
pub fn encode(instruction: &Instruction) -> Result<Nibble> {
    Opcode::ALL
        .iter()
        .find(|opcode| opcode.instruction() == *instruction)
        .map(|opcode| opcode.word())
        .ok_or_else(|| EmuError::Encoding(crate::asm::format_instruction(instruction)))
}
