//! Error taxonomy for the simulator.
//!
//! Every error is local to one command, one program line or one file
//! operation; none of them is fatal to an interactive session.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Nibble;

/// Malformed command or program text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown mnemonic `{0}`")]
    UnknownMnemonic(String),

    #[error("`{mnemonic}` takes {expected} operand(s), found {found}")]
    OperandCount {
        mnemonic: String,
        expected: usize,
        found: usize,
    },

    #[error("literal `{0}` does not fit in 4 bits")]
    OutOfRange(String),

    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    #[error("invalid operand `{operand}` for `{mnemonic}`")]
    InvalidOperand { mnemonic: String, operand: String },

    #[error("invalid label name `{0}`")]
    InvalidLabel(String),

    #[error("`{0}` is a host command and cannot appear in a program")]
    HostCommandInProgram(String),

    #[error("program holds {0} instructions but only 16 addresses exist")]
    ProgramTooLong(usize),
}

/// Failure while an instruction executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("operand is {0} bits wide, the ALU takes exactly 4")]
    InvalidOperandLength(usize),

    #[error("return with an empty call stack")]
    EmptyCallStack,

    #[error("call stack overflow (depth {0})")]
    CallStackOverflow(usize),

    #[error("return address {address} is outside the {len}-instruction program")]
    ReturnOutOfRange { address: Nibble, len: usize },

    #[error("interrupt return outside an interrupt handler")]
    NotInInterrupt,

    #[error("interrupt line {0} does not exist (lines are 0-3)")]
    InvalidIrqLine(u8),
}

#[derive(Debug, Error)]
pub enum EmuError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("undefined label `{0}`")]
    UndefinedLabel(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("`{0}` has no 4-bit encoding")]
    Encoding(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: malformed document: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not start the {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A program line failed during `run`.
    #[error("line {line}: {source}")]
    Run {
        line: usize,
        #[source]
        source: Box<EmuError>,
    },

    /// A memory word failed during `run`.
    #[error("address {address}: {source}")]
    RunAt {
        address: Nibble,
        #[source]
        source: Box<EmuError>,
    },
}

impl EmuError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EmuError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        EmuError::Format {
            path: path.into(),
            source,
        }
    }

    /// Strips `Run`/`RunAt` location wrappers.
    pub fn root(&self) -> &EmuError {
        match self {
            EmuError::Run { source, .. } | EmuError::RunAt { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, EmuError>;
