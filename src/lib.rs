//! # emu4
//!
//! Simulator for a small 4-bit stored-program computer.
//!
//! - [`types::Nibble`] words with bit-level ripple-carry arithmetic
//! - an ALU with flags, a compare cache and an interrupt controller
//! - a memory bus with ROM, RAM and a memory-mapped terminal
//! - a 3-stage fetch/decode/execute pipeline with a one-cycle hazard stall
//! - [`systems::cpu_context::CpuContext`], which takes text commands in a
//!   lenient shell syntax or a strict pipeline syntax, runs programs and
//!   saves and restores machine state as JSON

pub mod asm;
pub mod bus;
pub mod component;
pub mod components;
pub mod console;
pub mod error;
pub mod isa;
pub mod logging;
pub mod system_config;
pub mod systems;
pub mod types;

pub use component::{BaseComponent, Component};
pub use error::{EmuError, Result};
pub use systems::cpu_context::CpuContext;
pub use types::Nibble;
