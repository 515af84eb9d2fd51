//! # JSON Configuration
//!
//! Describes one simulated machine: memory layout and ROM image, register
//! power-on behaviour, ALU compare cache, clock, run limits, state
//! persistence and the monitor console. Every field has a default, so an
//! empty object (`{}`) is a valid configuration.
//!
//! ## Usage
//!
//! ```no_run
//! use emu4::system_config::CpuConfig;
//! use emu4::systems::cpu_context::CpuContext;
//!
//! let config = CpuConfig::from_json_file("configs/default.json").expect("could not read config");
//! let mut cpu = CpuContext::new(config).expect("invalid config");
//! cpu.execute_line("mov r0 5").unwrap();
//! ```
//!
//! ## Configuration File Format
//!
//! ```json
//! {
//!   "name": "demo",
//!   "memory": {
//!     "rom_size": 4,
//!     "ram_size": 9,
//!     "rom_image": ["mov r0 r1", "add r0 r1", "0000", "hlt"]
//!   },
//!   "registers": { "settle_time_ms": 1, "seed": 42 },
//!   "clock": { "interval_ms": 10 },
//!   "state": { "file": "cpu_state.json", "autoload": true, "autosave": true }
//! }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asm::{parse_line, Command, Syntax};
use crate::console::ConsoleConfig;
use crate::error::{EmuError, Result};
use crate::isa;
use crate::types::Nibble;

/// Number of addresses on the bus.
pub const ADDRESS_SPACE: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub name: String,
    pub description: String,
    pub memory: MemoryConfig,
    pub registers: RegisterConfig,
    pub alu: AluConfig,
    pub clock: ClockConfig,
    pub run: RunConfig,
    pub state: StateConfig,
    pub console: ConsoleConfig,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            name: "emu4".to_string(),
            description: "4-bit stored-program computer".to_string(),
            memory: MemoryConfig::default(),
            registers: RegisterConfig::default(),
            alu: AluConfig::default(),
            clock: ClockConfig::default(),
            run: RunConfig::default(),
            state: StateConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub rom_size: usize,
    pub ram_size: usize,
    pub key_status_port: u8,
    pub key_data_port: u8,
    pub char_out_port: u8,
    /// ROM contents: `"1010"` words or binary-encodable instruction text.
    pub rom_image: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rom_size: 0,
            ram_size: 13,
            key_status_port: 13,
            key_data_port: 14,
            char_out_port: 15,
            rom_image: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    /// How long registers float after a reset.
    pub settle_time_ms: u64,
    /// Fixed seed for power-on contents and floating reads.
    pub seed: Option<u64>,
    pub cache_enabled: bool,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            settle_time_ms: 1,
            seed: None,
            cache_enabled: true,
        }
    }
}

impl RegisterConfig {
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AluConfig {
    pub compare_cache_ttl_ms: u64,
}

impl Default for AluConfig {
    fn default() -> Self {
        Self {
            compare_cache_ttl_ms: 1000,
        }
    }
}

impl AluConfig {
    pub fn compare_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.compare_cache_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Pulse interval; 0 runs programs to completion on the caller's thread.
    pub interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { interval_ms: 10 }
    }
}

impl ClockConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Tick limit for a synchronous `run`.
    pub max_cycles: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { max_cycles: 4096 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub file: PathBuf,
    pub autoload: bool,
    pub autosave: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("cpu_state.json"),
            autoload: false,
            autosave: false,
        }
    }
}

impl CpuConfig {
    pub fn from_json_str(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| EmuError::io(path, e))?;
        let config = Self::from_json_str(&text).map_err(|e| EmuError::format(path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if memory.rom_size.checked_add(memory.ram_size).map_or(true, |cells| cells > ADDRESS_SPACE) {
            return Err(EmuError::Config(format!(
                "rom_size {} + ram_size {} exceeds the {ADDRESS_SPACE}-address bus",
                memory.rom_size, memory.ram_size
            )));
        }

        let ports = [memory.key_status_port, memory.key_data_port, memory.char_out_port];
        if let Some(port) = ports.iter().find(|&&port| usize::from(port) >= ADDRESS_SPACE) {
            return Err(EmuError::Config(format!("device port {port} is outside the bus")));
        }
        if ports.iter().collect::<BTreeSet<_>>().len() != ports.len() {
            return Err(EmuError::Config("device ports must be distinct".to_string()));
        }

        if memory.rom_image.len() > memory.rom_size {
            return Err(EmuError::Config(format!(
                "rom_image has {} words but rom_size is {}",
                memory.rom_image.len(),
                memory.rom_size
            )));
        }
        self.rom_words().map(|_| ())
    }

    /// Translates `rom_image` into memory words.
    pub fn rom_words(&self) -> Result<Vec<Nibble>> {
        self.memory.rom_image.iter().map(|entry| rom_word(entry)).collect()
    }
}

fn rom_word(entry: &str) -> Result<Nibble> {
    let entry = entry.trim();
    if let Some(word) = Nibble::parse_binary(entry) {
        return Ok(word);
    }
    match parse_line(entry, Syntax::Shell)? {
        Some(Command::Exec(instruction)) => isa::encode(&instruction),
        _ => Err(EmuError::Config(format!("rom_image entry `{entry}` is not an instruction"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = CpuConfig::from_json_str("{}").unwrap();
        assert_eq!(config.memory, MemoryConfig::default());
        assert_eq!(config.alu.compare_cache_ttl(), Duration::from_secs(1));
        assert_eq!(config.clock.interval(), Some(Duration::from_millis(10)));
        config.validate().unwrap();
    }

    #[test]
    fn test_rom_image_mixes_words_and_instructions() {
        let config = CpuConfig::from_json_str(
            r#"{ "memory": { "rom_size": 3, "ram_size": 10, "rom_image": ["1010", "add r0 r1", "hlt"] } }"#,
        )
        .unwrap();
        let words: Vec<u8> = config.rom_words().unwrap().iter().map(Nibble::value).collect();
        assert_eq!(words, vec![10, 1, 15]);
    }

    #[test]
    fn test_rom_image_rejects_unencodable_text() {
        let config = CpuConfig::from_json_str(
            r#"{ "memory": { "rom_size": 1, "ram_size": 10, "rom_image": ["add r2 5"] } }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EmuError::Encoding(_))));
    }

    #[test]
    fn test_layout_validation() {
        let mut config = CpuConfig::default();
        config.memory.rom_size = 8;
        config.memory.ram_size = 9;
        assert!(matches!(config.validate(), Err(EmuError::Config(_))));

        let mut config = CpuConfig::default();
        config.memory.char_out_port = config.memory.key_data_port;
        assert!(matches!(config.validate(), Err(EmuError::Config(_))));

        let mut config = CpuConfig::default();
        config.memory.key_status_port = 16;
        assert!(matches!(config.validate(), Err(EmuError::Config(_))));

        let config = CpuConfig::from_json_str(r#"{ "memory": { "rom_size": 18446744073709551615, "ram_size": 13 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(EmuError::Config(_))));
    }

    #[test]
    fn test_zero_interval_means_free_running() {
        let clock = ClockConfig { interval_ms: 0 };
        assert_eq!(clock.interval(), None);
    }
}
