//! Shared helpers for the integration suites.
#![allow(dead_code)]

use emu4::bus::{MemoryDevice, Syncable};
use emu4::component::Component;
use emu4::system_config::CpuConfig;
use emu4::systems::cpu_context::CpuContext;
use emu4::types::Nibble;

/// Configuration with no randomness in sight: seeded power-on contents,
/// no floating window, no clock thread.
pub fn deterministic_config() -> CpuConfig {
    let mut config = CpuConfig::default();
    config.registers.seed = Some(0x5eed);
    config.registers.settle_time_ms = 0;
    config.clock.interval_ms = 0;
    config
}

pub fn context() -> CpuContext {
    CpuContext::new(deterministic_config()).expect("default config is valid")
}

/// Runs every line, panicking on the first error.
pub fn exec_all(cpu: &mut CpuContext, lines: &[&str]) {
    for line in lines {
        if let Err(e) = cpu.execute_line(line) {
            panic!("`{line}` failed: {e}");
        }
    }
}

pub fn n(value: u8) -> Nibble {
    Nibble::from_u8(value).expect("test literal fits in 4 bits")
}

/// Memory device that records every access.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub cells: [Nibble; 16],
    pub reads: Vec<Nibble>,
    pub writes: Vec<(Nibble, Nibble, bool)>,
    pub syncs: usize,
}

impl Component for RecordingDevice {
    fn name(&self) -> &str {
        "RECORDER"
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl MemoryDevice for RecordingDevice {
    fn read(&mut self, addr: Nibble) -> Nibble {
        self.reads.push(addr);
        self.cells[addr.index()]
    }

    fn write(&mut self, addr: Nibble, data: Nibble, clock: bool) {
        self.writes.push((addr, data, clock));
        if clock {
            self.cells[addr.index()] = data;
        }
    }

    fn as_syncable(&mut self) -> Option<&mut dyn Syncable> {
        Some(self)
    }
}

impl Syncable for RecordingDevice {
    fn sync(&mut self) {
        self.syncs += 1;
    }
}
