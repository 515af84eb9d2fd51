use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::component::Component;
use crate::isa::Reg;
use crate::system_config::RegisterConfig;
use crate::types::Nibble;

/// Edge-triggered D flip-flop.
/// On a clock edge the output follows the data input, or drops to 0 while
/// reset is asserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DFlipFlop {
    q: bool,
}

impl DFlipFlop {
    pub fn clock(&mut self, data: bool, reset: bool) {
        self.q = !reset && data;
    }

    pub fn output(&self) -> bool {
        self.q
    }
}

/// Four flip-flops sharing a write-enable line.
#[derive(Debug, Clone, Default)]
pub struct Register4 {
    cells: [DFlipFlop; 4],
    write_enable: bool,
    floating_until: Option<Instant>,
}

impl Register4 {
    pub fn new() -> Self {
        Self {
            write_enable: true,
            ..Self::default()
        }
    }

    pub fn set_write_enable(&mut self, enabled: bool) {
        self.write_enable = enabled;
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enable
    }

    /// Latches `value` if write-enable is high.
    /// Returns: true when the value was stored
    pub fn write(&mut self, value: Nibble) -> bool {
        if !self.write_enable {
            return false;
        }
        for (cell, bit) in self.cells.iter_mut().zip(value.bits()) {
            cell.clock(bit, false);
        }
        self.floating_until = None;
        true
    }

    /// Clocks every cell with reset asserted.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clock(false, true);
        }
    }

    /// Stable flip-flop outputs, ignoring any floating window.
    pub fn output(&self) -> Nibble {
        Nibble::from_bits(self.cells.map(|cell| cell.output()))
    }

    pub fn float_for(&mut self, settle_time: Duration) {
        self.floating_until = (!settle_time.is_zero()).then(|| Instant::now() + settle_time);
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.floating_until, Some(until) if Instant::now() < until)
    }
}

/// Four general registers with a read-through cache.
///
/// Right after a reset every register floats for the configured settle
/// time: reads return random bits until the window closes or the register
/// is written. This models undefined power-on contents.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    registers: [Register4; 4],
    cache: [Option<Nibble>; 4],
    cache_enabled: bool,
    settle_time: Duration,
    rng: StdRng,
    cache_hits: u64,
    cache_misses: u64,
}

impl RegisterFile {
    /// Creates the file with random power-on contents.
    pub fn new(config: &RegisterConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut file = Self {
            registers: [Register4::new(), Register4::new(), Register4::new(), Register4::new()],
            cache: [None; 4],
            cache_enabled: config.cache_enabled,
            settle_time: config.settle_time(),
            rng,
            cache_hits: 0,
            cache_misses: 0,
        };
        for reg in Reg::ALL {
            let value = file.random_nibble();
            file.write(reg, value);
        }
        file
    }

    fn random_nibble(&mut self) -> Nibble {
        Nibble::from_bits([self.rng.gen(), self.rng.gen(), self.rng.gen(), self.rng.gen()])
    }

    pub fn read(&mut self, reg: Reg) -> Nibble {
        let index = reg.index();
        if self.registers[index].is_floating() {
            return self.random_nibble();
        }
        if self.cache_enabled {
            if let Some(value) = self.cache[index] {
                self.cache_hits += 1;
                return value;
            }
        }
        self.cache_misses += 1;
        let value = self.registers[index].output();
        self.cache[index] = Some(value);
        value
    }

    pub fn write(&mut self, reg: Reg, value: Nibble) {
        let index = reg.index();
        if self.registers[index].write(value) {
            trace!(register = %reg, %value, "register write");
        }
        self.cache[index] = None;
    }

    /// Stable contents without randomness or cache effects.
    pub fn peek(&self, reg: Reg) -> Nibble {
        self.registers[reg.index()].output()
    }

    pub fn is_floating(&self, reg: Reg) -> bool {
        self.registers[reg.index()].is_floating()
    }

    /// Returns: (cache hits, cache misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache_hits, self.cache_misses)
    }
}

impl Component for RegisterFile {
    fn name(&self) -> &str {
        "REGISTERS"
    }

    fn reset(&mut self) {
        for register in &mut self.registers {
            register.clear();
            register.float_for(self.settle_time);
        }
        self.cache = [None; 4];
    }
}

/// 4-bit program counter with a ripple-carry incrementer.
///
/// The carry out of the incrementer is latched until PC is next written,
/// so a fetch source can tell "wrapped past 15" apart from "jumped to 0".
#[derive(Debug, Clone)]
pub struct ProgramCounter {
    register: Register4,
    wrapped: bool,
}

impl Default for ProgramCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCounter {
    pub fn new() -> Self {
        Self {
            register: Register4::new(),
            wrapped: false,
        }
    }

    pub fn read(&self) -> Nibble {
        self.register.output()
    }

    pub fn write(&mut self, address: Nibble) {
        self.register.write(address);
        self.wrapped = false;
    }

    /// PC + 1 through the adder chain, wrapping 15 -> 0.
    /// Returns: the incrementer's carry out
    pub fn increment(&mut self) -> bool {
        let (next, carry) = self.read().increment();
        self.register.write(next);
        self.wrapped |= carry;
        carry
    }

    /// True once an increment has carried out of bit 3 and nothing has
    /// written PC since.
    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }
}

impl Component for ProgramCounter {
    fn name(&self) -> &str {
        "PC"
    }

    fn reset(&mut self) {
        self.register.clear();
        self.wrapped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(settle_time_ms: u64) -> RegisterConfig {
        RegisterConfig {
            settle_time_ms,
            seed: Some(7),
            cache_enabled: true,
        }
    }

    #[test]
    fn test_flip_flop_follows_data_unless_reset() {
        let mut ff = DFlipFlop::default();
        ff.clock(true, false);
        assert!(ff.output());
        ff.clock(true, true);
        assert!(!ff.output());
    }

    #[test]
    fn test_register_ignores_writes_without_enable() {
        let mut register = Register4::new();
        register.write(Nibble::MAX);
        register.set_write_enable(false);
        assert!(!register.write(Nibble::ZERO));
        assert_eq!(register.output(), Nibble::MAX);
    }

    #[test]
    fn test_write_invalidates_cache() {
        let mut file = RegisterFile::new(&config(0));
        file.write(Reg::R2, Nibble::ONE);
        assert_eq!(file.read(Reg::R2), Nibble::ONE);
        assert_eq!(file.read(Reg::R2), Nibble::ONE);
        file.write(Reg::R2, Nibble::MAX);
        assert_eq!(file.read(Reg::R2), Nibble::MAX);
        let (hits, misses) = file.cache_stats();
        assert_eq!((hits, misses), (1, 2));
    }

    #[test]
    fn test_reset_floats_until_settled() {
        let mut file = RegisterFile::new(&config(20));
        file.reset();
        assert!(file.is_floating(Reg::R0));
        assert_eq!(file.peek(Reg::R0), Nibble::ZERO);
        thread::sleep(Duration::from_millis(30));
        assert!(!file.is_floating(Reg::R0));
        assert_eq!(file.read(Reg::R0), Nibble::ZERO);
    }

    #[test]
    fn test_write_ends_floating() {
        let mut file = RegisterFile::new(&config(10_000));
        file.reset();
        file.write(Reg::R1, Nibble::ONE);
        assert!(!file.is_floating(Reg::R1));
        assert_eq!(file.read(Reg::R1), Nibble::ONE);
        assert!(file.is_floating(Reg::R3));
    }

    #[test]
    fn test_seeded_power_on_contents_repeat() {
        let a = RegisterFile::new(&config(0));
        let b = RegisterFile::new(&config(0));
        for reg in Reg::ALL {
            assert_eq!(a.peek(reg), b.peek(reg));
        }
    }

    #[test]
    fn test_program_counter_wraps() {
        let mut pc = ProgramCounter::new();
        pc.write(Nibble::from_low_bits(14));
        assert!(!pc.increment());
        assert_eq!(pc.read().value(), 15);
        assert!(pc.increment());
        assert_eq!(pc.read(), Nibble::ZERO);
        assert!(pc.has_wrapped());
        pc.increment();
        assert!(pc.has_wrapped(), "stays latched until a write");
        pc.write(Nibble::ZERO);
        assert!(!pc.has_wrapped());
    }
}
