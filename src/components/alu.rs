use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::component::Component;
use crate::components::interrupts::InterruptController;
use crate::components::registers::Register4;
use crate::error::ExecutionError;
use crate::isa::AluOp;
use crate::system_config::AluConfig;
use crate::types::Nibble;

/// Condition flags. Written by every ALU operation, including compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Flags {
    pub zero: bool,
    pub carry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluOutput {
    pub result: Nibble,
    pub flags: Flags,
}

impl AluOutput {
    fn new(result: Nibble, carry: bool) -> Self {
        Self {
            result,
            flags: Flags {
                zero: result.is_zero(),
                carry,
            },
        }
    }
}

/// Ripple-carry add. Carry is the carry out of the MSB.
pub fn add(a: Nibble, b: Nibble) -> AluOutput {
    let (sum, carry) = a.ripple_add(b, false);
    AluOutput::new(sum, carry)
}

/// `a + !b + 1` through the same adder.
///
/// Carry reports "no borrow": it is set when `a >= b`, which is exactly the
/// adder's carry out for two's-complement subtraction.
pub fn subtract(a: Nibble, b: Nibble) -> AluOutput {
    let (difference, no_borrow) = a.ripple_add(!b, true);
    AluOutput::new(difference, no_borrow)
}

/// Unsigned multiply, low four bits kept. Carry is set when the product
/// needs more than four bits; zero looks at the whole product.
pub fn multiply(a: Nibble, b: Nibble) -> AluOutput {
    let product = u16::from(a.value()) * u16::from(b.value());
    AluOutput {
        result: Nibble::from_low_bits((product & 0x0F) as u8),
        flags: Flags {
            zero: product == 0,
            carry: product > 15,
        },
    }
}

/// Per-bit logic; carry is always clear.
pub fn logical(op: AluOp, a: Nibble, b: Nibble) -> AluOutput {
    let result = match op {
        AluOp::And => a & b,
        AluOp::Or => a | b,
        _ => a ^ b,
    };
    AluOutput::new(result, false)
}

#[derive(Debug, Clone, Copy)]
struct CompareEntry {
    a: Nibble,
    b: Nibble,
    flags: Flags,
    at: Instant,
}

/// Last compare result, valid for a fixed window. A zero TTL disables it.
#[derive(Debug, Clone)]
pub struct CompareCache {
    entry: Option<CompareEntry>,
    ttl: Duration,
    hits: u64,
}

impl CompareCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: None,
            ttl,
            hits: 0,
        }
    }

    fn lookup(&mut self, a: Nibble, b: Nibble) -> Option<Flags> {
        let entry = self.entry?;
        if entry.a == a && entry.b == b && entry.at.elapsed() < self.ttl {
            self.hits += 1;
            Some(entry.flags)
        } else {
            None
        }
    }

    fn store(&mut self, a: Nibble, b: Nibble, flags: Flags) {
        if !self.ttl.is_zero() {
            self.entry = Some(CompareEntry {
                a,
                b,
                flags,
                at: Instant::now(),
            });
        }
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Arithmetic logic unit with operand latches, flags, the compare cache and
/// the interrupt controller.
#[derive(Debug, Clone)]
pub struct Alu {
    operand_a: Register4,
    operand_b: Register4,
    op: Option<AluOp>,
    flags: Flags,
    compare_cache: CompareCache,
    interrupts: InterruptController,
    last_op_time: Duration,
    operations: u64,
}

impl Alu {
    pub fn new(config: &AluConfig) -> Self {
        Self {
            operand_a: Register4::new(),
            operand_b: Register4::new(),
            op: None,
            flags: Flags::default(),
            compare_cache: CompareCache::new(config.compare_cache_ttl()),
            interrupts: InterruptController::new(),
            last_op_time: Duration::ZERO,
            operations: 0,
        }
    }

    /// Latches the operands, runs `op` and updates the flags.
    /// For compare the result is the unchanged first operand.
    pub fn execute(&mut self, op: AluOp, a: Nibble, b: Nibble) -> AluOutput {
        let start = Instant::now();
        self.op = Some(op);
        self.operand_a.write(a);
        self.operand_b.write(b);

        let output = match op {
            AluOp::Add => add(a, b),
            AluOp::Sub => subtract(a, b),
            AluOp::Mul => multiply(a, b),
            AluOp::And | AluOp::Or | AluOp::Xor => logical(op, a, b),
            AluOp::Cmp => self.compare(),
        };
        self.flags = output.flags;
        self.operations += 1;
        self.last_op_time = start.elapsed();
        trace!(op = op.mnemonic(), %a, %b, result = %output.result, zero = output.flags.zero, carry = output.flags.carry, "alu");
        output
    }

    /// Entry point for raw bit slices. Anything but four bits is rejected.
    pub fn execute_bits(&mut self, op: AluOp, a: &[bool], b: &[bool]) -> Result<AluOutput, ExecutionError> {
        let a = Nibble::try_from_slice(a)?;
        let b = Nibble::try_from_slice(b)?;
        Ok(self.execute(op, a, b))
    }

    /// Subtract on the latched operands, keeping only the flags. The
    /// latches are put back afterwards.
    fn compare(&mut self) -> AluOutput {
        let a = self.operand_a.output();
        let b = self.operand_b.output();
        if let Some(flags) = self.compare_cache.lookup(a, b) {
            return AluOutput { result: a, flags };
        }

        let flags = subtract(a, b).flags;
        self.operand_a.write(a);
        self.operand_b.write(b);
        self.compare_cache.store(a, b, flags);
        AluOutput { result: a, flags }
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Returns: (operand A latch, operand B latch)
    pub fn operands(&self) -> (Nibble, Nibble) {
        (self.operand_a.output(), self.operand_b.output())
    }

    pub fn last_op(&self) -> Option<AluOp> {
        self.op
    }

    pub fn last_op_time(&self) -> Duration {
        self.last_op_time
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }

    pub fn compare_cache(&self) -> &CompareCache {
        &self.compare_cache
    }

    pub fn invalidate_compare_cache(&mut self) {
        self.compare_cache.invalidate();
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }
}

impl Component for Alu {
    fn name(&self) -> &str {
        "ALU"
    }

    fn reset(&mut self) {
        self.operand_a.clear();
        self.operand_b.clear();
        self.op = None;
        self.flags = Flags::default();
        self.compare_cache.invalidate();
        self.interrupts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(value: u8) -> Nibble {
        Nibble::from_u8(value).unwrap()
    }

    fn alu() -> Alu {
        Alu::new(&AluConfig::default())
    }

    #[test]
    fn test_add_overflow_sets_carry_and_zero() {
        let out = add(n(15), n(1));
        assert_eq!(out.result, Nibble::ZERO);
        assert_eq!(out.flags, Flags { zero: true, carry: true });
    }

    #[test]
    fn test_subtract_carry_means_no_borrow() {
        let out = subtract(n(7), n(3));
        assert_eq!(out.result, n(4));
        assert!(out.flags.carry);

        let out = subtract(n(3), n(7));
        assert_eq!(out.result, n(12));
        assert!(!out.flags.carry);

        let out = subtract(n(9), n(9));
        assert_eq!(out.flags, Flags { zero: true, carry: true });
    }

    #[test]
    fn test_multiply_carry_and_zero_follow_full_product() {
        let out = multiply(n(4), n(4));
        assert_eq!(out.result, Nibble::ZERO);
        assert_eq!(out.flags, Flags { zero: false, carry: true });

        let out = multiply(n(3), n(5));
        assert_eq!(out.result, n(15));
        assert_eq!(out.flags, Flags { zero: false, carry: false });

        assert!(multiply(n(0), n(9)).flags.zero);
    }

    #[test]
    fn test_logical_ops_clear_carry() {
        let mut alu = alu();
        alu.execute(AluOp::Add, n(15), n(15));
        assert!(alu.flags().carry);
        let out = alu.execute(AluOp::Xor, n(0b1010), n(0b1010));
        assert_eq!(out.result, Nibble::ZERO);
        assert_eq!(alu.flags(), Flags { zero: true, carry: false });
    }

    #[test]
    fn test_compare_keeps_operands_and_repeats_flags() {
        let mut alu = alu();
        let first = alu.execute(AluOp::Cmp, n(5), n(9));
        assert_eq!(first.result, n(5));
        assert_eq!(alu.operands(), (n(5), n(9)));
        let second = alu.execute(AluOp::Cmp, n(5), n(9));
        assert_eq!(first.flags, second.flags);
        assert_eq!(alu.compare_cache().hits(), 1);
        assert_eq!(alu.operands(), (n(5), n(9)));
    }

    #[test]
    fn test_compare_cache_expires() {
        let mut alu = Alu::new(&AluConfig { compare_cache_ttl_ms: 0 });
        alu.execute(AluOp::Cmp, n(2), n(2));
        alu.execute(AluOp::Cmp, n(2), n(2));
        assert_eq!(alu.compare_cache().hits(), 0);
        assert!(alu.flags().zero);
    }

    #[test]
    fn test_compare_cache_never_changes_flags() {
        let mut alu = alu();
        for a in 0..16 {
            for b in 0..16 {
                let cached = alu.execute(AluOp::Cmp, n(a), n(b)).flags;
                let again = alu.execute(AluOp::Cmp, n(a), n(b)).flags;
                assert_eq!(cached, subtract(n(a), n(b)).flags);
                assert_eq!(again, cached);
            }
        }
    }

    #[test]
    fn test_bit_slices_must_be_four_wide() {
        let mut alu = alu();
        let err = alu.execute_bits(AluOp::Add, &[true, false, true], &[false; 4]).unwrap_err();
        assert_eq!(err, ExecutionError::InvalidOperandLength(3));
        let out = alu.execute_bits(AluOp::Add, &[false, false, true, true], &[false, false, false, true]).unwrap();
        assert_eq!(out.result, n(4));
    }

    #[test]
    fn test_reset_clears_flags_and_interrupts() {
        let mut alu = alu();
        alu.execute(AluOp::Sub, n(0), n(0));
        alu.interrupts_mut().enable();
        alu.reset();
        assert_eq!(alu.flags(), Flags::default());
        assert!(!alu.interrupts().state().enabled);
    }
}
