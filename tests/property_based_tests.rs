//! Property-based tests for the nibble datapath.
//!
//! Every arithmetic result is checked against plain integer arithmetic on
//! the same operands.

mod mocks;

use emu4::components::alu::{self, Alu};
use emu4::isa::{AluOp, Reg};
use emu4::system_config::AluConfig;
use emu4::types::Nibble;
use mocks::*;
use proptest::prelude::*;

mod proptest_helpers {
    use super::*;

    pub fn arb_nibble() -> impl Strategy<Value = Nibble> {
        (0u8..16).prop_map(Nibble::from_low_bits)
    }

    pub fn arb_logic_op() -> impl Strategy<Value = AluOp> {
        prop_oneof![Just(AluOp::And), Just(AluOp::Or), Just(AluOp::Xor)]
    }
}

use proptest_helpers::*;

mod arithmetic_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_add_matches_integer_sum(a in arb_nibble(), b in arb_nibble()) {
            let out = alu::add(a, b);
            let sum = a.value() + b.value();
            prop_assert_eq!(out.result.value(), sum & 0x0F);
            prop_assert_eq!(out.flags.carry, sum > 15);
            prop_assert_eq!(out.flags.zero, sum & 0x0F == 0);
        }

        #[test]
        fn test_sub_carry_means_no_borrow(a in arb_nibble(), b in arb_nibble()) {
            let out = alu::subtract(a, b);
            prop_assert_eq!(out.result.value(), a.value().wrapping_sub(b.value()) & 0x0F);
            prop_assert_eq!(out.flags.carry, a.value() >= b.value());
            prop_assert_eq!(out.flags.zero, a == b);
        }

        #[test]
        fn test_mul_keeps_low_bits(a in arb_nibble(), b in arb_nibble()) {
            let out = alu::multiply(a, b);
            let product = u16::from(a.value()) * u16::from(b.value());
            prop_assert_eq!(u16::from(out.result.value()), product & 0x0F);
            prop_assert_eq!(out.flags.carry, product > 15);
            prop_assert_eq!(out.flags.zero, product == 0);
        }

        #[test]
        fn test_logic_never_carries(op in arb_logic_op(), a in arb_nibble(), b in arb_nibble()) {
            let out = alu::logical(op, a, b);
            let expected = match op {
                AluOp::And => a.value() & b.value(),
                AluOp::Or => a.value() | b.value(),
                _ => a.value() ^ b.value(),
            };
            prop_assert_eq!(out.result.value(), expected);
            prop_assert!(!out.flags.carry);
        }

        #[test]
        fn test_increment_wraps(a in arb_nibble()) {
            let (next, carry) = a.increment();
            prop_assert_eq!(next.value(), (a.value() + 1) & 0x0F);
            prop_assert_eq!(carry, a == Nibble::MAX);
        }
    }
}

mod compare_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_compare_is_idempotent(a in arb_nibble(), b in arb_nibble(), repeats in 1usize..6) {
            let mut unit = Alu::new(&AluConfig::default());
            let first = unit.execute(AluOp::Cmp, a, b);
            for _ in 0..repeats {
                let again = unit.execute(AluOp::Cmp, a, b);
                prop_assert_eq!(again, first);
            }
            prop_assert_eq!(first.result, a);
            prop_assert_eq!(first.flags, alu::subtract(a, b).flags);
        }

        #[test]
        fn test_compare_without_cache_agrees(a in arb_nibble(), b in arb_nibble()) {
            let mut cached = Alu::new(&AluConfig::default());
            let mut uncached = Alu::new(&AluConfig { compare_cache_ttl_ms: 0 });
            prop_assert_eq!(cached.execute(AluOp::Cmp, a, b), uncached.execute(AluOp::Cmp, a, b));
        }

        #[test]
        fn test_cmp_instruction_leaves_registers(a in arb_nibble(), b in arb_nibble()) {
            let mut cpu = context();
            exec_all(&mut cpu, &[&format!("mov r0 {a}"), &format!("mov r1 {b}"), "cmp r0 r1", "cmp r0 r1"]);
            prop_assert_eq!(cpu.register(Reg::R0), a);
            prop_assert_eq!(cpu.register(Reg::R1), b);
            prop_assert_eq!(cpu.flags().carry, a.value() >= b.value());
        }
    }
}
