//! Property-based tests
//!
//! - Integer arithmetic is deterministic and agrees with checked i64 math
//! - Closures observe later assignments to captured variables
//! - Messages from one sender reach a mailbox in send order
//! - Refinement matching agrees with the predicate

use proptest::prelude::*;

use parley::levenshtein_distance;
use parley::test_support::{eval_ok, run_actors};
use parley::{Interpreter, Value};

// ============================================================================
// Generators
// ============================================================================

/// A small arithmetic expression together with its expected value. At most
/// eight leaves below 50, so products stay inside i64.
fn arb_arith(depth: u32) -> BoxedStrategy<(String, i64)> {
    let leaf = (-50i64..50).prop_map(|n| {
        if n < 0 {
            (format!("({})", n), n)
        } else {
            (n.to_string(), n)
        }
    });
    leaf.prop_recursive(depth, 16, 2, |inner| {
        (inner.clone(), inner, 0..3u8).prop_map(|((ls, lv), (rs, rv), op)| match op {
            0 => (format!("({} + {})", ls, rs), lv + rv),
            1 => (format!("({} - {})", ls, rs), lv - rv),
            _ => (format!("({} * {})", ls, rs), lv * rv),
        })
    })
    .boxed()
}

// ============================================================================
// Evaluator
// ============================================================================

proptest! {
    #[test]
    fn arithmetic_matches_i64((src, expected) in arb_arith(3)) {
        let interp = Interpreter::new();
        let first = interp.eval_source(&src).unwrap();
        let second = interp.eval_source(&src).unwrap();
        prop_assert_eq!(&first, &Value::Int(expected));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn closures_see_assignments(initial in -1000i64..1000, later in -1000i64..1000) {
        let src = format!(
            "let c = {initial}\nlet f = () -> {{ return c }}\nlet before = f()\nc = {later}\n(before, f())"
        );
        prop_assert_eq!(
            eval_ok(&src),
            Value::tuple(vec![Value::Int(initial), Value::Int(later)])
        );
    }

    #[test]
    fn nat_refinement_agrees_with_predicate(n in -100i64..100) {
        let src = format!("type Nat = x -> x >= 0\nmatch {n} {{ _ : Nat -> true; _ -> false }}");
        prop_assert_eq!(eval_ok(&src), Value::Bool(n >= 0));
    }

    #[test]
    fn levenshtein_is_symmetric(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
        prop_assert_eq!(levenshtein_distance(&a, &b), levenshtein_distance(&b, &a));
        prop_assert_eq!(levenshtein_distance(&a, &a), 0);
    }
}

// ============================================================================
// Runtime
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn mailbox_preserves_send_order(values in prop::collection::vec(0i64..1000, 1..30)) {
        let sends: String = values
            .iter()
            .map(|v| format!("    log (.note {})\n", v))
            .collect();
        let src = format!(
            "server Log {{\n  .note x -> print(x)\n}}\nserver Main {{\n  .init -> {{\n    let log = spawn Log\n{sends}  }}\n}}"
        );
        let run = run_actors(&src, vec![]);
        let expected: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        prop_assert_eq!(run.output, expected);
    }
}
