//! Loop-bound analysis.
//!
//! Every `for` loop is classified against the constant environment in
//! effect at its site, and the classification picks one of the three
//! verifier-legal lowerings: inline unrolling, a plain C loop with
//! compile-time bounds, or the `bpf_loop()` helper. Ties break toward the
//! lower-verifier-risk strategy (unroll, then simple, then bpf_loop).

use crate::script::ast::ForRange;

use super::fold::{fold, ConstEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundInfo {
    Bounded { lo: i64, hi: i64 },
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStrategy {
    /// Emit the body once per iteration with the induction variable fixed.
    Unrolled,
    /// Emit a plain C `for` with constant bounds.
    Simple,
    /// Hoist the body into a callback and emit `bpf_loop()`.
    BpfLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopAnalysis {
    pub bound: BoundInfo,
    pub estimated_iters: Option<i64>,
    pub strategy: LoopStrategy,
}

/// Thresholds for strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Bounded loops with at most this many iterations unroll inline.
    pub unroll_max_iters: i64,
    /// Bounded loops beyond this many iterations go through `bpf_loop()`.
    pub simple_max_iters: i64,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            unroll_max_iters: 4,
            simple_max_iters: 100,
        }
    }
}

/// Classify a loop and pick its lowering strategy.
///
/// Both range endpoints must reduce to constants under `env` for the loop
/// to count as bounded; the iterator form is always unbounded.
pub fn analyze(range: &ForRange, env: &ConstEnv, limits: LoopLimits) -> LoopAnalysis {
    match range {
        ForRange::Range { start, end } => match (fold(start, env), fold(end, env)) {
            (Some(lo), Some(hi)) => {
                let iters = (hi - lo).max(0);
                let strategy = if iters <= limits.unroll_max_iters {
                    LoopStrategy::Unrolled
                } else if iters > limits.simple_max_iters {
                    LoopStrategy::BpfLoop
                } else {
                    LoopStrategy::Simple
                };
                LoopAnalysis {
                    bound: BoundInfo::Bounded { lo, hi },
                    estimated_iters: Some(iters),
                    strategy,
                }
            }
            _ => unbounded(),
        },
        ForRange::Iter(_) => unbounded(),
    }
}

fn unbounded() -> LoopAnalysis {
    LoopAnalysis {
        bound: BoundInfo::Unbounded,
        estimated_iters: None,
        strategy: LoopStrategy::BpfLoop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ast::{Expr, ExprKind, IntValue, Position};

    fn int(v: i64) -> Expr {
        Expr::new(
            ExprKind::Int(IntValue::I64(v)),
            Position::new(1, 1, "test.ks"),
        )
    }

    fn ident(name: &str) -> Expr {
        Expr::new(
            ExprKind::Ident(name.to_string()),
            Position::new(1, 1, "test.ks"),
        )
    }

    fn range(start: Expr, end: Expr) -> ForRange {
        ForRange::Range { start, end }
    }

    #[test]
    fn test_small_bound_unrolls() {
        let analysis = analyze(&range(int(0), int(3)), &ConstEnv::new(), LoopLimits::default());
        assert_eq!(analysis.bound, BoundInfo::Bounded { lo: 0, hi: 3 });
        assert_eq!(analysis.estimated_iters, Some(3));
        assert_eq!(analysis.strategy, LoopStrategy::Unrolled);
    }

    #[test]
    fn test_medium_bound_stays_simple() {
        let analysis = analyze(&range(int(0), int(10)), &ConstEnv::new(), LoopLimits::default());
        assert_eq!(analysis.bound, BoundInfo::Bounded { lo: 0, hi: 10 });
        assert_eq!(analysis.estimated_iters, Some(10));
        assert_eq!(analysis.strategy, LoopStrategy::Simple);
    }

    #[test]
    fn test_large_bound_uses_bpf_loop() {
        let analysis = analyze(
            &range(int(0), int(1000)),
            &ConstEnv::new(),
            LoopLimits::default(),
        );
        assert_eq!(analysis.strategy, LoopStrategy::BpfLoop);
        assert_eq!(analysis.estimated_iters, Some(1000));
    }

    #[test]
    fn test_non_constant_end_is_unbounded() {
        let analysis = analyze(
            &range(int(0), ident("n")),
            &ConstEnv::new(),
            LoopLimits::default(),
        );
        assert_eq!(analysis.bound, BoundInfo::Unbounded);
        assert_eq!(analysis.estimated_iters, None);
        assert_eq!(analysis.strategy, LoopStrategy::BpfLoop);
    }

    #[test]
    fn test_constant_environment_feeds_bounds() {
        let mut env = ConstEnv::new();
        env.bind("a", 2);
        env.bind("b", 6);
        let analysis = analyze(&range(int(0), ident("b")), &env, LoopLimits::default());
        assert_eq!(analysis.bound, BoundInfo::Bounded { lo: 0, hi: 6 });
        assert_eq!(analysis.strategy, LoopStrategy::Simple);
    }

    #[test]
    fn test_iterator_form_is_always_unbounded() {
        let analysis = analyze(
            &ForRange::Iter(ident("events")),
            &ConstEnv::new(),
            LoopLimits::default(),
        );
        assert_eq!(analysis.bound, BoundInfo::Unbounded);
        assert_eq!(analysis.strategy, LoopStrategy::BpfLoop);
    }

    #[test]
    fn test_inverted_range_clamps_to_zero() {
        let analysis = analyze(&range(int(10), int(0)), &ConstEnv::new(), LoopLimits::default());
        assert_eq!(analysis.estimated_iters, Some(0));
        assert_eq!(analysis.strategy, LoopStrategy::Unrolled);
    }
}
