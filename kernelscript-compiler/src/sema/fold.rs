//! Constant folding over a rolling environment.
//!
//! The environment is a small association list threaded through statement
//! checking in source order. Binding pushes an entry, reassignment to a
//! non-constant pushes a tombstone that shadows earlier entries, and lookup
//! scans from the most recent entry backwards.

use crate::script::ast::{BinaryOp, Expr, ExprKind, UnaryOp};

#[derive(Debug, Clone, Default)]
pub struct ConstEnv {
    entries: Vec<(String, Option<i64>)>,
}

impl ConstEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` currently holds the constant `value`.
    pub fn bind(&mut self, name: &str, value: i64) {
        self.entries.push((name.to_string(), Some(value)));
    }

    /// Record that `name` is no longer a known constant.
    pub fn invalidate(&mut self, name: &str) {
        self.entries.push((name.to_string(), None));
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| *v)
    }
}

/// Fold an expression to a constant integer, if every leaf reduces under
/// the current environment. Folding works over the widened `i64` carrier.
pub fn fold(expr: &Expr, env: &ConstEnv) -> Option<i64> {
    match &expr.kind {
        ExprKind::Int(value) => Some(value.widen()),
        ExprKind::Ident(name) => env.lookup(name),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => fold(operand, env)?.checked_neg(),
        ExprKind::Binary { left, op, right } => {
            let l = fold(left, env)?;
            let r = fold(right, env)?;
            match op {
                BinaryOp::Add => l.checked_add(r),
                BinaryOp::Sub => l.checked_sub(r),
                BinaryOp::Mul => l.checked_mul(r),
                BinaryOp::Div => l.checked_div(r),
                BinaryOp::Mod => l.checked_rem(r),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ast::{IntValue, Position};

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

    fn mul(l: Expr, r: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary {
                left: Box::new(l),
                op: BinaryOp::Mul,
                right: Box::new(r),
            },
            Position::new(1, 1, "test.ks"),
        )
    }

    #[test]
    fn test_fold_through_environment() {
        let mut env = ConstEnv::new();
        env.bind("a", 2);
        assert_eq!(fold(&mul(ident("a"), int(3)), &env), Some(6));
    }

    #[test]
    fn test_reassignment_invalidates() {
        let mut env = ConstEnv::new();
        env.bind("a", 2);
        env.invalidate("a");
        assert_eq!(fold(&ident("a"), &env), None);
        // A later constant rebinding wins again.
        env.bind("a", 9);
        assert_eq!(fold(&ident("a"), &env), Some(9));
    }

    #[test]
    fn test_division_by_zero_does_not_fold() {
        let env = ConstEnv::new();
        let div = Expr::new(
            ExprKind::Binary {
                left: Box::new(int(10)),
                op: BinaryOp::Div,
                right: Box::new(int(0)),
            },
            Position::new(1, 1, "test.ks"),
        );
        assert_eq!(fold(&div, &env), None);
    }
}
