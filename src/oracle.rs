//! Interface to the external value/range analysis.
//!
//! The symbolic implication engine lives outside this core; checkers consult
//! it through this trait for implied constants, implied non-zero facts, and
//! macro-expansion origins. Every answer is allowed to be "don't know" - the
//! checkers treat inconclusiveness as "not proven safe", never as an error.

use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, ExprKind, Position};
use crate::canon;

pub trait Oracle {
    /// Implied constant value of the expression, when statically determinable.
    fn implied_value(&self, expr: &Expr) -> Option<i64> {
        let _ = expr;
        None
    }

    /// True when the expression provably never equals `value`.
    fn implied_not_equal(&self, expr: &Expr, value: i64) -> bool {
        let _ = (expr, value);
        false
    }

    /// Name of the macro a position was expanded from, if any. Used to
    /// suppress diagnostics inside expansions the author cannot control.
    fn macro_name(&self, pos: Position) -> Option<String> {
        let _ = pos;
        None
    }
}

/// Oracle that knows nothing. Constant literals still answer for themselves.
pub struct NullOracle;

impl Oracle for NullOracle {
    fn implied_value(&self, expr: &Expr) -> Option<i64> {
        literal_value(expr)
    }
}

fn literal_value(expr: &Expr) -> Option<i64> {
    match &canon::strip_expr(expr).kind {
        ExprKind::Value { value } => Some(*value),
        _ => None,
    }
}

/// Scriptable oracle keyed by canonical expression names. Embedders (and the
/// test suites) preload the facts their range analysis would have derived.
#[derive(Default)]
pub struct TableOracle {
    values: HashMap<String, i64>,
    nonzero: HashSet<String>,
    macros: HashMap<(u32, u32), String>,
}

impl TableOracle {
    pub fn new() -> TableOracle {
        TableOracle::default()
    }

    pub fn set_value(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn set_nonzero(&mut self, name: &str) {
        self.nonzero.insert(name.to_string());
    }

    /// Mark every position on a line as originating from the named macro.
    pub fn set_macro_line(&mut self, stream: u32, line: u32, name: &str) {
        self.macros.insert((stream, line), name.to_string());
    }
}

impl Oracle for TableOracle {
    fn implied_value(&self, expr: &Expr) -> Option<i64> {
        if let Some(value) = literal_value(expr) {
            return Some(value);
        }
        let name = canon::expr_to_str(expr)?;
        self.values.get(&name).copied()
    }

    fn implied_not_equal(&self, expr: &Expr, value: i64) -> bool {
        if let Some(known) = self.implied_value(expr) {
            return known != value;
        }
        // String literals decay to non-null addresses.
        if value == 0 && matches!(canon::strip_expr(expr).kind, ExprKind::Str { .. }) {
            return true;
        }
        value == 0 && canon::expr_to_str(expr).is_some_and(|name| self.nonzero.contains(&name))
    }

    fn macro_name(&self, pos: Position) -> Option<String> {
        self.macros.get(&(pos.stream, pos.line)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Decl, Type};

    #[test]
    fn test_null_oracle_only_knows_literals() {
        let oracle = NullOracle;
        assert_eq!(oracle.implied_value(&Expr::value(42)), Some(42));
        let p = Decl::local("p", Type::pointer(Type::Int));
        assert_eq!(oracle.implied_value(&Expr::symbol(&p)), None);
        assert!(!oracle.implied_not_equal(&Expr::symbol(&p), 0));
    }

    #[test]
    fn test_table_oracle_answers_by_canonical_name() {
        let p = Decl::local("p", Type::pointer(Type::Int));
        let mut oracle = TableOracle::new();
        oracle.set_nonzero("p");
        assert!(oracle.implied_not_equal(&Expr::symbol(&p), 0));
        // a pointer proven non-zero is still not proven unequal to 1
        assert!(!oracle.implied_not_equal(&Expr::symbol(&p), 1));
    }

    #[test]
    fn test_string_literals_imply_nonzero() {
        let oracle = TableOracle::new();
        assert!(oracle.implied_not_equal(&Expr::string("hello"), 0));
    }

    #[test]
    fn test_macro_positions() {
        let mut oracle = TableOracle::new();
        oracle.set_macro_line(0, 12, "INC");
        assert_eq!(oracle.macro_name(Position::line(12)).as_deref(), Some("INC"));
        assert_eq!(oracle.macro_name(Position::line(13)), None);
    }
}
