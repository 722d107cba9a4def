//! Expression canonicalization.
//!
//! Turns an expression subtree into a stable textual key plus an optional
//! resolved declaration handle. Two expressions denote the same location iff
//! their canonical strings and their declarations are both equal; string
//! equality alone is not enough across shadowed scopes.
//!
//! Canonicalization never fails hard: anything ambiguous, call-containing, or
//! too complex degrades to "no location". Dropping a location silently is
//! preferred over corrupting state identity.

use std::rc::Rc;

use crate::ast::{BinOp, Decl, Expr, ExprKind, Type, UnOp};
use crate::oracle::Oracle;

/// Complexity assigned to anything that must never be tracked as a location.
pub const UNTRACKABLE: u32 = 999;

/// Rendering state threaded through one canonicalization pass.
///
/// `level` 0 means simple, 1 means complicated (display only), 2 means not
/// even printable (statement expressions).
#[derive(Default)]
struct Render {
    buf: String,
    decl: Option<Rc<Decl>>,
    level: u8,
    no_parens: bool,
}

fn render(out: &mut Render, expr: &Expr, capture: bool) {
    match &expr.kind {
        ExprKind::Symbol { name, decl } => {
            out.buf.push_str(name);
            if capture {
                // More than one raw declaration reference makes the
                // expression non-simple, but rendering still proceeds.
                if out.decl.is_some() {
                    out.level = out.level.max(1);
                }
                out.decl = decl.clone();
            }
        }
        ExprKind::Member { base, member } => {
            let (inner, arrow) = match &base.kind {
                ExprKind::Preop { op: UnOp::Deref, operand } => {
                    let stripped = strip_expr(operand);
                    if let ExprKind::Preop { op: UnOp::AddressOf, operand: addressed } =
                        &stripped.kind
                    {
                        (&**addressed, false)
                    } else if !operand.is_pointer() {
                        (&**operand, false)
                    } else {
                        (&**operand, true)
                    }
                }
                _ => (&**base, false),
            };
            render(out, inner, capture);
            out.buf.push_str(if arrow { "->" } else { "." });
            out.buf.push_str(member.as_deref().unwrap_or("unknown_member"));
        }
        ExprKind::Preop { op, operand } => {
            match op {
                UnOp::Paren => {
                    if !out.no_parens {
                        out.buf.push('(');
                    }
                    render(out, operand, capture);
                    if !out.no_parens {
                        out.buf.push(')');
                    }
                }
                _ => {
                    // `*(arr + i)` renders as `arr[i]`; the binop case below
                    // supplies the brackets, so the star is dropped here.
                    if !(*op == UnOp::Deref && array_expr_of(operand).is_some()) {
                        out.buf.push_str(op.as_str());
                    }
                    render(out, operand, capture);
                }
            }
            if matches!(op, UnOp::Inc | UnOp::Dec) {
                out.level = out.level.max(1);
            }
        }
        ExprKind::Postop { op, operand } => {
            render(out, operand, capture);
            out.buf.push_str(op.as_str());
            if matches!(op, UnOp::Inc | UnOp::Dec) {
                out.level = out.level.max(1);
            }
        }
        ExprKind::Binop { op, left, right } => {
            out.level = out.level.max(1);
            if let Some(base) = array_expr_of(expr) {
                render(out, base, capture);
                out.buf.push('[');
                render(out, right, false);
                out.buf.push(']');
            } else {
                render(out, left, capture);
                out.buf.push_str(&format!(" {} ", op.as_str()));
                render(out, right, false);
            }
        }
        ExprKind::Compare { op, left, right } => {
            out.level = out.level.max(1);
            render(out, left, capture);
            out.buf.push_str(&format!(" {} ", op.as_str()));
            render(out, right, false);
        }
        ExprKind::Logical { op, left, right } => {
            out.level = out.level.max(1);
            render(out, left, capture);
            out.buf.push_str(&format!(" {} ", op.as_str()));
            render(out, right, false);
        }
        ExprKind::Assign { op, left, right, .. } => {
            out.level = out.level.max(1);
            render(out, left, capture);
            out.buf.push_str(&format!(" {} ", op.as_str()));
            render(out, right, false);
        }
        ExprKind::Value { value } => {
            out.level = out.level.max(1);
            out.buf.push_str(&value.to_string());
        }
        ExprKind::Str { value } => {
            out.buf.push('"');
            out.buf.push_str(value);
            out.buf.push('"');
        }
        ExprKind::Call { func, args } => {
            out.level = out.level.max(1);
            render(out, func, false);
            out.buf.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.buf.push_str(", ");
                }
                render(out, arg, false);
            }
            out.buf.push(')');
        }
        ExprKind::Cast { operand } => {
            render(out, operand, capture);
        }
        ExprKind::SizeOf { ty } => {
            if let Some(size) = ty.byte_size() {
                out.buf.push_str(&size.to_string());
            }
        }
        ExprKind::StmtExpr => {
            out.level = 2;
        }
        ExprKind::Conditional { .. } => {
            out.level = out.level.max(1);
        }
    }
}

/// Stylized C-looking rendering of an expression, for display in messages.
/// Returns `None` for expressions with no printable form.
pub fn expr_to_str(expr: &Expr) -> Option<String> {
    expr_to_str_sym(expr).map(|(name, _)| name)
}

/// Display rendering plus the resolved declaration, when there is one.
pub fn expr_to_str_sym(expr: &Expr) -> Option<(String, Option<Rc<Decl>>)> {
    let mut out = Render::default();
    render(&mut out, expr, true);
    if out.level < 2 { Some((out.buf, out.decl)) } else { None }
}

/// Canonical key for a *simple* location: a single variable or member chain
/// with nothing raising complexity. `a->foo` qualifies, `a->foo[x]` does not.
pub fn expr_to_var(expr: &Expr) -> Option<String> {
    expr_to_var_sym(expr).map(|(name, _)| name)
}

pub fn expr_to_var_sym(expr: &Expr) -> Option<(String, Option<Rc<Decl>>)> {
    let expr = strip_expr(expr);
    let mut out = Render { no_parens: true, ..Render::default() };
    render(&mut out, expr, true);
    if out.level == 0 { Some((out.buf, out.decl)) } else { None }
}

/// Recursive cost of admitting an expression as a tracked pseudo-variable.
///
/// Calls and unresolved or non-local symbols are effectively infinite; a
/// plain local costs 1; constants are free; dereference and member access
/// pass the cost of their base through; binary arithmetic sums its sides.
pub fn complication_score(expr: &Expr) -> u32 {
    let expr = strip_expr(expr);
    match &expr.kind {
        ExprKind::Call { .. } => UNTRACKABLE,
        ExprKind::Binop { left, right, .. } | ExprKind::Compare { left, right, .. } => {
            complication_score(left).saturating_add(complication_score(right))
        }
        ExprKind::Symbol { decl: Some(decl), .. } if decl.local => 1,
        ExprKind::Symbol { .. } => UNTRACKABLE,
        ExprKind::Preop { op: UnOp::Deref, operand } => complication_score(operand),
        ExprKind::Preop { .. } => UNTRACKABLE,
        ExprKind::Member { base, .. } => complication_score(base),
        ExprKind::Value { .. } => 0,
        _ => UNTRACKABLE,
    }
}

/// Canonical key for state tracking: simple locations pass through with
/// their declaration; bounded-complexity compound chunks (score in (0, 2])
/// are admitted by their display rendering, with no declaration handle.
pub fn expr_to_chunk(expr: &Expr) -> Option<String> {
    expr_to_chunk_sym(expr).map(|(name, _)| name)
}

pub fn expr_to_chunk_sym(expr: &Expr) -> Option<(String, Option<Rc<Decl>>)> {
    let expr = strip_parens(expr);
    if let Some((name, Some(decl))) = expr_to_var_sym(expr) {
        return Some((name, Some(decl)));
    }
    let score = complication_score(expr);
    if score == 0 || score > 2 {
        return None;
    }
    expr_to_str(expr).map(|name| (name, None))
}

/// Structural equivalence: both sides canonicalize to simple, non-null keys,
/// resolve to the same declaration, and render identically.
pub fn expr_equiv(one: &Expr, two: &Expr) -> bool {
    if std::mem::discriminant(&one.kind) != std::mem::discriminant(&two.kind) {
        return false;
    }
    let Some((one_name, Some(one_decl))) = expr_to_var_sym(one) else {
        return false;
    };
    let Some((two_name, Some(two_decl))) = expr_to_var_sym(two) else {
        return false;
    };
    one_decl.id == two_decl.id && one_name == two_name
}

/// Strip parentheses only. Statement expressions keep their wrapper.
pub fn strip_parens(expr: &Expr) -> &Expr {
    if let ExprKind::Preop { op: UnOp::Paren, operand } = &expr.kind {
        if matches!(operand.kind, ExprKind::StmtExpr) {
            return expr;
        }
        return strip_parens(operand);
    }
    expr
}

/// Strip semantically inert wrapping: parentheses, casts, redundant `*&`
/// pairs (unless the inner side is an array), compiler-expectation hints,
/// and conditionals whose condition is a known constant.
pub fn strip_expr(expr: &Expr) -> &Expr {
    match &expr.kind {
        ExprKind::Cast { operand } => strip_expr(operand),
        ExprKind::Preop { op: UnOp::Paren, operand } => {
            if matches!(operand.kind, ExprKind::StmtExpr) {
                expr
            } else {
                strip_expr(operand)
            }
        }
        ExprKind::Preop { op: UnOp::Deref, operand } => {
            let unop = strip_expr(operand);
            if let ExprKind::Preop { op: UnOp::AddressOf, operand: inner } = &unop.kind {
                // `*&arr` stays: the deref changes an array's meaning.
                if inner.real_type().is_some_and(Type::is_array) {
                    return expr;
                }
                return strip_expr(inner);
            }
            expr
        }
        ExprKind::Conditional { cond, if_true, if_false } => match known_condition(cond) {
            Some(true) => match if_true {
                Some(true_side) => strip_expr(true_side),
                None => strip_expr(cond),
            },
            Some(false) => strip_expr(if_false),
            None => expr,
        },
        ExprKind::Call { func, args } => {
            if sym_name_is("__builtin_expect", func) {
                if let Some(first) = args.first() {
                    return strip_expr(first);
                }
            }
            expr
        }
        _ => expr,
    }
}

fn known_condition(cond: &Expr) -> Option<bool> {
    match &strip_parens(cond).kind {
        ExprKind::Value { value } => Some(*value != 0),
        _ => None,
    }
}

/// True when `expr` is a bare reference to the given name.
pub fn sym_name_is(name: &str, expr: &Expr) -> bool {
    matches!(&expr.kind, ExprKind::Symbol { name: sym, .. } if sym == name)
}

/// True when the oracle proves the expression is zero.
pub fn is_zero(expr: &Expr, oracle: &dyn Oracle) -> bool {
    oracle.implied_value(expr) == Some(0)
}

// `base + offset` where the base has array type.
fn array_expr_of(expr: &Expr) -> Option<&Expr> {
    let ExprKind::Binop { op: BinOp::Add, left, .. } = &expr.kind else {
        return None;
    };
    if left.real_type().is_some_and(Type::is_array) { Some(left) } else { None }
}

/// True for array element accesses, in either the `*(base + offset)` or the
/// typed `base + offset` form.
pub fn is_array_access(expr: &Expr) -> bool {
    let expr = strip_expr(expr);
    if let ExprKind::Preop { op: UnOp::Deref, operand } = &expr.kind {
        let inner = strip_expr(operand);
        if matches!(inner.kind, ExprKind::Binop { op: BinOp::Add, .. }) {
            return true;
        }
    }
    array_expr_of(expr).is_some()
}

pub fn array_base(expr: &Expr) -> Option<&Expr> {
    if !is_array_access(expr) {
        return None;
    }
    let mut expr = strip_expr(expr);
    if let ExprKind::Preop { op: UnOp::Deref, operand } = &expr.kind {
        expr = strip_expr(operand);
    }
    let ExprKind::Binop { op: BinOp::Add, left, .. } = &expr.kind else {
        return None;
    };
    Some(strip_parens(left))
}

pub fn array_offset(expr: &Expr) -> Option<&Expr> {
    if !is_array_access(expr) {
        return None;
    }
    let mut expr = strip_expr(expr);
    if let ExprKind::Preop { op: UnOp::Deref, operand } = &expr.kind {
        expr = strip_expr(operand);
    }
    let ExprKind::Binop { op: BinOp::Add, right, .. } = &expr.kind else {
        return None;
    };
    Some(strip_parens(right))
}

/// `(struct S)->member` rendering used for type-keyed member tracking.
pub fn member_name(expr: &Expr) -> Option<String> {
    let expr = strip_expr(expr);
    let ExprKind::Member { base, member: Some(member) } = &expr.kind else {
        return None;
    };
    match base.real_type() {
        Some(Type::Struct { name: Some(name) }) => Some(format!("(struct {name})->{member}")),
        Some(Type::Union { name: Some(name) }) => Some(format!("(union {name})->{member}")),
        Some(Type::Union { name: None }) => Some(format!("(union hack)->{member}")),
        _ => None,
    }
}
