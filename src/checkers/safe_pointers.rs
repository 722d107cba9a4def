//! "safe" pointer type-discipline enforcement.
//!
//! A declaration carrying the safe pointer qualifier promises that it never
//! holds a dereferenceable-but-invalid value without being checked. This
//! checker enforces the discipline at every boundary where an unsafe value
//! could sneak into a safe slot: dereferences, plain assignments, call
//! arguments, and returns. `is_safe_expr` is the central predicate; it
//! consults the tracked state, the external range oracle, and the static
//! types, and inherits safety through pointer arithmetic, assignments,
//! increments, and member addresses.
//!
//! Inactive unless registered; `register_default_checkers` only does so when
//! the `PTRFLOW_CHECK_SAFE` environment switch is present.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{AssignOp, BinOp, Decl, Expr, ExprKind, Type, UnOp};
use crate::canon;
use crate::hooks::{AnalysisCtx, Dispatcher};
use crate::state::{CheckerId, RegistryError, State, UNDEFINED};

pub const SAFE: State = State::new("safe");

/// First unsafe value returned by the current function, kept until the
/// function-end event reports or discards it.
struct UnsafeReturn {
    name: String,
    line: u32,
}

pub fn register(ctx: &mut AnalysisCtx, disp: &mut Dispatcher) -> Result<CheckerId, RegistryError> {
    let id = ctx.states.register_checker("safe_pointers")?;
    let unsafe_return: Rc<RefCell<Option<UnsafeReturn>>> = Rc::default();

    disp.add_deref_hook(move |ctx, expr| match_dereferences(id, ctx, expr));
    disp.add_assign_hook(move |ctx, expr| match_assign(id, ctx, expr));
    disp.add_call_hook(move |ctx, expr| match_call(id, ctx, expr));
    {
        let unsafe_return = unsafe_return.clone();
        disp.add_return_hook(move |ctx, value| match_return(id, &unsafe_return, ctx, value));
    }
    {
        let unsafe_return = unsafe_return.clone();
        disp.add_func_end_hook(move |ctx, func| match_func_end(&unsafe_return, ctx, func));
    }
    disp.add_condition_hook(move |ctx, expr| match_condition(id, ctx, expr));
    Ok(id)
}

/// Static type carries the safe qualifier.
fn is_safe(expr: &Expr) -> bool {
    expr.real_type().is_some_and(Type::is_safe_ptr)
}

/// The address of a member reached through dereferencing a safe pointer is
/// itself safe, possibly through nested member accesses and casts.
fn is_field_address(id: CheckerId, ctx: &AnalysisCtx, expr: &Expr) -> bool {
    let expr = canon::strip_expr(expr);
    let ExprKind::Preop { op: UnOp::AddressOf, operand } = &expr.kind else {
        return false;
    };
    let mut inner = canon::strip_expr(operand);
    while let ExprKind::Member { base, .. } = &inner.kind {
        inner = canon::strip_expr(base);
    }
    let ExprKind::Preop { op: UnOp::Deref, operand } = &inner.kind else {
        return false;
    };
    is_safe_expr(id, ctx, operand)
}

fn is_safe_expr(id: CheckerId, ctx: &AnalysisCtx, expr: &Expr) -> bool {
    if ctx.states.get_expr(id, expr) == SAFE {
        return true;
    }
    if ctx.oracle().implied_not_equal(expr, 0) {
        return true;
    }

    let expr = canon::strip_parens(expr);
    if let ExprKind::Conditional { cond, if_true, if_false } = &expr.kind {
        if ctx.oracle().implied_not_equal(cond, 0) {
            // the false side is never taken
            return match if_true {
                Some(true_side) => is_safe_expr(id, ctx, true_side),
                None => true,
            };
        }
        if canon::is_zero(cond, ctx.oracle()) {
            return is_safe_expr(id, ctx, if_false);
        }
        if !is_safe_expr(id, ctx, if_false) {
            return false;
        }
        let Some(true_side) = if_true else {
            // `cond ?: other`: if cond is true it is the value used
            return true;
        };
        return is_safe_expr(id, ctx, true_side);
    }

    if let Some(ty) = expr.real_type() {
        if ty.is_safe_ptr() {
            return true;
        }
        // arrays decay to non-null addresses
        if ty.is_array() {
            return true;
        }
    }

    let expr = canon::strip_expr(expr);
    if let ExprKind::Binop { op: BinOp::Add | BinOp::Sub | BinOp::BitAnd, left, .. } = &expr.kind {
        // pointer arithmetic; assume the left side is the pointer. It may
        // have been cast into an integer, so the type cannot be trusted.
        if is_safe_expr(id, ctx, left) {
            return true;
        }
    }
    if let ExprKind::Assign { op: AssignOp::Assign, right, .. } = &expr.kind {
        // the type of an assignment is the type of its left side; safety
        // comes from the right side
        return is_safe_expr(id, ctx, right);
    }
    if let ExprKind::Preop { op: UnOp::Inc | UnOp::Dec, operand }
    | ExprKind::Postop { op: UnOp::Inc | UnOp::Dec, operand } = &expr.kind
    {
        return is_safe_expr(id, ctx, operand);
    }
    if is_field_address(id, ctx, expr) {
        return true;
    }
    false
}

fn in_macro(ctx: &AnalysisCtx, expr: &Expr) -> bool {
    ctx.oracle().macro_name(expr.pos).is_some()
}

fn match_dereferences(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    let ExprKind::Preop { op: UnOp::Deref, operand } = &expr.kind else {
        return;
    };
    if is_safe_expr(id, ctx, operand) {
        return;
    }
    if in_macro(ctx, operand) {
        return;
    }
    let name = display_name(operand);
    ctx.emit(format!("Possible NULL dereference found: {name}"));
}

fn match_assign(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    let ExprKind::Assign { op, left, right, fake } = &expr.kind else {
        return;
    };
    if *op != AssignOp::Assign {
        // could be '+=' etc
        return;
    }
    if *fake || ctx.in_fake_assign {
        return;
    }

    if is_safe_expr(id, ctx, right) {
        ctx.states.set_expr(id, left, SAFE);
    } else {
        ctx.states.set_expr(id, left, UNDEFINED);
    }

    if is_safe(left) && !is_safe_expr(id, ctx, right) {
        let left_name = display_name(left);
        let right_name = display_name(right);
        ctx.emit(format!("'{left_name}' can only take 'safe' pointers, not '{right_name}'"));
    }
}

fn match_call(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    let ExprKind::Call { func, args } = &expr.kind else {
        return;
    };
    let Some(Type::Function { params, .. }) = func.real_type() else {
        return;
    };
    for (i, arg) in args.iter().enumerate() {
        let Some(param) = params.get(i) else {
            // the variable part of a var-args call
            break;
        };
        if !param.is_safe_ptr() {
            continue;
        }
        if is_safe_expr(id, ctx, arg) {
            continue;
        }
        let name = display_name(arg);
        ctx.emit(format!("parameter {} requires safe value, not '{}'", i + 1, name));
    }
}

fn match_return(
    id: CheckerId,
    unsafe_return: &Rc<RefCell<Option<UnsafeReturn>>>,
    ctx: &mut AnalysisCtx,
    value: Option<&Expr>,
) {
    if ctx.in_inline_fn {
        return;
    }
    let Some(value) = value else {
        return;
    };
    if unsafe_return.borrow().is_some() {
        // the earliest violation wins
        return;
    }
    if is_safe_expr(id, ctx, value) {
        return;
    }
    *unsafe_return.borrow_mut() = Some(UnsafeReturn {
        name: display_name(value),
        line: value.pos.line,
    });
}

fn match_func_end(
    unsafe_return: &Rc<RefCell<Option<UnsafeReturn>>>,
    ctx: &mut AnalysisCtx,
    func: &Rc<Decl>,
) {
    if ctx.in_inline_fn {
        return;
    }
    let recorded = unsafe_return.borrow_mut().take();
    let Some(recorded) = recorded else {
        return;
    };
    if func.return_type().is_some_and(Type::is_safe_ptr) {
        ctx.emit(format!(
            "function {} returns unsafe '{}' at line {}",
            func.name, recorded.name, recorded.line
        ));
    }
}

fn match_condition(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    if !expr.is_pointer() {
        return;
    }
    if let ExprKind::Assign { left, right, .. } = &expr.kind {
        match_condition(id, ctx, right);
        match_condition(id, ctx, left);
    }
    // true branch implies checked, false branch implies anything goes
    ctx.states.set_on_branch_expr(id, expr, SAFE, UNDEFINED);
}

fn display_name(expr: &Expr) -> String {
    canon::expr_to_str(expr).unwrap_or_else(|| "<complex expression>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::TableOracle;

    fn setup() -> (AnalysisCtx, Dispatcher, CheckerId) {
        setup_with_oracle(TableOracle::new())
    }

    fn setup_with_oracle(oracle: TableOracle) -> (AnalysisCtx, Dispatcher, CheckerId) {
        let mut ctx = AnalysisCtx::with_oracle(Rc::new(oracle));
        let mut disp = Dispatcher::new();
        let id = register(&mut ctx, &mut disp).unwrap();
        (ctx, disp, id)
    }

    fn safe_int_ptr() -> Type {
        Type::safe_pointer(Type::Int)
    }

    #[test]
    fn test_safe_typed_expressions_are_safe() {
        let (ctx, _disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        assert!(is_safe_expr(id, &ctx, &Expr::symbol(&s)));
        let q = Decl::local("q", Type::pointer(Type::Int));
        assert!(!is_safe_expr(id, &ctx, &Expr::symbol(&q)));
    }

    #[test]
    fn test_arrays_decay_to_safe_addresses() {
        let (ctx, _disp, id) = setup();
        let arr = Decl::local("arr", Type::array(Type::Int, Some(4)));
        assert!(is_safe_expr(id, &ctx, &Expr::symbol(&arr)));
    }

    #[test]
    fn test_oracle_nonzero_makes_safe() {
        let mut oracle = TableOracle::new();
        oracle.set_nonzero("q");
        let (ctx, _disp, id) = setup_with_oracle(oracle);
        let q = Decl::local("q", Type::pointer(Type::Int));
        assert!(is_safe_expr(id, &ctx, &Expr::symbol(&q)));
    }

    #[test]
    fn test_pointer_arithmetic_inherits_safety() {
        let (ctx, _disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        let offset = Decl::local("i", Type::Int);
        let sum = Expr::binop(BinOp::Add, Expr::symbol(&s), Expr::symbol(&offset));
        assert!(is_safe_expr(id, &ctx, &sum));
        // but not when the pointer is on the right
        let swapped = Expr::binop(BinOp::Add, Expr::symbol(&offset), Expr::symbol(&s));
        assert!(!is_safe_expr(id, &ctx, &swapped));
    }

    #[test]
    fn test_increment_and_assignment_inherit_safety() {
        let (ctx, _disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));

        let inc = Expr::postop(UnOp::Inc, Expr::symbol(&s));
        assert!(is_safe_expr(id, &ctx, &inc));

        let assign = Expr::assign(Expr::symbol(&q), Expr::symbol(&s));
        assert!(is_safe_expr(id, &ctx, &assign));
    }

    #[test]
    fn test_member_address_through_safe_pointer_is_safe() {
        let (ctx, _disp, id) = setup();
        let s = Decl::local("s", Type::safe_pointer(Type::Struct { name: Some("foo".into()) }));
        // &s->bar.baz
        let member = Expr::dot(Expr::arrow(Expr::symbol(&s), "bar"), "baz");
        let addr = Expr::addr_of(member);
        assert!(is_safe_expr(id, &ctx, &addr));

        let q = Decl::local("q", Type::pointer(Type::Struct { name: Some("foo".into()) }));
        let unsafe_addr = Expr::addr_of(Expr::arrow(Expr::symbol(&q), "bar"));
        assert!(!is_safe_expr(id, &ctx, &unsafe_addr));
    }

    #[test]
    fn test_conditional_safety_requires_both_live_branches() {
        let (ctx, _disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));
        let cond = Decl::local("flag", Type::Int);

        let both_safe = Expr::conditional(
            Expr::symbol(&cond),
            Some(Expr::symbol(&s)),
            Expr::symbol(&s),
        );
        assert!(is_safe_expr(id, &ctx, &both_safe));

        let false_unsafe = Expr::conditional(
            Expr::symbol(&cond),
            Some(Expr::symbol(&s)),
            Expr::symbol(&q),
        );
        assert!(!is_safe_expr(id, &ctx, &false_unsafe));

        // a statically-true condition short-circuits the dead branch
        let dead_false = Expr::conditional(
            Expr::value(1),
            Some(Expr::symbol(&s)),
            Expr::symbol(&q),
        );
        assert!(is_safe_expr(id, &ctx, &dead_false));
    }

    #[test]
    fn test_unsafe_dereference_warns() {
        let (mut ctx, disp, _id) = setup();
        let q = Decl::local("q", Type::pointer(Type::Int));
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&q)));
        assert_eq!(ctx.diagnostics().len(), 1);
        assert_eq!(ctx.diagnostics()[0].message, "Possible NULL dereference found: q");
    }

    #[test]
    fn test_safe_dereference_is_quiet() {
        let (mut ctx, disp, _id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&s)));
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_macro_expansion_suppresses_dereference_warning() {
        let mut oracle = TableOracle::new();
        oracle.set_macro_line(0, 9, "DEREF");
        let (mut ctx, disp, _id) = setup_with_oracle(oracle);
        let q = Decl::local("q", Type::pointer(Type::Int));
        let expr = Expr::deref(Expr::symbol(&q).at_line(9)).at_line(9);
        disp.dereference(&mut ctx, &expr);
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_assignment_tracks_and_polices_safety() {
        let (mut ctx, disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));

        // q = s; makes q safe by state
        disp.assignment(&mut ctx, &Expr::assign(Expr::symbol(&q), Expr::symbol(&s)));
        assert!(ctx.diagnostics().is_empty());
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&q)), SAFE);

        // s = q; violates the type discipline (q lost its state on the write)
        let f = Decl::function("f", Type::pointer(Type::Int), vec![]);
        disp.assignment(
            &mut ctx,
            &Expr::assign(Expr::symbol(&q), Expr::call(Expr::symbol(&f), vec![])),
        );
        disp.assignment(&mut ctx, &Expr::assign(Expr::symbol(&s), Expr::symbol(&q)));
        assert_eq!(ctx.diagnostics().len(), 1);
        assert_eq!(
            ctx.diagnostics()[0].message,
            "'s' can only take 'safe' pointers, not 'q'"
        );
    }

    #[test]
    fn test_compound_and_fake_assignments_are_ignored() {
        let (mut ctx, disp, id) = setup();
        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));

        disp.assignment(
            &mut ctx,
            &Expr::assign_op(AssignOp::AddAssign, Expr::symbol(&s), Expr::symbol(&q)),
        );
        assert!(ctx.diagnostics().is_empty());

        disp.assignment(&mut ctx, &Expr::fake_assign(Expr::symbol(&q), Expr::symbol(&s)));
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&q)), UNDEFINED);
    }

    #[test]
    fn test_call_arguments_check_safe_typed_formals() {
        let (mut ctx, disp, _id) = setup();
        // g(int, safe int*, ...)
        let g = Decl::function(
            "g",
            Type::Void,
            vec![Type::Int, safe_int_ptr()],
        );
        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));

        disp.call(
            &mut ctx,
            &Expr::call(Expr::symbol(&g), vec![Expr::value(1), Expr::symbol(&s)]),
        );
        assert!(ctx.diagnostics().is_empty());

        disp.call(
            &mut ctx,
            &Expr::call(Expr::symbol(&g), vec![Expr::value(1), Expr::symbol(&q)]),
        );
        assert_eq!(ctx.diagnostics().len(), 1);
        assert_eq!(
            ctx.diagnostics()[0].message,
            "parameter 2 requires safe value, not 'q'"
        );

        // extra arguments past the declared formals are the var-args tail
        disp.call(
            &mut ctx,
            &Expr::call(
                Expr::symbol(&g),
                vec![Expr::value(1), Expr::symbol(&s), Expr::symbol(&q)],
            ),
        );
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn test_first_unsafe_return_wins() {
        let (mut ctx, disp, _id) = setup();
        let frob = Decl::function("frob", safe_int_ptr(), vec![]);
        ctx.begin_function(frob.clone());

        let s = Decl::local("s", safe_int_ptr());
        let q = Decl::local("q", Type::pointer(Type::Int));
        let r = Decl::local("r", Type::pointer(Type::Int));

        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&s).at_line(3)));
        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&q).at_line(5)));
        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&r).at_line(7)));
        disp.function_end(&mut ctx, &frob);

        let diags = ctx.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "function frob returns unsafe 'q' at line 5");
    }

    #[test]
    fn test_unsafe_return_from_plain_function_is_fine() {
        let (mut ctx, disp, _id) = setup();
        let frob = Decl::function("frob", Type::pointer(Type::Int), vec![]);
        ctx.begin_function(frob.clone());
        let q = Decl::local("q", Type::pointer(Type::Int));
        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&q)));
        disp.function_end(&mut ctx, &frob);
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_return_memory_clears_between_functions() {
        let (mut ctx, disp, _id) = setup();
        let plain = Decl::function("plain", Type::pointer(Type::Int), vec![]);
        let q = Decl::local("q", Type::pointer(Type::Int));
        ctx.begin_function(plain.clone());
        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&q)));
        disp.function_end(&mut ctx, &plain);

        // the recorded unsafe return must not leak into the next function
        let strict = Decl::function("strict", safe_int_ptr(), vec![]);
        let s = Decl::local("s", safe_int_ptr());
        ctx.begin_function(strict.clone());
        disp.return_stmt(&mut ctx, Some(&Expr::symbol(&s)));
        disp.function_end(&mut ctx, &strict);
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_condition_narrows_pointer_state() {
        let (mut ctx, disp, id) = setup();
        let q = Decl::local("q", Type::pointer(Type::Int));

        // if (q) { *q; } else { *q; }
        disp.condition(&mut ctx, &Expr::symbol(&q));
        ctx.states.apply_branch(true);
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&q)), SAFE);
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&q)));
        assert!(ctx.diagnostics().is_empty());

        disp.condition(&mut ctx, &Expr::symbol(&q).at_line(12));
        ctx.states.apply_branch(false);
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&q)), UNDEFINED);
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&q)).at_line(13));
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn test_condition_recurses_into_assignments() {
        let (mut ctx, disp, id) = setup();
        let q = Decl::local("q", Type::pointer(Type::Int));
        let f = Decl::function("f", Type::pointer(Type::Int), vec![]);

        // if ((q = f())) ...
        let assign = Expr::assign(Expr::symbol(&q), Expr::call(Expr::symbol(&f), vec![]));
        disp.condition(&mut ctx, &assign);
        ctx.states.apply_branch(true);
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&q)), SAFE);
    }

    #[test]
    fn test_non_pointer_conditions_are_ignored() {
        let (mut ctx, disp, id) = setup();
        let n = Decl::local("n", Type::Int);
        disp.condition(&mut ctx, &Expr::symbol(&n));
        ctx.states.apply_branch(true);
        assert_eq!(ctx.states.get_expr(id, &Expr::symbol(&n)), UNDEFINED);
    }
}
