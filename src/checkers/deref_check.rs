//! Dereference-before-NULL-check detection.
//!
//! A pointer that was just dereferenced cannot have been NULL, so a
//! subsequent NULL check of the same pointer is either dead code or - far
//! more likely - the dereference is the bug. Two states per location:
//! `oktocheck` (default) and `derefed`. Any write to the location between
//! the dereference and the check makes the check legitimate again.

use crate::ast::{Expr, ExprKind, UnOp};
use crate::canon;
use crate::hooks::{AnalysisCtx, Dispatcher};
use crate::state::{CheckerId, RegistryError, State};

pub const DEREFED: State = State::new("derefed");
pub const OK_TO_CHECK: State = State::new("oktocheck");

pub fn register(ctx: &mut AnalysisCtx, disp: &mut Dispatcher) -> Result<CheckerId, RegistryError> {
    let id = ctx.states.register_checker("deref_check")?;
    ctx.states.set_default(id, OK_TO_CHECK);
    disp.add_deref_hook(move |ctx, expr| match_dereference(id, ctx, expr));
    disp.add_condition_hook(move |ctx, expr| match_condition(id, ctx, expr));
    Ok(id)
}

fn match_dereference(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    // only the indirection operator counts; `&`, `!` and friends do not
    let ExprKind::Preop { op: UnOp::Deref, operand } = &expr.kind else {
        return;
    };
    let target = canon::strip_expr(operand);

    ctx.states.set_expr(id, target, DEREFED);

    let Some((name, _)) = canon::expr_to_var_sym(target) else {
        return;
    };
    ctx.add_modification_hook(&name, move |ctx, name, decl, _expr| {
        ctx.states.set(id, name, decl.map(|d| d.id), OK_TO_CHECK);
    });
}

fn match_condition(id: CheckerId, ctx: &mut AnalysisCtx, expr: &Expr) {
    if ctx.states.get_expr(id, expr) != DEREFED {
        return;
    }
    let name = canon::expr_to_var(expr).unwrap_or_else(|| "<unknown>".to_string());
    ctx.emit(format!("variable dereferenced before check '{name}'"));
    // one diagnostic per first violating check, not per repeated check
    ctx.states.set_expr(id, expr, OK_TO_CHECK);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Decl, Type};

    fn setup() -> (AnalysisCtx, Dispatcher) {
        let mut ctx = AnalysisCtx::new();
        let mut disp = Dispatcher::new();
        register(&mut ctx, &mut disp).unwrap();
        (ctx, disp)
    }

    fn int_ptr_local(name: &str) -> std::rc::Rc<Decl> {
        Decl::local(name, Type::pointer(Type::Int))
    }

    #[test]
    fn test_deref_then_check_warns_once() {
        let (mut ctx, disp) = setup();
        let p = int_ptr_local("p");

        // p = f(); *p; if (p) ...
        let f = Decl::function("f", Type::pointer(Type::Int), vec![]);
        disp.assignment(
            &mut ctx,
            &Expr::assign(Expr::symbol(&p), Expr::call(Expr::symbol(&f), vec![])),
        );
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&p)).at_line(3));
        disp.condition(&mut ctx, &Expr::symbol(&p).at_line(4));

        let diags = ctx.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "variable dereferenced before check 'p'");
        assert_eq!(diags[0].pos.line, 4);

        // a second check of the same pointer stays quiet
        disp.condition(&mut ctx, &Expr::symbol(&p).at_line(5));
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn test_check_then_deref_is_clean() {
        let (mut ctx, disp) = setup();
        let p = int_ptr_local("p");

        // if (p) *p;
        disp.condition(&mut ctx, &Expr::symbol(&p));
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&p)));
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_write_between_deref_and_check_is_clean() {
        let (mut ctx, disp) = setup();
        let p = int_ptr_local("p");
        let g = Decl::function("g", Type::pointer(Type::Int), vec![]);

        // *p; p = g(); if (p) ...
        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&p)));
        disp.assignment(
            &mut ctx,
            &Expr::assign(Expr::symbol(&p), Expr::call(Expr::symbol(&g), vec![])),
        );
        disp.condition(&mut ctx, &Expr::symbol(&p));
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_non_indirection_unops_are_ignored() {
        let (mut ctx, disp) = setup();
        let p = int_ptr_local("p");

        disp.dereference(&mut ctx, &Expr::addr_of(Expr::symbol(&p)));
        disp.condition(&mut ctx, &Expr::symbol(&p));
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_shadowed_pointer_is_tracked_separately() {
        let (mut ctx, disp) = setup();
        let outer = int_ptr_local("p");
        let inner = int_ptr_local("p");

        disp.dereference(&mut ctx, &Expr::deref(Expr::symbol(&outer)));
        // checking the shadowing declaration is a different location
        disp.condition(&mut ctx, &Expr::symbol(&inner));
        assert!(ctx.diagnostics().is_empty());

        disp.condition(&mut ctx, &Expr::symbol(&outer));
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn test_member_location_round_trip() {
        let (mut ctx, disp) = setup();
        let s = Decl::local("s", Type::pointer(Type::Struct { name: Some("foo".into()) }));

        let member = Expr::arrow(Expr::symbol(&s), "ptr");
        disp.dereference(&mut ctx, &Expr::deref(member.clone()));
        disp.condition(&mut ctx, &member);
        assert_eq!(ctx.diagnostics().len(), 1);
        assert_eq!(
            ctx.diagnostics()[0].message,
            "variable dereferenced before check 's->ptr'"
        );
    }
}
