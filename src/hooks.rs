//! Event dispatch and the per-traversal analysis context.
//!
//! The external control-flow walker visits one function at a time in
//! execution order and fires these events as it goes. Subscribers run
//! synchronously, in registration order, to completion; no event is buffered,
//! redelivered, or reordered. Branch divergence is the walker's problem - the
//! core only sees the merged state, plus the explicit two-way narrowing point
//! in the state store.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Decl, Expr, ExprKind, Position};
use crate::canon;
use crate::debug_println;
use crate::diagnostics::Diagnostic;
use crate::oracle::{NullOracle, Oracle};
use crate::state::StateStore;

pub type ExprHook = Box<dyn Fn(&mut AnalysisCtx, &Expr)>;
pub type ReturnHook = Box<dyn Fn(&mut AnalysisCtx, Option<&Expr>)>;
pub type FuncEndHook = Box<dyn Fn(&mut AnalysisCtx, &Rc<Decl>)>;
/// Called with the canonical name that was written, the declaration behind
/// it when known, and the expression that performed the write.
pub type ModificationHook = Rc<dyn Fn(&mut AnalysisCtx, &str, Option<&Rc<Decl>>, &Expr)>;

/// Registry of subscriber lists, one FIFO list per event kind. The checker
/// set is fixed before traversal begins; modification hooks are the only
/// subscriptions that come and go mid-flight, and those live on the context.
#[derive(Default)]
pub struct Dispatcher {
    deref: Vec<ExprHook>,
    assign: Vec<ExprHook>,
    call: Vec<ExprHook>,
    ret: Vec<ReturnHook>,
    func_end: Vec<FuncEndHook>,
    condition: Vec<ExprHook>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn add_deref_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, &Expr) + 'static) {
        self.deref.push(Box::new(hook));
    }

    pub fn add_assign_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, &Expr) + 'static) {
        self.assign.push(Box::new(hook));
    }

    pub fn add_call_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, &Expr) + 'static) {
        self.call.push(Box::new(hook));
    }

    pub fn add_return_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, Option<&Expr>) + 'static) {
        self.ret.push(Box::new(hook));
    }

    pub fn add_func_end_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, &Rc<Decl>) + 'static) {
        self.func_end.push(Box::new(hook));
    }

    pub fn add_condition_hook(&mut self, hook: impl Fn(&mut AnalysisCtx, &Expr) + 'static) {
        self.condition.push(Box::new(hook));
    }

    /// The walker hit a pointer indirection.
    pub fn dereference(&self, ctx: &mut AnalysisCtx, expr: &Expr) {
        ctx.set_position(expr.pos);
        for hook in &self.deref {
            hook(ctx, expr);
        }
    }

    /// The walker hit an assignment-like operator. After the subscribers run,
    /// modification hooks fire for the written location; a write through an
    /// untrackable left side conservatively counts as a write to everything.
    pub fn assignment(&self, ctx: &mut AnalysisCtx, expr: &Expr) {
        ctx.set_position(expr.pos);
        for hook in &self.assign {
            hook(ctx, expr);
        }
        if let ExprKind::Assign { left, .. } = &expr.kind {
            match canon::expr_to_var_sym(left) {
                Some((name, decl)) => ctx.modified(&name, decl.as_ref(), expr),
                None => ctx.modified_all(expr),
            }
        }
    }

    pub fn call(&self, ctx: &mut AnalysisCtx, expr: &Expr) {
        ctx.set_position(expr.pos);
        for hook in &self.call {
            hook(ctx, expr);
        }
    }

    pub fn return_stmt(&self, ctx: &mut AnalysisCtx, value: Option<&Expr>) {
        if let Some(value) = value {
            ctx.set_position(value.pos);
        }
        for hook in &self.ret {
            hook(ctx, value);
        }
    }

    pub fn condition(&self, ctx: &mut AnalysisCtx, expr: &Expr) {
        ctx.set_position(expr.pos);
        for hook in &self.condition {
            hook(ctx, expr);
        }
    }

    /// Fired once per function body, after all statements. Clears the
    /// per-function context afterwards.
    pub fn function_end(&self, ctx: &mut AnalysisCtx, func: &Rc<Decl>) {
        for hook in &self.func_end {
            hook(ctx, func);
        }
        ctx.end_function();
    }
}

/// Everything one function's traversal is allowed to touch: the state store,
/// the oracle, the diagnostic sink, position bookkeeping, and the walker
/// flags for synthesized assignments and inline expansion.
pub struct AnalysisCtx {
    pub states: StateStore,
    oracle: Rc<dyn Oracle>,
    diagnostics: Vec<Diagnostic>,
    mod_hooks: HashMap<String, Vec<ModificationHook>>,
    stmt_positions: Vec<Position>,
    cur_pos: Position,
    cur_func: Option<Rc<Decl>>,
    /// Set by the walker around assignments it synthesizes while modeling
    /// address-taken aliasing; real-write rules skip those.
    pub in_fake_assign: bool,
    /// Set by the walker while replaying an inline-expanded body.
    pub in_inline_fn: bool,
}

impl AnalysisCtx {
    pub fn new() -> AnalysisCtx {
        AnalysisCtx::with_oracle(Rc::new(NullOracle))
    }

    pub fn with_oracle(oracle: Rc<dyn Oracle>) -> AnalysisCtx {
        AnalysisCtx {
            states: StateStore::new(),
            oracle,
            diagnostics: Vec::new(),
            mod_hooks: HashMap::new(),
            stmt_positions: Vec::new(),
            cur_pos: Position::default(),
            cur_func: None,
            in_fake_assign: false,
            in_inline_fn: false,
        }
    }

    pub fn oracle(&self) -> &dyn Oracle {
        &*self.oracle
    }

    /// Report one finding, attributed to the current source position. Never
    /// fails and never halts traversal.
    pub fn emit(&mut self, message: impl Into<String>) {
        let pos = self.report_position();
        self.diagnostics.push(Diagnostic::warning(message, pos));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn set_position(&mut self, pos: Position) {
        self.cur_pos = pos;
    }

    pub fn position(&self) -> Position {
        self.cur_pos
    }

    /// The walker pushes each statement's position as it enters it.
    pub fn push_statement(&mut self, pos: Position) {
        self.stmt_positions.push(pos);
    }

    pub fn pop_statement(&mut self) {
        self.stmt_positions.pop();
    }

    /// The statement diagnostics should be attributed to. When the innermost
    /// statement came purely from macro expansion, fall back to the nearest
    /// enclosing statement that starts on an earlier line.
    pub fn current_statement(&self) -> Option<Position> {
        let last = *self.stmt_positions.last()?;
        if self.oracle.macro_name(last).is_none() {
            return Some(last);
        }
        for candidate in self.stmt_positions.iter().rev() {
            if *candidate == last {
                continue;
            }
            if last.line > candidate.line {
                return Some(last);
            }
            return Some(*candidate);
        }
        Some(last)
    }

    fn report_position(&self) -> Position {
        if self.oracle.macro_name(self.cur_pos).is_none() {
            return self.cur_pos;
        }
        self.current_statement().unwrap_or(self.cur_pos)
    }

    pub fn begin_function(&mut self, func: Rc<Decl>) {
        self.cur_func = Some(func);
    }

    pub fn current_function(&self) -> Option<&Rc<Decl>> {
        self.cur_func.as_ref()
    }

    /// Subscribe to writes against a canonical location name. Registration
    /// happens mid-traversal (typically from inside another hook) and lasts
    /// until the function ends.
    pub fn add_modification_hook(
        &mut self,
        name: &str,
        hook: impl Fn(&mut AnalysisCtx, &str, Option<&Rc<Decl>>, &Expr) + 'static,
    ) {
        self.mod_hooks.entry(name.to_string()).or_default().push(Rc::new(hook));
    }

    /// A tracked location (or something aliasing it) was written. Runs the
    /// subscribers for that name, then drops chunk entries the write could
    /// alias.
    pub fn modified(&mut self, name: &str, decl: Option<&Rc<Decl>>, expr: &Expr) {
        if let Some(hooks) = self.mod_hooks.get(name).cloned() {
            for hook in hooks {
                hook(self, name, decl, expr);
            }
        }
        self.states.invalidate_chunks(name);
    }

    /// A write landed somewhere we cannot name. Every subscriber runs and
    /// every chunk entry dies.
    pub fn modified_all(&mut self, expr: &Expr) {
        debug_println!("DEBUG: untrackable write, invalidating all chunks");
        let all: Vec<(String, ModificationHook)> = self
            .mod_hooks
            .iter()
            .flat_map(|(name, hooks)| hooks.iter().map(|h| (name.clone(), h.clone())))
            .collect();
        for (name, hook) in all {
            hook(self, &name, None, expr);
        }
        self.states.invalidate_all_chunks();
    }

    pub(crate) fn end_function(&mut self) {
        self.states.clear_function();
        self.mod_hooks.clear();
        self.stmt_positions.clear();
        self.cur_func = None;
        self.in_fake_assign = false;
        self.in_inline_fn = false;
    }
}

impl Default for AnalysisCtx {
    fn default() -> AnalysisCtx {
        AnalysisCtx::new()
    }
}
