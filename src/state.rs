//! Per-checker, per-location symbolic state.
//!
//! The store maps (checker, canonical name, declaration) triples to opaque
//! state tags. Reads never fail: an absent entry yields the checker's
//! registered default, or the global `UNDEFINED` sentinel. States compare by
//! tag, so checkers can use cheap `state == SAFE` comparisons; no structural
//! payload comparison exists.

use std::collections::HashMap;
use std::fmt;

use crate::ast::{DeclId, Expr};
use crate::canon;

/// An opaque, checker-defined state tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State(&'static str);

impl State {
    pub const fn new(tag: &'static str) -> State {
        State(tag)
    }

    pub fn tag(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Sentinel for "no state was ever set and no default registered".
pub const UNDEFINED: State = State::new("undefined");

/// Handle issued by [`StateStore::register_checker`]. The only way to obtain
/// one is to register, so reads against an unregistered checker cannot be
/// expressed at all - misuse is rejected before traversal starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckerId(usize);

/// A checker identity was registered twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError {
    pub name: String,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checker '{}' is already registered", self.name)
    }
}

impl std::error::Error for RegistryError {}

impl miette::Diagnostic for RegistryError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new("ptrflow::state::duplicate_checker"))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new("register each checker exactly once per analysis context"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    checker: CheckerId,
    name: String,
    decl: Option<DeclId>,
}

#[derive(Debug, Clone)]
struct CheckerInfo {
    name: &'static str,
    default: Option<State>,
}

/// The per-function state map shared by every registered checker, partitioned
/// by checker id so checkers cannot observe one another's entries.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    checkers: Vec<CheckerInfo>,
    entries: HashMap<StateKey, State>,
    /// Narrowing recorded at a condition point, waiting for the walker to
    /// commit whichever branch it enters.
    pending_branch: Vec<(StateKey, State, State)>,
    scopes: Vec<Vec<StateKey>>,
}

impl StateStore {
    pub fn new() -> StateStore {
        StateStore::default()
    }

    pub fn register_checker(&mut self, name: &'static str) -> Result<CheckerId, RegistryError> {
        if self.checkers.iter().any(|c| c.name == name) {
            return Err(RegistryError { name: name.to_string() });
        }
        self.checkers.push(CheckerInfo { name, default: None });
        Ok(CheckerId(self.checkers.len() - 1))
    }

    pub fn checker_name(&self, checker: CheckerId) -> &'static str {
        self.checkers[checker.0].name
    }

    /// State assumed for any location the checker never wrote.
    pub fn set_default(&mut self, checker: CheckerId, state: State) {
        self.checkers[checker.0].default = Some(state);
    }

    pub fn default_state(&self, checker: CheckerId) -> State {
        self.checkers[checker.0].default.unwrap_or(UNDEFINED)
    }

    pub fn set(&mut self, checker: CheckerId, name: &str, decl: Option<DeclId>, state: State) {
        self.entries.insert(key(checker, name, decl), state);
    }

    pub fn get(&self, checker: CheckerId, name: &str, decl: Option<DeclId>) -> State {
        self.entries
            .get(&key(checker, name, decl))
            .copied()
            .unwrap_or_else(|| self.default_state(checker))
    }

    pub fn delete(&mut self, checker: CheckerId, name: &str, decl: Option<DeclId>) {
        self.entries.remove(&key(checker, name, decl));
    }

    /// Record two-way narrowing at a condition evaluation point. Nothing
    /// changes until the walker commits a branch.
    pub fn set_on_branch(
        &mut self,
        checker: CheckerId,
        name: &str,
        decl: Option<DeclId>,
        true_state: State,
        false_state: State,
    ) {
        self.pending_branch.push((key(checker, name, decl), true_state, false_state));
    }

    /// Commit the narrowing recorded for the branch the walker entered.
    pub fn apply_branch(&mut self, cond_true: bool) {
        for (entry_key, true_state, false_state) in std::mem::take(&mut self.pending_branch) {
            let state = if cond_true { true_state } else { false_state };
            self.entries.insert(entry_key, state);
        }
    }

    /// Drop narrowing without committing either side.
    pub fn discard_branch(&mut self) {
        self.pending_branch.clear();
    }

    /// Enter a lexical scope. Locations bound afterwards die with it.
    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Register removal of the entry when the nearest enclosing scope exits.
    /// With no open scope the entry simply lives until `clear_function`.
    pub fn bind_scope(&mut self, checker: CheckerId, name: &str, decl: Option<DeclId>) {
        if let Some(frame) = self.scopes.last_mut() {
            frame.push(key(checker, name, decl));
        }
    }

    /// Leave a lexical scope, deleting every entry bound to it. A binding for
    /// a location that was never written is expected and ignored.
    pub fn pop_scope(&mut self) {
        if let Some(frame) = self.scopes.pop() {
            for entry_key in frame {
                self.entries.remove(&entry_key);
            }
        }
    }

    /// Forget everything at the end of a function's traversal.
    pub fn clear_function(&mut self) {
        self.entries.clear();
        self.pending_branch.clear();
        self.scopes.clear();
    }

    /// Drop chunk-keyed entries (no declaration handle) that mention the
    /// touched name. Chunks only persist within one flow segment; any write
    /// that could alias them kills them.
    pub fn invalidate_chunks(&mut self, touched: &str) {
        self.entries
            .retain(|entry, _| entry.decl.is_some() || !chunk_mentions(&entry.name, touched));
    }

    /// Drop every chunk-keyed entry; used when a write's target is unknown.
    pub fn invalidate_all_chunks(&mut self) {
        self.entries.retain(|entry, _| entry.decl.is_some());
    }

    /// Set state for the location an expression canonicalizes to, if any.
    pub fn set_expr(&mut self, checker: CheckerId, expr: &Expr, state: State) {
        let expr = canon::strip_expr(expr);
        if let Some((name, decl)) = canon::expr_to_chunk_sym(expr) {
            self.set(checker, &name, decl.map(|d| d.id), state);
        }
    }

    pub fn get_expr(&self, checker: CheckerId, expr: &Expr) -> State {
        let expr = canon::strip_expr(expr);
        match canon::expr_to_chunk_sym(expr) {
            Some((name, decl)) => self.get(checker, &name, decl.map(|d| d.id)),
            None => self.default_state(checker),
        }
    }

    pub fn set_on_branch_expr(
        &mut self,
        checker: CheckerId,
        expr: &Expr,
        true_state: State,
        false_state: State,
    ) {
        let expr = canon::strip_expr(expr);
        if let Some((name, decl)) = canon::expr_to_chunk_sym(expr) {
            self.set_on_branch(checker, &name, decl.map(|d| d.id), true_state, false_state);
        }
    }
}

fn key(checker: CheckerId, name: &str, decl: Option<DeclId>) -> StateKey {
    StateKey { checker, name: name.to_string(), decl }
}

// Whole-token scan: a write to `p` aliases the chunk `p + 1` but not `ptr`.
fn chunk_mentions(chunk: &str, touched: &str) -> bool {
    chunk
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|token| token == touched)
}
