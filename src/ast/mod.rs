//! Typed source trees handed over by the front end.
//!
//! The parser and control-flow walker live outside this crate; they deliver
//! already-typed expression trees plus declaration handles, and this module
//! defines the shape of that hand-off. The node kinds form a closed sum type:
//! anything the canonicalizer does not recognize degrades to the conservative
//! "too complex to track" outcome rather than being treated as a location.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// A source position: translation-unit stream id, line, and column.
///
/// Totally ordered so callers can pick the "current" statement between two
/// candidates when one originates from macro expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Position {
    pub stream: u32,
    pub line: u32,
    pub col: u32,
}

impl Position {
    pub fn new(stream: u32, line: u32, col: u32) -> Position {
        Position { stream, line, col }
    }

    /// Position on a given line of the main translation unit.
    pub fn line(line: u32) -> Position {
        Position { stream: 0, line, col: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Resolved type of an expression or declaration.
///
/// Only the distinctions the checkers care about are modeled: pointer-ness,
/// array-ness, the settable "safe" qualifier bit on pointers, and enough
/// structure to render member chains and sizeof values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Char,
    Int,
    Struct { name: Option<String> },
    Union { name: Option<String> },
    Pointer { base: Box<Type>, safe: bool },
    Array { elem: Box<Type>, len: Option<u64> },
    Function { ret: Box<Type>, params: Vec<Type> },
}

impl Type {
    pub fn pointer(base: Type) -> Type {
        Type::Pointer { base: Box::new(base), safe: false }
    }

    /// A pointer carrying the "safe" qualifier: never dereferenceable-but-
    /// invalid without being checked.
    pub fn safe_pointer(base: Type) -> Type {
        Type::Pointer { base: Box::new(base), safe: true }
    }

    pub fn array(elem: Type, len: Option<u64>) -> Type {
        Type::Array { elem: Box::new(elem), len }
    }

    pub fn function(ret: Type, params: Vec<Type>) -> Type {
        Type::Function { ret: Box::new(ret), params }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer { .. })
    }

    pub fn is_safe_ptr(&self) -> bool {
        matches!(self, Type::Pointer { safe: true, .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    /// Set or clear the safe qualifier. No-op on non-pointer types.
    pub fn set_safe(&mut self, is_safe: bool) {
        if let Type::Pointer { safe, .. } = self {
            *safe = is_safe;
        }
    }

    /// Pointee of a pointer, element of an array, return type of a function.
    pub fn target(&self) -> Option<&Type> {
        match self {
            Type::Pointer { base, .. } => Some(base),
            Type::Array { elem, .. } => Some(elem),
            Type::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }

    /// Size in bytes when statically known (used for sizeof rendering).
    pub fn byte_size(&self) -> Option<u64> {
        match self {
            Type::Char => Some(1),
            Type::Int => Some(4),
            Type::Pointer { .. } => Some(8),
            Type::Array { elem, len: Some(n) } => elem.byte_size().map(|e| e * n),
            _ => None,
        }
    }
}

/// Identity of a declaration. Two syntactically identical names that resolve
/// to different declarations (shadowing) get different ids and therefore
/// never share a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeclId(u32);

/// A resolved declaration handle from the front end.
#[derive(Debug)]
pub struct Decl {
    pub id: DeclId,
    pub name: String,
    pub ty: Type,
    /// Locals (including parameters) are the only symbols cheap enough to
    /// admit into tracked chunks.
    pub local: bool,
}

impl Decl {
    fn alloc(name: &str, ty: Type, local: bool) -> Rc<Decl> {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Rc::new(Decl {
            id: DeclId(NEXT.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            ty,
            local,
        })
    }

    pub fn local(name: &str, ty: Type) -> Rc<Decl> {
        Decl::alloc(name, ty, true)
    }

    pub fn global(name: &str, ty: Type) -> Rc<Decl> {
        Decl::alloc(name, ty, false)
    }

    pub fn function(name: &str, ret: Type, params: Vec<Type>) -> Rc<Decl> {
        Decl::alloc(name, Type::function(ret, params), false)
    }

    /// Return type when this declares a function.
    pub fn return_type(&self) -> Option<&Type> {
        match &self.ty {
            Type::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Deref,
    AddressOf,
    Paren,
    Neg,
    BitNot,
    LogicalNot,
    Inc,
    Dec,
}

impl UnOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnOp::Deref => "*",
            UnOp::AddressOf => "&",
            UnOp::Paren => "(",
            UnOp::Neg => "-",
            UnOp::BitNot => "~",
            UnOp::LogicalNot => "!",
            UnOp::Inc => "++",
            UnOp::Dec => "--",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    And,
    Or,
}

impl LogOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOp::And => "&&",
            LogOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,
}

impl AssignOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::AddAssign => "+=",
            AssignOp::SubAssign => "-=",
            AssignOp::MulAssign => "*=",
            AssignOp::DivAssign => "/=",
            AssignOp::ModAssign => "%=",
            AssignOp::AndAssign => "&=",
            AssignOp::OrAssign => "|=",
            AssignOp::XorAssign => "^=",
            AssignOp::ShlAssign => "<<=",
            AssignOp::ShrAssign => ">>=",
        }
    }
}

/// One node of the typed expression tree.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    /// Resolved type, when the front end knows it.
    pub ty: Option<Type>,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Identifier reference, resolved to a declaration when possible.
    Symbol { name: String, decl: Option<Rc<Decl>> },
    /// Member access. An arrow access `a->b` carries `base = *a` (a `Deref`
    /// unary); a dot access `s.b` carries the aggregate directly.
    Member { base: Box<Expr>, member: Option<String> },
    Preop { op: UnOp, operand: Box<Expr> },
    Postop { op: UnOp, operand: Box<Expr> },
    Binop { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    Logical { op: LogOp, left: Box<Expr>, right: Box<Expr> },
    /// `fake` marks assignments the walker synthesizes while modeling
    /// aliasing (e.g. the write to `*a->foo` implied by assigning to `a`);
    /// real-write rules must skip them.
    Assign { op: AssignOp, left: Box<Expr>, right: Box<Expr>, fake: bool },
    Call { func: Box<Expr>, args: Vec<Expr> },
    Cast { operand: Box<Expr> },
    Value { value: i64 },
    Str { value: String },
    /// GNU `?:` with an optionally elided middle operand.
    Conditional { cond: Box<Expr>, if_true: Option<Box<Expr>>, if_false: Box<Expr> },
    /// GCC statement-expression `({ ...; v; })`. The statements stay with the
    /// walker; the core only ever refuses to canonicalize these.
    StmtExpr,
    SizeOf { ty: Type },
}

impl Expr {
    pub fn new(kind: ExprKind) -> Expr {
        Expr { kind, ty: None, pos: Position::default() }
    }

    pub fn with_ty(mut self, ty: Type) -> Expr {
        self.ty = Some(ty);
        self
    }

    pub fn at(mut self, pos: Position) -> Expr {
        self.pos = pos;
        self
    }

    pub fn at_line(mut self, line: u32) -> Expr {
        self.pos = Position::line(line);
        self
    }

    /// Reference to a resolved declaration; the type comes along for free.
    pub fn symbol(decl: &Rc<Decl>) -> Expr {
        Expr {
            kind: ExprKind::Symbol { name: decl.name.clone(), decl: Some(decl.clone()) },
            ty: Some(decl.ty.clone()),
            pos: Position::default(),
        }
    }

    /// Reference to a name the front end could not resolve.
    pub fn unresolved(name: &str) -> Expr {
        Expr::new(ExprKind::Symbol { name: name.to_string(), decl: None })
    }

    pub fn deref(operand: Expr) -> Expr {
        let pos = operand.pos;
        let ty = operand.real_type().and_then(Type::target).cloned();
        Expr {
            kind: ExprKind::Preop { op: UnOp::Deref, operand: Box::new(operand) },
            ty,
            pos,
        }
    }

    pub fn addr_of(operand: Expr) -> Expr {
        let pos = operand.pos;
        let ty = operand.real_type().cloned().map(Type::pointer);
        Expr {
            kind: ExprKind::Preop { op: UnOp::AddressOf, operand: Box::new(operand) },
            ty,
            pos,
        }
    }

    pub fn paren(operand: Expr) -> Expr {
        let pos = operand.pos;
        let ty = operand.ty.clone();
        Expr {
            kind: ExprKind::Preop { op: UnOp::Paren, operand: Box::new(operand) },
            ty,
            pos,
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        let pos = operand.pos;
        Expr { kind: ExprKind::Preop { op, operand: Box::new(operand) }, ty: None, pos }
    }

    pub fn postop(op: UnOp, operand: Expr) -> Expr {
        let pos = operand.pos;
        Expr { kind: ExprKind::Postop { op, operand: Box::new(operand) }, ty: None, pos }
    }

    /// Dot access `base.member`.
    pub fn dot(base: Expr, member: &str) -> Expr {
        let pos = base.pos;
        Expr {
            kind: ExprKind::Member { base: Box::new(base), member: Some(member.to_string()) },
            ty: None,
            pos,
        }
    }

    /// Arrow access `base->member`, modeled as `(*base).member`.
    pub fn arrow(base: Expr, member: &str) -> Expr {
        Expr::dot(Expr::deref(base), member)
    }

    pub fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
        let pos = left.pos;
        Expr {
            kind: ExprKind::Binop { op, left: Box::new(left), right: Box::new(right) },
            ty: None,
            pos,
        }
    }

    pub fn compare(op: CmpOp, left: Expr, right: Expr) -> Expr {
        let pos = left.pos;
        Expr {
            kind: ExprKind::Compare { op, left: Box::new(left), right: Box::new(right) },
            ty: Some(Type::Int),
            pos,
        }
    }

    pub fn logical(op: LogOp, left: Expr, right: Expr) -> Expr {
        let pos = left.pos;
        Expr {
            kind: ExprKind::Logical { op, left: Box::new(left), right: Box::new(right) },
            ty: Some(Type::Int),
            pos,
        }
    }

    /// Plain assignment `left = right`.
    pub fn assign(left: Expr, right: Expr) -> Expr {
        Expr::assign_op(AssignOp::Assign, left, right)
    }

    pub fn assign_op(op: AssignOp, left: Expr, right: Expr) -> Expr {
        let pos = left.pos;
        let ty = left.real_type().cloned();
        Expr {
            kind: ExprKind::Assign { op, left: Box::new(left), right: Box::new(right), fake: false },
            ty,
            pos,
        }
    }

    /// Walker-synthesized aliasing assignment.
    pub fn fake_assign(left: Expr, right: Expr) -> Expr {
        let mut expr = Expr::assign(left, right);
        if let ExprKind::Assign { fake, .. } = &mut expr.kind {
            *fake = true;
        }
        expr
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        let pos = func.pos;
        let ty = func.real_type().and_then(Type::target).cloned();
        Expr {
            kind: ExprKind::Call { func: Box::new(func), args },
            ty,
            pos,
        }
    }

    /// Cast to `ty`. Casts are canonically transparent.
    pub fn cast(ty: Type, operand: Expr) -> Expr {
        let pos = operand.pos;
        Expr {
            kind: ExprKind::Cast { operand: Box::new(operand) },
            ty: Some(ty),
            pos,
        }
    }

    pub fn value(value: i64) -> Expr {
        Expr::new(ExprKind::Value { value }).with_ty(Type::Int)
    }

    pub fn string(value: &str) -> Expr {
        Expr::new(ExprKind::Str { value: value.to_string() })
            .with_ty(Type::array(Type::Char, Some(value.len() as u64 + 1)))
    }

    pub fn conditional(cond: Expr, if_true: Option<Expr>, if_false: Expr) -> Expr {
        let pos = cond.pos;
        let ty = if_false.ty.clone();
        Expr {
            kind: ExprKind::Conditional {
                cond: Box::new(cond),
                if_true: if_true.map(Box::new),
                if_false: Box::new(if_false),
            },
            ty,
            pos,
        }
    }

    pub fn stmt_expr() -> Expr {
        Expr::new(ExprKind::StmtExpr)
    }

    pub fn sizeof(ty: Type) -> Expr {
        Expr::new(ExprKind::SizeOf { ty }).with_ty(Type::Int)
    }

    /// Resolved type of this node, falling back to the declaration's type for
    /// bare symbol references.
    pub fn real_type(&self) -> Option<&Type> {
        if let Some(ty) = &self.ty {
            return Some(ty);
        }
        match &self.kind {
            ExprKind::Symbol { decl: Some(decl), .. } => Some(&decl.ty),
            _ => None,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.real_type().is_some_and(Type::is_pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decl_ids_are_unique() {
        let a = Decl::local("x", Type::Int);
        let b = Decl::local("x", Type::Int);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_position_ordering() {
        let early = Position::new(0, 3, 1);
        let late = Position::new(0, 7, 1);
        assert!(early < late);
        assert!(Position::new(0, 3, 9) > early);
        assert!(Position::new(1, 1, 1) > late);
    }

    #[test]
    fn test_safe_qualifier_is_settable() {
        let mut ty = Type::pointer(Type::Int);
        assert!(!ty.is_safe_ptr());
        ty.set_safe(true);
        assert!(ty.is_safe_ptr());
        let mut not_ptr = Type::Int;
        not_ptr.set_safe(true);
        assert!(!not_ptr.is_safe_ptr());
    }

    #[test]
    fn test_deref_takes_pointee_type() {
        let p = Decl::local("p", Type::pointer(Type::Int));
        let deref = Expr::deref(Expr::symbol(&p));
        assert_eq!(deref.real_type(), Some(&Type::Int));
    }

    #[test]
    fn test_call_takes_return_type() {
        let f = Decl::function("f", Type::pointer(Type::Int), vec![]);
        let call = Expr::call(Expr::symbol(&f), vec![]);
        assert!(call.is_pointer());
    }

    #[test]
    fn test_sizeof_byte_sizes() {
        assert_eq!(Type::Char.byte_size(), Some(1));
        assert_eq!(Type::pointer(Type::Void).byte_size(), Some(8));
        assert_eq!(Type::array(Type::Int, Some(3)).byte_size(), Some(12));
        assert_eq!(Type::Struct { name: None }.byte_size(), None);
    }
}
