//! Abstract syntax tree for SafeC.
//!
//! Nodes are closed sums owned by their parent declaration, which is owned
//! by the [`TranslationUnit`]. Annotation fields (`ty`, `is_lvalue`,
//! `const_result`, `resolved_operator`, `method_base`, `bounds_check_omit`)
//! start empty and are filled by the semantic analyzer and the compile-time
//! engine; the backend relies on them being populated.

use crate::diagnostics::SourceLoc;
use crate::types::{Region, TypeRef};
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct TranslationUnit {
    pub decls: Vec<Decl>,
}

impl TranslationUnit {
    pub fn new() -> Self {
        TranslationUnit { decls: Vec::new() }
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }
}

// ============================================================================
//                              DECLARATIONS
// ============================================================================

#[derive(Debug, Clone)]
pub enum Decl {
    Function(FunctionDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Region(RegionDecl),
    Typedef(TypedefDecl),
    Global(GlobalDecl),
    StaticAssert(StaticAssertDecl),
}

impl Decl {
    pub fn loc(&self) -> &SourceLoc {
        match self {
            Decl::Function(d) => &d.loc,
            Decl::Struct(d) => &d.loc,
            Decl::Enum(d) => &d.loc,
            Decl::Region(d) => &d.loc,
            Decl::Typedef(d) => &d.loc,
            Decl::Global(d) => &d.loc,
            Decl::StaticAssert(d) => &d.loc,
        }
    }
}

/// Function qualifier flags, in source order before the return type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnFlags {
    pub is_const: bool,
    pub is_consteval: bool,
    pub is_inline: bool,
    pub is_extern: bool,
    pub is_static: bool,
    pub must_use: bool,
    /// Set for `Owner::name` declarations; `owner` carries the struct name.
    pub is_method: bool,
    /// A `const` method takes an immutable `self`.
    pub const_method: bool,
}

#[derive(Debug, Clone)]
pub struct GenericParam {
    pub name: String,
    pub constraint: Option<String>,
    /// `T...`, a type pack, expanded per call site.
    pub is_pack: bool,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: TypeRef,
    pub generic_params: Vec<GenericParam>,
    pub flags: FnFlags,
    pub variadic: bool,
    /// Owning struct name for methods.
    pub owner: Option<String>,
    pub body: Option<Stmt>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub is_union: bool,
    pub packed: bool,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    pub name: String,
    /// Explicit values stay as expressions until the analyzer folds them.
    pub variants: Vec<(String, Option<Expr>)>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct RegionDecl {
    pub name: String,
    pub capacity: Option<Expr>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct TypedefDecl {
    pub name: String,
    pub ty: TypeRef,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub declared_ty: TypeRef,
    /// Resolved type after analysis (typeof folded, named types looked up).
    pub ty: Option<TypeRef>,
    pub init: Option<Expr>,
    pub is_const: bool,
    pub is_static: bool,
    pub is_extern: bool,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct StaticAssertDecl {
    pub cond: Expr,
    pub message: String,
    pub loc: SourceLoc,
}

// ============================================================================
//                               STATEMENTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLoc,
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: SourceLoc) -> Self {
        Stmt { kind, loc }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Compound(Vec<Stmt>),
    Expr(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        /// True for `if const`.
        is_const: bool,
        /// Filled by the compile-time engine for `if const`; `None` means
        /// the branch falls back to a runtime test.
        const_result: Option<bool>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
        label: Option<String>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
        label: Option<String>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
        label: Option<String>,
    },
    Return(Option<Expr>),
    Break(Option<String>),
    Continue(Option<String>),
    Goto(String),
    Label {
        name: String,
        stmt: Box<Stmt>,
    },
    Var(VarDecl),
    Unsafe(Box<Stmt>),
    Defer(Box<Stmt>),
    Errdefer(Box<Stmt>),
    Match {
        subject: Expr,
        arms: Vec<MatchArm>,
    },
    StaticAssert {
        cond: Expr,
        message: String,
    },
    Empty,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub declared_ty: TypeRef,
    /// Resolved type after analysis.
    pub ty: Option<TypeRef>,
    pub init: Option<Expr>,
    pub is_const: bool,
    pub is_static: bool,
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    /// Empty for the `default:` arm.
    pub patterns: Vec<Pattern>,
    pub body: Stmt,
    pub is_default: bool,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard,
    Int(i64),
    /// Inclusive range `lo ... hi`.
    Range(i64, i64),
    Char(char),
    Variant {
        name: String,
        binding: Option<String>,
    },
}

// ============================================================================
//                              EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLoc,
    /// Resolved type; filled by the analyzer. The `Error` type is legal
    /// here and suppresses cascading diagnostics.
    pub ty: Option<TypeRef>,
    pub is_lvalue: bool,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: SourceLoc) -> Self {
        Expr {
            kind,
            loc,
            ty: None,
            is_lvalue: false,
        }
    }

    /// A plain `int`-typed literal; used when folding constants.
    pub fn int_lit(value: i64, loc: SourceLoc) -> Self {
        Expr::new(
            ExprKind::IntLit {
                value: value as u64,
                unsigned: false,
                long_long: false,
            },
            loc,
        )
    }
}

/// Unary operators. `AddrOf` and `Deref` are tagged variants distinct from
/// `Neg`/`Not` so clones and the backend can tell them apart without
/// re-inspecting token text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    AddrOf,
    Deref,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Eq | Ne | Lt | Gt | Le | Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogAnd | BinaryOp::LogOr)
    }

    /// Surface token, also used to form operator-method names
    /// (`operator+`).
    pub fn token(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Rem => "%",
            BitAnd => "&",
            BitOr => "|",
            BitXor => "^",
            Shl => "<<",
            Shr => ">>",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Gt => ">",
            Le => "<=",
            Ge => ">=",
            LogAnd => "&&",
            LogOr => "||",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl AssignOp {
    /// The arithmetic operator a compound assignment applies, if any.
    pub fn binary_op(self) -> Option<BinaryOp> {
        use AssignOp::*;
        let op = match self {
            Assign => return None,
            Add => BinaryOp::Add,
            Sub => BinaryOp::Sub,
            Mul => BinaryOp::Mul,
            Div => BinaryOp::Div,
            Rem => BinaryOp::Rem,
            BitAnd => BinaryOp::BitAnd,
            BitOr => BinaryOp::BitOr,
            BitXor => BinaryOp::BitXor,
            Shl => BinaryOp::Shl,
            Shr => BinaryOp::Shr,
        };
        Some(op)
    }
}

/// What an identifier resolved to during analysis. Cleared when a
/// declaration is cloned for monomorphization so the clone re-resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedIdent {
    Var { scope_depth: usize },
    Fn { name: String },
    EnumConst { value: i64 },
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit {
        value: u64,
        unsigned: bool,
        long_long: bool,
    },
    FloatLit(f64),
    BoolLit(bool),
    CharLit(char),
    StrLit(String),
    NullLit,
    Ident {
        name: String,
        resolved: Option<ResolvedIdent>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        /// Mangled method name when an operator overload was resolved.
        resolved_operator: Option<String>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// The receiver expression for method calls; the backend passes it
        /// as the implicit first argument.
        method_base: Option<Box<Expr>>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        /// Set inside `unsafe` scopes; the backend skips the runtime
        /// bounds check.
        bounds_check_omit: bool,
    },
    Member {
        base: Box<Expr>,
        member: String,
        is_arrow: bool,
    },
    Cast {
        target: TypeRef,
        operand: Box<Expr>,
    },
    CompoundInit(Vec<Expr>),
    TupleLit(Vec<Expr>),
    SizeofType(TypeRef),
    SizeofExpr(Box<Expr>),
    /// `sizeof...(pack)`; replaced by a literal during instantiation.
    SizeofPack(String),
    Alignof(TypeRef),
    FieldCount(TypeRef),
    New {
        region: Region,
        ty: TypeRef,
    },
    ArenaReset(String),
    Spawn {
        func: Box<Expr>,
        arg: Box<Expr>,
    },
    Try(Box<Expr>),
    /// Tagged-union constructor `Union::Variant(value?)`. `tag` is the
    /// resolved variant index, preserved through clones.
    UnionInit {
        union_name: String,
        variant: String,
        value: Option<Box<Expr>>,
        tag: Option<i64>,
    },
}
