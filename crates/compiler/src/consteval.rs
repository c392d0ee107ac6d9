//! Compile-time engine: a tree-walking interpreter over the typed AST.
//!
//! Runs after semantic analysis and does four jobs:
//! 1. evaluates every `static_assert` (top-level and statement-level),
//! 2. folds the initializers of `const` globals into literals,
//! 3. enforces the consteval calling discipline,
//! 4. resolves `if const` conditions to `Some(bool)`.
//!
//! Evaluation runs under fixed budgets (call depth, per-loop iterations,
//! total ticks); blowing one reports an error at the offending location
//! and stops that evaluation.

use crate::ast::*;
use crate::diagnostics::{Diagnostics, SourceLoc};
use crate::types::{Type, TypeRef};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

const MAX_CALL_DEPTH: usize = 256;
const MAX_LOOP_ITERATIONS: u64 = 1_000_000;
const MAX_TICKS: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Void,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ConstValue {
    pub fn truthy(&self) -> bool {
        match self {
            ConstValue::Void => false,
            ConstValue::Int(v) => *v != 0,
            ConstValue::Float(v) => *v != 0.0,
            ConstValue::Bool(v) => *v,
            ConstValue::Str(s) => !s.is_empty(),
        }
    }

    pub fn to_int(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Float(v) => Some(*v as i64),
            ConstValue::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn to_float(&self) -> Option<f64> {
        match self {
            ConstValue::Int(v) => Some(*v as f64),
            ConstValue::Float(v) => Some(*v),
            ConstValue::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Void => write!(f, "void"),
            ConstValue::Int(v) => write!(f, "{}", v),
            ConstValue::Float(v) => write!(f, "{}", v),
            ConstValue::Bool(v) => write!(f, "{}", v),
            ConstValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// An evaluation failure. `budget` failures are always reported; ordinary
/// "not a constant" failures are reported or swallowed depending on the
/// caller (`if const` falls back to a runtime branch).
#[derive(Debug, Clone)]
pub struct EvalError {
    pub loc: SourceLoc,
    pub message: String,
    pub budget: bool,
}

impl EvalError {
    fn new(loc: &SourceLoc, message: impl Into<String>) -> Self {
        EvalError {
            loc: loc.clone(),
            message: message.into(),
            budget: false,
        }
    }

    fn budget(loc: &SourceLoc, message: impl Into<String>) -> Self {
        EvalError {
            loc: loc.clone(),
            message: message.into(),
            budget: true,
        }
    }
}

type EvalResult = Result<ConstValue, EvalError>;

/// One call frame: a stack of block scopes plus the pending return value.
struct Frame {
    scopes: Vec<HashMap<String, ConstValue>>,
    ret: Option<ConstValue>,
    has_return: bool,
}

impl Frame {
    fn new() -> Self {
        Frame {
            scopes: vec![HashMap::new()],
            ret: None,
            has_return: false,
        }
    }

    fn get(&self, name: &str) -> Option<&ConstValue> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn set(&mut self, name: &str, value: ConstValue) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        false
    }

    fn declare(&mut self, name: &str, value: ConstValue) {
        self.scopes
            .last_mut()
            .expect("frame always has a scope")
            .insert(name.to_string(), value);
    }
}

#[derive(Clone)]
struct FnInfo {
    flags: FnFlags,
    decl: FunctionDecl,
    generic: bool,
}

pub struct ConstEval<'a> {
    diags: &'a mut Diagnostics,
    fns: HashMap<String, FnInfo>,
    const_globals: HashMap<String, Expr>,
    global_cache: HashMap<String, ConstValue>,
    evaluating_globals: HashSet<String>,
    frames: Vec<Frame>,
    break_flag: bool,
    continue_flag: bool,
    ticks: u64,
}

impl<'a> ConstEval<'a> {
    pub fn new(diags: &'a mut Diagnostics) -> Self {
        ConstEval {
            diags,
            fns: HashMap::new(),
            const_globals: HashMap::new(),
            global_cache: HashMap::new(),
            evaluating_globals: HashSet::new(),
            frames: Vec::new(),
            break_flag: false,
            continue_flag: false,
            ticks: 0,
        }
    }

    /// Runs the whole compile-time pass over an analyzed unit. Success
    /// means no errors were added.
    pub fn run(&mut self, unit: &mut TranslationUnit) -> bool {
        let errors_before = self.diags.error_count();

        for decl in &unit.decls {
            if let Decl::Function(f) = decl {
                self.fns.insert(
                    f.name.clone(),
                    FnInfo {
                        flags: f.flags,
                        decl: f.clone(),
                        generic: !f.generic_params.is_empty(),
                    },
                );
            }
        }
        for decl in &unit.decls {
            if let Decl::Global(g) = decl
                && g.is_const
                && let Some(init) = &g.init
            {
                self.const_globals.insert(g.name.clone(), init.clone());
            }
        }

        debug!("evaluating static asserts and folding const globals");
        for decl in &mut unit.decls {
            match decl {
                Decl::StaticAssert(sa) => {
                    self.check_static_assert(&sa.cond, &sa.message, &sa.loc);
                }
                Decl::Global(g) if g.is_const => {
                    if let Some(init) = &mut g.init {
                        let ty = g.ty.clone();
                        match self.eval_expr_internal(init) {
                            Ok(value) => {
                                self.global_cache.insert(g.name.clone(), value.clone());
                                *init = folded_literal(&value, init, ty);
                            }
                            Err(e) => self.diags.error(
                                e.loc,
                                format!(
                                    "initializer of const '{}' is not a constant expression: {}",
                                    g.name, e.message
                                ),
                            ),
                        }
                    }
                }
                _ => {}
            }
        }

        debug!("consteval discipline and if-const resolution");
        let names: Vec<String> = self.fns.keys().cloned().collect();
        for name in names {
            let info = self.fns.get(&name).cloned().unwrap();
            if info.generic {
                // Uninstantiated templates never execute; their clones are
                // in the unit under mangled names.
                continue;
            }
            let const_ctx = info.flags.is_const || info.flags.is_consteval;
            // The unit owns the bodies; walk them in place for if-const
            // rewriting.
            for decl in &mut unit.decls {
                if let Decl::Function(f) = decl
                    && f.name == name
                    && f.generic_params.is_empty()
                {
                    let mut body = f.body.take();
                    if let Some(b) = &mut body {
                        self.walk_stmt(b, &name, const_ctx);
                    }
                    f.body = body;
                }
            }
        }

        self.diags.error_count() == errors_before
    }

    /// Public single-expression evaluation for other passes.
    pub fn eval_expr(&mut self, e: &Expr) -> Result<ConstValue, String> {
        self.eval_expr_internal(e).map_err(|err| err.message)
    }

    /// Syntactic constant-expression test; never emits diagnostics.
    pub fn is_const_expr(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::IntLit { .. }
            | ExprKind::FloatLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::CharLit(_)
            | ExprKind::StrLit(_)
            | ExprKind::NullLit
            | ExprKind::SizeofType(_)
            | ExprKind::Alignof(_)
            | ExprKind::FieldCount(_) => true,
            ExprKind::SizeofExpr(_) => true,
            ExprKind::Ident { name, resolved } => {
                matches!(resolved, Some(ResolvedIdent::EnumConst { .. }))
                    || self.const_globals.contains_key(name)
            }
            ExprKind::Unary { op, operand } => {
                matches!(
                    op,
                    UnaryOp::Neg | UnaryOp::Not | UnaryOp::BitNot
                ) && self.is_const_expr(operand)
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.is_const_expr(lhs) && self.is_const_expr(rhs)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.is_const_expr(cond)
                    && self.is_const_expr(then_expr)
                    && self.is_const_expr(else_expr)
            }
            ExprKind::Cast { operand, .. } => self.is_const_expr(operand),
            ExprKind::Call { callee, args, .. } => {
                let callable = match &callee.kind {
                    ExprKind::Ident { name, .. } => self
                        .fns
                        .get(name)
                        .map(|i| i.flags.is_const || i.flags.is_consteval)
                        .unwrap_or(false),
                    _ => false,
                };
                callable && args.iter().all(|a| self.is_const_expr(a))
            }
            _ => false,
        }
    }

    fn check_static_assert(&mut self, cond: &Expr, message: &str, loc: &SourceLoc) {
        match self.eval_expr_internal(cond) {
            Ok(v) => {
                if !v.truthy() {
                    self.diags
                        .error(loc.clone(), format!("static_assert failed: {}", message));
                }
            }
            Err(e) => self.diags.error(
                e.loc,
                format!("static_assert condition is not constant: {}", e.message),
            ),
        }
    }

    // ==================================================================
    // Discipline walk + if-const resolution + statement asserts
    // ==================================================================

    fn walk_stmt(&mut self, stmt: &mut Stmt, fn_name: &str, const_ctx: bool) {
        match &mut stmt.kind {
            StmtKind::Compound(stmts) => {
                for s in stmts {
                    self.walk_stmt(s, fn_name, const_ctx);
                }
            }
            StmtKind::Expr(e) => self.walk_expr(e, fn_name, const_ctx),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
                is_const,
                const_result,
            } => {
                self.walk_expr(cond, fn_name, const_ctx);
                if *is_const {
                    match self.eval_expr_internal(cond) {
                        Ok(v) => *const_result = Some(v.truthy()),
                        Err(e) if e.budget => self.diags.error(e.loc, e.message),
                        // Unresolved: the backend branches at runtime.
                        Err(_) => {}
                    }
                }
                self.walk_stmt(then_branch, fn_name, const_ctx);
                if let Some(e) = else_branch {
                    self.walk_stmt(e, fn_name, const_ctx);
                }
            }
            StmtKind::While { cond, body, .. } => {
                self.walk_expr(cond, fn_name, const_ctx);
                self.walk_stmt(body, fn_name, const_ctx);
            }
            StmtKind::DoWhile { body, cond, .. } => {
                self.walk_stmt(body, fn_name, const_ctx);
                self.walk_expr(cond, fn_name, const_ctx);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                if let Some(s) = init {
                    self.walk_stmt(s, fn_name, const_ctx);
                }
                if let Some(e) = cond {
                    self.walk_expr(e, fn_name, const_ctx);
                }
                if let Some(e) = step {
                    self.walk_expr(e, fn_name, const_ctx);
                }
                self.walk_stmt(body, fn_name, const_ctx);
            }
            StmtKind::Return(value) => {
                if let Some(e) = value {
                    self.walk_expr(e, fn_name, const_ctx);
                }
            }
            StmtKind::Label { stmt, .. } => self.walk_stmt(stmt, fn_name, const_ctx),
            StmtKind::Var(v) => {
                if let Some(e) = &mut v.init {
                    self.walk_expr(e, fn_name, const_ctx);
                }
            }
            StmtKind::Unsafe(body) => {
                if const_ctx {
                    self.diags.error(
                        stmt.loc.clone(),
                        format!("unsafe block in const function '{}'", fn_name),
                    );
                }
                self.walk_stmt(body, fn_name, const_ctx);
            }
            StmtKind::Defer(body) | StmtKind::Errdefer(body) => {
                self.walk_stmt(body, fn_name, const_ctx);
            }
            StmtKind::Match { subject, arms } => {
                self.walk_expr(subject, fn_name, const_ctx);
                for arm in arms {
                    self.walk_stmt(&mut arm.body, fn_name, const_ctx);
                }
            }
            StmtKind::StaticAssert { cond, message } => {
                let cond = cond.clone();
                let message = message.clone();
                let loc = stmt.loc.clone();
                self.check_static_assert(&cond, &message, &loc);
            }
            StmtKind::Break(_) | StmtKind::Continue(_) | StmtKind::Goto(_) | StmtKind::Empty => {}
        }
    }

    fn walk_expr(&mut self, e: &mut Expr, fn_name: &str, const_ctx: bool) {
        if let ExprKind::Call { callee, .. } = &e.kind
            && let ExprKind::Ident { name, .. } = &callee.kind
            && let Some(target) = self.fns.get(name)
        {
            let target_flags = target.flags;
            if target_flags.is_consteval && !const_ctx {
                self.diags.error(
                    e.loc.clone(),
                    format!(
                        "consteval function '{}' called from non-const function '{}'",
                        name, fn_name
                    ),
                );
            }
            if const_ctx
                && !(target_flags.is_const
                    || target_flags.is_consteval
                    || target_flags.is_extern)
            {
                self.diags.error(
                    e.loc.clone(),
                    format!(
                        "const function '{}' may only call const, consteval or extern functions; '{}' is none of these",
                        fn_name, name
                    ),
                );
            }
        }

        // Recurse into sub-expressions.
        match &mut e.kind {
            ExprKind::Unary { operand, .. } => self.walk_expr(operand, fn_name, const_ctx),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs, fn_name, const_ctx);
                self.walk_expr(rhs, fn_name, const_ctx);
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond, fn_name, const_ctx);
                self.walk_expr(then_expr, fn_name, const_ctx);
                self.walk_expr(else_expr, fn_name, const_ctx);
            }
            ExprKind::Assign { target, value, .. } => {
                self.walk_expr(target, fn_name, const_ctx);
                self.walk_expr(value, fn_name, const_ctx);
            }
            ExprKind::Call {
                callee,
                args,
                method_base,
            } => {
                self.walk_expr(callee, fn_name, const_ctx);
                if let Some(base) = method_base {
                    self.walk_expr(base, fn_name, const_ctx);
                }
                for a in args {
                    self.walk_expr(a, fn_name, const_ctx);
                }
            }
            ExprKind::Index { base, index, .. } => {
                self.walk_expr(base, fn_name, const_ctx);
                self.walk_expr(index, fn_name, const_ctx);
            }
            ExprKind::Member { base, .. } => self.walk_expr(base, fn_name, const_ctx),
            ExprKind::Cast { operand, .. } => self.walk_expr(operand, fn_name, const_ctx),
            ExprKind::CompoundInit(elements) | ExprKind::TupleLit(elements) => {
                for el in elements {
                    self.walk_expr(el, fn_name, const_ctx);
                }
            }
            ExprKind::SizeofExpr(inner) | ExprKind::Try(inner) => {
                self.walk_expr(inner, fn_name, const_ctx)
            }
            ExprKind::Spawn { func, arg } => {
                self.walk_expr(func, fn_name, const_ctx);
                self.walk_expr(arg, fn_name, const_ctx);
            }
            ExprKind::UnionInit { value, .. } => {
                if let Some(v) = value {
                    self.walk_expr(v, fn_name, const_ctx);
                }
            }
            _ => {}
        }
    }

    // ==================================================================
    // Evaluation
    // ==================================================================

    fn tick(&mut self, loc: &SourceLoc) -> Result<(), EvalError> {
        self.ticks += 1;
        if self.ticks > MAX_TICKS {
            return Err(EvalError::budget(
                loc,
                format!("compile-time evaluation exceeded {} steps", MAX_TICKS),
            ));
        }
        Ok(())
    }

    fn eval_expr_internal(&mut self, e: &Expr) -> EvalResult {
        self.tick(&e.loc)?;
        match &e.kind {
            ExprKind::IntLit { value, .. } => Ok(ConstValue::Int(*value as i64)),
            ExprKind::FloatLit(v) => Ok(ConstValue::Float(*v)),
            ExprKind::BoolLit(v) => Ok(ConstValue::Bool(*v)),
            ExprKind::CharLit(c) => Ok(ConstValue::Int(*c as i64)),
            ExprKind::StrLit(s) => Ok(ConstValue::Str(s.clone())),
            ExprKind::Ident { name, resolved } => self.eval_ident(name, resolved, &e.loc),
            ExprKind::Unary { op, operand } => self.eval_unary(*op, operand, &e.loc),
            ExprKind::Binary { op, lhs, rhs, .. } => self.eval_binary(*op, lhs, rhs, &e.loc),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.eval_expr_internal(cond)?;
                if c.truthy() {
                    self.eval_expr_internal(then_expr)
                } else {
                    self.eval_expr_internal(else_expr)
                }
            }
            ExprKind::Assign { op, target, value } => self.eval_assign(*op, target, value, &e.loc),
            ExprKind::Call { callee, args, .. } => self.eval_call(callee, args, &e.loc),
            ExprKind::Cast { target, operand } => {
                let v = self.eval_expr_internal(operand)?;
                self.coerce(&v, target, &e.loc)
            }
            ExprKind::SizeofType(ty) => Ok(ConstValue::Int(size_of_type(ty))),
            ExprKind::SizeofExpr(inner) => match &inner.ty {
                Some(ty) => Ok(ConstValue::Int(size_of_type(ty))),
                None => Err(EvalError::new(&e.loc, "operand of sizeof has no type")),
            },
            ExprKind::Alignof(ty) => Ok(ConstValue::Int(align_of_type(ty))),
            ExprKind::FieldCount(ty) => match &**ty {
                Type::Struct { fields, .. } => Ok(ConstValue::Int(fields.len() as i64)),
                Type::Tuple { elements } => Ok(ConstValue::Int(elements.len() as i64)),
                _ => Err(EvalError::new(
                    &e.loc,
                    format!("fieldcount requires a struct type, got '{}'", ty),
                )),
            },
            _ => Err(EvalError::new(
                &e.loc,
                "expression is not a compile-time constant",
            )),
        }
    }

    fn eval_ident(
        &mut self,
        name: &str,
        resolved: &Option<ResolvedIdent>,
        loc: &SourceLoc,
    ) -> EvalResult {
        if let Some(ResolvedIdent::EnumConst { value }) = resolved {
            return Ok(ConstValue::Int(*value));
        }
        // Local binding in the active frame.
        if let Some(frame) = self.frames.last()
            && let Some(v) = frame.get(name)
        {
            return Ok(v.clone());
        }
        // Cached global, then on-demand evaluation of a const global.
        if let Some(v) = self.global_cache.get(name) {
            return Ok(v.clone());
        }
        if let Some(init) = self.const_globals.get(name).cloned() {
            if !self.evaluating_globals.insert(name.to_string()) {
                return Err(EvalError::new(
                    loc,
                    format!("cyclic initialization of const '{}'", name),
                ));
            }
            let result = self.eval_expr_internal(&init);
            self.evaluating_globals.remove(name);
            let v = result?;
            self.global_cache.insert(name.to_string(), v.clone());
            return Ok(v);
        }
        Err(EvalError::new(
            loc,
            format!("'{}' is not a compile-time constant", name),
        ))
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, loc: &SourceLoc) -> EvalResult {
        match op {
            UnaryOp::Neg => match self.eval_expr_internal(operand)? {
                ConstValue::Int(v) => Ok(ConstValue::Int(v.wrapping_neg())),
                ConstValue::Float(v) => Ok(ConstValue::Float(-v)),
                other => Err(EvalError::new(
                    loc,
                    format!("cannot negate {}", other),
                )),
            },
            UnaryOp::Not => {
                let v = self.eval_expr_internal(operand)?;
                Ok(ConstValue::Bool(!v.truthy()))
            }
            UnaryOp::BitNot => match self.eval_expr_internal(operand)?.to_int() {
                Some(v) => Ok(ConstValue::Int(!v)),
                None => Err(EvalError::new(loc, "operand of '~' is not an integer")),
            },
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let name = match &operand.kind {
                    ExprKind::Ident { name, .. } => name.clone(),
                    _ => {
                        return Err(EvalError::new(
                            loc,
                            "increment target must be a local name in const evaluation",
                        ));
                    }
                };
                let old = match self.eval_expr_internal(operand)?.to_int() {
                    Some(v) => v,
                    None => {
                        return Err(EvalError::new(loc, "increment operand is not an integer"));
                    }
                };
                let delta = match op {
                    UnaryOp::PreInc | UnaryOp::PostInc => 1,
                    _ => -1,
                };
                let new = old.wrapping_add(delta);
                let wrote = self
                    .frames
                    .last_mut()
                    .map(|f| f.set(&name, ConstValue::Int(new)))
                    .unwrap_or(false);
                if !wrote {
                    return Err(EvalError::new(
                        loc,
                        format!("cannot write '{}' in const evaluation", name),
                    ));
                }
                let result = match op {
                    UnaryOp::PreInc | UnaryOp::PreDec => new,
                    _ => old,
                };
                Ok(ConstValue::Int(result))
            }
            UnaryOp::AddrOf | UnaryOp::Deref => Err(EvalError::new(
                loc,
                "references are not available in const evaluation",
            )),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: &SourceLoc,
    ) -> EvalResult {
        // Short-circuit forms evaluate the right side only when needed.
        if op == BinaryOp::LogAnd {
            let l = self.eval_expr_internal(lhs)?;
            if !l.truthy() {
                return Ok(ConstValue::Bool(false));
            }
            let r = self.eval_expr_internal(rhs)?;
            return Ok(ConstValue::Bool(r.truthy()));
        }
        if op == BinaryOp::LogOr {
            let l = self.eval_expr_internal(lhs)?;
            if l.truthy() {
                return Ok(ConstValue::Bool(true));
            }
            let r = self.eval_expr_internal(rhs)?;
            return Ok(ConstValue::Bool(r.truthy()));
        }

        let l = self.eval_expr_internal(lhs)?;
        let r = self.eval_expr_internal(rhs)?;

        // Mixed precision promotes to float.
        let float_mode = matches!(l, ConstValue::Float(_)) || matches!(r, ConstValue::Float(_));
        if float_mode {
            let lf = l
                .to_float()
                .ok_or_else(|| EvalError::new(loc, "operand is not numeric"))?;
            let rf = r
                .to_float()
                .ok_or_else(|| EvalError::new(loc, "operand is not numeric"))?;
            return match op {
                BinaryOp::Add => Ok(ConstValue::Float(lf + rf)),
                BinaryOp::Sub => Ok(ConstValue::Float(lf - rf)),
                BinaryOp::Mul => Ok(ConstValue::Float(lf * rf)),
                BinaryOp::Div => Ok(ConstValue::Float(lf / rf)),
                BinaryOp::Eq => Ok(ConstValue::Bool(lf == rf)),
                BinaryOp::Ne => Ok(ConstValue::Bool(lf != rf)),
                BinaryOp::Lt => Ok(ConstValue::Bool(lf < rf)),
                BinaryOp::Gt => Ok(ConstValue::Bool(lf > rf)),
                BinaryOp::Le => Ok(ConstValue::Bool(lf <= rf)),
                BinaryOp::Ge => Ok(ConstValue::Bool(lf >= rf)),
                _ => Err(EvalError::new(
                    loc,
                    format!("operator '{}' is not defined on floats", op),
                )),
            };
        }

        let li = l
            .to_int()
            .ok_or_else(|| EvalError::new(loc, "operand is not an integer"))?;
        let ri = r
            .to_int()
            .ok_or_else(|| EvalError::new(loc, "operand is not an integer"))?;
        match op {
            BinaryOp::Add => Ok(ConstValue::Int(li.wrapping_add(ri))),
            BinaryOp::Sub => Ok(ConstValue::Int(li.wrapping_sub(ri))),
            BinaryOp::Mul => Ok(ConstValue::Int(li.wrapping_mul(ri))),
            BinaryOp::Div => {
                if ri == 0 {
                    Err(EvalError::new(loc, "division by zero in constant expression"))
                } else {
                    Ok(ConstValue::Int(li.wrapping_div(ri)))
                }
            }
            BinaryOp::Rem => {
                if ri == 0 {
                    Err(EvalError::new(loc, "modulo by zero in constant expression"))
                } else {
                    Ok(ConstValue::Int(li.wrapping_rem(ri)))
                }
            }
            BinaryOp::BitAnd => Ok(ConstValue::Int(li & ri)),
            BinaryOp::BitOr => Ok(ConstValue::Int(li | ri)),
            BinaryOp::BitXor => Ok(ConstValue::Int(li ^ ri)),
            BinaryOp::Shl => Ok(ConstValue::Int(li.wrapping_shl(ri as u32))),
            BinaryOp::Shr => Ok(ConstValue::Int(li.wrapping_shr(ri as u32))),
            BinaryOp::Eq => Ok(ConstValue::Bool(li == ri)),
            BinaryOp::Ne => Ok(ConstValue::Bool(li != ri)),
            BinaryOp::Lt => Ok(ConstValue::Bool(li < ri)),
            BinaryOp::Gt => Ok(ConstValue::Bool(li > ri)),
            BinaryOp::Le => Ok(ConstValue::Bool(li <= ri)),
            BinaryOp::Ge => Ok(ConstValue::Bool(li >= ri)),
            BinaryOp::LogAnd | BinaryOp::LogOr => unreachable!("handled above"),
        }
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Expr,
        value: &Expr,
        loc: &SourceLoc,
    ) -> EvalResult {
        let name = match &target.kind {
            ExprKind::Ident { name, .. } => name.clone(),
            _ => {
                return Err(EvalError::new(
                    loc,
                    "assignment target must be a local name in const evaluation",
                ));
            }
        };
        let new = match op.binary_op() {
            None => self.eval_expr_internal(value)?,
            Some(binop) => self.eval_binary(binop, target, value, loc)?,
        };
        let wrote = self
            .frames
            .last_mut()
            .map(|f| f.set(&name, new.clone()))
            .unwrap_or(false);
        if !wrote {
            return Err(EvalError::new(
                loc,
                format!("cannot write '{}' in const evaluation", name),
            ));
        }
        Ok(new)
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr], loc: &SourceLoc) -> EvalResult {
        let name = match &callee.kind {
            ExprKind::Ident { name, .. } => name.clone(),
            _ => {
                return Err(EvalError::new(loc, "callee is not a named function"));
            }
        };
        let info = match self.fns.get(&name) {
            Some(info) => info.clone(),
            None => {
                return Err(EvalError::new(
                    loc,
                    format!("'{}' is not usable in a constant expression", name),
                ));
            }
        };
        let body = match &info.decl.body {
            Some(b) => b.clone(),
            None => {
                return Err(EvalError::new(
                    loc,
                    format!("extern function '{}' cannot be evaluated at compile time", name),
                ));
            }
        };
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(EvalError::budget(
                loc,
                format!("compile-time recursion exceeded depth {}", MAX_CALL_DEPTH),
            ));
        }

        let mut arg_values = Vec::with_capacity(args.len());
        for a in args {
            arg_values.push(self.eval_expr_internal(a)?);
        }

        let mut frame = Frame::new();
        for (param, value) in info.decl.params.iter().zip(arg_values) {
            frame.declare(&param.name, value);
        }
        self.frames.push(frame);
        let result = self.exec_stmt(&body);
        let frame = self.frames.pop().expect("frame pushed above");
        result?;
        Ok(frame.ret.unwrap_or(ConstValue::Void))
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        self.tick(&stmt.loc)?;
        if self.frame_returned() || self.break_flag || self.continue_flag {
            return Ok(());
        }
        match &stmt.kind {
            StmtKind::Compound(stmts) => {
                self.push_block_scope();
                for s in stmts {
                    self.exec_stmt(s)?;
                    if self.frame_returned() || self.break_flag || self.continue_flag {
                        break;
                    }
                }
                self.pop_block_scope();
                Ok(())
            }
            StmtKind::Expr(e) => {
                self.eval_expr_internal(e)?;
                Ok(())
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let c = self.eval_expr_internal(cond)?;
                if c.truthy() {
                    self.exec_stmt(then_branch)
                } else if let Some(e) = else_branch {
                    self.exec_stmt(e)
                } else {
                    Ok(())
                }
            }
            StmtKind::While { cond, body, .. } => {
                let mut iterations: u64 = 0;
                loop {
                    let c = self.eval_expr_internal(cond)?;
                    if !c.truthy() {
                        break;
                    }
                    iterations += 1;
                    if iterations > MAX_LOOP_ITERATIONS {
                        return Err(EvalError::budget(
                            &stmt.loc,
                            format!("loop exceeded {} iterations", MAX_LOOP_ITERATIONS),
                        ));
                    }
                    self.exec_stmt(body)?;
                    self.continue_flag = false;
                    if self.break_flag {
                        self.break_flag = false;
                        break;
                    }
                    if self.frame_returned() {
                        break;
                    }
                }
                Ok(())
            }
            StmtKind::DoWhile { body, cond, .. } => {
                let mut iterations: u64 = 0;
                loop {
                    iterations += 1;
                    if iterations > MAX_LOOP_ITERATIONS {
                        return Err(EvalError::budget(
                            &stmt.loc,
                            format!("loop exceeded {} iterations", MAX_LOOP_ITERATIONS),
                        ));
                    }
                    self.exec_stmt(body)?;
                    self.continue_flag = false;
                    if self.break_flag {
                        self.break_flag = false;
                        break;
                    }
                    if self.frame_returned() {
                        break;
                    }
                    let c = self.eval_expr_internal(cond)?;
                    if !c.truthy() {
                        break;
                    }
                }
                Ok(())
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                self.push_block_scope();
                if let Some(s) = init {
                    self.exec_stmt(s)?;
                }
                let mut iterations: u64 = 0;
                loop {
                    if let Some(c) = cond {
                        if !self.eval_expr_internal(c)?.truthy() {
                            break;
                        }
                    }
                    iterations += 1;
                    if iterations > MAX_LOOP_ITERATIONS {
                        self.pop_block_scope();
                        return Err(EvalError::budget(
                            &stmt.loc,
                            format!("loop exceeded {} iterations", MAX_LOOP_ITERATIONS),
                        ));
                    }
                    self.exec_stmt(body)?;
                    self.continue_flag = false;
                    if self.break_flag {
                        self.break_flag = false;
                        break;
                    }
                    if self.frame_returned() {
                        break;
                    }
                    if let Some(s) = step {
                        self.eval_expr_internal(s)?;
                    }
                }
                self.pop_block_scope();
                Ok(())
            }
            StmtKind::Return(value) => {
                let v = match value {
                    Some(e) => self.eval_expr_internal(e)?,
                    None => ConstValue::Void,
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.ret = Some(v);
                    frame.has_return = true;
                }
                Ok(())
            }
            StmtKind::Var(v) => {
                let value = match &v.init {
                    Some(e) => self.eval_expr_internal(e)?,
                    None => ConstValue::Int(0),
                };
                if let Some(frame) = self.frames.last_mut() {
                    frame.declare(&v.name, value);
                }
                Ok(())
            }
            StmtKind::Break(_) => {
                self.break_flag = true;
                Ok(())
            }
            StmtKind::Continue(_) => {
                self.continue_flag = true;
                Ok(())
            }
            StmtKind::StaticAssert { cond, message } => {
                let v = self.eval_expr_internal(cond)?;
                if !v.truthy() {
                    return Err(EvalError::new(
                        &stmt.loc,
                        format!("static_assert failed: {}", message),
                    ));
                }
                Ok(())
            }
            StmtKind::Unsafe(_) => Err(EvalError::new(
                &stmt.loc,
                "unsafe block in a const context",
            )),
            StmtKind::Empty => Ok(()),
            other => Err(EvalError::new(
                &stmt.loc,
                format!(
                    "{} is not supported in const evaluation",
                    discriminant_name(other)
                ),
            )),
        }
    }

    fn frame_returned(&self) -> bool {
        self.frames.last().map(|f| f.has_return).unwrap_or(false)
    }

    fn push_block_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.push(HashMap::new());
        }
    }

    fn pop_block_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.pop();
        }
    }

    fn coerce(&self, v: &ConstValue, target: &TypeRef, loc: &SourceLoc) -> EvalResult {
        if target.is_float() {
            return v
                .to_float()
                .map(ConstValue::Float)
                .ok_or_else(|| EvalError::new(loc, "cannot convert to float"));
        }
        if matches!(&**target, Type::Bool) {
            return Ok(ConstValue::Bool(v.truthy()));
        }
        if target.is_integer() {
            let raw = v
                .to_int()
                .ok_or_else(|| EvalError::new(loc, "cannot convert to integer"))?;
            // Truncate to the target width.
            let bits = target.bit_width().unwrap_or(64);
            let truncated = if bits >= 64 {
                raw
            } else {
                let mask = (1i64 << bits) - 1;
                let cut = raw & mask;
                if !target.is_unsigned() && cut & (1i64 << (bits - 1)) != 0 {
                    cut | !mask
                } else {
                    cut
                }
            };
            return Ok(ConstValue::Int(truncated));
        }
        Err(EvalError::new(
            loc,
            format!("cast to '{}' is not a constant operation", target),
        ))
    }
}

/// Fixed size table: 8/16/32/64-bit scalars are 1/2/4/8 bytes, pointers
/// and references are 8. Aggregates sum their parts with no padding
/// model.
fn size_of_type(ty: &TypeRef) -> i64 {
    match &**ty {
        Type::Void => 0,
        Type::Pointer { .. } | Type::Reference { .. } | Type::Function { .. } => 8,
        Type::Slice { .. } => 16,
        Type::Array { element, size } => {
            size_of_type(element) * size.map(|n| n as i64).unwrap_or(0)
        }
        Type::Struct {
            fields, is_union, ..
        } => {
            if *is_union {
                fields.iter().map(|f| size_of_type(&f.ty)).max().unwrap_or(0) + 4
            } else {
                fields.iter().map(|f| size_of_type(&f.ty)).sum()
            }
        }
        Type::Tuple { elements } => elements.iter().map(size_of_type).sum(),
        Type::Optional { inner } => size_of_type(inner) + 1,
        Type::Newtype { base, .. } => size_of_type(base),
        _ => match ty.bit_width() {
            Some(bits) => i64::from(bits / 8),
            None => 0,
        },
    }
}

fn align_of_type(ty: &TypeRef) -> i64 {
    match &**ty {
        Type::Pointer { .. } | Type::Reference { .. } | Type::Function { .. } => 8,
        Type::Array { element, .. } | Type::Slice { element } => align_of_type(element),
        Type::Struct { fields, .. } => {
            fields.iter().map(|f| align_of_type(&f.ty)).max().unwrap_or(1)
        }
        Type::Tuple { elements } => elements.iter().map(align_of_type).max().unwrap_or(1),
        Type::Optional { inner } => align_of_type(inner),
        Type::Newtype { base, .. } => align_of_type(base),
        _ => match ty.bit_width() {
            Some(bits) => i64::from((bits / 8).max(1)),
            None => 1,
        },
    }
}

/// Rewrites an evaluated initializer into a literal node so the backend
/// emits the constant directly.
fn folded_literal(value: &ConstValue, original: &Expr, ty: Option<TypeRef>) -> Expr {
    let kind = match value {
        ConstValue::Int(v) => ExprKind::IntLit {
            value: *v as u64,
            unsigned: false,
            long_long: false,
        },
        ConstValue::Float(v) => ExprKind::FloatLit(*v),
        ConstValue::Bool(v) => ExprKind::BoolLit(*v),
        ConstValue::Str(s) => ExprKind::StrLit(s.clone()),
        ConstValue::Void => return original.clone(),
    };
    let mut e = Expr::new(kind, original.loc.clone());
    e.ty = ty.or_else(|| original.ty.clone());
    e
}

fn discriminant_name(kind: &StmtKind) -> &'static str {
    match kind {
        StmtKind::Match { .. } => "match",
        StmtKind::Defer(_) => "defer",
        StmtKind::Errdefer(_) => "errdefer",
        StmtKind::Goto(_) => "goto",
        StmtKind::Label { .. } => "label",
        _ => "statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, AnalyzerOptions};
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn compile(source: &str) -> (TranslationUnit, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let tokens = Lexer::new(source, "test.sc", &mut diags).tokenize();
        let mut unit = Parser::new(tokens, &mut diags).parse();
        let mut analyzer = Analyzer::new(&mut diags, AnalyzerOptions::default());
        analyzer.run(&mut unit);
        drop(analyzer);
        let mut engine = ConstEval::new(&mut diags);
        engine.run(&mut unit);
        drop(engine);
        (unit, diags)
    }

    fn compile_ok(source: &str) -> TranslationUnit {
        let (unit, diags) = compile(source);
        assert_eq!(
            diags.error_count(),
            0,
            "unexpected errors: {:?}",
            diags.diagnostics()
        );
        unit
    }

    fn errors_of(source: &str) -> Vec<String> {
        let (_, diags) = compile(source);
        diags
            .diagnostics()
            .iter()
            .filter(|d| {
                matches!(
                    d.level,
                    crate::diagnostics::Level::Error | crate::diagnostics::Level::Fatal
                )
            })
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn test_static_assert_true() {
        compile_ok("static_assert(1 + 2 == 3, \"sum\");");
    }

    #[test]
    fn test_static_assert_false() {
        let errs = errors_of("static_assert(1 == 2, \"nope\");");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("static_assert failed: nope"));
    }

    #[test]
    fn test_const_global_folding() {
        let unit = compile_ok("const int N = 4 * 8; int xs[32]; int main() { return N; }");
        match &unit.decls[0] {
            Decl::Global(g) => match &g.init.as_ref().unwrap().kind {
                ExprKind::IntLit { value, .. } => assert_eq!(*value, 32),
                other => panic!("expected folded literal, got {:?}", other),
            },
            other => panic!("expected global, got {:?}", other),
        }
    }

    #[test]
    fn test_const_folding_idempotent() {
        // Folding replaces the AST; evaluating the folded AST yields the
        // same value.
        let unit = compile_ok("const int N = (1 << 4) + 2;");
        let folded = match &unit.decls[0] {
            Decl::Global(g) => g.init.clone().unwrap(),
            other => panic!("expected global, got {:?}", other),
        };
        let mut diags = Diagnostics::silent();
        let mut engine = ConstEval::new(&mut diags);
        assert_eq!(engine.eval_expr(&folded), Ok(ConstValue::Int(18)));
    }

    #[test]
    fn test_const_fn_call_in_assert() {
        compile_ok(
            "const int square(int x) { return x * x; }\n\
             static_assert(square(5) == 25, \"squares\");",
        );
    }

    #[test]
    fn test_consteval_loop_and_locals() {
        compile_ok(
            "consteval int sum_to(int n) {\n\
               int total = 0;\n\
               for (int i = 1; i <= n; i++) { total += i; }\n\
               return total;\n\
             }\n\
             const int S = sum_to(10);\n\
             static_assert(S == 55, \"triangular\");",
        );
    }

    #[test]
    fn test_recursion_in_const_fn() {
        compile_ok(
            "const int fib(int n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }\n\
             static_assert(fib(10) == 55, \"fib\");",
        );
    }

    #[test]
    fn test_recursion_budget() {
        let errs = errors_of(
            "const int down(int n) { return down(n - 1); }\n\
             static_assert(down(1) == 0, \"never\");",
        );
        assert!(errs.iter().any(|m| m.contains("recursion exceeded depth 256")));
    }

    #[test]
    fn test_loop_iteration_budget() {
        let errs = errors_of(
            "consteval int spin() { int i = 0; while (1) { i++; } return i; }\n\
             static_assert(spin() == 0, \"never\");",
        );
        assert!(
            errs.iter()
                .any(|m| m.contains("loop exceeded 1000000 iterations")),
            "got: {:?}",
            errs
        );
    }

    #[test]
    fn test_division_by_zero() {
        let errs = errors_of("static_assert(1 / 0 == 0, \"boom\");");
        assert!(errs.iter().any(|m| m.contains("division by zero")));
    }

    #[test]
    fn test_consteval_called_at_runtime_rejected() {
        let errs = errors_of(
            "consteval int five() { return 5; }\n\
             int main() { return five(); }",
        );
        assert!(
            errs.iter()
                .any(|m| m.contains("consteval function 'five' called from non-const"))
        );
    }

    #[test]
    fn test_const_fn_may_not_call_runtime_fn() {
        let errs = errors_of(
            "int runtime_only() { return 1; }\n\
             const int c() { return runtime_only(); }\n\
             int main() { return c(); }",
        );
        assert!(
            errs.iter()
                .any(|m| m.contains("may only call const, consteval or extern"))
        );
    }

    #[test]
    fn test_const_fn_may_call_extern() {
        let (_, diags) = compile(
            "extern int host_hook(int x);\n\
             const int c(int x) { return host_hook(x); }\n\
             int main() { return c(1); }",
        );
        assert_eq!(
            diags
                .diagnostics()
                .iter()
                .filter(|d| d.message.contains("may only call"))
                .count(),
            0
        );
    }

    #[test]
    fn test_if_const_resolution() {
        let unit = compile_ok(
            "int main() { if const (sizeof(int) == 4) { return 1; } else { return 2; } }",
        );
        let main = unit.find_function("main").unwrap();
        let body = match &main.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::If { const_result, .. } => assert_eq!(*const_result, Some(true)),
            other => panic!("expected if const, got {:?}", other),
        }
    }

    #[test]
    fn test_if_const_unresolved_falls_back() {
        // A runtime value cannot be folded: constResult stays None and no
        // error is reported.
        let (unit, diags) = compile(
            "int main(int argc) { if const (argc > 0) { return 1; } return 0; }",
        );
        assert_eq!(diags.error_count(), 0);
        let main = unit.find_function("main").unwrap();
        let body = match &main.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::If { const_result, .. } => assert_eq!(*const_result, None),
            other => panic!("expected if const, got {:?}", other),
        }
    }

    #[test]
    fn test_statement_level_static_assert() {
        let errs = errors_of("int main() { static_assert(2 + 2 == 5, \"math\"); return 0; }");
        assert!(errs.iter().any(|m| m.contains("static_assert failed: math")));
    }

    #[test]
    fn test_sizeof_table() {
        compile_ok(
            "static_assert(sizeof(i8) == 1, \"i8\");\n\
             static_assert(sizeof(i16) == 2, \"i16\");\n\
             static_assert(sizeof(int) == 4, \"int\");\n\
             static_assert(sizeof(i64) == 8, \"i64\");\n\
             static_assert(sizeof(int*) == 8, \"ptr\");\n\
             static_assert(sizeof(double) == 8, \"double\");",
        );
    }

    #[test]
    fn test_sizeof_aggregates_and_fieldcount() {
        compile_ok(
            "struct P { int x; int y; }\n\
             static_assert(sizeof(P) == 8, \"packed sum\");\n\
             static_assert(fieldcount(P) == 2, \"two fields\");",
        );
    }

    #[test]
    fn test_enum_constants_fold() {
        compile_ok(
            "enum Color { Red, Green = 5, Blue }\n\
             static_assert(Blue == 6, \"enum numbering\");",
        );
    }

    #[test]
    fn test_global_const_on_demand_and_cycle() {
        compile_ok(
            "const int A = 2;\n\
             const int B = A * 3;\n\
             static_assert(B == 6, \"chained\");",
        );
        let errs = errors_of("const int X = X + 1;");
        assert!(errs.iter().any(|m| m.contains("cyclic")));
    }

    #[test]
    fn test_casts_coerce() {
        compile_ok(
            "static_assert((int)3.9 == 3, \"float to int\");\n\
             static_assert((bool)7 == true, \"int to bool\");\n\
             static_assert((u8)300 == 44, \"truncation\");\n\
             static_assert((double)1 == 1.0, \"int to float\");",
        );
    }

    #[test]
    fn test_short_circuit() {
        // The right side would divide by zero; short-circuit must skip it.
        compile_ok(
            "static_assert(!(0 && (1 / 0)), \"skipped\");\n\
             static_assert(1 || (1 / 0), \"skipped too\");",
        );
    }

    #[test]
    fn test_increments_write_back() {
        compile_ok(
            "const int count() { int i = 0; i++; ++i; i--; return ++i; }\n\
             static_assert(count() == 2, \"writeback\");",
        );
    }

    #[test]
    fn test_unsafe_rejected_in_const_fn() {
        let errs = errors_of(
            "const int bad() { unsafe { } return 0; }\n\
             int main() { return bad(); }",
        );
        assert!(errs.iter().any(|m| m.contains("unsafe block in const")));
    }
}
