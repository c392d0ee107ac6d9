//! Two-pass semantic analyzer.
//!
//! Pass 1 (*collect*) registers every top-level declaration: struct/enum/
//! typedef types, regions, function signatures (with the implicit `self`
//! parameter and `Owner_m` mangling for methods), and rewrites named types
//! in generic signatures to `Generic` placeholders.
//!
//! Pass 2 (*check*) walks function bodies: name resolution, the closed
//! list of implicit conversions, region escape checks, borrow records,
//! nullable-reference discipline, unsafe enforcement, method and operator
//! dispatch, and generic monomorphization. Monomorphized clones are
//! appended to the translation unit when analysis finishes.
//!
//! Every check reports through the diagnostics engine and continues with
//! the `Error` type, so one mistake produces one message.

use crate::ast::*;
use crate::diagnostics::{Diagnostics, SourceLoc};
use crate::instantiate::{self, PackExpansion};
use crate::scope::{Borrow, BorrowSet, ScopeStack, Symbol, SymbolKind};
use crate::stdlib_surface::StdlibSurface;
use crate::types::{Region, StructField, Type, TypeRef};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Traits a generic constraint may name, with the operator methods a
/// struct must provide to satisfy them. Arithmetic primitives satisfy all
/// of them.
const TRAIT_TABLE: &[(&str, &[&str])] = &[
    ("Numeric", &["operator+", "operator-", "operator*", "operator/"]),
    ("Eq", &["operator==", "operator!="]),
    ("Ord", &["operator<", "operator>", "operator<=", "operator>="]),
];

#[derive(Debug, Clone)]
struct FnSig {
    params: Vec<TypeRef>,
    ret: TypeRef,
    flags: FnFlags,
    variadic: bool,
    is_generic: bool,
    has_body: bool,
}

#[derive(Debug, Clone)]
struct RegionInfo {
    capacity: Option<Expr>,
    loc: SourceLoc,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    /// Warn on calls into the hosted C standard library.
    pub freestanding: bool,
}

pub struct Analyzer<'a> {
    diags: &'a mut Diagnostics,
    scopes: ScopeStack,
    borrows: BorrowSet,

    structs: HashMap<String, TypeRef>,
    enums: HashMap<String, TypeRef>,
    enum_consts: HashMap<String, (i64, TypeRef)>,
    typedefs: HashMap<String, TypeRef>,
    regions: HashMap<String, RegionInfo>,

    /// `Owner::name` → mangled function name (`Owner_name`).
    methods: HashMap<String, String>,
    fn_sigs: HashMap<String, FnSig>,
    /// Generic declarations kept aside for cloning.
    generic_fns: HashMap<String, FunctionDecl>,
    /// Monomorphization cache: `(name, [type_arg.str()…])` key → mangled.
    mono_done: HashMap<String, String>,
    pending_mono: Vec<FunctionDecl>,
    mono_fns: Vec<FunctionDecl>,

    current_ret: Option<TypeRef>,
    /// Enclosing loop labels, innermost last; `None` for unlabeled loops.
    loop_labels: Vec<Option<String>>,

    freestanding: bool,
    stdlib: StdlibSurface,
}

impl<'a> Analyzer<'a> {
    pub fn new(diags: &'a mut Diagnostics, options: AnalyzerOptions) -> Self {
        let mut analyzer = Analyzer {
            diags,
            scopes: ScopeStack::new(),
            borrows: BorrowSet::new(),
            structs: HashMap::new(),
            enums: HashMap::new(),
            enum_consts: HashMap::new(),
            typedefs: HashMap::new(),
            regions: HashMap::new(),
            methods: HashMap::new(),
            fn_sigs: HashMap::new(),
            generic_fns: HashMap::new(),
            mono_done: HashMap::new(),
            pending_mono: Vec::new(),
            mono_fns: Vec::new(),
            current_ret: None,
            loop_labels: Vec::new(),
            freestanding: options.freestanding,
            stdlib: StdlibSurface::embedded(),
        };
        // The runtime hook `join` desugars to.
        analyzer.fn_sigs.insert(
            "__safec_join".to_string(),
            FnSig {
                params: vec![Type::int64()],
                ret: Type::int64(),
                flags: FnFlags {
                    is_extern: true,
                    ..FnFlags::default()
                },
                variadic: false,
                is_generic: false,
                has_body: false,
            },
        );
        analyzer
    }

    /// Runs both passes. Success means zero errors were added during the
    /// run.
    pub fn run(&mut self, unit: &mut TranslationUnit) -> bool {
        let errors_before = self.diags.error_count();
        self.scopes.push();

        debug!("collect pass over {} declarations", unit.decls.len());
        for decl in &mut unit.decls {
            self.collect_decl(decl);
        }

        debug!("check pass");
        for decl in &mut unit.decls {
            self.check_decl(decl);
        }

        // Monomorphized clones type-check at global scope; checking one
        // may enqueue more.
        while let Some(mut f) = self.pending_mono.pop() {
            self.check_function(&mut f);
            self.mono_fns.push(f);
        }
        unit.decls
            .extend(self.mono_fns.drain(..).map(Decl::Function));

        self.scopes.pop();
        self.diags.error_count() == errors_before
    }

    // ==================================================================
    // Pass 1: collect
    // ==================================================================

    fn collect_decl(&mut self, decl: &mut Decl) {
        match decl {
            Decl::Struct(s) => self.collect_struct(s),
            Decl::Enum(e) => self.collect_enum(e),
            Decl::Region(r) => self.collect_region(r),
            Decl::Typedef(t) => self.collect_typedef(t),
            Decl::Global(g) => self.collect_global(g),
            Decl::Function(f) => self.collect_function(f),
            Decl::StaticAssert(_) => {}
        }
    }

    fn collect_struct(&mut self, s: &StructDecl) {
        if self.structs.contains_key(&s.name) {
            self.diags
                .error(s.loc.clone(), format!("redefinition of struct '{}'", s.name));
            return;
        }
        // Field types resolve leniently: a not-yet-registered name may be
        // a forward or self reference, which use sites look up through
        // the registry by name.
        let fields: Vec<StructField> = s
            .fields
            .iter()
            .map(|f| StructField {
                name: f.name.clone(),
                ty: self.resolve_type_impl(&f.ty, &f.loc, true),
            })
            .collect();
        let ty = Rc::new(Type::Struct {
            name: s.name.clone(),
            fields,
            is_union: s.is_union,
            packed: s.packed,
            defined: true,
        });
        self.structs.insert(s.name.clone(), ty);
    }

    fn collect_enum(&mut self, e: &EnumDecl) {
        if self.enums.contains_key(&e.name) {
            self.diags
                .error(e.loc.clone(), format!("redefinition of enum '{}'", e.name));
            return;
        }
        let mut next = 0i64;
        let mut variants = Vec::new();
        for (vname, value) in &e.variants {
            if let Some(expr) = value {
                match literal_int(expr) {
                    Some(v) => next = v,
                    None => self.diags.error(
                        expr.loc.clone(),
                        format!("enum value for '{}' must be an integer constant", vname),
                    ),
                }
            }
            variants.push((vname.clone(), next));
            next += 1;
        }
        let ty = Rc::new(Type::Enum {
            name: e.name.clone(),
            variants: variants.clone(),
            width: 32,
        });
        for (vname, v) in &variants {
            if self.enum_consts.contains_key(vname) {
                self.diags.error(
                    e.loc.clone(),
                    format!("enum constant '{}' is already defined", vname),
                );
            }
            self.enum_consts.insert(vname.clone(), (*v, ty.clone()));
        }
        self.enums.insert(e.name.clone(), ty);
    }

    fn collect_region(&mut self, r: &RegionDecl) {
        if let Some(existing) = self.regions.get(&r.name) {
            let original = existing.loc.clone();
            self.diags
                .error(r.loc.clone(), format!("redefinition of region '{}'", r.name));
            self.diags.note(original, "previous definition is here");
            return;
        }
        self.regions.insert(
            r.name.clone(),
            RegionInfo {
                capacity: r.capacity.clone(),
                loc: r.loc.clone(),
            },
        );
        // Each arena gets a reset entry point the backend emits.
        self.fn_sigs.insert(
            format!("__arena_reset_{}", r.name),
            FnSig {
                params: Vec::new(),
                ret: Type::void(),
                flags: FnFlags {
                    is_extern: true,
                    ..FnFlags::default()
                },
                variadic: false,
                is_generic: false,
                has_body: false,
            },
        );
    }

    fn collect_typedef(&mut self, t: &TypedefDecl) {
        let base = self.resolve_type(&t.ty, &t.loc);
        if self.typedefs.contains_key(&t.name) {
            self.diags
                .error(t.loc.clone(), format!("redefinition of typedef '{}'", t.name));
            return;
        }
        self.typedefs
            .insert(t.name.clone(), Type::newtype(t.name.clone(), base));
    }

    fn collect_global(&mut self, g: &mut GlobalDecl) {
        let ty = self.resolve_type(&g.declared_ty, &g.loc);
        g.ty = Some(ty.clone());
        if self.scopes.declared_here(&g.name) {
            self.diags
                .error(g.loc.clone(), format!("redefinition of '{}'", g.name));
            return;
        }
        self.scopes.declare(Symbol {
            kind: SymbolKind::Var,
            name: g.name.clone(),
            ty,
            scope_depth: 0,
            is_const: g.is_const,
            initialized: g.init.is_some() || g.is_extern,
        });
    }

    fn collect_function(&mut self, f: &mut FunctionDecl) {
        // Methods get an implicit `self` and a mangled name; the original
        // qualified name goes into the method registry.
        if let Some(owner) = f.owner.clone() {
            let owner_ty = match self.structs.get(&owner) {
                Some(ty) => ty.clone(),
                None => {
                    self.diags.error(
                        f.loc.clone(),
                        format!("method on unknown struct '{}'", owner),
                    );
                    Type::error()
                }
            };
            let self_ty = Type::reference(
                owner_ty,
                Region::Stack,
                false,
                !f.flags.const_method,
            );
            f.params.insert(
                0,
                Param {
                    name: "self".to_string(),
                    ty: self_ty,
                    loc: f.loc.clone(),
                },
            );
            let mangled = format!("{}_{}", owner, f.name);
            self.methods
                .insert(format!("{}::{}", owner, f.name), mangled.clone());
            f.name = mangled;
        }

        // In a generic signature, a bare name matching a generic parameter
        // is that parameter, not a struct.
        if !f.generic_params.is_empty() {
            let subs: HashMap<String, TypeRef> = f
                .generic_params
                .iter()
                .map(|gp| {
                    (
                        gp.name.clone(),
                        Type::generic(gp.name.clone(), gp.constraint.clone()),
                    )
                })
                .collect();
            for p in &mut f.params {
                p.ty = instantiate::substitute_type(&p.ty, &subs);
            }
            f.return_type = instantiate::substitute_type(&f.return_type, &subs);
        }

        // Resolve the concrete parts of the signature.
        for p in &mut f.params {
            p.ty = self.resolve_signature_type(&p.ty, &p.loc);
        }
        f.return_type = self.resolve_signature_type(&f.return_type, &f.loc);

        let sig = FnSig {
            params: f.params.iter().map(|p| p.ty.clone()).collect(),
            ret: f.return_type.clone(),
            flags: f.flags,
            variadic: f.variadic,
            is_generic: !f.generic_params.is_empty(),
            has_body: f.body.is_some(),
        };

        match self.fn_sigs.get(&f.name) {
            None => {
                self.fn_sigs.insert(f.name.clone(), sig);
            }
            Some(existing) => {
                // Header + definition merge idempotently; a second body is
                // a redefinition.
                if existing.has_body && sig.has_body {
                    self.diags.error(
                        f.loc.clone(),
                        format!("redefinition of function '{}'", f.name),
                    );
                } else {
                    let compatible = existing.ret.equals(&sig.ret)
                        && existing.params.len() == sig.params.len()
                        && existing
                            .params
                            .iter()
                            .zip(&sig.params)
                            .all(|(a, b)| a.equals(b));
                    if !compatible {
                        self.diags.error(
                            f.loc.clone(),
                            format!("conflicting declaration of function '{}'", f.name),
                        );
                    }
                    if sig.has_body {
                        self.fn_sigs.insert(f.name.clone(), sig);
                    }
                }
            }
        }

        if !f.generic_params.is_empty() {
            self.generic_fns.insert(f.name.clone(), f.clone());
        }
    }

    // ==================================================================
    // Type resolution
    // ==================================================================

    /// Resolves a parsed type against the registries: named structs,
    /// enums, typedefs, and `typeof` folding. Unknown names report and
    /// poison to `Error`.
    fn resolve_type(&mut self, ty: &TypeRef, loc: &SourceLoc) -> TypeRef {
        self.resolve_type_impl(ty, loc, false)
    }

    /// `lenient` keeps unknown struct names as by-name mentions instead
    /// of diagnosing, for forward and self references inside struct
    /// definitions.
    fn resolve_type_impl(&mut self, ty: &TypeRef, loc: &SourceLoc, lenient: bool) -> TypeRef {
        match &**ty {
            Type::Struct { name, defined, .. } if !defined => {
                if let Some(t) = self.structs.get(name) {
                    return t.clone();
                }
                if let Some(t) = self.typedefs.get(name) {
                    return t.clone();
                }
                if let Some(t) = self.enums.get(name) {
                    return t.clone();
                }
                if lenient {
                    return ty.clone();
                }
                self.diags
                    .error(loc.clone(), format!("unknown type name '{}'", name));
                Type::error()
            }
            Type::Enum { name, variants, .. } if variants.is_empty() => {
                match self.enums.get(name) {
                    Some(t) => t.clone(),
                    None => {
                        self.diags
                            .error(loc.clone(), format!("unknown enum '{}'", name));
                        Type::error()
                    }
                }
            }
            Type::Typeof { expr } => {
                // Fold to the expression's type; the node never reaches
                // the backend.
                let mut probe = (**expr).clone();
                self.check_expr(&mut probe)
            }
            Type::Pointer { base, is_const } => {
                Type::pointer(self.resolve_type_impl(base, loc, lenient), *is_const)
            }
            Type::Reference {
                base,
                region,
                nullable,
                mutable,
            } => {
                if let Region::Arena(name) = region
                    && !self.regions.contains_key(name)
                {
                    self.diags
                        .error(loc.clone(), format!("unknown arena '{}'", name));
                }
                Type::reference(
                    self.resolve_type_impl(base, loc, lenient),
                    region.clone(),
                    *nullable,
                    *mutable,
                )
            }
            Type::Array { element, size } => {
                Type::array(self.resolve_type_impl(element, loc, lenient), *size)
            }
            Type::Optional { inner } => {
                Type::optional(self.resolve_type_impl(inner, loc, lenient))
            }
            Type::Slice { element } => {
                Type::slice(self.resolve_type_impl(element, loc, lenient))
            }
            Type::Tuple { elements } => Type::tuple(
                elements
                    .iter()
                    .map(|e| self.resolve_type_impl(e, loc, lenient))
                    .collect(),
            ),
            Type::Function {
                ret,
                params,
                variadic,
            } => Type::function(
                self.resolve_type_impl(ret, loc, lenient),
                params
                    .iter()
                    .map(|p| self.resolve_type_impl(p, loc, lenient))
                    .collect(),
                *variadic,
            ),
            _ => ty.clone(),
        }
    }

    /// Like [`resolve_type`], but leaves `Generic` placeholders alone (a
    /// generic signature keeps them until instantiation).
    fn resolve_signature_type(&mut self, ty: &TypeRef, loc: &SourceLoc) -> TypeRef {
        match &**ty {
            Type::Generic { .. } => ty.clone(),
            Type::Pointer { base, is_const } => {
                Type::pointer(self.resolve_signature_type(base, loc), *is_const)
            }
            Type::Reference {
                base,
                region,
                nullable,
                mutable,
            } => Type::reference(
                self.resolve_signature_type(base, loc),
                region.clone(),
                *nullable,
                *mutable,
            ),
            Type::Array { element, size } => {
                Type::array(self.resolve_signature_type(element, loc), *size)
            }
            Type::Optional { inner } => {
                Type::optional(self.resolve_signature_type(inner, loc))
            }
            Type::Slice { element } => {
                Type::slice(self.resolve_signature_type(element, loc))
            }
            Type::Tuple { elements } => Type::tuple(
                elements
                    .iter()
                    .map(|e| self.resolve_signature_type(e, loc))
                    .collect(),
            ),
            _ if type_mentions_generic(ty) => ty.clone(),
            _ => self.resolve_type(ty, loc),
        }
    }

    fn struct_fields(&self, name: &str) -> Option<Vec<StructField>> {
        match self.structs.get(name).map(|t| &**t) {
            Some(Type::Struct { fields, .. }) => Some(fields.clone()),
            _ => None,
        }
    }

    fn struct_is_union(&self, name: &str) -> bool {
        matches!(
            self.structs.get(name).map(|t| &**t),
            Some(Type::Struct { is_union: true, .. })
        )
    }

    // ==================================================================
    // Pass 2: check
    // ==================================================================

    fn check_decl(&mut self, decl: &mut Decl) {
        match decl {
            Decl::Function(f) => {
                if f.generic_params.is_empty() && f.body.is_some() {
                    let mut body = f.body.take();
                    self.check_function_parts(f, body.as_mut());
                    f.body = body;
                }
            }
            Decl::Global(g) => {
                let ty = g.ty.clone().unwrap_or_else(Type::error);
                if let Some(init) = &mut g.init {
                    let init_ty = self.check_expr_at_global(init);
                    if !self.convertible(&init_ty, &ty) {
                        self.diags.error(
                            g.loc.clone(),
                            format!(
                                "cannot initialize '{}' of type '{}' from '{}'",
                                g.name, ty, init_ty
                            ),
                        );
                    }
                }
            }
            Decl::StaticAssert(sa) => {
                // Resolve names now; the compile-time engine evaluates the
                // condition afterwards.
                let loc = sa.loc.clone();
                let ty = self.check_expr_at_global(&mut sa.cond);
                self.require_condition(&ty, &loc, "static_assert condition");
            }
            _ => {}
        }
    }

    /// Globals are checked inside the global scope, with no function
    /// context.
    fn check_expr_at_global(&mut self, e: &mut Expr) -> TypeRef {
        let saved = self.current_ret.take();
        let ty = self.check_expr(e);
        self.current_ret = saved;
        ty
    }

    fn check_function(&mut self, f: &mut FunctionDecl) {
        let mut body = f.body.take();
        self.check_function_parts(f, body.as_mut());
        f.body = body;
    }

    fn check_function_parts(&mut self, f: &FunctionDecl, body: Option<&mut Stmt>) {
        let body = match body {
            Some(b) => b,
            None => return,
        };
        debug!(name = %f.name, "checking function body");

        let saved_ret = self.current_ret.replace(f.return_type.clone());
        self.borrows.clear();
        self.scopes.push();
        let depth = self.scopes.depth();
        for p in &f.params {
            self.scopes.declare(Symbol {
                kind: SymbolKind::Var,
                name: p.name.clone(),
                ty: p.ty.clone(),
                scope_depth: depth,
                is_const: false,
                initialized: true,
            });
        }

        self.check_stmt(body);

        self.borrows.pop_scope(depth);
        self.scopes.pop();
        self.current_ret = saved_ret;
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        let loc = stmt.loc.clone();
        match &mut stmt.kind {
            StmtKind::Compound(stmts) => {
                self.scopes.push();
                let depth = self.scopes.depth();
                for s in stmts {
                    self.check_stmt(s);
                }
                self.borrows.pop_scope(depth);
                self.scopes.pop();
            }
            StmtKind::Expr(e) => {
                self.check_expr(e);
                self.warn_discarded_must_use(e);
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let cond_ty = self.check_expr(cond);
                self.require_condition(&cond_ty, &cond.loc, "if condition");
                self.check_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.check_stmt(e);
                }
            }
            StmtKind::While { cond, body, label } => {
                let cond_ty = self.check_expr(cond);
                self.require_condition(&cond_ty, &cond.loc, "while condition");
                self.loop_labels.push(label.clone());
                self.check_stmt(body);
                self.loop_labels.pop();
            }
            StmtKind::DoWhile { body, cond, label } => {
                self.loop_labels.push(label.clone());
                self.check_stmt(body);
                self.loop_labels.pop();
                let cond_ty = self.check_expr(cond);
                self.require_condition(&cond_ty, &cond.loc, "do-while condition");
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
                label,
            } => {
                self.scopes.push();
                let depth = self.scopes.depth();
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(cond) = cond {
                    let cond_ty = self.check_expr(cond);
                    self.require_condition(&cond_ty, &cond.loc, "for condition");
                }
                if let Some(step) = step {
                    self.check_expr(step);
                }
                self.loop_labels.push(label.clone());
                self.check_stmt(body);
                self.loop_labels.pop();
                self.borrows.pop_scope(depth);
                self.scopes.pop();
            }
            StmtKind::Return(value) => {
                let expected = self
                    .current_ret
                    .clone()
                    .unwrap_or_else(Type::void);
                match value {
                    Some(e) => {
                        let ty = self.check_expr(e);
                        // Stack and arena references must not outlive the
                        // frame that created them.
                        if let Type::Reference { region, .. } = &*ty
                            && matches!(region, Region::Stack | Region::Arena(_))
                        {
                            self.diags.error(
                                e.loc.clone(),
                                format!(
                                    "returning '{}' would let a {} reference escape the function",
                                    ty, region
                                ),
                            );
                        } else if !self.convertible(&ty, &expected) {
                            self.diags.error(
                                e.loc.clone(),
                                format!(
                                    "return type mismatch: expected '{}', got '{}'",
                                    expected, ty
                                ),
                            );
                        }
                    }
                    None => {
                        if !expected.is_void() && !expected.is_error() {
                            self.diags.error(
                                loc,
                                format!("return without a value in a function returning '{}'", expected),
                            );
                        }
                    }
                }
            }
            StmtKind::Break(label) | StmtKind::Continue(label) => {
                match label {
                    Some(l) => {
                        if !self.loop_labels.iter().any(|x| x.as_deref() == Some(l)) {
                            self.diags
                                .error(loc, format!("unknown loop label '{}'", l));
                        }
                    }
                    None => {
                        if self.loop_labels.is_empty() {
                            self.diags.error(loc, "break or continue outside a loop");
                        }
                    }
                }
            }
            StmtKind::Goto(_) => {
                // Accepted by the parser; label scope is not validated and
                // backend support is partial.
                self.diags.warn(loc, "goto is not fully implemented");
            }
            StmtKind::Label { stmt, .. } => self.check_stmt(stmt),
            StmtKind::Var(v) => self.check_var_decl(v, &loc),
            StmtKind::Unsafe(body) => {
                self.scopes.push_with_unsafe(true);
                let depth = self.scopes.depth();
                self.check_stmt(body);
                self.borrows.pop_scope(depth);
                self.scopes.pop();
            }
            StmtKind::Defer(body) | StmtKind::Errdefer(body) => {
                // Bodies type-check here; the backend sequences them on
                // function exit.
                self.check_stmt(body);
            }
            StmtKind::Match { subject, arms } => self.check_match(subject, arms, &loc),
            StmtKind::StaticAssert { cond, .. } => {
                let ty = self.check_expr(cond);
                self.require_condition(&ty, &loc, "static_assert condition");
            }
            StmtKind::Empty => {}
        }
    }

    fn check_var_decl(&mut self, v: &mut VarDecl, loc: &SourceLoc) {
        let ty = self.resolve_type(&v.declared_ty, loc);
        v.ty = Some(ty.clone());

        if let Some(init) = &mut v.init {
            let init_ty = self.check_expr(init);
            if !self.convertible(&init_ty, &ty) {
                self.diags.error(
                    init.loc.clone(),
                    format!(
                        "cannot initialize '{}' of type '{}' from '{}'",
                        v.name, ty, init_ty
                    ),
                );
            }
        }

        if self.scopes.declared_here(&v.name) {
            self.diags
                .error(loc.clone(), format!("redefinition of '{}'", v.name));
        }
        let depth = self.scopes.depth();
        self.scopes.declare(Symbol {
            kind: SymbolKind::Var,
            name: v.name.clone(),
            ty,
            scope_depth: depth,
            is_const: v.is_const,
            initialized: v.init.is_some(),
        });
    }

    fn check_match(&mut self, subject: &mut Expr, arms: &mut [MatchArm], loc: &SourceLoc) {
        let subject_ty = self.check_expr(subject);
        let union_name = match &*subject_ty {
            Type::Struct {
                name,
                is_union: true,
                ..
            } => Some(name.clone()),
            _ => {
                if !subject_ty.is_integer() && !subject_ty.is_error() {
                    self.diags.error(
                        subject.loc.clone(),
                        format!("match subject must be an integer, enum or union, got '{}'", subject_ty),
                    );
                }
                None
            }
        };

        let mut has_wildcard = false;
        for arm in arms.iter_mut() {
            if arm.is_default {
                has_wildcard = true;
            }
            self.scopes.push();
            let depth = self.scopes.depth();
            for pattern in &arm.patterns {
                match pattern {
                    Pattern::Wildcard => has_wildcard = true,
                    Pattern::Int(_) | Pattern::Range(_, _) | Pattern::Char(_) => {
                        if union_name.is_some() {
                            self.diags.error(
                                arm.loc.clone(),
                                "integer pattern cannot match a union value",
                            );
                        }
                    }
                    Pattern::Variant { name, binding } => {
                        let bound_ty = if let Some(u) = &union_name {
                            let fields = self.struct_fields(u).unwrap_or_default();
                            match fields.iter().find(|f| f.name == *name) {
                                Some(field) => field.ty.clone(),
                                None => {
                                    self.diags.error(
                                        arm.loc.clone(),
                                        format!("union '{}' has no variant '{}'", u, name),
                                    );
                                    Type::error()
                                }
                            }
                        } else if self.enum_consts.contains_key(name) {
                            subject_ty.clone()
                        } else {
                            self.diags.error(
                                arm.loc.clone(),
                                format!("unknown pattern '{}'", name),
                            );
                            Type::error()
                        };
                        if let Some(b) = binding {
                            self.scopes.declare(Symbol {
                                kind: SymbolKind::Var,
                                name: b.clone(),
                                ty: bound_ty,
                                scope_depth: depth,
                                is_const: false,
                                initialized: true,
                            });
                        }
                    }
                }
            }
            self.check_stmt(&mut arm.body);
            self.borrows.pop_scope(depth);
            self.scopes.pop();
        }

        if !has_wildcard {
            self.diags
                .warn(loc.clone(), "match is possibly non-exhaustive: no wildcard arm");
        }
    }

    // ==================================================================
    // Expressions
    // ==================================================================

    fn check_expr(&mut self, e: &mut Expr) -> TypeRef {
        // Calls rewrite their own callee (methods, monomorphization), so
        // they work on the whole node.
        if matches!(e.kind, ExprKind::Call { .. }) {
            let ty = self.check_call(e);
            e.ty = Some(ty.clone());
            return ty;
        }

        let loc = e.loc.clone();
        let mut lvalue = false;
        let ty: TypeRef = match &mut e.kind {
            ExprKind::IntLit {
                unsigned,
                long_long,
                ..
            } => match (*unsigned, *long_long) {
                (false, false) => Type::int32(),
                (false, true) => Type::int64(),
                (true, false) => Type::uint32(),
                (true, true) => Type::uint64(),
            },
            ExprKind::FloatLit(_) => Type::float64(),
            ExprKind::BoolLit(_) => Type::bool_(),
            ExprKind::CharLit(_) => Type::char_(),
            ExprKind::StrLit(_) => Type::pointer(Type::char_(), false),
            ExprKind::NullLit => Type::pointer(Type::void(), false),
            ExprKind::Ident { name, resolved } => {
                if let Some(sym) = self.scopes.lookup(name) {
                    lvalue = sym.kind == SymbolKind::Var;
                    *resolved = Some(ResolvedIdent::Var {
                        scope_depth: sym.scope_depth,
                    });
                    sym.ty.clone()
                } else if let Some(sig) = self.fn_sigs.get(name) {
                    *resolved = Some(ResolvedIdent::Fn { name: name.clone() });
                    Type::function(sig.ret.clone(), sig.params.clone(), sig.variadic)
                } else if let Some((value, ty)) = self.enum_consts.get(name) {
                    *resolved = Some(ResolvedIdent::EnumConst { value: *value });
                    ty.clone()
                } else {
                    self.diags
                        .error(loc.clone(), format!("undeclared identifier '{}'", name));
                    Type::error()
                }
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let operand_ty = self.check_expr(operand);
                match op {
                    UnaryOp::Neg | UnaryOp::BitNot => {
                        let ok = if op == UnaryOp::Neg {
                            operand_ty.is_arithmetic()
                        } else {
                            operand_ty.is_integer()
                        };
                        if !ok && !operand_ty.is_error() {
                            self.diags.error(
                                loc.clone(),
                                format!("operator requires a numeric operand, got '{}'", operand_ty),
                            );
                            Type::error()
                        } else {
                            operand_ty
                        }
                    }
                    UnaryOp::Not => {
                        self.require_condition(&operand_ty, &operand.loc, "operand of '!'");
                        Type::bool_()
                    }
                    UnaryOp::AddrOf => self.check_addr_of(operand, &loc),
                    UnaryOp::Deref => {
                        lvalue = true;
                        self.check_deref(&operand_ty, &loc)
                    }
                    UnaryOp::PreInc
                    | UnaryOp::PreDec
                    | UnaryOp::PostInc
                    | UnaryOp::PostDec => {
                        if !operand.is_lvalue && !operand_ty.is_error() {
                            self.diags
                                .error(loc.clone(), "increment target must be an l-value");
                        }
                        if !operand_ty.is_integer() && !operand_ty.is_error() {
                            self.diags.error(
                                loc.clone(),
                                format!("increment requires an integer, got '{}'", operand_ty),
                            );
                        }
                        operand_ty
                    }
                }
            }
            ExprKind::Binary {
                op,
                lhs,
                rhs,
                resolved_operator,
            } => {
                let op = *op;
                let lhs_ty = self.check_expr(lhs);
                let rhs_ty = self.check_expr(rhs);

                // Operator overloading: a struct LHS consults the method
                // registry.
                let lhs_receiver = self.strip_ref(&lhs_ty);
                if let Type::Struct { name, .. } = &*lhs_receiver {
                    let key = format!("{}::operator{}", name, op.token());
                    if let Some(mangled) = self.methods.get(&key).cloned() {
                        *resolved_operator = Some(mangled.clone());
                        let ret = self
                            .fn_sigs
                            .get(&mangled)
                            .map(|s| s.ret.clone())
                            .unwrap_or_else(Type::error);
                        e.ty = Some(ret.clone());
                        return ret;
                    }
                }

                self.check_binary(op, &lhs_ty, &rhs_ty, &loc)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond_ty = self.check_expr(cond);
                self.require_condition(&cond_ty, &cond.loc, "ternary condition");
                let then_ty = self.check_expr(then_expr);
                let else_ty = self.check_expr(else_expr);
                if self.convertible(&else_ty, &then_ty) {
                    then_ty
                } else if self.convertible(&then_ty, &else_ty) {
                    else_ty
                } else {
                    self.diags.error(
                        loc.clone(),
                        format!("ternary branches differ: '{}' vs '{}'", then_ty, else_ty),
                    );
                    Type::error()
                }
            }
            ExprKind::Assign { op, target, value } => {
                let op = *op;
                let target_ty = self.check_expr(target);
                let value_ty = self.check_expr(value);
                self.check_assignment(op, target, &target_ty, value, &value_ty, &loc);
                target_ty
            }
            ExprKind::Call { .. } => unreachable!("calls are handled above"),
            ExprKind::Index {
                base,
                index,
                bounds_check_omit,
            } => {
                let base_ty = self.check_expr(base);
                let index_ty = self.check_expr(index);
                if !index_ty.is_integer() && !index_ty.is_error() {
                    self.diags.error(
                        index.loc.clone(),
                        format!("index must be an integer, got '{}'", index_ty),
                    );
                }
                *bounds_check_omit = self.scopes.in_unsafe();
                lvalue = base.is_lvalue;
                match &*self.strip_ref(&base_ty) {
                    Type::Array { element, size } => {
                        // A literal index against a known size is checked
                        // right here.
                        if let (Some(n), Some(v)) = (size, literal_int(index))
                            && (v < 0 || v as u64 >= *n)
                        {
                            self.diags.error(
                                index.loc.clone(),
                                format!("index {} out of bounds for array of {}", v, n),
                            );
                        }
                        element.clone()
                    }
                    Type::Slice { element } => element.clone(),
                    Type::Pointer { base, .. } => {
                        if !self.scopes.in_unsafe() {
                            self.diags.error(
                                loc.clone(),
                                "raw pointer subscript is forbidden outside unsafe",
                            );
                        }
                        base.clone()
                    }
                    Type::Tuple { elements } => match literal_int(index) {
                        Some(v) if (v as usize) < elements.len() && v >= 0 => {
                            elements[v as usize].clone()
                        }
                        _ => {
                            self.diags.error(
                                index.loc.clone(),
                                "tuple index must be a constant within bounds",
                            );
                            Type::error()
                        }
                    },
                    Type::Error => Type::error(),
                    other => {
                        self.diags.error(
                            loc.clone(),
                            format!("type '{}' cannot be indexed", other),
                        );
                        Type::error()
                    }
                }
            }
            ExprKind::Member {
                base,
                member,
                is_arrow,
            } => {
                let base_ty = self.check_expr(base);
                lvalue = base.is_lvalue || base_ty.is_reference() || base_ty.is_pointer();
                let member = member.clone();
                let is_arrow = *is_arrow;
                self.check_member(&base_ty, &member, is_arrow, &loc)
            }
            ExprKind::Cast { target, operand } => {
                let resolved = self.resolve_type(&target.clone(), &loc);
                *target = resolved.clone();
                let operand_ty = self.check_expr(operand);
                self.check_cast(&operand_ty, &resolved, &loc);
                resolved
            }
            ExprKind::CompoundInit(elements) | ExprKind::TupleLit(elements) => {
                let tys: Vec<TypeRef> =
                    elements.iter_mut().map(|el| self.check_expr(el)).collect();
                Type::tuple(tys)
            }
            ExprKind::SizeofType(ty) => {
                // `sizeof(name)` may name a binding rather than a type.
                let t = ty.clone();
                let resolved = match &*t {
                    Type::Struct { name, defined, .. }
                        if !defined
                            && !self.structs.contains_key(name)
                            && !self.typedefs.contains_key(name)
                            && !self.enums.contains_key(name)
                            && self.scopes.lookup(name).is_some() =>
                    {
                        self.scopes.lookup(name).map(|s| s.ty.clone()).unwrap()
                    }
                    _ => self.resolve_type(&t, &loc),
                };
                *ty = resolved;
                Type::uint64()
            }
            ExprKind::SizeofExpr(inner) => {
                self.check_expr(inner);
                Type::uint64()
            }
            ExprKind::SizeofPack(_) => {
                // Survives only inside an uninstantiated generic body,
                // which is never checked directly.
                self.diags.error(
                    loc.clone(),
                    "sizeof... is only valid inside a generic function",
                );
                Type::error()
            }
            ExprKind::Alignof(ty) | ExprKind::FieldCount(ty) => {
                *ty = self.resolve_type(&ty.clone(), &loc);
                Type::uint64()
            }
            ExprKind::New { region, ty } => {
                let resolved = self.resolve_type(&ty.clone(), &loc);
                *ty = resolved.clone();
                match region {
                    Region::Heap => {}
                    Region::Arena(name) => {
                        if !self.regions.contains_key(name) {
                            self.diags
                                .error(loc.clone(), format!("unknown arena '{}'", name));
                        }
                    }
                    ref other => {
                        self.diags.error(
                            loc.clone(),
                            format!("new<> requires a heap or arena region, got '{}'", other),
                        );
                    }
                }
                Type::reference(resolved, region.clone(), false, true)
            }
            ExprKind::ArenaReset(name) => {
                if !self.regions.contains_key(name) {
                    self.diags
                        .error(loc.clone(), format!("unknown arena '{}'", name));
                }
                Type::void()
            }
            ExprKind::Spawn { func, arg } => {
                let func_ty = self.check_expr(func);
                let arg_ty = self.check_expr(arg);
                // The callee must be a statically known function: a plain
                // function value or a `&static` reference to one.
                let fn_ty = match &*func_ty {
                    Type::Reference {
                        base,
                        region: Region::Static,
                        ..
                    } => base.clone(),
                    _ => func_ty.clone(),
                };
                match &*fn_ty {
                    Type::Function { params, .. } => {
                        if params.len() != 1 {
                            self.diags.error(
                                func.loc.clone(),
                                "spawn callee must take exactly one argument",
                            );
                        } else if !self.convertible(&arg_ty, &params[0]) {
                            self.diags.error(
                                arg.loc.clone(),
                                format!(
                                    "spawn argument type '{}' does not match parameter '{}'",
                                    arg_ty, params[0]
                                ),
                            );
                        }
                    }
                    Type::Error => {}
                    other => {
                        self.diags.error(
                            func.loc.clone(),
                            format!("spawn requires a function, got '{}'", other),
                        );
                    }
                }
                // Thread handles are 64-bit integers.
                Type::int64()
            }
            ExprKind::Try(inner) => {
                let inner_ty = self.check_expr(inner);
                let enclosing_ok = matches!(
                    self.current_ret.as_deref(),
                    Some(Type::Optional { .. }) | Some(Type::Error) | None
                );
                if !enclosing_ok {
                    self.diags.error(
                        loc.clone(),
                        "try requires the enclosing function to return an optional",
                    );
                }
                match &*inner_ty {
                    Type::Optional { inner } => inner.clone(),
                    Type::Error => Type::error(),
                    other => {
                        self.diags.error(
                            loc.clone(),
                            format!("try requires an optional operand, got '{}'", other),
                        );
                        Type::error()
                    }
                }
            }
            ExprKind::UnionInit {
                union_name,
                variant,
                value,
                tag,
            } => {
                let union_name = union_name.clone();
                let variant_name = variant.clone();
                if !self.struct_is_union(&union_name) {
                    self.diags.error(
                        loc.clone(),
                        format!("'{}' is not a tagged union", union_name),
                    );
                    Type::error()
                } else {
                    let fields = self.struct_fields(&union_name).unwrap_or_default();
                    match fields.iter().position(|f| f.name == variant_name) {
                        Some(index) => {
                            *tag = Some(index as i64);
                            let field_ty = fields[index].ty.clone();
                            if let Some(v) = value {
                                let vty = self.check_expr(v);
                                if !self.convertible(&vty, &field_ty) {
                                    self.diags.error(
                                        v.loc.clone(),
                                        format!(
                                            "variant '{}' holds '{}', got '{}'",
                                            variant_name, field_ty, vty
                                        ),
                                    );
                                }
                            }
                            self.structs
                                .get(&union_name)
                                .cloned()
                                .unwrap_or_else(Type::error)
                        }
                        None => {
                            self.diags.error(
                                loc.clone(),
                                format!(
                                    "union '{}' has no variant '{}'",
                                    union_name, variant_name
                                ),
                            );
                            Type::error()
                        }
                    }
                }
            }
        };

        e.ty = Some(ty.clone());
        e.is_lvalue = lvalue;
        ty
    }

    /// `&x`: produces `&stack T` and records a mutable borrow of the
    /// named binding.
    fn check_addr_of(&mut self, operand: &mut Expr, loc: &SourceLoc) -> TypeRef {
        let operand_ty = operand.ty.clone().unwrap_or_else(Type::error);
        if !operand.is_lvalue && !operand_ty.is_error() {
            self.diags
                .error(loc.clone(), "cannot take the address of a non-l-value");
            return Type::error();
        }
        if let Some(name) = root_identifier(operand) {
            let depth = self.scopes.depth();
            let conflict = self.borrows.add(
                &name,
                Borrow {
                    mutable: true,
                    scope_depth: depth,
                },
            );
            if conflict {
                self.diags.error(
                    loc.clone(),
                    format!(
                        "conflicting borrow of '{}': a mutable borrow must be exclusive",
                        name
                    ),
                );
            }
        }
        Type::reference(operand_ty, Region::Stack, false, true)
    }

    fn check_deref(&mut self, operand_ty: &TypeRef, loc: &SourceLoc) -> TypeRef {
        match &**operand_ty {
            Type::Pointer { base, .. } => {
                if !self.scopes.in_unsafe() {
                    self.diags.error(
                        loc.clone(),
                        "raw pointer dereference is forbidden outside unsafe",
                    );
                }
                base.clone()
            }
            Type::Reference {
                base, nullable, ..
            } => {
                if *nullable {
                    self.diags.error(
                        loc.clone(),
                        "cannot dereference a nullable reference without a null check",
                    );
                    Type::error()
                } else {
                    base.clone()
                }
            }
            Type::Error => Type::error(),
            other => {
                self.diags.error(
                    loc.clone(),
                    format!("cannot dereference a value of type '{}'", other),
                );
                Type::error()
            }
        }
    }

    fn check_member(
        &mut self,
        base_ty: &TypeRef,
        member: &str,
        is_arrow: bool,
        loc: &SourceLoc,
    ) -> TypeRef {
        // One implicit dereference through a reference; an explicit arrow
        // goes through a raw pointer and needs unsafe.
        let inner = match &**base_ty {
            Type::Reference {
                base, nullable, ..
            } => {
                if *nullable {
                    self.diags.error(
                        loc.clone(),
                        "cannot access a member of a nullable reference without a null check",
                    );
                    return Type::error();
                }
                base.clone()
            }
            Type::Pointer { base, .. } => {
                if is_arrow && !self.scopes.in_unsafe() {
                    self.diags.error(
                        loc.clone(),
                        "raw pointer member access is forbidden outside unsafe",
                    );
                }
                base.clone()
            }
            _ => base_ty.clone(),
        };

        match &*inner {
            Type::Struct { name, .. } => {
                let fields = self.struct_fields(name).unwrap_or_default();
                match fields.iter().find(|f| f.name == member) {
                    Some(field) => field.ty.clone(),
                    None => {
                        self.diags.error(
                            loc.clone(),
                            format!("struct '{}' has no field '{}'", name, member),
                        );
                        Type::error()
                    }
                }
            }
            Type::Slice { .. } => match member {
                // Slices expose their length.
                "len" => Type::uint64(),
                _ => {
                    self.diags.error(
                        loc.clone(),
                        format!("slice has no member '{}'", member),
                    );
                    Type::error()
                }
            },
            Type::Error => Type::error(),
            other => {
                self.diags.error(
                    loc.clone(),
                    format!("type '{}' has no members", other),
                );
                Type::error()
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinaryOp,
        lhs_ty: &TypeRef,
        rhs_ty: &TypeRef,
        loc: &SourceLoc,
    ) -> TypeRef {
        if lhs_ty.is_error() || rhs_ty.is_error() {
            return Type::error();
        }

        if op.is_logical() {
            self.require_condition(lhs_ty, loc, "logical operand");
            self.require_condition(rhs_ty, loc, "logical operand");
            return Type::bool_();
        }

        if op.is_comparison() {
            let comparable = self.convertible(lhs_ty, rhs_ty)
                || self.convertible(rhs_ty, lhs_ty)
                || self.arithmetic_result(lhs_ty, rhs_ty).is_some();
            if !comparable {
                self.diags.error(
                    loc.clone(),
                    format!("cannot compare '{}' with '{}'", lhs_ty, rhs_ty),
                );
            }
            return Type::bool_();
        }

        // Pointer arithmetic is an unsafe-only raw operation.
        if lhs_ty.is_pointer() || rhs_ty.is_pointer() {
            if !self.scopes.in_unsafe() {
                self.diags.error(
                    loc.clone(),
                    "raw pointer arithmetic is forbidden outside unsafe",
                );
            }
            return if lhs_ty.is_pointer() {
                lhs_ty.clone()
            } else {
                rhs_ty.clone()
            };
        }

        let wants_integer = matches!(
            op,
            BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::Rem
        );
        if wants_integer {
            if !lhs_ty.is_integer() || !rhs_ty.is_integer() {
                self.diags.error(
                    loc.clone(),
                    format!(
                        "operator '{}' requires integer operands, got '{}' and '{}'",
                        op, lhs_ty, rhs_ty
                    ),
                );
                return Type::error();
            }
        } else if !lhs_ty.is_arithmetic() || !rhs_ty.is_arithmetic() {
            self.diags.error(
                loc.clone(),
                format!(
                    "arithmetic requires numeric operands, got '{}' and '{}'",
                    lhs_ty, rhs_ty
                ),
            );
            return Type::error();
        }

        match self.arithmetic_result(lhs_ty, rhs_ty) {
            Some(ty) => ty,
            None => {
                self.diags.error(
                    loc.clone(),
                    format!(
                        "implicit conversion between '{}' and '{}' is not allowed; use an explicit cast",
                        lhs_ty, rhs_ty
                    ),
                );
                Type::error()
            }
        }
    }

    /// The common type of a binary arithmetic expression, per the strict
    /// conversion rules: identity, or 8-bit operands promoting to the
    /// wider integer operand (taking its signedness). Anything else needs
    /// an explicit cast.
    fn arithmetic_result(&self, lhs: &TypeRef, rhs: &TypeRef) -> Option<TypeRef> {
        let l = unwrap_newtype(lhs);
        let r = unwrap_newtype(rhs);
        if l.equals(&r) {
            return Some(l);
        }
        if l.is_eight_bit() && r.is_eight_bit() {
            // Mixed 8-bit interop: keep the left-hand type.
            return Some(l);
        }
        if l.is_eight_bit() && r.is_integer() {
            return Some(r);
        }
        if r.is_eight_bit() && l.is_integer() {
            return Some(l);
        }
        None
    }

    fn check_assignment(
        &mut self,
        op: AssignOp,
        target: &Expr,
        target_ty: &TypeRef,
        value: &Expr,
        value_ty: &TypeRef,
        loc: &SourceLoc,
    ) {
        if !target.is_lvalue && !target_ty.is_error() {
            self.diags
                .error(loc.clone(), "assignment target must be an l-value");
            return;
        }

        // Const bindings are write-once.
        if let ExprKind::Ident { name, .. } = &target.kind {
            let entry = self.scopes.lookup_mut(name);
            if let Some(sym) = entry
                && sym.is_const
            {
                if sym.initialized {
                    self.diags.error(
                        loc.clone(),
                        format!("cannot assign to const binding '{}'", name),
                    );
                } else {
                    sym.initialized = true;
                }
            }
        }

        if let Some(binop) = op.binary_op() {
            self.check_binary(binop, target_ty, value_ty, loc);
        } else if !self.convertible(value_ty, target_ty) {
            self.diags.error(
                value.loc.clone(),
                format!("cannot assign '{}' to '{}'", value_ty, target_ty),
            );
        }

        // A stack or arena reference must not be stored in a binding that
        // outlives the current scope.
        if let Type::Reference { region, .. } = &**value_ty
            && matches!(region, Region::Stack | Region::Arena(_))
            && let ExprKind::Ident { name, .. } = &target.kind
            && let Some(sym) = self.scopes.lookup(name)
            && sym.scope_depth < self.scopes.depth()
        {
            self.diags.error(
                loc.clone(),
                format!(
                    "assignment would let a {} reference escape to an outer scope",
                    region
                ),
            );
        }
    }

    fn check_cast(&mut self, from: &TypeRef, to: &TypeRef, loc: &SourceLoc) {
        let from_s = unwrap_newtype(from);
        let to_s = unwrap_newtype(to);
        if from_s.is_error() || to_s.is_error() {
            return;
        }
        // Reference-to-pointer and integer/pointer punning stay behind
        // unsafe; everything numeric converts freely with an explicit
        // cast.
        let needs_unsafe = (from_s.is_reference() && to_s.is_pointer())
            || (from_s.is_pointer() && to_s.is_integer())
            || (from_s.is_integer() && to_s.is_pointer());
        if needs_unsafe && !self.scopes.in_unsafe() {
            self.diags.error(
                loc.clone(),
                format!(
                    "cast from '{}' to '{}' is forbidden outside unsafe",
                    from, to
                ),
            );
            return;
        }
        let ok = (from_s.is_arithmetic() && to_s.is_arithmetic())
            || (from_s.is_pointer() && to_s.is_pointer())
            || needs_unsafe
            || self.convertible(from, to);
        if !ok {
            self.diags.error(
                loc.clone(),
                format!("invalid cast from '{}' to '{}'", from, to),
            );
        }
    }

    // ==================================================================
    // Calls, methods, monomorphization
    // ==================================================================

    fn check_call(&mut self, e: &mut Expr) -> TypeRef {
        let loc = e.loc.clone();
        let (callee, args, method_base) = match &mut e.kind {
            ExprKind::Call {
                callee,
                args,
                method_base,
            } => (callee, args, method_base),
            _ => unreachable!("check_call on non-call"),
        };

        // Method dispatch: `x.m(args)` consults the registry for the
        // receiver's struct type; a hit rewrites the callee to the mangled
        // function and stashes the receiver for the backend.
        if let ExprKind::Member { base, member, .. } = &mut callee.kind {
            let base_ty = self.check_expr(base);
            let receiver = self.strip_ref(&base_ty);
            if let Type::Struct { name, .. } = &*receiver {
                let key = format!("{}::{}", name, member);
                if let Some(mangled) = self.methods.get(&key).cloned() {
                    let base_owned = std::mem::replace(
                        &mut **base,
                        Expr::int_lit(0, loc.clone()),
                    );
                    *method_base = Some(Box::new(base_owned));
                    **callee = Expr::new(
                        ExprKind::Ident {
                            name: mangled.clone(),
                            resolved: Some(ResolvedIdent::Fn {
                                name: mangled.clone(),
                            }),
                        },
                        loc.clone(),
                    );
                    let sig = self.fn_sigs.get(&mangled).cloned();
                    return match sig {
                        Some(sig) => {
                            // Skip the implicit self when checking
                            // explicit arguments.
                            self.check_args(&sig.params[1..], sig.variadic, args, &loc);
                            callee.ty = Some(Type::function(
                                sig.ret.clone(),
                                sig.params.clone(),
                                sig.variadic,
                            ));
                            sig.ret
                        }
                        None => Type::error(),
                    };
                }
            }
            // Not a method: fall through to an ordinary member access
            // yielding a callable value.
        }

        // Generic call sites monomorphize before ordinary checking.
        if let ExprKind::Ident { name, .. } = &callee.kind {
            let name = name.clone();
            if self.generic_fns.contains_key(&name) {
                let arg_tys: Vec<TypeRef> =
                    args.iter_mut().map(|a| self.check_expr(a)).collect();
                return match self.monomorphize(&name, &arg_tys, &loc) {
                    Some((mangled, sig)) => {
                        **callee = Expr::new(
                            ExprKind::Ident {
                                name: mangled.clone(),
                                resolved: Some(ResolvedIdent::Fn { name: mangled }),
                            },
                            loc.clone(),
                        );
                        for (i, arg) in args.iter().enumerate() {
                            if let Some(param) = sig.params.get(i) {
                                let arg_ty =
                                    arg.ty.clone().unwrap_or_else(Type::error);
                                if !self.convertible(&arg_ty, param) {
                                    self.diags.error(
                                        arg.loc.clone(),
                                        format!(
                                            "argument {}: expected '{}', got '{}'",
                                            i + 1,
                                            param,
                                            arg_ty
                                        ),
                                    );
                                }
                            }
                        }
                        sig.ret
                    }
                    None => Type::error(),
                };
            }
        }

        let callee_ty = self.check_expr(callee);

        // Freestanding builds warn when hosted stdlib functions are
        // called.
        if self.freestanding
            && let ExprKind::Ident { name, .. } = &callee.kind
            && self.stdlib.contains(name)
        {
            self.diags.warn(
                loc.clone(),
                format!("call to hosted standard library function '{}' in freestanding mode", name),
            );
        }

        match &*callee_ty {
            Type::Function {
                ret,
                params,
                variadic,
            } => {
                let params = params.clone();
                let ret = ret.clone();
                let variadic = *variadic;
                self.check_args(&params, variadic, args, &loc);
                ret
            }
            Type::Error => Type::error(),
            other => {
                self.diags.error(
                    loc.clone(),
                    format!("callee is not callable: '{}'", other),
                );
                Type::error()
            }
        }
    }

    fn check_args(
        &mut self,
        params: &[TypeRef],
        variadic: bool,
        args: &mut [Expr],
        loc: &SourceLoc,
    ) {
        let count_ok = if variadic {
            args.len() >= params.len()
        } else {
            args.len() == params.len()
        };
        if !count_ok {
            self.diags.error(
                loc.clone(),
                format!(
                    "wrong number of arguments: expected {}{}, got {}",
                    params.len(),
                    if variadic { "+" } else { "" },
                    args.len()
                ),
            );
        }
        for (i, arg) in args.iter_mut().enumerate() {
            let arg_ty = self.check_expr(arg);
            if let Some(param) = params.get(i)
                && !self.convertible(&arg_ty, param)
            {
                self.diags.error(
                    arg.loc.clone(),
                    format!("argument {}: expected '{}', got '{}'", i + 1, param, arg_ty),
                );
            }
        }
    }

    /// Infers type arguments for a generic call, reuses or creates the
    /// mono clone, and returns its mangled name and signature.
    fn monomorphize(
        &mut self,
        name: &str,
        arg_tys: &[TypeRef],
        loc: &SourceLoc,
    ) -> Option<(String, FnSig)> {
        let decl = self.generic_fns.get(name)?.clone();

        // Unify each generic-containing parameter against the argument.
        let mut subs: HashMap<String, TypeRef> = HashMap::new();
        let pack_param = decl.generic_params.iter().find(|gp| gp.is_pack);
        let scalar_params = if pack_param.is_some() {
            decl.params.len().saturating_sub(1)
        } else {
            decl.params.len()
        };

        for (param, arg) in decl.params.iter().take(scalar_params).zip(arg_tys) {
            unify(&param.ty, arg, &mut subs);
        }

        let mut pack = None;
        if let Some(gp) = pack_param {
            let pack_count = arg_tys.len().saturating_sub(scalar_params);
            let pack_name = decl
                .params
                .last()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            for (i, arg) in arg_tys.iter().skip(scalar_params).enumerate() {
                subs.insert(format!("{}__{}", gp.name, i), arg.clone());
            }
            pack = Some(PackExpansion {
                type_name: gp.name.clone(),
                param_name: pack_name,
                count: pack_count,
            });
        }

        // Every generic parameter must bind.
        for gp in &decl.generic_params {
            if gp.is_pack {
                continue;
            }
            let bound = match subs.get(&gp.name) {
                Some(ty) => ty.clone(),
                None => {
                    self.diags.error(
                        loc.clone(),
                        format!(
                            "cannot infer type for generic parameter '{}' of '{}'",
                            gp.name, name
                        ),
                    );
                    return None;
                }
            };
            if let Some(constraint) = &gp.constraint
                && !self.satisfies_trait(&bound, constraint)
            {
                self.diags.error(
                    loc.clone(),
                    format!(
                        "type '{}' does not satisfy constraint '{}' on '{}'",
                        bound, constraint, gp.name
                    ),
                );
            }
        }

        // Cache key: the function name plus the printed type arguments.
        let mut arg_strs: Vec<String> = Vec::new();
        let mut mangle_parts: Vec<String> = Vec::new();
        for gp in &decl.generic_params {
            if gp.is_pack {
                let p = pack.as_ref().unwrap();
                for i in 0..p.count {
                    if let Some(t) = subs.get(&p.element_key(i)) {
                        arg_strs.push(t.to_string());
                        mangle_parts.push(t.mangle());
                    }
                }
            } else if let Some(t) = subs.get(&gp.name) {
                arg_strs.push(t.to_string());
                mangle_parts.push(t.mangle());
            }
        }
        let key = format!("{}<{}>", name, arg_strs.join(","));
        if let Some(mangled) = self.mono_done.get(&key) {
            let sig = self.fn_sigs.get(mangled).cloned()?;
            return Some((mangled.clone(), sig));
        }

        let mangled = format!("__safec_{}_{}", name, mangle_parts.join("_"));
        debug!(key = %key, mangled = %mangled, "instantiating generic function");
        let clone =
            instantiate::clone_function_decl(&decl, &subs, &mangled, pack.as_ref());

        let sig = FnSig {
            params: clone.params.iter().map(|p| p.ty.clone()).collect(),
            ret: clone.return_type.clone(),
            flags: clone.flags,
            variadic: clone.variadic,
            is_generic: false,
            has_body: clone.body.is_some(),
        };
        self.fn_sigs.insert(mangled.clone(), sig.clone());
        self.mono_done.insert(key, mangled.clone());
        self.pending_mono.push(clone);
        Some((mangled, sig))
    }

    /// The `Owner::method` → mangled-name registry, for the backend
    /// handoff.
    pub fn method_registry(&self) -> &HashMap<String, String> {
        &self.methods
    }

    /// Declared arena regions with literal capacities, for the backend
    /// handoff.
    pub fn region_descriptors(&self) -> Vec<(String, Option<u64>)> {
        let mut regions: Vec<(String, Option<u64>)> = self
            .regions
            .iter()
            .map(|(name, info)| {
                let capacity = info
                    .capacity
                    .as_ref()
                    .and_then(literal_int)
                    .and_then(|v| u64::try_from(v).ok());
                (name.clone(), capacity)
            })
            .collect();
        regions.sort();
        regions
    }

    fn satisfies_trait(&self, ty: &TypeRef, constraint: &str) -> bool {
        let ty = unwrap_newtype(ty);
        if ty.is_error() || ty.is_arithmetic() {
            return true;
        }
        let required = match TRAIT_TABLE.iter().find(|(name, _)| *name == constraint) {
            Some((_, ops)) => ops,
            None => return false,
        };
        if let Type::Struct { name, .. } = &*ty {
            required
                .iter()
                .all(|op| self.methods.contains_key(&format!("{}::{}", name, op)))
        } else {
            false
        }
    }

    // ==================================================================
    // Conversions
    // ==================================================================

    /// The strictly enumerated implicit conversions. `Error` absorbs
    /// everything so one diagnosis does not fan out.
    fn convertible(&self, from: &TypeRef, to: &TypeRef) -> bool {
        let from = unwrap_newtype(from);
        let to = unwrap_newtype(to);

        if from.is_error() || to.is_error() {
            return true;
        }
        if from.equals(&to) {
            return true;
        }
        // 8-bit interop: Bool/Char/Int8/UInt8 are mutually assignable.
        if from.is_eight_bit() && to.is_eight_bit() {
            return true;
        }
        // Character promotion into any integer.
        if matches!(&*from, Type::Char) && to.is_integer() {
            return true;
        }
        // Bool ↔ integer.
        if (matches!(&*from, Type::Bool) && to.is_integer())
            || (from.is_integer() && matches!(&*to, Type::Bool))
        {
            return true;
        }
        // Enum → its underlying integer class.
        if matches!(&*from, Type::Enum { .. }) && to.is_integer() {
            return true;
        }

        match (&*from, &*to) {
            // Array decay to a pointer over the same (or 8-bit) element.
            (
                Type::Array { element, .. },
                Type::Pointer { base, .. },
            ) => element.equals(base) || (element.is_eight_bit() && base.is_eight_bit()),
            // void* converts to any pointer; null (typed void*) also fills
            // optionals and nullable references.
            (Type::Pointer { base, .. }, Type::Pointer { .. }) if base.is_void() => true,
            (Type::Pointer { base, .. }, Type::Optional { .. }) if base.is_void() => true,
            (Type::Pointer { base, .. }, Type::Reference { nullable: true, .. })
                if base.is_void() =>
            {
                true
            }
            // References decay to raw pointers for static/heap/arena
            // regions (stack references never escape into pointers).
            (
                Type::Reference {
                    base,
                    region,
                    nullable: false,
                    ..
                },
                Type::Pointer { base: pbase, .. },
            ) => {
                !matches!(region, Region::Stack)
                    && (pbase.is_void() || base.equals(pbase))
            }
            // Reference-to-reference: same region and base; non-null may
            // widen to nullable, mutable may weaken to immutable.
            (
                Type::Reference {
                    base: fb,
                    region: fr,
                    nullable: fnul,
                    mutable: fm,
                },
                Type::Reference {
                    base: tb,
                    region: tr,
                    nullable: tnul,
                    mutable: tm,
                },
            ) => fr == tr && fb.equals(tb) && (*tnul || !*fnul) && (*fm || !*tm),
            // Arrays view as slices of the same element.
            (Type::Array { element, .. }, Type::Slice { element: se }) => {
                element.equals(se)
            }
            // A value wraps into an optional of a compatible inner type.
            (_, Type::Optional { inner }) => self.convertible(&from, inner),
            // Compound/tuple initializers fill structs, arrays and tuples
            // elementwise.
            (Type::Tuple { elements }, Type::Struct { name, .. }) => {
                match self.struct_fields(name) {
                    Some(fields) => {
                        fields.len() == elements.len()
                            && elements
                                .iter()
                                .zip(&fields)
                                .all(|(e, f)| self.convertible(e, &f.ty))
                    }
                    None => false,
                }
            }
            (
                Type::Tuple { elements },
                Type::Array {
                    element,
                    size,
                },
            ) => {
                size.is_none_or(|n| n as usize == elements.len())
                    && elements.iter().all(|e| self.convertible(e, element))
            }
            (Type::Tuple { elements: fe }, Type::Tuple { elements: te }) => {
                fe.len() == te.len()
                    && fe.iter().zip(te).all(|(a, b)| self.convertible(a, b))
            }
            _ => false,
        }
    }

    // ==================================================================
    // Small helpers
    // ==================================================================

    fn require_condition(&mut self, ty: &TypeRef, loc: &SourceLoc, what: &str) {
        if !ty.is_condition() {
            self.diags.error(
                loc.clone(),
                format!("{} must be an integer, bool, pointer or reference, got '{}'", what, ty),
            );
        }
    }

    /// One level of reference unwrap, for receivers and struct operands.
    fn strip_ref(&self, ty: &TypeRef) -> TypeRef {
        match &**ty {
            Type::Reference { base, .. } => base.clone(),
            Type::Pointer { base, .. } => base.clone(),
            _ => ty.clone(),
        }
    }

    fn warn_discarded_must_use(&mut self, e: &Expr) {
        if let ExprKind::Call { callee, .. } = &e.kind
            && let ExprKind::Ident { name, .. } = &callee.kind
            && let Some(sig) = self.fn_sigs.get(name)
            && sig.flags.must_use
        {
            self.diags.warn(
                e.loc.clone(),
                format!("discarded result of must_use function '{}'", name),
            );
        }
    }
}

/// The root named binding of an l-value chain (`x`, `x.f`, `x[i]`).
fn root_identifier(e: &Expr) -> Option<String> {
    match &e.kind {
        ExprKind::Ident { name, .. } => Some(name.clone()),
        ExprKind::Member { base, .. } => root_identifier(base),
        ExprKind::Index { base, .. } => root_identifier(base),
        _ => None,
    }
}

/// A literal (possibly negated) integer, for compile-time bounds checks
/// and enum values.
fn literal_int(e: &Expr) -> Option<i64> {
    match &e.kind {
        ExprKind::IntLit { value, .. } => Some(*value as i64),
        ExprKind::CharLit(c) => Some(*c as i64),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => literal_int(operand).map(|v| -v),
        _ => None,
    }
}

fn unwrap_newtype(ty: &TypeRef) -> TypeRef {
    match &**ty {
        Type::Newtype { base, .. } => unwrap_newtype(base),
        _ => ty.clone(),
    }
}

fn type_mentions_generic(ty: &TypeRef) -> bool {
    match &**ty {
        Type::Generic { .. } => true,
        Type::Pointer { base, .. } => type_mentions_generic(base),
        Type::Reference { base, .. } => type_mentions_generic(base),
        Type::Array { element, .. } => type_mentions_generic(element),
        Type::Optional { inner } => type_mentions_generic(inner),
        Type::Slice { element } => type_mentions_generic(element),
        Type::Tuple { elements } => elements.iter().any(type_mentions_generic),
        Type::Function { ret, params, .. } => {
            type_mentions_generic(ret) || params.iter().any(type_mentions_generic)
        }
        _ => false,
    }
}

/// Structural unification of a generic-bearing parameter type against a
/// concrete argument type. Mismatched shapes are ignored here; the later
/// argument-type check reports them.
fn unify(pattern: &TypeRef, concrete: &TypeRef, subs: &mut HashMap<String, TypeRef>) {
    match (&**pattern, &**concrete) {
        (Type::Generic { name, .. }, _) => {
            subs.entry(name.clone()).or_insert_with(|| concrete.clone());
        }
        (Type::Pointer { base: p, .. }, Type::Pointer { base: c, .. }) => unify(p, c, subs),
        (
            Type::Reference { base: p, .. },
            Type::Reference { base: c, .. },
        ) => unify(p, c, subs),
        (Type::Array { element: p, .. }, Type::Array { element: c, .. }) => {
            unify(p, c, subs)
        }
        (Type::Optional { inner: p }, Type::Optional { inner: c }) => unify(p, c, subs),
        (Type::Slice { element: p }, Type::Slice { element: c }) => unify(p, c, subs),
        (Type::Tuple { elements: p }, Type::Tuple { elements: c }) => {
            for (pe, ce) in p.iter().zip(c) {
                unify(pe, ce, subs);
            }
        }
        (
            Type::Function {
                ret: pr, params: pp, ..
            },
            Type::Function {
                ret: cr, params: cp, ..
            },
        ) => {
            unify(pr, cr, subs);
            for (pe, ce) in pp.iter().zip(cp) {
                unify(pe, ce, subs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn analyze(source: &str) -> (TranslationUnit, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let tokens = Lexer::new(source, "test.sc", &mut diags).tokenize();
        let mut unit = Parser::new(tokens, &mut diags).parse();
        let mut analyzer = Analyzer::new(&mut diags, AnalyzerOptions::default());
        analyzer.run(&mut unit);
        drop(analyzer);
        (unit, diags)
    }

    fn analyze_ok(source: &str) -> TranslationUnit {
        let (unit, diags) = analyze(source);
        assert_eq!(
            diags.error_count(),
            0,
            "unexpected errors: {:?}",
            diags.diagnostics()
        );
        unit
    }

    fn errors_of(source: &str) -> Vec<String> {
        let (_, diags) = analyze(source);
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
    fn test_simple_program_clean() {
        analyze_ok("int add(int a, int b) { return a + b; } int main() { return add(1, 2); }");
    }

    #[test]
    fn test_undeclared_identifier() {
        let errs = errors_of("int main() { return missing; }");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("undeclared identifier 'missing'"));
    }

    #[test]
    fn test_error_type_suppresses_cascades() {
        // One unknown name, used repeatedly: one diagnostic.
        let errs = errors_of("int main() { int x = missing; int y = x + 1; return y; }");
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn test_stack_escape_on_return() {
        let errs = errors_of("&stack int leak() { int x = 3; return &x; }");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("&stack int"));
        assert!(errs[0].contains("escape"));
    }

    #[test]
    fn test_nullable_deref_rejected() {
        let errs = errors_of("int f(?&stack int p) { return *p; }");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("nullable reference"));
        assert!(errs[0].contains("null check"));
    }

    #[test]
    fn test_nullable_member_rejected() {
        let errs = errors_of(
            "struct P { int x; } int f(?&stack P p) { return p.x; }",
        );
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("null check"));
    }

    #[test]
    fn test_borrow_conflict() {
        let errs = errors_of(
            "int main() { int x = 0; &stack int a = &x; &stack int b = &x; return 0; }",
        );
        assert!(!errs.is_empty());
        assert!(errs.iter().any(|m| m.contains("borrow")));
    }

    #[test]
    fn test_borrows_released_on_scope_pop() {
        analyze_ok(
            "int main() { int x = 0; { &stack int a = &x; } { &stack int b = &x; } return 0; }",
        );
    }

    #[test]
    fn test_generic_identity_monomorphized() {
        let unit = analyze_ok("generic<T> T id(T x) { return x; } int main() { return id(42); }");
        let mono = unit
            .find_function("__safec_id_int")
            .expect("mono clone must be appended to the unit");
        assert!(mono.return_type.equals(&Type::Int32));
        assert!(mono.params[0].ty.equals(&Type::Int32));
        assert!(mono.generic_params.is_empty());

        // The call site was redirected to the clone.
        let main = unit.find_function("main").unwrap();
        let body = match &main.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Call { callee, .. },
                ..
            })) => match &callee.kind {
                ExprKind::Ident { name, .. } => assert_eq!(name, "__safec_id_int"),
                other => panic!("expected redirected ident, got {:?}", other),
            },
            other => panic!("expected return call, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_idempotence() {
        let unit = analyze_ok(
            "generic<T> T id(T x) { return x; }\n\
             int main() { int a = id(1); int b = id(2); double c = id(1.5); return a + b; }",
        );
        let clones: Vec<_> = unit
            .decls
            .iter()
            .filter_map(|d| match d {
                Decl::Function(f) if f.name.starts_with("__safec_id_") => Some(&f.name),
                _ => None,
            })
            .collect();
        // Two int calls share one clone; the double call gets its own.
        assert_eq!(clones.len(), 2, "clones: {:?}", clones);
    }

    #[test]
    fn test_generic_inference_failure() {
        let errs = errors_of(
            "generic<T, U> T first(T x) { return x; } int main() { return first(1); }",
        );
        assert!(errs.iter().any(|m| m.contains("cannot infer")));
    }

    #[test]
    fn test_generic_constraint() {
        let errs = errors_of(
            "struct P { int x; }\n\
             generic<T: Numeric> T twice(T x) { return x + x; }\n\
             int main() { P p; twice(p); return 0; }",
        );
        assert!(errs.iter().any(|m| m.contains("constraint 'Numeric'")));
    }

    #[test]
    fn test_method_dispatch() {
        let unit = analyze_ok(
            "struct Counter { int n; }\n\
             int Counter::get() const { return self.n; }\n\
             int main() { Counter c; c.n = 3; return c.get(); }",
        );
        // Collection mangled the method and registered the owner.
        assert!(unit.find_function("Counter_get").is_some());
        let main = unit.find_function("main").unwrap();
        let body = match &main.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[2].kind {
            StmtKind::Return(Some(Expr {
                kind:
                    ExprKind::Call {
                        callee,
                        method_base,
                        ..
                    },
                ..
            })) => {
                assert!(method_base.is_some(), "receiver must be stashed");
                match &callee.kind {
                    ExprKind::Ident { name, .. } => assert_eq!(name, "Counter_get"),
                    other => panic!("expected mangled callee, got {:?}", other),
                }
            }
            other => panic!("expected return call, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_overload_resolution() {
        let unit = analyze_ok(
            "struct V { int x; }\n\
             V V::operator+(V other) { V r; r.x = self.x + other.x; return r; }\n\
             int main() { V a; V b; V c = a + b; return c.x; }",
        );
        let main = unit.find_function("main").unwrap();
        let body = match &main.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[2].kind {
            StmtKind::Var(v) => match &v.init.as_ref().unwrap().kind {
                ExprKind::Binary {
                    resolved_operator, ..
                } => {
                    assert_eq!(resolved_operator.as_deref(), Some("V_operator+"));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_unsafe_gates_raw_pointers() {
        let errs = errors_of("int f(int* p) { return *p; }");
        assert!(errs.iter().any(|m| m.contains("outside unsafe")));

        analyze_ok("int f(int* p) { unsafe { return *p; } return 0; }");
    }

    #[test]
    fn test_pointer_arithmetic_needs_unsafe() {
        let errs = errors_of("int* f(int* p) { return p + 1; }");
        assert!(errs.iter().any(|m| m.contains("pointer arithmetic")));
    }

    #[test]
    fn test_bounds_check_omit_in_unsafe() {
        let unit = analyze_ok(
            "int f() { int xs[4]; unsafe { return xs[2]; } return 0; }",
        );
        let f = unit.find_function("f").unwrap();
        // Walk to the subscript inside the unsafe block.
        fn find_index(stmt: &Stmt) -> Option<bool> {
            match &stmt.kind {
                StmtKind::Compound(stmts) => stmts.iter().find_map(find_index),
                StmtKind::Unsafe(inner) => find_index(inner),
                StmtKind::Return(Some(Expr {
                    kind: ExprKind::Index {
                        bounds_check_omit, ..
                    },
                    ..
                })) => Some(*bounds_check_omit),
                _ => None,
            }
        }
        assert_eq!(find_index(f.body.as_ref().unwrap()), Some(true));
    }

    #[test]
    fn test_constant_index_bounds() {
        let errs = errors_of("int f() { int xs[4]; return xs[9]; }");
        assert!(errs.iter().any(|m| m.contains("out of bounds")));
    }

    #[test]
    fn test_strict_integer_widening() {
        let errs = errors_of("i64 f(int x) { i64 y = 0; return y + x; }");
        assert!(errs.iter().any(|m| m.contains("explicit cast")));
    }

    #[test]
    fn test_eight_bit_interop_and_promotion() {
        // char + int promotes to int; u8 + int takes int's signedness.
        analyze_ok("int f(char c, int i) { return c + i; }");
        analyze_ok("int g(u8 b, int i) { return b + i; }");
        analyze_ok("bool h(bool a, char c) { return a; }");
    }

    #[test]
    fn test_const_write_once() {
        let errs = errors_of("int main() { const int x = 1; x = 2; return x; }");
        assert!(errs.iter().any(|m| m.contains("const")));
        // Deferred single initialization is fine.
        analyze_ok("int main() { const int x; x = 2; return x; }");
    }

    #[test]
    fn test_stack_ref_cannot_escape_to_outer_binding() {
        let errs = errors_of(
            "int main() { &stack int r = &0; return 0; }",
        );
        // Address of a literal is rejected as a non-l-value.
        assert!(!errs.is_empty());

        let errs = errors_of(
            "int main() { ?&stack int keep; { int x = 1; keep = &x; } return 0; }",
        );
        assert!(errs.iter().any(|m| m.contains("escape")));
    }

    #[test]
    fn test_match_exhaustiveness_warning() {
        let (_, diags) = analyze(
            "int f(int x) { match (x) { case 1: return 1; } return 0; }",
        );
        assert_eq!(diags.error_count(), 0);
        assert!(
            diags
                .diagnostics()
                .iter()
                .any(|d| d.message.contains("non-exhaustive"))
        );
    }

    #[test]
    fn test_match_on_union_with_binding() {
        analyze_ok(
            "union Shape { int circle; int square; }\n\
             int area(Shape s) {\n\
               match (s) {\n\
                 case circle(r): return r;\n\
                 case square(w): return w;\n\
                 default: return 0;\n\
               }\n\
             }",
        );
    }

    #[test]
    fn test_union_constructor_tags() {
        let unit = analyze_ok(
            "union Shape { int circle; int square; }\n\
             Shape mk() { return Shape::square(4); }",
        );
        let f = unit.find_function("mk").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::UnionInit { tag, .. },
                ..
            })) => assert_eq!(*tag, Some(1)),
            other => panic!("expected union init, got {:?}", other),
        }
    }

    #[test]
    fn test_try_requires_optional() {
        analyze_ok(
            "?int source() { return null; } ?int f() { int v = try source(); return v; }",
        );
        let errs = errors_of("?int source() { return null; } int f() { return try source(); }");
        assert!(errs.iter().any(|m| m.contains("optional")));
    }

    #[test]
    fn test_spawn_and_join_types() {
        analyze_ok(
            "int worker(void* arg) { return 0; }\n\
             int main() { i64 h = spawn(worker, null); return (int)join(h); }",
        );
        let errs = errors_of("int main() { i64 h = spawn(3, null); return 0; }");
        assert!(errs.iter().any(|m| m.contains("spawn requires a function")));
    }

    #[test]
    fn test_typeof_resolution() {
        analyze_ok("int main() { int x = 1; typeof(x) y = x; return y; }");
    }

    #[test]
    fn test_region_and_new() {
        analyze_ok(
            "region scratch capacity 4096;\n\
             void f() { &arena<scratch> int p = new<scratch> int; arena_reset<scratch>(); }",
        );
        let errs = errors_of("void f() { new<nowhere> int; }");
        assert!(errs.iter().any(|m| m.contains("unknown arena")));
    }

    #[test]
    fn test_arena_return_escape() {
        let errs = errors_of(
            "region scratch capacity 64;\n\
             &arena<scratch> int f() { return new<scratch> int; }",
        );
        assert!(errs.iter().any(|m| m.contains("escape")));
    }

    #[test]
    fn test_forward_declaration_merges() {
        analyze_ok("int f(int x); int f(int x) { return x; } int main() { return f(1); }");
        let errs = errors_of("int f() { return 1; } int f() { return 2; }");
        assert!(errs.iter().any(|m| m.contains("redefinition")));
    }

    #[test]
    fn test_must_use_warning() {
        let (_, diags) = analyze(
            "must_use int important() { return 1; } int main() { important(); return 0; }",
        );
        assert_eq!(diags.error_count(), 0);
        assert!(
            diags
                .diagnostics()
                .iter()
                .any(|d| d.message.contains("must_use"))
        );
    }

    #[test]
    fn test_ternary_branch_mismatch() {
        let errs = errors_of(
            "struct P { int x; } int main(int c) { P p; int v = c ? 1 : p; return v; }",
        );
        assert!(errs.iter().any(|m| m.contains("ternary branches differ")));
    }

    #[test]
    fn test_typedef_alias() {
        analyze_ok("typedef i64 Handle; Handle get() { return (Handle)7; }");
    }

    #[test]
    fn test_recursive_struct_through_registry() {
        analyze_ok(
            "struct Node { int value; Node* next; }\n\
             int head_value(Node* n) { unsafe { return n->value; } return 0; }",
        );
    }

    #[test]
    fn test_compound_init_into_struct() {
        analyze_ok("struct P { int x; int y; } int main() { P p = { 1, 2 }; return p.x; }");
        let errs =
            errors_of("struct P { int x; int y; } int main() { P p = { 1 }; return p.x; }");
        assert!(!errs.is_empty());
    }

    #[test]
    fn test_wrong_argument_count() {
        let errs = errors_of("int f(int a) { return a; } int main() { return f(1, 2); }");
        assert!(errs.iter().any(|m| m.contains("wrong number of arguments")));
    }

    #[test]
    fn test_variadic_extern_call() {
        analyze_ok(
            "extern int printf(char* fmt, ...);\n\
             int main() { printf(\"%d %d\", 1, 2); return 0; }",
        );
    }
}
