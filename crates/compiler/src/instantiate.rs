//! AST cloning and type substitution for generic instantiation.
//!
//! Monomorphization deep-clones a generic function declaration while
//! replacing `Generic{name}` types with the inferred concrete types.
//! Identifier resolution slots are cleared so the analyzer re-resolves the
//! clone from scratch; secondary flags (`is_lvalue`, `bounds_check_omit`,
//! the tagged unary kind, the union tag) survive the copy.

use crate::ast::*;
use crate::types::{Type, TypeRef};
use std::collections::HashMap;
use std::rc::Rc;

/// How a `T... xs` pack parameter expands at one instantiation.
#[derive(Debug, Clone)]
pub struct PackExpansion {
    /// The pack's generic type name (`T`). Element substitutions are
    /// keyed `T__0`, `T__1`, ….
    pub type_name: String,
    /// The pack parameter's value name (`xs`), expanded to `xs0`, `xs1`, ….
    pub param_name: String,
    pub count: usize,
}

impl PackExpansion {
    pub fn element_key(&self, index: usize) -> String {
        format!("{}__{}", self.type_name, index)
    }

    pub fn element_name(&self, index: usize) -> String {
        format!("{}{}", self.param_name, index)
    }
}

/// Rewrites a type under a substitution map. `Generic{n}` becomes
/// `subs[n]`; an *undefined* struct whose name matches a key is also
/// replaced (the parser stores cast targets in bodies as struct-by-name).
pub fn substitute_type(ty: &TypeRef, subs: &HashMap<String, TypeRef>) -> TypeRef {
    match &**ty {
        Type::Generic { name, .. } => subs.get(name).cloned().unwrap_or_else(|| ty.clone()),
        Type::Struct { name, defined, .. } if !defined => {
            subs.get(name).cloned().unwrap_or_else(|| ty.clone())
        }
        Type::Pointer { base, is_const } => {
            Type::pointer(substitute_type(base, subs), *is_const)
        }
        Type::Reference {
            base,
            region,
            nullable,
            mutable,
        } => Type::reference(
            substitute_type(base, subs),
            region.clone(),
            *nullable,
            *mutable,
        ),
        Type::Array { element, size } => Type::array(substitute_type(element, subs), *size),
        Type::Function {
            ret,
            params,
            variadic,
        } => Type::function(
            substitute_type(ret, subs),
            params.iter().map(|p| substitute_type(p, subs)).collect(),
            *variadic,
        ),
        Type::Tuple { elements } => {
            Type::tuple(elements.iter().map(|e| substitute_type(e, subs)).collect())
        }
        Type::Optional { inner } => Type::optional(substitute_type(inner, subs)),
        Type::Slice { element } => Type::slice(substitute_type(element, subs)),
        Type::Newtype { name, base } => {
            Rc::new(Type::Newtype {
                name: name.clone(),
                base: substitute_type(base, subs),
            })
        }
        _ => ty.clone(),
    }
}

struct Cloner<'a> {
    subs: &'a HashMap<String, TypeRef>,
    pack: Option<&'a PackExpansion>,
}

pub fn clone_expr(
    expr: &Expr,
    subs: &HashMap<String, TypeRef>,
    pack: Option<&PackExpansion>,
) -> Expr {
    Cloner { subs, pack }.expr(expr)
}

pub fn clone_stmt(
    stmt: &Stmt,
    subs: &HashMap<String, TypeRef>,
    pack: Option<&PackExpansion>,
) -> Stmt {
    Cloner { subs, pack }.stmt(stmt)
}

/// Clones a generic function declaration into a concrete instance named
/// `mangled`. Parameter and return types go through substitution, the
/// generic parameter list is cleared, and a pack parameter is expanded
/// into `count` scalar parameters.
pub fn clone_function_decl(
    decl: &FunctionDecl,
    subs: &HashMap<String, TypeRef>,
    mangled: &str,
    pack: Option<&PackExpansion>,
) -> FunctionDecl {
    let cloner = Cloner { subs, pack };

    let mut params = Vec::new();
    for param in &decl.params {
        // The pack type may still be spelled struct-by-name if collection
        // has not rewritten it to `Generic` yet.
        let is_pack_param = pack.is_some_and(|p| {
            param.name == p.param_name
                && match &*param.ty {
                    Type::Generic { name, .. } => *name == p.type_name,
                    Type::Struct { name, defined, .. } => !defined && *name == p.type_name,
                    _ => false,
                }
        });
        if is_pack_param {
            let pack = pack.unwrap();
            for i in 0..pack.count {
                let elem_ty = subs
                    .get(&pack.element_key(i))
                    .cloned()
                    .unwrap_or_else(Type::error);
                params.push(Param {
                    name: pack.element_name(i),
                    ty: elem_ty,
                    loc: param.loc.clone(),
                });
            }
        } else {
            params.push(Param {
                name: param.name.clone(),
                ty: substitute_type(&param.ty, subs),
                loc: param.loc.clone(),
            });
        }
    }

    FunctionDecl {
        name: mangled.to_string(),
        params,
        return_type: substitute_type(&decl.return_type, subs),
        generic_params: Vec::new(),
        flags: decl.flags,
        variadic: decl.variadic,
        owner: decl.owner.clone(),
        body: decl.body.as_ref().map(|b| cloner.stmt(b)),
        loc: decl.loc.clone(),
    }
}

impl Cloner<'_> {
    fn ty(&self, ty: &TypeRef) -> TypeRef {
        substitute_type(ty, self.subs)
    }

    fn stmt(&self, stmt: &Stmt) -> Stmt {
        let kind = match &stmt.kind {
            StmtKind::Compound(stmts) => {
                StmtKind::Compound(stmts.iter().map(|s| self.stmt(s)).collect())
            }
            StmtKind::Expr(e) => StmtKind::Expr(self.expr(e)),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
                is_const,
                const_result,
            } => StmtKind::If {
                cond: self.expr(cond),
                then_branch: Box::new(self.stmt(then_branch)),
                else_branch: else_branch.as_ref().map(|s| Box::new(self.stmt(s))),
                is_const: *is_const,
                const_result: *const_result,
            },
            StmtKind::While { cond, body, label } => StmtKind::While {
                cond: self.expr(cond),
                body: Box::new(self.stmt(body)),
                label: label.clone(),
            },
            StmtKind::DoWhile { body, cond, label } => StmtKind::DoWhile {
                body: Box::new(self.stmt(body)),
                cond: self.expr(cond),
                label: label.clone(),
            },
            StmtKind::For {
                init,
                cond,
                step,
                body,
                label,
            } => StmtKind::For {
                init: init.as_ref().map(|s| Box::new(self.stmt(s))),
                cond: cond.as_ref().map(|e| self.expr(e)),
                step: step.as_ref().map(|e| self.expr(e)),
                body: Box::new(self.stmt(body)),
                label: label.clone(),
            },
            StmtKind::Return(value) => StmtKind::Return(value.as_ref().map(|e| self.expr(e))),
            StmtKind::Break(label) => StmtKind::Break(label.clone()),
            StmtKind::Continue(label) => StmtKind::Continue(label.clone()),
            StmtKind::Goto(label) => StmtKind::Goto(label.clone()),
            StmtKind::Label { name, stmt } => StmtKind::Label {
                name: name.clone(),
                stmt: Box::new(self.stmt(stmt)),
            },
            StmtKind::Var(v) => StmtKind::Var(VarDecl {
                name: v.name.clone(),
                declared_ty: self.ty(&v.declared_ty),
                ty: v.ty.as_ref().map(|t| self.ty(t)),
                init: v.init.as_ref().map(|e| self.expr(e)),
                is_const: v.is_const,
                is_static: v.is_static,
            }),
            StmtKind::Unsafe(body) => StmtKind::Unsafe(Box::new(self.stmt(body))),
            StmtKind::Defer(body) => StmtKind::Defer(Box::new(self.stmt(body))),
            StmtKind::Errdefer(body) => StmtKind::Errdefer(Box::new(self.stmt(body))),
            StmtKind::Match { subject, arms } => StmtKind::Match {
                subject: self.expr(subject),
                arms: arms
                    .iter()
                    .map(|arm| MatchArm {
                        patterns: arm.patterns.clone(),
                        body: self.stmt(&arm.body),
                        is_default: arm.is_default,
                        loc: arm.loc.clone(),
                    })
                    .collect(),
            },
            StmtKind::StaticAssert { cond, message } => StmtKind::StaticAssert {
                cond: self.expr(cond),
                message: message.clone(),
            },
            StmtKind::Empty => StmtKind::Empty,
        };
        Stmt {
            kind,
            loc: stmt.loc.clone(),
        }
    }

    fn expr(&self, expr: &Expr) -> Expr {
        let kind = match &expr.kind {
            ExprKind::IntLit {
                value,
                unsigned,
                long_long,
            } => ExprKind::IntLit {
                value: *value,
                unsigned: *unsigned,
                long_long: *long_long,
            },
            ExprKind::FloatLit(v) => ExprKind::FloatLit(*v),
            ExprKind::BoolLit(v) => ExprKind::BoolLit(*v),
            ExprKind::CharLit(v) => ExprKind::CharLit(*v),
            ExprKind::StrLit(s) => ExprKind::StrLit(s.clone()),
            ExprKind::NullLit => ExprKind::NullLit,
            // Resolution is cleared; the analyzer re-resolves inside the
            // clone.
            ExprKind::Ident { name, .. } => ExprKind::Ident {
                name: name.clone(),
                resolved: None,
            },
            ExprKind::Unary { op, operand } => ExprKind::Unary {
                op: *op,
                operand: Box::new(self.expr(operand)),
            },
            ExprKind::Binary {
                op,
                lhs,
                rhs,
                resolved_operator: _,
            } => ExprKind::Binary {
                op: *op,
                lhs: Box::new(self.expr(lhs)),
                rhs: Box::new(self.expr(rhs)),
                resolved_operator: None,
            },
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => ExprKind::Ternary {
                cond: Box::new(self.expr(cond)),
                then_expr: Box::new(self.expr(then_expr)),
                else_expr: Box::new(self.expr(else_expr)),
            },
            ExprKind::Assign { op, target, value } => ExprKind::Assign {
                op: *op,
                target: Box::new(self.expr(target)),
                value: Box::new(self.expr(value)),
            },
            ExprKind::Call {
                callee,
                args,
                method_base: _,
            } => {
                // A pack argument expands into its element names.
                let mut cloned_args = Vec::new();
                for arg in args {
                    let pack_hit = match (&arg.kind, self.pack) {
                        (ExprKind::Ident { name, .. }, Some(p)) if *name == p.param_name => {
                            Some(p)
                        }
                        _ => None,
                    };
                    match pack_hit {
                        Some(p) => {
                            for i in 0..p.count {
                                cloned_args.push(Expr::new(
                                    ExprKind::Ident {
                                        name: p.element_name(i),
                                        resolved: None,
                                    },
                                    arg.loc.clone(),
                                ));
                            }
                        }
                        None => cloned_args.push(self.expr(arg)),
                    }
                }
                ExprKind::Call {
                    callee: Box::new(self.expr(callee)),
                    args: cloned_args,
                    method_base: None,
                }
            }
            ExprKind::Index {
                base,
                index,
                bounds_check_omit,
            } => ExprKind::Index {
                base: Box::new(self.expr(base)),
                index: Box::new(self.expr(index)),
                bounds_check_omit: *bounds_check_omit,
            },
            ExprKind::Member {
                base,
                member,
                is_arrow,
            } => ExprKind::Member {
                base: Box::new(self.expr(base)),
                member: member.clone(),
                is_arrow: *is_arrow,
            },
            ExprKind::Cast { target, operand } => ExprKind::Cast {
                target: self.ty(target),
                operand: Box::new(self.expr(operand)),
            },
            ExprKind::CompoundInit(elements) => {
                ExprKind::CompoundInit(elements.iter().map(|e| self.expr(e)).collect())
            }
            ExprKind::TupleLit(elements) => {
                ExprKind::TupleLit(elements.iter().map(|e| self.expr(e)).collect())
            }
            ExprKind::SizeofType(ty) => ExprKind::SizeofType(self.ty(ty)),
            ExprKind::SizeofExpr(inner) => ExprKind::SizeofExpr(Box::new(self.expr(inner))),
            // `sizeof...(pack)` becomes a literal once the pack size is
            // known.
            ExprKind::SizeofPack(name) => match self.pack {
                Some(p) if p.type_name == *name => ExprKind::IntLit {
                    value: p.count as u64,
                    unsigned: false,
                    long_long: false,
                },
                _ => ExprKind::SizeofPack(name.clone()),
            },
            ExprKind::Alignof(ty) => ExprKind::Alignof(self.ty(ty)),
            ExprKind::FieldCount(ty) => ExprKind::FieldCount(self.ty(ty)),
            ExprKind::New { region, ty } => ExprKind::New {
                region: region.clone(),
                ty: self.ty(ty),
            },
            ExprKind::ArenaReset(name) => ExprKind::ArenaReset(name.clone()),
            ExprKind::Spawn { func, arg } => ExprKind::Spawn {
                func: Box::new(self.expr(func)),
                arg: Box::new(self.expr(arg)),
            },
            ExprKind::Try(inner) => ExprKind::Try(Box::new(self.expr(inner))),
            ExprKind::UnionInit {
                union_name,
                variant,
                value,
                tag,
            } => ExprKind::UnionInit {
                union_name: union_name.clone(),
                variant: variant.clone(),
                value: value.as_ref().map(|e| Box::new(self.expr(e))),
                tag: *tag,
            },
        };
        Expr {
            kind,
            loc: expr.loc.clone(),
            ty: expr.ty.as_ref().map(|t| self.ty(t)),
            is_lvalue: expr.is_lvalue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, SourceLoc};
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn subs_of(pairs: &[(&str, TypeRef)]) -> HashMap<String, TypeRef> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn parse_fn(source: &str) -> FunctionDecl {
        let mut diags = Diagnostics::silent();
        let tokens = Lexer::new(source, "test.sc", &mut diags).tokenize();
        let unit = Parser::new(tokens, &mut diags).parse();
        assert_eq!(diags.error_count(), 0, "{:?}", diags.diagnostics());
        unit.decls
            .into_iter()
            .find_map(|d| match d {
                Decl::Function(f) => Some(f),
                _ => None,
            })
            .expect("no function parsed")
    }

    #[test]
    fn test_substitute_generic() {
        let subs = subs_of(&[("T", Type::int32())]);
        let ty = Type::generic("T", None);
        assert!(substitute_type(&ty, &subs).equals(&Type::Int32));

        let ptr = Type::pointer(Type::generic("T", None), false);
        let subbed = substitute_type(&ptr, &subs);
        assert!(subbed.equals(&Type::pointer(Type::int32(), false)));
    }

    #[test]
    fn test_substitute_undefined_struct_by_name() {
        // Cast targets in bodies are stored struct-by-name; substitution
        // must catch them too.
        let subs = subs_of(&[("T", Type::int64())]);
        let named = Type::named_struct("T");
        assert!(substitute_type(&named, &subs).equals(&Type::Int64));
    }

    #[test]
    fn test_substitution_leaves_unrelated_types() {
        let subs = subs_of(&[("T", Type::int32())]);
        let ty = Type::named_struct("Point");
        assert!(substitute_type(&ty, &subs).equals(&*Type::named_struct("Point")));
    }

    #[test]
    fn test_clone_function_substitutes_signature_and_body() {
        let decl = parse_fn("generic<T> T id(T x) { T y = x; return y; }");
        let subs = subs_of(&[("T", Type::int32())]);
        let mono = clone_function_decl(&decl, &subs, "__safec_id_int", None);

        assert_eq!(mono.name, "__safec_id_int");
        assert!(mono.generic_params.is_empty());
        assert!(mono.return_type.equals(&Type::Int32));
        assert!(mono.params[0].ty.equals(&Type::Int32));

        // The body's declared type was substituted as well.
        let body = match &mono.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Var(v) => assert!(v.declared_ty.equals(&Type::Int32)),
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_clone_clears_resolution() {
        let decl = parse_fn("generic<T> T id(T x) { return x; }");
        let subs = subs_of(&[("T", Type::int32())]);
        let mono = clone_function_decl(&decl, &subs, "__safec_id_int", None);
        let body = match &mono.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Ident { resolved, .. },
                ..
            })) => assert!(resolved.is_none()),
            other => panic!("expected return ident, got {:?}", other),
        }
    }

    #[test]
    fn test_pack_expansion() {
        let decl = parse_fn(
            "generic<T...> int count(T... xs) { return sizeof...(T) + helper(xs); }",
        );
        let pack = PackExpansion {
            type_name: "T".to_string(),
            param_name: "xs".to_string(),
            count: 3,
        };
        let subs = subs_of(&[
            ("T__0", Type::int32()),
            ("T__1", Type::bool_()),
            ("T__2", Type::float64()),
        ]);
        let mono = clone_function_decl(&decl, &subs, "__safec_count_3", Some(&pack));

        // `T... xs` expanded into three scalar parameters.
        let names: Vec<_> = mono.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["xs0", "xs1", "xs2"]);
        assert!(mono.params[1].ty.equals(&Type::Bool));

        let body = match &mono.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Binary { lhs, rhs, .. },
                ..
            })) => {
                // sizeof...(T) became the literal 3.
                match &lhs.kind {
                    ExprKind::IntLit { value, .. } => assert_eq!(*value, 3),
                    other => panic!("expected literal, got {:?}", other),
                }
                // The pack argument expanded into xs0, xs1, xs2.
                match &rhs.kind {
                    ExprKind::Call { args, .. } => {
                        assert_eq!(args.len(), 3);
                        match &args[2].kind {
                            ExprKind::Ident { name, .. } => assert_eq!(name, "xs2"),
                            other => panic!("expected ident, got {:?}", other),
                        }
                    }
                    other => panic!("expected call, got {:?}", other),
                }
            }
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn test_secondary_flags_survive_clone() {
        let mut e = Expr::int_lit(1, SourceLoc::builtin());
        e.is_lvalue = true;
        let idx = Expr::new(
            ExprKind::Index {
                base: Box::new(e),
                index: Box::new(Expr::int_lit(0, SourceLoc::builtin())),
                bounds_check_omit: true,
            },
            SourceLoc::builtin(),
        );
        let cloned = clone_expr(&idx, &HashMap::new(), None);
        match cloned.kind {
            ExprKind::Index {
                bounds_check_omit,
                base,
                ..
            } => {
                assert!(bounds_check_omit);
                assert!(base.is_lvalue);
            }
            other => panic!("expected index, got {:?}", other),
        }
    }
}
