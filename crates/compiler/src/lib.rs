//! SafeC compiler front end
//!
//! Lowers SafeC source text through the full front-end pipeline:
//! preprocess → lex → parse → semantic analysis (two passes, with generic
//! monomorphization) → compile-time evaluation. The result is a fully
//! typed, monomorphized [`TranslationUnit`] plus the registries a
//! code-generation backend consumes (see [`backend`]).
//!
//! ```rust,ignore
//! use safec::{CompileOptions, Diagnostics, compile_source};
//!
//! let mut diags = Diagnostics::new();
//! let out = compile_source(source, "main.sc", &CompileOptions::default(), &mut diags);
//! if let Some(out) = out {
//!     my_backend.emit(&out.unit, &out.context, &mut diags)?;
//! }
//! ```

pub mod analyzer;
pub mod ast;
pub mod backend;
pub mod consteval;
pub mod diagnostics;
pub mod instantiate;
pub mod lexer;
pub mod parser;
pub mod preprocessor;
pub mod scope;
pub mod stdlib_surface;
pub mod token;
pub mod types;

pub use analyzer::{Analyzer, AnalyzerOptions};
pub use ast::TranslationUnit;
pub use backend::{Backend, BackendContext, HeaderImporter, NullBackend, RegionDescriptor};
pub use consteval::{ConstEval, ConstValue};
pub use diagnostics::{Diagnostic, Diagnostics, Level, SourceLoc};
pub use lexer::Lexer;
pub use parser::Parser;
pub use preprocessor::{Preprocessor, PreprocessorOptions};
pub use stdlib_surface::StdlibSurface;
pub use types::{Region, Type, TypeRef};

use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// `-I` include search paths, in order.
    pub include_paths: Vec<PathBuf>,
    /// `-D NAME[=VALUE]` command-line defines.
    pub defines: Vec<(String, Option<String>)>,
    /// Enable function-like macros, `#` and `##`.
    pub compat_preprocessor: bool,
    /// Warn on hosted-stdlib calls.
    pub freestanding: bool,
    /// Stop after parsing.
    pub no_sema: bool,
}

/// A finished front-end run: the typed unit plus the backend handoff
/// context.
pub struct CompileOutput {
    pub unit: TranslationUnit,
    pub context: BackendContext,
}

/// Runs only the preprocessor; used by `--dump-preprocessed` and by tests
/// of the line-preservation property.
pub fn preprocess_source(
    source: &str,
    filename: &str,
    options: &CompileOptions,
    diags: &mut Diagnostics,
) -> String {
    let pp_options = PreprocessorOptions {
        compat_mode: options.compat_preprocessor,
        include_paths: options.include_paths.clone(),
        defines: options.defines.clone(),
        ..Default::default()
    };
    Preprocessor::new(pp_options, diags).process(source, filename)
}

/// Runs the whole front end over one source text. Returns `None` when any
/// stage reported errors; the diagnostics engine holds the details either
/// way.
pub fn compile_source(
    source: &str,
    filename: &str,
    options: &CompileOptions,
    diags: &mut Diagnostics,
) -> Option<CompileOutput> {
    let errors_at_start = diags.error_count();

    debug!(file = filename, "preprocessing");
    let preprocessed = preprocess_source(source, filename, options, diags);

    debug!("lexing");
    let tokens = Lexer::new(&preprocessed, filename, diags).tokenize();

    debug!("parsing");
    let mut unit = Parser::new(tokens, diags).parse();
    if diags.error_count() > errors_at_start {
        return None;
    }

    if options.no_sema {
        return Some(CompileOutput {
            unit,
            context: BackendContext::default(),
        });
    }

    debug!("semantic analysis");
    let mut analyzer = Analyzer::new(
        diags,
        AnalyzerOptions {
            freestanding: options.freestanding,
        },
    );
    let sema_ok = analyzer.run(&mut unit);
    let context = BackendContext {
        method_registry: analyzer.method_registry().clone(),
        regions: analyzer
            .region_descriptors()
            .into_iter()
            .map(|(name, capacity)| RegionDescriptor { name, capacity })
            .collect(),
        emit_text: false,
    };
    drop(analyzer);
    if !sema_ok {
        return None;
    }

    debug!("compile-time evaluation");
    let mut engine = ConstEval::new(diags);
    let const_ok = engine.run(&mut unit);
    drop(engine);
    if !const_ok {
        return None;
    }

    Some(CompileOutput { unit, context })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Decl, ExprKind, StmtKind};

    fn compile(source: &str) -> (Option<CompileOutput>, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let out = compile_source(source, "test.sc", &CompileOptions::default(), &mut diags);
        (out, diags)
    }

    #[test]
    fn test_scenario_static_assert_true() {
        let (out, diags) = compile("static_assert(1 + 2 == 3, \"sum\");");
        assert!(out.is_some());
        assert_eq!(diags.diagnostics().len(), 0);
    }

    #[test]
    fn test_scenario_static_assert_false() {
        let (out, diags) = compile("static_assert(1 == 2, \"nope\");");
        assert!(out.is_none());
        assert_eq!(diags.error_count(), 1);
        assert!(
            diags.diagnostics()[0]
                .message
                .contains("static_assert failed: nope")
        );
    }

    #[test]
    fn test_scenario_stack_escape() {
        let (out, diags) = compile("&stack int leak() { int x = 3; return &x; }");
        assert!(out.is_none());
        assert_eq!(diags.error_count(), 1);
        let msg = &diags.diagnostics()[0].message;
        assert!(msg.contains("&stack int"), "got: {}", msg);
        assert!(msg.contains("escape"), "got: {}", msg);
    }

    #[test]
    fn test_scenario_nullable_deref() {
        let (out, diags) = compile("int f(?&stack int p) { return *p; }");
        assert!(out.is_none());
        assert_eq!(diags.error_count(), 1);
        let msg = &diags.diagnostics()[0].message;
        assert!(msg.contains("nullable reference"), "got: {}", msg);
        assert!(msg.contains("null check"), "got: {}", msg);
    }

    #[test]
    fn test_scenario_generic_identity() {
        let (out, diags) = compile("generic<T> T id(T x) { return x; } int main() { return id(42); }");
        assert_eq!(diags.error_count(), 0, "{:?}", diags.diagnostics());
        let out = out.unwrap();
        let mono = out
            .unit
            .find_function("__safec_id_int")
            .expect("mono clone present in unit");
        assert!(mono.return_type.equals(&Type::Int32));
        assert!(mono.params[0].ty.equals(&Type::Int32));
    }

    #[test]
    fn test_scenario_borrow_conflict() {
        let (_, diags) = compile(
            "int main() { int x = 0; &stack int a = &x; &stack int b = &x; return 0; }",
        );
        assert!(diags.error_count() >= 1);
        assert!(
            diags
                .diagnostics()
                .iter()
                .any(|d| d.message.contains("borrow"))
        );
    }

    #[test]
    fn test_scenario_preprocessor_conditional() {
        let source = "#define A 1\n#if A\nint x = 1;\n#else\nint x = 2;\n#endif\n";
        let mut diags = Diagnostics::silent();
        let text =
            preprocess_source(source, "test.sc", &CompileOptions::default(), &mut diags);
        assert_eq!(diags.error_count(), 0);
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines[2], "int x = 1;");
        for (i, line) in lines.iter().enumerate() {
            if i != 2 && i < 6 {
                assert_eq!(*line, "", "line {} should be blank", i + 1);
            }
        }
        // And the selected branch is the only declaration that survives.
        let (out, diags) = compile(source);
        assert_eq!(diags.error_count(), 0);
        let unit = out.unwrap().unit;
        assert_eq!(unit.decls.len(), 1);
    }

    #[test]
    fn test_budget_enforcement_blocks_output() {
        let (out, diags) = compile(
            "consteval int spin() { int i = 0; while (1) { i++; } return i; }\n\
             const int S = spin();",
        );
        assert!(out.is_none(), "no output may be produced");
        assert!(
            diags
                .diagnostics()
                .iter()
                .any(|d| d.message.contains("iterations"))
        );
    }

    #[test]
    fn test_pipeline_defines_flow_through() {
        let mut diags = Diagnostics::silent();
        let options = CompileOptions {
            defines: vec![("LIMIT".to_string(), Some("16".to_string()))],
            ..Default::default()
        };
        let out = compile_source(
            "static_assert(LIMIT == 16, \"limit\"); int xs[LIMIT];",
            "test.sc",
            &options,
            &mut diags,
        );
        assert!(out.is_some(), "{:?}", diags.diagnostics());
    }

    #[test]
    fn test_no_sema_stops_after_parse() {
        let mut diags = Diagnostics::silent();
        let options = CompileOptions {
            no_sema: true,
            ..Default::default()
        };
        // This would fail semantic analysis, but parses fine.
        let out = compile_source(
            "int main() { return undefined_name; }",
            "test.sc",
            &options,
            &mut diags,
        );
        assert!(out.is_some());
        assert_eq!(diags.error_count(), 0);
    }

    #[test]
    fn test_backend_context_carries_registries() {
        let (out, diags) = compile(
            "region scratch capacity 4096;\n\
             struct V { int x; }\n\
             int V::get() const { return self.x; }\n\
             int main() { V v; v.x = 1; return v.get(); }",
        );
        assert_eq!(diags.error_count(), 0, "{:?}", diags.diagnostics());
        let out = out.unwrap();
        assert_eq!(
            out.context.method_registry.get("V::get").map(String::as_str),
            Some("V_get")
        );
        assert_eq!(out.context.regions.len(), 1);
        assert_eq!(out.context.regions[0].name, "scratch");
        assert_eq!(out.context.regions[0].capacity, Some(4096));
    }

    #[test]
    fn test_typed_unit_handoff() {
        // Every expression in the finished unit carries a resolved type.
        let (out, _) = compile("int add(int a, int b) { return a + b; } int main() { return add(1, 2); }");
        let unit = out.unwrap().unit;
        for decl in &unit.decls {
            if let Decl::Function(f) = decl
                && let Some(body) = &f.body
                && let StmtKind::Compound(stmts) = &body.kind
                && let StmtKind::Return(Some(e)) = &stmts[0].kind
            {
                assert!(e.ty.is_some(), "untyped expression in {}", f.name);
                if let ExprKind::Binary { lhs, rhs, .. } = &e.kind {
                    assert!(lhs.ty.is_some());
                    assert!(rhs.ty.is_some());
                }
            }
        }
    }
}
