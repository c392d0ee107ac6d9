//! SafeC compiler CLI
//!
//! Drives the front end over one input file. Code generation is a
//! collaborator behind the `Backend` trait; this build carries only the
//! `NullBackend`, so `--emit-llvm`/`-o` report that no backend is linked.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use safec::backend::Backend;
use safec::{CompileOptions, Diagnostics, NullBackend, SourceLoc, compile_source, preprocess_source};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use tracing::info;

#[derive(ClapParser)]
#[command(name = "safec")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SafeC compiler front end", long_about = None)]
struct Cli {
    /// Input source file
    input: Option<PathBuf>,

    /// Output path (defaults to standard output)
    #[arg(short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Emit textual IR instead of bitcode
    #[arg(long = "emit-llvm")]
    emit_llvm: bool,

    /// Dump a human-readable AST and exit
    #[arg(long = "dump-ast")]
    dump_ast: bool,

    /// Dump the preprocessed text and exit
    #[arg(long = "dump-preprocessed")]
    dump_preprocessed: bool,

    /// Skip semantic analysis
    #[arg(long = "no-sema")]
    no_sema: bool,

    /// Verbose progress to standard error
    #[arg(short = 'v')]
    verbose: bool,

    /// Include search path (repeatable)
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Define a macro: NAME or NAME=VALUE (repeatable)
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// Enable function-like macros, '#' and '##'
    #[arg(long = "compat-preprocessor")]
    compat_preprocessor: bool,

    /// Warn on hosted standard library calls
    #[arg(long)]
    freestanding: bool,

    /// Print a shell completion script and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "safec", &mut io::stdout());
        return;
    }

    init_tracing(cli.verbose);

    let input = match &cli.input {
        Some(path) => path.clone(),
        None => {
            eprintln!("error: no input file");
            process::exit(2);
        }
    };
    let source = match fs::read_to_string(&input) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", input.display(), e);
            process::exit(2);
        }
    };
    let filename = input.to_string_lossy().into_owned();

    let options = CompileOptions {
        include_paths: cli.include.clone(),
        defines: cli.define.iter().map(|d| parse_define(d)).collect(),
        compat_preprocessor: cli.compat_preprocessor,
        freestanding: cli.freestanding,
        no_sema: cli.no_sema,
    };

    let mut diags = Diagnostics::new();

    if cli.dump_preprocessed {
        let text = preprocess_source(&source, &filename, &options, &mut diags);
        if !diags.has_errors() {
            write_output(cli.output.as_deref(), text.as_bytes());
        }
        exit_with(&diags);
    }

    let output = compile_source(&source, &filename, &options, &mut diags);
    info!(
        errors = diags.error_count(),
        "front end finished for {}", filename
    );

    let output = match output {
        Some(out) => out,
        None => exit_with(&diags),
    };

    if cli.dump_ast {
        let dump = format!("{:#?}\n", output.unit);
        write_output(cli.output.as_deref(), dump.as_bytes());
        exit_with(&diags);
    }

    if cli.emit_llvm || cli.output.is_some() {
        let mut context = output.context;
        context.emit_text = cli.emit_llvm;
        let mut backend = NullBackend;
        match backend.emit(&output.unit, &context, &mut diags) {
            Ok(bytes) => write_output(cli.output.as_deref(), &bytes),
            Err(e) => diags.fatal(SourceLoc::builtin(), e),
        }
    }

    exit_with(&diags);
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// `NAME` defines to 1; `NAME=VALUE` carries the value.
fn parse_define(spec: &str) -> (String, Option<String>) {
    match spec.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (spec.to_string(), None),
    }
}

fn write_output(path: Option<&std::path::Path>, bytes: &[u8]) {
    let result = match path {
        Some(path) => fs::write(path, bytes),
        None => io::stdout().write_all(bytes),
    };
    if let Err(e) = result {
        eprintln!("error: cannot write output: {}", e);
        process::exit(2);
    }
}

fn exit_with(diags: &Diagnostics) -> ! {
    process::exit(if diags.has_errors() { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define_forms() {
        assert_eq!(parse_define("DEBUG"), ("DEBUG".to_string(), None));
        assert_eq!(
            parse_define("LIMIT=32"),
            ("LIMIT".to_string(), Some("32".to_string()))
        );
        assert_eq!(
            parse_define("MSG=a=b"),
            ("MSG".to_string(), Some("a=b".to_string()))
        );
    }

    #[test]
    fn test_cli_parses_flag_surface() {
        let cli = Cli::try_parse_from([
            "safec",
            "main.sc",
            "-o",
            "out.bc",
            "--emit-llvm",
            "-I",
            "include",
            "-I",
            "vendor",
            "-D",
            "DEBUG",
            "-D",
            "LIMIT=8",
            "--compat-preprocessor",
            "--freestanding",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.input.as_deref(), Some(std::path::Path::new("main.sc")));
        assert!(cli.emit_llvm);
        assert_eq!(cli.include.len(), 2);
        assert_eq!(cli.define.len(), 2);
        assert!(cli.compat_preprocessor);
        assert!(cli.freestanding);
        assert!(cli.verbose);
    }
}
