//! Diagnostics engine for the SafeC front end
//!
//! Every pass reports through one `Diagnostics` value. Errors are
//! recoverable: a pass keeps going after reporting, substituting the
//! `Error` type where a value is required, and the caller decides whether
//! to proceed by checking `error_count()`.

use std::fmt;
use std::rc::Rc;

/// A position in a source file. File names are interned as `Rc<str>` so
/// every token and AST node can carry one cheaply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: Rc<str>,
    /// 1-indexed line
    pub line: u32,
    /// 1-indexed column
    pub col: u32,
}

impl SourceLoc {
    pub fn new(file: Rc<str>, line: u32, col: u32) -> Self {
        SourceLoc { file, line, col }
    }

    /// A location for synthesized nodes with no source position.
    pub fn builtin() -> Self {
        SourceLoc {
            file: Rc::from("<builtin>"),
            line: 0,
            col: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// Severity of a diagnostic. Only `Error` and `Fatal` count toward the
/// error total; all four levels share the same rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Note,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Note => "note",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// A single recorded diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub loc: SourceLoc,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.loc, self.level, self.message)
    }
}

/// Collects diagnostics across all passes, in emission order.
///
/// Diagnostics are printed to stderr as they are recorded, so output order
/// follows source order within a pass.
pub struct Diagnostics {
    recorded: Vec<Diagnostic>,
    errors: usize,
    /// When false, nothing is printed (the record is still kept).
    echo: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            recorded: Vec::new(),
            errors: 0,
            echo: true,
        }
    }

    /// A quiet engine that records without printing. Used by tests and by
    /// embedders that render diagnostics themselves.
    pub fn silent() -> Self {
        Diagnostics {
            recorded: Vec::new(),
            errors: 0,
            echo: false,
        }
    }

    fn record(&mut self, level: Level, loc: SourceLoc, message: String) {
        let diag = Diagnostic { level, loc, message };
        if matches!(level, Level::Error | Level::Fatal) {
            self.errors += 1;
        }
        if self.echo {
            eprintln!("{}", diag);
        }
        self.recorded.push(diag);
    }

    pub fn note(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.record(Level::Note, loc, message.into());
    }

    pub fn warn(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.record(Level::Warning, loc, message.into());
    }

    pub fn error(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.record(Level::Error, loc, message.into());
    }

    /// Fatal diagnostics count as errors; whether to abort is the caller's
    /// decision.
    pub fn fatal(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.record(Level::Fatal, loc, message.into());
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.recorded
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: u32, col: u32) -> SourceLoc {
        SourceLoc::new(Rc::from("test.sc"), line, col)
    }

    #[test]
    fn test_error_counting() {
        let mut diags = Diagnostics::silent();
        diags.note(loc(1, 1), "a note");
        diags.warn(loc(2, 1), "a warning");
        assert!(!diags.has_errors());

        diags.error(loc(3, 1), "an error");
        diags.fatal(loc(4, 1), "a fatal");
        assert_eq!(diags.error_count(), 2);
        assert!(diags.has_errors());
        assert_eq!(diags.diagnostics().len(), 4);
    }

    #[test]
    fn test_rendering() {
        let d = Diagnostic {
            level: Level::Error,
            loc: loc(3, 7),
            message: "undeclared identifier 'x'".to_string(),
        };
        assert_eq!(
            format!("{}", d),
            "test.sc:3:7: error: undeclared identifier 'x'"
        );
    }

    #[test]
    fn test_emission_order_is_preserved() {
        let mut diags = Diagnostics::silent();
        diags.error(loc(1, 1), "first");
        diags.warn(loc(5, 1), "second");
        diags.error(loc(9, 1), "third");
        let msgs: Vec<_> = diags
            .diagnostics()
            .iter()
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(msgs, vec!["first", "second", "third"]);
    }
}
