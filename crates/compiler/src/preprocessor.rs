//! Text-to-text preprocessor.
//!
//! Classical C preprocessing restricted to "safe mode" by default:
//! object-like `#define` only, no `##` pasting, no `#` stringification.
//! `--compat-preprocessor` lifts the restriction and enables full
//! function-like macro substitution.
//!
//! Every directive line is replaced by an empty line and backslash
//! continuations are re-padded, so diagnostics from later stages keep the
//! original line numbers. Included files are inlined where the `#include`
//! stood.

use crate::backend::HeaderImporter;
use crate::diagnostics::{Diagnostics, SourceLoc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Search directories for `#include <...>` after the `-I` paths.
const SYSTEM_INCLUDE_DIRS: &[&str] = &["/usr/local/include", "/usr/include"];

const DEFAULT_MAX_INCLUDE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct PreprocessorOptions {
    /// Enables function-like macros, `#` stringification and `##` pasting.
    pub compat_mode: bool,
    pub max_include_depth: usize,
    /// `-I` directories, in command-line order.
    pub include_paths: Vec<PathBuf>,
    /// `-D NAME[=VALUE]` command-line definitions.
    pub defines: Vec<(String, Option<String>)>,
}

impl Default for PreprocessorOptions {
    fn default() -> Self {
        PreprocessorOptions {
            compat_mode: false,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            include_paths: Vec::new(),
            defines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MacroDef {
    /// `Some` for function-like macros (compat mode only).
    params: Option<Vec<String>>,
    body: String,
}

/// One open conditional. `active` is this branch's own verdict; the region
/// emits only when every frame on the stack is active.
struct CondFrame {
    active: bool,
    any_branch_taken: bool,
    seen_else: bool,
    loc: SourceLoc,
}

pub struct Preprocessor<'a> {
    opts: PreprocessorOptions,
    diags: &'a mut Diagnostics,
    macros: HashMap<String, MacroDef>,
    pragma_once: HashSet<PathBuf>,
    importer: Option<&'a dyn HeaderImporter>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(opts: PreprocessorOptions, diags: &'a mut Diagnostics) -> Self {
        let mut pp = Preprocessor {
            opts,
            diags,
            macros: HashMap::new(),
            pragma_once: HashSet::new(),
            importer: None,
        };
        for (name, value) in pp.opts.defines.clone() {
            pp.macros.insert(
                name,
                MacroDef {
                    params: None,
                    body: value.unwrap_or_else(|| "1".to_string()),
                },
            );
        }
        pp
    }

    /// Attach a C-header importer consulted for unresolved `#include <...>`.
    pub fn with_importer(mut self, importer: &'a dyn HeaderImporter) -> Self {
        self.importer = Some(importer);
        self
    }

    /// Preprocess a whole source text. Diagnostics are reported through
    /// the engine; the returned text is still usable after errors.
    pub fn process(&mut self, source: &str, filename: &str) -> String {
        self.process_file(source, filename, 0)
    }

    fn process_file(&mut self, source: &str, filename: &str, depth: usize) -> String {
        let mut out = String::new();
        let mut cond_stack: Vec<CondFrame> = Vec::new();

        let lines: Vec<&str> = source.split('\n').collect();
        let had_trailing_newline = source.ends_with('\n');
        // split('\n') on "a\n" yields ["a", ""]; drop the phantom line.
        let line_count = if had_trailing_newline {
            lines.len() - 1
        } else {
            lines.len()
        };

        let mut reported_file: Rc<str> = Rc::from(filename);
        let mut line_no: u32 = 1;

        let mut i = 0;
        while i < line_count {
            // Logical-line assembly: backslash-newline continuation.
            let mut logical = lines[i].trim_end_matches('\r').to_string();
            let mut continuations = 0;
            while logical.ends_with('\\') && i + continuations + 1 < line_count {
                logical.pop();
                continuations += 1;
                logical.push_str(lines[i + continuations].trim_end_matches('\r'));
            }

            let loc = SourceLoc::new(reported_file.clone(), line_no, 1);
            let active = cond_stack.iter().all(|f| f.active);
            let trimmed = logical.trim_start();

            if let Some(directive) = trimmed.strip_prefix('#') {
                let emitted = self.handle_directive(
                    directive,
                    &loc,
                    active,
                    &mut cond_stack,
                    &mut reported_file,
                    &mut line_no,
                    depth,
                );
                // The directive line itself always becomes blank; an
                // include contributes its inlined content first.
                if let Some(text) = emitted {
                    out.push_str(&text);
                    if !text.is_empty() && !text.ends_with('\n') {
                        out.push('\n');
                    }
                }
                out.push('\n');
            } else if active {
                let expanded = self.expand_text(&logical, &loc);
                out.push_str(&expanded);
                out.push('\n');
            } else {
                out.push('\n');
            }

            // Re-pad continuations so physical line numbers survive.
            for _ in 0..continuations {
                out.push('\n');
            }

            i += continuations + 1;
            line_no += 1 + continuations as u32;
        }

        for frame in &cond_stack {
            self.diags
                .error(frame.loc.clone(), "unmatched #if: missing #endif before end of file");
        }

        if !had_trailing_newline && out.ends_with('\n') {
            out.pop();
        }
        out
    }

    /// Handles one directive line. Returns inlined text to emit before the
    /// blank directive line (used by `#include`).
    #[allow(clippy::too_many_arguments)]
    fn handle_directive(
        &mut self,
        directive: &str,
        loc: &SourceLoc,
        active: bool,
        cond_stack: &mut Vec<CondFrame>,
        reported_file: &mut Rc<str>,
        line_no: &mut u32,
        depth: usize,
    ) -> Option<String> {
        let directive = strip_line_comment(directive);
        let directive = directive.trim();
        let (name, rest) = split_directive(directive);
        let rest = rest.trim();

        match name {
            "if" => {
                let taken = if active {
                    self.eval_condition(rest, loc)
                } else {
                    false
                };
                cond_stack.push(CondFrame {
                    active: taken,
                    any_branch_taken: taken || !active,
                    seen_else: false,
                    loc: loc.clone(),
                });
            }
            "ifdef" | "ifndef" => {
                let defined = self.macros.contains_key(first_word(rest));
                let taken = if active {
                    if name == "ifdef" { defined } else { !defined }
                } else {
                    false
                };
                cond_stack.push(CondFrame {
                    active: taken,
                    any_branch_taken: taken || !active,
                    seen_else: false,
                    loc: loc.clone(),
                });
            }
            "elif" => match cond_stack.last_mut() {
                None => self.diags.error(loc.clone(), "unmatched #elif"),
                Some(frame) => {
                    if frame.seen_else {
                        self.diags.error(loc.clone(), "#elif after #else");
                    }
                    if frame.any_branch_taken {
                        frame.active = false;
                    } else {
                        let parent_active = cond_stack[..cond_stack.len() - 1]
                            .iter()
                            .all(|f| f.active);
                        let taken = parent_active && self.eval_condition(rest, loc);
                        let frame = cond_stack.last_mut().unwrap();
                        frame.active = taken;
                        frame.any_branch_taken = taken;
                    }
                }
            },
            "else" => match cond_stack.last_mut() {
                None => self.diags.error(loc.clone(), "unmatched #else"),
                Some(frame) => {
                    if frame.seen_else {
                        self.diags.error(loc.clone(), "duplicate #else");
                    }
                    frame.seen_else = true;
                    frame.active = !frame.any_branch_taken;
                    frame.any_branch_taken = true;
                }
            },
            "endif" => {
                if cond_stack.pop().is_none() {
                    self.diags.error(loc.clone(), "unmatched #endif");
                }
            }
            _ if !active => {
                // Non-conditional directives inside a skipped region are
                // inert text.
            }
            "include" => {
                return Some(self.handle_include(rest, loc, depth));
            }
            "define" => self.handle_define(rest, loc),
            "undef" => {
                self.macros.remove(first_word(rest));
            }
            "pragma" => {
                if first_word(rest) == "once" {
                    if let Ok(canonical) = Path::new(loc.file.as_ref()).canonicalize() {
                        self.pragma_once.insert(canonical);
                    }
                } else {
                    self.diags
                        .note(loc.clone(), format!("ignoring '#pragma {}'", rest));
                }
            }
            "error" => {
                self.diags.error(loc.clone(), format!("#error {}", rest));
            }
            "warning" => {
                self.diags.warn(loc.clone(), format!("#warning {}", rest));
            }
            "line" => {
                let mut parts = rest.split_whitespace();
                match parts.next().and_then(|n| n.parse::<u32>().ok()) {
                    Some(n) => {
                        // Takes effect on the next physical line.
                        *line_no = n.wrapping_sub(1);
                        if let Some(file) = parts.next() {
                            *reported_file = Rc::from(file.trim_matches('"'));
                        }
                    }
                    None => self
                        .diags
                        .error(loc.clone(), "#line requires a line number"),
                }
            }
            "" => {
                // A lone '#' is a null directive.
            }
            other => {
                self.diags
                    .warn(loc.clone(), format!("unknown directive '#{}'", other));
            }
        }
        None
    }

    fn handle_define(&mut self, rest: &str, loc: &SourceLoc) {
        let bytes = rest.as_bytes();
        let mut end = 0;
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
            end += 1;
        }
        if end == 0 {
            self.diags.error(loc.clone(), "#define requires a name");
            return;
        }
        let name = &rest[..end];
        let after = &rest[end..];

        // Function-like only when '(' immediately follows the name.
        if after.starts_with('(') {
            if !self.opts.compat_mode {
                self.diags.error(
                    loc.clone(),
                    format!(
                        "function-like macro '{}' is not allowed in safe mode \
                         (use --compat-preprocessor)",
                        name
                    ),
                );
                return;
            }
            let close = match after.find(')') {
                Some(p) => p,
                None => {
                    self.diags
                        .error(loc.clone(), format!("unterminated parameter list in '{}'", name));
                    return;
                }
            };
            let params: Vec<String> = after[1..close]
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            let body = after[close + 1..].trim().to_string();
            self.macros.insert(
                name.to_string(),
                MacroDef {
                    params: Some(params),
                    body,
                },
            );
            return;
        }

        let body = after.trim().to_string();
        if !self.opts.compat_mode && (body.contains("##") || body_has_stringify(&body)) {
            self.diags.error(
                loc.clone(),
                format!(
                    "'#' and '##' in macro '{}' are not allowed in safe mode \
                     (use --compat-preprocessor)",
                    name
                ),
            );
            return;
        }
        self.macros.insert(
            name.to_string(),
            MacroDef { params: None, body },
        );
    }

    fn handle_include(&mut self, rest: &str, loc: &SourceLoc, depth: usize) -> String {
        if depth + 1 > self.opts.max_include_depth {
            self.diags.error(
                loc.clone(),
                format!("include depth exceeds {}", self.opts.max_include_depth),
            );
            return String::new();
        }

        let rest = rest.trim();
        let (name, angled) = if let Some(inner) = rest
            .strip_prefix('"')
            .and_then(|r| r.split('"').next())
        {
            (inner.to_string(), false)
        } else if rest.starts_with('<') {
            match rest.find('>') {
                Some(end) => (rest[1..end].to_string(), true),
                None => {
                    self.diags.error(loc.clone(), "unterminated '<' include name");
                    return String::new();
                }
            }
        } else {
            self.diags
                .error(loc.clone(), "#include expects \"file\" or <file>");
            return String::new();
        };

        let resolved = self.resolve_include(&name, angled, loc);
        let path = match resolved {
            Some(p) => p,
            None => {
                if angled && let Some(importer) = self.importer {
                    if let Some(text) =
                        importer.import(&name, &self.opts.include_paths)
                    {
                        let pseudo = format!("<import:{}>", name);
                        return self.process_file(&text, &pseudo, depth + 1);
                    }
                }
                self.diags
                    .error(loc.clone(), format!("include file '{}' not found", name));
                return String::new();
            }
        };

        if let Ok(canonical) = path.canonicalize()
            && self.pragma_once.contains(&canonical)
        {
            return String::new();
        }

        match fs::read_to_string(&path) {
            Ok(text) => {
                let name = path.to_string_lossy().into_owned();
                self.process_file(&text, &name, depth + 1)
            }
            Err(e) => {
                self.diags.error(
                    loc.clone(),
                    format!("cannot read include '{}': {}", path.display(), e),
                );
                String::new()
            }
        }
    }

    fn resolve_include(&self, name: &str, angled: bool, loc: &SourceLoc) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if !angled {
            // Relative to the including file first.
            if let Some(dir) = Path::new(loc.file.as_ref()).parent() {
                candidates.push(dir.join(name));
            }
        }
        for dir in &self.opts.include_paths {
            candidates.push(dir.join(name));
        }
        if angled {
            for dir in SYSTEM_INCLUDE_DIRS {
                candidates.push(Path::new(dir).join(name));
            }
        }
        candidates.into_iter().find(|p| p.is_file())
    }

    // ------------------------------------------------------------------
    // Macro expansion
    // ------------------------------------------------------------------

    /// Expands object-like (and, in compat mode, function-like) macros in
    /// one logical line. Text inside string/char literals is untouched;
    /// expansion stops at a `//` comment.
    fn expand_text(&mut self, line: &str, loc: &SourceLoc) -> String {
        let mut busy = HashSet::new();
        self.expand_with(line, loc, &mut busy)
    }

    fn expand_with(
        &mut self,
        line: &str,
        loc: &SourceLoc,
        busy: &mut HashSet<String>,
    ) -> String {
        let chars: Vec<char> = line.chars().collect();
        let mut out = String::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            // Comments and literals pass through untouched.
            if c == '/' && i + 1 < chars.len() && chars[i + 1] == '/' {
                out.extend(&chars[i..]);
                break;
            }
            if c == '"' || c == '\'' {
                let end = skip_literal(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "__FILE__" => {
                        out.push('"');
                        out.push_str(loc.file.as_ref());
                        out.push('"');
                        continue;
                    }
                    "__LINE__" => {
                        out.push_str(&loc.line.to_string());
                        continue;
                    }
                    "__DATE__" | "__TIME__" => {
                        self.diags.error(
                            loc.clone(),
                            format!("'{}' is not available: builds must be deterministic", ident),
                        );
                        out.push('0');
                        continue;
                    }
                    _ => {}
                }
                if busy.contains(&ident) {
                    out.push_str(&ident);
                    continue;
                }
                let def = match self.macros.get(&ident) {
                    Some(def) => def.clone(),
                    None => {
                        out.push_str(&ident);
                        continue;
                    }
                };
                match def.params {
                    None => {
                        busy.insert(ident.clone());
                        let expanded = self.expand_with(&def.body, loc, busy);
                        busy.remove(&ident);
                        out.push_str(&expanded);
                    }
                    Some(ref params) => {
                        // Needs an argument list; otherwise the name is
                        // ordinary text.
                        let mut j = i;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if j >= chars.len() || chars[j] != '(' {
                            out.push_str(&ident);
                            continue;
                        }
                        let (args, after) = collect_macro_args(&chars, j);
                        if args.len() != params.len() && !(params.is_empty() && args.len() == 1 && args[0].trim().is_empty()) {
                            self.diags.error(
                                loc.clone(),
                                format!(
                                    "macro '{}' expects {} argument(s), got {}",
                                    ident,
                                    params.len(),
                                    args.len()
                                ),
                            );
                            i = after;
                            continue;
                        }
                        let substituted = substitute_params(&def.body, params, &args);
                        busy.insert(ident.clone());
                        let expanded = self.expand_with(&substituted, loc, busy);
                        busy.remove(&ident);
                        out.push_str(&expanded);
                        i = after;
                    }
                }
                continue;
            }
            out.push(c);
            i += 1;
        }
        out
    }

    // ------------------------------------------------------------------
    // #if expression evaluation
    // ------------------------------------------------------------------

    fn eval_condition(&mut self, expr: &str, loc: &SourceLoc) -> bool {
        // `defined` is resolved before macro expansion.
        let resolved = self.resolve_defined(expr, loc);
        let expanded = self.expand_text(&resolved, loc);
        let mut parser = CondExprParser::new(&expanded);
        match parser.parse() {
            Ok(v) => v != 0,
            Err(msg) => {
                self.diags
                    .error(loc.clone(), format!("invalid #if expression: {}", msg));
                false
            }
        }
    }

    /// Replaces `defined(X)` / `defined X` with 1 or 0.
    fn resolve_defined(&mut self, expr: &str, loc: &SourceLoc) -> String {
        let chars: Vec<char> = expr.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i].is_ascii_alphabetic() || chars[i] == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if ident == "defined" {
                    while i < chars.len() && chars[i].is_whitespace() {
                        i += 1;
                    }
                    let parenthesized = i < chars.len() && chars[i] == '(';
                    if parenthesized {
                        i += 1;
                        while i < chars.len() && chars[i].is_whitespace() {
                            i += 1;
                        }
                    }
                    let name_start = i;
                    while i < chars.len()
                        && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                    {
                        i += 1;
                    }
                    let name: String = chars[name_start..i].iter().collect();
                    if parenthesized {
                        while i < chars.len() && chars[i].is_whitespace() {
                            i += 1;
                        }
                        if i < chars.len() && chars[i] == ')' {
                            i += 1;
                        } else {
                            self.diags
                                .error(loc.clone(), "missing ')' after defined(");
                        }
                    }
                    if name.is_empty() {
                        self.diags
                            .error(loc.clone(), "'defined' requires a macro name");
                        out.push('0');
                    } else if self.macros.contains_key(&name) {
                        out.push('1');
                    } else {
                        out.push('0');
                    }
                } else {
                    out.push_str(&ident);
                }
            } else {
                out.push(chars[i]);
                i += 1;
            }
        }
        out
    }
}

// ----------------------------------------------------------------------
// Small text helpers
// ----------------------------------------------------------------------

/// Strips a trailing `//` comment that is not inside a literal.
fn strip_line_comment(text: &str) -> &str {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut byte = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let end = skip_literal(&chars, i);
            byte += chars[i..end].iter().map(|c| c.len_utf8()).sum::<usize>();
            i = end;
            continue;
        }
        if c == '/' && i + 1 < chars.len() && chars[i + 1] == '/' {
            return &text[..byte];
        }
        byte += c.len_utf8();
        i += 1;
    }
    text
}

/// Index just past a string or char literal starting at `start`.
fn skip_literal(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn split_directive(text: &str) -> (&str, &str) {
    let end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    (&text[..end], &text[end..])
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

/// True when the body uses `#` as a stringify operator (rather than `##`).
fn body_has_stringify(body: &str) -> bool {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '#' {
            if i + 1 < chars.len() && chars[i + 1] == '#' {
                i += 2;
                continue;
            }
            return true;
        }
        i += 1;
    }
    false
}

/// Collects the parenthesized argument list starting at `open`. Returns
/// the raw argument texts and the index just past the closing paren.
fn collect_macro_args(chars: &[char], open: usize) -> (Vec<String>, usize) {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 1;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let end = skip_literal(chars, i);
            current.extend(&chars[i..end]);
            i = end;
            continue;
        }
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    args.push(current.trim().to_string());
                    return (args, i + 1);
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
        i += 1;
    }
    args.push(current.trim().to_string());
    (args, chars.len())
}

/// Parameter substitution for function-like macros, including `#param`
/// stringification and `##` pasting (compat mode has already been
/// checked by the caller).
fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let end = skip_literal(&chars, i);
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }
        if c == '#' && i + 1 < chars.len() && chars[i + 1] != '#' {
            // Stringification.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let start = j;
            while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let name: String = chars[start..j].iter().collect();
            if let Some(pos) = params.iter().position(|p| *p == name) {
                out.push('"');
                out.push_str(&args[pos].replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
                i = j;
                continue;
            }
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            match params.iter().position(|p| *p == ident) {
                Some(pos) => out.push_str(&args[pos]),
                None => out.push_str(&ident),
            }
            continue;
        }
        out.push(c);
        i += 1;
    }

    // Token pasting: remove whitespace around ##.
    let mut pasted = String::new();
    let mut rest = out.as_str();
    while let Some(pos) = rest.find("##") {
        pasted.push_str(rest[..pos].trim_end());
        rest = rest[pos + 2..].trim_start();
    }
    pasted.push_str(rest);
    pasted
}

// ----------------------------------------------------------------------
// #if constant-expression parser
// ----------------------------------------------------------------------

/// Recursive-descent parser for the C11 `#if` constant-expression
/// grammar. Unexpanded identifiers evaluate to 0.
struct CondExprParser {
    toks: Vec<CondTok>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum CondTok {
    Int(i64),
    Op(&'static str),
    LParen,
    RParen,
}

impl CondExprParser {
    fn new(text: &str) -> Self {
        CondExprParser {
            toks: cond_tokenize(text),
            pos: 0,
        }
    }

    fn parse(&mut self) -> Result<i64, String> {
        let v = self.ternary()?;
        if self.pos < self.toks.len() {
            return Err("trailing tokens after expression".to_string());
        }
        Ok(v)
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.toks.get(self.pos) {
            Some(CondTok::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> Result<i64, String> {
        let cond = self.logical_or()?;
        if self.eat_op("?") {
            let then_v = self.ternary()?;
            if !self.eat_op(":") {
                return Err("expected ':' in ternary".to_string());
            }
            let else_v = self.ternary()?;
            return Ok(if cond != 0 { then_v } else { else_v });
        }
        Ok(cond)
    }

    fn logical_or(&mut self) -> Result<i64, String> {
        let mut v = self.logical_and()?;
        while self.eat_op("||") {
            let r = self.logical_and()?;
            v = i64::from(v != 0 || r != 0);
        }
        Ok(v)
    }

    fn logical_and(&mut self) -> Result<i64, String> {
        let mut v = self.bit_or()?;
        while self.eat_op("&&") {
            let r = self.bit_or()?;
            v = i64::from(v != 0 && r != 0);
        }
        Ok(v)
    }

    fn bit_or(&mut self) -> Result<i64, String> {
        let mut v = self.bit_xor()?;
        while self.eat_op("|") {
            v |= self.bit_xor()?;
        }
        Ok(v)
    }

    fn bit_xor(&mut self) -> Result<i64, String> {
        let mut v = self.bit_and()?;
        while self.eat_op("^") {
            v ^= self.bit_and()?;
        }
        Ok(v)
    }

    fn bit_and(&mut self) -> Result<i64, String> {
        let mut v = self.equality()?;
        while self.eat_op("&") {
            v &= self.equality()?;
        }
        Ok(v)
    }

    fn equality(&mut self) -> Result<i64, String> {
        let mut v = self.relational()?;
        loop {
            if self.eat_op("==") {
                v = i64::from(v == self.relational()?);
            } else if self.eat_op("!=") {
                v = i64::from(v != self.relational()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn relational(&mut self) -> Result<i64, String> {
        let mut v = self.shift()?;
        loop {
            if self.eat_op("<=") {
                v = i64::from(v <= self.shift()?);
            } else if self.eat_op(">=") {
                v = i64::from(v >= self.shift()?);
            } else if self.eat_op("<") {
                v = i64::from(v < self.shift()?);
            } else if self.eat_op(">") {
                v = i64::from(v > self.shift()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn shift(&mut self) -> Result<i64, String> {
        let mut v = self.additive()?;
        loop {
            if self.eat_op("<<") {
                v = v.wrapping_shl(self.additive()? as u32);
            } else if self.eat_op(">>") {
                v = v.wrapping_shr(self.additive()? as u32);
            } else {
                return Ok(v);
            }
        }
    }

    fn additive(&mut self) -> Result<i64, String> {
        let mut v = self.multiplicative()?;
        loop {
            if self.eat_op("+") {
                v = v.wrapping_add(self.multiplicative()?);
            } else if self.eat_op("-") {
                v = v.wrapping_sub(self.multiplicative()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<i64, String> {
        let mut v = self.unary()?;
        loop {
            if self.eat_op("*") {
                v = v.wrapping_mul(self.unary()?);
            } else if self.eat_op("/") {
                let r = self.unary()?;
                if r == 0 {
                    return Err("division by zero".to_string());
                }
                v = v.wrapping_div(r);
            } else if self.eat_op("%") {
                let r = self.unary()?;
                if r == 0 {
                    return Err("modulo by zero".to_string());
                }
                v = v.wrapping_rem(r);
            } else {
                return Ok(v);
            }
        }
    }

    fn unary(&mut self) -> Result<i64, String> {
        if self.eat_op("!") {
            return Ok(i64::from(self.unary()? == 0));
        }
        if self.eat_op("~") {
            return Ok(!self.unary()?);
        }
        if self.eat_op("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.eat_op("+") {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, String> {
        match self.toks.get(self.pos).cloned() {
            Some(CondTok::Int(v)) => {
                self.pos += 1;
                Ok(v)
            }
            Some(CondTok::LParen) => {
                self.pos += 1;
                let v = self.ternary()?;
                match self.toks.get(self.pos) {
                    Some(CondTok::RParen) => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn cond_tokenize(text: &str) -> Vec<CondTok> {
    let chars: Vec<char> = text.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            toks.push(CondTok::Int(parse_pp_int(&text)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            // Unexpanded identifier: evaluates to 0.
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            toks.push(CondTok::Int(0));
            continue;
        }
        if c == '\'' {
            let end = skip_literal(&chars, i);
            let inner: String = chars[i + 1..end.saturating_sub(1)].iter().collect();
            toks.push(CondTok::Int(parse_pp_char(&inner)));
            i = end;
            continue;
        }
        if c == '(' {
            toks.push(CondTok::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            toks.push(CondTok::RParen);
            i += 1;
            continue;
        }
        // Longest-match operator scan.
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let op2 = ["&&", "||", "==", "!=", "<=", ">=", "<<", ">>"]
            .iter()
            .copied()
            .find(|op| *op == two);
        if let Some(op) = op2 {
            toks.push(CondTok::Op(op));
            i += 2;
            continue;
        }
        let op1 = match c {
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '&' => "&",
            '|' => "|",
            '^' => "^",
            '~' => "~",
            '!' => "!",
            '<' => "<",
            '>' => ">",
            '?' => "?",
            ':' => ":",
            _ => {
                i += 1;
                continue;
            }
        };
        toks.push(CondTok::Op(op1));
        i += 1;
    }
    toks
}

/// Integer literal in a `#if` expression: decimal, hex, or octal, with
/// `u`/`l` suffixes ignored.
fn parse_pp_int(text: &str) -> i64 {
    let stripped = text
        .trim_end_matches(|c| matches!(c, 'u' | 'U' | 'l' | 'L'));
    let (digits, radix) = if let Some(hex) = stripped
        .strip_prefix("0x")
        .or_else(|| stripped.strip_prefix("0X"))
    {
        (hex, 16)
    } else if stripped.len() > 1 && stripped.starts_with('0') {
        (&stripped[1..], 8)
    } else {
        (stripped, 10)
    };
    i64::from_str_radix(digits, radix)
        .or_else(|_| u64::from_str_radix(digits, radix).map(|v| v as i64))
        .unwrap_or(0)
}

fn parse_pp_char(inner: &str) -> i64 {
    let mut chars = inner.chars();
    match chars.next() {
        Some('\\') => match chars.next() {
            Some('n') => 10,
            Some('t') => 9,
            Some('r') => 13,
            Some('\\') => 92,
            Some('\'') => 39,
            Some('"') => 34,
            Some('0') => 0,
            Some(c) => c as i64,
            None => 0,
        },
        Some(c) => c as i64,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn run(source: &str) -> (String, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let mut pp = Preprocessor::new(PreprocessorOptions::default(), &mut diags);
        let out = pp.process(source, "test.sc");
        drop(pp);
        (out, diags)
    }

    fn run_with(source: &str, opts: PreprocessorOptions) -> (String, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let mut pp = Preprocessor::new(opts, &mut diags);
        let out = pp.process(source, "test.sc");
        drop(pp);
        (out, diags)
    }

    #[test]
    fn test_line_preservation() {
        let source = "#define A 1\nint x = A;\n#if 0\nint y;\n#endif\nint z;\n";
        let (out, diags) = run(source);
        assert!(!diags.has_errors());
        assert_eq!(
            out.split('\n').count(),
            source.split('\n').count(),
            "output must have exactly as many lines as the input"
        );
    }

    #[test]
    fn test_directive_lines_become_blank() {
        let (out, _) = run("#define A 1\nint x = A;\n");
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "int x = 1;");
    }

    #[test]
    fn test_conditional_selects_active_branch() {
        let source = "#define A 1\n#if A\nint x = 1;\n#else\nint x = 2;\n#endif\n";
        let (out, diags) = run(source);
        assert!(!diags.has_errors());
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines[2], "int x = 1;");
        assert_eq!(lines[4], "", "inactive branch is blanked");
    }

    #[test]
    fn test_elif_chain() {
        let source = "#define B 1\n#if defined(A)\nint v = 0;\n#elif defined(B)\nint v = 1;\n#else\nint v = 2;\n#endif\n";
        let (out, diags) = run(source);
        assert!(!diags.has_errors());
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines[2], "");
        assert_eq!(lines[4], "int v = 1;");
        assert_eq!(lines[6], "");
    }

    #[test]
    fn test_nested_conditionals_in_skipped_region() {
        let source = "#if 0\n#if 1\nint a;\n#endif\nint b;\n#endif\nint c;\n";
        let (out, diags) = run(source);
        assert!(!diags.has_errors());
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines[2], "");
        assert_eq!(lines[4], "");
        assert_eq!(lines[6], "int c;");
    }

    #[test]
    fn test_unmatched_endif_reported() {
        let (_, diags) = run("#endif\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("unmatched #endif"));
    }

    #[test]
    fn test_unterminated_if_reported_iff_stack_nonempty() {
        let (_, diags) = run("#if 1\nint x;\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("unmatched #if"));

        let (_, diags) = run("#if 1\nint x;\n#endif\n");
        assert_eq!(diags.error_count(), 0);
    }

    #[test]
    fn test_object_macro_expansion() {
        let (out, _) = run("#define N 32\nint buf[N];\n");
        assert!(out.contains("int buf[32];"));
    }

    #[test]
    fn test_macro_not_expanded_in_string() {
        let (out, _) = run("#define N 32\nchar* s = \"N\";\n");
        assert!(out.contains("\"N\""));
    }

    #[test]
    fn test_macro_not_expanded_after_line_comment() {
        let (out, _) = run("#define N 32\nint x; // N wide\n");
        assert!(out.contains("// N wide"));
    }

    #[test]
    fn test_undef() {
        let (out, _) = run("#define N 32\n#undef N\nint x = N;\n");
        assert!(out.contains("int x = N;"));
    }

    #[test]
    fn test_file_and_line_builtins() {
        let (out, _) = run("int l = __LINE__;\nchar* f = __FILE__;\n");
        assert!(out.contains("int l = 1;"));
        assert!(out.contains("char* f = \"test.sc\";"));
    }

    #[test]
    fn test_date_and_time_rejected() {
        let (_, diags) = run("char* d = __DATE__;\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("deterministic"));
    }

    #[test]
    fn test_line_directive_overrides_position() {
        let (out, _) = run("#line 100\nint l = __LINE__;\n");
        assert!(out.contains("int l = 100;"));
    }

    #[test]
    fn test_error_and_warning_directives() {
        let (_, diags) = run("#error bad config\n#warning check this\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("bad config"));
        assert!(diags.diagnostics()[1].message.contains("check this"));
    }

    #[test]
    fn test_unknown_directive_warns() {
        let (_, diags) = run("#frobnicate\n");
        assert_eq!(diags.error_count(), 0);
        assert!(diags.diagnostics()[0].message.contains("unknown directive"));
    }

    #[test]
    fn test_safe_mode_rejects_function_like() {
        let (_, diags) = run("#define SQ(x) ((x)*(x))\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("safe mode"));
    }

    #[test]
    fn test_compat_mode_function_like() {
        let opts = PreprocessorOptions {
            compat_mode: true,
            ..Default::default()
        };
        let (out, diags) = run_with("#define SQ(x) ((x)*(x))\nint y = SQ(3);\n", opts);
        assert!(!diags.has_errors());
        assert!(out.contains("int y = ((3)*(3));"));
    }

    #[test]
    fn test_compat_mode_stringify_and_paste() {
        let opts = PreprocessorOptions {
            compat_mode: true,
            ..Default::default()
        };
        let source = "#define NAME(a, b) a##b\n#define STR(x) #x\nint ab = 1;\nint v = NAME(a, b);\nchar* s = STR(hi);\n";
        let (out, diags) = run_with(source, opts);
        assert!(!diags.has_errors());
        assert!(out.contains("int v = ab;"));
        assert!(out.contains("char* s = \"hi\";"));
    }

    #[test]
    fn test_backslash_continuation_preserves_lines() {
        let source = "#define LONG 1 + \\\n  2\nint x = LONG;\n";
        let (out, diags) = run(source);
        assert!(!diags.has_errors());
        assert_eq!(out.split('\n').count(), source.split('\n').count());
        assert!(out.contains("int x = 1 +   2;"));
    }

    #[test]
    fn test_cmdline_defines() {
        let opts = PreprocessorOptions {
            defines: vec![
                ("DEBUG".to_string(), None),
                ("LEVEL".to_string(), Some("3".to_string())),
            ],
            ..Default::default()
        };
        let (out, _) = run_with("#ifdef DEBUG\nint lvl = LEVEL;\n#endif\n", opts);
        assert!(out.contains("int lvl = 3;"));
    }

    #[test]
    fn test_if_expression_grammar() {
        for (expr, expected) in [
            ("1 + 2 == 3", true),
            ("2 * 3 > 5", true),
            ("(1 << 4) == 16", true),
            ("1 ? 0 : 1", false),
            ("!0 && (3 % 2)", true),
            ("0x10 == 16", true),
            ("010 == 8", true),
            ("'A' == 65", true),
            ("UNDEFINED_NAME", false),
            ("1u + 2L == 3", true),
        ] {
            let source = format!("#if {}\nint yes;\n#else\nint no;\n#endif\n", expr);
            let (out, diags) = run(&source);
            assert!(!diags.has_errors(), "{} should evaluate cleanly", expr);
            let selected = if expected { "int yes;" } else { "int no;" };
            assert!(out.contains(selected), "{} should select {}", expr, selected);
        }
    }

    #[test]
    fn test_include_quote_and_pragma_once() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("defs.sch");
        let mut f = std::fs::File::create(&header).unwrap();
        writeln!(f, "#pragma once").unwrap();
        writeln!(f, "#define WIDTH 80").unwrap();

        let main_path = dir.path().join("main.sc");
        std::fs::write(
            &main_path,
            "#include \"defs.sch\"\n#include \"defs.sch\"\nint w = WIDTH;\n",
        )
        .unwrap();
        let source = std::fs::read_to_string(&main_path).unwrap();

        let mut diags = Diagnostics::silent();
        let mut pp = Preprocessor::new(PreprocessorOptions::default(), &mut diags);
        let out = pp.process(&source, main_path.to_str().unwrap());
        drop(pp);
        assert!(!diags.has_errors());
        assert!(out.contains("int w = 80;"));
    }

    #[test]
    fn test_include_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.sch"), "#define FROM_LIB 7\n").unwrap();

        let opts = PreprocessorOptions {
            include_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let (out, diags) = run_with("#include <lib.sch>\nint v = FROM_LIB;\n", opts);
        assert!(!diags.has_errors());
        assert!(out.contains("int v = 7;"));
    }

    #[test]
    fn test_missing_include_is_error() {
        let (_, diags) = run("#include \"does_not_exist.sch\"\n");
        assert_eq!(diags.error_count(), 1);
        assert!(diags.diagnostics()[0].message.contains("not found"));
    }

    #[test]
    fn test_include_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("self.sch");
        std::fs::write(&path, "#include \"self.sch\"\n").unwrap();

        let opts = PreprocessorOptions {
            max_include_depth: 4,
            include_paths: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let (_, diags) = run_with("#include \"self.sch\"\n", opts);
        assert!(diags.has_errors());
        assert!(
            diags
                .diagnostics()
                .iter()
                .any(|d| d.message.contains("include depth"))
        );
    }
}
