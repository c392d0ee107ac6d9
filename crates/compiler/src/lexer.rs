//! Lexer: preprocessed text to tokens.
//!
//! A single pass over characters. Whitespace and both comment forms are
//! skipped; multi-character operators use maximal munch; identifiers go
//! through the keyword table. A synthetic EOF token always terminates the
//! stream.

use crate::diagnostics::{Diagnostics, SourceLoc};
use crate::token::{Token, TokenKind, TokenValue, keyword_kind};
use std::rc::Rc;

pub struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    file: Rc<str>,
    diags: &'a mut Diagnostics,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &str, filename: &str, diags: &'a mut Diagnostics) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            file: Rc::from(filename),
            diags,
        }
    }

    /// Tokenizes the whole input. Errors are reported and lexing continues
    /// at the next character.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        tokens
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file.clone(), self.line, self.col)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start = self.loc();
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        self.diags.error(start, "unterminated block comment");
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Token {
        self.skip_trivia();
        let loc = self.loc();
        let c = match self.peek() {
            Some(c) => c,
            None => return Token::eof(loc),
        };

        if c.is_ascii_digit() {
            return self.lex_number(loc);
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return self.lex_identifier(loc);
        }
        if c == '"' {
            return self.lex_string(loc);
        }
        if c == '\'' {
            return self.lex_char(loc);
        }
        self.lex_operator(loc)
    }

    fn lex_identifier(&mut self, loc: SourceLoc) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Identifier);
        let mut tok = Token::new(kind, text, loc);
        // Boolean keywords carry their value so the parser does not
        // reinspect text.
        match kind {
            TokenKind::KwTrue => {
                tok.value = TokenValue::Int {
                    value: 1,
                    unsigned: false,
                    long_long: false,
                };
            }
            TokenKind::KwFalse => {
                tok.value = TokenValue::Int {
                    value: 0,
                    unsigned: false,
                    long_long: false,
                };
            }
            _ => {}
        }
        tok
    }

    fn lex_number(&mut self, loc: SourceLoc) -> Token {
        let start = self.pos;
        let mut is_float = false;
        let mut radix = 10;

        if self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x') | Some('X'))
        {
            radix = 16;
            self.bump();
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    self.bump();
                } else {
                    break;
                }
            }
        } else {
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    self.bump();
                } else {
                    break;
                }
            }
            // Fraction: only when a digit follows the dot, so `a.b` and
            // `1...2` keep their own meanings.
            if self.peek() == Some('.')
                && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
            if matches!(self.peek(), Some('e') | Some('E'))
                && (self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
                    || (matches!(self.peek_at(1), Some('+') | Some('-'))
                        && self.peek_at(2).is_some_and(|c| c.is_ascii_digit())))
            {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.bump();
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }

        let digits_end = self.pos;

        // Suffixes: u | U | l | L | ll | LL | f | F, in any reasonable
        // combination.
        let mut unsigned = false;
        let mut long_long = false;
        let mut float_suffix = false;
        loop {
            match self.peek() {
                Some('u') | Some('U') => {
                    unsigned = true;
                    self.bump();
                }
                Some('l') | Some('L') => {
                    long_long = true;
                    self.bump();
                    if matches!(self.peek(), Some('l') | Some('L')) {
                        self.bump();
                    }
                }
                Some('f') | Some('F') => {
                    float_suffix = true;
                    self.bump();
                }
                _ => break,
            }
        }

        let digits: String = self.chars[start..digits_end].iter().collect();
        let text: String = self.chars[start..self.pos].iter().collect();

        if is_float || (float_suffix && radix == 10) {
            let value = digits.parse::<f64>().unwrap_or_else(|_| {
                self.diags
                    .error(loc.clone(), format!("invalid float literal '{}'", text));
                0.0
            });
            let mut tok = Token::new(TokenKind::FloatLiteral, text, loc);
            tok.value = TokenValue::Float(value);
            return tok;
        }

        let parse_digits = if radix == 16 { &digits[2..] } else { &digits[..] };
        // A signed parse that overflows falls back to an unsigned reparse
        // with the same bit pattern.
        let value = match i64::from_str_radix(parse_digits, radix) {
            Ok(v) => v as u64,
            Err(_) => match u64::from_str_radix(parse_digits, radix) {
                Ok(v) => {
                    unsigned = true;
                    v
                }
                Err(_) => {
                    self.diags
                        .error(loc.clone(), format!("invalid integer literal '{}'", text));
                    0
                }
            },
        };

        let mut tok = Token::new(TokenKind::IntLiteral, text, loc);
        tok.value = TokenValue::Int {
            value,
            unsigned,
            long_long,
        };
        tok
    }

    fn decode_escape(&mut self, loc: &SourceLoc) -> char {
        match self.bump() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            Some('0') => '\0',
            Some(other) => {
                self.diags
                    .error(loc.clone(), format!("unknown escape sequence '\\{}'", other));
                other
            }
            None => {
                self.diags
                    .error(loc.clone(), "unterminated escape sequence");
                '\0'
            }
        }
    }

    fn lex_string(&mut self, loc: SourceLoc) -> Token {
        let start = self.pos;
        self.bump(); // opening quote
        let mut decoded = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.diags.error(loc.clone(), "unterminated string literal");
                    break;
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    decoded.push(self.decode_escape(&loc));
                }
                Some(c) => {
                    self.bump();
                    decoded.push(c);
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let mut tok = Token::new(TokenKind::StringLiteral, text, loc);
        tok.value = TokenValue::Str(decoded);
        tok
    }

    fn lex_char(&mut self, loc: SourceLoc) -> Token {
        let start = self.pos;
        self.bump(); // opening quote
        let value = match self.peek() {
            None | Some('\n') | Some('\'') => {
                self.diags.error(loc.clone(), "empty character literal");
                if self.peek() == Some('\'') {
                    self.bump();
                }
                '\0'
            }
            Some('\\') => {
                self.bump();
                let c = self.decode_escape(&loc);
                if self.peek() == Some('\'') {
                    self.bump();
                } else {
                    self.diags
                        .error(loc.clone(), "unterminated character literal");
                }
                c
            }
            Some(c) => {
                self.bump();
                if self.peek() == Some('\'') {
                    self.bump();
                } else {
                    self.diags
                        .error(loc.clone(), "unterminated character literal");
                }
                c
            }
        };
        let text: String = self.chars[start..self.pos].iter().collect();
        let mut tok = Token::new(TokenKind::CharLiteral, text, loc);
        tok.value = TokenValue::Char(value);
        tok
    }

    fn lex_operator(&mut self, loc: SourceLoc) -> Token {
        use TokenKind::*;

        // Maximal munch: three-character operators first.
        let three: String = self.chars[self.pos..(self.pos + 3).min(self.chars.len())]
            .iter()
            .collect();
        let kind3 = match three.as_str() {
            "<<=" => Some(ShlAssign),
            ">>=" => Some(ShrAssign),
            "..." => Some(Ellipsis),
            _ => None,
        };
        if let Some(kind) = kind3 {
            for _ in 0..3 {
                self.bump();
            }
            return Token::new(kind, three, loc);
        }

        let two: String = self.chars[self.pos..(self.pos + 2).min(self.chars.len())]
            .iter()
            .collect();
        let kind2 = match two.as_str() {
            "==" => Some(Eq),
            "!=" => Some(Ne),
            "<=" => Some(Le),
            ">=" => Some(Ge),
            "&&" => Some(AndAnd),
            "||" => Some(OrOr),
            "<<" => Some(Shl),
            ">>" => Some(Shr),
            "++" => Some(Inc),
            "--" => Some(Dec),
            "+=" => Some(PlusAssign),
            "-=" => Some(MinusAssign),
            "*=" => Some(StarAssign),
            "/=" => Some(SlashAssign),
            "%=" => Some(PercentAssign),
            "&=" => Some(AmpAssign),
            "|=" => Some(PipeAssign),
            "^=" => Some(CaretAssign),
            "->" => Some(Arrow),
            "=>" => Some(FatArrow),
            "::" => Some(ColonColon),
            "?&" => Some(QuestionAmp),
            _ => None,
        };
        if let Some(kind) = kind2 {
            self.bump();
            self.bump();
            return Token::new(kind, two, loc);
        }

        let c = self.bump().unwrap();
        let kind = match c {
            '+' => Plus,
            '-' => Minus,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '=' => Assign,
            '<' => Lt,
            '>' => Gt,
            '!' => Not,
            '&' => Amp,
            '|' => Pipe,
            '^' => Caret,
            '~' => Tilde,
            '?' => Question,
            ':' => Colon,
            ';' => Semicolon,
            ',' => Comma,
            '.' => Dot,
            '(' => LParen,
            ')' => RParen,
            '[' => LBracket,
            ']' => RBracket,
            '{' => LBrace,
            '}' => RBrace,
            other => {
                self.diags
                    .error(loc.clone(), format!("unexpected character '{}'", other));
                // Resynchronize by skipping the character.
                return self.next_token();
            }
        };
        Token::new(kind, c.to_string(), loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        let mut diags = Diagnostics::silent();
        Lexer::new(source, "test.sc", &mut diags).tokenize()
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        use TokenKind::*;
        assert_eq!(
            kinds("int main while foo _bar"),
            vec![KwInt, Identifier, KwWhile, Identifier, Identifier, Eof]
        );
    }

    #[test]
    fn test_contextual_keywords_lex_as_identifiers() {
        use TokenKind::*;
        assert_eq!(
            kinds("stack heap arena capacity"),
            vec![Identifier, Identifier, Identifier, Identifier, Eof]
        );
    }

    #[test]
    fn test_integer_literals() {
        let toks = lex("42 0x2A 7u 9ll 100UL");
        assert_eq!(toks[0].int_value(), Some(42));
        assert_eq!(toks[1].int_value(), Some(42));
        match toks[2].value {
            TokenValue::Int { value, unsigned, .. } => {
                assert_eq!(value, 7);
                assert!(unsigned);
            }
            _ => panic!("expected int"),
        }
        match toks[3].value {
            TokenValue::Int { long_long, .. } => assert!(long_long),
            _ => panic!("expected int"),
        }
        match toks[4].value {
            TokenValue::Int {
                unsigned, long_long, ..
            } => {
                assert!(unsigned);
                assert!(long_long);
            }
            _ => panic!("expected int"),
        }
    }

    #[test]
    fn test_signed_overflow_reparses_unsigned() {
        // 2^63 does not fit i64; the bit pattern is preserved and the
        // literal becomes unsigned.
        let toks = lex("9223372036854775808");
        match toks[0].value {
            TokenValue::Int { value, unsigned, .. } => {
                assert_eq!(value, 9223372036854775808);
                assert!(unsigned);
            }
            _ => panic!("expected int"),
        }
    }

    #[test]
    fn test_float_literals() {
        let toks = lex("3.5 1e3 2.5e-1 4f");
        for (i, expected) in [3.5, 1000.0, 0.25, 4.0].iter().enumerate() {
            assert_eq!(toks[i].kind, TokenKind::FloatLiteral, "token {}", i);
            match toks[i].value {
                TokenValue::Float(v) => assert_eq!(v, *expected),
                _ => panic!("expected float"),
            }
        }
    }

    #[test]
    fn test_string_escapes() {
        let toks = lex(r#""a\tb\n\"q\"\0""#);
        match &toks[0].value {
            TokenValue::Str(s) => assert_eq!(s, "a\tb\n\"q\"\0"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn test_char_literals() {
        let toks = lex(r"'a' '\n' '\''");
        let expected = ['a', '\n', '\''];
        for (i, c) in expected.iter().enumerate() {
            match toks[i].value {
                TokenValue::Char(v) => assert_eq!(v, *c),
                _ => panic!("expected char"),
            }
        }
    }

    #[test]
    fn test_maximal_munch_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("<<= << < ... :: -> => ?& ++ +="),
            vec![ShlAssign, Shl, Lt, Ellipsis, ColonColon, Arrow, FatArrow, QuestionAmp, Inc, PlusAssign, Eof]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        use TokenKind::*;
        assert_eq!(
            kinds("a // line\nb /* block\nstill */ c"),
            vec![Identifier, Identifier, Identifier, Eof]
        );
    }

    #[test]
    fn test_locations() {
        let toks = lex("a\n  b");
        assert_eq!((toks[0].loc.line, toks[0].loc.col), (1, 1));
        assert_eq!((toks[1].loc.line, toks[1].loc.col), (2, 3));
    }

    #[test]
    fn test_round_trip_kind_stability() {
        // Re-lexing a token's own text yields the same kind.
        let source = "int x = 42 + 3.5; while (x <= 10) { x++; } \"str\" 'c' ?& ...";
        for tok in lex(source) {
            if tok.kind == TokenKind::Eof {
                continue;
            }
            let again = lex(&tok.text);
            assert_eq!(again[0].kind, tok.kind, "re-lexing '{}'", tok.text);
        }
    }

    #[test]
    fn test_unterminated_string_reported() {
        let mut diags = Diagnostics::silent();
        let toks = Lexer::new("\"abc", "test.sc", &mut diags).tokenize();
        assert!(diags.has_errors());
        assert_eq!(toks[0].kind, TokenKind::StringLiteral);
    }

    #[test]
    fn test_unexpected_character_recovers() {
        let mut diags = Diagnostics::silent();
        let toks = Lexer::new("a @ b", "test.sc", &mut diags).tokenize();
        assert_eq!(diags.error_count(), 1);
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
    }
}
