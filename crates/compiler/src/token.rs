//! Token kinds and payloads produced by the lexer.

use crate::diagnostics::SourceLoc;

/// Every token kind the lexer can produce. The set is closed; the parser
/// dispatches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals and names
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    CharLiteral,
    Identifier,
    Eof,

    // Type keywords
    KwVoid,
    KwBool,
    KwChar,
    KwShort,
    KwInt,
    KwLong,
    KwFloat,
    KwDouble,
    KwSigned,
    KwUnsigned,
    KwI8,
    KwI16,
    KwI32,
    KwI64,
    KwU8,
    KwU16,
    KwU32,
    KwU64,

    // Declaration keywords
    KwStruct,
    KwUnion,
    KwEnum,
    KwTypedef,
    KwRegion,
    KwGeneric,
    KwOperator,

    // Qualifiers and storage classes
    KwConst,
    KwConsteval,
    KwInline,
    KwExtern,
    KwStatic,
    KwRestrict,
    KwMustUse,
    KwPacked,

    // Statement keywords
    KwIf,
    KwElse,
    KwWhile,
    KwDo,
    KwFor,
    KwReturn,
    KwBreak,
    KwContinue,
    KwGoto,
    KwMatch,
    KwCase,
    KwDefault,
    KwDefer,
    KwErrdefer,
    KwUnsafe,
    KwStaticAssert,

    // Expression keywords
    KwSizeof,
    KwAlignof,
    KwFieldcount,
    KwNew,
    KwSpawn,
    KwJoin,
    KwTry,
    KwTrue,
    KwFalse,
    KwNull,
    KwTuple,
    KwFn,
    KwTypeof,
    KwArenaReset,

    // Operators and punctuators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Inc,
    Dec,
    Arrow,
    FatArrow,
    ColonColon,
    QuestionAmp,
    Question,
    Colon,
    Semicolon,
    Comma,
    Dot,
    Ellipsis,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

impl TokenKind {
    /// True for keywords that can begin a type in declaration position.
    /// Used by the parser's declaration-vs-expression lookahead.
    pub fn starts_type(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            KwVoid
                | KwBool
                | KwChar
                | KwShort
                | KwInt
                | KwLong
                | KwFloat
                | KwDouble
                | KwSigned
                | KwUnsigned
                | KwI8
                | KwI16
                | KwI32
                | KwI64
                | KwU8
                | KwU16
                | KwU32
                | KwU64
                | KwStruct
                | KwUnion
                | KwEnum
                | KwTuple
                | KwFn
                | KwTypeof
                | KwConst
        )
    }
}

/// Payload attached to literal tokens. `None` for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Int {
        /// Bit pattern of the literal. A signed-overflowing decimal parse
        /// falls back to an unsigned reparse with the same bits.
        value: u64,
        unsigned: bool,
        long_long: bool,
    },
    Float(f64),
    Str(String),
    Char(char),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// The lexeme as written (escapes undecoded; see `value` for payloads).
    pub text: String,
    pub loc: SourceLoc,
    pub value: TokenValue,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, loc: SourceLoc) -> Self {
        Token {
            kind,
            text: text.into(),
            loc,
            value: TokenValue::None,
        }
    }

    pub fn eof(loc: SourceLoc) -> Self {
        Token::new(TokenKind::Eof, "<eof>", loc)
    }

    /// Integer payload, if this is an integer literal.
    pub fn int_value(&self) -> Option<u64> {
        match self.value {
            TokenValue::Int { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Keyword table. Returns `None` for identifiers, including the
/// contextual keywords (`stack`, `heap`, `arena`, `capacity`), which lex
/// as identifiers and are recognized by the parser where the grammar
/// wants them.
pub fn keyword_kind(ident: &str) -> Option<TokenKind> {
    use TokenKind::*;
    let kind = match ident {
        "void" => KwVoid,
        "bool" => KwBool,
        "char" => KwChar,
        "short" => KwShort,
        "int" => KwInt,
        "long" => KwLong,
        "float" => KwFloat,
        "double" => KwDouble,
        "signed" => KwSigned,
        "unsigned" => KwUnsigned,
        "i8" => KwI8,
        "i16" => KwI16,
        "i32" => KwI32,
        "i64" => KwI64,
        "u8" => KwU8,
        "u16" => KwU16,
        "u32" => KwU32,
        "u64" => KwU64,
        "struct" => KwStruct,
        "union" => KwUnion,
        "enum" => KwEnum,
        "typedef" => KwTypedef,
        "region" => KwRegion,
        "generic" => KwGeneric,
        "operator" => KwOperator,
        "const" => KwConst,
        "consteval" => KwConsteval,
        "inline" => KwInline,
        "extern" => KwExtern,
        "static" => KwStatic,
        "restrict" => KwRestrict,
        "must_use" => KwMustUse,
        "packed" => KwPacked,
        "if" => KwIf,
        "else" => KwElse,
        "while" => KwWhile,
        "do" => KwDo,
        "for" => KwFor,
        "return" => KwReturn,
        "break" => KwBreak,
        "continue" => KwContinue,
        "goto" => KwGoto,
        "match" => KwMatch,
        "case" => KwCase,
        "default" => KwDefault,
        "defer" => KwDefer,
        "errdefer" => KwErrdefer,
        "unsafe" => KwUnsafe,
        "static_assert" => KwStaticAssert,
        "sizeof" => KwSizeof,
        "alignof" => KwAlignof,
        "fieldcount" => KwFieldcount,
        "new" => KwNew,
        "spawn" => KwSpawn,
        "join" => KwJoin,
        "try" => KwTry,
        "true" => KwTrue,
        "false" => KwFalse,
        "null" => KwNull,
        "tuple" => KwTuple,
        "fn" => KwFn,
        "typeof" => KwTypeof,
        "arena_reset" => KwArenaReset,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(keyword_kind("while"), Some(TokenKind::KwWhile));
        assert_eq!(keyword_kind("consteval"), Some(TokenKind::KwConsteval));
        assert_eq!(keyword_kind("not_a_keyword"), None);
    }

    #[test]
    fn test_contextual_keywords_are_identifiers() {
        // These appear in the grammar but remain usable as names.
        for word in ["stack", "heap", "arena", "capacity"] {
            assert_eq!(keyword_kind(word), None, "{} must lex as identifier", word);
        }
    }

    #[test]
    fn test_type_keyword_lookahead() {
        assert!(TokenKind::KwInt.starts_type());
        assert!(TokenKind::KwStruct.starts_type());
        assert!(TokenKind::KwTypeof.starts_type());
        assert!(!TokenKind::KwReturn.starts_type());
        assert!(!TokenKind::Identifier.starts_type());
    }
}
