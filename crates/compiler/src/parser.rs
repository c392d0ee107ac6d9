//! Parser: tokens to AST.
//!
//! Hand-written recursive descent for declarations and statements;
//! precedence climbing for the C expression grammar. The parser never
//! stops at the first problem: it reports through the diagnostics engine,
//! synthesizes what it needs, and resynchronizes at the next
//! declaration-start keyword.

use crate::ast::*;
use crate::diagnostics::{Diagnostics, SourceLoc};
use crate::token::{Token, TokenKind, TokenValue};
use crate::types::{Region, Type, TypeRef};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    diags: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token>, diags: &'a mut Diagnostics) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let loc = tokens
                .last()
                .map(|t| t.loc.clone())
                .unwrap_or_else(SourceLoc::builtin);
            tokens.push(Token::eof(loc));
        }
        Parser {
            tokens,
            pos: 0,
            diags,
        }
    }

    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn kind_at(&self, offset: usize) -> TokenKind {
        self.peek_at(offset).kind
    }

    fn loc(&self) -> SourceLoc {
        self.peek().loc.clone()
    }

    fn at_end(&self) -> bool {
        self.kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    /// Contextual keyword test against an identifier's text.
    fn check_word(&self, word: &str) -> bool {
        self.kind() == TokenKind::Identifier && self.peek().text == word
    }

    fn accept(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    /// Consumes a token of `kind` or reports an error and synthesizes one
    /// without advancing, so callers can continue.
    fn expect(&mut self, kind: TokenKind, what: &str) -> Token {
        if self.check(kind) {
            return self.advance();
        }
        let loc = self.loc();
        self.diags.error(
            loc.clone(),
            format!("expected {}, got '{}'", what, self.peek().text),
        );
        Token::new(kind, "", loc)
    }

    fn expect_ident(&mut self, what: &str) -> String {
        self.expect(TokenKind::Identifier, what).text
    }

    /// Skips ahead to the next plausible declaration start after a parse
    /// error.
    fn sync_to_decl(&mut self) {
        // Always make progress.
        if !self.at_end() {
            self.advance();
        }
        while !self.at_end() {
            let k = self.kind();
            if k.starts_type()
                || matches!(
                    k,
                    TokenKind::KwTypedef
                        | TokenKind::KwRegion
                        | TokenKind::KwGeneric
                        | TokenKind::KwStaticAssert
                        | TokenKind::KwMustUse
                        | TokenKind::KwPacked
                        | TokenKind::KwExtern
                        | TokenKind::KwStatic
                        | TokenKind::KwInline
                        | TokenKind::KwConsteval
                )
            {
                return;
            }
            let tok = self.advance();
            // A closed scope or statement end is also a safe resume point.
            if matches!(tok.kind, TokenKind::Semicolon | TokenKind::RBrace) {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Translation unit
    // ------------------------------------------------------------------

    pub fn parse(&mut self) -> TranslationUnit {
        let mut unit = TranslationUnit::new();
        while !self.at_end() {
            let before = self.pos;
            match self.parse_top_decl() {
                Some(decl) => unit.decls.push(decl),
                None => self.sync_to_decl(),
            }
            if self.pos == before {
                // Defensive: a declaration must consume input.
                self.advance();
            }
        }
        unit
    }

    fn parse_top_decl(&mut self) -> Option<Decl> {
        let must_use = self.accept(TokenKind::KwMustUse).is_some();
        let packed = self.accept(TokenKind::KwPacked).is_some();

        match self.kind() {
            TokenKind::KwStruct | TokenKind::KwUnion
                if self.kind_at(1) == TokenKind::Identifier
                    && self.kind_at(2) == TokenKind::LBrace =>
            {
                self.parse_struct_decl(packed).map(Decl::Struct)
            }
            TokenKind::KwEnum
                if self.kind_at(1) == TokenKind::Identifier
                    && matches!(self.kind_at(2), TokenKind::LBrace | TokenKind::Colon) =>
            {
                self.parse_enum_decl().map(Decl::Enum)
            }
            TokenKind::KwRegion => self.parse_region_decl().map(Decl::Region),
            TokenKind::KwTypedef => self.parse_typedef().map(Decl::Typedef),
            TokenKind::KwStaticAssert => {
                let loc = self.loc();
                let (cond, message) = self.parse_static_assert()?;
                Some(Decl::StaticAssert(StaticAssertDecl { cond, message, loc }))
            }
            TokenKind::KwGeneric => {
                let generic_params = self.parse_generic_params()?;
                self.parse_function_or_global(must_use, generic_params)
            }
            _ => self.parse_function_or_global(must_use, Vec::new()),
        }
    }

    fn parse_struct_decl(&mut self, packed: bool) -> Option<StructDecl> {
        let loc = self.loc();
        let is_union = self.kind() == TokenKind::KwUnion;
        self.advance(); // struct | union
        let name = self.expect_ident("struct name");
        self.expect(TokenKind::LBrace, "'{'");

        let mut fields = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let before = self.pos;
            let field_loc = self.loc();
            let ty = self.parse_type();
            let fname = self.expect_ident("field name");
            let ty = self.parse_post_name_array(ty);
            self.expect(TokenKind::Semicolon, "';'");
            fields.push(FieldDecl {
                name: fname,
                ty,
                loc: field_loc,
            });
            if self.pos == before {
                // Recovery made no progress; skip the offending token.
                self.advance();
            }
        }
        self.expect(TokenKind::RBrace, "'}'");
        self.accept(TokenKind::Semicolon);

        Some(StructDecl {
            name,
            fields,
            is_union,
            packed,
            loc,
        })
    }

    fn parse_enum_decl(&mut self) -> Option<EnumDecl> {
        let loc = self.loc();
        self.advance(); // enum
        let name = self.expect_ident("enum name");
        // Optional underlying width: `enum E : u8 { ... }`.
        if self.accept(TokenKind::Colon).is_some() {
            self.parse_type();
        }
        self.expect(TokenKind::LBrace, "'{'");

        let mut variants = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let vname = self.expect_ident("enum variant name");
            let value = if self.accept(TokenKind::Assign).is_some() {
                Some(self.parse_expr())
            } else {
                None
            };
            variants.push((vname, value));
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'");
        self.accept(TokenKind::Semicolon);

        Some(EnumDecl {
            name,
            variants,
            loc,
        })
    }

    /// `region scratch capacity 4096;` (`capacity` is a contextual keyword).
    fn parse_region_decl(&mut self) -> Option<RegionDecl> {
        let loc = self.loc();
        self.advance(); // region
        let name = self.expect_ident("region name");
        let capacity = if self.check_word("capacity") {
            self.advance();
            Some(self.parse_expr())
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'");
        Some(RegionDecl {
            name,
            capacity,
            loc,
        })
    }

    fn parse_typedef(&mut self) -> Option<TypedefDecl> {
        let loc = self.loc();
        self.advance(); // typedef
        let ty = self.parse_type();
        let name = self.expect_ident("typedef name");
        self.expect(TokenKind::Semicolon, "';'");
        Some(TypedefDecl { name, ty, loc })
    }

    fn parse_static_assert(&mut self) -> Option<(Expr, String)> {
        self.advance(); // static_assert
        self.expect(TokenKind::LParen, "'('");
        let cond = self.parse_expr();
        let message = if self.accept(TokenKind::Comma).is_some() {
            let tok = self.expect(TokenKind::StringLiteral, "assertion message");
            match tok.value {
                TokenValue::Str(s) => s,
                _ => String::new(),
            }
        } else {
            String::new()
        };
        self.expect(TokenKind::RParen, "')'");
        self.expect(TokenKind::Semicolon, "';'");
        Some((cond, message))
    }

    /// `generic<T, U: Numeric, V...>`
    fn parse_generic_params(&mut self) -> Option<Vec<GenericParam>> {
        self.advance(); // generic
        self.expect(TokenKind::Lt, "'<'");
        let mut params = Vec::new();
        loop {
            let name = self.expect_ident("generic parameter name");
            let is_pack = self.accept(TokenKind::Ellipsis).is_some();
            let constraint = if self.accept(TokenKind::Colon).is_some() {
                Some(self.expect_ident("constraint name"))
            } else {
                None
            };
            params.push(GenericParam {
                name,
                constraint,
                is_pack,
            });
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::Gt, "'>'");
        Some(params)
    }

    fn parse_fn_flags(&mut self) -> FnFlags {
        let mut flags = FnFlags::default();
        loop {
            match self.kind() {
                TokenKind::KwConsteval => {
                    self.advance();
                    flags.is_consteval = true;
                }
                TokenKind::KwInline => {
                    self.advance();
                    flags.is_inline = true;
                }
                TokenKind::KwExtern => {
                    self.advance();
                    flags.is_extern = true;
                }
                TokenKind::KwStatic => {
                    self.advance();
                    flags.is_static = true;
                }
                // At declaration position a leading `const` qualifies the
                // binding (or function); `const` inside the type is still
                // handled by the type parser.
                TokenKind::KwConst => {
                    self.advance();
                    flags.is_const = true;
                }
                _ => return flags,
            }
        }
    }

    fn parse_function_or_global(
        &mut self,
        must_use: bool,
        generic_params: Vec<GenericParam>,
    ) -> Option<Decl> {
        let loc = self.loc();
        let mut flags = self.parse_fn_flags();
        flags.must_use = must_use;

        let ty = self.parse_type();
        // Hopeless start: no type and no name to anchor on. Let the
        // caller resynchronize at the next declaration.
        if ty.is_error() && !self.check(TokenKind::Identifier) {
            return None;
        }
        let name = self.expect_ident("declaration name");

        // Method: `RetType Owner::name(params) [const] { body }`
        if self.accept(TokenKind::ColonColon).is_some() {
            let owner = name;
            let method_name = if self.check(TokenKind::KwOperator) {
                self.parse_operator_name()
            } else {
                self.expect_ident("method name")
            };
            let (params, variadic) = self.parse_params();
            let const_method = self.accept(TokenKind::KwConst).is_some();
            flags.is_method = true;
            flags.const_method = const_method;
            let body = self.parse_fn_body(flags.is_extern);
            if variadic {
                self.diags.error(loc.clone(), "methods cannot be variadic");
            }
            return Some(Decl::Function(FunctionDecl {
                name: method_name,
                params,
                return_type: ty,
                generic_params,
                flags,
                variadic: false,
                owner: Some(owner),
                body,
                loc,
            }));
        }

        if self.check(TokenKind::LParen) {
            let (params, variadic) = self.parse_params();
            let body = self.parse_fn_body(flags.is_extern);
            return Some(Decl::Function(FunctionDecl {
                name,
                params,
                return_type: ty,
                generic_params,
                flags,
                variadic,
                owner: None,
                body,
                loc,
            }));
        }

        if !generic_params.is_empty() {
            self.diags
                .error(loc.clone(), "generic parameters require a function declaration");
        }

        // Global variable.
        let ty = self.parse_post_name_array(ty);
        let init = if self.accept(TokenKind::Assign).is_some() {
            Some(self.parse_expr())
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'");
        Some(Decl::Global(GlobalDecl {
            name,
            declared_ty: ty,
            ty: None,
            init,
            is_const: flags.is_const,
            is_static: flags.is_static,
            is_extern: flags.is_extern,
            loc,
        }))
    }

    /// `operator` followed by one or two operator tokens (`[]` is two).
    fn parse_operator_name(&mut self) -> String {
        self.advance(); // operator
        let first = self.advance();
        let mut op = first.text;
        if op == "[" && self.check(TokenKind::RBracket) {
            self.advance();
            op.push(']');
        }
        format!("operator{}", op)
    }

    fn parse_params(&mut self) -> (Vec<Param>, bool) {
        self.expect(TokenKind::LParen, "'('");
        let mut params = Vec::new();
        let mut variadic = false;

        if self.accept(TokenKind::RParen).is_some() {
            return (params, variadic);
        }
        // `f(void)` means no parameters.
        if self.check(TokenKind::KwVoid) && self.kind_at(1) == TokenKind::RParen {
            self.advance();
            self.advance();
            return (params, variadic);
        }

        loop {
            if self.accept(TokenKind::Ellipsis).is_some() {
                variadic = true;
                break;
            }
            let loc = self.loc();
            let ty = self.parse_type();
            // Pack parameter: `T... xs`. The ellipsis is implied by the
            // generic parameter list; nothing extra is recorded here.
            if self.check(TokenKind::Ellipsis) && self.kind_at(1) == TokenKind::Identifier {
                self.advance();
            }
            let name = match self.accept(TokenKind::Identifier) {
                Some(tok) => tok.text,
                None => format!("__arg{}", params.len()),
            };
            let ty = self.parse_post_name_array(ty);
            params.push(Param { name, ty, loc });
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'");
        (params, variadic)
    }

    fn parse_fn_body(&mut self, is_extern: bool) -> Option<Stmt> {
        if self.check(TokenKind::LBrace) {
            return Some(self.parse_compound());
        }
        self.expect(TokenKind::Semicolon, "';' or function body");
        if is_extern {
            // Extern declarations never have bodies.
        }
        None
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Parses a type at a type position. Never fails: on malformed input
    /// it reports and yields the `Error` type.
    pub fn parse_type(&mut self) -> TypeRef {
        // Reference prefix, then optional region qualifier.
        if self.check(TokenKind::Amp) || self.check(TokenKind::QuestionAmp) {
            let nullable = self.kind() == TokenKind::QuestionAmp;
            self.advance();
            let region = self.parse_region_qualifier().unwrap_or(Region::Stack);
            let mutable = self.accept(TokenKind::KwConst).is_none();
            let base = self.parse_type();
            return Type::reference(base, region, nullable, mutable);
        }
        // Optional: `?T`.
        if self.accept(TokenKind::Question).is_some() {
            return Type::optional(self.parse_type());
        }
        // Slice: `[]T`.
        if self.check(TokenKind::LBracket) && self.kind_at(1) == TokenKind::RBracket {
            self.advance();
            self.advance();
            return Type::slice(self.parse_type());
        }

        let leading_const = self.accept(TokenKind::KwConst).is_some();
        let base = self.parse_base_type();
        self.parse_type_suffixes(base, leading_const)
    }

    fn parse_region_qualifier(&mut self) -> Option<Region> {
        match self.kind() {
            TokenKind::KwStatic => {
                self.advance();
                Some(Region::Static)
            }
            TokenKind::Identifier => match self.peek().text.as_str() {
                "stack" => {
                    self.advance();
                    Some(Region::Stack)
                }
                "heap" => {
                    self.advance();
                    Some(Region::Heap)
                }
                "arena" => {
                    self.advance();
                    self.expect(TokenKind::Lt, "'<'");
                    let name = self.expect_ident("arena name");
                    self.expect(TokenKind::Gt, "'>'");
                    Some(Region::Arena(name))
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn parse_base_type(&mut self) -> TypeRef {
        use TokenKind::*;

        // signed/unsigned prefix with classic C base types.
        let mut unsigned: Option<bool> = None;
        while matches!(self.kind(), KwSigned | KwUnsigned) {
            unsigned = Some(self.kind() == KwUnsigned);
            self.advance();
        }

        let loc = self.loc();
        match self.kind() {
            KwVoid => {
                self.advance();
                Type::void()
            }
            KwBool => {
                self.advance();
                Type::bool_()
            }
            KwChar => {
                self.advance();
                match unsigned {
                    Some(true) => Type::uint8(),
                    Some(false) => Type::int8(),
                    None => Type::char_(),
                }
            }
            KwShort => {
                self.advance();
                self.accept(KwInt);
                if unsigned == Some(true) {
                    Type::uint16()
                } else {
                    Type::int16()
                }
            }
            KwInt => {
                self.advance();
                if unsigned == Some(true) {
                    Type::uint32()
                } else {
                    Type::int32()
                }
            }
            KwLong => {
                self.advance();
                self.accept(KwLong);
                self.accept(KwInt);
                if unsigned == Some(true) {
                    Type::uint64()
                } else {
                    Type::int64()
                }
            }
            KwFloat => {
                self.advance();
                Type::float32()
            }
            KwDouble => {
                self.advance();
                Type::float64()
            }
            KwI8 => {
                self.advance();
                Type::int8()
            }
            KwI16 => {
                self.advance();
                Type::int16()
            }
            KwI32 => {
                self.advance();
                Type::int32()
            }
            KwI64 => {
                self.advance();
                Type::int64()
            }
            KwU8 => {
                self.advance();
                Type::uint8()
            }
            KwU16 => {
                self.advance();
                Type::uint16()
            }
            KwU32 => {
                self.advance();
                Type::uint32()
            }
            KwU64 => {
                self.advance();
                Type::uint64()
            }
            KwStruct | KwUnion => {
                self.advance();
                let name = self.expect_ident("struct name");
                Type::named_struct(name)
            }
            KwEnum => {
                self.advance();
                let name = self.expect_ident("enum name");
                std::rc::Rc::new(crate::types::Type::Enum {
                    name,
                    variants: Vec::new(),
                    width: 32,
                })
            }
            KwTuple => {
                self.advance();
                self.expect(LParen, "'('");
                let mut elements = Vec::new();
                if !self.check(RParen) {
                    loop {
                        elements.push(self.parse_type());
                        if self.accept(Comma).is_none() {
                            break;
                        }
                    }
                }
                self.expect(RParen, "')'");
                Type::tuple(elements)
            }
            KwFn => {
                self.advance();
                let ret = self.parse_type();
                self.expect(LParen, "'('");
                let mut params = Vec::new();
                let mut variadic = false;
                if !self.check(RParen) {
                    loop {
                        if self.accept(Ellipsis).is_some() {
                            variadic = true;
                            break;
                        }
                        params.push(self.parse_type());
                        if self.accept(Comma).is_none() {
                            break;
                        }
                    }
                }
                self.expect(RParen, "')'");
                Type::function(ret, params, variadic)
            }
            KwTypeof => {
                self.advance();
                self.expect(LParen, "'('");
                let expr = self.parse_expr();
                self.expect(RParen, "')'");
                Type::typeof_expr(expr)
            }
            Identifier => {
                let name = self.advance().text;
                // A bare name: struct, typedef, newtype or generic
                // parameter; the analyzer resolves it.
                Type::named_struct(name)
            }
            _ => {
                // `unsigned`/`signed` alone default to int.
                if let Some(u) = unsigned {
                    return if u { Type::uint32() } else { Type::int32() };
                }
                self.diags.error(
                    loc,
                    format!("expected type, got '{}'", self.peek().text),
                );
                Type::error()
            }
        }
    }

    fn parse_type_suffixes(&mut self, mut ty: TypeRef, base_const: bool) -> TypeRef {
        loop {
            if self.accept(TokenKind::Star).is_some() {
                let mut is_const = base_const;
                if self.accept(TokenKind::KwConst).is_some() {
                    is_const = true;
                }
                self.accept(TokenKind::KwRestrict);
                ty = Type::pointer(ty, is_const);
            } else if self.check(TokenKind::LBracket)
                && self.kind_at(1) == TokenKind::IntLiteral
                && self.kind_at(2) == TokenKind::RBracket
            {
                self.advance();
                let size = self.advance().int_value().unwrap_or(0);
                self.advance();
                ty = Type::array(ty, Some(size));
            } else {
                return ty;
            }
        }
    }

    /// C-style array dimension after a declared name: `int x[4];`.
    fn parse_post_name_array(&mut self, ty: TypeRef) -> TypeRef {
        if self.check(TokenKind::LBracket) && self.kind_at(1) != TokenKind::RBracket {
            self.advance();
            let size_tok = self.expect(TokenKind::IntLiteral, "array size");
            let size = size_tok.int_value().unwrap_or(0);
            self.expect(TokenKind::RBracket, "']'");
            return Type::array(ty, Some(size));
        }
        if self.check(TokenKind::LBracket) && self.kind_at(1) == TokenKind::RBracket {
            self.advance();
            self.advance();
            return Type::array(ty, None);
        }
        ty
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_compound(&mut self) -> Stmt {
        let loc = self.loc();
        self.expect(TokenKind::LBrace, "'{'");
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let before = self.pos;
            stmts.push(self.parse_stmt());
            if self.pos == before {
                self.advance();
            }
        }
        self.expect(TokenKind::RBrace, "'}'");
        Stmt::new(StmtKind::Compound(stmts), loc)
    }

    pub fn parse_stmt(&mut self) -> Stmt {
        let loc = self.loc();
        match self.kind() {
            TokenKind::LBrace => self.parse_compound(),
            TokenKind::Semicolon => {
                self.advance();
                Stmt::new(StmtKind::Empty, loc)
            }
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwWhile => self.parse_while(None),
            TokenKind::KwDo => self.parse_do_while(None),
            TokenKind::KwFor => self.parse_for(None),
            TokenKind::KwReturn => {
                self.advance();
                let value = if self.check(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr())
                };
                self.expect(TokenKind::Semicolon, "';'");
                Stmt::new(StmtKind::Return(value), loc)
            }
            TokenKind::KwBreak => {
                self.advance();
                let label = self.accept(TokenKind::Identifier).map(|t| t.text);
                self.expect(TokenKind::Semicolon, "';'");
                Stmt::new(StmtKind::Break(label), loc)
            }
            TokenKind::KwContinue => {
                self.advance();
                let label = self.accept(TokenKind::Identifier).map(|t| t.text);
                self.expect(TokenKind::Semicolon, "';'");
                Stmt::new(StmtKind::Continue(label), loc)
            }
            TokenKind::KwGoto => {
                self.advance();
                let label = self.expect_ident("label name");
                self.expect(TokenKind::Semicolon, "';'");
                Stmt::new(StmtKind::Goto(label), loc)
            }
            TokenKind::KwUnsafe => {
                self.advance();
                let body = self.parse_compound();
                Stmt::new(StmtKind::Unsafe(Box::new(body)), loc)
            }
            TokenKind::KwDefer => {
                self.advance();
                let body = self.parse_stmt();
                Stmt::new(StmtKind::Defer(Box::new(body)), loc)
            }
            TokenKind::KwErrdefer => {
                self.advance();
                let body = self.parse_stmt();
                Stmt::new(StmtKind::Errdefer(Box::new(body)), loc)
            }
            TokenKind::KwMatch => self.parse_match(),
            TokenKind::KwStaticAssert => {
                let (cond, message) = match self.parse_static_assert() {
                    Some(pair) => pair,
                    None => return Stmt::new(StmtKind::Empty, loc),
                };
                Stmt::new(StmtKind::StaticAssert { cond, message }, loc)
            }
            // Label: `name: stmt` (`::` lexes as one token, so this never
            // fires on a qualified name).
            TokenKind::Identifier if self.kind_at(1) == TokenKind::Colon => {
                let name = self.advance().text;
                self.advance(); // ':'
                let inner = self.parse_stmt();
                // Labels attach directly to loops so `break label` can
                // find them.
                match inner.kind {
                    StmtKind::While { cond, body, .. } => Stmt::new(
                        StmtKind::While {
                            cond,
                            body,
                            label: Some(name),
                        },
                        loc,
                    ),
                    StmtKind::DoWhile { body, cond, .. } => Stmt::new(
                        StmtKind::DoWhile {
                            body,
                            cond,
                            label: Some(name),
                        },
                        loc,
                    ),
                    StmtKind::For {
                        init,
                        cond,
                        step,
                        body,
                        ..
                    } => Stmt::new(
                        StmtKind::For {
                            init,
                            cond,
                            step,
                            body,
                            label: Some(name),
                        },
                        loc,
                    ),
                    _ => Stmt::new(
                        StmtKind::Label {
                            name,
                            stmt: Box::new(inner),
                        },
                        loc,
                    ),
                }
            }
            _ if self.stmt_starts_decl() => self.parse_var_decl_stmt(),
            _ => {
                let expr = self.parse_expr();
                self.expect(TokenKind::Semicolon, "';'");
                Stmt::new(StmtKind::Expr(expr), loc)
            }
        }
    }

    /// The declaration-vs-expression lookahead: a type-keyword start,
    /// `Ident Ident`, or `Ident * Ident` begins a declaration; so do the
    /// reference/optional/slice type prefixes.
    fn stmt_starts_decl(&self) -> bool {
        let k = self.kind();
        if k.starts_type() || matches!(k, TokenKind::KwStatic) {
            return true;
        }
        match k {
            TokenKind::Identifier => {
                (self.kind_at(1) == TokenKind::Identifier
                    && self.kind_at(2) != TokenKind::Colon)
                    || (self.kind_at(1) == TokenKind::Star
                        && self.kind_at(2) == TokenKind::Identifier)
            }
            TokenKind::Amp | TokenKind::QuestionAmp => {
                self.kind_at(1) == TokenKind::KwStatic
                    || (self.kind_at(1) == TokenKind::Identifier
                        && matches!(
                            self.peek_at(1).text.as_str(),
                            "stack" | "heap" | "arena"
                        ))
            }
            TokenKind::Question => self.kind_at(1).starts_type(),
            TokenKind::LBracket => self.kind_at(1) == TokenKind::RBracket,
            _ => false,
        }
    }

    fn parse_var_decl_stmt(&mut self) -> Stmt {
        let loc = self.loc();
        let mut is_const = false;
        let mut is_static = false;
        loop {
            if self.check(TokenKind::KwConst) && self.kind_at(1) != TokenKind::Star {
                // `const` binding; `const` before `*` belongs to the type.
                self.advance();
                is_const = true;
            } else if self.check(TokenKind::KwStatic) {
                self.advance();
                is_static = true;
            } else {
                break;
            }
        }

        let declared_ty = self.parse_type();
        let name = self.expect_ident("variable name");
        let declared_ty = self.parse_post_name_array(declared_ty);

        let init = if self.accept(TokenKind::Assign).is_some() {
            Some(self.parse_expr())
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'");

        Stmt::new(
            StmtKind::Var(VarDecl {
                name,
                declared_ty,
                ty: None,
                init,
                is_const,
                is_static,
            }),
            loc,
        )
    }

    fn parse_if(&mut self) -> Stmt {
        let loc = self.loc();
        self.advance(); // if
        let is_const = self.accept(TokenKind::KwConst).is_some();
        self.expect(TokenKind::LParen, "'('");
        let cond = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");
        let then_branch = Box::new(self.parse_stmt());
        let else_branch = if self.accept(TokenKind::KwElse).is_some() {
            Some(Box::new(self.parse_stmt()))
        } else {
            None
        };
        Stmt::new(
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
                is_const,
                const_result: None,
            },
            loc,
        )
    }

    fn parse_while(&mut self, label: Option<String>) -> Stmt {
        let loc = self.loc();
        self.advance(); // while
        self.expect(TokenKind::LParen, "'('");
        let cond = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");
        let body = Box::new(self.parse_stmt());
        Stmt::new(StmtKind::While { cond, body, label }, loc)
    }

    fn parse_do_while(&mut self, label: Option<String>) -> Stmt {
        let loc = self.loc();
        self.advance(); // do
        let body = Box::new(self.parse_stmt());
        self.expect(TokenKind::KwWhile, "'while'");
        self.expect(TokenKind::LParen, "'('");
        let cond = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");
        self.expect(TokenKind::Semicolon, "';'");
        Stmt::new(StmtKind::DoWhile { body, cond, label }, loc)
    }

    fn parse_for(&mut self, label: Option<String>) -> Stmt {
        let loc = self.loc();
        self.advance(); // for
        self.expect(TokenKind::LParen, "'('");

        let init = if self.accept(TokenKind::Semicolon).is_some() {
            None
        } else if self.stmt_starts_decl() {
            Some(Box::new(self.parse_var_decl_stmt()))
        } else {
            let e = self.parse_expr();
            let e_loc = e.loc.clone();
            self.expect(TokenKind::Semicolon, "';'");
            Some(Box::new(Stmt::new(StmtKind::Expr(e), e_loc)))
        };

        let cond = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect(TokenKind::Semicolon, "';'");

        let step = if self.check(TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect(TokenKind::RParen, "')'");

        let body = Box::new(self.parse_stmt());
        Stmt::new(
            StmtKind::For {
                init,
                cond,
                step,
                body,
                label,
            },
            loc,
        )
    }

    fn parse_match(&mut self) -> Stmt {
        let loc = self.loc();
        self.advance(); // match
        self.expect(TokenKind::LParen, "'('");
        let subject = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");
        self.expect(TokenKind::LBrace, "'{'");

        let mut arms = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            let arm_loc = self.loc();
            let (patterns, is_default) = if self.accept(TokenKind::KwDefault).is_some() {
                self.expect(TokenKind::Colon, "':'");
                (Vec::new(), true)
            } else {
                self.expect(TokenKind::KwCase, "'case' or 'default'");
                let mut pats = vec![self.parse_pattern()];
                while self.accept(TokenKind::Comma).is_some() {
                    pats.push(self.parse_pattern());
                }
                self.expect(TokenKind::Colon, "':'");
                (pats, false)
            };

            let mut body_stmts = Vec::new();
            while !matches!(
                self.kind(),
                TokenKind::KwCase | TokenKind::KwDefault | TokenKind::RBrace | TokenKind::Eof
            ) {
                let before = self.pos;
                body_stmts.push(self.parse_stmt());
                if self.pos == before {
                    self.advance();
                }
            }
            let body = Stmt::new(StmtKind::Compound(body_stmts), arm_loc.clone());
            arms.push(MatchArm {
                patterns,
                body,
                is_default,
                loc: arm_loc,
            });
        }
        self.expect(TokenKind::RBrace, "'}'");
        Stmt::new(StmtKind::Match { subject, arms }, loc)
    }

    fn parse_pattern(&mut self) -> Pattern {
        // Integer (with optional leading minus) and inclusive ranges.
        let parse_int = |parser: &mut Self| -> Option<i64> {
            let negative = parser.accept(TokenKind::Minus).is_some();
            let tok = parser.accept(TokenKind::IntLiteral)?;
            let v = tok.int_value().unwrap_or(0) as i64;
            Some(if negative { -v } else { v })
        };

        if self.check(TokenKind::IntLiteral) || self.check(TokenKind::Minus) {
            let lo = parse_int(self).unwrap_or(0);
            if self.accept(TokenKind::Ellipsis).is_some() {
                let hi = parse_int(self).unwrap_or(lo);
                return Pattern::Range(lo, hi);
            }
            return Pattern::Int(lo);
        }
        if self.check(TokenKind::CharLiteral) {
            let tok = self.advance();
            let c = match tok.value {
                TokenValue::Char(c) => c,
                _ => '\0',
            };
            return Pattern::Char(c);
        }
        if self.check(TokenKind::Identifier) {
            let name = self.advance().text;
            if name == "_" {
                return Pattern::Wildcard;
            }
            // Optional payload binding: `Variant(binding)`.
            let binding = if self.accept(TokenKind::LParen).is_some() {
                let b = self.expect_ident("binding name");
                self.expect(TokenKind::RParen, "')'");
                Some(b)
            } else {
                None
            };
            return Pattern::Variant { name, binding };
        }

        let loc = self.loc();
        self.diags.error(
            loc,
            format!("expected pattern, got '{}'", self.peek().text),
        );
        self.advance();
        Pattern::Wildcard
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Expr {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Expr {
        let target = self.parse_ternary();
        let op = match self.kind() {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            TokenKind::PercentAssign => AssignOp::Rem,
            TokenKind::AmpAssign => AssignOp::BitAnd,
            TokenKind::PipeAssign => AssignOp::BitOr,
            TokenKind::CaretAssign => AssignOp::BitXor,
            TokenKind::ShlAssign => AssignOp::Shl,
            TokenKind::ShrAssign => AssignOp::Shr,
            _ => return target,
        };
        let loc = self.loc();
        self.advance();
        let value = self.parse_assignment();
        Expr::new(
            ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            loc,
        )
    }

    fn parse_ternary(&mut self) -> Expr {
        let cond = self.parse_binary(0);
        if self.check(TokenKind::Question) {
            let loc = self.loc();
            self.advance();
            let then_expr = self.parse_expr();
            self.expect(TokenKind::Colon, "':'");
            let else_expr = self.parse_assignment();
            return Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                loc,
            );
        }
        cond
    }

    fn binary_op_for(kind: TokenKind) -> Option<(BinaryOp, u8)> {
        use TokenKind::*;
        let entry = match kind {
            OrOr => (BinaryOp::LogOr, 1),
            AndAnd => (BinaryOp::LogAnd, 2),
            Pipe => (BinaryOp::BitOr, 3),
            Caret => (BinaryOp::BitXor, 4),
            Amp => (BinaryOp::BitAnd, 5),
            Eq => (BinaryOp::Eq, 6),
            Ne => (BinaryOp::Ne, 6),
            Lt => (BinaryOp::Lt, 7),
            Gt => (BinaryOp::Gt, 7),
            Le => (BinaryOp::Le, 7),
            Ge => (BinaryOp::Ge, 7),
            Shl => (BinaryOp::Shl, 8),
            Shr => (BinaryOp::Shr, 8),
            Plus => (BinaryOp::Add, 9),
            Minus => (BinaryOp::Sub, 9),
            Star => (BinaryOp::Mul, 10),
            Slash => (BinaryOp::Div, 10),
            Percent => (BinaryOp::Rem, 10),
            _ => return None,
        };
        Some(entry)
    }

    /// Precedence climbing over the C binary-operator table.
    fn parse_binary(&mut self, min_prec: u8) -> Expr {
        let mut lhs = self.parse_unary();
        while let Some((op, prec)) = Self::binary_op_for(self.kind()) {
            if prec < min_prec {
                break;
            }
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_binary(prec + 1);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    resolved_operator: None,
                },
                loc,
            );
        }
        lhs
    }

    fn parse_unary(&mut self) -> Expr {
        let loc = self.loc();
        let op = match self.kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Amp => Some(UnaryOp::AddrOf),
            TokenKind::Star => Some(UnaryOp::Deref),
            TokenKind::Inc => Some(UnaryOp::PreInc),
            TokenKind::Dec => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary();
            return Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            );
        }

        // Cast: `(type) expr`.
        if self.check(TokenKind::LParen) && self.cast_follows() {
            self.advance();
            let target = self.parse_type();
            self.expect(TokenKind::RParen, "')'");
            let operand = self.parse_unary();
            return Expr::new(
                ExprKind::Cast {
                    target,
                    operand: Box::new(operand),
                },
                loc,
            );
        }

        if self.check(TokenKind::KwTry) {
            self.advance();
            let inner = self.parse_unary();
            return Expr::new(ExprKind::Try(Box::new(inner)), loc);
        }

        self.parse_postfix()
    }

    /// Lookahead for the cast-vs-parenthesized ambiguity. A `(` begins a
    /// cast when a type keyword follows, or when `(Name)` or `(Name*)` is
    /// followed by something an expression can start with.
    fn cast_follows(&self) -> bool {
        let k1 = self.kind_at(1);
        if k1.starts_type()
            || matches!(k1, TokenKind::Amp | TokenKind::QuestionAmp)
                && self.kind_at(2) == TokenKind::Identifier
                && matches!(
                    self.peek_at(2).text.as_str(),
                    "stack" | "heap" | "arena"
                )
        {
            return true;
        }
        if k1 == TokenKind::Identifier {
            if self.kind_at(2) == TokenKind::Star {
                return true;
            }
            if self.kind_at(2) == TokenKind::RParen {
                return Self::starts_expression(self.kind_at(3));
            }
        }
        false
    }

    fn starts_expression(kind: TokenKind) -> bool {
        use TokenKind::*;
        matches!(
            kind,
            IntLiteral
                | FloatLiteral
                | StringLiteral
                | CharLiteral
                | Identifier
                | LParen
                | LBrace
                | Amp
                | Star
                | Not
                | Tilde
                | Minus
                | Inc
                | Dec
                | KwSizeof
                | KwAlignof
                | KwFieldcount
                | KwNew
                | KwSpawn
                | KwJoin
                | KwTry
                | KwTrue
                | KwFalse
                | KwNull
                | KwArenaReset
        )
    }

    fn parse_postfix(&mut self) -> Expr {
        let mut expr = self.parse_primary();
        loop {
            match self.kind() {
                TokenKind::LParen => {
                    let loc = self.loc();
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr());
                            if self.accept(TokenKind::Comma).is_none() {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'");
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                            method_base: None,
                        },
                        loc,
                    );
                }
                TokenKind::LBracket => {
                    let loc = self.loc();
                    self.advance();
                    let index = self.parse_expr();
                    self.expect(TokenKind::RBracket, "']'");
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                            bounds_check_omit: false,
                        },
                        loc,
                    );
                }
                TokenKind::Dot | TokenKind::Arrow => {
                    let is_arrow = self.kind() == TokenKind::Arrow;
                    let loc = self.loc();
                    self.advance();
                    let member = self.expect_ident("member name");
                    expr = Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            member,
                            is_arrow,
                        },
                        loc,
                    );
                }
                TokenKind::Inc | TokenKind::Dec => {
                    let op = if self.kind() == TokenKind::Inc {
                        UnaryOp::PostInc
                    } else {
                        UnaryOp::PostDec
                    };
                    let loc = self.loc();
                    self.advance();
                    expr = Expr::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(expr),
                        },
                        loc,
                    );
                }
                _ => return expr,
            }
        }
    }

    fn parse_primary(&mut self) -> Expr {
        let loc = self.loc();
        match self.kind() {
            TokenKind::IntLiteral => {
                let tok = self.advance();
                match tok.value {
                    TokenValue::Int {
                        value,
                        unsigned,
                        long_long,
                    } => Expr::new(
                        ExprKind::IntLit {
                            value,
                            unsigned,
                            long_long,
                        },
                        loc,
                    ),
                    _ => Expr::int_lit(0, loc),
                }
            }
            TokenKind::FloatLiteral => {
                let tok = self.advance();
                let v = match tok.value {
                    TokenValue::Float(v) => v,
                    _ => 0.0,
                };
                Expr::new(ExprKind::FloatLit(v), loc)
            }
            TokenKind::StringLiteral => {
                let tok = self.advance();
                let s = match tok.value {
                    TokenValue::Str(s) => s,
                    _ => String::new(),
                };
                Expr::new(ExprKind::StrLit(s), loc)
            }
            TokenKind::CharLiteral => {
                let tok = self.advance();
                let c = match tok.value {
                    TokenValue::Char(c) => c,
                    _ => '\0',
                };
                Expr::new(ExprKind::CharLit(c), loc)
            }
            TokenKind::KwTrue => {
                self.advance();
                Expr::new(ExprKind::BoolLit(true), loc)
            }
            TokenKind::KwFalse => {
                self.advance();
                Expr::new(ExprKind::BoolLit(false), loc)
            }
            TokenKind::KwNull => {
                self.advance();
                Expr::new(ExprKind::NullLit, loc)
            }
            TokenKind::Identifier => {
                let name = self.advance().text;
                // Tagged-union constructor: `Union::Variant(value?)`.
                if self.check(TokenKind::ColonColon) {
                    self.advance();
                    let variant = self.expect_ident("variant name");
                    let value = if self.accept(TokenKind::LParen).is_some() {
                        let v = if self.check(TokenKind::RParen) {
                            None
                        } else {
                            Some(Box::new(self.parse_expr()))
                        };
                        self.expect(TokenKind::RParen, "')'");
                        v
                    } else {
                        None
                    };
                    return Expr::new(
                        ExprKind::UnionInit {
                            union_name: name,
                            variant,
                            value,
                            tag: None,
                        },
                        loc,
                    );
                }
                Expr::new(
                    ExprKind::Ident {
                        name,
                        resolved: None,
                    },
                    loc,
                )
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.parse_expr();
                if self.check(TokenKind::Comma) {
                    // Tuple literal `(a, b, c)`.
                    let mut elements = vec![first];
                    while self.accept(TokenKind::Comma).is_some() {
                        elements.push(self.parse_expr());
                    }
                    self.expect(TokenKind::RParen, "')'");
                    return Expr::new(ExprKind::TupleLit(elements), loc);
                }
                self.expect(TokenKind::RParen, "')'");
                first
            }
            TokenKind::LBrace => {
                // Compound initializer `{ a, b, c }`.
                self.advance();
                let mut elements = Vec::new();
                if !self.check(TokenKind::RBrace) {
                    loop {
                        elements.push(self.parse_expr());
                        if self.accept(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBrace, "'}'");
                Expr::new(ExprKind::CompoundInit(elements), loc)
            }
            TokenKind::KwSizeof => {
                self.advance();
                // `sizeof...(pack)`
                if self.accept(TokenKind::Ellipsis).is_some() {
                    self.expect(TokenKind::LParen, "'('");
                    let pack = self.expect_ident("pack name");
                    self.expect(TokenKind::RParen, "')'");
                    return Expr::new(ExprKind::SizeofPack(pack), loc);
                }
                // `sizeof(T)` vs `sizeof expr`. A single parenthesized
                // name reads as a type here; the analyzer falls back to
                // the variable's type when the name is a binding.
                if self.check(TokenKind::LParen)
                    && (self.cast_follows()
                        || (self.kind_at(1) == TokenKind::Identifier
                            && self.kind_at(2) == TokenKind::RParen))
                {
                    self.advance();
                    let ty = self.parse_type();
                    self.expect(TokenKind::RParen, "')'");
                    return Expr::new(ExprKind::SizeofType(ty), loc);
                }
                let operand = self.parse_unary();
                Expr::new(ExprKind::SizeofExpr(Box::new(operand)), loc)
            }
            TokenKind::KwAlignof => {
                self.advance();
                self.expect(TokenKind::LParen, "'('");
                let ty = self.parse_type();
                self.expect(TokenKind::RParen, "')'");
                Expr::new(ExprKind::Alignof(ty), loc)
            }
            TokenKind::KwFieldcount => {
                self.advance();
                self.expect(TokenKind::LParen, "'('");
                let ty = self.parse_type();
                self.expect(TokenKind::RParen, "')'");
                Expr::new(ExprKind::FieldCount(ty), loc)
            }
            TokenKind::KwNew => {
                self.advance();
                self.expect(TokenKind::Lt, "'<'");
                let region = match self.parse_region_qualifier() {
                    Some(r) => r,
                    None => {
                        // A bare name is an arena.
                        let name = self.expect_ident("region name");
                        Region::Arena(name)
                    }
                };
                self.expect(TokenKind::Gt, "'>'");
                let ty = self.parse_type();
                Expr::new(ExprKind::New { region, ty }, loc)
            }
            TokenKind::KwArenaReset => {
                self.advance();
                self.expect(TokenKind::Lt, "'<'");
                let name = self.expect_ident("arena name");
                self.expect(TokenKind::Gt, "'>'");
                self.expect(TokenKind::LParen, "'('");
                self.expect(TokenKind::RParen, "')'");
                Expr::new(ExprKind::ArenaReset(name), loc)
            }
            TokenKind::KwSpawn => {
                self.advance();
                self.expect(TokenKind::LParen, "'('");
                let func = self.parse_expr();
                self.expect(TokenKind::Comma, "','");
                let arg = self.parse_expr();
                self.expect(TokenKind::RParen, "')'");
                Expr::new(
                    ExprKind::Spawn {
                        func: Box::new(func),
                        arg: Box::new(arg),
                    },
                    loc,
                )
            }
            TokenKind::KwJoin => {
                // `join(h)` desugars to the runtime hook `__safec_join(h)`.
                self.advance();
                self.expect(TokenKind::LParen, "'('");
                let handle = self.parse_expr();
                self.expect(TokenKind::RParen, "')'");
                let callee = Expr::new(
                    ExprKind::Ident {
                        name: "__safec_join".to_string(),
                        resolved: None,
                    },
                    loc.clone(),
                );
                Expr::new(
                    ExprKind::Call {
                        callee: Box::new(callee),
                        args: vec![handle],
                        method_base: None,
                    },
                    loc,
                )
            }
            _ => {
                self.diags.error(
                    loc.clone(),
                    format!("expected expression, got '{}'", self.peek().text),
                );
                self.advance();
                let mut e = Expr::int_lit(0, loc);
                e.ty = Some(Type::error());
                e
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse_unit(source: &str) -> (TranslationUnit, Diagnostics) {
        let mut diags = Diagnostics::silent();
        let tokens = Lexer::new(source, "test.sc", &mut diags).tokenize();
        let unit = Parser::new(tokens, &mut diags).parse();
        (unit, diags)
    }

    fn parse_ok(source: &str) -> TranslationUnit {
        let (unit, diags) = parse_unit(source);
        assert_eq!(
            diags.error_count(),
            0,
            "unexpected errors: {:?}",
            diags.diagnostics()
        );
        unit
    }

    #[test]
    fn test_simple_function() {
        let unit = parse_ok("int main() { return 0; }");
        assert_eq!(unit.decls.len(), 1);
        let f = unit.find_function("main").unwrap();
        assert!(matches!(*f.return_type, crate::types::Type::Int32));
        assert!(f.body.is_some());
    }

    #[test]
    fn test_function_qualifiers() {
        let unit = parse_ok("consteval inline int five() { return 5; }");
        let f = unit.find_function("five").unwrap();
        assert!(f.flags.is_consteval);
        assert!(f.flags.is_inline);
    }

    #[test]
    fn test_extern_declaration() {
        let unit = parse_ok("extern int puts(char* s);");
        let f = unit.find_function("puts").unwrap();
        assert!(f.flags.is_extern);
        assert!(f.body.is_none());
    }

    #[test]
    fn test_reference_types() {
        let unit = parse_ok("&stack int f(?&heap int p) { return 0; }");
        let f = unit.find_function("f").unwrap();
        match &*f.return_type {
            crate::types::Type::Reference {
                region, nullable, ..
            } => {
                assert_eq!(*region, Region::Stack);
                assert!(!nullable);
            }
            other => panic!("expected reference, got {:?}", other),
        }
        match &*f.params[0].ty {
            crate::types::Type::Reference {
                region, nullable, ..
            } => {
                assert_eq!(*region, Region::Heap);
                assert!(nullable);
            }
            other => panic!("expected nullable reference, got {:?}", other),
        }
    }

    #[test]
    fn test_arena_reference_type() {
        let unit = parse_ok("void f(&arena<scratch> int p) { }");
        let f = unit.find_function("f").unwrap();
        match &*f.params[0].ty {
            crate::types::Type::Reference { region, .. } => {
                assert_eq!(*region, Region::Arena("scratch".to_string()));
            }
            other => panic!("expected arena reference, got {:?}", other),
        }
    }

    #[test]
    fn test_struct_and_enum_decls() {
        let unit = parse_ok(
            "struct Point { int x; int y; }\n\
             enum Color { Red, Green = 3, Blue }\n\
             packed struct Header { u8 tag; u16 len; }",
        );
        assert_eq!(unit.decls.len(), 3);
        match &unit.decls[0] {
            Decl::Struct(s) => {
                assert_eq!(s.name, "Point");
                assert_eq!(s.fields.len(), 2);
                assert!(!s.packed);
            }
            other => panic!("expected struct, got {:?}", other),
        }
        match &unit.decls[1] {
            Decl::Enum(e) => {
                assert_eq!(e.variants.len(), 3);
                assert!(e.variants[1].1.is_some());
            }
            other => panic!("expected enum, got {:?}", other),
        }
        match &unit.decls[2] {
            Decl::Struct(s) => assert!(s.packed),
            other => panic!("expected packed struct, got {:?}", other),
        }
    }

    #[test]
    fn test_region_decl() {
        let unit = parse_ok("region scratch capacity 4096;");
        match &unit.decls[0] {
            Decl::Region(r) => {
                assert_eq!(r.name, "scratch");
                assert!(r.capacity.is_some());
            }
            other => panic!("expected region, got {:?}", other),
        }
    }

    #[test]
    fn test_method_and_operator_decl() {
        let unit = parse_ok(
            "struct Vec2 { float x; float y; }\n\
             float Vec2::length() const { return 0; }\n\
             Vec2 Vec2::operator+(Vec2 other) { return other; }",
        );
        let length = unit.find_function("length").unwrap();
        assert!(length.flags.is_method);
        assert!(length.flags.const_method);
        assert_eq!(length.owner.as_deref(), Some("Vec2"));

        let plus = unit.find_function("operator+").unwrap();
        assert!(plus.flags.is_method);
        assert_eq!(plus.owner.as_deref(), Some("Vec2"));
    }

    #[test]
    fn test_generic_function() {
        let unit = parse_ok("generic<T> T id(T x) { return x; }");
        let f = unit.find_function("id").unwrap();
        assert_eq!(f.generic_params.len(), 1);
        assert_eq!(f.generic_params[0].name, "T");
        assert!(!f.generic_params[0].is_pack);
    }

    #[test]
    fn test_generic_pack_and_constraint() {
        let unit = parse_ok("generic<T: Numeric, R...> T sum(T first, R... rest) { return first; }");
        let f = unit.find_function("sum").unwrap();
        assert_eq!(f.generic_params[0].constraint.as_deref(), Some("Numeric"));
        assert!(f.generic_params[1].is_pack);
    }

    #[test]
    fn test_var_decl_lookahead() {
        // `Ident Ident` and `Ident * Ident` start declarations; plain
        // expressions do not.
        let unit = parse_ok(
            "int main() { Point p; Node* n; int x = 1; x * 2; return 0; }",
        );
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        assert!(matches!(body[0].kind, StmtKind::Var(_)));
        assert!(matches!(body[1].kind, StmtKind::Var(_)));
        assert!(matches!(body[2].kind, StmtKind::Var(_)));
        assert!(matches!(body[3].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn test_statements_roundup() {
        parse_ok(
            "int main() {\n\
               int i = 0;\n\
               while (i < 10) { i++; }\n\
               do { i--; } while (i > 0);\n\
               for (int j = 0; j < 4; j++) { }\n\
               outer: while (true) { break outer; }\n\
               if (i) { } else { }\n\
               unsafe { }\n\
               defer i = 0;\n\
               errdefer i = 1;\n\
               goto done;\n\
               done: ;\n\
               return 0;\n\
             }",
        );
    }

    #[test]
    fn test_label_attaches_to_loop() {
        let unit = parse_ok("int main() { outer: while (1) { break outer; } return 0; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::While { label, .. } => assert_eq!(label.as_deref(), Some("outer")),
            other => panic!("expected labeled while, got {:?}", other),
        }
    }

    #[test]
    fn test_if_const() {
        let unit = parse_ok("int main() { if const (1 == 1) { return 1; } return 0; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::If {
                is_const,
                const_result,
                ..
            } => {
                assert!(*is_const);
                assert!(const_result.is_none());
            }
            other => panic!("expected if const, got {:?}", other),
        }
    }

    #[test]
    fn test_match_statement() {
        let unit = parse_ok(
            "int classify(int x) {\n\
               match (x) {\n\
                 case 0: return 0;\n\
                 case 1 ... 9, 'A': return 1;\n\
                 case Some(v): return v;\n\
                 default: return 2;\n\
               }\n\
             }",
        );
        let f = unit.find_function("classify").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Match { arms, .. } => {
                assert_eq!(arms.len(), 4);
                assert_eq!(arms[0].patterns, vec![Pattern::Int(0)]);
                assert_eq!(
                    arms[1].patterns,
                    vec![Pattern::Range(1, 9), Pattern::Char('A')]
                );
                assert_eq!(
                    arms[2].patterns,
                    vec![Pattern::Variant {
                        name: "Some".to_string(),
                        binding: Some("v".to_string())
                    }]
                );
                assert!(arms[3].is_default);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_expression_precedence() {
        let unit = parse_ok("int x = 1 + 2 * 3;");
        match &unit.decls[0] {
            Decl::Global(g) => match &g.init.as_ref().unwrap().kind {
                ExprKind::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        rhs.kind,
                        ExprKind::Binary {
                            op: BinaryOp::Mul,
                            ..
                        }
                    ));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            other => panic!("expected global, got {:?}", other),
        }
    }

    #[test]
    fn test_addr_of_and_deref_are_tagged() {
        let unit = parse_ok("int main() { int x = 0; int* p; p = &x; x = *p; return x; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        let assign_val = |stmt: &Stmt| -> ExprKind {
            match &stmt.kind {
                StmtKind::Expr(Expr {
                    kind: ExprKind::Assign { value, .. },
                    ..
                }) => value.kind.clone(),
                other => panic!("expected assignment, got {:?}", other),
            }
        };
        assert!(matches!(
            assign_val(&body[2]),
            ExprKind::Unary {
                op: UnaryOp::AddrOf,
                ..
            }
        ));
        assert!(matches!(
            assign_val(&body[3]),
            ExprKind::Unary {
                op: UnaryOp::Deref,
                ..
            }
        ));
    }

    #[test]
    fn test_special_primaries() {
        parse_ok(
            "region scratch capacity 64;\n\
             int main() {\n\
               int a = sizeof(int);\n\
               int b = sizeof a;\n\
               int c = alignof(i64);\n\
               int d = fieldcount(Point);\n\
               int* p = new<heap> int;\n\
               arena_reset<scratch>();\n\
               i64 h = spawn(worker, null);\n\
               i64 r = join(h);\n\
               return 0;\n\
             }",
        );
    }

    #[test]
    fn test_join_desugars() {
        let unit = parse_ok("int main() { return join(7); }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Return(Some(Expr {
                kind: ExprKind::Call { callee, .. },
                ..
            })) => match &callee.kind {
                ExprKind::Ident { name, .. } => assert_eq!(name, "__safec_join"),
                other => panic!("expected ident callee, got {:?}", other),
            },
            other => panic!("expected return call, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_literal_and_compound_init() {
        parse_ok("int main() { (int, bool) t = (1, true); Point p = { 1, 2 }; return 0; }");
    }

    #[test]
    fn test_union_constructor() {
        let unit = parse_ok("int main() { Shape s = Shape::Circle(3); return 0; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Var(v) => match &v.init.as_ref().unwrap().kind {
                ExprKind::UnionInit {
                    union_name,
                    variant,
                    value,
                    tag,
                } => {
                    assert_eq!(union_name, "Shape");
                    assert_eq!(variant, "Circle");
                    assert!(value.is_some());
                    assert!(tag.is_none());
                }
                other => panic!("expected union constructor, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_disambiguation() {
        // `(Foo)x` is a cast; `(foo)` alone is a parenthesized expression.
        let unit = parse_ok("int main() { int y = (Foo)1; int z = (y); return z; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[0].kind {
            StmtKind::Var(v) => {
                assert!(matches!(
                    v.init.as_ref().unwrap().kind,
                    ExprKind::Cast { .. }
                ));
            }
            other => panic!("expected var, got {:?}", other),
        }
        match &body[1].kind {
            StmtKind::Var(v) => {
                assert!(matches!(
                    v.init.as_ref().unwrap().kind,
                    ExprKind::Ident { .. }
                ));
            }
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_static_assert_forms() {
        let unit = parse_ok(
            "static_assert(1 + 2 == 3, \"sum\");\n\
             int main() { static_assert(sizeof(int) == 4, \"abi\"); return 0; }",
        );
        assert!(matches!(unit.decls[0], Decl::StaticAssert(_)));
    }

    #[test]
    fn test_parser_determinism() {
        let source = "generic<T> T id(T x) { return x; }\n\
                      struct P { int x; }\n\
                      int main() { P p; p.x = id(3); return p.x; }";
        let (a, d1) = parse_unit(source);
        let (b, d2) = parse_unit(source);
        assert_eq!(d1.error_count(), d2.error_count());
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn test_error_recovery_continues() {
        let (unit, diags) = parse_unit(
            "int broken(;\n\
             int fine() { return 1; }",
        );
        assert!(diags.has_errors());
        assert!(unit.find_function("fine").is_some());
    }

    #[test]
    fn test_sync_after_top_level_garbage() {
        let (unit, diags) = parse_unit("+ + +;\nint ok() { return 1; }");
        assert!(diags.has_errors());
        assert!(unit.find_function("ok").is_some());
    }

    #[test]
    fn test_recovery_skips_garbage_between_decls() {
        let (unit, diags) = parse_unit(
            "struct Bad { int }\n\
             int ok() { return 2; }",
        );
        assert!(diags.has_errors());
        assert!(unit.find_function("ok").is_some());
    }

    #[test]
    fn test_typeof_type() {
        let unit = parse_ok("int main() { int x = 1; typeof(x) y = x; return y; }");
        let f = unit.find_function("main").unwrap();
        let body = match &f.body.as_ref().unwrap().kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!("expected compound"),
        };
        match &body[1].kind {
            StmtKind::Var(v) => {
                assert!(matches!(
                    &*v.declared_ty,
                    crate::types::Type::Typeof { .. }
                ));
            }
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_and_slice_types() {
        let unit = parse_ok("?int find([]int xs) { return null; }");
        let f = unit.find_function("find").unwrap();
        assert!(matches!(
            &*f.return_type,
            crate::types::Type::Optional { .. }
        ));
        assert!(matches!(&*f.params[0].ty, crate::types::Type::Slice { .. }));
    }

    #[test]
    fn test_variadic_extern() {
        let unit = parse_ok("extern int printf(char* fmt, ...);");
        let f = unit.find_function("printf").unwrap();
        assert!(f.variadic);
        assert_eq!(f.params.len(), 1);
    }
}
