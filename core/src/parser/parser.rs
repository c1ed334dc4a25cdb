//! Statement and expression parsing.

use ecow::EcoString;

use crate::ast::{CatchClause, Decl, Expr, FuncLit, Ident, MapEntry, Stmt, VarSpec};
use crate::errors::Diagnostic;
use crate::parser::lexer::{Lexeme, Lexer};
use crate::source::{FileSet, Pos};
use crate::token::Token;

/// Parse one source file into a statement list, registering the file in
/// `file_set`. All lex and parse problems are returned together.
pub fn parse(
    file_set: &mut FileSet,
    filename: &str,
    src: &str,
    trace: bool,
) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
    let base = file_set.add_file(filename, src).base;
    let mut parser = Parser::new(src, base, trace);
    let stmts = parser.parse_program();
    let mut errors = std::mem::take(&mut parser.lexer.errors);
    errors.extend(parser.errors);
    if errors.is_empty() {
        Ok(stmts)
    } else {
        errors.sort_by_key(|d| d.pos);
        Err(errors)
    }
}

/// Unit error: the message already landed in `self.errors`.
type PResult<T> = Result<T, ()>;

struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Lexeme,
    peek: Lexeme,
    errors: Vec<Diagnostic>,
    /// Inside an `if`/`for` header a `{` opens the body, not a map
    /// literal.
    no_map_literal: bool,
    trace: bool,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, base: Pos, trace: bool) -> Self {
        let mut lexer = Lexer::new(src, base);
        let cur = lexer.next_token();
        let peek = lexer.next_token();
        Parser {
            lexer,
            cur,
            peek,
            errors: Vec::new(),
            no_map_literal: false,
            trace,
        }
    }

    fn advance(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, self.lexer.next_token());
    }

    fn at(&self, token: Token) -> bool {
        self.cur.token == token
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, pos: Pos, message: impl Into<String>) {
        self.errors.push(Diagnostic::new(message, pos));
    }

    fn expect(&mut self, token: Token) -> PResult<Lexeme> {
        if self.at(token) {
            let lx = self.cur.clone();
            self.advance();
            Ok(lx)
        } else {
            self.error_at(
                self.cur.pos,
                format!("expected '{}', found '{}'", token, self.cur.token),
            );
            Err(())
        }
    }

    fn expect_ident(&mut self) -> PResult<Ident> {
        let lx = self.expect(Token::Ident)?;
        Ok(Ident::new(lx.literal, lx.pos))
    }

    /// Skip to the next statement boundary after an error.
    fn synchronize(&mut self) {
        loop {
            match self.cur.token {
                Token::Eof => return,
                Token::Semicolon | Token::RBrace => {
                    self.advance();
                    return;
                }
                _ => self.advance(),
            }
        }
    }

    fn parse_program(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        while !self.at(Token::Eof) {
            if self.eat(Token::Semicolon) {
                continue;
            }
            match self.parse_stmt() {
                Ok(stmt) => {
                    if self.trace {
                        tracing::trace!(pos = stmt.pos(), "parsed statement");
                    }
                    stmts.push(stmt);
                }
                Err(()) => self.synchronize(),
            }
        }
        stmts
    }

    // === statements ===

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        match self.cur.token {
            Token::LBrace => {
                let pos = self.cur.pos;
                let stmts = self.parse_block()?;
                Ok(Stmt::Block { stmts, pos })
            }
            Token::Var | Token::Const | Token::Param | Token::Global => {
                self.parse_decl_stmt().map(Stmt::Decl)
            }
            Token::If => self.parse_if_stmt(),
            Token::For => self.parse_for_stmt(),
            Token::Try => self.parse_try_stmt(),
            Token::Throw => {
                let pos = self.cur.pos;
                self.advance();
                let value = self.parse_expr()?;
                self.end_stmt();
                Ok(Stmt::Throw { value, pos })
            }
            Token::Break => {
                let pos = self.cur.pos;
                self.advance();
                self.end_stmt();
                Ok(Stmt::Break { pos })
            }
            Token::Continue => {
                let pos = self.cur.pos;
                self.advance();
                self.end_stmt();
                Ok(Stmt::Continue { pos })
            }
            Token::Return => {
                let pos = self.cur.pos;
                self.advance();
                let value = if self.at(Token::Semicolon)
                    || self.at(Token::RBrace)
                    || self.at(Token::Eof)
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.end_stmt();
                Ok(Stmt::Return { value, pos })
            }
            _ => {
                let stmt = self.parse_simple_stmt()?;
                self.end_stmt();
                Ok(stmt)
            }
        }
    }

    /// Consume an explicit or inserted statement terminator.
    fn end_stmt(&mut self) {
        if !self.eat(Token::Semicolon) && !self.at(Token::RBrace) && !self.at(Token::Eof) {
            let found = self.cur.token;
            self.error_at(self.cur.pos, format!("expected ';', found '{}'", found));
            self.synchronize();
        }
    }

    /// Expression, assignment, define, or inc/dec — the statement forms
    /// legal in `if`/`for` headers.
    fn parse_simple_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.cur.pos;
        let first = self.parse_expr()?;

        match self.cur.token {
            Token::Comma => {
                // Multi-target assignment: lhs1, lhs2, ... (=|:=) rhs...
                let mut lhs = vec![first];
                while self.eat(Token::Comma) {
                    lhs.push(self.parse_expr()?);
                }
                let op = self.cur.token;
                if op != Token::Assign && op != Token::Define {
                    self.error_at(
                        self.cur.pos,
                        format!("expected '=' or ':=', found '{}'", op),
                    );
                    return Err(());
                }
                self.advance();
                let rhs = self.parse_expr_list()?;
                self.check_assign_targets(&lhs, op);
                Ok(Stmt::Assign { op, lhs, rhs, pos })
            }
            Token::Assign | Token::Define => {
                let op = self.cur.token;
                self.advance();
                let rhs = self.parse_expr_list()?;
                let lhs = vec![first];
                self.check_assign_targets(&lhs, op);
                Ok(Stmt::Assign { op, lhs, rhs, pos })
            }
            tok if tok.compound_base().is_some() => {
                self.advance();
                let rhs = vec![self.parse_expr()?];
                let lhs = vec![first];
                self.check_assign_targets(&lhs, tok);
                Ok(Stmt::Assign {
                    op: tok,
                    lhs,
                    rhs,
                    pos,
                })
            }
            Token::Inc | Token::Dec => {
                let op = self.cur.token;
                self.advance();
                if !first.is_assignable() {
                    self.error_at(pos, "cannot increment or decrement this expression");
                    return Err(());
                }
                Ok(Stmt::IncDec {
                    op,
                    target: first,
                    pos,
                })
            }
            _ => Ok(Stmt::Expr(first)),
        }
    }

    fn check_assign_targets(&mut self, lhs: &[Expr], op: Token) {
        for target in lhs {
            if !target.is_assignable() {
                self.error_at(target.pos(), "cannot assign to this expression");
            }
            if op == Token::Define && !matches!(target, Expr::Ident(_)) {
                self.error_at(target.pos(), "':=' targets must be plain identifiers");
            }
        }
    }

    fn parse_expr_list(&mut self) -> PResult<Vec<Expr>> {
        let mut out = vec![self.parse_expr()?];
        while self.eat(Token::Comma) {
            out.push(self.parse_expr()?);
        }
        Ok(out)
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let saved = std::mem::replace(&mut self.no_map_literal, false);
        let mut stmts = Vec::new();
        while !self.at(Token::RBrace) && !self.at(Token::Eof) {
            if self.eat(Token::Semicolon) {
                continue;
            }
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(()) => self.synchronize(),
            }
        }
        self.no_map_literal = saved;
        self.expect(Token::RBrace)?;
        Ok(stmts)
    }

    fn parse_if_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.cur.pos;
        self.advance();

        let saved = std::mem::replace(&mut self.no_map_literal, true);
        let header = self.parse_simple_stmt();
        let (init, cond) = match header {
            Ok(first) => {
                if self.eat(Token::Semicolon) {
                    let cond = self.parse_expr()?;
                    (Some(Box::new(first)), cond)
                } else {
                    match first {
                        Stmt::Expr(e) => (None, e),
                        other => {
                            self.error_at(other.pos(), "missing condition in if statement");
                            self.no_map_literal = saved;
                            return Err(());
                        }
                    }
                }
            }
            Err(()) => {
                self.no_map_literal = saved;
                return Err(());
            }
        };
        self.no_map_literal = saved;

        let body = self.parse_block()?;
        let alt = if self.eat(Token::Else) {
            if self.at(Token::If) {
                Some(Box::new(self.parse_if_stmt()?))
            } else {
                let alt_pos = self.cur.pos;
                let stmts = self.parse_block()?;
                Some(Box::new(Stmt::Block {
                    stmts,
                    pos: alt_pos,
                }))
            }
        } else {
            None
        };
        Ok(Stmt::If {
            init,
            cond,
            body,
            alt,
            pos,
        })
    }

    fn parse_for_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.cur.pos;
        self.advance();

        // `for { ... }` — infinite loop.
        if self.at(Token::LBrace) {
            let body = self.parse_block()?;
            return Ok(Stmt::For {
                init: None,
                cond: None,
                post: None,
                body,
                pos,
            });
        }

        let saved = std::mem::replace(&mut self.no_map_literal, true);
        let result = self.parse_for_header();
        self.no_map_literal = saved;
        let (init, cond, post, for_in) = result?;

        if let Some((key, value, iterable)) = for_in {
            let body = self.parse_block()?;
            return Ok(Stmt::ForIn {
                key,
                value,
                iterable,
                body,
                pos,
            });
        }

        let body = self.parse_block()?;
        Ok(Stmt::For {
            init,
            cond,
            post,
            body,
            pos,
        })
    }

    #[allow(clippy::type_complexity)]
    fn parse_for_header(
        &mut self,
    ) -> PResult<(
        Option<Box<Stmt>>,
        Option<Expr>,
        Option<Box<Stmt>>,
        Option<(Ident, Option<Ident>, Expr)>,
    )> {
        // `for k in x` / `for k, v in x`
        if self.at(Token::Ident) && (self.peek.token == Token::In || self.peek.token == Token::Comma)
        {
            let key = self.expect_ident()?;
            let value = if self.eat(Token::Comma) {
                Some(self.expect_ident()?)
            } else {
                None
            };
            self.expect(Token::In)?;
            let iterable = self.parse_expr()?;
            return Ok((None, None, None, Some((key, value, iterable))));
        }

        // `for [init]; [cond]; [post] { ... }` or `for cond { ... }`
        let mut init = None;
        let mut cond = None;
        if self.at(Token::Semicolon) {
            self.advance();
        } else {
            let first = self.parse_simple_stmt()?;
            if self.eat(Token::Semicolon) {
                init = Some(Box::new(first));
            } else {
                match first {
                    Stmt::Expr(e) => return Ok((None, Some(e), None, None)),
                    other => {
                        self.error_at(other.pos(), "missing condition in for statement");
                        return Err(());
                    }
                }
            }
        }
        if !self.at(Token::Semicolon) {
            cond = Some(self.parse_expr()?);
        }
        self.expect(Token::Semicolon)?;
        let post = if self.at(Token::LBrace) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        Ok((init, cond, post, None))
    }

    fn parse_try_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.cur.pos;
        self.advance();
        let body = self.parse_block()?;

        let catch = if self.at(Token::Catch) {
            let catch_pos = self.cur.pos;
            self.advance();
            let ident = if self.at(Token::Ident) {
                Some(self.expect_ident()?)
            } else {
                None
            };
            let body = self.parse_block()?;
            Some(CatchClause {
                ident,
                body,
                pos: catch_pos,
            })
        } else {
            None
        };

        let finally = if self.eat(Token::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };

        if catch.is_none() && finally.is_none() {
            self.error_at(pos, "try statement must have a catch or finally clause");
            return Err(());
        }
        Ok(Stmt::Try {
            body,
            catch,
            finally,
            pos,
        })
    }

    // === declarations ===

    fn parse_decl_stmt(&mut self) -> PResult<Decl> {
        let pos = self.cur.pos;
        let keyword = self.cur.token;
        self.advance();

        let decl = match keyword {
            Token::Var => Decl::Var {
                specs: self.parse_var_specs(false)?,
                pos,
            },
            Token::Const => Decl::Const {
                specs: self.parse_var_specs(true)?,
                pos,
            },
            Token::Param => {
                let (names, variadic) = self.parse_name_list(true)?;
                Decl::Param {
                    names,
                    variadic,
                    pos,
                }
            }
            Token::Global => {
                let (names, _) = self.parse_name_list(false)?;
                Decl::Global { names, pos }
            }
            _ => unreachable!("caller checked the keyword"),
        };
        self.end_stmt();
        Ok(decl)
    }

    fn parse_var_specs(&mut self, require_value: bool) -> PResult<Vec<VarSpec>> {
        let mut specs = Vec::new();
        if self.eat(Token::LParen) {
            loop {
                while self.eat(Token::Semicolon) {}
                if self.eat(Token::RParen) {
                    break;
                }
                specs.push(self.parse_var_spec(require_value)?);
                if !self.eat(Token::Comma) {
                    while self.eat(Token::Semicolon) {}
                    self.expect(Token::RParen)?;
                    break;
                }
            }
        } else {
            specs.push(self.parse_var_spec(require_value)?);
            while self.eat(Token::Comma) {
                specs.push(self.parse_var_spec(require_value)?);
            }
        }
        if specs.is_empty() {
            self.error_at(self.cur.pos, "empty declaration");
            return Err(());
        }
        Ok(specs)
    }

    fn parse_var_spec(&mut self, require_value: bool) -> PResult<VarSpec> {
        let name = self.expect_ident()?;
        let value = if self.eat(Token::Assign) {
            Some(self.parse_expr()?)
        } else {
            if require_value {
                self.error_at(name.pos, "const declaration requires a value");
            }
            None
        };
        Ok(VarSpec { name, value })
    }

    fn parse_name_list(&mut self, allow_variadic: bool) -> PResult<(Vec<Ident>, bool)> {
        let parenthesized = self.eat(Token::LParen);
        let mut names = Vec::new();
        let mut variadic = false;
        loop {
            if variadic {
                self.error_at(self.cur.pos, "variadic name must be last");
                return Err(());
            }
            if self.eat(Token::Ellipsis) {
                if !allow_variadic {
                    self.error_at(self.cur.pos, "unexpected '...'");
                    return Err(());
                }
                variadic = true;
            }
            names.push(self.expect_ident()?);
            if !self.eat(Token::Comma) {
                break;
            }
        }
        if parenthesized {
            self.expect(Token::RParen)?;
        }
        Ok((names, variadic))
    }

    // === expressions ===

    fn parse_expr(&mut self) -> PResult<Expr> {
        let expr = self.parse_binary_expr(1)?;
        // The ternary conditional binds loosest and associates right.
        if self.at(Token::Question) {
            let pos = self.cur.pos;
            self.advance();
            let saved = std::mem::replace(&mut self.no_map_literal, false);
            let then = self.parse_expr()?;
            self.expect(Token::Colon)?;
            let alt = self.parse_expr();
            self.no_map_literal = saved;
            return Ok(Expr::Cond {
                cond: Box::new(expr),
                then: Box::new(then),
                alt: Box::new(alt?),
                pos,
            });
        }
        Ok(expr)
    }

    fn parse_binary_expr(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_unary_expr()?;
        loop {
            let prec = self.cur.token.precedence();
            if prec == 0 || prec < min_prec {
                return Ok(lhs);
            }
            let op = self.cur.token;
            let pos = self.cur.pos;
            self.advance();
            let rhs = self.parse_binary_expr(prec + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_unary_expr(&mut self) -> PResult<Expr> {
        match self.cur.token {
            Token::Sub | Token::Add | Token::Not | Token::Xor => {
                let op = self.cur.token;
                let pos = self.cur.pos;
                self.advance();
                let operand = self.parse_unary_expr()?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                    pos,
                })
            }
            _ => self.parse_postfix_expr(),
        }
    }

    fn parse_postfix_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.cur.token {
                Token::Period => {
                    self.advance();
                    let field = self.expect_ident()?;
                    expr = Expr::Selector {
                        target: Box::new(expr),
                        field,
                    };
                }
                Token::LBrack => {
                    expr = self.parse_index_or_slice(expr)?;
                }
                Token::LParen => {
                    expr = self.parse_call(expr)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_index_or_slice(&mut self, target: Expr) -> PResult<Expr> {
        let pos = self.cur.pos;
        self.advance();
        let saved = std::mem::replace(&mut self.no_map_literal, false);

        let low = if self.at(Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let expr = if self.eat(Token::Colon) {
            let high = if self.at(Token::RBrack) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            Expr::Slice {
                target: Box::new(target),
                low,
                high,
                pos,
            }
        } else {
            match low {
                Some(index) => Expr::Index {
                    target: Box::new(target),
                    index,
                    pos,
                },
                None => {
                    self.error_at(pos, "missing index expression");
                    self.no_map_literal = saved;
                    return Err(());
                }
            }
        };
        self.no_map_literal = saved;
        self.expect(Token::RBrack)?;
        Ok(expr)
    }

    fn parse_call(&mut self, callee: Expr) -> PResult<Expr> {
        let pos = self.cur.pos;
        self.advance();
        let saved = std::mem::replace(&mut self.no_map_literal, false);

        let mut args = Vec::new();
        let mut spread = false;
        while !self.at(Token::RParen) && !self.at(Token::Eof) {
            if spread {
                self.error_at(self.cur.pos, "spread argument must be last");
                self.no_map_literal = saved;
                return Err(());
            }
            args.push(self.parse_expr()?);
            if self.eat(Token::Ellipsis) {
                spread = true;
            }
            if !self.eat(Token::Comma) {
                break;
            }
        }
        self.no_map_literal = saved;
        self.expect(Token::RParen)?;
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            spread,
            pos,
        })
    }

    fn parse_primary_expr(&mut self) -> PResult<Expr> {
        let pos = self.cur.pos;
        match self.cur.token {
            Token::Ident => {
                let ident = self.expect_ident()?;
                Ok(Expr::Ident(ident))
            }
            Token::Int => {
                let lx = self.cur.clone();
                self.advance();
                self.parse_int_literal(&lx, pos)
            }
            Token::Uint => {
                let lx = self.cur.clone();
                self.advance();
                let text = lx.literal.strip_suffix('u').unwrap_or(&lx.literal);
                match parse_uint_text(text) {
                    Some(value) => Ok(Expr::Uint { value, pos }),
                    None => {
                        self.error_at(pos, format!("invalid uint literal '{}'", lx.literal));
                        Err(())
                    }
                }
            }
            Token::Float => {
                let lx = self.cur.clone();
                self.advance();
                match lx.literal.parse::<f64>() {
                    Ok(value) => Ok(Expr::Float { value, pos }),
                    Err(_) => {
                        self.error_at(pos, format!("invalid float literal '{}'", lx.literal));
                        Err(())
                    }
                }
            }
            Token::Char => {
                let lx = self.cur.clone();
                self.advance();
                match lx.literal.chars().next() {
                    Some(value) => Ok(Expr::Char { value, pos }),
                    None => {
                        self.error_at(pos, "invalid char literal");
                        Err(())
                    }
                }
            }
            Token::String => {
                let lx = self.cur.clone();
                self.advance();
                Ok(Expr::Str {
                    value: lx.literal,
                    pos,
                })
            }
            Token::True | Token::False => {
                let value = self.at(Token::True);
                self.advance();
                Ok(Expr::Bool { value, pos })
            }
            Token::Undefined => {
                self.advance();
                Ok(Expr::Undefined { pos })
            }
            Token::LParen => {
                self.advance();
                let saved = std::mem::replace(&mut self.no_map_literal, false);
                let expr = self.parse_expr();
                self.no_map_literal = saved;
                let expr = expr?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBrack => self.parse_array_literal(pos),
            Token::LBrace => {
                if self.no_map_literal {
                    self.error_at(pos, "unexpected '{' in this context");
                    return Err(());
                }
                self.parse_map_literal(pos)
            }
            Token::Func => self.parse_func_literal(pos),
            Token::Import => {
                self.advance();
                self.expect(Token::LParen)?;
                let name = self.expect(Token::String)?;
                self.expect(Token::RParen)?;
                Ok(Expr::Import {
                    module: name.literal,
                    pos,
                })
            }
            other => {
                self.error_at(pos, format!("unexpected '{}'", other));
                self.advance();
                Err(())
            }
        }
    }

    fn parse_int_literal(&mut self, lx: &Lexeme, pos: Pos) -> PResult<Expr> {
        match parse_uint_text(&lx.literal) {
            Some(value) if value <= i64::MAX as u64 => Ok(Expr::Int {
                value: value as i64,
                pos,
            }),
            Some(_) => {
                self.error_at(pos, format!("integer literal '{}' out of range", lx.literal));
                Err(())
            }
            None => {
                self.error_at(pos, format!("invalid integer literal '{}'", lx.literal));
                Err(())
            }
        }
    }

    fn parse_array_literal(&mut self, pos: Pos) -> PResult<Expr> {
        self.advance();
        let saved = std::mem::replace(&mut self.no_map_literal, false);
        let mut elements = Vec::new();
        while !self.at(Token::RBrack) && !self.at(Token::Eof) {
            elements.push(match self.parse_expr() {
                Ok(e) => e,
                Err(()) => {
                    self.no_map_literal = saved;
                    return Err(());
                }
            });
            if !self.eat(Token::Comma) {
                break;
            }
            self.skip_terminator_semi(Token::RBrack);
        }
        self.no_map_literal = saved;
        self.skip_terminator_semi(Token::RBrack);
        self.expect(Token::RBrack)?;
        Ok(Expr::Array { elements, pos })
    }

    fn parse_map_literal(&mut self, pos: Pos) -> PResult<Expr> {
        self.advance();
        let mut entries = Vec::new();
        while !self.at(Token::RBrace) && !self.at(Token::Eof) {
            let (key, key_pos) = match self.cur.token {
                Token::Ident | Token::String => {
                    let lx = self.cur.clone();
                    self.advance();
                    (lx.literal, lx.pos)
                }
                Token::Int => {
                    let lx = self.cur.clone();
                    self.advance();
                    match parse_uint_text(&lx.literal) {
                        Some(v) => (EcoString::from(v.to_string()), lx.pos),
                        None => {
                            self.error_at(lx.pos, "invalid map key");
                            return Err(());
                        }
                    }
                }
                other => {
                    self.error_at(self.cur.pos, format!("invalid map key '{}'", other));
                    return Err(());
                }
            };
            self.expect(Token::Colon)?;
            let value = self.parse_expr()?;
            entries.push(MapEntry {
                key,
                key_pos,
                value,
            });
            if !self.eat(Token::Comma) {
                break;
            }
            self.skip_terminator_semi(Token::RBrace);
        }
        self.skip_terminator_semi(Token::RBrace);
        self.expect(Token::RBrace)?;
        Ok(Expr::Map { entries, pos })
    }

    fn parse_func_literal(&mut self, pos: Pos) -> PResult<Expr> {
        self.advance();
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        while !self.at(Token::RParen) && !self.at(Token::Eof) {
            if variadic {
                self.error_at(self.cur.pos, "variadic parameter must be last");
                return Err(());
            }
            if self.eat(Token::Ellipsis) {
                variadic = true;
            }
            params.push(self.expect_ident()?);
            if !self.eat(Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        let body = self.parse_block()?;
        Ok(Expr::Func(Box::new(FuncLit {
            params,
            variadic,
            body,
            pos,
        })))
    }

    /// Allow an inserted newline-semicolon right before a closing
    /// delimiter in multi-line literals.
    fn skip_terminator_semi(&mut self, terminator: Token) {
        while self.at(Token::Semicolon) && self.peek.token == terminator {
            self.advance();
        }
    }
}

fn parse_uint_text(text: &str) -> Option<u64> {
    if let Some(h) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(h, 16).ok()
    } else if let Some(o) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        u64::from_str_radix(o, 8).ok()
    } else if let Some(b) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        u64::from_str_radix(b, 2).ok()
    } else {
        text.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::{Decl, Expr, Stmt};

    fn parse_ok(src: &str) -> Vec<Stmt> {
        let mut fs = FileSet::new();
        parse(&mut fs, "test.ugo", src, false).unwrap_or_else(|errs| {
            panic!("parse failed: {errs:?}");
        })
    }

    fn parse_err(src: &str) -> Vec<Diagnostic> {
        let mut fs = FileSet::new();
        parse(&mut fs, "test.ugo", src, false).expect_err("expected parse failure")
    }

    #[test]
    fn test_precedence_shape() {
        let stmts = parse_ok("x := 1 + 2 * 3");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!("expected assign");
        };
        let Expr::Binary { op, rhs: mul, .. } = &rhs[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, Token::Add);
        assert!(matches!(**mul, Expr::Binary { op: Token::Mul, .. }));
    }

    #[test]
    fn test_ternary() {
        let stmts = parse_ok("x := a ? 1 : b ? 2 : 3");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Cond { alt, .. } = &rhs[0] else {
            panic!("expected cond");
        };
        assert!(matches!(**alt, Expr::Cond { .. }));
    }

    #[test]
    fn test_destructuring_assign() {
        let stmts = parse_ok("a, b := f()");
        let Stmt::Assign { op, lhs, rhs, .. } = &stmts[0] else {
            panic!();
        };
        assert_eq!(*op, Token::Define);
        assert_eq!(lhs.len(), 2);
        assert_eq!(rhs.len(), 1);

        let stmts = parse_ok("a, b = x, y");
        let Stmt::Assign { lhs, rhs, .. } = &stmts[0] else {
            panic!();
        };
        assert_eq!(lhs.len(), 2);
        assert_eq!(rhs.len(), 2);
    }

    #[test]
    fn test_define_requires_ident_targets() {
        let errs = parse_err("a[0] := 1");
        assert!(errs.iter().any(|d| d.message.contains(":=")));
    }

    #[test]
    fn test_if_with_init() {
        let stmts = parse_ok("if x := f(); x > 0 { y = 1 } else if z { } else { }");
        let Stmt::If { init, alt, .. } = &stmts[0] else {
            panic!();
        };
        assert!(init.is_some());
        assert!(matches!(alt.as_deref(), Some(Stmt::If { .. })));
    }

    #[test]
    fn test_for_forms() {
        assert!(matches!(
            &parse_ok("for { break }")[0],
            Stmt::For { init: None, cond: None, post: None, .. }
        ));
        assert!(matches!(
            &parse_ok("for x < 10 { x++ }")[0],
            Stmt::For { init: None, cond: Some(_), post: None, .. }
        ));
        assert!(matches!(
            &parse_ok("for i := 0; i < 10; i++ { }")[0],
            Stmt::For { init: Some(_), cond: Some(_), post: Some(_), .. }
        ));
        let Stmt::ForIn { key, value, .. } = &parse_ok("for k, v in m { }")[0] else {
            panic!("expected for-in");
        };
        assert_eq!(key.name, "k");
        assert_eq!(value.as_ref().unwrap().name, "v");
    }

    #[test]
    fn test_try_catch_finally() {
        let Stmt::Try { catch, finally, .. } =
            &parse_ok("try { f() } catch e { g(e) } finally { h() }")[0]
        else {
            panic!();
        };
        assert_eq!(catch.as_ref().unwrap().ident.as_ref().unwrap().name, "e");
        assert!(finally.is_some());

        // catch without a binding, finally-only form
        parse_ok("try { } catch { }");
        parse_ok("try { } finally { }");
        let errs = parse_err("try { }");
        assert!(errs.iter().any(|d| d.message.contains("catch or finally")));
    }

    #[test]
    fn test_declarations() {
        let Stmt::Decl(Decl::Param { names, variadic, .. }) =
            &parse_ok("param (a, b, ...rest)")[0]
        else {
            panic!();
        };
        assert_eq!(names.len(), 3);
        assert!(*variadic);

        let Stmt::Decl(Decl::Var { specs, .. }) = &parse_ok("var (a = 1, b)")[0] else {
            panic!();
        };
        assert_eq!(specs.len(), 2);
        assert!(specs[0].value.is_some());
        assert!(specs[1].value.is_none());

        let errs = parse_err("const c");
        assert!(errs.iter().any(|d| d.message.contains("const")));
    }

    #[test]
    fn test_func_literal_and_calls() {
        let stmts = parse_ok("f := func(a, ...b) { return b }\nf(1, xs...)");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Func(lit) = &rhs[0] else {
            panic!("expected func literal");
        };
        assert!(lit.variadic);
        assert_eq!(lit.params.len(), 2);

        let Stmt::Expr(Expr::Call { spread, args, .. }) = &stmts[1] else {
            panic!();
        };
        assert!(*spread);
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_selector_index_slice() {
        let stmts = parse_ok("x = a.b[1][2:3]");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Slice { target, .. } = &rhs[0] else {
            panic!("expected slice");
        };
        assert!(matches!(**target, Expr::Index { .. }));
    }

    #[test]
    fn test_map_literals() {
        let stmts = parse_ok("m := {a: 1, \"b c\": 2, 3: x}");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Map { entries, .. } = &rhs[0] else {
            panic!();
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].key, "b c");
        assert_eq!(entries[2].key, "3");
    }

    #[test]
    fn test_multiline_literals() {
        parse_ok("m := {\n  a: 1,\n  b: 2,\n}");
        parse_ok("a := [\n  1,\n  2,\n]");
    }

    #[test]
    fn test_import_expr() {
        let stmts = parse_ok("m := import(\"mod\")");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        assert!(matches!(&rhs[0], Expr::Import { module, .. } if module == "mod"));
    }

    #[test]
    fn test_error_aggregation() {
        let errs = parse_err("x := ]\ny := )\n");
        assert!(errs.len() >= 2, "want multiple diagnostics, got {errs:?}");
    }

    #[test]
    fn test_map_literal_not_in_cond() {
        let errs = parse_err("if {a: 1} { }");
        assert!(!errs.is_empty());
    }
}
