//! The hand-written lexer.
//!
//! Byte-oriented scanning with Go-style automatic semicolon insertion: a
//! newline terminates the statement when the previous token could end one
//! (see [`Token::inserts_semicolon`]). Numeric literals support decimal,
//! hex, octal and binary bases, floats with exponents, and a `u` suffix
//! for unsigned literals. String, raw-string and char literals support the
//! usual escape set.

use ecow::EcoString;

use crate::errors::Diagnostic;
use crate::source::Pos;
use crate::token::Token;

/// One scanned token with its literal text and position.
#[derive(Debug, Clone)]
pub struct Lexeme {
    pub token: Token,
    pub literal: EcoString,
    pub pos: Pos,
}

pub struct Lexer<'a> {
    src: &'a str,
    /// Byte offset of the next unread character.
    offset: usize,
    /// File base; `pos = base + offset`.
    base: Pos,
    /// Whether a newline at this point becomes a semicolon.
    insert_semi: bool,
    pub errors: Vec<Diagnostic>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, base: Pos) -> Self {
        Lexer {
            src,
            offset: 0,
            base,
            insert_semi: false,
            errors: Vec::new(),
        }
    }

    fn pos_at(&self, offset: usize) -> Pos {
        self.base + offset as u32
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.offset..].chars().next()
    }

    fn peek_char2(&self) -> Option<char> {
        let mut it = self.src[self.offset..].chars();
        it.next();
        it.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.offset += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&mut self, offset: usize, message: impl Into<String>) {
        self.errors
            .push(Diagnostic::new(message, self.pos_at(offset)));
    }

    /// Scan the next token. Comments are skipped, not returned.
    pub fn next_token(&mut self) -> Lexeme {
        loop {
            // Skip horizontal whitespace; handle newlines for semicolon
            // insertion.
            while let Some(c) = self.peek_char() {
                match c {
                    ' ' | '\t' | '\r' => {
                        self.bump();
                    }
                    '\n' => {
                        if self.insert_semi {
                            let at = self.offset;
                            self.bump();
                            self.insert_semi = false;
                            return self.lexeme(Token::Semicolon, "\n", at);
                        }
                        self.bump();
                    }
                    _ => break,
                }
            }

            let start = self.offset;
            let Some(c) = self.peek_char() else {
                if self.insert_semi {
                    self.insert_semi = false;
                    return self.lexeme(Token::Semicolon, "\n", start);
                }
                return self.lexeme(Token::Eof, "", start);
            };

            // Comments: line and block.
            if c == '/' {
                if self.peek_char2() == Some('/') {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                if self.peek_char2() == Some('*') {
                    self.bump();
                    self.bump();
                    let mut crossed_newline = false;
                    loop {
                        match self.bump() {
                            Some('*') if self.peek_char() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some('\n') => crossed_newline = true,
                            Some(_) => {}
                            None => {
                                self.error(start, "unterminated block comment");
                                break;
                            }
                        }
                    }
                    // A block comment spanning lines acts like a newline.
                    if crossed_newline && self.insert_semi {
                        self.insert_semi = false;
                        return self.lexeme(Token::Semicolon, "\n", start);
                    }
                    continue;
                }
            }

            return self.scan_token(start, c);
        }
    }

    fn scan_token(&mut self, start: usize, c: char) -> Lexeme {
        if c.is_ascii_alphabetic() || c == '_' {
            return self.scan_ident(start);
        }
        if c.is_ascii_digit() {
            return self.scan_number(start);
        }
        match c {
            '"' => return self.scan_string(start),
            '`' => return self.scan_raw_string(start),
            '\'' => return self.scan_char(start),
            _ => {}
        }

        self.bump();
        let token = match c {
            '+' => {
                if self.eat('+') {
                    Token::Inc
                } else if self.eat('=') {
                    Token::AddAssign
                } else {
                    Token::Add
                }
            }
            '-' => {
                if self.eat('-') {
                    Token::Dec
                } else if self.eat('=') {
                    Token::SubAssign
                } else {
                    Token::Sub
                }
            }
            '*' => {
                if self.eat('=') {
                    Token::MulAssign
                } else {
                    Token::Mul
                }
            }
            '/' => {
                if self.eat('=') {
                    Token::QuoAssign
                } else {
                    Token::Quo
                }
            }
            '%' => {
                if self.eat('=') {
                    Token::RemAssign
                } else {
                    Token::Rem
                }
            }
            '&' => {
                if self.eat('&') {
                    Token::LAnd
                } else if self.eat('^') {
                    if self.eat('=') {
                        Token::AndNotAssign
                    } else {
                        Token::AndNot
                    }
                } else if self.eat('=') {
                    Token::AndAssign
                } else {
                    Token::And
                }
            }
            '|' => {
                if self.eat('|') {
                    Token::LOr
                } else if self.eat('=') {
                    Token::OrAssign
                } else {
                    Token::Or
                }
            }
            '^' => {
                if self.eat('=') {
                    Token::XorAssign
                } else {
                    Token::Xor
                }
            }
            '<' => {
                if self.eat('<') {
                    if self.eat('=') {
                        Token::ShlAssign
                    } else {
                        Token::Shl
                    }
                } else if self.eat('=') {
                    Token::Leq
                } else {
                    Token::Lss
                }
            }
            '>' => {
                if self.eat('>') {
                    if self.eat('=') {
                        Token::ShrAssign
                    } else {
                        Token::Shr
                    }
                } else if self.eat('=') {
                    Token::Geq
                } else {
                    Token::Gtr
                }
            }
            '=' => {
                if self.eat('=') {
                    Token::Eql
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    Token::Neq
                } else {
                    Token::Not
                }
            }
            ':' => {
                if self.eat('=') {
                    Token::Define
                } else {
                    Token::Colon
                }
            }
            '.' => {
                if self.peek_char() == Some('.') && self.peek_char2() == Some('.') {
                    self.bump();
                    self.bump();
                    Token::Ellipsis
                } else {
                    Token::Period
                }
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBrack,
            ']' => Token::RBrack,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            other => {
                self.error(start, format!("illegal character {:?}", other));
                Token::Illegal
            }
        };
        self.finish(token, start)
    }

    fn scan_ident(&mut self, start: usize) -> Lexeme {
        while self
            .peek_char()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        let text = &self.src[start..self.offset];
        self.finish(Token::lookup_ident(text), start)
    }

    fn scan_number(&mut self, start: usize) -> Lexeme {
        let mut is_float = false;

        if self.peek_char() == Some('0')
            && matches!(
                self.peek_char2(),
                Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')
            )
        {
            self.bump();
            let marker = self.bump().unwrap();
            let digits = |c: char| match marker {
                'x' | 'X' => c.is_ascii_hexdigit(),
                'o' | 'O' => ('0'..='7').contains(&c),
                _ => c == '0' || c == '1',
            };
            let mut any = false;
            while self.peek_char().is_some_and(digits) {
                self.bump();
                any = true;
            }
            if !any {
                self.error(start, "malformed number literal");
            }
        } else {
            while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
            // Fraction: a '.' followed by a digit, so `a[1].b` still works
            // (digit followed by period-selector cannot occur, but slices
            // like `x[1:2]` can).
            if self.peek_char() == Some('.')
                && self.peek_char2().is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                self.bump();
                while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
            }
            if matches!(self.peek_char(), Some('e' | 'E')) {
                let mark = self.offset;
                self.bump();
                if matches!(self.peek_char(), Some('+' | '-')) {
                    self.bump();
                }
                if self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                    is_float = true;
                    while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                        self.bump();
                    }
                } else {
                    // Not an exponent after all (e.g. `1e` then ident).
                    self.offset = mark;
                }
            }
        }

        let token = if is_float {
            Token::Float
        } else if self.eat('u') {
            Token::Uint
        } else {
            Token::Int
        };
        self.finish(token, start)
    }

    fn scan_string(&mut self, start: usize) -> Lexeme {
        self.bump(); // opening quote
        let mut value = EcoString::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => match self.scan_escape(start) {
                    Some(c) => value.push(c),
                    None => {}
                },
                Some('\n') | None => {
                    self.error(start, "unterminated string literal");
                    break;
                }
                Some(c) => value.push(c),
            }
        }
        self.insert_semi = true;
        Lexeme {
            token: Token::String,
            literal: value,
            pos: self.pos_at(start),
        }
    }

    fn scan_raw_string(&mut self, start: usize) -> Lexeme {
        self.bump(); // opening backquote
        let mut value = EcoString::new();
        loop {
            match self.bump() {
                Some('`') => break,
                Some(c) => value.push(c),
                None => {
                    self.error(start, "unterminated raw string literal");
                    break;
                }
            }
        }
        self.insert_semi = true;
        Lexeme {
            token: Token::String,
            literal: value,
            pos: self.pos_at(start),
        }
    }

    fn scan_char(&mut self, start: usize) -> Lexeme {
        self.bump(); // opening quote
        let value = match self.bump() {
            Some('\\') => self.scan_escape(start),
            Some('\'') => {
                self.error(start, "empty char literal");
                None
            }
            Some(c) => Some(c),
            None => {
                self.error(start, "unterminated char literal");
                None
            }
        };
        if value.is_some() && !self.eat('\'') {
            self.error(start, "unterminated char literal");
        }
        self.insert_semi = true;
        let mut literal = EcoString::new();
        if let Some(c) = value {
            literal.push(c);
        }
        Lexeme {
            token: Token::Char,
            literal,
            pos: self.pos_at(start),
        }
    }

    fn scan_escape(&mut self, start: usize) -> Option<char> {
        match self.bump() {
            Some('n') => Some('\n'),
            Some('r') => Some('\r'),
            Some('t') => Some('\t'),
            Some('a') => Some('\x07'),
            Some('b') => Some('\x08'),
            Some('f') => Some('\x0C'),
            Some('v') => Some('\x0B'),
            Some('0') => Some('\0'),
            Some('\\') => Some('\\'),
            Some('\'') => Some('\''),
            Some('"') => Some('"'),
            Some('x') => self.scan_hex_escape(start, 2),
            Some('u') => self.scan_hex_escape(start, 4),
            Some('U') => self.scan_hex_escape(start, 8),
            _ => {
                self.error(start, "unknown escape sequence");
                None
            }
        }
    }

    fn scan_hex_escape(&mut self, start: usize, digits: usize) -> Option<char> {
        let mut scalar: u32 = 0;
        for _ in 0..digits {
            let d = self.peek_char().and_then(|c| c.to_digit(16));
            match d {
                Some(d) => {
                    self.bump();
                    scalar = scalar * 16 + d;
                }
                None => {
                    self.error(start, "malformed hex escape");
                    return None;
                }
            }
        }
        match char::from_u32(scalar) {
            Some(c) => Some(c),
            None => {
                self.error(start, "escape is not a valid char");
                None
            }
        }
    }

    fn finish(&mut self, token: Token, start: usize) -> Lexeme {
        self.insert_semi = token.inserts_semicolon();
        self.lexeme(token, &self.src[start..self.offset], start)
    }

    fn lexeme(&self, token: Token, literal: &str, start: usize) -> Lexeme {
        Lexeme {
            token,
            literal: literal.into(),
            pos: self.pos_at(start),
        }
    }
}
