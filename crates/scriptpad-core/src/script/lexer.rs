//! Tokenizer for pad-script.

use crate::result::{Diagnostic, Span};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Double(f64),
    Str(String),
    Ident(String),

    // Type keywords
    KwInt,
    KwDouble,
    KwBool,
    KwString,
    KwVar,

    // Keywords
    True,
    False,
    Null,
    While,
    If,
    Else,
    Break,
    Continue,
    Throw,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Semicolon,
    Comma,
    Dot,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    Eof,
}

impl TokenKind {
    /// Human-readable form used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Str(_) => "string literal".to_string(),
            Self::Ident(name) => format!("'{}'", name),
            Self::Eof => "end of input".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::KwInt => "int",
            Self::KwDouble => "double",
            Self::KwBool => "bool",
            Self::KwString => "string",
            Self::KwVar => "var",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::While => "while",
            Self::If => "if",
            Self::Else => "else",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Throw => "throw",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Semicolon => ";",
            Self::Comma => ",",
            Self::Dot => ".",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Bang => "!",
            Self::Assign => "=",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::AndAnd => "&&",
            Self::OrOr => "||",
            Self::Int(_) | Self::Double(_) | Self::Str(_) | Self::Ident(_) | Self::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    let kind = match ident {
        "int" => TokenKind::KwInt,
        "double" => TokenKind::KwDouble,
        "bool" => TokenKind::KwBool,
        "string" => TokenKind::KwString,
        "var" => TokenKind::KwVar,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        "while" => TokenKind::While,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "throw" => TokenKind::Throw,
        _ => return None,
    };
    Some(kind)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
}

/// Split `source` into tokens. Lexical errors are reported as diagnostics
/// and the offending characters skipped; the token list always ends in `Eof`.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
        tokens: Vec::new(),
        diagnostics: Vec::new(),
    };
    lexer.run();
    (lexer.tokens, lexer.diagnostics)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, line: u32, column: u32, length: u32) {
        self.tokens.push(Token {
            kind,
            span: Span::new(line, column, length),
        });
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            let (line, column, start) = (self.line, self.column, self.pos);

            if c.is_whitespace() {
                self.bump();
                continue;
            }

            if c == '/' && self.peek_next() == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }

            if c == '/' && self.peek_next() == Some('*') {
                self.block_comment(line, column);
                continue;
            }

            if c.is_ascii_digit() {
                self.number(line, column, start);
                continue;
            }

            if c == '"' {
                self.string(line, column, start);
                continue;
            }

            if c.is_alphabetic() || c == '_' {
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                let length = (self.pos - start) as u32;
                let kind = keyword(&text).unwrap_or(TokenKind::Ident(text));
                self.push(kind, line, column, length);
                continue;
            }

            self.bump();
            let next = self.peek();
            let (kind, length) = match (c, next) {
                ('=', Some('=')) => (TokenKind::EqEq, 2),
                ('!', Some('=')) => (TokenKind::NotEq, 2),
                ('<', Some('=')) => (TokenKind::Le, 2),
                ('>', Some('=')) => (TokenKind::Ge, 2),
                ('&', Some('&')) => (TokenKind::AndAnd, 2),
                ('|', Some('|')) => (TokenKind::OrOr, 2),
                ('(', _) => (TokenKind::LParen, 1),
                (')', _) => (TokenKind::RParen, 1),
                ('{', _) => (TokenKind::LBrace, 1),
                ('}', _) => (TokenKind::RBrace, 1),
                (';', _) => (TokenKind::Semicolon, 1),
                (',', _) => (TokenKind::Comma, 1),
                ('.', _) => (TokenKind::Dot, 1),
                ('+', _) => (TokenKind::Plus, 1),
                ('-', _) => (TokenKind::Minus, 1),
                ('*', _) => (TokenKind::Star, 1),
                ('/', _) => (TokenKind::Slash, 1),
                ('%', _) => (TokenKind::Percent, 1),
                ('!', _) => (TokenKind::Bang, 1),
                ('=', _) => (TokenKind::Assign, 1),
                ('<', _) => (TokenKind::Lt, 1),
                ('>', _) => (TokenKind::Gt, 1),
                _ => {
                    self.diagnostics.push(Diagnostic::error(
                        "PS0001",
                        format!("unexpected character '{}'", c),
                        Span::new(line, column, 1),
                    ));
                    continue;
                }
            };
            if length == 2 {
                self.bump();
            }
            self.push(kind, line, column, length);
        }

        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, line, column, 0);
    }

    fn block_comment(&mut self, line: u32, column: u32) {
        self.bump();
        self.bump();
        loop {
            match self.peek() {
                Some('*') if self.peek_next() == Some('/') => {
                    self.bump();
                    self.bump();
                    return;
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        "PS0004",
                        "unterminated block comment",
                        Span::new(line, column, 2),
                    ));
                    return;
                }
            }
        }
    }

    fn number(&mut self, line: u32, column: u32, start: usize) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }

        let is_double = self.peek() == Some('.')
            && matches!(self.peek_next(), Some(c) if c.is_ascii_digit());
        if is_double {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        let length = (self.pos - start) as u32;
        let span = Span::new(line, column, length);

        let kind = if is_double {
            // Digits with one interior dot always parse as f64.
            TokenKind::Double(text.parse().unwrap_or(0.0))
        } else {
            match text.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => {
                    self.diagnostics.push(Diagnostic::error(
                        "PS0003",
                        format!("integral constant '{}' is too large", text),
                        span,
                    ));
                    TokenKind::Int(0)
                }
            }
        };
        self.tokens.push(Token { kind, span });
    }

    fn string(&mut self, line: u32, column: u32, start: usize) {
        self.bump();
        let mut value = String::new();
        loop {
            match self.peek() {
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some(other) => {
                            self.diagnostics.push(Diagnostic::error(
                                "PS0005",
                                format!("unrecognized escape sequence '\\{}'", other),
                                Span::new(self.line, self.column.saturating_sub(2), 2),
                            ));
                            other
                        }
                        None => continue,
                    };
                    value.push(escaped);
                }
                Some('\n') | None => {
                    self.diagnostics.push(Diagnostic::error(
                        "PS0002",
                        "newline in constant",
                        Span::new(line, column, (self.pos - start) as u32),
                    ));
                    break;
                }
                Some(c) => {
                    self.bump();
                    value.push(c);
                }
            }
        }
        let length = (self.pos - start) as u32;
        self.push(TokenKind::Str(value), line, column, length);
    }
}
