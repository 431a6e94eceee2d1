//! Recursive-descent parser for pad-script.
//!
//! Syntax errors never abort the parse: each one is recorded as a
//! diagnostic and the parser resynchronizes at the next statement boundary.

use crate::result::{Diagnostic, Span};

use super::ast::{BinaryOp, Expr, ExprKind, Stmt, StmtKind, TypeName, UnaryOp, Unit};
use super::lexer::{Token, TokenKind};

/// Deepest nesting of expressions and statements accepted before the parse
/// is abandoned with `PS1007`. A chain of binary operators counts one level
/// per operator, since it builds a left-leaning tree.
pub const MAX_NESTING: usize = 200;

/// Parse a token stream (as produced by `tokenize`) into a unit.
pub fn parse(tokens: Vec<Token>) -> (Unit, Vec<Diagnostic>) {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        abandoned: false,
        diagnostics: Vec::new(),
    };
    let unit = parser.unit();
    (unit, parser.diagnostics)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    abandoned: bool,
    diagnostics: Vec<Diagnostic>,
}

/// Marker for a syntax error that has already been reported.
struct Reported;

type PResult<T> = Result<T, Reported>;

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.current().kind
    }

    fn current(&self) -> &Token {
        // `tokenize` guarantees a trailing Eof, so clamping never goes empty.
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        &self.tokens[index].kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn at_eof(&self) -> bool {
        self.at(&TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&mut self, code: &str, message: impl Into<String>) -> Reported {
        if !self.abandoned {
            let span = self.current().span;
            self.diagnostics.push(Diagnostic::error(code, message, span));
        }
        Reported
    }

    /// Enter one more level of nesting, or give up on the rest of the input.
    fn deepen(&mut self) -> PResult<()> {
        if self.depth < MAX_NESTING {
            self.depth += 1;
            return Ok(());
        }
        let reported = self.error_here(
            "PS1007",
            format!("expression nested too deeply (limit is {} levels)", MAX_NESTING),
        );
        // Jump to Eof so every enclosing rule unwinds without further reports.
        self.abandoned = true;
        self.pos = self.tokens.len().saturating_sub(1);
        Err(reported)
    }

    fn nested<T>(&mut self, rule: fn(&mut Self) -> PResult<T>) -> PResult<T> {
        let base = self.depth;
        let result = self.deepen().and_then(|()| rule(self));
        self.depth = base;
        result
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.at(&kind) {
            return Ok(self.advance());
        }
        let code = if kind == TokenKind::Semicolon {
            "PS1002"
        } else {
            "PS1005"
        };
        let found = self.peek().describe();
        Err(self.error_here(code, format!("{} expected, found {}", kind.describe(), found)))
    }

    fn ident(&mut self) -> PResult<(String, Span)> {
        if let TokenKind::Ident(name) = self.peek() {
            let name = name.clone();
            let span = self.advance().span;
            return Ok((name, span));
        }
        let found = self.peek().describe();
        Err(self.error_here("PS1004", format!("identifier expected, found {}", found)))
    }

    fn starts_statement(kind: &TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::KwInt
                | TokenKind::KwDouble
                | TokenKind::KwBool
                | TokenKind::KwString
                | TokenKind::KwVar
                | TokenKind::While
                | TokenKind::If
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Throw
                | TokenKind::LBrace
        )
    }

    /// Skip to just past the next `;`, or up to the next token that can
    /// start or close a statement.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            if self.eat(&TokenKind::Semicolon) {
                return;
            }
            if self.at(&TokenKind::RBrace) || Self::starts_statement(self.peek()) {
                return;
            }
            self.advance();
        }
    }

    fn unit(&mut self) -> Unit {
        let mut unit = Unit::default();

        while !self.at_eof() {
            let start = self.pos;

            if self.at(&TokenKind::RBrace) {
                self.error_here("PS1003", "unexpected '}'");
                self.advance();
                continue;
            }

            if !Self::starts_statement(self.peek()) && !self.at(&TokenKind::Semicolon) {
                // Expression statement, or the trailing result expression.
                match self.expression() {
                    Ok(expr) => {
                        if self.at_eof() {
                            unit.result = Some(expr);
                            break;
                        }
                        let span = expr.span;
                        match self.expect(TokenKind::Semicolon) {
                            Ok(_) => unit.statements.push(Stmt {
                                kind: StmtKind::Expr(expr),
                                span,
                            }),
                            Err(Reported) => self.synchronize(),
                        }
                    }
                    Err(Reported) => self.synchronize(),
                }
            } else {
                match self.statement() {
                    Ok(stmt) => unit.statements.push(stmt),
                    Err(Reported) => self.synchronize(),
                }
            }

            if self.pos == start && !self.at_eof() {
                self.advance();
            }
        }

        unit
    }

    fn statement(&mut self) -> PResult<Stmt> {
        self.nested(Self::bare_statement)
    }

    fn bare_statement(&mut self) -> PResult<Stmt> {
        let span = self.current().span;
        let ty = match self.peek() {
            TokenKind::KwInt => Some(TypeName::Int),
            TokenKind::KwDouble => Some(TypeName::Double),
            TokenKind::KwBool => Some(TypeName::Bool),
            TokenKind::KwString => Some(TypeName::String),
            TokenKind::KwVar => Some(TypeName::Inferred),
            _ => None,
        };
        if let Some(ty) = ty {
            self.advance();
            return self.declaration(ty, span);
        }

        match self.peek() {
            TokenKind::LBrace => {
                self.advance();
                let body = self.block_body()?;
                Ok(Stmt {
                    kind: StmtKind::Block(body),
                    span,
                })
            }
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt {
                    kind: StmtKind::Block(Vec::new()),
                    span,
                })
            }
            TokenKind::If => {
                self.advance();
                let cond = self.condition()?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.eat(&TokenKind::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt {
                    kind: StmtKind::If {
                        cond,
                        then_branch,
                        else_branch,
                    },
                    span,
                })
            }
            TokenKind::While => {
                self.advance();
                let cond = self.condition()?;
                let body = Box::new(self.statement()?);
                Ok(Stmt {
                    kind: StmtKind::While { cond, body },
                    span,
                })
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span,
                })
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span,
                })
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.expression()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Throw(value),
                    span,
                })
            }
            _ => {
                let expr = self.expression()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                })
            }
        }
    }

    fn declaration(&mut self, ty: TypeName, span: Span) -> PResult<Stmt> {
        let (name, _) = self.ident()?;
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon)?;
        Ok(Stmt {
            kind: StmtKind::Let { ty, name, init },
            span,
        })
    }

    fn condition(&mut self) -> PResult<Expr> {
        self.expect(TokenKind::LParen)?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen)?;
        Ok(cond)
    }

    /// Statements up to the closing `}` (the `{` is already consumed).
    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace) {
                return Ok(body);
            }
            if self.at_eof() {
                return Err(self.error_here("PS1005", "'}' expected, found end of input"));
            }
            let start = self.pos;
            match self.statement() {
                Ok(stmt) => body.push(stmt),
                Err(Reported) => self.synchronize(),
            }
            if self.pos == start && !self.at(&TokenKind::RBrace) {
                self.advance();
            }
        }
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let target = self.or()?;
        if !self.at(&TokenKind::Assign) {
            return Ok(target);
        }

        let assign_span = self.advance().span;
        let value = self.nested(Self::assignment)?;
        match target.kind {
            ExprKind::Name(name) => Ok(Expr {
                kind: ExprKind::Assign {
                    name,
                    value: Box::new(value),
                },
                span: target.span,
            }),
            _ => {
                self.diagnostics.push(Diagnostic::error(
                    "PS1006",
                    "the left-hand side of an assignment must be a variable",
                    assign_span,
                ));
                Err(Reported)
            }
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let base = self.depth;
        let result = self.binary_chain(ops, next);
        self.depth = base;
        result
    }

    fn binary_chain(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        loop {
            let op = ops
                .iter()
                .find(|(kind, _)| self.at(kind))
                .map(|(_, op)| *op);
            let Some(op) = op else {
                return Ok(left);
            };
            self.deepen()?;
            self.advance();
            let right = next(self)?;
            let span = left.span;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
    }

    fn or(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::OrOr, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::AndAnd, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::EqEq, BinaryOp::Eq),
                (TokenKind::NotEq, BinaryOp::Ne),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Ge, BinaryOp::Ge),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.primary(),
        };
        let span = self.advance().span;
        let operand = self.nested(Self::unary)?;
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.current().span;
        let kind = match self.peek().clone() {
            TokenKind::Int(v) => ExprKind::Int(v),
            TokenKind::Double(v) => ExprKind::Double(v),
            TokenKind::Str(s) => ExprKind::Str(s),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Null => ExprKind::Null,
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                return Ok(Expr { span, ..inner });
            }
            TokenKind::Ident(name) => {
                self.advance();
                return self.name_or_call(name, span);
            }
            other => {
                return Err(self.error_here(
                    "PS1001",
                    format!("expected expression, found {}", other.describe()),
                ));
            }
        };
        self.advance();
        Ok(Expr { kind, span })
    }

    fn name_or_call(&mut self, first: String, span: Span) -> PResult<Expr> {
        let qualified = self.at(&TokenKind::Dot)
            && matches!(self.peek_at(1), TokenKind::Ident(_));
        let (namespace, name) = if qualified {
            self.advance();
            let (name, _) = self.ident()?;
            self.expect(TokenKind::LParen)?;
            (Some(first), name)
        } else if self.eat(&TokenKind::LParen) {
            (None, first)
        } else if self.at(&TokenKind::Dot) {
            self.advance();
            let found = self.peek().describe();
            return Err(self.error_here("PS1004", format!("identifier expected, found {}", found)));
        } else {
            return Ok(Expr {
                kind: ExprKind::Name(first),
                span,
            });
        };

        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen)?;
                break;
            }
        }

        Ok(Expr {
            kind: ExprKind::Call {
                namespace,
                name,
                args,
            },
            span,
        })
    }
}
