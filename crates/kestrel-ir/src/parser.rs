// Parser: recursive descent parser for the script language
//
// Consumes the token stream and produces a `SourceFile`. One method per
// grammar production; on error we return immediately.
//
// OPERATOR PRECEDENCE (lowest to highest):
//   1. a if c else b   (conditional expression)
//   2. or
//   3. and
//   4. not             (prefix)
//   5. == != < > <= >= is, is not
//   6. + -
//   7. * / // %
//   8. -               (unary prefix)
//   9. **              (right-associative)
//  10. . [] ()         (postfix: attribute, subscript, call)

use crate::ast::*;
use crate::error::{Error, ErrorKind, Result};
use crate::token::{Span, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse a whole source text.
    pub fn parse_file(&mut self) -> Result<SourceFile> {
        let mut items = Vec::new();
        while !self.at_eof() {
            items.push(self.parse_item()?);
        }
        Ok(SourceFile { items })
    }

    fn parse_item(&mut self) -> Result<Item> {
        match self.peek_kind() {
            TokenKind::Def => Ok(Item::Def(self.parse_def()?)),
            TokenKind::Class => Ok(Item::Class(self.parse_class()?)),
            TokenKind::NamedTuple => Ok(Item::NamedTuple(self.parse_namedtuple()?)),
            _ => Err(self.error_unexpected("'def', 'class' or 'namedtuple'")),
        }
    }

    // Definitions

    fn parse_def(&mut self) -> Result<FunctionDef> {
        let span = self.expect(TokenKind::Def)?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            params.push(self.parse_param()?);
            if !self.check(&TokenKind::RParen) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RParen)?;
        let ret = if self.check(&TokenKind::Arrow) {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            params,
            ret,
            body,
            span,
        })
    }

    fn parse_param(&mut self) -> Result<Param> {
        let span = self.current_span();
        let name = self.expect_ident()?;
        let ty = if self.check(&TokenKind::Colon) {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };
        let default = if self.check(&TokenKind::Eq) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Param {
            name,
            ty,
            default,
            span,
        })
    }

    fn parse_class(&mut self) -> Result<ClassDef> {
        let span = self.expect(TokenKind::Class)?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut attrs = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Def) {
                methods.push(self.parse_def()?);
            } else {
                attrs.push(self.parse_attr_decl()?);
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(ClassDef {
            name,
            attrs,
            methods,
            span,
        })
    }

    /// `param w: Tensor;`, `buffer b: Tensor;` or `name: Type;`. The storage
    /// class words are contextual: they only count when another name follows.
    fn parse_attr_decl(&mut self) -> Result<AttrDecl> {
        let span = self.current_span();
        let mut kind = AttrDeclKind::Attribute;
        if let (TokenKind::Ident(word), TokenKind::Ident(_)) =
            (self.peek_kind(), self.peek_ahead_kind(1))
        {
            kind = match word.as_str() {
                "param" => AttrDeclKind::Parameter,
                "buffer" => AttrDeclKind::Buffer,
                _ => return Err(self.error_unexpected("'param', 'buffer' or an attribute name")),
            };
            self.advance();
        }
        let name = self.expect_ident()?;
        self.expect(TokenKind::Colon)?;
        let ty = self.parse_type()?;
        self.expect(TokenKind::Semi)?;
        Ok(AttrDecl {
            name,
            ty,
            kind,
            span,
        })
    }

    fn parse_namedtuple(&mut self) -> Result<NamedTupleDef> {
        let span = self.expect(TokenKind::NamedTuple)?.span;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let field = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            fields.push((field, self.parse_type()?));
            if !self.check(&TokenKind::RBrace) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(NamedTupleDef { name, fields, span })
    }

    /// `Name` or `Name[T, ...]`; `None` is accepted as a type name.
    pub fn parse_type(&mut self) -> Result<TypeExpr> {
        let span = self.current_span();
        let name = match self.peek_kind() {
            TokenKind::None => {
                self.advance();
                "None".to_string()
            }
            _ => self.expect_ident()?,
        };
        let mut args = Vec::new();
        if self.check(&TokenKind::LBracket) {
            self.advance();
            while !self.check(&TokenKind::RBracket) {
                args.push(self.parse_type()?);
                if !self.check(&TokenKind::RBracket) {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RBracket)?;
        }
        Ok(TypeExpr { name, args, span })
    }

    // Statements

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.at_eof() {
                return Err(Error::new(ErrorKind::UnexpectedEof, self.current_span()));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While { cond, body, span })
            }
            TokenKind::For => {
                self.advance();
                let target = self.parse_for_target()?;
                self.expect(TokenKind::In)?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For {
                    target,
                    iter,
                    body,
                    span,
                })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr_list()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return(value, span))
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Break(span))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Continue(span))
            }
            TokenKind::Pass => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Pass(span))
            }
            TokenKind::Raise => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Raise(value, span))
            }
            TokenKind::Assert => {
                self.advance();
                let cond = self.parse_expr()?;
                let msg = if self.check(&TokenKind::Comma) {
                    self.advance();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Assert { cond, msg, span })
            }
            _ => self.parse_simple_stmt(),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let span = self.current_span();
        self.advance(); // `if` or `elif`
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = match self.peek_kind() {
            TokenKind::Elif => vec![self.parse_if()?],
            TokenKind::Else => {
                self.advance();
                self.parse_block()?
            }
            _ => Vec::new(),
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
            span,
        })
    }

    fn parse_for_target(&mut self) -> Result<AssignTarget> {
        let span = self.current_span();
        let mut names = Vec::new();
        loop {
            let name_span = self.current_span();
            names.push(AssignTarget::Name(self.expect_ident()?, name_span));
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        if names.len() == 1 {
            Ok(names.remove(0))
        } else {
            Ok(AssignTarget::Tuple(names, span))
        }
    }

    /// Assignment, annotated assignment, augmented assignment or a bare
    /// expression statement.
    fn parse_simple_stmt(&mut self) -> Result<Stmt> {
        let span = self.current_span();
        let lhs = self.parse_expr_list()?;
        let stmt = match self.peek_kind() {
            TokenKind::Colon => {
                self.advance();
                let ann = self.parse_type()?;
                self.expect(TokenKind::Eq)?;
                let value = self.parse_expr_list()?;
                Stmt::Assign {
                    target: self.to_target(lhs)?,
                    ann: Some(ann),
                    value,
                    span,
                }
            }
            TokenKind::Eq => {
                self.advance();
                let value = self.parse_expr_list()?;
                Stmt::Assign {
                    target: self.to_target(lhs)?,
                    ann: None,
                    value,
                    span,
                }
            }
            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::SlashEq => {
                let op = match self.advance().kind {
                    TokenKind::PlusEq => BinOp::Add,
                    TokenKind::MinusEq => BinOp::Sub,
                    TokenKind::StarEq => BinOp::Mul,
                    _ => BinOp::Div,
                };
                let value = self.parse_expr()?;
                Stmt::AugAssign {
                    target: self.to_target(lhs)?,
                    op,
                    value,
                    span,
                }
            }
            _ => Stmt::Expr(lhs),
        };
        self.expect(TokenKind::Semi)?;
        Ok(stmt)
    }

    fn to_target(&self, expr: Expr) -> Result<AssignTarget> {
        match expr {
            Expr::Name(name, span) => Ok(AssignTarget::Name(name, span)),
            Expr::Attribute { object, name, span } => Ok(AssignTarget::Attr { object, name, span }),
            Expr::Tuple(items, span) => Ok(AssignTarget::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<Result<_>>()?,
                span,
            )),
            other => Err(Error::new(
                ErrorKind::UnexpectedToken {
                    expected: "an assignable target".into(),
                    got: "expression".into(),
                },
                other.span(),
            )),
        }
    }

    // Expressions (Pratt parser with precedence climbing)

    /// `a, b, c` becomes a tuple expression; a single item stays as is.
    fn parse_expr_list(&mut self) -> Result<Expr> {
        let span = self.current_span();
        let first = self.parse_expr()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.check(&TokenKind::Comma) {
            self.advance();
            if self.starts_expr() {
                items.push(self.parse_expr()?);
            } else {
                break;
            }
        }
        Ok(Expr::Tuple(items, span))
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        let span = self.current_span();
        let then = self.parse_expr_bp(0)?;
        if !self.check(&TokenKind::If) {
            return Ok(then);
        }
        self.advance();
        let cond = self.parse_expr_bp(0)?;
        self.expect(TokenKind::Else)?;
        let orelse = self.parse_expr()?;
        Ok(Expr::IfExp {
            cond: Box::new(cond),
            then: Box::new(then),
            orelse: Box::new(orelse),
            span,
        })
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;

        loop {
            if self.check(&TokenKind::Is) {
                if 7 < min_bp {
                    break;
                }
                let span = lhs.span();
                self.advance();
                let negated = if self.check(&TokenKind::Not) {
                    self.advance();
                    true
                } else {
                    false
                };
                self.expect(TokenKind::None)?;
                lhs = Expr::IsNone {
                    operand: Box::new(lhs),
                    negated,
                    span,
                };
                continue;
            }

            let (op, (l_bp, r_bp)) = match self.peek_kind() {
                TokenKind::Or => (BinOp::Or, (1, 2)),
                TokenKind::And => (BinOp::And, (3, 4)),
                TokenKind::EqEq => (BinOp::Eq, (7, 8)),
                TokenKind::BangEq => (BinOp::Ne, (7, 8)),
                TokenKind::Lt => (BinOp::Lt, (7, 8)),
                TokenKind::Gt => (BinOp::Gt, (7, 8)),
                TokenKind::LtEq => (BinOp::Le, (7, 8)),
                TokenKind::GtEq => (BinOp::Ge, (7, 8)),
                TokenKind::Plus => (BinOp::Add, (9, 10)),
                TokenKind::Minus => (BinOp::Sub, (9, 10)),
                TokenKind::Star => (BinOp::Mul, (11, 12)),
                TokenKind::Slash => (BinOp::Div, (11, 12)),
                TokenKind::SlashSlash => (BinOp::FloorDiv, (11, 12)),
                TokenKind::Percent => (BinOp::Mod, (11, 12)),
                TokenKind::StarStar => (BinOp::Pow, (16, 15)),
                _ => break,
            };
            if l_bp < min_bp {
                break;
            }

            self.advance();
            let span = lhs.span();
            let rhs = self.parse_expr_bp(r_bp)?;
            lhs = Expr::Binary {
                left: Box::new(lhs),
                op,
                right: Box::new(rhs),
                span,
            };
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expr_bp(13)?;
                Ok(match operand {
                    Expr::Int(n, _) => Expr::Int(-n, span),
                    Expr::Float(v, _) => Expr::Float(-v, span),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(other),
                        span,
                    },
                })
            }
            TokenKind::Not => {
                self.advance();
                let operand = self.parse_expr_bp(5)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                    span,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            expr = match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let span = self.current_span();
                    let name = self.expect_ident()?;
                    Expr::Attribute {
                        object: Box::new(expr),
                        name,
                        span,
                    }
                }
                TokenKind::LParen => {
                    let span = expr.span();
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    self.expect(TokenKind::RParen)?;
                    Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                        span,
                    }
                }
                TokenKind::LBracket => {
                    let span = expr.span();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    Expr::Subscript {
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    }
                }
                _ => break,
            };
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let span = self.current_span();
            if let (TokenKind::Ident(name), TokenKind::Eq) =
                (self.peek_kind(), self.peek_ahead_kind(1))
            {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                kwargs.push(Keyword { name, value, span });
            } else if !kwargs.is_empty() {
                return Err(self.error_unexpected("a keyword argument"));
            } else {
                args.push(self.parse_expr()?);
            }
            if !self.check(&TokenKind::RParen) {
                self.expect(TokenKind::Comma)?;
            }
        }
        Ok((args, kwargs))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::IntLit(n) => {
                self.advance();
                Ok(Expr::Int(n, span))
            }
            TokenKind::FloatLit(v) => {
                self.advance();
                Ok(Expr::Float(v, span))
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Expr::Str(s, span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true, span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false, span))
            }
            TokenKind::None => {
                self.advance();
                Ok(Expr::None(span))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Name(name, span))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.check(&TokenKind::RBracket) {
                        self.expect(TokenKind::Comma)?;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List(items, span))
            }
            TokenKind::LParen => {
                self.advance();
                if self.check(&TokenKind::RParen) {
                    self.advance();
                    return Ok(Expr::Tuple(Vec::new(), span));
                }
                let first = self.parse_expr()?;
                if self.check(&TokenKind::RParen) {
                    self.advance();
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.check(&TokenKind::Comma) {
                    self.advance();
                    if self.check(&TokenKind::RParen) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Tuple(items, span))
            }
            TokenKind::Eof => Err(Error::new(ErrorKind::UnexpectedEof, span)),
            _ => Err(self.error_unexpected("an expression")),
        }
    }

    // Token helpers

    fn starts_expr(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::IntLit(_)
                | TokenKind::FloatLit(_)
                | TokenKind::StringLit(_)
                | TokenKind::Ident(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::None
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::Minus
                | TokenKind::Not
        )
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind.clone()
    }

    fn peek_ahead_kind(&self, offset: usize) -> TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        self.tokens[idx].kind.clone()
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else if self.at_eof() {
            Err(Error::new(ErrorKind::UnexpectedEof, self.current_span()))
        } else {
            Err(Error::new(
                ErrorKind::UnexpectedToken {
                    expected: format!("{}", kind),
                    got: format!("{}", self.peek_kind()),
                },
                self.current_span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek_kind() {
            TokenKind::Ident(s) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.error_unexpected("an identifier")),
        }
    }

    fn error_unexpected(&self, expected: &str) -> Error {
        Error::new(
            ErrorKind::UnexpectedToken {
                expected: expected.to_string(),
                got: format!("{}", self.peek_kind()),
            },
            self.current_span(),
        )
    }
}

/// Parse a source string into a `SourceFile`. Errors carry the offending
/// source line.
pub fn parse(source: &str) -> Result<SourceFile> {
    let tokens = crate::lexer::Lexer::new(source)
        .tokenize()
        .map_err(|e| e.with_source(source))?;
    Parser::new(tokens)
        .parse_file()
        .map_err(|e| e.with_source(source))
}

/// Parse a standalone type annotation such as `Optional[List[int]]`.
pub fn parse_type_str(source: &str) -> Result<TypeExpr> {
    let tokens = crate::lexer::Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    let ty = parser.parse_type()?;
    if !parser.at_eof() {
        return Err(parser.error_unexpected("end of type"));
    }
    Ok(ty)
}
