use anyhow::Result;

use crate::ast::{BinaryOp, Body, Expr, FuncDecl, Program, Stmt, Type, UnaryOp, VarDecl};
use crate::token::{Span, Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    current: Token<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, Span::default()));
        }
        let current = tokens[0].clone();
        Self {
            tokens,
            pos: 0,
            current,
        }
    }

    /// Entry point: global `var` declarations, then function declarations,
    /// then end of input. Globals may not follow the first function.
    pub fn parse_program(mut self) -> Result<Program> {
        let mut globals = Vec::new();
        while matches!(self.current.kind, TokenKind::Var) {
            globals.push(self.parse_var_decl()?);
        }

        let mut functions = Vec::new();
        while !matches!(self.current.kind, TokenKind::Eof) {
            if matches!(self.current.kind, TokenKind::Var) {
                return Err(self.error_at(
                    "global variable declarations must come before all function declarations",
                ));
            }
            functions.push(self.parse_function_decl()?);
        }
        if functions.is_empty() {
            return Err(self.error("at least one function declaration"));
        }
        Ok(Program { globals, functions })
    }

    fn parse_var_decl(&mut self) -> Result<VarDecl> {
        self.expect_var()?;
        let name = self.expect_identifier()?;
        self.expect_colon()?;
        let ty = self.expect_type()?;
        Ok(VarDecl { name, ty })
    }

    fn parse_function_decl(&mut self) -> Result<FuncDecl> {
        self.expect_func()?;
        let name = self.expect_identifier()?;
        self.expect_lparen()?;
        let mut params = Vec::new();
        if !matches!(self.current.kind, TokenKind::RParen) {
            loop {
                let param_name = self.expect_identifier()?;
                self.expect_colon()?;
                let param_type = self.expect_type()?;
                params.push((param_name, param_type));
                if matches!(self.current.kind, TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_rparen()?;
        self.expect_colon()?;
        let return_type = self.expect_type()?;
        self.expect_lbrace()?;
        let body = self.parse_body()?;
        self.expect_rbrace()?;
        Ok(FuncDecl {
            name,
            params,
            return_type,
            body,
        })
    }

    /// Local `var` declarations, then statements, up to the closing brace.
    fn parse_body(&mut self) -> Result<Body> {
        let mut locals = Vec::new();
        while matches!(self.current.kind, TokenKind::Var) {
            locals.push(self.parse_var_decl()?);
        }

        let mut statements = Vec::new();
        while !matches!(self.current.kind, TokenKind::RBrace | TokenKind::Eof) {
            if matches!(self.current.kind, TokenKind::Var) {
                return Err(
                    self.error_at("local variable declarations must come before all statements")
                );
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Body { locals, statements })
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        match self.current.kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::LBrace => self.parse_block(),
            TokenKind::Return => {
                self.advance();
                let value = self.parse_expression()?;
                Ok(Stmt::Return(value))
            }
            TokenKind::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            _ => {
                let expr = self.parse_expression()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect_if()?;
        self.expect_lparen()?;
        let condition = self.parse_expression()?;
        self.expect_rparen()?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if matches!(self.current.kind, TokenKind::Else) {
            self.advance();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.expect_while()?;
        self.expect_lparen()?;
        let condition = self.parse_expression()?;
        self.expect_rparen()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { condition, body })
    }

    fn parse_block(&mut self) -> Result<Stmt> {
        self.expect_lbrace()?;
        let mut statements = Vec::new();
        while !matches!(self.current.kind, TokenKind::RBrace | TokenKind::Eof) {
            statements.push(self.parse_statement()?);
        }
        self.expect_rbrace()?;
        Ok(Stmt::Block(statements))
    }

    pub fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_binary(0)
    }

    /// Precedence climbing. Left-associative operators recurse with
    /// `precedence + 1`; the right-associative `=` recurses with its own
    /// precedence and demands a bare variable on the left.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let spelling = match &self.current.kind {
                TokenKind::Operator(spelling) => *spelling,
                _ => break,
            };
            let op = match BinaryOp::from_spelling(spelling) {
                Some(op) => op,
                None => return Err(self.error_at(&format!("unknown operator '{spelling}'"))),
            };
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            let op_span = self.current.span();
            self.advance();

            let next_min = if op.is_right_associative() {
                precedence
            } else {
                precedence + 1
            };
            let rhs = self.parse_binary(next_min)?;

            if op == BinaryOp::Assign && !matches!(lhs, Expr::Var(_)) {
                anyhow::bail!(
                    "Left operand of '=' must be a variable at line {}, column {}",
                    op_span.line,
                    op_span.column
                );
            }
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        match &self.current.kind {
            TokenKind::Number(value) => {
                let value = value.clone();
                self.advance();
                Ok(Expr::Number(value))
            }
            TokenKind::Identifier(name) => {
                let name = name.to_string();
                self.advance();
                if matches!(self.current.kind, TokenKind::LParen) {
                    self.parse_call(name)
                } else {
                    Ok(Expr::Var(name))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            TokenKind::Operator(spelling) => {
                let spelling = *spelling;
                if let Some(op) = UnaryOp::from_spelling(spelling) {
                    self.advance();
                    let operand = self.parse_term()?;
                    Ok(Expr::Unary {
                        op,
                        operand: Box::new(operand),
                    })
                } else if BinaryOp::from_spelling(spelling).is_some() {
                    Err(self.error("expression"))
                } else {
                    Err(self.error_at(&format!("unknown operator '{spelling}'")))
                }
            }
            _ => Err(self.error("expression")),
        }
    }

    /// `id(name: expr, ...)` — arguments keep their call-site order here;
    /// the binder checks the name set and the code generator reorders.
    fn parse_call(&mut self, callee: String) -> Result<Expr> {
        self.expect_lparen()?;
        let mut args = Vec::new();
        if !matches!(self.current.kind, TokenKind::RParen) {
            loop {
                let name = self.expect_identifier()?;
                self.expect_colon()?;
                let value = self.parse_expression()?;
                args.push((name, value));
                if matches!(self.current.kind, TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_rparen()?;
        Ok(Expr::Call { callee, args })
    }

    fn expect_identifier(&mut self) -> Result<String> {
        if let TokenKind::Identifier(name) = &self.current.kind {
            let name = name.to_string();
            self.advance();
            Ok(name)
        } else {
            Err(self.error("identifier"))
        }
    }

    fn expect_type(&mut self) -> Result<Type> {
        if matches!(self.current.kind, TokenKind::Int) {
            self.advance();
            Ok(Type::Int)
        } else {
            Err(self.error("type"))
        }
    }

    fn expect_func(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Func) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("func"))
        }
    }

    fn expect_var(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Var) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("var"))
        }
    }

    fn expect_if(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::If) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("if"))
        }
    }

    fn expect_while(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::While) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("while"))
        }
    }

    fn expect_lparen(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::LParen) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("("))
        }
    }

    fn expect_rparen(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::RParen) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(")"))
        }
    }

    fn expect_lbrace(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::LBrace) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("{"))
        }
    }

    fn expect_rbrace(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::RBrace) {
            self.advance();
            Ok(())
        } else {
            Err(self.error("}"))
        }
    }

    fn expect_colon(&mut self) -> Result<()> {
        if matches!(self.current.kind, TokenKind::Colon) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(":"))
        }
    }

    fn advance(&mut self) -> Token<'a> {
        let next = self
            .tokens
            .get(self.pos + 1)
            .cloned()
            .unwrap_or(Token::new(TokenKind::Eof, Span::default()));
        self.pos = self.pos.saturating_add(1);
        std::mem::replace(&mut self.current, next)
    }

    fn error(&self, expected: &str) -> anyhow::Error {
        let span = self.current.span();
        anyhow::anyhow!(
            "Expected {expected}, got {:?} at line {}, column {}",
            self.current.kind(),
            span.line,
            span.column
        )
    }

    fn error_at(&self, message: &str) -> anyhow::Error {
        let span = self.current.span();
        anyhow::anyhow!(
            "{message} at line {}, column {}",
            span.line,
            span.column
        )
    }
}

pub fn parse_tokens<'a>(tokens: Vec<Token<'a>>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}
