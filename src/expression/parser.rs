//! Recursive-descent parser and compile-time validation.
use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use super::lexer::{Token, TokenKind};
use super::{BUILTIN_FUNCTIONS, CONTEXT_BINDINGS, CONTEXT_FUNCTIONS};
use crate::errors::ExpressionSyntaxError;
use std::collections::HashSet;

/// An error found while parsing or validating.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    pub fn into_syntax_error(self, source: &str) -> ExpressionSyntaxError {
        ExpressionSyntaxError {
            expression: source.to_string(),
            message: self.message,
            line: self.line,
        }
    }
}

/// Keyword-argument names `get` accepts.
const GET_KWARGS: &[&str] = &["offset", "start", "end", "agg", "flatten", "default"];
/// Keyword-argument names `read_csv` accepts.
const READ_CSV_KWARGS: &[&str] = &["column"];

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    /// Newlines are statement separators at depth 0 but insignificant
    /// inside parentheses, so calls can span lines.
    depth: usize,
}

/// Parse a token stream into a [`Program`], synthesising the implicit
/// return on the final statement.
pub fn parse(tokens: &[Token]) -> Result<Program, ParseError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let mut statements = Vec::new();

    parser.skip_newlines();
    while !parser.at_end() {
        statements.push(parser.statement()?);
        if !parser.at_end() {
            parser.expect_newline()?;
            parser.skip_newlines();
        }
    }

    if statements.is_empty() {
        return Err(ParseError {
            message: "empty expression".to_string(),
            line: 1,
        });
    }

    // implicit return: the final statement is the result
    let last = statements.pop().unwrap();
    let result = match last {
        Stmt::Return(expr) => Stmt::Return(expr),
        Stmt::Assign(_, expr, _) => Stmt::Return(expr),
    };
    for stmt in &statements {
        if let Stmt::Return(expr) = stmt {
            return Err(ParseError {
                message: "return is only allowed as the final statement".to_string(),
                line: expr.line(),
            });
        }
    }
    statements.push(result);

    Ok(Program { statements })
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        let mut pos = self.pos;
        while let Some(token) = self.tokens.get(pos) {
            if token.kind == TokenKind::Newline && self.depth > 0 {
                pos += 1;
            } else {
                return Some(token);
            }
        }
        None
    }

    fn next(&mut self) -> Option<Token> {
        while let Some(token) = self.tokens.get(self.pos) {
            self.pos += 1;
            if token.kind == TokenKind::Newline && self.depth > 0 {
                continue;
            }
            return Some(token.clone());
        }
        None
    }

    fn current_line(&self) -> usize {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.current_line(),
        }
    }

    fn skip_newlines(&mut self) {
        while self
            .tokens
            .get(self.pos)
            .is_some_and(|t| t.kind == TokenKind::Newline)
        {
            self.pos += 1;
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.tokens.get(self.pos) {
            Some(t) if t.kind == TokenKind::Newline => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(ParseError {
                message: format!("expected end of statement, found {:?}", t.kind),
                line: t.line,
            }),
            None => Ok(()),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        // 'return expr'
        if self.eat(&TokenKind::Return) {
            return Ok(Stmt::Return(self.expression()?));
        }

        // lookahead for 'name = expr' (but not 'name == ...')
        if let (Some(Token { kind: TokenKind::Ident(name), line }), Some(next)) =
            (self.tokens.get(self.pos).cloned(), self.tokens.get(self.pos + 1))
            && next.kind == TokenKind::Assign
        {
            self.pos += 2;
            let expr = self.expression()?;
            return Ok(Stmt::Assign(name, expr, line));
        }

        Ok(Stmt::Return(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        if self.peek().map(|t| &t.kind) == Some(&TokenKind::If) {
            let line = self.current_line();
            self.next();
            let cond = self.expression()?;
            self.expect(&TokenKind::Then, "'then'")?;
            let then = self.expression()?;
            self.expect(&TokenKind::Else, "'else'")?;
            let otherwise = self.expression()?;
            return Ok(Expr::If {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
                line,
            });
        }
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.peek().map(|t| &t.kind) == Some(&TokenKind::Or) {
            let line = self.current_line();
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs), line);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.not_expr()?;
        while self.peek().map(|t| &t.kind) == Some(&TokenKind::And) {
            let line = self.current_line();
            self.next();
            let rhs = self.not_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs), line);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek().map(|t| &t.kind) == Some(&TokenKind::Not) {
            let line = self.current_line();
            self.next();
            let operand = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand), line));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.additive()?;
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Eq) => Some(BinaryOp::Eq),
            Some(TokenKind::Neq) => Some(BinaryOp::Neq),
            Some(TokenKind::Lt) => Some(BinaryOp::Lt),
            Some(TokenKind::Lte) => Some(BinaryOp::Lte),
            Some(TokenKind::Gt) => Some(BinaryOp::Gt),
            Some(TokenKind::Gte) => Some(BinaryOp::Gte),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.current_line();
            self.next();
            let rhs = self.additive()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs), line));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            let line = self.current_line();
            self.next();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs), line);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => break,
            };
            let line = self.current_line();
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs), line);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek().map(|t| &t.kind) == Some(&TokenKind::Minus) {
            let line = self.current_line();
            self.next();
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand), line));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.atom()?;
        if self.peek().map(|t| &t.kind) == Some(&TokenKind::Caret) {
            let line = self.current_line();
            self.next();
            // right-associative
            let exponent = self.unary()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
                line,
            ));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.next().ok_or_else(|| self.error("unexpected end of expression"))?;
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n, token.line)),
            TokenKind::Str(s) => Ok(Expr::Str(s, token.line)),
            TokenKind::Ident(name) => {
                if self.peek().map(|t| &t.kind) == Some(&TokenKind::LParen) {
                    self.call(name, token.line)
                } else {
                    Ok(Expr::Ident(name, token.line))
                }
            }
            TokenKind::LParen => {
                self.depth += 1;
                let inner = self.expression()?;
                let close = self.expect(&TokenKind::RParen, "')'");
                self.depth -= 1;
                close?;
                Ok(inner)
            }
            other => Err(ParseError {
                message: format!("unexpected {other:?}"),
                line: token.line,
            }),
        }
    }

    fn call(&mut self, name: String, line: usize) -> Result<Expr, ParseError> {
        self.next(); // consume '('
        self.depth += 1;
        let result = self.call_args();
        self.depth -= 1;
        let (args, kwargs) = result?;
        Ok(Expr::Call {
            name,
            args,
            kwargs,
            line,
        })
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok((args, kwargs));
        }
        loop {
            // keyword argument lookahead: IDENT '='
            let mut lookahead = self.pos;
            while self
                .tokens
                .get(lookahead)
                .is_some_and(|t| t.kind == TokenKind::Newline)
            {
                lookahead += 1;
            }
            let is_kwarg = matches!(
                (self.tokens.get(lookahead), self.tokens.get(lookahead + 1)),
                (
                    Some(Token { kind: TokenKind::Ident(_), .. }),
                    Some(Token { kind: TokenKind::Assign, .. })
                )
            );
            if is_kwarg {
                let Some(Token { kind: TokenKind::Ident(key), .. }) = self.next() else {
                    unreachable!();
                };
                self.next(); // '='
                kwargs.push((key, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument after keyword argument"));
                }
                args.push(self.expression()?);
            }
            if self.eat(&TokenKind::RParen) {
                return Ok((args, kwargs));
            }
            self.expect(&TokenKind::Comma, "',' or ')'")?;
        }
    }
}

/// Validate a parsed program against the capability allow lists:
/// every identifier must be a context binding or an earlier assignment,
/// every call a known builtin or context function, and keyword arguments
/// are only accepted where defined.
pub fn validate(program: &Program) -> Result<(), ParseError> {
    let mut assigned: HashSet<&str> = HashSet::new();
    for stmt in &program.statements {
        let expr = match stmt {
            Stmt::Assign(name, expr, _) => {
                validate_expr(expr, &assigned)?;
                assigned.insert(name);
                continue;
            }
            Stmt::Return(expr) => expr,
        };
        validate_expr(expr, &assigned)?;
    }
    Ok(())
}

fn validate_expr(expr: &Expr, assigned: &HashSet<&str>) -> Result<(), ParseError> {
    match expr {
        Expr::Number(..) | Expr::Str(..) => Ok(()),
        Expr::Ident(name, line) => {
            if CONTEXT_BINDINGS.contains(&name.as_str()) || assigned.contains(name.as_str()) {
                Ok(())
            } else {
                Err(ParseError {
                    message: format!("unknown name '{name}'"),
                    line: *line,
                })
            }
        }
        Expr::Unary(_, operand, _) => validate_expr(operand, assigned),
        Expr::Binary(_, lhs, rhs, _) => {
            validate_expr(lhs, assigned)?;
            validate_expr(rhs, assigned)
        }
        Expr::If {
            cond,
            then,
            otherwise,
            ..
        } => {
            validate_expr(cond, assigned)?;
            validate_expr(then, assigned)?;
            validate_expr(otherwise, assigned)
        }
        Expr::Call {
            name,
            args,
            kwargs,
            line,
        } => {
            let allowed_kwargs: &[&str] = match name.as_str() {
                "get" | "GET" => GET_KWARGS,
                "read_csv" => READ_CSV_KWARGS,
                _ if BUILTIN_FUNCTIONS.contains(&name.as_str()) => &[],
                _ => {
                    return Err(ParseError {
                        message: format!("unknown function '{name}'"),
                        line: *line,
                    });
                }
            };
            if CONTEXT_FUNCTIONS.contains(&name.as_str()) && args.is_empty() {
                return Err(ParseError {
                    message: format!("'{name}' requires a key argument"),
                    line: *line,
                });
            }
            for (key, _) in kwargs {
                if !allowed_kwargs.contains(&key.as_str()) {
                    return Err(ParseError {
                        message: format!("'{name}' does not accept keyword '{key}'"),
                        line: *line,
                    });
                }
            }
            for arg in args {
                validate_expr(arg, assigned)?;
            }
            for (_, value) in kwargs {
                validate_expr(value, assigned)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let program = parse(&tokenize(source).unwrap()).unwrap();
        validate(&program).unwrap();
        program
    }

    fn parse_err(source: &str) -> ParseError {
        let tokens = tokenize(source).unwrap();
        match parse(&tokens) {
            Ok(program) => validate(&program).unwrap_err(),
            Err(err) => err,
        }
    }

    #[test]
    fn test_precedence() {
        let program = parse_ok("1 + 2 * 3");
        let Stmt::Return(Expr::Binary(BinaryOp::Add, _, rhs, _)) = &program.statements[0] else {
            panic!("expected addition at the root");
        };
        assert!(matches!(**rhs, Expr::Binary(BinaryOp::Mul, ..)));
    }

    #[test]
    fn test_power_is_right_associative() {
        let program = parse_ok("2 ^ 3 ^ 2");
        let Stmt::Return(Expr::Binary(BinaryOp::Pow, _, rhs, _)) = &program.statements[0] else {
            panic!("expected power at the root");
        };
        assert!(matches!(**rhs, Expr::Binary(BinaryOp::Pow, ..)));
    }

    #[test]
    fn test_if_then_else() {
        parse_ok("if timestep > 5 then 1 else 0");
    }

    #[test]
    fn test_assignments_bind_names() {
        parse_ok("x = 2\ny = x * 3\nx + y");
    }

    #[test]
    fn test_unknown_name_fails_validation() {
        let err = parse_err("x + 1");
        assert!(err.message.contains("unknown name 'x'"));
    }

    #[test]
    fn test_call_with_kwargs() {
        parse_ok("get(\"node/1/2\", offset=-1, agg='mean')");
    }

    #[test]
    fn test_multiline_call() {
        parse_ok("get(\"node/1/2\",\n    offset=-1)");
    }

    #[test]
    fn test_kwarg_rejected_on_builtin() {
        let err = parse_err("min(1, 2, silly=1)");
        assert!(err.message.contains("keyword"));
    }

    #[test]
    fn test_get_requires_key() {
        let err = parse_err("get()");
        assert!(err.message.contains("key argument"));
    }

    #[test]
    fn test_return_must_be_last() {
        let err = parse_err("return 1\n2");
        assert!(err.message.contains("final statement"));
    }

    #[test]
    fn test_unbalanced_parens_report_line() {
        let err = parse_err("x = 1\ny = (2");
        assert_eq!(err.line, 2);
    }
}
