//! Parser: recursive descent over the lexer's token stream
//!
//! Produces a [`Program`]. Every construct outside the supported subset
//! is a syntax error here; security screening happens in the validator.
//! Nesting (including left-deep operator chains) is capped so that later
//! tree walks have a bounded depth.

use super::ast::{BinOp, BoolOp, CmpOp, CompClause, Expr, Pos, Program, Stmt, Target, UnaryOp};
use super::error::{SandboxError, SandboxResult};
use super::lexer::{Token, TokenKind};
use super::value::Value;

/// Words with grammatical meaning; never usable as names.
pub const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "for", "True", "False", "None",
];

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    pub fn parse_program(mut self) -> SandboxResult<Program> {
        let mut statements = Vec::new();

        loop {
            while self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon) {
                self.advance();
            }
            if self.check(TokenKind::Eof) {
                break;
            }

            statements.push(self.parse_statement()?);

            match self.peek_kind() {
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof => {}
                _ => return Err(self.unexpected("end of statement")),
            }
        }

        Ok(Program { statements })
    }

    fn parse_statement(&mut self) -> SandboxResult<Stmt> {
        let start = self.peek().clone();

        if start.kind == TokenKind::Name
            && !KEYWORDS.contains(&start.text.as_str())
            && self.peek_kind_at(1) == TokenKind::Assign
        {
            self.advance();
            self.advance();
            let value = self.parse_expr()?;
            let pos = pos_of(&start);
            return Ok(Stmt::Assign {
                name: start.text,
                value,
                pos,
            });
        }

        let expr = self.parse_expr()?;
        if self.check(TokenKind::Assign) {
            let tok = self.peek();
            return Err(SandboxError::syntax(
                tok.line,
                tok.col,
                "assignment target must be a plain name",
            ));
        }
        Ok(Stmt::Expr(expr))
    }

    // ── expressions ────────────────────────────────────

    fn parse_expr(&mut self) -> SandboxResult<Expr> {
        self.enter()?;
        let result = self.parse_ternary();
        self.depth -= 1;
        result
    }

    fn parse_ternary(&mut self) -> SandboxResult<Expr> {
        let then = self.parse_or()?;
        if !self.check_name("if") {
            return Ok(then);
        }
        self.advance();
        let cond = self.parse_or()?;
        self.expect_name("else")?;
        let otherwise = self.parse_expr()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_or(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while self.check_name("or") {
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_and()?;
            left = Expr::Bool {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_and(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_not()?;
        let mut chained = 0;
        while self.check_name("and") {
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_not()?;
            left = Expr::Bool {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_not(&mut self) -> SandboxResult<Expr> {
        if !self.check_name("not") {
            return self.parse_comparison();
        }
        self.advance();
        self.enter()?;
        let operand = self.parse_not();
        self.depth -= 1;
        Ok(Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand?),
        })
    }

    fn parse_comparison(&mut self) -> SandboxResult<Expr> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();

        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => CmpOp::Eq,
                TokenKind::NotEq => CmpOp::NotEq,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                TokenKind::Name if self.check_name("in") => CmpOp::In,
                TokenKind::Name if self.check_name("not") && self.peek_at(1).is_name("in") => {
                    self.advance();
                    CmpOp::NotIn
                }
                TokenKind::Name if self.check_name("is") => {
                    if self.peek_at(1).is_name("not") {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn parse_arith(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_term()?;
        let mut chained = 0;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_term(&mut self) -> SandboxResult<Expr> {
        let mut left = self.parse_factor()?;
        let mut chained = 0;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn parse_factor(&mut self) -> SandboxResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn parse_postfix(&mut self) -> SandboxResult<Expr> {
        let mut expr = self.parse_atom()?;
        let mut chained = 0;

        loop {
            match self.peek_kind() {
                TokenKind::LParen => {
                    let open = self.advance().clone();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                        pos: pos_of(&open),
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    expr = self.parse_subscript(expr)?;
                }
                TokenKind::Dot => {
                    let dot = self.advance().clone();
                    let name = self.expect(TokenKind::Name)?.text.clone();
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        name,
                        pos: pos_of(&dot),
                    };
                }
                _ => break,
            }
            self.enter()?;
            chained += 1;
        }

        self.depth -= chained;
        Ok(expr)
    }

    fn parse_subscript(&mut self, value: Expr) -> SandboxResult<Expr> {
        let start = if self.check(TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };

        if !self.check(TokenKind::Colon) {
            self.expect(TokenKind::RBracket)?;
            let index = start.ok_or_else(|| self.unexpected("index expression"))?;
            return Ok(Expr::Index {
                value: Box::new(value),
                index,
            });
        }

        self.advance();
        let end = if self.check(TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::Slice {
            value: Box::new(value),
            start,
            end,
        })
    }

    fn parse_call_args(&mut self) -> SandboxResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.check(TokenKind::RParen) {
            if self.check(TokenKind::Name) && self.peek_kind_at(1) == TokenKind::Assign {
                let name = self.advance().text.clone();
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    let tok = self.peek();
                    return Err(SandboxError::syntax(
                        tok.line,
                        tok.col,
                        format!("keyword argument repeated: '{name}'"),
                    ));
                }
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    let tok = self.peek();
                    return Err(SandboxError::syntax(
                        tok.line,
                        tok.col,
                        "positional argument follows keyword argument",
                    ));
                }
                let arg = self.parse_expr()?;
                // Bare generator argument: sum(x for x in xs)
                if self.check_name("for") && args.is_empty() {
                    let clauses = self.parse_comp_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        clauses,
                    });
                    self.expect(TokenKind::RParen)?;
                    return Ok((args, kwargs));
                }
                args.push(arg);
            }

            if !self.check(TokenKind::Comma) {
                break;
            }
            self.advance();
        }

        self.expect(TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> SandboxResult<Expr> {
        let tok = self.peek().clone();

        match tok.kind {
            TokenKind::Int => {
                self.advance();
                let n = tok
                    .text
                    .parse::<i64>()
                    .map_err(|_| SandboxError::syntax(tok.line, tok.col, "invalid integer"))?;
                Ok(Expr::Const(Value::Int(n)))
            }
            TokenKind::Float => {
                self.advance();
                let f = tok
                    .text
                    .parse::<f64>()
                    .map_err(|_| SandboxError::syntax(tok.line, tok.col, "invalid float"))?;
                Ok(Expr::Const(Value::Float(f)))
            }
            TokenKind::Str => {
                // Adjacent literals concatenate: 'a' 'b'
                let mut text = String::new();
                while self.check(TokenKind::Str) {
                    text.push_str(&self.advance().text);
                }
                Ok(Expr::Const(Value::Str(text)))
            }
            TokenKind::Name => {
                self.advance();
                match tok.text.as_str() {
                    "True" => Ok(Expr::Const(Value::Bool(true))),
                    "False" => Ok(Expr::Const(Value::Bool(false))),
                    "None" => Ok(Expr::Const(Value::None)),
                    kw if KEYWORDS.contains(&kw) => Err(SandboxError::syntax(
                        tok.line,
                        tok.col,
                        format!("unexpected keyword '{kw}'"),
                    )),
                    _ => Ok(Expr::Name {
                        pos: pos_of(&tok),
                        name: tok.text,
                    }),
                }
            }
            TokenKind::LParen => {
                self.advance();
                self.parse_paren()
            }
            TokenKind::LBracket => {
                self.advance();
                self.parse_list()
            }
            TokenKind::LBrace => {
                self.advance();
                self.parse_dict()
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_paren(&mut self) -> SandboxResult<Expr> {
        if self.check(TokenKind::RParen) {
            self.advance();
            return Ok(Expr::Tuple(Vec::new()));
        }

        let first = self.parse_expr()?;
        if self.check_name("for") {
            let clauses = self.parse_comp_clauses()?;
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }
        if self.check(TokenKind::RParen) {
            self.advance();
            return Ok(first);
        }

        let mut items = vec![first];
        while self.check(TokenKind::Comma) {
            self.advance();
            if self.check(TokenKind::RParen) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::Tuple(items))
    }

    fn parse_list(&mut self) -> SandboxResult<Expr> {
        if self.check(TokenKind::RBracket) {
            self.advance();
            return Ok(Expr::List(Vec::new()));
        }

        let first = self.parse_expr()?;
        if self.check_name("for") {
            let clauses = self.parse_comp_clauses()?;
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }

        let mut items = vec![first];
        while self.check(TokenKind::Comma) {
            self.advance();
            if self.check(TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::List(items))
    }

    fn parse_dict(&mut self) -> SandboxResult<Expr> {
        if self.check(TokenKind::RBrace) {
            self.advance();
            return Ok(Expr::Dict(Vec::new()));
        }

        let key = self.parse_expr()?;
        if !self.check(TokenKind::Colon) {
            let tok = self.peek();
            return Err(SandboxError::syntax(
                tok.line,
                tok.col,
                "set literals are not supported",
            ));
        }
        self.advance();
        let value = self.parse_expr()?;

        if self.check_name("for") {
            let clauses = self.parse_comp_clauses()?;
            self.expect(TokenKind::RBrace)?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                clauses,
            });
        }

        let mut entries = vec![(key, value)];
        while self.check(TokenKind::Comma) {
            self.advance();
            if self.check(TokenKind::RBrace) {
                break;
            }
            let k = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let v = self.parse_expr()?;
            entries.push((k, v));
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Dict(entries))
    }

    fn parse_comp_clauses(&mut self) -> SandboxResult<Vec<CompClause>> {
        let mut clauses = Vec::new();

        while self.check_name("for") {
            self.advance();
            // Each clause is one more level of nested iteration
            self.enter()?;
            let target = self.parse_target()?;
            self.expect_name("in")?;
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.check_name("if") {
                self.advance();
                conditions.push(self.parse_or()?);
            }
            clauses.push(CompClause {
                target,
                iter,
                conditions,
            });
        }

        self.depth -= clauses.len();
        Ok(clauses)
    }

    fn parse_target(&mut self) -> SandboxResult<Target> {
        let parenthesized = self.check(TokenKind::LParen);
        if parenthesized {
            self.advance();
        }

        let mut names = vec![self.expect_target_name()?];
        while self.check(TokenKind::Comma) {
            self.advance();
            names.push(self.expect_target_name()?);
        }

        if parenthesized {
            self.expect(TokenKind::RParen)?;
        }

        if names.len() == 1 && !parenthesized {
            Ok(Target::Name(names.remove(0)))
        } else {
            Ok(Target::Tuple(names))
        }
    }

    fn expect_target_name(&mut self) -> SandboxResult<String> {
        let tok = self.expect(TokenKind::Name)?.clone();
        if KEYWORDS.contains(&tok.text.as_str()) {
            return Err(SandboxError::syntax(
                tok.line,
                tok.col,
                format!("cannot use keyword '{}' as a loop variable", tok.text),
            ));
        }
        Ok(tok.text)
    }

    // ── helpers ────────────────────────────────────────

    fn enter(&mut self) -> SandboxResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            let tok = self.peek();
            return Err(SandboxError::syntax(
                tok.line,
                tok.col,
                format!("expression nested too deeply (limit {})", self.max_depth),
            ));
        }
        Ok(())
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> TokenKind {
        self.peek_at(offset).kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_name(&self, name: &str) -> bool {
        self.peek().is_name(name)
    }

    fn advance(&mut self) -> &Token {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        &self.tokens[idx]
    }

    fn expect(&mut self, kind: TokenKind) -> SandboxResult<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn expect_name(&mut self, name: &str) -> SandboxResult<()> {
        if self.check_name(name) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{name}'")))
        }
    }

    fn unexpected(&self, expected: &str) -> SandboxError {
        let tok = self.peek();
        let found = match tok.kind {
            TokenKind::Name => format!("'{}'", tok.text),
            TokenKind::Str => "string".to_string(),
            other => other.to_string(),
        };
        SandboxError::syntax(
            tok.line,
            tok.col,
            format!("expected {expected}, found {found}"),
        )
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn pos_of(tok: &Token) -> Pos {
    Pos {
        line: tok.line,
        col: tok.col,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::lexer::tokenize;

    fn parse(code: &str) -> SandboxResult<Program> {
        Parser::new(tokenize(code)?, 64).parse_program()
    }

    fn parse_expr(code: &str) -> Expr {
        match parse(code).unwrap().statements.remove(0) {
            Stmt::Expr(e) => e,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    // ── statements ──────────────────────────────────────

    #[test]
    fn test_assignment_and_expression_statements() {
        let program = parse("x = 1; x + 2\n\nresult = x").unwrap();
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(&program.statements[0], Stmt::Assign { name, .. } if name == "x"));
        assert!(matches!(&program.statements[1], Stmt::Expr(_)));
    }

    #[test]
    fn test_names_carry_positions() {
        let program = parse("x = 1\nresult = x").unwrap();
        match &program.statements[1] {
            Stmt::Assign { name, value, pos } => {
                assert_eq!(name, "result");
                assert_eq!(*pos, Pos { line: 2, col: 1 });
                assert_eq!(
                    *value,
                    Expr::Name {
                        name: "x".into(),
                        pos: Pos { line: 2, col: 10 },
                    }
                );
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_assign_to_subscript_rejected() {
        let err = parse("x[0] = 1").unwrap_err();
        assert!(err.to_string().contains("assignment target"));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse("x = 1 2").is_err());
    }

    #[test]
    fn test_empty_program() {
        assert!(parse("\n# nothing\n").unwrap().statements.is_empty());
    }

    // ── precedence ──────────────────────────────────────

    #[test]
    fn test_precedence_mul_over_add() {
        let expr = parse_expr("1 + 2 * 3");
        match expr {
            Expr::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_chained_comparison() {
        match parse_expr("1 < x <= 3") {
            Expr::Compare { rest, .. } => {
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[0].0, CmpOp::Lt);
                assert_eq!(rest[1].0, CmpOp::Le);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_in_and_is_not() {
        match parse_expr("a not in b") {
            Expr::Compare { rest, .. } => assert_eq!(rest[0].0, CmpOp::NotIn),
            other => panic!("unexpected {other:?}"),
        }
        match parse_expr("a is not None") {
            Expr::Compare { rest, .. } => assert_eq!(rest[0].0, CmpOp::IsNot),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ternary() {
        assert!(matches!(parse_expr("1 if x else 2"), Expr::IfElse { .. }));
    }

    // ── calls and subscripts ────────────────────────────

    #[test]
    fn test_call_with_kwargs() {
        match parse_expr("count_messages(role='user')") {
            Expr::Call { args, kwargs, .. } => {
                assert!(args.is_empty());
                assert_eq!(kwargs[0].0, "role");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_positional_after_keyword_rejected() {
        assert!(parse("f(a=1, 2)").is_err());
    }

    #[test]
    fn test_generator_argument() {
        match parse_expr("sum(x for x in xs)") {
            Expr::Call { args, .. } => assert!(matches!(args[0], Expr::ListComp { .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_slice_forms() {
        assert!(matches!(parse_expr("xs[1:]"), Expr::Slice { start: Some(_), end: None, .. }));
        assert!(matches!(parse_expr("xs[:2]"), Expr::Slice { start: None, end: Some(_), .. }));
        assert!(matches!(parse_expr("xs[-1]"), Expr::Index { .. }));
    }

    #[test]
    fn test_attribute_parsed() {
        assert!(matches!(parse_expr("x.__class__"), Expr::Attribute { .. }));
    }

    // ── literals and comprehensions ─────────────────────

    #[test]
    fn test_tuple_and_dict_literals() {
        assert!(matches!(parse_expr("(1, 2)"), Expr::Tuple(items) if items.len() == 2));
        assert!(matches!(parse_expr("(1)"), Expr::Const(Value::Int(1))));
        assert!(matches!(parse_expr("{'a': 1, 'b': 2,}"), Expr::Dict(e) if e.len() == 2));
    }

    #[test]
    fn test_set_literal_rejected() {
        assert!(parse("{1, 2}").is_err());
    }

    #[test]
    fn test_comprehension_clauses() {
        match parse_expr("[a + b for a in xs if a > 1 for b in ys]") {
            Expr::ListComp { clauses, .. } => {
                assert_eq!(clauses.len(), 2);
                assert_eq!(clauses[0].conditions.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dict_comprehension_tuple_target() {
        match parse_expr("{k: v for k, v in items(d)}") {
            Expr::DictComp { clauses, .. } => {
                assert_eq!(clauses[0].target, Target::Tuple(vec!["k".into(), "v".into()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── nesting ceiling ─────────────────────────────────

    #[test]
    fn test_deep_parentheses_rejected() {
        let code = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        let err = parse(&code).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
    }

    #[test]
    fn test_long_operator_chain_rejected() {
        let code = vec!["1"; 200].join(" + ");
        assert!(parse(&code).is_err());
    }

    #[test]
    fn test_moderate_chain_accepted() {
        let code = vec!["1"; 20].join(" + ");
        assert!(parse(&code).is_ok());
    }
}
