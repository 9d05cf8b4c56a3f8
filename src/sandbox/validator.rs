//! Static screening of submitted code.
//!
//! Runs strictly before evaluation, in three passes:
//!
//! 1. token scan: denied keywords, host-facing names, dunder identifiers
//!    (a raw-text scan stands in when the code does not tokenize)
//! 2. structural parse (with the nesting ceiling)
//! 3. scope walk: every identifier must be a capability being called or
//!    a name bound earlier in program order
//!
//! A program that passes can only ever reach the registry and its own
//! bindings.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use super::ast::{CompClause, Expr, Pos, Program, Stmt, Target};
use super::error::{SandboxError, SandboxResult};
use super::lexer::{tokenize, Token, TokenKind};
use super::parser::Parser;
use crate::capabilities::CapabilityRegistry;
use crate::config::EngineConfig;

/// Statement and definition keywords outside the expression subset.
pub const DENIED_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "lambda", "while", "with", "try", "except", "finally",
    "raise", "del", "global", "nonlocal", "yield", "async", "await", "return", "assert", "pass",
    "break", "continue", "as", "elif",
];

/// Modules and builtins that reach the host.
pub const DENIED_NAMES: &[&str] = &[
    "os", "sys", "subprocess", "socket", "shutil", "pathlib", "io", "ctypes", "importlib",
    "builtins", "open", "file", "eval", "exec", "compile", "globals", "locals", "vars", "dir",
    "getattr", "setattr", "delattr", "hasattr", "input", "breakpoint", "memoryview", "type",
    "object", "super", "help", "exit", "quit", "signal", "threading", "multiprocessing", "pickle",
    "marshal", "requests", "urllib", "http",
];

/// Screens `code` and returns its syntax tree when it is safe to run.
pub fn validate(
    code: &str,
    registry: &CapabilityRegistry,
    limits: &EngineConfig,
) -> SandboxResult<Program> {
    let tokens = match tokenize(code) {
        Ok(tokens) => tokens,
        Err(err @ SandboxError::Syntax { .. }) => {
            screen_source(code)?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    screen_tokens(&tokens)?;
    let program = Parser::new(tokens, limits.max_nesting).parse_program()?;
    ScopeCheck::new(registry).program(&program)?;
    Ok(program)
}

fn screen_tokens(tokens: &[Token]) -> SandboxResult<()> {
    tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Name)
        .try_for_each(|tok| screen_name(&tok.text, tok.line))
}

fn screen_name(name: &str, line: usize) -> SandboxResult<()> {
    if DENIED_KEYWORDS.contains(&name) {
        return Err(SandboxError::Security(format!(
            "'{name}' is not allowed (line {line})"
        )));
    }
    if DENIED_NAMES.contains(&name) {
        return Err(SandboxError::Security(format!(
            "access to '{name}' is not allowed (line {line})"
        )));
    }
    if name.contains("__") {
        return Err(SandboxError::Security(format!(
            "dunder identifier '{name}' is not allowed (line {line})"
        )));
    }
    Ok(())
}

/// Quoted literals and comments first, so their contents are skipped.
fn source_words() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| {
        Regex::new(r#"'(?:[^'\\\n]|\\.)*'|"(?:[^"\\\n]|\\.)*"|#[^\n]*|[A-Za-z_][A-Za-z0-9_]*"#)
            .expect("source word pattern")
    })
}

/// Fallback denylist scan over raw text, for code the lexer gave up on.
fn screen_source(code: &str) -> SandboxResult<()> {
    for (idx, line) in code.lines().enumerate() {
        for m in source_words().find_iter(line) {
            let word = m.as_str();
            if word.starts_with(['\'', '"', '#']) {
                continue;
            }
            screen_name(word, idx + 1)?;
        }
    }
    Ok(())
}

struct ScopeCheck<'r> {
    registry: &'r CapabilityRegistry,
    globals: HashSet<String>,
    /// One frame per enclosing comprehension
    locals: Vec<HashSet<String>>,
}

impl<'r> ScopeCheck<'r> {
    fn new(registry: &'r CapabilityRegistry) -> Self {
        Self {
            registry,
            globals: HashSet::new(),
            locals: Vec::new(),
        }
    }

    fn program(&mut self, program: &Program) -> SandboxResult<()> {
        for stmt in &program.statements {
            match stmt {
                Stmt::Assign { name, value, pos } => {
                    // The right-hand side only sees earlier bindings
                    self.expr(value)?;
                    self.check_bindable(name, *pos)?;
                    self.globals.insert(name.clone());
                }
                Stmt::Expr(expr) => self.expr(expr)?,
            }
        }
        Ok(())
    }

    fn is_bound(&self, name: &str) -> bool {
        self.globals.contains(name) || self.locals.iter().any(|frame| frame.contains(name))
    }

    fn check_bindable(&self, name: &str, pos: Pos) -> SandboxResult<()> {
        if self.registry.contains(name) {
            return Err(SandboxError::Security(format!(
                "cannot rebind capability '{name}' (line {})",
                pos.line
            )));
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> SandboxResult<()> {
        match expr {
            Expr::Const(_) => Ok(()),
            Expr::Name { name, pos } => {
                if self.is_bound(name) {
                    Ok(())
                } else if self.registry.contains(name) {
                    Err(SandboxError::Security(format!(
                        "capability '{name}' can only be called (line {})",
                        pos.line
                    )))
                } else {
                    Err(SandboxError::Security(format!(
                        "undeclared identifier '{name}' at line {}, column {}",
                        pos.line, pos.col
                    )))
                }
            }
            Expr::List(items) | Expr::Tuple(items) => {
                items.iter().try_for_each(|item| self.expr(item))
            }
            Expr::Dict(entries) => entries.iter().try_for_each(|(k, v)| {
                self.expr(k)?;
                self.expr(v)
            }),
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Compare { first, rest } => {
                self.expr(first)?;
                rest.iter().try_for_each(|(_, e)| self.expr(e))
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond)?;
                self.expr(then)?;
                self.expr(otherwise)
            }
            Expr::Call {
                func,
                args,
                kwargs,
                pos,
            } => {
                self.callee(func, *pos)?;
                args.iter().try_for_each(|a| self.expr(a))?;
                kwargs.iter().try_for_each(|(_, v)| self.expr(v))
            }
            Expr::Index { value, index } => {
                self.expr(value)?;
                self.expr(index)
            }
            Expr::Slice { value, start, end } => {
                self.expr(value)?;
                start.iter().chain(end.iter()).try_for_each(|e| self.expr(e))
            }
            Expr::Attribute { name, pos, .. } => Err(SandboxError::Security(format!(
                "attribute access '.{name}' is not allowed (line {})",
                pos.line
            ))),
            Expr::ListComp { element, clauses } => {
                self.comprehension(clauses, |this| this.expr(element))
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => self.comprehension(clauses, |this| {
                this.expr(key)?;
                this.expr(value)
            }),
        }
    }

    fn callee(&mut self, func: &Expr, pos: Pos) -> SandboxResult<()> {
        match func {
            Expr::Name { name, .. } if self.is_bound(name) => Err(SandboxError::Security(format!(
                "'{name}' is a local value and cannot be called (line {})",
                pos.line
            ))),
            Expr::Name { name, .. } if self.registry.contains(name) => Ok(()),
            Expr::Name { name, .. } => Err(SandboxError::UnknownFunction(name.clone())),
            other => {
                // Report what is wrong inside the callee first
                self.expr(other)?;
                Err(SandboxError::Security(format!(
                    "only capabilities can be called (line {})",
                    pos.line
                )))
            }
        }
    }

    fn comprehension(
        &mut self,
        clauses: &[CompClause],
        body: impl FnOnce(&mut Self) -> SandboxResult<()>,
    ) -> SandboxResult<()> {
        self.locals.push(HashSet::new());
        let outcome = self.clauses(clauses).and_then(|()| body(self));
        self.locals.pop();
        outcome
    }

    fn clauses(&mut self, clauses: &[CompClause]) -> SandboxResult<()> {
        for clause in clauses {
            // A clause's iterable cannot see its own target
            self.expr(&clause.iter)?;
            self.bind_target(&clause.target, &clause.iter)?;
            for cond in &clause.conditions {
                self.expr(cond)?;
            }
        }
        Ok(())
    }

    fn bind_target(&mut self, target: &Target, iter: &Expr) -> SandboxResult<()> {
        let pos = position_of(iter);
        for name in target.names() {
            self.check_bindable(name, pos)?;
            if let Some(frame) = self.locals.last_mut() {
                frame.insert(name.to_string());
            }
        }
        Ok(())
    }
}

/// Best-effort source position for messages about a clause.
fn position_of(expr: &Expr) -> Pos {
    match expr {
        Expr::Name { pos, .. } | Expr::Call { pos, .. } | Expr::Attribute { pos, .. } => *pos,
        Expr::Index { value, .. } | Expr::Slice { value, .. } => position_of(value),
        _ => Pos { line: 0, col: 0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::ExecutionStatus;

    fn check(code: &str) -> SandboxResult<Program> {
        validate(code, &CapabilityRegistry::standard(), &EngineConfig::default())
    }

    fn assert_security(code: &str) {
        match check(code) {
            Err(e) => assert_eq!(
                e.status(),
                ExecutionStatus::SecurityViolation,
                "{code}: {e}"
            ),
            Ok(_) => panic!("accepted: {code}"),
        }
    }

    // ── denylist ────────────────────────────────────────

    #[test]
    fn test_import_rejected() {
        let err = check("import os").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
        assert!(err.to_string().contains("'import'"));
    }

    #[test]
    fn test_denied_names_rejected() {
        for code in [
            "result = open('/etc/passwd')",
            "result = eval('1')",
            "x = os",
            "result = getattr(1, 'real')",
            "result = __import__('os')",
            "result = [c for c in __builtins__]",
        ] {
            assert_security(code);
        }
    }

    #[test]
    fn test_denied_keywords_rejected() {
        for code in ["def f(): pass", "lambda: 1", "while True: pass", "from os import path"] {
            assert_security(code);
        }
    }

    #[test]
    fn test_strings_are_not_scanned() {
        assert!(check("result = find_messages('import os')").is_ok());
    }

    #[test]
    fn test_fstring_rejected() {
        assert_security("result = f'{len}'");
    }

    // ── scope ───────────────────────────────────────────

    #[test]
    fn test_undeclared_identifier() {
        let err = check("result = secret").unwrap_err();
        assert_eq!(
            err,
            SandboxError::Security("undeclared identifier 'secret' at line 1, column 10".into())
        );
    }

    #[test]
    fn test_use_before_binding() {
        assert_security("result = x\nx = 1");
        assert_security("x = x + 1");
        assert!(check("x = 1\nresult = x + 1").is_ok());
    }

    #[test]
    fn test_unknown_function() {
        let err = check("result = fetch_url('http://x')").unwrap_err();
        assert_eq!(err, SandboxError::UnknownFunction("fetch_url".into()));
    }

    #[test]
    fn test_capability_reference_without_call() {
        assert_security("f = find_messages");
    }

    #[test]
    fn test_calling_local_or_expression() {
        assert_security("f = 1\nresult = f()");
        assert_security("result = (1)(2)");
        assert_security("result = find_messages('a')[0]('b')");
    }

    #[test]
    fn test_rebinding_capability() {
        assert_security("len = 3");
        assert_security("result = [len for len in range(3)]");
    }

    #[test]
    fn test_attribute_access_rejected() {
        let err = check("result = get_message(0).keys()").unwrap_err();
        assert!(err.to_string().contains("attribute access '.keys'"));
    }

    #[test]
    fn test_comprehension_scope() {
        assert!(check("result = [m['id'] for m in find_messages('a') if m['role'] == 'user']").is_ok());
        assert!(check("result = [(a, b) for a in range(2) for b in range(a)]").is_ok());
        // Comprehension variables do not leak
        assert_security("xs = [m for m in range(3)]\nresult = m");
        // A clause cannot iterate over its own target
        assert_security("result = [x for x in x]");
    }

    #[test]
    fn test_dict_comprehension_scope() {
        assert!(check("result = {k: v for k, v in items(extract_entities())}").is_ok());
    }

    // ── syntax vs security ──────────────────────────────

    #[test]
    fn test_syntax_error_reported() {
        let err = check("result = (1 + ").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
    }

    #[test]
    fn test_denylist_wins_over_lexer_errors() {
        for code in ["import os\nx = 'unterminated", "import os $", "x = open ?"] {
            assert_security(code);
        }
        // Denied words inside a closed literal stay allowed
        let err = check("x = 'import os' $").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
    }

    #[test]
    fn test_denylist_wins_over_syntax() {
        // Would be a parse error, but the token scan runs first
        assert_security("import os, sys as s");
    }
}
