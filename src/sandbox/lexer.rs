//! Lexer: tokenizes submitted code
//!
//! Produces the token stream consumed by the validator's denylist scan
//! and by the parser. Newlines are significant (statement separators)
//! except inside brackets.

use super::error::{SandboxError, SandboxResult};

/// A token produced by the lexer
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw text for names and numbers, decoded text for strings
    pub text: String,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            col,
        }
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }
}

/// Token types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Identifiers (keywords included) and literals
    Name,
    Int,
    Float,
    Str,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,

    // Structural
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
    Newline,

    // End of input
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Str => "string",
            Self::Plus => "'+'",
            Self::Minus => "'-'",
            Self::Star => "'*'",
            Self::Slash => "'/'",
            Self::DoubleSlash => "'//'",
            Self::Percent => "'%'",
            Self::EqEq => "'=='",
            Self::NotEq => "'!='",
            Self::Lt => "'<'",
            Self::Le => "'<='",
            Self::Gt => "'>'",
            Self::Ge => "'>='",
            Self::Assign => "'='",
            Self::LParen => "'('",
            Self::RParen => "')'",
            Self::LBracket => "'['",
            Self::RBracket => "']'",
            Self::LBrace => "'{'",
            Self::RBrace => "'}'",
            Self::Comma => "','",
            Self::Colon => "':'",
            Self::Dot => "'.'",
            Self::Semicolon => "';'",
            Self::Newline => "newline",
            Self::Eof => "end of input",
        };
        f.write_str(s)
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    bracket_depth: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            bracket_depth: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> SandboxResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();

            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Newline, "", self.line, self.col));
                tokens.push(Token::new(TokenKind::Eof, "", self.line, self.col));
                break;
            }

            if self.input[self.pos] == '\n' {
                let (line, col) = (self.line, self.col);
                self.advance();
                if self.bracket_depth == 0 {
                    tokens.push(Token::new(TokenKind::Newline, "\n", line, col));
                }
                continue;
            }

            let token = self.next_token()?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> SandboxResult<Token> {
        let ch = self.input[self.pos];
        let line = self.line;
        let col = self.col;

        let single = |lexer: &mut Self, kind: TokenKind, text: &str| -> SandboxResult<Token> {
            lexer.advance();
            Ok(Token::new(kind, text, line, col))
        };

        match ch {
            '+' => single(self, TokenKind::Plus, "+"),
            '-' => single(self, TokenKind::Minus, "-"),
            '%' => single(self, TokenKind::Percent, "%"),
            ',' => single(self, TokenKind::Comma, ","),
            ':' => single(self, TokenKind::Colon, ":"),
            ';' => single(self, TokenKind::Semicolon, ";"),
            '(' | '[' | '{' => {
                self.bracket_depth += 1;
                let kind = match ch {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                };
                single(self, kind, &ch.to_string())
            }
            ')' | ']' | '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                let kind = match ch {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                };
                single(self, kind, &ch.to_string())
            }
            '*' if self.peek_at(1) == Some('*') => Err(SandboxError::syntax(
                line,
                col,
                "operator '**' is not supported",
            )),
            '*' => single(self, TokenKind::Star, "*"),
            '/' if self.peek_at(1) == Some('/') => {
                self.advance();
                single(self, TokenKind::DoubleSlash, "//")
            }
            '/' => single(self, TokenKind::Slash, "/"),
            '=' if self.peek_at(1) == Some('=') => {
                self.advance();
                single(self, TokenKind::EqEq, "==")
            }
            '=' => single(self, TokenKind::Assign, "="),
            '!' if self.peek_at(1) == Some('=') => {
                self.advance();
                single(self, TokenKind::NotEq, "!=")
            }
            '<' if self.peek_at(1) == Some('=') => {
                self.advance();
                single(self, TokenKind::Le, "<=")
            }
            '<' => single(self, TokenKind::Lt, "<"),
            '>' if self.peek_at(1) == Some('=') => {
                self.advance();
                single(self, TokenKind::Ge, ">=")
            }
            '>' => single(self, TokenKind::Gt, ">"),
            '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.read_number(),
            '.' => single(self, TokenKind::Dot, "."),
            '"' | '\'' => self.read_string(false, line, col),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => self.read_name_or_prefixed_string(),
            _ => Err(SandboxError::syntax(
                line,
                col,
                format!("unexpected character '{ch}'"),
            )),
        }
    }

    fn read_name_or_prefixed_string(&mut self) -> SandboxResult<Token> {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();

        while let Some(c) = self.peek_at(0) {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let is_quote = matches!(self.peek_at(0), Some('"') | Some('\''));
        let lowered = text.to_ascii_lowercase();
        let is_prefix = !lowered.is_empty()
            && lowered.len() <= 2
            && lowered.chars().all(|c| matches!(c, 'r' | 'f' | 'b' | 'u'));

        if is_quote && is_prefix {
            if lowered.contains('f') {
                return Err(SandboxError::Security(
                    "formatted string literals are not permitted".into(),
                ));
            }
            if lowered.contains('b') {
                return Err(SandboxError::syntax(
                    line,
                    col,
                    "bytes literals are not supported",
                ));
            }
            return self.read_string(lowered.contains('r'), line, col);
        }

        Ok(Token::new(TokenKind::Name, text, line, col))
    }

    fn read_string(&mut self, raw: bool, line: usize, col: usize) -> SandboxResult<Token> {
        let quote = self.input[self.pos];
        self.advance(); // skip opening quote

        let mut text = String::new();
        loop {
            let Some(c) = self.peek_at(0) else {
                return Err(SandboxError::syntax(line, col, "unterminated string literal"));
            };
            if c == '\n' {
                return Err(SandboxError::syntax(line, col, "unterminated string literal"));
            }
            if c == quote {
                self.advance();
                break;
            }
            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    return Err(SandboxError::syntax(line, col, "unterminated string literal"));
                };
                self.advance();
                self.advance();
                if raw {
                    text.push('\\');
                    text.push(next);
                    continue;
                }
                match next {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\\' | '\'' | '"' => text.push(next),
                    other => {
                        text.push('\\');
                        text.push(other);
                    }
                }
                continue;
            }
            text.push(c);
            self.advance();
        }

        Ok(Token::new(TokenKind::Str, text, line, col))
    }

    fn read_number(&mut self) -> SandboxResult<Token> {
        let line = self.line;
        let col = self.col;
        let mut text = String::new();
        let mut is_float = false;

        self.take_digits(&mut text);
        if self.peek_at(0) == Some('.') && !self.peek_at(1).is_some_and(|c| c.is_alphabetic() || c == '_') {
            is_float = true;
            text.push('.');
            self.advance();
            self.take_digits(&mut text);
        }
        if matches!(self.peek_at(0), Some('e') | Some('E')) {
            let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..digit_at {
                    text.push(self.input[self.pos]);
                    self.advance();
                }
                self.take_digits(&mut text);
            }
        }

        if let Some(c) = self.peek_at(0) {
            if c.is_alphanumeric() || c == '_' {
                return Err(SandboxError::syntax(
                    line,
                    col,
                    format!("invalid numeric literal '{text}{c}'"),
                ));
            }
        }

        if is_float {
            Ok(Token::new(TokenKind::Float, text, line, col))
        } else if text.parse::<i64>().is_err() {
            Err(SandboxError::syntax(line, col, "integer literal too large"))
        } else {
            Ok(Token::new(TokenKind::Int, text, line, col))
        }
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek_at(0) {
            match c {
                '\n' => break,
                '#' => {
                    while self.peek_at(0).is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                c if c.is_whitespace() => self.advance(),
                _ => break,
            }
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(&c) = self.input.get(self.pos) {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }
}

/// Tokenize `input` in one call.
pub fn tokenize(input: &str) -> SandboxResult<Vec<Token>> {
    Lexer::new(input).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_assignment_call() {
        assert_eq!(
            kinds("result = f('x')"),
            vec![
                TokenKind::Name,
                TokenKind::Assign,
                TokenKind::Name,
                TokenKind::LParen,
                TokenKind::Str,
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a // b != c <= d"),
            vec![
                TokenKind::Name,
                TokenKind::DoubleSlash,
                TokenKind::Name,
                TokenKind::NotEq,
                TokenKind::Name,
                TokenKind::Le,
                TokenKind::Name,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_skipped() {
        let k = kinds("x = [1,\n 2]\ny = 3");
        let newlines = k.iter().filter(|k| **k == TokenKind::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_comments_ignored() {
        assert_eq!(
            kinds("# leading\nx = 1 # trailing"),
            vec![
                TokenKind::Newline,
                TokenKind::Name,
                TokenKind::Assign,
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("42 3.5 1e3 .5").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[2].kind, TokenKind::Float);
        assert_eq!(tokens[3].kind, TokenKind::Float);
        assert_eq!(tokens[3].text, ".5");
    }

    #[test]
    fn test_integer_overflow_is_syntax_error() {
        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#""a\n'b'" 'it\'s'"#).unwrap();
        assert_eq!(tokens[0].text, "a\n'b'");
        assert_eq!(tokens[1].text, "it's");
    }

    #[test]
    fn test_raw_string_keeps_backslashes() {
        let tokens = tokenize(r"r'\d+|\w'").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, r"\d+|\w");
    }

    #[test]
    fn test_fstring_is_security_violation() {
        let err = tokenize("f'{x}'").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = 'abc").unwrap_err();
        assert_eq!(err, SandboxError::syntax(1, 5, "unterminated string literal"));
    }

    #[test]
    fn test_unexpected_character_position() {
        let err = tokenize("x = 1\ny = $").unwrap_err();
        assert_eq!(err, SandboxError::syntax(2, 5, "unexpected character '$'"));
    }

    #[test]
    fn test_power_operator_rejected() {
        assert!(tokenize("2 ** 8").is_err());
    }
}
