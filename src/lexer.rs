// Hand-written lexer for ML source.
//
// Produces a flat token stream with spans. Whitespace and `//` comments are
// skipped. Double-quoted strings may contain `${expr}` interpolation holes;
// single-quoted strings are always literal.

use crate::ast::Span;
use crate::error::{CompileError, CompileResult};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Capability,
    Resource,
    Allow,
    To,
    Import,
    As,
    Function,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Return,
    Try,
    Except,
    Finally,
    Break,
    Continue,

    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    /// Double-quoted string containing `${...}` holes. Literal runs and the
    /// raw text of each hole alternate; the parser sub-parses the holes.
    Template(Vec<RawTemplatePart>),
    True,
    False,
    Null,

    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Assign,
    Question,

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawTemplatePart {
    Literal(String),
    /// Unparsed expression text from a `${...}` hole, with the offset of the
    /// first character so sub-parse errors point at the right place.
    Expr { text: String, offset: usize },
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier `{}`", s),
            TokenKind::Int(n) => write!(f, "number `{}`", n),
            TokenKind::Float(n) => write!(f, "number `{}`", n),
            TokenKind::Str(_) | TokenKind::Template(_) => write!(f, "string literal"),
            TokenKind::Eof => write!(f, "end of input"),
            other => write!(f, "`{}`", other.lexeme()),
        }
    }
}

impl TokenKind {
    /// Canonical source text for fixed tokens; used in error messages and by
    /// the AST printer.
    pub fn lexeme(&self) -> &'static str {
        match self {
            TokenKind::Capability => "capability",
            TokenKind::Resource => "resource",
            TokenKind::Allow => "allow",
            TokenKind::To => "to",
            TokenKind::Import => "import",
            TokenKind::As => "as",
            TokenKind::Function => "function",
            TokenKind::If => "if",
            TokenKind::Elif => "elif",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::Return => "return",
            TokenKind::Try => "try",
            TokenKind::Except => "except",
            TokenKind::Finally => "finally",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Eq => "==",
            TokenKind::Ne => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::And => "&&",
            TokenKind::Or => "||",
            TokenKind::Not => "!",
            TokenKind::Assign => "=",
            TokenKind::Question => "?",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub struct Lexer<'a> {
    input: Vec<char>,
    filename: &'a str,
    position: usize,
    line: usize,
    column: usize,
    current_char: Option<char>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &str, filename: &'a str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();

        Lexer {
            input: chars,
            filename,
            position: 0,
            line: 1,
            column: 1,
            current_char,
        }
    }

    fn advance(&mut self) {
        if self.current_char == Some('\n') {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn here(&self) -> (usize, usize, usize) {
        (self.position, self.line, self.column)
    }

    fn span_from(&self, start: (usize, usize, usize)) -> Span {
        Span::new(start.0, self.position, start.1, start.2)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse_error(message, self.filename, self.line, self.column)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while let Some(ch) = self.current_char {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }
            if self.current_char == Some('/') && self.peek(1) == Some('/') {
                while let Some(ch) = self.current_char {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    fn read_number(&mut self) -> CompileResult<TokenKind> {
        let mut text = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push(ch);
                self.advance();
            } else if ch == 'e' || ch == 'E' {
                // Scientific notation: e[+-]?digits
                let digits_at = if matches!(self.peek(1), Some('+') | Some('-')) {
                    2
                } else {
                    1
                };
                if !self.peek(digits_at).is_some_and(|c| c.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push(ch);
                self.advance();
                if matches!(self.current_char, Some('+') | Some('-')) {
                    text.push(self.current_char.unwrap());
                    self.advance();
                }
                while let Some(d) = self.current_char {
                    if d.is_ascii_digit() {
                        text.push(d);
                        self.advance();
                    } else {
                        break;
                    }
                }
                break;
            } else {
                break;
            }
        }

        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("invalid number literal `{}`", text)))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(format!("number literal `{}` is out of range", text)))
        }
    }

    fn read_escape(&mut self) -> CompileResult<char> {
        self.advance(); // consume backslash
        let escaped = self
            .current_char
            .ok_or_else(|| self.error("unterminated escape sequence"))?;
        let unescaped = match escaped {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            '$' => '$',
            other => other,
        };
        self.advance();
        Ok(unescaped)
    }

    /// Single-quoted string: no interpolation, standard escapes.
    fn read_plain_string(&mut self) -> CompileResult<TokenKind> {
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            match self.current_char {
                None => return Err(self.error("unterminated string literal")),
                Some('\'') => {
                    self.advance();
                    break;
                }
                Some('\\') => value.push(self.read_escape()?),
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }

        Ok(TokenKind::Str(value))
    }

    /// Double-quoted string: standard escapes plus `${expr}` holes.
    fn read_string(&mut self) -> CompileResult<TokenKind> {
        self.advance(); // opening quote
        let mut parts: Vec<RawTemplatePart> = Vec::new();
        let mut current = String::new();
        let mut has_interpolation = false;

        loop {
            match self.current_char {
                None => return Err(self.error("unterminated string literal")),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => current.push(self.read_escape()?),
                Some('$') if self.peek(1) == Some('{') => {
                    has_interpolation = true;
                    if !current.is_empty() {
                        parts.push(RawTemplatePart::Literal(std::mem::take(&mut current)));
                    }
                    self.advance(); // $
                    self.advance(); // {
                    let offset = self.position;
                    let mut expr = String::new();
                    let mut depth = 1usize;
                    loop {
                        match self.current_char {
                            None => return Err(self.error("unterminated `${` interpolation")),
                            Some('{') => {
                                depth += 1;
                                expr.push('{');
                                self.advance();
                            }
                            Some('}') => {
                                depth -= 1;
                                self.advance();
                                if depth == 0 {
                                    break;
                                }
                                expr.push('}');
                            }
                            Some(ch) => {
                                expr.push(ch);
                                self.advance();
                            }
                        }
                    }
                    if expr.trim().is_empty() {
                        return Err(self.error("empty `${}` interpolation"));
                    }
                    parts.push(RawTemplatePart::Expr { text: expr, offset });
                }
                Some(ch) => {
                    current.push(ch);
                    self.advance();
                }
            }
        }

        if has_interpolation {
            if !current.is_empty() {
                parts.push(RawTemplatePart::Literal(current));
            }
            Ok(TokenKind::Template(parts))
        } else {
            Ok(TokenKind::Str(current))
        }
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut ident = String::new();

        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "capability" => TokenKind::Capability,
            "resource" => TokenKind::Resource,
            "allow" => TokenKind::Allow,
            "to" => TokenKind::To,
            "import" => TokenKind::Import,
            "as" => TokenKind::As,
            "function" => TokenKind::Function,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "return" => TokenKind::Return,
            "try" => TokenKind::Try,
            "except" => TokenKind::Except,
            "finally" => TokenKind::Finally,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(ident),
        }
    }

    pub fn next_token(&mut self) -> CompileResult<Token> {
        self.skip_whitespace_and_comments();
        let start = self.here();

        let kind = match self.current_char {
            None => TokenKind::Eof,
            Some('"') => self.read_string()?,
            Some('\'') => self.read_plain_string()?,
            Some(ch) if ch.is_ascii_digit() => self.read_number()?,
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.read_identifier(),
            Some('+') => {
                self.advance();
                TokenKind::Plus
            }
            Some('-') => {
                self.advance();
                TokenKind::Minus
            }
            Some('*') => {
                self.advance();
                TokenKind::Star
            }
            Some('/') => {
                self.advance();
                TokenKind::Slash
            }
            Some('%') => {
                self.advance();
                TokenKind::Percent
            }
            Some('=') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::Eq
            }
            Some('=') => {
                self.advance();
                TokenKind::Assign
            }
            Some('!') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::Ne
            }
            Some('!') => {
                self.advance();
                TokenKind::Not
            }
            Some('<') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::Le
            }
            Some('<') => {
                self.advance();
                TokenKind::Lt
            }
            Some('>') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::Ge
            }
            Some('>') => {
                self.advance();
                TokenKind::Gt
            }
            Some('&') if self.peek(1) == Some('&') => {
                self.advance();
                self.advance();
                TokenKind::And
            }
            Some('&') => {
                return Err(self.error("unexpected `&`; did you mean `&&`?"));
            }
            Some('|') if self.peek(1) == Some('|') => {
                self.advance();
                self.advance();
                TokenKind::Or
            }
            Some('|') => {
                return Err(self.error("unexpected `|`; did you mean `||`?"));
            }
            Some('?') => {
                self.advance();
                TokenKind::Question
            }
            Some('(') => {
                self.advance();
                TokenKind::LParen
            }
            Some(')') => {
                self.advance();
                TokenKind::RParen
            }
            Some('{') => {
                self.advance();
                TokenKind::LBrace
            }
            Some('}') => {
                self.advance();
                TokenKind::RBrace
            }
            Some('[') => {
                self.advance();
                TokenKind::LBracket
            }
            Some(']') => {
                self.advance();
                TokenKind::RBracket
            }
            Some(',') => {
                self.advance();
                TokenKind::Comma
            }
            Some('.') => {
                self.advance();
                TokenKind::Dot
            }
            Some(':') => {
                self.advance();
                TokenKind::Colon
            }
            Some(';') => {
                self.advance();
                TokenKind::Semicolon
            }
            Some(ch) => {
                return Err(self.error(format!("unexpected character `{}`", ch)));
            }
        };

        Ok(Token {
            kind,
            span: self.span_from(start),
        })
    }

    pub fn tokenize(&mut self) -> CompileResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source, "test.ml")
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_lexer_basic() {
        let toks = kinds("x = 1 + 2;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("x".to_string()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_keywords_and_spans() {
        let mut lexer = Lexer::new("capability FileRead {\n  resource \"a\";\n}", "test.ml");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Capability);
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[0].span.column, 1);
        assert_eq!(tokens[3].kind, TokenKind::Resource);
        assert_eq!(tokens[3].span.line, 2);
        assert_eq!(tokens[3].span.column, 3);
    }

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(kinds("42;")[0], TokenKind::Int(42));
        assert_eq!(kinds("3.25;")[0], TokenKind::Float(3.25));
        assert_eq!(kinds("1e3;")[0], TokenKind::Float(1000.0));
        assert_eq!(kinds("2.5e-2;")[0], TokenKind::Float(0.025));
    }

    #[test]
    fn test_identifier_with_e_suffix_is_not_exponent() {
        // `12e` with no exponent digits: the number ends before the `e`.
        let toks = kinds("x = 12e;");
        assert_eq!(toks[2], TokenKind::Int(12));
        assert_eq!(toks[3], TokenKind::Ident("e".to_string()));
    }

    #[test]
    fn test_lexer_strings_both_quotes() {
        assert_eq!(
            kinds(r#""hello\n";"#)[0],
            TokenKind::Str("hello\n".to_string())
        );
        assert_eq!(kinds("'wo\\'rld';")[0], TokenKind::Str("wo'rld".to_string()));
    }

    #[test]
    fn test_lexer_interpolation() {
        let toks = kinds(r#""a ${x + 1} b";"#);
        match &toks[0] {
            TokenKind::Template(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], RawTemplatePart::Literal("a ".to_string()));
                assert!(matches!(&parts[1], RawTemplatePart::Expr { text, .. } if text == "x + 1"));
                assert_eq!(parts[2], RawTemplatePart::Literal(" b".to_string()));
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_single_quotes_never_interpolate() {
        assert_eq!(kinds("'a ${x}';")[0], TokenKind::Str("a ${x}".to_string()));
    }

    #[test]
    fn test_escaped_dollar_is_literal() {
        assert_eq!(
            kinds(r#""a \${x}";"#)[0],
            TokenKind::Str("a ${x}".to_string())
        );
    }

    #[test]
    fn test_lexer_comments() {
        let toks = kinds("x = 1; // trailing\n// full line\ny = 2;");
        assert_eq!(toks.len(), 9);
        assert_eq!(toks[4], TokenKind::Ident("y".to_string()));
    }

    #[test]
    fn test_lexer_operators() {
        let toks = kinds("a == b != c <= d >= e && f || !g ? h : i;");
        assert!(toks.contains(&TokenKind::Eq));
        assert!(toks.contains(&TokenKind::Ne));
        assert!(toks.contains(&TokenKind::Le));
        assert!(toks.contains(&TokenKind::Ge));
        assert!(toks.contains(&TokenKind::And));
        assert!(toks.contains(&TokenKind::Or));
        assert!(toks.contains(&TokenKind::Not));
        assert!(toks.contains(&TokenKind::Question));
        assert!(toks.contains(&TokenKind::Colon));
    }

    #[test]
    fn test_lexer_unexpected_character() {
        let err = Lexer::new("x = #;", "test.ml").tokenize().unwrap_err();
        assert!(err.message.contains('#'));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(Lexer::new("\"abc", "test.ml").tokenize().is_err());
    }
}
