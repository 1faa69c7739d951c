//! Tokenizer for production text.

use crate::error::ParseError;
use crate::symbol::is_constituent;

/// Byte range of a token in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBrace,
    RBrace,
    Caret,
    Dot,
    Arrow,
    Minus,
    Plus,
    Bang,
    Tilde,
    Equal,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    NotEqual,
    SameType,
    DisjOpen,
    DisjClose,
    /// `<name>`, stored without the angle brackets.
    Variable(String),
    /// Unquoted constant or number.
    Symbol(String),
    /// `|...|` constant; never a number.
    Quoted(String),
    /// `"..."` documentation string.
    Doc(String),
    /// `:o-support` and friends, stored without the colon.
    Flag(String),
}

impl TokenKind {
    /// Human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
            TokenKind::LBrace => "`{`".into(),
            TokenKind::RBrace => "`}`".into(),
            TokenKind::Caret => "`^`".into(),
            TokenKind::Dot => "`.`".into(),
            TokenKind::Arrow => "`-->`".into(),
            TokenKind::Minus => "`-`".into(),
            TokenKind::Plus => "`+`".into(),
            TokenKind::Bang => "`!`".into(),
            TokenKind::Tilde => "`~`".into(),
            TokenKind::Equal => "`=`".into(),
            TokenKind::Less => "`<`".into(),
            TokenKind::Greater => "`>`".into(),
            TokenKind::LessEqual => "`<=`".into(),
            TokenKind::GreaterEqual => "`>=`".into(),
            TokenKind::NotEqual => "`<>`".into(),
            TokenKind::SameType => "`<=>`".into(),
            TokenKind::DisjOpen => "`<<`".into(),
            TokenKind::DisjClose => "`>>`".into(),
            TokenKind::Variable(v) => format!("variable <{v}>"),
            TokenKind::Symbol(s) => format!("`{s}`"),
            TokenKind::Quoted(s) => format!("|{s}|"),
            TokenKind::Doc(_) => "documentation string".into(),
            TokenKind::Flag(f) => format!("flag :{f}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Split `src` into tokens. `#` starts a comment running to end of line.
pub fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
    }
    .run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek_at(0) {
            let start = self.pos;
            if c.is_whitespace() {
                self.pos += c.len_utf8();
                continue;
            }
            if c == '#' {
                while let Some(c) = self.peek_at(0) {
                    self.pos += c.len_utf8();
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            let kind = match c {
                '(' => self.fixed(1, TokenKind::LParen),
                ')' => self.fixed(1, TokenKind::RParen),
                '{' => self.fixed(1, TokenKind::LBrace),
                '}' => self.fixed(1, TokenKind::RBrace),
                '^' => self.fixed(1, TokenKind::Caret),
                '.' => self.fixed(1, TokenKind::Dot),
                '+' => self.fixed(1, TokenKind::Plus),
                '!' => self.fixed(1, TokenKind::Bang),
                '~' => self.fixed(1, TokenKind::Tilde),
                '=' => self.fixed(1, TokenKind::Equal),
                '-' => {
                    if self.starts_with("-->") {
                        self.fixed(3, TokenKind::Arrow)
                    } else if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
                        self.number_or_symbol()
                    } else {
                        self.fixed(1, TokenKind::Minus)
                    }
                }
                '<' => self.less()?,
                '>' => {
                    if self.starts_with(">>") {
                        self.fixed(2, TokenKind::DisjClose)
                    } else if self.starts_with(">=") {
                        self.fixed(2, TokenKind::GreaterEqual)
                    } else {
                        self.fixed(1, TokenKind::Greater)
                    }
                }
                '|' => self.quoted('|', "quoted constant", TokenKind::Quoted)?,
                '"' => self.quoted('"', "documentation string", TokenKind::Doc)?,
                ':' if self.peek_at(1).is_some_and(|d| d.is_ascii_alphabetic()) => {
                    self.pos += 1;
                    let word = self.constituent_run();
                    TokenKind::Flag(word)
                }
                c if is_constituent(c) => self.number_or_symbol(),
                other => {
                    return Err(ParseError::unexpected(
                        format!("character `{other}`"),
                        "a token",
                        start,
                        other.len_utf8(),
                    ));
                }
            };
            tokens.push(Token {
                kind,
                span: Span {
                    start,
                    end: self.pos,
                },
            });
        }
        Ok(tokens)
    }

    fn fixed(&mut self, len: usize, kind: TokenKind) -> TokenKind {
        self.pos += len;
        kind
    }

    fn constituent_run(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_at(0) {
            if !is_constituent(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        self.src[start..self.pos].to_string()
    }

    /// A constituent run; numbers may also contain `.`, exponents and a sign.
    fn number_or_symbol(&mut self) -> TokenKind {
        let start = self.pos;
        let numeric = self.bytes[start] == b'-' || self.bytes[start].is_ascii_digit();
        if !numeric {
            return TokenKind::Symbol(self.constituent_run());
        }
        self.pos += 1;
        let mut prev = self.bytes[start];
        while let Some(c) = self.peek_at(0) {
            let exponent_sign = (c == '-' || c == '+') && (prev == b'e' || prev == b'E');
            let decimal_point =
                c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit());
            if !(is_constituent(c) || exponent_sign || decimal_point) {
                break;
            }
            prev = c as u8;
            self.pos += c.len_utf8();
        }
        TokenKind::Symbol(self.src[start..self.pos].to_string())
    }

    fn less(&mut self) -> Result<TokenKind, ParseError> {
        if self.starts_with("<<") {
            return Ok(self.fixed(2, TokenKind::DisjOpen));
        }
        if self.starts_with("<=>") {
            return Ok(self.fixed(3, TokenKind::SameType));
        }
        if self.starts_with("<=") {
            return Ok(self.fixed(2, TokenKind::LessEqual));
        }
        if self.starts_with("<>") {
            return Ok(self.fixed(2, TokenKind::NotEqual));
        }
        // `<name>` is a variable only when the run is closed by `>`.
        let rest = &self.src[self.pos + 1..];
        let run: usize = rest
            .chars()
            .take_while(|c| is_constituent(*c))
            .map(char::len_utf8)
            .sum();
        if run > 0 && rest[run..].starts_with('>') {
            let name = rest[..run].to_string();
            self.pos += run + 2;
            return Ok(TokenKind::Variable(name));
        }
        Ok(self.fixed(1, TokenKind::Less))
    }

    fn quoted(
        &mut self,
        delim: char,
        what: &str,
        make: fn(String) -> TokenKind,
    ) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek_at(0) {
                None => {
                    return Err(ParseError::Unterminated {
                        what: what.to_string(),
                        offset: start,
                        span: (start, 1).into(),
                    });
                }
                Some('\\') => {
                    self.pos += 1;
                    if let Some(escaped) = self.peek_at(0) {
                        text.push(escaped);
                        self.pos += escaped.len_utf8();
                    }
                }
                Some(c) if c == delim => {
                    self.pos += 1;
                    return Ok(make(text));
                }
                Some(c) => {
                    text.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn variables_and_relations() {
        assert_eq!(
            kinds("<s> < <x> <= 3 <> <=> << a >> >= >"),
            vec![
                TokenKind::Variable("s".into()),
                TokenKind::Less,
                TokenKind::Variable("x".into()),
                TokenKind::LessEqual,
                TokenKind::Symbol("3".into()),
                TokenKind::NotEqual,
                TokenKind::SameType,
                TokenKind::DisjOpen,
                TokenKind::Symbol("a".into()),
                TokenKind::DisjClose,
                TokenKind::GreaterEqual,
                TokenKind::Greater,
            ]
        );
    }

    #[test]
    fn minus_forms() {
        assert_eq!(
            kinds("-^a -(x) --> -5 -2.5e-3"),
            vec![
                TokenKind::Minus,
                TokenKind::Caret,
                TokenKind::Symbol("a".into()),
                TokenKind::Minus,
                TokenKind::LParen,
                TokenKind::Symbol("x".into()),
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Symbol("-5".into()),
                TokenKind::Symbol("-2.5e-3".into()),
            ]
        );
    }

    #[test]
    fn paths_split_on_dot() {
        assert_eq!(
            kinds("^io.input-link 1.5"),
            vec![
                TokenKind::Caret,
                TokenKind::Symbol("io".into()),
                TokenKind::Dot,
                TokenKind::Symbol("input-link".into()),
                TokenKind::Symbol("1.5".into()),
            ]
        );
    }

    #[test]
    fn quoted_doc_flag_and_comment() {
        assert_eq!(
            kinds("|a \\| b| \"doc\" :o-support # trailing\n x"),
            vec![
                TokenKind::Quoted("a | b".into()),
                TokenKind::Doc("doc".into()),
                TokenKind::Flag("o-support".into()),
                TokenKind::Symbol("x".into()),
            ]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let tokens = tokenize("  (<s>").unwrap();
        assert_eq!(tokens[0].span, Span { start: 2, end: 3 });
        assert_eq!(tokens[1].span, Span { start: 3, end: 6 });
    }

    #[test]
    fn unterminated_quote_reports_offset() {
        let err = tokenize("(a |oops").unwrap_err();
        assert_eq!(err.offset(), 3);
    }
}
