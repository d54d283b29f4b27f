//! Lightweight lexical scanner used to place instrumentation hooks
//!
//! This is not a parser. It only knows enough about comments, string-like
//! literals and delimiters of each syntax family to find identifiers and
//! brace pairs reliably, and it produces byte offsets into the original text
//! so hooks can be inserted without disturbing line numbers.

use thiserror::Error;

/// Lexical family of a source language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    JavaScript,
    /// C and C++
    CFamily,
    Rust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    /// Rust lifetime or loop label (`'outer`)
    Lifetime,
    Punct,
    /// String, char, number, regex or template literal
    Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

impl Token<'_> {
    pub fn is_punct(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }

    pub fn is_ident(&self, text: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == text
    }
}

/// Why a source could not be scanned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("unterminated {what} starting at byte {at}")]
    Unterminated { what: &'static str, at: usize },
    #[error("unbalanced `{delim}` at byte {at}")]
    Unbalanced { delim: char, at: usize },
}

/// JavaScript keywords after which a `/` starts a regex literal
const REGEX_PREFIX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "of", "new", "delete", "void", "throw",
    "instanceof", "yield", "await",
];

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    syntax: Syntax,
    tokens: Vec<Token<'a>>,
    /// Open `${` substitutions of JavaScript template literals, with their brace depth
    templates: Vec<usize>,
}

/// Split `source` into tokens, skipping whitespace, comments and preprocessor lines
pub fn tokenize(source: &str, syntax: Syntax) -> Result<Vec<Token<'_>>, ScanError> {
    let mut scanner = Scanner {
        src: source,
        bytes: source.as_bytes(),
        pos: 0,
        syntax,
        tokens: Vec::new(),
        templates: Vec::new(),
    };
    scanner.run()?;
    Ok(scanner.tokens)
}

fn is_ident_start(b: u8, syntax: Syntax) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 || (b == b'$' && syntax != Syntax::Rust)
}

fn is_ident_continue(b: u8, syntax: Syntax) -> bool {
    is_ident_start(b, syntax) || b.is_ascii_digit()
}

impl<'a> Scanner<'a> {
    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.tokens.push(Token {
            kind,
            text: &self.src[start..self.pos],
            start,
            end: self.pos,
        });
    }

    fn run(&mut self) -> Result<(), ScanError> {
        if self.syntax == Syntax::JavaScript && self.src.starts_with("#!") {
            self.skip_line();
        }

        while let Some(b) = self.peek(0) {
            let start = self.pos;
            match b {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'/' if self.peek(1) == Some(b'/') => self.skip_line(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                b'#' if self.syntax == Syntax::CFamily && self.at_line_start() => {
                    self.skip_directive()
                }
                b'}' if self.syntax == Syntax::JavaScript && self.templates.last() == Some(&0) => {
                    self.templates.pop();
                    self.pos += 1;
                    self.scan_template(start)?;
                }
                b'`' if self.syntax == Syntax::JavaScript => {
                    self.pos += 1;
                    self.scan_template(start)?;
                }
                b'"' => {
                    self.scan_quoted(b'"')?;
                    self.push(TokenKind::Literal, start);
                }
                b'\'' if self.syntax == Syntax::Rust => self.scan_char_or_lifetime()?,
                b'\'' => {
                    self.scan_quoted(b'\'')?;
                    self.push(TokenKind::Literal, start);
                }
                b'/' if self.syntax == Syntax::JavaScript && self.regex_allowed() => {
                    self.scan_regex()?;
                    self.push(TokenKind::Literal, start);
                }
                b if is_ident_start(b, self.syntax) => self.scan_ident_or_prefixed()?,
                b if b.is_ascii_digit() => {
                    self.scan_number();
                    self.push(TokenKind::Literal, start);
                }
                b'.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => {
                    self.scan_number();
                    self.push(TokenKind::Literal, start);
                }
                _ => self.scan_punct(),
            }
        }

        if !self.templates.is_empty() {
            return Err(ScanError::Unterminated {
                what: "template substitution",
                at: self.src.len(),
            });
        }
        Ok(())
    }

    fn at_line_start(&self) -> bool {
        self.bytes[..self.pos]
            .iter()
            .rev()
            .take_while(|&&b| b != b'\n')
            .all(|b| b.is_ascii_whitespace())
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek(0) {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_directive(&mut self) {
        while let Some(b) = self.peek(0) {
            match b {
                b'\\' if self.peek(1) == Some(b'\n') => self.pos += 2,
                b'\\' if self.peek(1) == Some(b'\r') && self.peek(2) == Some(b'\n') => {
                    self.pos += 3
                }
                b'\n' => break,
                b'/' if self.peek(1) == Some(b'*') => {
                    // a block comment may continue the directive onto later lines
                    if self.skip_block_comment().is_err() {
                        self.pos = self.bytes.len();
                    }
                }
                _ => self.pos += 1,
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        let nested = self.syntax == Syntax::Rust;
        let mut depth = 0usize;
        while self.pos < self.bytes.len() {
            if self.peek(0) == Some(b'/') && self.peek(1) == Some(b'*') {
                if depth == 0 || nested {
                    depth += 1;
                }
                self.pos += 2;
            } else if self.peek(0) == Some(b'*') && self.peek(1) == Some(b'/') {
                depth -= 1;
                self.pos += 2;
                if depth == 0 {
                    return Ok(());
                }
            } else {
                self.pos += 1;
            }
        }
        Err(ScanError::Unterminated {
            what: "block comment",
            at: start,
        })
    }

    /// Quoted literal starting at the opening quote
    fn scan_quoted(&mut self, quote: u8) -> Result<(), ScanError> {
        let start = self.pos;
        let multiline = self.syntax == Syntax::Rust;
        self.pos += 1;
        while let Some(b) = self.peek(0) {
            match b {
                b'\\' => self.pos += 2,
                b'\n' if !multiline => break,
                b if b == quote => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(ScanError::Unterminated {
            what: if quote == b'"' { "string" } else { "character literal" },
            at: start,
        })
    }

    /// Template literal text, positioned just after the backtick or closing brace
    fn scan_template(&mut self, start: usize) -> Result<(), ScanError> {
        while let Some(b) = self.peek(0) {
            match b {
                b'\\' => self.pos += 2,
                b'`' => {
                    self.pos += 1;
                    self.push(TokenKind::Literal, start);
                    return Ok(());
                }
                b'$' if self.peek(1) == Some(b'{') => {
                    self.pos += 2;
                    self.templates.push(0);
                    self.push(TokenKind::Literal, start);
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(ScanError::Unterminated {
            what: "template literal",
            at: start,
        })
    }

    fn regex_allowed(&self) -> bool {
        match self.tokens.last() {
            None => true,
            Some(token) => match token.kind {
                TokenKind::Punct => !matches!(token.text, ")" | "]"),
                TokenKind::Ident => REGEX_PREFIX_KEYWORDS.contains(&token.text),
                TokenKind::Literal | TokenKind::Lifetime => false,
            },
        }
    }

    fn scan_regex(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        let mut in_class = false;
        self.pos += 1;
        while let Some(b) = self.peek(0) {
            match b {
                b'\\' => self.pos += 2,
                b'[' => {
                    in_class = true;
                    self.pos += 1;
                }
                b']' => {
                    in_class = false;
                    self.pos += 1;
                }
                b'\n' => break,
                b'/' if !in_class => {
                    self.pos += 1;
                    while self.peek(0).is_some_and(|b| is_ident_continue(b, self.syntax)) {
                        self.pos += 1;
                    }
                    return Ok(());
                }
                _ => self.pos += 1,
            }
        }
        Err(ScanError::Unterminated {
            what: "regular expression",
            at: start,
        })
    }

    fn scan_char_or_lifetime(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        if self.peek(1) == Some(b'\\') {
            self.scan_quoted(b'\'')?;
            self.push(TokenKind::Literal, start);
            return Ok(());
        }

        let next = self.src[start + 1..].chars().next();
        if let Some(c) = next {
            let after = start + 1 + c.len_utf8();
            if self.bytes.get(after) == Some(&b'\'') {
                self.pos = after + 1;
                self.push(TokenKind::Literal, start);
                return Ok(());
            }
        }

        if self.peek(1).is_some_and(|b| is_ident_start(b, self.syntax)) {
            self.pos += 1;
            while self.peek(0).is_some_and(|b| is_ident_continue(b, self.syntax)) {
                self.pos += 1;
            }
            self.push(TokenKind::Lifetime, start);
            return Ok(());
        }

        Err(ScanError::Unterminated {
            what: "character literal",
            at: start,
        })
    }

    fn scan_ident_or_prefixed(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        while self.peek(0).is_some_and(|b| is_ident_continue(b, self.syntax)) {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];
        let next = self.peek(0);

        match self.syntax {
            Syntax::CFamily => match (word, next) {
                ("R" | "u8R" | "uR" | "UR" | "LR", Some(b'"')) => {
                    self.scan_cpp_raw_string(start)?;
                    return Ok(());
                }
                ("u8" | "u" | "U" | "L", Some(q @ (b'"' | b'\''))) => {
                    self.scan_quoted(q)?;
                    self.push(TokenKind::Literal, start);
                    return Ok(());
                }
                _ => {}
            },
            Syntax::Rust => match (word, next) {
                ("r", Some(b'#')) if self.peek(1).is_some_and(|b| is_ident_start(b, self.syntax)) => {
                    // raw identifier
                    self.pos += 1;
                    while self.peek(0).is_some_and(|b| is_ident_continue(b, self.syntax)) {
                        self.pos += 1;
                    }
                    self.push(TokenKind::Ident, start);
                    return Ok(());
                }
                ("r" | "br" | "cr", Some(b'#' | b'"')) => {
                    self.scan_rust_raw_string(start)?;
                    return Ok(());
                }
                ("b" | "c", Some(b'"')) => {
                    self.scan_quoted(b'"')?;
                    self.push(TokenKind::Literal, start);
                    return Ok(());
                }
                ("b", Some(b'\'')) => {
                    self.scan_quoted(b'\'')?;
                    self.push(TokenKind::Literal, start);
                    return Ok(());
                }
                _ => {}
            },
            Syntax::JavaScript => {}
        }

        self.push(TokenKind::Ident, start);
        Ok(())
    }

    /// `R"delim( ... )delim"`, positioned at the opening quote
    fn scan_cpp_raw_string(&mut self, start: usize) -> Result<(), ScanError> {
        let open = self.pos + 1;
        let paren = self.src[open..]
            .find('(')
            .map(|offset| open + offset)
            .ok_or(ScanError::Unterminated {
                what: "raw string",
                at: start,
            })?;
        let closing = format!("){}\"", &self.src[open..paren]);
        let end = self.src[paren..]
            .find(&closing)
            .map(|offset| paren + offset + closing.len())
            .ok_or(ScanError::Unterminated {
                what: "raw string",
                at: start,
            })?;
        self.pos = end;
        self.push(TokenKind::Literal, start);
        Ok(())
    }

    /// `r#"..."#`, positioned just after the prefix
    fn scan_rust_raw_string(&mut self, start: usize) -> Result<(), ScanError> {
        let mut hashes = 0;
        while self.peek(0) == Some(b'#') {
            hashes += 1;
            self.pos += 1;
        }
        if self.peek(0) != Some(b'"') {
            return Err(ScanError::Unterminated {
                what: "raw string",
                at: start,
            });
        }
        self.pos += 1;
        let closing = format!("\"{}", "#".repeat(hashes));
        match self.src[self.pos..].find(&closing) {
            Some(offset) => {
                self.pos += offset + closing.len();
                self.push(TokenKind::Literal, start);
                Ok(())
            }
            None => Err(ScanError::Unterminated {
                what: "raw string",
                at: start,
            }),
        }
    }

    fn scan_number(&mut self) {
        let hex = self.peek(0) == Some(b'0') && matches!(self.peek(1), Some(b'x' | b'X'));
        while let Some(b) = self.peek(0) {
            let prev = if self.pos > 0 { self.bytes[self.pos - 1] } else { 0 };
            let advance = match b {
                b if b.is_ascii_alphanumeric() || b == b'_' => true,
                b'.' => self.peek(1).is_some_and(|n| n.is_ascii_digit()),
                b'\'' => {
                    self.syntax == Syntax::CFamily
                        && self.peek(1).is_some_and(|n| n.is_ascii_alphanumeric())
                }
                b'+' | b'-' => {
                    if hex {
                        matches!(prev, b'p' | b'P')
                    } else {
                        matches!(prev, b'e' | b'E')
                    }
                }
                _ => false,
            };
            if !advance {
                break;
            }
            self.pos += 1;
        }
    }

    fn scan_punct(&mut self) {
        let start = self.pos;
        let two = self.src.get(self.pos..self.pos + 2);
        let width = match two {
            Some("=>") | Some("->") => 2,
            Some("::") if self.syntax != Syntax::JavaScript => 2,
            _ => self.src[self.pos..].chars().next().map_or(1, char::len_utf8),
        };

        if self.syntax == Syntax::JavaScript {
            match self.bytes[self.pos] {
                b'{' => {
                    if let Some(depth) = self.templates.last_mut() {
                        *depth += 1;
                    }
                }
                b'}' => {
                    if let Some(depth) = self.templates.last_mut() {
                        *depth = depth.saturating_sub(1);
                    }
                }
                _ => {}
            }
        }

        self.pos += width;
        self.push(TokenKind::Punct, start);
    }
}

/// Map every bracket token to the index of its partner
pub fn pair_delimiters(tokens: &[Token<'_>]) -> Result<Vec<Option<usize>>, ScanError> {
    let mut partners = vec![None; tokens.len()];
    let mut stack: Vec<usize> = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Punct {
            continue;
        }
        let expected_open = match token.text {
            "(" | "[" | "{" => {
                stack.push(idx);
                continue;
            }
            ")" => "(",
            "]" => "[",
            "}" => "{",
            _ => continue,
        };
        match stack.pop() {
            Some(open) if tokens[open].text == expected_open => {
                partners[open] = Some(idx);
                partners[idx] = Some(open);
            }
            _ => {
                return Err(ScanError::Unbalanced {
                    delim: token.text.chars().next().unwrap_or('?'),
                    at: token.start,
                })
            }
        }
    }

    match stack.pop() {
        Some(open) => Err(ScanError::Unbalanced {
            delim: tokens[open].text.chars().next().unwrap_or('?'),
            at: tokens[open].start,
        }),
        None => Ok(partners),
    }
}

/// Innermost enclosing `{` of every token (None at top level)
pub fn enclosing_braces(tokens: &[Token<'_>]) -> Vec<Option<usize>> {
    let mut enclosing = Vec::with_capacity(tokens.len());
    let mut stack: Vec<usize> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_punct("}") {
            stack.pop();
        }
        enclosing.push(stack.last().copied());
        if token.is_punct("{") {
            stack.push(idx);
        }
    }
    enclosing
}

/// A text insertion (and optional removal) at a byte offset of the original source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub at: usize,
    pub remove: usize,
    pub text: String,
}

impl Edit {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            at,
            remove: 0,
            text: text.into(),
        }
    }

    pub fn replace(at: usize, remove: usize, text: impl Into<String>) -> Self {
        Self {
            at,
            remove,
            text: text.into(),
        }
    }
}

/// Apply edits in offset order; edits at the same offset keep their relative order
pub fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|edit| edit.at);
    let extra: usize = edits.iter().map(|edit| edit.text.len()).sum();
    let mut out = String::with_capacity(source.len() + extra);
    let mut cursor = 0;
    for edit in edits {
        if edit.at < cursor || edit.at > source.len() {
            continue;
        }
        out.push_str(&source[cursor..edit.at]);
        out.push_str(&edit.text);
        cursor = (edit.at + edit.remove).min(source.len());
    }
    out.push_str(&source[cursor..]);
    out
}

/// Whether the token before `idx` ends a statement (or there is none)
pub fn at_statement_start(tokens: &[Token<'_>], idx: usize) -> bool {
    match idx.checked_sub(1).map(|prev| &tokens[prev]) {
        None => true,
        Some(prev) => prev.kind == TokenKind::Punct && matches!(prev.text, ";" | "{" | "}"),
    }
}
