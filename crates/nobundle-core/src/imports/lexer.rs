//! Import specifier lexer.
//!
//! A single pass over the source bytes that finds the string literal of
//! every `import`/`export ... from` statement and every `import("...")`
//! call, reporting byte offsets so the caller can splice replacements in
//! place. It is not a parser: comments, strings, template literals and
//! regular expressions are skipped just well enough that their contents
//! never produce false matches.

use thiserror::Error;

/// How a specifier was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from "a"`, `import { x } from "a"`, `import * as x from "a"`.
    Static,
    /// `export * from "a"`, `export { x } from "a"`.
    ReExport,
    /// `import "a"`.
    SideEffect,
    /// `import("a")` with a plain string literal argument.
    DynamicLiteral,
}

/// A specifier found in source. `start..end` covers the text between the
/// quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpecifier {
    pub start: usize,
    pub end: usize,
    pub kind: ImportKind,
}

impl ImportSpecifier {
    /// Specifier text as written.
    #[must_use]
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// Lexing failure. Offsets point at the opening delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated string literal at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("unterminated block comment at offset {offset}")]
    UnterminatedComment { offset: usize },

    #[error("unterminated template literal at offset {offset}")]
    UnterminatedTemplate { offset: usize },

    #[error("unterminated regular expression at offset {offset}")]
    UnterminatedRegex { offset: usize },
}

/// Scan `source` for import specifiers, in source order.
pub fn lex_imports(source: &str) -> Result<Vec<ImportSpecifier>, LexError> {
    Lexer::new(source.as_bytes()).run()
}

/// What the previous significant token was. Decides whether `/` starts a
/// regex and whether `import` is a member name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    Start,
    Dot,
    Operator,
    Keyword,
    Value,
}

/// Keywords after which an expression (and thus a regex) may begin.
const EXPRESSION_KEYWORDS: &[&[u8]] = &[
    b"return",
    b"typeof",
    b"instanceof",
    b"in",
    b"of",
    b"new",
    b"delete",
    b"void",
    b"throw",
    b"case",
    b"do",
    b"else",
    b"yield",
    b"await",
];

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    last: Last,
    brace_depth: usize,
    /// Open template interpolations: (brace depth at `${`, template start).
    templates: Vec<(usize, usize)>,
    out: Vec<ImportSpecifier>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            last: Last::Start,
            brace_depth: 0,
            templates: Vec::new(),
            out: Vec::new(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn run(mut self) -> Result<Vec<ImportSpecifier>, LexError> {
        while let Some(b) = self.peek(0) {
            match b {
                b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c => self.pos += 1,
                b'/' => match self.peek(1) {
                    Some(b'/') => self.skip_line_comment(),
                    Some(b'*') => self.skip_block_comment()?,
                    _ if self.regex_allowed() => {
                        self.skip_regex()?;
                        self.last = Last::Value;
                    }
                    _ => {
                        self.pos += 1;
                        self.last = Last::Operator;
                    }
                },
                b'\'' | b'"' => {
                    self.read_string()?;
                    self.last = Last::Value;
                }
                b'`' => {
                    let start = self.pos;
                    self.pos += 1;
                    self.scan_template(start)?;
                }
                b'{' => {
                    self.brace_depth += 1;
                    self.pos += 1;
                    self.last = Last::Operator;
                }
                b'}' => {
                    self.pos += 1;
                    match self.templates.last().copied() {
                        Some((depth, start)) if depth == self.brace_depth => {
                            self.templates.pop();
                            self.scan_template(start)?;
                        }
                        _ => {
                            self.brace_depth = self.brace_depth.saturating_sub(1);
                            self.last = Last::Operator;
                        }
                    }
                }
                b')' | b']' => {
                    self.pos += 1;
                    self.last = Last::Value;
                }
                b'.' => {
                    if self.src[self.pos..].starts_with(b"...") {
                        self.pos += 3;
                        self.last = Last::Operator;
                    } else if self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
                        self.skip_number();
                    } else {
                        self.pos += 1;
                        self.last = Last::Dot;
                    }
                }
                b'0'..=b'9' => self.skip_number(),
                _ if is_ident_start(b) => self.identifier()?,
                _ => {
                    self.pos += 1;
                    self.last = Last::Operator;
                }
            }
        }

        if let Some(&(_, start)) = self.templates.first() {
            return Err(LexError::UnterminatedTemplate { offset: start });
        }
        Ok(self.out)
    }

    fn regex_allowed(&self) -> bool {
        matches!(self.last, Last::Start | Last::Operator | Last::Keyword)
    }

    fn identifier(&mut self) -> Result<(), LexError> {
        let after_dot = self.last == Last::Dot;
        let word = self.read_word();
        self.last = match word {
            b"import" if !after_dot => self.import_statement()?,
            b"export" if !after_dot => self.export_statement()?,
            _ if EXPRESSION_KEYWORDS.contains(&word) => Last::Keyword,
            _ => Last::Value,
        };
        Ok(())
    }

    fn read_word(&mut self) -> &'a [u8] {
        let src = self.src;
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_part) {
            self.pos += 1;
        }
        &src[start..self.pos]
    }

    /// The identifier starting at `pos`, without consuming it.
    fn word_at(&self) -> &'a [u8] {
        let src = self.src;
        let mut end = self.pos;
        while src.get(end).copied().is_some_and(is_ident_part) {
            end += 1;
        }
        &src[self.pos..end]
    }

    /// Called with `pos` just after the `import` keyword.
    fn import_statement(&mut self) -> Result<Last, LexError> {
        let keyword_end = self.pos;
        self.skip_trivia()?;

        match self.peek(0) {
            Some(b'(') => {
                self.pos += 1;
                self.skip_trivia()?;
                if matches!(self.peek(0), Some(b'\'' | b'"')) {
                    let (start, end) = self.read_string()?;
                    self.skip_trivia()?;
                    if matches!(self.peek(0), Some(b')' | b',')) {
                        self.out.push(ImportSpecifier {
                            start,
                            end,
                            kind: ImportKind::DynamicLiteral,
                        });
                    }
                    return Ok(Last::Value);
                }
                Ok(Last::Operator)
            }
            Some(b'\'' | b'"') => {
                let (start, end) = self.read_string()?;
                self.out.push(ImportSpecifier {
                    start,
                    end,
                    kind: ImportKind::SideEffect,
                });
                Ok(Last::Start)
            }
            Some(b) if b == b'{' || b == b'*' || is_ident_start(b) => {
                if self.import_clause()? {
                    Ok(Last::Start)
                } else {
                    self.pos = keyword_end;
                    Ok(Last::Value)
                }
            }
            // `import.meta` and anything we do not recognise.
            _ => {
                self.pos = keyword_end;
                Ok(Last::Value)
            }
        }
    }

    /// Scan `x, { y as z } from "a"`. Returns false if the text is not an
    /// import clause.
    fn import_clause(&mut self) -> Result<bool, LexError> {
        loop {
            self.skip_trivia()?;
            match self.peek(0) {
                Some(b'{') => {
                    if !self.skip_binding_list()? {
                        return Ok(false);
                    }
                }
                Some(b'*' | b',') => self.pos += 1,
                Some(b) if is_ident_start(b) => {
                    let is_from = self.read_word() == b"from";
                    if is_from {
                        self.skip_trivia()?;
                        if matches!(self.peek(0), Some(b'\'' | b'"')) {
                            let (start, end) = self.read_string()?;
                            self.out.push(ImportSpecifier {
                                start,
                                end,
                                kind: ImportKind::Static,
                            });
                            return Ok(true);
                        }
                    }
                }
                _ => return Ok(false),
            }
        }
    }

    /// Called with `pos` just after the `export` keyword.
    fn export_statement(&mut self) -> Result<Last, LexError> {
        let keyword_end = self.pos;
        self.skip_trivia()?;

        let matched = match self.peek(0) {
            Some(b'*') => {
                self.pos += 1;
                self.skip_trivia()?;
                if self.word_at() == b"as" {
                    self.pos += 2;
                    self.skip_trivia()?;
                    match self.peek(0) {
                        Some(b'\'' | b'"') => {
                            self.read_string()?;
                        }
                        Some(b) if is_ident_start(b) => {
                            self.read_word();
                        }
                        _ => {}
                    }
                    self.skip_trivia()?;
                }
                self.export_from()?
            }
            Some(b'{') => self.skip_binding_list()? && self.export_from()?,
            _ => false,
        };

        if matched {
            Ok(Last::Start)
        } else {
            // Local exports: rescan normally so braces stay balanced.
            self.pos = keyword_end;
            Ok(Last::Keyword)
        }
    }

    /// Expect `from "a"` at the current position.
    fn export_from(&mut self) -> Result<bool, LexError> {
        self.skip_trivia()?;
        if !self.peek(0).is_some_and(is_ident_start) || self.read_word() != b"from" {
            return Ok(false);
        }
        self.skip_trivia()?;
        if !matches!(self.peek(0), Some(b'\'' | b'"')) {
            return Ok(false);
        }
        let (start, end) = self.read_string()?;
        self.out.push(ImportSpecifier {
            start,
            end,
            kind: ImportKind::ReExport,
        });
        Ok(true)
    }

    /// Skip `{ a, b as c, "d-e" as f }`.
    fn skip_binding_list(&mut self) -> Result<bool, LexError> {
        self.pos += 1;
        loop {
            self.skip_trivia()?;
            match self.peek(0) {
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(true);
                }
                Some(b'\'' | b'"') => {
                    self.read_string()?;
                }
                Some(b) if is_ident_part(b) || b == b',' => self.pos += 1,
                _ => return Ok(false),
            }
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek(0) {
                Some(b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c) => self.pos += 1,
                Some(b'/') if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                Some(b'/') if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while self.peek(0).is_some_and(|b| b != b'\n') {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        self.pos += 2;
        loop {
            match self.peek(0) {
                Some(b'*') if self.peek(1) == Some(b'/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
                None => return Err(LexError::UnterminatedComment { offset: start }),
            }
        }
    }

    /// Read a quoted string at `pos`. Returns the content offsets.
    fn read_string(&mut self) -> Result<(usize, usize), LexError> {
        let open = self.pos;
        let quote = self.src[open];
        self.pos += 1;
        loop {
            match self.peek(0) {
                Some(b'\\') => self.pos += 2,
                Some(b) if b == quote => {
                    self.pos += 1;
                    return Ok((open + 1, self.pos - 1));
                }
                Some(b'\n' | b'\r') | None => {
                    return Err(LexError::UnterminatedString { offset: open });
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Scan template text until the closing backtick or an interpolation.
    fn scan_template(&mut self, start: usize) -> Result<(), LexError> {
        loop {
            match self.peek(0) {
                Some(b'\\') => self.pos += 2,
                Some(b'`') => {
                    self.pos += 1;
                    self.last = Last::Value;
                    return Ok(());
                }
                Some(b'$') if self.peek(1) == Some(b'{') => {
                    self.pos += 2;
                    self.templates.push((self.brace_depth, start));
                    self.last = Last::Operator;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
                None => return Err(LexError::UnterminatedTemplate { offset: start }),
            }
        }
    }

    fn skip_regex(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek(0) {
                Some(b'\\') => self.pos += 2,
                Some(b'[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(b']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some(b'/') if !in_class => {
                    self.pos += 1;
                    // Flags.
                    while self.peek(0).is_some_and(is_ident_part) {
                        self.pos += 1;
                    }
                    return Ok(());
                }
                Some(b'\n' | b'\r') | None => {
                    return Err(LexError::UnterminatedRegex { offset: start });
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn skip_number(&mut self) {
        while self
            .peek(0)
            .is_some_and(|b| is_ident_part(b) || b == b'.')
        {
            self.pos += 1;
        }
        self.last = Last::Value;
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_part(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}
