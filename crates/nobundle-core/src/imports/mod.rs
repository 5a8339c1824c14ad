//! Import discovery for JavaScript modules.
//!
//! Provides a lexer that locates import specifiers by byte offset.

mod lexer;

pub use lexer::{lex_imports, ImportKind, ImportSpecifier, LexError};
