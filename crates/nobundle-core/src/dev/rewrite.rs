//! Import rewriting for unbundled dev serving.
//!
//! Scans JavaScript with the import lexer and rewrites:
//! - Bare specifiers (`lodash`) → `/@modules/lodash`
//! - Relative/absolute imports: untouched, or with `?t=<timestamp>`
//!   appended while serving an HMR refresh
//! - `import { hot } from "/@hmr"`: `hot.accept(...)` calls are rewritten
//!   and registered as HMR boundaries (see [`super::accept`])
//!
//! Every rewrite replaces the module's importee set and boundary set in
//! the dependency graph.

use super::accept::{scan_accept_calls, HMR_CLIENT_PATH};
use super::graph::DependencyGraph;
use super::resolve::MODULES_PREFIX;
use crate::imports::{lex_imports, ImportKind, LexError};
use crate::paths::{append_timestamp, clean_url, is_bare_specifier, is_external_url, join_public};
use regex_lite::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

/// Replace `start..end` of the source with `text`. Inserts have
/// `start == end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Edit {
    #[must_use]
    pub fn replace(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::replace(at, at, text)
    }
}

/// Apply non-overlapping edits to `source`.
#[must_use]
pub fn apply_edits(source: &str, edits: &[Edit]) -> String {
    let mut sorted: Vec<&Edit> = edits.iter().collect();
    sorted.sort_by_key(|e| (e.start, e.end));

    let mut out = String::with_capacity(source.len() + 64);
    let mut cursor = 0;
    for edit in sorted {
        if edit.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Result of analysing one module.
#[derive(Debug, Clone, Default)]
pub struct RewriteOutput {
    /// Rewritten source. Byte-identical to the input when `changed` is false.
    pub code: String,
    /// Clean public paths of static relative/absolute imports.
    pub importees: BTreeSet<String>,
    /// Clean public paths the module accepts hot updates for.
    pub accepted: BTreeSet<String>,
    pub changed: bool,
    /// Non-fatal problems (malformed accept calls, parse failures).
    pub diagnostics: Vec<String>,
}

/// Import rewriter bound to a dependency graph.
#[derive(Debug, Clone)]
pub struct ImportRewriter {
    graph: Arc<DependencyGraph>,
}

impl ImportRewriter {
    #[must_use]
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph }
    }

    /// Compute the rewrite of `source` without touching the graph.
    ///
    /// `importer` is the module's public path. With a `timestamp`, every
    /// relative import gets it appended as `t=` so the browser refetches.
    pub fn analyze(
        &self,
        source: &str,
        importer: &str,
        timestamp: Option<&str>,
    ) -> Result<RewriteOutput, LexError> {
        let specifiers = lex_imports(source)?;
        let mut edits = Vec::new();
        let mut out = RewriteOutput::default();
        let mut scan_boundaries = false;

        for spec in &specifiers {
            let id = spec.text(source);

            if spec.kind == ImportKind::DynamicLiteral {
                if is_bare_specifier(id) {
                    edits.push(Edit::replace(spec.start, spec.end, format!("{MODULES_PREFIX}{id}")));
                }
                continue;
            }

            if id == HMR_CLIENT_PATH {
                scan_boundaries |= !is_component_module(importer);
            } else if is_bare_specifier(id) {
                edits.push(Edit::replace(spec.start, spec.end, format!("{MODULES_PREFIX}{id}")));
            } else if !is_external_url(id) {
                if let Some(ts) = timestamp {
                    edits.push(Edit::replace(spec.start, spec.end, append_timestamp(id, ts)));
                }
                out.importees
                    .insert(clean_url(&join_public(importer, id)).to_string());
            }
        }

        if scan_boundaries {
            match scan_accept_calls(source, importer) {
                Ok(scan) => {
                    edits.extend(scan.edits);
                    out.accepted = scan.accepted;
                    out.diagnostics.extend(scan.diagnostics);
                }
                Err(err) => {
                    warn!(importer, error = %err, "failed to parse module for hot.accept() calls");
                    out.diagnostics
                        .push(format!("{importer}: failed to parse for hot.accept(): {err}"));
                }
            }
        }

        out.changed = !edits.is_empty();
        out.code = if out.changed {
            apply_edits(source, &edits)
        } else {
            source.to_string()
        };
        Ok(out)
    }

    /// Rewrite `source` and commit its importees and boundaries to the
    /// graph. On a lexing failure the source is returned unchanged and the
    /// graph is left untouched.
    #[must_use]
    pub fn rewrite(&self, source: &str, importer: &str, timestamp: Option<&str>) -> String {
        match self.analyze(source, importer, timestamp) {
            Ok(out) => {
                self.graph
                    .commit(clean_url(importer), out.importees, out.accepted);
                out.code
            }
            Err(err) => {
                error!(importer, error = %err, "failed to rewrite imports, serving source as-is");
                source.to_string()
            }
        }
    }

    /// Rewrite the inline module scripts of an HTML page and inject the HMR
    /// client. Importees of every script (inline and `src`) are committed
    /// as one set.
    #[must_use]
    pub fn rewrite_html(&self, html: &str, importer: &str) -> String {
        let mut importees = BTreeSet::new();
        let mut accepted = BTreeSet::new();
        let mut edits = Vec::new();

        for caps in script_re().captures_iter(html) {
            let (Some(open), Some(body)) = (caps.get(1), caps.get(2)) else {
                continue;
            };

            if let Some(src) = src_re().captures(open.as_str()).and_then(|c| c.get(1)) {
                let src = src.as_str();
                if !is_bare_specifier(src) && !is_external_url(src) {
                    importees.insert(clean_url(&join_public(importer, src)).to_string());
                }
            }

            if body.as_str().trim().is_empty() {
                continue;
            }
            match self.analyze(body.as_str(), importer, None) {
                Ok(out) => {
                    importees.extend(out.importees);
                    accepted.extend(out.accepted);
                    if out.changed {
                        edits.push(Edit::replace(body.start(), body.end(), out.code));
                    }
                }
                Err(err) => {
                    error!(importer, error = %err, "failed to rewrite inline script");
                }
            }
        }

        self.graph.commit(clean_url(importer), importees, accepted);

        let injection = format!("<script type=\"module\">import \"{HMR_CLIENT_PATH}\"</script>");
        match head_re().find(html) {
            Some(head) => edits.push(Edit::insert(head.end(), injection)),
            None => edits.push(Edit::insert(0, injection)),
        }
        apply_edits(html, &edits)
    }
}

/// Components wire their own HMR through the framework runtime, so
/// their imports of the client are not boundary declarations.
fn is_component_module(importer: &str) -> bool {
    clean_url(importer).ends_with(".vue")
}

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)(<script\b[^>]*>)(.*?)</script>").unwrap_or_else(|_| unreachable!())
    })
}

fn src_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bsrc\s*=\s*["']([^"']+)["']"#).unwrap_or_else(|_| unreachable!())
    })
}

fn head_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<head\b[^>]*>").unwrap_or_else(|_| unreachable!()))
}
