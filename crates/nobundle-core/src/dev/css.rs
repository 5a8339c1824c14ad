//! CSS processing using lightningcss.
//!
//! Provides:
//! - Stylesheet normalisation for plain `.css` files
//! - CSS Modules (scoped class names plus an export map)
//! - Attribute scoping for `<style scoped>` blocks
//! - The JS shim served when a stylesheet is imported from a module

use crate::paths::short_hash;
use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::{ParserOptions, StyleSheet};
use std::collections::BTreeMap;
use thiserror::Error;

/// CSS processing options.
#[derive(Debug, Clone, Default)]
pub struct CssOptions {
    /// Source file name, used in diagnostics and for CSS Modules hashing.
    pub filename: String,
    /// Enable CSS Modules (returns class name mappings).
    pub css_modules: bool,
    /// Scope attribute (`data-v-1a2b3c4d`) appended to every selector.
    pub scope_id: Option<String>,
}

/// Processed stylesheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleOutput {
    /// The transformed CSS code.
    pub code: String,
    /// CSS Modules exports (original name → hashed name).
    pub modules: Option<BTreeMap<String, String>>,
    /// Problems reported while processing. Output is best-effort when
    /// non-empty.
    pub diagnostics: Vec<String>,
}

/// CSS processing error.
#[derive(Debug, Error)]
pub enum CssError {
    #[error("CSS parse error in {filename}: {message}")]
    Parse { filename: String, message: String },

    #[error("CSS print error in {filename}: {message}")]
    Print { filename: String, message: String },
}

/// Process CSS with lightningcss.
pub fn process_css(source: &str, options: &CssOptions) -> Result<StyleOutput, CssError> {
    let scoped;
    let source = match &options.scope_id {
        Some(id) => {
            scoped = scope_selectors(source, id);
            scoped.as_str()
        }
        None => source,
    };

    let mut parser_options = ParserOptions {
        filename: options.filename.clone(),
        ..ParserOptions::default()
    };
    if options.css_modules {
        parser_options.css_modules = Some(lightningcss::css_modules::Config {
            pattern: lightningcss::css_modules::Pattern::parse("[local]_[hash]").map_err(
                |e| CssError::Parse {
                    filename: options.filename.clone(),
                    message: e.to_string(),
                },
            )?,
            dashed_idents: false,
            animation: Default::default(),
            grid: Default::default(),
            container: Default::default(),
            custom_idents: Default::default(),
            pure: false,
        });
    }

    let stylesheet = StyleSheet::parse(source, parser_options).map_err(|e| CssError::Parse {
        filename: options.filename.clone(),
        message: e.to_string(),
    })?;

    let output = stylesheet
        .to_css(PrinterOptions::default())
        .map_err(|e| CssError::Print {
            filename: options.filename.clone(),
            message: e.to_string(),
        })?;

    let modules = options.css_modules.then(|| {
        output
            .exports
            .map(|exports| {
                exports
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    });

    Ok(StyleOutput {
        code: output.code,
        modules,
        diagnostics: Vec::new(),
    })
}

/// Process CSS, falling back to the unprocessed text on error.
///
/// The failure is reported in `diagnostics` so one bad stylesheet never
/// blocks the page.
#[must_use]
pub fn compile_css(source: &str, options: &CssOptions) -> StyleOutput {
    match process_css(source, options) {
        Ok(output) => output,
        Err(err) => StyleOutput {
            code: source.to_string(),
            modules: options.css_modules.then(BTreeMap::new),
            diagnostics: vec![err.to_string()],
        },
    }
}

/// Files ending in `.module.css` are CSS Modules.
#[must_use]
pub fn is_css_module(path: &str) -> bool {
    path.ends_with(".module.css")
}

/// A stylesheet whose changes are applied by swapping the `<style>` only.
#[must_use]
pub fn is_plain_css(path: &str) -> bool {
    path.ends_with(".css") && !is_css_module(path)
}

/// Element id used for a stylesheet's injected style.
#[must_use]
pub fn style_id(public_path: &str) -> String {
    short_hash(public_path)
}

/// `export default {...}` for a CSS Modules map.
#[must_use]
pub fn module_export(modules: &BTreeMap<String, String>) -> String {
    let map = serde_json::to_string(modules).unwrap_or_else(|_| "{}".to_string());
    format!("export default {map}\n")
}

/// JS served when a module imports a stylesheet: it registers the style
/// with the HMR client and, for CSS Modules, exports the class map.
#[must_use]
pub fn stylesheet_module(public_path: &str, modules: Option<&BTreeMap<String, String>>) -> String {
    let id = style_id(public_path);
    let href = json_string(&format!("{public_path}?raw"));
    let mut code = format!(
        "import {{ updateStyle }} from \"/@hmr\"\nupdateStyle({}, {href})\n",
        json_string(&id)
    );
    if let Some(modules) = modules {
        code.push_str(&module_export(modules));
    }
    code
}

pub(crate) fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Append `[<attr>]` to every selector of every style rule. Rules inside
/// conditional group rules (`@media`, `@supports`, ...) are scoped too;
/// other at-rule bodies (`@keyframes`, `@font-face`) are left alone.
#[must_use]
pub fn scope_selectors(css: &str, attr: &str) -> String {
    let mut out = String::with_capacity(css.len() + 64);
    scope_block(css, 0, attr, false, &mut out);
    out
}

/// Scope the rules of one block. `nested` blocks end at their closing
/// brace; at top level a stray `}` is copied through.
fn scope_block(src: &str, mut i: usize, attr: &str, nested: bool, out: &mut String) -> usize {
    let bytes = src.as_bytes();
    let mut prelude_start = i;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_comment(bytes, i),
            b'"' | b'\'' => i = skip_string(bytes, i),
            b';' => {
                i += 1;
                out.push_str(&src[prelude_start..i]);
                prelude_start = i;
            }
            b'}' if nested => {
                out.push_str(&src[prelude_start..i]);
                return i;
            }
            b'}' => {
                i += 1;
                out.push_str(&src[prelude_start..i]);
                prelude_start = i;
            }
            b'{' => {
                let prelude = &src[prelude_start..i];
                let trimmed = prelude.trim_start();
                if trimmed.starts_with('@') {
                    out.push_str(prelude);
                    out.push('{');
                    if is_group_rule(trimmed) {
                        i = scope_block(src, i + 1, attr, true, out);
                    } else {
                        let end = matching_brace(bytes, i + 1);
                        out.push_str(&src[i + 1..end]);
                        i = end;
                    }
                } else {
                    out.push_str(&scope_prelude(prelude, attr));
                    out.push('{');
                    let end = matching_brace(bytes, i + 1);
                    out.push_str(&src[i + 1..end]);
                    i = end;
                }
                if i < bytes.len() {
                    out.push('}');
                    i += 1;
                }
                prelude_start = i;
            }
            _ => i += 1,
        }
    }

    out.push_str(&src[prelude_start..]);
    i
}

fn is_group_rule(prelude: &str) -> bool {
    ["@media", "@supports", "@layer", "@container", "@document"]
        .iter()
        .any(|rule| prelude.starts_with(rule))
}

fn scope_prelude(prelude: &str, attr: &str) -> String {
    let lead_len = prelude.len() - prelude.trim_start().len();
    let selectors: Vec<String> = split_top_level(prelude.trim(), b',')
        .into_iter()
        .map(|sel| scope_selector(sel.trim(), attr))
        .collect();
    format!("{}{} ", &prelude[..lead_len], selectors.join(", "))
}

fn scope_selector(selector: &str, attr: &str) -> String {
    let bytes = selector.as_bytes();
    let mut depth = 0usize;
    for i in 0..bytes.len() {
        match bytes[i] {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                return format!("{}[{attr}]{}", &selector[..i], &selector[i..]);
            }
            _ => {}
        }
    }
    format!("{selector}[{attr}]")
}

fn split_top_level(s: &str, sep: u8) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            _ if b == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn matching_brace(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_comment(bytes, i);
                continue;
            }
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'{' => depth += 1,
            b'}' if depth == 0 => return i,
            b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}

fn skip_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_css_is_processed() {
        let out = compile_css(
            ".a { color: red; }",
            &CssOptions {
                filename: "/c.css".to_string(),
                ..Default::default()
            },
        );
        assert!(out.diagnostics.is_empty());
        assert!(out.code.contains(".a"));
        assert!(out.code.contains("red"));
        assert!(out.modules.is_none());
    }

    #[test]
    fn test_css_modules_export_map() {
        let out = compile_css(
            ".button { color: blue; }",
            &CssOptions {
                filename: "/x.module.css".to_string(),
                css_modules: true,
                ..Default::default()
            },
        );
        let modules = out.modules.unwrap();
        let hashed = modules.get("button").unwrap();
        assert_ne!(hashed, "button");
        assert!(out.code.contains(hashed.as_str()));
    }

    #[test]
    fn test_invalid_css_falls_back_to_source() {
        let source = ".a { color: red; ";
        let out = compile_css(
            source,
            &CssOptions {
                filename: "/broken.css".to_string(),
                ..Default::default()
            },
        );
        // lightningcss recovers from most errors; either way output exists.
        assert!(!out.code.is_empty());
    }

    #[test]
    fn test_scope_selectors() {
        let scoped = scope_selectors(
            ".a, .b > p { color: red } @media (min-width: 1px) { .c::before { content: 'x' } } @keyframes k { from { opacity: 0 } }",
            "data-v-1",
        );
        assert!(scoped.contains(".a[data-v-1], .b > p[data-v-1] {"));
        assert!(scoped.contains(".c[data-v-1]::before"));
        assert!(scoped.contains("from { opacity: 0 }"));
        assert!(!scoped.contains("from[data-v-1]"));
    }

    #[test]
    fn test_scope_survives_stray_closing_brace() {
        let scoped = scope_selectors(".a { color: red } } .b { margin: 0 }", "data-v-1");
        assert!(scoped.contains(".a[data-v-1] {"));
        assert!(scoped.contains("} }"));
        assert!(scoped.contains(".b[data-v-1] {"));
        assert!(scoped.ends_with("margin: 0 }"));
    }

    #[test]
    fn test_scoped_style_through_lightningcss() {
        let out = compile_css(
            ".title { color: red }",
            &CssOptions {
                filename: "/App.vue".to_string(),
                scope_id: Some("data-v-1234".to_string()),
                ..Default::default()
            },
        );
        assert!(out.code.contains(".title[data-v-1234]"));
    }

    #[test]
    fn test_stylesheet_module() {
        let js = stylesheet_module("/c.css", None);
        assert!(js.starts_with("import { updateStyle } from \"/@hmr\""));
        assert!(js.contains(&format!("updateStyle(\"{}\", \"/c.css?raw\")", style_id("/c.css"))));
        assert!(!js.contains("export default"));

        let mut modules = BTreeMap::new();
        modules.insert("btn".to_string(), "btn_x1".to_string());
        let js = stylesheet_module("/x.module.css", Some(&modules));
        assert!(js.contains(r#"export default {"btn":"btn_x1"}"#));
    }

    #[test]
    fn test_css_kind_detection() {
        assert!(is_plain_css("/c.css"));
        assert!(!is_plain_css("/x.module.css"));
        assert!(is_css_module("/x.module.css"));
        assert!(!is_plain_css("/a.js"));
    }
}
