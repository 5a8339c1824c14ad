//! Single-file components (`.vue`).
//!
//! A component is split into top-level `<template>`, `<script>` and
//! `<style>` blocks. Each block is served as its own sub-resource:
//!
//! - `/App.vue` → main module (script plus style/template wiring)
//! - `/App.vue?type=template` → module exporting `render`
//! - `/App.vue?type=style&index=0` → compiled CSS
//!
//! Block compilation goes through [`BlockCompiler`] so a real framework
//! compiler can be plugged in; [`BuiltinCompiler`] is the default.

use super::css::{self, json_string, CssOptions, StyleOutput};
use crate::paths::short_hash;
use std::collections::BTreeMap;
use std::fmt::Write;

/// One top-level block of a component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SfcBlock {
    /// Text between the opening and closing tags.
    pub content: String,
    /// Attributes. Flags (`scoped`) have no value.
    pub attrs: BTreeMap<String, Option<String>>,
}

impl SfcBlock {
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|v| v.as_deref())
    }

    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    #[must_use]
    pub fn lang(&self) -> Option<&str> {
        self.attr("lang")
    }

    #[must_use]
    pub fn src(&self) -> Option<&str> {
        self.attr("src")
    }

    #[must_use]
    pub fn scoped(&self) -> bool {
        self.has_attr("scoped")
    }

    /// CSS Modules binding name: `module` alone binds `$style`.
    #[must_use]
    pub fn module_name(&self) -> Option<&str> {
        match self.attrs.get("module") {
            Some(Some(name)) if !name.is_empty() => Some(name.as_str()),
            Some(_) => Some("$style"),
            None => None,
        }
    }
}

/// Parsed component structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SfcDescriptor {
    pub filename: String,
    pub template: Option<SfcBlock>,
    pub script: Option<SfcBlock>,
    pub styles: Vec<SfcBlock>,
}

/// Result of [`BlockCompiler::parse`].
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub descriptor: SfcDescriptor,
    pub errors: Vec<String>,
}

/// Result of [`BlockCompiler::compile_template`].
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub code: String,
    pub errors: Vec<String>,
}

/// Per-block compile inputs.
#[derive(Debug, Clone)]
pub struct BlockContext<'a> {
    /// Public path of the component (`/src/App.vue`).
    pub public_path: &'a str,
    /// Scope attribute (`data-v-1a2b3c4d`).
    pub scope_id: &'a str,
}

/// Block-level compiler for single-file components.
pub trait BlockCompiler: Send + Sync {
    /// Split a component into blocks.
    fn parse(&self, source: &str, filename: &str) -> ParseOutput;

    /// Compile a template block into a module exporting `render`.
    fn compile_template(&self, block: &SfcBlock, ctx: &BlockContext<'_>) -> CompileOutput;

    /// Compile a style block into CSS.
    fn compile_style(&self, block: &SfcBlock, ctx: &BlockContext<'_>) -> StyleOutput;
}

/// Default compiler: a block splitter, a runtime-compiled template and
/// lightningcss for styles.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinCompiler;

impl BlockCompiler for BuiltinCompiler {
    fn parse(&self, source: &str, filename: &str) -> ParseOutput {
        let (blocks, errors) = split_blocks(source);
        let mut descriptor = SfcDescriptor {
            filename: filename.to_string(),
            ..Default::default()
        };
        let mut errors = errors;

        for (tag, block) in blocks {
            match tag.as_str() {
                "template" if descriptor.template.is_none() => descriptor.template = Some(block),
                "script" if descriptor.script.is_none() => descriptor.script = Some(block),
                "template" | "script" => {
                    errors.push(format!("{filename}: duplicate <{tag}> block ignored"));
                }
                "style" => descriptor.styles.push(block),
                _ => {}
            }
        }

        ParseOutput { descriptor, errors }
    }

    fn compile_template(&self, block: &SfcBlock, _ctx: &BlockContext<'_>) -> CompileOutput {
        let mut errors = Vec::new();
        if let Some(lang) = block.lang() {
            if lang != "html" {
                errors.push(format!("unsupported template lang \"{lang}\""));
            }
        }
        let code = format!(
            "import {{ compile }} from \"/@modules/vue\"\nexport const render = compile({})\n",
            json_string(block.content.trim())
        );
        CompileOutput { code, errors }
    }

    fn compile_style(&self, block: &SfcBlock, ctx: &BlockContext<'_>) -> StyleOutput {
        let mut output = css::compile_css(
            &block.content,
            &CssOptions {
                filename: ctx.public_path.to_string(),
                css_modules: block.module_name().is_some(),
                scope_id: block.scoped().then(|| ctx.scope_id.to_string()),
            },
        );
        if let Some(lang) = block.lang() {
            if lang != "css" {
                output
                    .diagnostics
                    .push(format!("unsupported style lang \"{lang}\""));
            }
        }
        output
    }
}

/// Scope attribute for a component.
#[must_use]
pub fn scope_id(public_path: &str) -> String {
    format!("data-v-{}", short_hash(public_path))
}

/// Element id of a component's style block.
#[must_use]
pub fn style_block_id(public_path: &str, index: usize) -> String {
    format!("{}-{index}", short_hash(public_path))
}

/// Generate the main module of a component.
///
/// The script's `export default` becomes `const __script =` so that the
/// style, template and HMR metadata can be attached before re-exporting.
#[must_use]
pub fn main_module(descriptor: &SfcDescriptor, public_path: &str, file_path: &str) -> String {
    let mut code = match &descriptor.script {
        Some(script) => script
            .content
            .replacen("export default", "const __script =", 1),
        None => "const __script = {}".to_string(),
    };

    let mut has_scoped = false;
    let mut has_modules = false;
    if !descriptor.styles.is_empty() {
        code.push_str("\nimport { updateStyle } from \"/@hmr\"\n");
        for (i, style) in descriptor.styles.iter().enumerate() {
            let url = format!("{public_path}?type=style&index={i}");
            let _ = write!(
                code,
                "\nupdateStyle({}, {})",
                json_string(&style_block_id(public_path, i)),
                json_string(&url)
            );
            has_scoped |= style.scoped();
            if let Some(name) = style.module_name() {
                if !has_modules {
                    code.push_str("\nconst __cssModules = __script.__cssModules = {}");
                    has_modules = true;
                }
                let _ = write!(
                    code,
                    "\nimport __style{i} from {}\n__cssModules[{}] = __style{i}",
                    json_string(&format!("{url}&module")),
                    json_string(name)
                );
            }
        }
    }

    if has_scoped {
        let _ = write!(
            code,
            "\n__script.__scopeId = {}",
            json_string(&scope_id(public_path))
        );
    }

    if descriptor.template.is_some() {
        let _ = write!(
            code,
            "\nimport {{ render as __render }} from {}\n__script.render = __render",
            json_string(&format!("{public_path}?type=template"))
        );
    }

    let _ = write!(
        code,
        "\n__script.__hmrId = {}\n__script.__file = {}\nexport default __script\n",
        json_string(public_path),
        json_string(file_path)
    );
    code
}

/// What changed between two versions of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfcChange {
    /// Script or style structure changed: re-instantiate the component.
    Reload,
    /// Only the template and/or some styles changed.
    Partial {
        rerender: bool,
        styles: Vec<usize>,
    },
}

/// Compare two descriptors. Returns `None` when nothing changed.
#[must_use]
pub fn diff_descriptors(prev: &SfcDescriptor, next: &SfcDescriptor) -> Option<SfcChange> {
    if prev.script != next.script {
        return Some(SfcChange::Reload);
    }
    if prev.styles.len() != next.styles.len() {
        return Some(SfcChange::Reload);
    }
    let structure_changed = prev.styles.iter().zip(&next.styles).any(|(a, b)| {
        a.scoped() != b.scoped() || a.module_name() != b.module_name()
    });
    if structure_changed {
        return Some(SfcChange::Reload);
    }

    let rerender = prev.template != next.template;
    let styles: Vec<usize> = prev
        .styles
        .iter()
        .zip(&next.styles)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(i, _)| i)
        .collect();

    if !rerender && styles.is_empty() {
        None
    } else {
        Some(SfcChange::Partial { rerender, styles })
    }
}

/// Split top-level blocks. Returns `(tag, block)` pairs in source order.
fn split_blocks(source: &str) -> (Vec<(String, SfcBlock)>, Vec<String>) {
    let mut blocks = Vec::new();
    let mut errors = Vec::new();
    let mut pos = 0;

    while let Some(offset) = source[pos..].find('<') {
        let start = pos + offset;
        let rest = &source[start..];

        if rest.starts_with("<!--") {
            pos = rest
                .find("-->")
                .map_or(source.len(), |end| start + end + 3);
            continue;
        }

        let name_len = rest[1..]
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '-')
            .unwrap_or(rest.len() - 1);
        if name_len == 0 {
            pos = start + 1;
            continue;
        }
        let tag = rest[1..=name_len].to_ascii_lowercase();

        let Some((attrs, head_end, self_closing)) = parse_open_tag(source, start + 1 + name_len)
        else {
            errors.push(format!("unterminated <{tag}> tag"));
            break;
        };

        if self_closing {
            blocks.push((
                tag,
                SfcBlock {
                    content: String::new(),
                    attrs,
                },
            ));
            pos = head_end;
            continue;
        }

        let Some((content_end, close_end)) = find_close(source, head_end, &tag) else {
            errors.push(format!("missing </{tag}>"));
            break;
        };

        blocks.push((
            tag,
            SfcBlock {
                content: source[head_end..content_end].to_string(),
                attrs,
            },
        ));
        pos = close_end;
    }

    (blocks, errors)
}

/// Parse attributes starting after the tag name. Returns the attributes,
/// the offset after `>`, and whether the tag was self-closing.
fn parse_open_tag(
    source: &str,
    mut i: usize,
) -> Option<(BTreeMap<String, Option<String>>, usize, bool)> {
    let bytes = source.as_bytes();
    let mut attrs = BTreeMap::new();

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i)? {
            b'>' => return Some((attrs, i + 1, false)),
            b'/' if bytes.get(i + 1) == Some(&b'>') => return Some((attrs, i + 2, true)),
            _ => {}
        }

        let name_start = i;
        while i < bytes.len() && !matches!(bytes[i], b'=' | b'>' | b'/') && !bytes[i].is_ascii_whitespace()
        {
            i += 1;
        }
        if i == name_start {
            i += 1;
            continue;
        }
        let name = source[name_start..i].to_string();

        if bytes.get(i) == Some(&b'=') {
            i += 1;
            let value = match bytes.get(i)? {
                q @ (b'"' | b'\'') => {
                    let end = i + 1 + source[i + 1..].find(*q as char)?;
                    let value = &source[i + 1..end];
                    i = end + 1;
                    value
                }
                _ => {
                    let start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                        i += 1;
                    }
                    &source[start..i]
                }
            };
            attrs.insert(name, Some(value.to_string()));
        } else {
            attrs.insert(name, None);
        }
    }
}

/// Find the closing tag for `tag`, nesting-aware for `<template>`.
/// Returns (content end, offset after the closing tag).
fn find_close(source: &str, from: usize, tag: &str) -> Option<(usize, usize)> {
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let lower = source[from..].to_ascii_lowercase();
    let mut depth = 0usize;
    let mut i = 0;

    loop {
        let next_close = lower[i..].find(&close)? + i;
        let next_open = if tag == "template" {
            lower[i..].find(&open).map(|o| o + i)
        } else {
            None
        };

        match next_open {
            Some(o) if o < next_close && is_tag_boundary(&lower, o + open.len()) => {
                depth += 1;
                i = o + open.len();
            }
            _ => {
                if depth == 0 {
                    let gt = lower[next_close..].find('>')? + next_close;
                    return Some((from + next_close, from + gt + 1));
                }
                depth -= 1;
                i = next_close + close.len();
            }
        }
    }
}

fn is_tag_boundary(s: &str, at: usize) -> bool {
    s.as_bytes()
        .get(at)
        .map_or(true, |b| b.is_ascii_whitespace() || *b == b'>' || *b == b'/')
}
