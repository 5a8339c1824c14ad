//! HMR boundary registration.
//!
//! Modules that import `hot` from the HMR client declare what they accept:
//!
//! ```js
//! import { hot } from "/@hmr"
//! hot.accept("./dep.js", (mod) => { ... })   // one dependency
//! hot.accept(["./a.js", "./b.js"], cb)       // several
//! hot.accept()                               // itself
//! ```
//!
//! Each call is rewritten so its first argument is the owner's public
//! path and every dependency literal is its resolved public path. This is
//! the only place a full parse (oxc) is needed.

use super::rewrite::Edit;
use crate::paths::{clean_url, join_public};
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrayExpressionElement, CallExpression, Expression, ImportDeclarationSpecifier,
    ModuleExportName, Statement, StringLiteral,
};
use oxc_ast_visit::{walk, Visit};
use oxc_parser::{Parser, ParserReturn};
use oxc_span::{GetSpan, SourceType};
use std::collections::BTreeSet;

/// Public path of the HMR client module.
pub const HMR_CLIENT_PATH: &str = "/@hmr";

/// Result of scanning a module for accept calls.
#[derive(Debug, Default)]
pub struct AcceptScan {
    /// Source edits for the rewritten calls.
    pub edits: Vec<Edit>,
    /// Clean public paths the module accepts updates for.
    pub accepted: BTreeSet<String>,
    /// Malformed calls, left unmodified.
    pub diagnostics: Vec<String>,
}

/// Parse `source` and collect `hot.accept(...)` calls.
///
/// Returns `Err` with the first parse error when the module does not
/// parse.
pub fn scan_accept_calls(source: &str, importer: &str) -> Result<AcceptScan, String> {
    let allocator = Allocator::default();
    let ParserReturn {
        program, errors, ..
    } = Parser::new(&allocator, source, SourceType::mjs()).parse();

    if let Some(first) = errors.first() {
        return Err(first.to_string());
    }

    let binding = program
        .body
        .iter()
        .find_map(|stmt| match stmt {
            Statement::ImportDeclaration(decl) if decl.source.value.as_str() == HMR_CLIENT_PATH => {
                decl.specifiers.as_ref()?.iter().find_map(|spec| match spec {
                    ImportDeclarationSpecifier::ImportSpecifier(named) => {
                        let imported = match &named.imported {
                            ModuleExportName::IdentifierName(ident) => ident.name.as_str(),
                            ModuleExportName::IdentifierReference(ident) => ident.name.as_str(),
                            ModuleExportName::StringLiteral(lit) => lit.value.as_str(),
                        };
                        (imported == "hot").then(|| named.local.name.to_string())
                    }
                    _ => None,
                })
            }
            _ => None,
        })
        .unwrap_or_else(|| "hot".to_string());

    let mut visitor = AcceptVisitor {
        source,
        importer: clean_url(importer),
        binding: &binding,
        scan: AcceptScan::default(),
    };
    visitor.visit_program(&program);
    Ok(visitor.scan)
}

struct AcceptVisitor<'s> {
    source: &'s str,
    importer: &'s str,
    binding: &'s str,
    scan: AcceptScan,
}

impl AcceptVisitor<'_> {
    fn is_accept_call(&self, call: &CallExpression<'_>) -> bool {
        match &call.callee {
            Expression::StaticMemberExpression(member) => {
                member.property.name.as_str() == "accept"
                    && matches!(&member.object, Expression::Identifier(ident) if ident.name.as_str() == self.binding)
            }
            _ => false,
        }
    }

    fn owner_literal(&self) -> String {
        json_quote(self.importer)
    }

    fn dependency(&self, lit: &StringLiteral<'_>, edits: &mut Vec<Edit>, deps: &mut Vec<String>) {
        let resolved = join_public(self.importer, lit.value.as_str());
        edits.push(Edit::replace(
            lit.span.start as usize,
            lit.span.end as usize,
            json_quote(&resolved),
        ));
        deps.push(clean_url(&resolved).to_string());
    }

    fn register(&mut self, call: &CallExpression<'_>) {
        let mut edits = Vec::new();
        let mut deps = Vec::new();

        match call.arguments.first() {
            None => {
                // `hot.accept()`: insert the owner before `)`.
                let close = call.span.end as usize - 1;
                edits.push(Edit::insert(close, self.owner_literal()));
                deps.push(self.importer.to_string());
            }
            Some(Argument::FunctionExpression(_) | Argument::ArrowFunctionExpression(_)) => {
                let first = &call.arguments[0];
                edits.push(Edit::insert(
                    first.span().start as usize,
                    format!("{}, ", self.owner_literal()),
                ));
                deps.push(self.importer.to_string());
            }
            Some(first @ Argument::StringLiteral(lit)) => {
                edits.push(Edit::insert(
                    first.span().start as usize,
                    format!("{}, ", self.owner_literal()),
                ));
                self.dependency(lit, &mut edits, &mut deps);
            }
            Some(first @ Argument::ArrayExpression(array)) => {
                edits.push(Edit::insert(
                    first.span().start as usize,
                    format!("{}, ", self.owner_literal()),
                ));
                for element in &array.elements {
                    if let ArrayExpressionElement::StringLiteral(lit) = element {
                        self.dependency(lit, &mut edits, &mut deps);
                    } else {
                        self.malformed(call);
                        return;
                    }
                }
            }
            Some(_) => {
                self.malformed(call);
                return;
            }
        }

        self.scan.edits.extend(edits);
        self.scan.accepted.extend(deps);
    }

    fn malformed(&mut self, call: &CallExpression<'_>) {
        let text = &self.source[call.span.start as usize..call.span.end as usize];
        tracing::warn!(
            importer = self.importer,
            call = text,
            "hot.accept() expects a string literal or an array of string literals"
        );
        self.scan.diagnostics.push(format!(
            "{}: hot.accept() expects a string literal or an array of string literals, got `{text}`",
            self.importer
        ));
    }
}

impl<'a> Visit<'a> for AcceptVisitor<'_> {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if self.is_accept_call(call) {
            self.register(call);
        }
        walk::walk_call_expression(self, call);
    }
}

fn json_quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
