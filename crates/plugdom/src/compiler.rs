//! # Dynamic Compiler
//!
//! Turns source text into a loadable unit inside a domain. The compiler
//! only exists in domains whose policy allows dynamic compilation; a
//! static-only domain never constructs one.
//!
//! The default backend compiles WebAssembly text:
//!
//! 1. `;; #warning <text>` and `;; #error <text>` line comments become
//!    diagnostics located at the `#`. Text inside string literals and
//!    `(; ... ;)` block comments is never a directive.
//! 2. The text is parsed to a binary; a parse failure is one located error.
//! 3. The binary is validated and compiled; a failure is an unlocated error.
//! 4. Every import must be in the reference set with the same signature.
//!
//! Diagnostics come back in source order. Any error means no unit.

use std::sync::Arc;

use wasmtime::Engine;
use wasmtime::ExternType;
use wasmtime::Module;

use crate::contract::REFERENCES;
use crate::contract::Reference;
use crate::diagnostics::Diagnostic;
use crate::diagnostics::Diagnostics;
use crate::payload::Scalar;
use crate::policy::CapabilityPolicy;

/// Result of one compilation. `unit` is `None` whenever `diagnostics`
/// contains an error.
pub struct CompileOutput {
    pub diagnostics: Diagnostics,
    pub unit: Option<Module>,
}

/// A compilation backend. Backends never fail outright; every problem is
/// reported as a diagnostic.
pub trait CompilerBackend: Send + Sync {
    fn compile(&self, engine: &Engine, source: &str, references: &[Reference]) -> CompileOutput;
}

/// WebAssembly text backend.
#[derive(Copy, Clone, Debug, Default)]
pub struct WatBackend;

impl CompilerBackend for WatBackend {
    fn compile(&self, engine: &Engine, source: &str, references: &[Reference]) -> CompileOutput {
        let mut diagnostics = Diagnostics::new();
        scan_directives(source, &mut diagnostics);

        let unit = match wat::parse_str(source) {
            Err(e) => {
                diagnostics.push(parse_error(source, &e.to_string()));
                None
            }
            Ok(binary) => match Module::from_binary(engine, &binary) {
                Err(e) => {
                    diagnostics.push(Diagnostic::error(format!("{:#}", e), 0, 0));
                    None
                }
                Ok(module) => {
                    check_references(source, &module, references, &mut diagnostics);
                    Some(module)
                }
            },
        };

        diagnostics.sort_by_position();
        let unit = if diagnostics.has_errors() { None } else { unit };
        CompileOutput { diagnostics, unit }
    }
}

/// The compiler resident in a dynamic domain.
pub(crate) struct DynamicCompiler {
    backend: Arc<dyn CompilerBackend>,
}

impl DynamicCompiler {
    /// Present only when `policy` allows dynamic compilation.
    pub(crate) fn for_policy(policy: &CapabilityPolicy, backend: Arc<dyn CompilerBackend>) -> Option<Self> {
        policy
            .allows_dynamic_compilation()
            .then(|| Self { backend })
    }

    pub(crate) fn compile(&self, engine: &Engine, source: &str) -> CompileOutput {
        let output = self.backend.compile(engine, source, REFERENCES);
        tracing::debug!(
            warnings = output.diagnostics.warnings().count(),
            errors = output.diagnostics.errors().count(),
            produced = output.unit.is_some(),
            "compiled source"
        );
        output
    }
}

fn scan_directives(source: &str, diagnostics: &mut Diagnostics) {
    let mut in_string = false;
    let mut block_depth = 0usize;

    for (index, line) in source.lines().enumerate() {
        let mut chars = line.char_indices().peekable();
        while let Some((at, c)) = chars.next() {
            if in_string {
                match c {
                    '\\' => {
                        chars.next();
                    }
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }

            let next = chars.peek().map(|&(_, n)| n);
            match (c, next) {
                ('(', Some(';')) => {
                    chars.next();
                    block_depth += 1;
                }
                (';', Some(')')) if block_depth > 0 => {
                    chars.next();
                    block_depth -= 1;
                }
                _ if block_depth > 0 => {}
                ('"', _) => in_string = true,
                (';', Some(';')) => {
                    if let Some(found) = line_directive(line, at) {
                        diagnostics.push(found.at(index as u32 + 1));
                    }
                    break;
                }
                _ => {}
            }
        }
    }
}

/// A directive found in a line comment, before its line is known.
struct Found<'a> {
    is_warning: bool,
    text: &'a str,
    column: u32,
}

impl Found<'_> {
    fn at(self, line: u32) -> Diagnostic {
        if self.is_warning {
            Diagnostic::warning(self.text, line, self.column)
        } else {
            Diagnostic::error(self.text, line, self.column)
        }
    }
}

/// Reads the line comment starting at byte `start` of `line`.
fn line_directive(line: &str, start: usize) -> Option<Found<'_>> {
    let after = &line[start + 2..];
    let body = after.trim_start();
    let hash = start + 2 + (after.len() - body.len());

    let (is_warning, text) = directive(body, "#warning")
        .map(|text| (true, text))
        .or_else(|| directive(body, "#error").map(|text| (false, text)))?;

    Some(Found {
        is_warning,
        text,
        column: line[..hash].chars().count() as u32 + 1,
    })
}

fn directive<'a>(body: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = body.strip_prefix(keyword)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Builds the diagnostic for a text parse failure.
///
/// The parser renders its position either as `--> <file>:<line>:<col>` or,
/// without source text attached, as `at byte offset <n>`.
fn parse_error(source: &str, rendered: &str) -> Diagnostic {
    let message = rendered.lines().next().unwrap_or("parse error").trim();

    if let Some((line, column)) = arrow_location(rendered) {
        return Diagnostic::error(message, line, column);
    }

    if let Some(offset) = byte_offset(rendered) {
        let message = message.split(" at byte offset").next().unwrap_or(message);
        let (line, column) = locate(source, offset);
        return Diagnostic::error(message, line, column);
    }

    Diagnostic::error(message, 0, 0)
}

fn arrow_location(rendered: &str) -> Option<(u32, u32)> {
    let marker = rendered.lines().find_map(|l| l.trim_start().strip_prefix("-->"))?;
    let mut parts = marker.trim().rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    Some((line, column))
}

fn byte_offset(rendered: &str) -> Option<usize> {
    let (_, tail) = rendered.split_once("at byte offset ")?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// 1-based line and column of a byte offset.
fn locate(source: &str, offset: usize) -> (u32, u32) {
    let offset = offset.min(source.len());
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() as u32 + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() as u32 + 1;
    (line, column)
}

fn check_references(source: &str, module: &Module, references: &[Reference], diagnostics: &mut Diagnostics) {
    for import in module.imports() {
        let resolved = references.iter().any(|r| {
            r.module == import.module()
                && r.name == import.name()
                && match import.ty() {
                    ExternType::Func(ty) => {
                        Scalar::matches(ty.params(), r.params) && Scalar::matches(ty.results(), r.results)
                    }
                    _ => false,
                }
        });

        if !resolved {
            let needle = format!("\"{}\" \"{}\"", import.module(), import.name());
            let (line, column) = source.find(&needle).map(|at| locate(source, at)).unwrap_or((0, 0));
            diagnostics.push(Diagnostic::error(
                format!("unresolved import `{}.{}`", import.module(), import.name()),
                line,
                column,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::diagnostics::Severity;

    fn compile(source: &str) -> CompileOutput {
        WatBackend.compile(&Engine::default(), source, REFERENCES)
    }

    #[test]
    fn test_warning_directive_is_located() {
        let out = compile(";; #warning Test warning\n(module)");
        assert!(out.unit.is_some());
        let warning = out.diagnostics.iter().next().unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.message, "Test warning");
        assert_eq!((warning.line, warning.column), (1, 4));
    }

    #[test]
    fn test_error_directive_suppresses_unit() {
        let out = compile("(module)\n  ;; #error nope\n");
        assert!(out.unit.is_none());
        let error = out.diagnostics.errors().next().unwrap();
        assert_eq!((error.line, error.column), (2, 6));
    }

    #[test]
    fn test_plain_comments_are_not_directives() {
        let out = compile(";; #warnings are fine\n;; just a note\n(module)");
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn test_directive_text_in_strings_is_data() {
        let source = "(module\n  (memory 1)\n  (data (i32.const 0) \"a ;; #error not a comment\")\n  (data (i32.const 8) \"\\\" ;; #error still data\"))";
        let out = compile(source);
        assert!(out.diagnostics.is_empty(), "unexpected: {:?}", out.diagnostics.iter().map(|d| d.to_string()).collect::<Vec<_>>());
        assert!(out.unit.is_some());
    }

    #[test]
    fn test_directive_in_block_comment_is_ignored() {
        let out = compile("(; outer (; ;; #error nested ;)\n ;; #error still inside ;)\n(module) ;; #warning after");
        assert!(out.unit.is_some());
        let only: Vec<String> = out.diagnostics.iter().map(|d| d.to_string()).collect();
        assert_eq!(only, ["warning: after (line 3, col 13)"]);
    }

    #[test]
    fn test_syntax_error_is_located() {
        let out = compile("(module\n  (func (export \"f\") (result i32)\n    i32.const))");
        assert!(out.unit.is_none());
        let error = out.diagnostics.errors().next().unwrap();
        assert!(error.line > 0);
    }

    #[test]
    fn test_validation_error_is_unlocated() {
        let out = compile("(module (func (result i32)))");
        assert!(out.unit.is_none());
        let error = out.diagnostics.errors().next().unwrap();
        assert_eq!((error.line, error.column), (0, 0));
    }

    #[test]
    fn test_unknown_import_is_unresolved() {
        let out = compile("(module\n  (import \"env\" \"system\" (func (param i32))))");
        assert!(out.unit.is_none());
        let error = out.diagnostics.errors().next().unwrap();
        assert!(error.message.contains("env.system"));
        assert_eq!((error.line, error.column), (2, 11));
    }

    #[test]
    fn test_import_with_wrong_signature_is_unresolved() {
        let out = compile("(module (import \"host\" \"log\" (func (param i64))))");
        assert!(out.unit.is_none());
    }

    #[test]
    fn test_locate() {
        assert_eq!(locate("ab\ncd", 0), (1, 1));
        assert_eq!(locate("ab\ncd", 4), (2, 2));
        assert_eq!(arrow_location("x\n --> <anon>:3:9\n"), Some((3, 9)));
        assert_eq!(byte_offset("bad at byte offset 12"), Some(12));
    }

    #[test]
    fn test_static_policy_has_no_compiler() {
        let backend: Arc<dyn CompilerBackend> = Arc::new(WatBackend);
        assert!(DynamicCompiler::for_policy(&CapabilityPolicy::static_only(), backend.clone()).is_none());
        assert!(DynamicCompiler::for_policy(&CapabilityPolicy::allow_dynamic(), backend).is_some());
    }
}
