//! # Compiler Diagnostics
//!
//! Messages produced by a compilation, kept in source order. A diagnostic
//! renders as `<severity>: <message> (line <n>, col <m>)`. Line and column
//! are 1-based; 0 means the backend could not attribute the message to a
//! position.

use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One compiler message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self { severity: Severity::Warning, message: message.into(), line, column }
    }

    pub fn error(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self { severity: Severity::Error, message: message.into(), line, column }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    fn is_located(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (line {}, col {})", self.severity, self.message, self.line, self.column)
    }
}

/// The ordered diagnostics of one compile call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// Orders entries by source position. Entries at the same position, and
    /// unlocated entries (sorted last), keep their insertion order.
    pub fn sort_by_position(&mut self) {
        self.entries
            .sort_by_key(|d| (!d.is_located(), d.line, d.column));
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.entries {
            writeln!(f, "{}", d)?;
        }
        Ok(())
    }
}
