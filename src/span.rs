use std::fmt;

/// A single position in source text (0-indexed line and column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub col: u32,
}

impl CodeLoc {
    #[must_use]
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.col + 1)
    }
}

/// A half-open source span, carried by every `Expr`/`Stmt` node for
/// diagnostics.
///
/// Unlike the donor interpreter's `CodeRange`, this carries no interned
/// filename and no cached preview line: this resolver never renders source
/// snippets, only positions, so that machinery would be dead weight here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

impl Span {
    #[must_use]
    pub fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }

    /// A placeholder span for synthetic nodes that do not trace back to a
    /// specific source location (e.g. nodes materialized purely by `for`
    /// unrolling).
    #[must_use]
    pub fn synthetic() -> Self {
        Self {
            start: CodeLoc::new(0, 0),
            end: CodeLoc::new(0, 0),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
