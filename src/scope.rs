//! Lexical scope stack (spec.md §4.2).
//!
//! Mirrors the donor interpreter's `namespace.rs` stack-of-frames shape,
//! but keyed by name instead of slot index: this resolver doesn't compile
//! to bytecode, so there's no namespace-size precomputation, only a plain
//! name → exprId map per frame.

use ahash::AHashMap;

use crate::vault::ExprId;

/// Prefix the IR builder uses for not-yet-bound var-decl exprIds (spec.md
/// §4.2: "written by the IR builder are treated as 'not bound' by the
/// resolver so that later binding during resolution can overwrite them
/// cleanly").
pub const PLACEHOLDER_PREFIX: &str = "placeholder:";

/// A single lexical scope stack. `Lookup` searches innermost to outermost;
/// `Define` only ever writes the top frame; lookups never mutate.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScopeStack {
    frames: Vec<AHashMap<String, ExprId>>,
}

impl ScopeStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: vec![AHashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(AHashMap::new());
    }

    /// No-op if only the root frame remains (spec.md §4.2).
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn define(&mut self, name: impl Into<String>, expr_id: ExprId) {
        self.frames
            .last_mut()
            .expect("scope stack always has at least the root frame")
            .insert(name.into(), expr_id);
    }

    /// Innermost-first lookup. A placeholder exprId (see `PLACEHOLDER_PREFIX`)
    /// is treated as unbound so the resolver can rebind it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ExprId> {
        for frame in self.frames.iter().rev() {
            if let Some(id) = frame.get(name) {
                if id.as_str().starts_with(PLACEHOLDER_PREFIX) {
                    return None;
                }
                return Some(id.clone());
            }
        }
        None
    }

    /// Looks up ignoring the placeholder rule — used by the resolver when it
    /// needs to see *whether a name was declared at all*, even if its
    /// binding hasn't been resolved yet.
    #[must_use]
    pub fn lookup_raw(&self, name: &str) -> Option<ExprId> {
        self.frames.iter().rev().find_map(|frame| frame.get(name).cloned())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Deep-copies the entire stack — used when capturing a function's
    /// defining scope as a closure snapshot (spec.md §3, `Function.scopes`;
    /// spec.md §9 "back-references … are clones, not shared references").
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}
