//! Runtime values produced by evaluating a plan-time `Expr`.
//!
//! Values are intentionally small and stdlib-only: a planner resolves a
//! handful of scalars and lists per wave, not a full object graph, so there
//! is no heap, no refcounting, and no container mutation to worry about
//! (contrast with the donor interpreter's `Value`, which must model Python's
//! full object model).

use std::fmt;

/// A resolved plan-time value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Produced by resolving a `for` collection expression. Spec.md §4.5:
    /// "must be a list of values; string/int/any lists accepted".
    List(Vec<Self>),
}

impl Value {
    /// Truthiness per spec.md §4.1: `nil` → false, `false` → false, empty
    /// string → false, numeric zero (any width) → false, anything else →
    /// true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    /// Canonical rendering used both for error messages and as the "raw"
    /// serialization fed into `literal:<printed value>` exprId derivation
    /// (spec.md §3, "ExprId generation for var-decls").
    #[must_use]
    pub fn canonical_print(&self) -> String {
        match self {
            Self::Nil => "nil".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format!("{f:?}"),
            Self::Str(s) => s.clone(),
            Self::List(items) => {
                let mut out = String::from("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&item.canonical_print());
                }
                out.push(']');
                out
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_print())
    }
}
