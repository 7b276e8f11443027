//! Statement and blocker data model (spec.md §3).
//!
//! One payload per variant throughout, per spec.md §REDESIGN FLAGS: "the
//! current source uses integer discriminants plus N nullable fields; tighten
//! this to one-payload-per-variant at rewrite time."

use ahash::AHashMap;
use strum::Display;

use crate::expr::{CommandExpr, Expr};
use crate::scope::ScopeStack;
use crate::span::Span;
use crate::value::Value;
use crate::vault::ExprId;

/// `operator ∈ {"", "&&", "||", "|", ";"}` joining a command to whatever
/// follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, serde::Serialize, serde::Deserialize)]
pub enum CommandOperator {
    #[default]
    #[strum(serialize = "")]
    None,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "|")]
    Pipe,
    #[strum(serialize = ";")]
    Sequence,
}

impl CommandOperator {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "" => Some(Self::None),
            "&&" => Some(Self::And),
            "||" => Some(Self::Or),
            "|" => Some(Self::Pipe),
            ";" => Some(Self::Sequence),
            _ => None,
        }
    }
}

/// `redirectMode ∈ {"", ">", ">>"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, serde::Serialize, serde::Deserialize)]
pub enum RedirectMode {
    #[default]
    #[strum(serialize = "")]
    None,
    #[strum(serialize = ">")]
    Truncate,
    #[strum(serialize = ">>")]
    Append,
}

impl RedirectMode {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "" => Some(Self::None),
            ">" => Some(Self::Truncate),
            ">>" => Some(Self::Append),
            _ => None,
        }
    }
}

/// A named or positional command argument: `{name, value: Expr}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommandArg {
    pub name: String,
    pub value: Expr,
}

/// One arm of a `When` blocker: `{pattern: Expr, body: Stmt[]}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WhenArm {
    pub pattern: Expr,
    pub body: Vec<Stmt>,
}

/// Sentinel pattern literal for a `When` arm's `else` case (spec.md §4.3:
/// "`PatternElse` is stored as literal `\"_\"` sentinel").
pub const WHEN_ELSE_SENTINEL: &str = "_";

/// One resolved iteration of a `For` blocker: `{value, body: resolved deep
/// copy}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ForIteration {
    pub value: Value,
    pub body: Vec<Stmt>,
}

/// A control-flow node whose branches cannot be selected until its
/// condition/collection is resolved (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Blocker {
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        /// `None` until the resolver evaluates `condition`; pruning sets
        /// the untaken branch's `Vec` empty rather than removing the field
        /// (spec.md §8 property 2: "untaken branch/arm body is null/empty").
        else_branch: Option<Vec<Stmt>>,
        taken: Option<bool>,
    },
    When {
        condition: Expr,
        arms: Vec<WhenArm>,
        /// `None` before resolution or if no arm matched (spec.md §3: "`-1`
        /// if none" — represented the idiomatic-Rust way).
        matched_arm: Option<usize>,
    },
    For {
        loop_var: String,
        collection: Expr,
        /// The unresolved body template. Cleared to empty after resolution
        /// once `iterations` is populated (spec.md §8 property 3).
        then_branch: Vec<Stmt>,
        iterations: Vec<ForIteration>,
    },
}

/// A statement in the execution graph (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    VarDecl {
        name: String,
        value: Expr,
        expr_id: ExprId,
    },
    Command {
        /// Decorator name, including the leading `@` (spec.md §3).
        decorator: String,
        command: Option<CommandExpr>,
        args: Vec<CommandArg>,
        block: Vec<Stmt>,
        operator: CommandOperator,
        redirect_mode: RedirectMode,
        redirect_target: Option<CommandExpr>,
    },
    Blocker(Blocker),
    /// Preserved as-is; a runtime construct the resolver does not interpret
    /// beyond pushing independent scopes for each block (spec.md §3, §4.5).
    Try {
        try_block: Vec<Stmt>,
        catch_block: Vec<Stmt>,
        finally_block: Vec<Stmt>,
        /// Name bound to the caught error inside `catch_block`, if any.
        /// Spec.md §9 documents this as an incompletely specified part of
        /// the source system; this crate scopes it like any other block —
        /// visible only inside `catch_block`, not after the `Try`.
        error_var: Option<String>,
    },
    /// Expanded into a `CallTrace` during IR building (spec.md §3); not
    /// expected to appear in a built `ExecutionGraph`, but kept as a
    /// variant since the IR builder constructs it transiently.
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    /// Display-only provenance wrapper around a function call's expanded
    /// body (spec.md §3).
    CallTrace {
        label: String,
        block: Vec<Stmt>,
    },
}

/// One parameter of a `Function` definition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: String,
    pub type_hint: Option<String>,
    pub default: Option<Expr>,
}

/// `{name, params, body, span, scopes: ScopeStack snapshot at definition
/// point}` (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
    pub scopes: ScopeStack,
}

/// `{topLevelStatements, functions: mapping name → Function (keys unique),
/// scopes}` (spec.md §3).
///
/// Duplicate function names: last-definition-wins (spec.md §9, an explicit
/// Open Question resolution) — the IR builder simply overwrites the map
/// entry, so `functions` never needs to represent a collision.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecutionGraph {
    pub top_level_statements: Vec<Stmt>,
    pub functions: AHashMap<String, Function>,
    pub scopes: ScopeStack,
}
