//! Resolver error taxonomy (spec.md §7).
//!
//! Mirrors the donor's `repl_error.rs`: a stage-separated enum with a manual
//! `Display`/`std::error::Error` impl (no `thiserror`) and `From` impls that
//! let lower-level error types (`EvalError`, `TransportBoundaryViolation`)
//! bubble up with `?` at call sites.

use std::fmt;

use crate::cancel::CancelCause;
use crate::expr::EvalError;
use crate::span::Span;
use crate::vault::{ExprId, TransportBoundaryViolation};

/// Everything that can go wrong while resolving an execution graph.
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// The event stream ended mid-construct; the IR builder could not
    /// produce a complete `ExecutionGraph`.
    ParseIncomplete { context: String },
    /// A `VarRef` named something not bound in any enclosing scope.
    UndefinedVariable { name: String, span: Span },
    /// A `DecoratorRef` had no corresponding entry in the resolved-value
    /// table after a flush (spec.md §4.5).
    UnresolvedDecorator { key: String, span: Span },
    /// The decorator registry itself failed to resolve a batch of calls.
    DecoratorResolveFailed { name: String, cause: String },
    /// A transport-sensitive expression was read outside the transport it
    /// was declared in (spec.md §3 invariant 6).
    TransportBoundary {
        expr_id: ExprId,
        declared_in: String,
        current_in: String,
    },
    /// `@env.*` was used inside a non-idempotent transport block (spec.md
    /// §4.5, §8 property 5).
    EnvForbidden { decorator: String, span: Span },
    /// A `FunctionCall` statement named a function with no definition in
    /// the execution graph (spec.md §9: last-definition-wins, so this only
    /// fires when no definition exists at all).
    FunctionNotFound { name: String },
    /// A `For` blocker's collection expression evaluated to something other
    /// than `Value::List`.
    NotAList { actual_type: String, span: Span },
    /// A `BinaryOp` named an operator the evaluator cannot execute
    /// (currently only `BinOp::Range`, see `expr.rs`).
    UnknownOperator { op: String, span: Span },
    /// An IR node carried a blocker kind tag the builder doesn't recognize.
    UnknownBlockerKind { kind: String },
    /// An IR node carried an expression kind tag the builder doesn't
    /// recognize.
    UnknownExpressionKind { kind: String },
    /// A bug in the resolver itself (an invariant the resolver is supposed
    /// to maintain was violated) rather than a problem with the input.
    InternalError { message: String },
    /// Resolution was cancelled via a `CancellationHandle`.
    Canceled { cause: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseIncomplete { context } => write!(f, "incomplete input: {context}"),
            Self::UndefinedVariable { name, span } => write!(f, "{span}: undefined variable '{name}'"),
            Self::UnresolvedDecorator { key, span } => {
                write!(f, "{span}: decorator call '{key}' was never resolved")
            }
            Self::DecoratorResolveFailed { name, cause } => {
                write!(f, "decorator '{name}' failed to resolve: {cause}")
            }
            Self::TransportBoundary {
                expr_id,
                declared_in,
                current_in,
            } => write!(
                f,
                "transport boundary violation: expression {expr_id} declared under {declared_in} cannot be read under {current_in}"
            ),
            Self::EnvForbidden { decorator, span } => {
                write!(f, "{span}: '{decorator}' is forbidden inside a non-idempotent transport block")
            }
            Self::FunctionNotFound { name } => write!(f, "no definition found for function '{name}'"),
            Self::NotAList { actual_type, span } => {
                write!(f, "{span}: expected a list, found {actual_type}")
            }
            Self::UnknownOperator { op, span } => write!(f, "{span}: operator '{op}' cannot be evaluated"),
            Self::UnknownBlockerKind { kind } => write!(f, "unknown blocker kind '{kind}'"),
            Self::UnknownExpressionKind { kind } => write!(f, "unknown expression kind '{kind}'"),
            Self::InternalError { message } => write!(f, "internal resolver error: {message}"),
            Self::Canceled { cause } => write!(f, "resolution cancelled: {cause}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<EvalError> for ResolveError {
    fn from(error: EvalError) -> Self {
        match error {
            EvalError::UndefinedVariable { name, span } => Self::UndefinedVariable { name, span },
            EvalError::UnresolvedDecorator { key, span } => Self::UnresolvedDecorator { key, span },
            EvalError::CannotCompareNonNumeric { span } => Self::UnknownOperator {
                op: "<non-numeric comparison>".to_owned(),
                span,
            },
            EvalError::UnknownOperator { op, span } => Self::UnknownOperator { op, span },
        }
    }
}

impl From<TransportBoundaryViolation> for ResolveError {
    fn from(error: TransportBoundaryViolation) -> Self {
        Self::TransportBoundary {
            expr_id: error.expr_id,
            declared_in: error.declared_in.to_string(),
            current_in: error.current_in.to_string(),
        }
    }
}

impl From<CancelCause> for ResolveError {
    fn from(error: CancelCause) -> Self {
        Self::Canceled { cause: error.0 }
    }
}

/// Accumulates multiple `ResolveError`s (spec.md §7: resolution continues
/// collecting independent errors across a wave instead of stopping at the
/// first one, within a single top-level statement group).
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    errors: Vec<ResolveError>,
}

impl ErrorList {
    #[must_use]
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, error: ResolveError) {
        self.errors.push(error);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<ResolveError> {
        self.errors
    }

    #[must_use]
    pub fn as_slice(&self) -> &[ResolveError] {
        &self.errors
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "{}", self.errors[0]);
        }
        writeln!(f, "{} errors during resolution:", self.errors.len())?;
        for error in &self.errors {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
