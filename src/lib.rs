//! Plan-time resolver and execution-graph materializer for the opal
//! scripting language: takes an `Event`/`Token` stream from an external
//! parser, builds an `ExecutionGraph`, and resolves it wave by wave against
//! a `Vault`, a `DecoratorRegistry`, and the decorator registry's transport
//! boundaries (see `SPEC_FULL.md`).

mod cancel;
mod decorator;
mod error;
mod expr;
mod idgen;
mod ir;
mod resolver;
mod scope;
mod span;
mod stmt;
mod telemetry;
mod transport;
mod value;
mod vault;

pub use crate::{
    cancel::{CancelCause, CancellationHandle, FlagCancellation, NeverCancel},
    decorator::{Capabilities, DecoratorEntry, DecoratorRegistry, ResolveContext, StaticRegistry, Transport, ValueCall},
    error::{ErrorList, ResolveError},
    expr::{BinOp, CommandExpr, DecoratorRef, EvalError, Expr, ExprEnv, ExprKind, eval, values_equal},
    ir::{Event, NodeKind, Token, TokenKind, build},
    resolver::{ResolveConfig, ResolveResult, resolve},
    scope::ScopeStack,
    span::{CodeLoc, Span},
    stmt::{
        Blocker, CommandArg, CommandOperator, ExecutionGraph, ForIteration, Function, Param, RedirectMode, Stmt,
        WhenArm, WHEN_ELSE_SENTINEL,
    },
    telemetry::{CountingSink, DecoratorStats, NoopSink, TelemetryLevel, TelemetrySink},
    transport::{EnvAllowanceStack, TransportId, deterministic_root_transport, derive_transport_id},
    value::Value,
    vault::{DisplayId, ExprId, InMemoryVault, TransportBoundaryViolation, Vault},
};
