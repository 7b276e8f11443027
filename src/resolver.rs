//! The resolver: wave-based traversal of an `ExecutionGraph` that collects
//! pending expressions, flushes them through the decorator registry in
//! batches, finalizes transport-boundary checks, and evaluates each blocker
//! in source order (spec.md §4.5).
//!
//! Grounded on the donor's evaluator loop shape (collect → dispatch → step)
//! but generic over the four external collaborators — `Vault`,
//! `DecoratorRegistry`, `CancellationHandle`, `TelemetrySink` — as type
//! parameters rather than `dyn` objects, mirroring `cancel.rs`'s zero-cost
//! convention: a caller who doesn't need telemetry or cancellation pays
//! nothing for the hooks.

use std::time::Instant;

use ahash::AHashMap;

use crate::cancel::CancellationHandle;
use crate::decorator::{DecoratorRegistry, ResolveContext, Transport, ValueCall};
use crate::error::{ErrorList, ResolveError};
use crate::expr::{DecoratorRef, Expr, ExprEnv, ExprKind, eval, values_equal};
use crate::scope::ScopeStack;
use crate::stmt::{Blocker, ExecutionGraph, ForIteration, Stmt, WhenArm, WHEN_ELSE_SENTINEL};
use crate::telemetry::{TelemetryLevel, TelemetrySink};
use crate::transport::{self, EnvAllowanceStack, TransportId};
use crate::value::Value;
use crate::vault::{ExprId, Vault};

/// Resolver configuration (spec.md §6: `config = {targetFunction, context,
/// planHash, stepPath, telemetrySink?, telemetryLevel}`).
pub struct ResolveConfig<'a, C: CancellationHandle, T: TelemetrySink> {
    /// Empty selects script mode; otherwise the name of the function to
    /// resolve (spec.md §4.5).
    pub target_function: String,
    pub context: &'a C,
    /// Overrides `vault.get_plan_key()` when set.
    pub plan_hash: Option<Vec<u8>>,
    pub step_path: String,
    pub telemetry: Option<&'a mut T>,
    pub telemetry_level: TelemetryLevel,
}

impl<'a, C: CancellationHandle, T: TelemetrySink> ResolveConfig<'a, C, T> {
    #[must_use]
    pub fn new(context: &'a C) -> Self {
        Self {
            target_function: String::new(),
            context,
            plan_hash: None,
            step_path: "planner.resolve".to_owned(),
            telemetry: None,
            telemetry_level: TelemetryLevel::default(),
        }
    }

    #[must_use]
    pub fn with_target_function(mut self, name: impl Into<String>) -> Self {
        self.target_function = name.into();
        self
    }

    #[must_use]
    pub fn with_plan_hash(mut self, plan_hash: Vec<u8>) -> Self {
        self.plan_hash = Some(plan_hash);
        self
    }

    #[must_use]
    pub fn with_step_path(mut self, step_path: impl Into<String>) -> Self {
        self.step_path = step_path.into();
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, sink: &'a mut T, level: TelemetryLevel) -> Self {
        self.telemetry = Some(sink);
        self.telemetry_level = level;
        self
    }
}

/// Resolver output (spec.md §6): the resolved statement tree plus every
/// decorator call's key → exprId, for callers that need to look a specific
/// call back up (e.g. rendering `@env.HOME` in a trace).
#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub statements: Vec<Stmt>,
    pub decorator_expr_ids: AHashMap<String, ExprId>,
}

/// Top-level entry point (spec.md §4.5: `Resolve(graph, vault, session,
/// config) → (ResolveResult, error)`).
pub fn resolve<V, R, C, T>(
    graph: &ExecutionGraph,
    vault: &mut V,
    registry: &R,
    config: ResolveConfig<'_, C, T>,
) -> Result<ResolveResult, ErrorList>
where
    V: Vault,
    R: DecoratorRegistry,
    C: CancellationHandle,
    T: TelemetrySink,
{
    let plan_hash = config.plan_hash.unwrap_or_else(|| vault.get_plan_key().to_vec());
    let mut engine = Engine {
        vault,
        registry,
        context: config.context,
        telemetry: config.telemetry,
        telemetry_level: config.telemetry_level,
        plan_hash,
        step_path: config.step_path,
        scope: ScopeStack::new(),
        env_allowance: EnvAllowanceStack::new(),
        session_stack: Vec::new(),
        decorator_expr_ids: AHashMap::new(),
        wave_counter: 0,
    };

    let statements = if config.target_function.is_empty() {
        engine.resolve_stmt_list(&graph.top_level_statements)?
    } else {
        let function = graph
            .functions
            .get(&config.target_function)
            .ok_or_else(|| single(ResolveError::FunctionNotFound { name: config.target_function.clone() }))?;
        engine.scope = function.scopes.clone();
        let prelude_len = (function.span.start.line as usize).min(graph.top_level_statements.len());
        engine.resolve_prelude(&graph.top_level_statements[..prelude_len])?;
        engine.resolve_stmt_list(&function.body)?
    };

    engine.vault.resolve_all_touched();

    Ok(ResolveResult {
        statements,
        decorator_expr_ids: engine.decorator_expr_ids,
    })
}

fn single(error: ResolveError) -> ErrorList {
    let mut list = ErrorList::new();
    list.push(error);
    list
}

/// One decorator invocation queued during collection, waiting for its
/// name-group to flush (spec.md §4.5 step 3).
struct PendingCall {
    expr_id: ExprId,
    key: String,
    primary: Option<String>,
    args: Vec<Expr>,
    arg_names: Vec<String>,
}

type PendingCalls = AHashMap<String, Vec<PendingCall>>;

/// Borrows the vault/scope/decorator-result table together so `expr::eval`
/// can read variables and prior decorator results uniformly (spec.md §4.1).
struct VaultEnv<'a, V: Vault> {
    vault: &'a V,
    scope: &'a ScopeStack,
    decorator_expr_ids: &'a AHashMap<String, ExprId>,
}

impl<'a, V: Vault> ExprEnv for VaultEnv<'a, V> {
    fn lookup_var(&self, name: &str) -> Option<&Value> {
        let id = self.scope.lookup(name)?;
        self.vault.get_unresolved_value(&id)
    }

    fn lookup_decorator(&self, key: &str) -> Option<&Value> {
        let id = self.decorator_expr_ids.get(key)?;
        self.vault.get_unresolved_value(id)
    }
}

struct Engine<'a, V: Vault, R: DecoratorRegistry, C: CancellationHandle, T: TelemetrySink> {
    vault: &'a mut V,
    registry: &'a R,
    context: &'a C,
    telemetry: Option<&'a mut T>,
    telemetry_level: TelemetryLevel,
    plan_hash: Vec<u8>,
    step_path: String,
    scope: ScopeStack,
    env_allowance: EnvAllowanceStack,
    /// Sessions opened by idempotent transport decorators, paired with their
    /// block (spec.md §4.5 step 4: "pushes it onto an internal session
    /// stack").
    session_stack: Vec<TransportId>,
    decorator_expr_ids: AHashMap<String, ExprId>,
    wave_counter: usize,
}

impl<'a, V: Vault, R: DecoratorRegistry, C: CancellationHandle, T: TelemetrySink> Engine<'a, V, R, C, T> {
    fn env(&self) -> VaultEnv<'_, V> {
        VaultEnv {
            vault: &*self.vault,
            scope: &self.scope,
            decorator_expr_ids: &self.decorator_expr_ids,
        }
    }

    fn poll_cancel(&self) -> Result<(), ErrorList> {
        self.context.check().map_err(|cause| single(ResolveError::from(cause)))
    }

    fn decorator_is_sensitive(&self, name: &str) -> bool {
        self.registry.lookup(name).is_some_and(|entry| entry.capabilities.transport_sensitive)
    }

    /// Whether a var-decl's value expression is transport-sensitive:
    /// contains a transport-sensitive decorator ref, or a var-ref to an
    /// already-sensitive exprId, transitively through binary operands and
    /// decorator arguments (spec.md §3 invariant 6).
    fn expr_is_sensitive(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Literal(_) => false,
            ExprKind::VarRef(name) => self
                .scope
                .lookup_raw(name)
                .is_some_and(|id| self.vault.is_expression_transport_sensitive(&id)),
            ExprKind::DecoratorRef(decorator_ref) => {
                self.decorator_is_sensitive(&decorator_ref.name)
                    || decorator_ref.args.iter().any(|arg| self.expr_is_sensitive(arg))
            }
            ExprKind::BinaryOp { left, right, .. } => self.expr_is_sensitive(left) || self.expr_is_sensitive(right),
        }
    }

    fn check_expr_boundary(&self, expr: &Expr) -> Result<(), ErrorList> {
        match &expr.kind {
            ExprKind::Literal(_) => Ok(()),
            ExprKind::VarRef(name) => {
                if let Some(id) = self.scope.lookup(name) {
                    self.vault.check_transport_boundary(&id).map_err(|e| single(e.into()))?;
                }
                Ok(())
            }
            ExprKind::DecoratorRef(decorator_ref) => {
                if let Some(id) = self.decorator_expr_ids.get(&decorator_ref.key()) {
                    self.vault.check_transport_boundary(id).map_err(|e| single(e.into()))?;
                }
                for arg in &decorator_ref.args {
                    self.check_expr_boundary(arg)?;
                }
                Ok(())
            }
            ExprKind::BinaryOp { left, right, .. } => {
                self.check_expr_boundary(left)?;
                self.check_expr_boundary(right)
            }
        }
    }

    /// Walks one expression tree, storing literals directly, marking
    /// var-refs touched, and queuing decorator-refs for batch resolution
    /// (spec.md §4.5 step 2).
    ///
    /// `is_var_decl_root` is true only when `expr` is itself the direct
    /// value of a `VarDecl` — the one case spec.md §9 accepts an
    /// arguments-blind exprId for. Every other occurrence (command parts,
    /// command args, nested decorator arguments) must distinguish calls
    /// that share a name/selector but differ in arguments, or two such
    /// calls collide on exprId and silently overwrite each other's value.
    fn collect_expr(&mut self, expr: &Expr, is_var_decl_root: bool, pending_calls: &mut PendingCalls, errors: &mut ErrorList) {
        match &expr.kind {
            ExprKind::Literal(value) => {
                let id = self.vault.track_expression(&format!("literal:{}", value.canonical_print()));
                self.vault.store_unresolved_value(&id, value.clone());
                self.vault.mark_touched(&id);
            }
            ExprKind::VarRef(name) => match self.scope.lookup(name) {
                Some(id) => self.vault.mark_touched(&id),
                None => errors.push(ResolveError::UndefinedVariable { name: name.clone(), span: expr.span }),
            },
            ExprKind::DecoratorRef(decorator_ref) => {
                if decorator_ref.name == "env" && !self.env_allowance.is_allowed() {
                    let decorator = self.env_allowance.forbidding_decorator().map_or_else(String::new, |n| format!("@{n}"));
                    errors.push(ResolveError::EnvForbidden { decorator, span: expr.span });
                }
                self.queue_decorator_call(decorator_ref, is_var_decl_root, pending_calls);
                for arg in &decorator_ref.args {
                    self.collect_expr(arg, false, pending_calls, errors);
                }
            }
            ExprKind::BinaryOp { left, right, .. } => {
                self.collect_expr(left, false, pending_calls, errors);
                self.collect_expr(right, false, pending_calls, errors);
            }
        }
    }

    fn queue_decorator_call(&mut self, decorator_ref: &DecoratorRef, is_var_decl_root: bool, pending_calls: &mut PendingCalls) {
        let sensitive = self.decorator_is_sensitive(&decorator_ref.name);
        let raw = if is_var_decl_root {
            decorator_ref.canonical_raw()
        } else {
            decorator_ref.canonical_raw_with_args()
        };
        let expr_id = if sensitive {
            self.vault.track_expression_transport_sensitive(&raw)
        } else {
            self.vault.track_expression(&raw)
        };
        pending_calls.entry(decorator_ref.name.clone()).or_default().push(PendingCall {
            expr_id,
            key: decorator_ref.key(),
            primary: decorator_ref.selector.first().cloned(),
            args: decorator_ref.args.clone(),
            arg_names: decorator_ref.arg_names.to_vec(),
        });
    }

    /// Resolves every queued decorator name-group, sorted by name (spec.md
    /// §5: "decorator groups are flushed in sorted-by-name order"), and
    /// records each call's result and DisplayID-eligible touched state.
    fn flush_decorator_calls(&mut self, pending_calls: &mut PendingCalls) -> Result<(), ErrorList> {
        if pending_calls.is_empty() {
            return Ok(());
        }
        self.wave_counter += 1;
        if let Some(sink) = self.telemetry.as_mut() {
            sink.on_wave_start(self.wave_counter);
        }

        let mut names: Vec<String> = pending_calls.keys().cloned().collect();
        names.sort();

        for name in names {
            let calls = pending_calls.remove(&name).expect("name came from this map's own keys");
            let mut value_calls = Vec::with_capacity(calls.len());
            for call in &calls {
                let mut params = AHashMap::new();
                for (idx, (arg_expr, arg_name)) in call.args.iter().zip(call.arg_names.iter()).enumerate() {
                    let value = eval(arg_expr, &self.env()).map_err(|e| single(ResolveError::from(e)))?;
                    let key = if arg_name.is_empty() { format!("arg{idx}") } else { arg_name.clone() };
                    params.insert(key, value);
                }
                value_calls.push(ValueCall {
                    path: name.clone(),
                    primary: call.primary.clone(),
                    params,
                });
            }

            let current_transport = self.vault.current_transport();
            let start = (self.telemetry_level == TelemetryLevel::Timing).then(Instant::now);
            let ctx = ResolveContext {
                plan_hash: hex_encode(&self.plan_hash),
                step_path: self.step_path.clone(),
            };
            let results = self
                .registry
                .resolve_values(&ctx, &current_transport, &value_calls)
                .map_err(|cause| single(ResolveError::DecoratorResolveFailed { name: name.clone(), cause }))?;
            if results.len() != calls.len() {
                return Err(single(ResolveError::InternalError {
                    message: format!(
                        "decorator '{name}' returned {} results for {} calls",
                        results.len(),
                        calls.len()
                    ),
                }));
            }
            let elapsed = start.map(|s| s.elapsed());
            if let Some(sink) = self.telemetry.as_mut() {
                sink.on_decorator_batch(&name, calls.len(), elapsed);
            }

            for (call, value) in calls.into_iter().zip(results) {
                self.vault.store_unresolved_value(&call.expr_id, value);
                self.vault.mark_touched(&call.expr_id);
                self.decorator_expr_ids.insert(call.key, call.expr_id);
            }
        }

        if let Some(sink) = self.telemetry.as_mut() {
            sink.on_wave_end(self.wave_counter);
        }
        Ok(())
    }

    fn collect_stmt(&mut self, stmt: Stmt, pending_calls: &mut PendingCalls, errors: &mut ErrorList) -> Stmt {
        match &stmt {
            Stmt::VarDecl { value, .. } => self.collect_expr(value, true, pending_calls, errors),
            Stmt::Command { command, args, redirect_target, .. } => {
                if let Some(cmd) = command {
                    for part in &cmd.parts {
                        self.collect_expr(part, false, pending_calls, errors);
                    }
                }
                for arg in args {
                    self.collect_expr(&arg.value, false, pending_calls, errors);
                }
                if let Some(redirect) = redirect_target {
                    for part in &redirect.parts {
                        self.collect_expr(part, false, pending_calls, errors);
                    }
                }
            }
            _ => unreachable!("collect_stmt only called for VarDecl/Command"),
        }
        stmt
    }

    /// Finalize phase (spec.md §4.5 step 4): transport-boundary checks, then
    /// var-decl exprId assignment or recursive command-block resolution.
    /// Errors here are fatal and returned immediately, not accumulated.
    fn finalize_stmt(&mut self, stmt: Stmt) -> Result<Stmt, ErrorList> {
        match stmt {
            Stmt::VarDecl { name, value, expr_id: _ } => {
                self.check_expr_boundary(&value)?;
                let computed = eval(&value, &self.env()).map_err(|e| single(ResolveError::from(e)))?;
                let raw = match &value.kind {
                    ExprKind::Literal(_) | ExprKind::BinaryOp { .. } => {
                        format!("literal:{}", computed.canonical_print())
                    }
                    ExprKind::DecoratorRef(decorator_ref) => decorator_ref.canonical_raw(),
                    ExprKind::VarRef(referenced_name) => {
                        let referenced = self.scope.lookup(referenced_name).ok_or_else(|| {
                            single(ResolveError::UndefinedVariable { name: referenced_name.clone(), span: value.span })
                        })?;
                        format!("varref:{referenced_name}:{referenced}")
                    }
                };
                let sensitive = self.expr_is_sensitive(&value);
                let id = if sensitive {
                    self.vault.declare_variable_transport_sensitive(&name, &raw)
                } else {
                    self.vault.declare_variable(&name, &raw)
                };
                self.vault.store_unresolved_value(&id, computed);
                self.vault.mark_touched(&id);
                self.scope.define(name.clone(), id.clone());
                Ok(Stmt::VarDecl { name, value, expr_id: id })
            }
            Stmt::Command { decorator, command, args, block, operator, redirect_mode, redirect_target } => {
                if let Some(cmd) = &command {
                    for part in &cmd.parts {
                        self.check_expr_boundary(part)?;
                    }
                }
                for arg in &args {
                    self.check_expr_boundary(&arg.value)?;
                }
                if let Some(redirect) = &redirect_target {
                    for part in &redirect.parts {
                        self.check_expr_boundary(part)?;
                    }
                }

                let decorator_name = decorator.trim_start_matches('@').to_owned();
                let transport_info = self
                    .registry
                    .lookup(&decorator_name)
                    .map(|entry| (entry.capabilities, entry.transport.is_some()));

                let resolved_block = match transport_info {
                    Some((capabilities, true)) => {
                        self.resolve_transport_block(&decorator_name, &args, block, capabilities.idempotent)?
                    }
                    _ => {
                        self.scope.push();
                        let resolved = self.resolve_stmt_list(&block);
                        self.scope.pop();
                        resolved?
                    }
                };

                Ok(Stmt::Command {
                    decorator,
                    command,
                    args,
                    block: resolved_block,
                    operator,
                    redirect_mode,
                    redirect_target,
                })
            }
            _ => unreachable!("finalize_stmt only called for VarDecl/Command"),
        }
    }

    /// Command-block transport handling (spec.md §4.5 step 4's five
    /// sub-steps): derive the new transport id, enter it, permit or forbid
    /// `@env` for the block's duration, open a session if idempotent, and
    /// unconditionally undo all of that on every exit path including error
    /// returns.
    fn resolve_transport_block(
        &mut self,
        decorator_name: &str,
        args: &[crate::stmt::CommandArg],
        block: Vec<Stmt>,
        idempotent: bool,
    ) -> Result<Vec<Stmt>, ErrorList> {
        let mut params = AHashMap::new();
        for (idx, arg) in args.iter().enumerate() {
            let value = eval(&arg.value, &self.env()).map_err(|e| single(ResolveError::from(e)))?;
            let key = if arg.name.is_empty() { format!("arg{idx}") } else { arg.name.clone() };
            params.insert(key, value);
        }

        let parent = self.vault.current_transport();
        let new_transport = transport::derive_transport_id(&self.plan_hash, decorator_name, &params, parent.as_str());
        self.vault.enter_transport(new_transport.clone());
        self.env_allowance.push(idempotent, decorator_name);

        if idempotent {
            if let Some(entry) = self.registry.lookup(decorator_name)
                && let Some(transport_impl) = &entry.transport
            {
                let session = transport_impl.open(&parent, &params);
                self.session_stack.push(session);
            }
        }

        self.scope.push();
        let result = self.resolve_stmt_list(&block);
        self.scope.pop();

        if idempotent && self.registry.lookup(decorator_name).is_some_and(|e| e.transport.is_some()) {
            self.session_stack.pop();
        }
        self.env_allowance.pop();
        self.vault.leave_transport();

        result
    }

    /// Evaluates a blocker's condition/collection for a pure read — no
    /// mutation, used ahead of branch selection (spec.md §4.1 property 7).
    fn eval_condition(&self, expr: &Expr) -> Result<Value, ErrorList> {
        eval(expr, &self.env()).map_err(|e| single(ResolveError::from(e)))
    }

    fn eval_blocker(&mut self, blocker: &Blocker) -> Result<Blocker, ErrorList> {
        match blocker {
            Blocker::If { condition, then_branch, else_branch, .. } => self.eval_if(condition, then_branch, else_branch),
            Blocker::When { condition, arms, .. } => self.eval_when(condition, arms),
            Blocker::For { loop_var, collection, then_branch, .. } => self.eval_for(loop_var, collection, then_branch),
        }
    }

    fn eval_if(&mut self, condition: &Expr, then_branch: &[Stmt], else_branch: &Option<Vec<Stmt>>) -> Result<Blocker, ErrorList> {
        let taken = self.eval_condition(condition)?.is_truthy();
        if let Some(sink) = self.telemetry.as_mut() {
            sink.on_branch_pruned(taken);
        }
        if taken {
            self.scope.push();
            let resolved = self.resolve_stmt_list(then_branch);
            self.scope.pop();
            Ok(Blocker::If {
                condition: condition.clone(),
                then_branch: resolved?,
                else_branch: None,
                taken: Some(true),
            })
        } else if let Some(else_stmts) = else_branch {
            self.scope.push();
            let resolved = self.resolve_stmt_list(else_stmts);
            self.scope.pop();
            Ok(Blocker::If {
                condition: condition.clone(),
                then_branch: Vec::new(),
                else_branch: Some(resolved?),
                taken: Some(false),
            })
        } else {
            Ok(Blocker::If {
                condition: condition.clone(),
                then_branch: Vec::new(),
                else_branch: None,
                taken: Some(false),
            })
        }
    }

    fn eval_when(&mut self, condition: &Expr, arms: &[WhenArm]) -> Result<Blocker, ErrorList> {
        let cond_value = self.eval_condition(condition)?;
        let mut matched_index = None;
        let mut matched_body = Vec::new();

        for (idx, arm) in arms.iter().enumerate() {
            let is_else = matches!(&arm.pattern.kind, ExprKind::Literal(Value::Str(s)) if s == WHEN_ELSE_SENTINEL);
            let matches = is_else || {
                let pattern_value = self.eval_condition(&arm.pattern)?;
                values_equal(&pattern_value, &cond_value)
            };
            if matches {
                self.scope.push();
                let resolved = self.resolve_stmt_list(&arm.body);
                self.scope.pop();
                matched_body = resolved?;
                matched_index = Some(idx);
                break;
            }
        }

        if let Some(sink) = self.telemetry.as_mut() {
            sink.on_branch_pruned(matched_index.is_some());
        }

        let new_arms = arms
            .iter()
            .enumerate()
            .map(|(idx, arm)| WhenArm {
                pattern: arm.pattern.clone(),
                body: if Some(idx) == matched_index { std::mem::take(&mut matched_body) } else { Vec::new() },
            })
            .collect();

        Ok(Blocker::When { condition: condition.clone(), arms: new_arms, matched_arm: matched_index })
    }

    fn eval_for(&mut self, loop_var: &str, collection: &Expr, then_branch: &[Stmt]) -> Result<Blocker, ErrorList> {
        let collection_value = self.eval_condition(collection)?;
        let Value::List(items) = collection_value else {
            return Err(single(ResolveError::NotAList {
                actual_type: collection_value.kind_name().to_owned(),
                span: collection.span,
            }));
        };

        let mut iterations = Vec::with_capacity(items.len());
        for item in items {
            self.poll_cancel()?;
            self.scope.push();
            let raw = format!("literal:{}", item.canonical_print());
            let loop_id = self.vault.declare_variable(loop_var, &raw);
            self.vault.store_unresolved_value(&loop_id, item.clone());
            self.vault.mark_touched(&loop_id);
            self.scope.define(loop_var, loop_id);
            // Each iteration resolves an independent deep copy of the body
            // template so per-iteration exprIds stay pairwise distinct
            // (spec.md §8 property 3: loop independence).
            let body_copy = then_branch.to_vec();
            let resolved = self.resolve_stmt_list(&body_copy);
            self.scope.pop();
            iterations.push(ForIteration { value: item, body: resolved? });
        }

        if let Some(sink) = self.telemetry.as_mut() {
            sink.on_loop_unrolled(iterations.len());
        }

        Ok(Blocker::For {
            loop_var: loop_var.to_owned(),
            collection: collection.clone(),
            then_branch: Vec::new(),
            iterations,
        })
    }

    fn eval_structural(&mut self, stmt: &Stmt) -> Result<Stmt, ErrorList> {
        match stmt {
            Stmt::Blocker(blocker) => Ok(Stmt::Blocker(self.eval_blocker(blocker)?)),
            Stmt::Try { try_block, catch_block, finally_block, error_var } => {
                self.scope.push();
                let resolved_try = self.resolve_stmt_list(try_block);
                self.scope.pop();
                let resolved_try = resolved_try?;

                self.scope.push();
                if let Some(name) = error_var {
                    let id = self.vault.declare_variable(name, &format!("error_var:{name}"));
                    self.vault.store_unresolved_value(&id, Value::Nil);
                    self.scope.define(name.clone(), id);
                }
                let resolved_catch = self.resolve_stmt_list(catch_block);
                self.scope.pop();
                let resolved_catch = resolved_catch?;

                self.scope.push();
                let resolved_finally = self.resolve_stmt_list(finally_block);
                self.scope.pop();
                let resolved_finally = resolved_finally?;

                Ok(Stmt::Try {
                    try_block: resolved_try,
                    catch_block: resolved_catch,
                    finally_block: resolved_finally,
                    error_var: error_var.clone(),
                })
            }
            Stmt::CallTrace { label, block } => {
                self.scope.push();
                let resolved = self.resolve_stmt_list(block);
                self.scope.pop();
                Ok(Stmt::CallTrace { label: label.clone(), block: resolved? })
            }
            _ => unreachable!("eval_structural only called for Blocker/Try/CallTrace"),
        }
    }

    /// Flushes any queued decorator calls and collection-phase errors, then
    /// finalizes every statement collected since the last flush, appending
    /// the finalized results onto `result` (spec.md §4.5 step 3-4).
    fn flush_pending(
        &mut self,
        pending: &mut Vec<Stmt>,
        pending_calls: &mut PendingCalls,
        errors: &mut ErrorList,
        result: &mut Vec<Stmt>,
    ) -> Result<(), ErrorList> {
        self.flush_decorator_calls(pending_calls)?;
        if !errors.is_empty() {
            return Err(std::mem::take(errors));
        }
        for stmt in pending.drain(..) {
            let finalized = self.finalize_stmt(stmt)?;
            result.push(finalized);
        }
        Ok(())
    }

    /// The wave loop over one statement list (spec.md §4.5): accumulate
    /// pending var-decls/commands until a blocker/try/call-trace is reached,
    /// flush, finalize, then evaluate the structural statement; repeat.
    fn resolve_stmt_list(&mut self, stmts: &[Stmt]) -> Result<Vec<Stmt>, ErrorList> {
        let mut result = Vec::with_capacity(stmts.len());
        let mut pending: Vec<Stmt> = Vec::new();
        let mut pending_calls: PendingCalls = AHashMap::new();
        let mut errors = ErrorList::new();

        for stmt in stmts {
            self.poll_cancel()?;
            match stmt {
                Stmt::VarDecl { .. } | Stmt::Command { .. } => {
                    let collected = self.collect_stmt(stmt.clone(), &mut pending_calls, &mut errors);
                    pending.push(collected);
                }
                Stmt::Blocker(_) | Stmt::Try { .. } | Stmt::CallTrace { .. } => {
                    self.flush_pending(&mut pending, &mut pending_calls, &mut errors, &mut result)?;
                    let resolved = self.eval_structural(stmt)?;
                    result.push(resolved);
                }
                Stmt::FunctionCall { name, .. } => {
                    return Err(single(ResolveError::InternalError {
                        message: format!("FunctionCall '{name}' survived IR building"),
                    }));
                }
            }
        }
        self.flush_pending(&mut pending, &mut pending_calls, &mut errors, &mut result)?;
        Ok(result)
    }

    /// The prelude pass run before resolving a selected function's body
    /// (spec.md §4.5): only var-decls and blockers that precede the
    /// function's definition run, purely for their scope/vault side
    /// effects — commands and try-blocks are skipped, and the resolved tree
    /// it produces is discarded.
    fn resolve_prelude(&mut self, stmts: &[Stmt]) -> Result<(), ErrorList> {
        let mut pending: Vec<Stmt> = Vec::new();
        let mut pending_calls: PendingCalls = AHashMap::new();
        let mut errors = ErrorList::new();
        let mut discard = Vec::new();

        for stmt in stmts {
            self.poll_cancel()?;
            match stmt {
                Stmt::VarDecl { .. } => {
                    let collected = self.collect_stmt(stmt.clone(), &mut pending_calls, &mut errors);
                    pending.push(collected);
                }
                Stmt::Blocker(_) => {
                    self.flush_pending(&mut pending, &mut pending_calls, &mut errors, &mut discard)?;
                    self.eval_structural(stmt)?;
                }
                _ => {}
            }
        }
        self.flush_pending(&mut pending, &mut pending_calls, &mut errors, &mut discard)?;
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::NeverCancel;
    use crate::decorator::{Capabilities, DecoratorEntry, StaticRegistry};
    use crate::ir;
    use crate::ir::{Event, NodeKind, Token, TokenKind};
    use crate::telemetry::NoopSink;
    use crate::transport::deterministic_root_transport;
    use crate::vault::InMemoryVault;

    fn ident(text: &str) -> Token {
        Token::new(TokenKind::Ident, text, false)
    }

    fn num(text: &str, space: bool) -> Token {
        Token::new(TokenKind::Number, text, space)
    }

    fn plain_vault() -> InMemoryVault {
        InMemoryVault::new(b"salt".to_vec(), deterministic_root_transport(b"salt"))
    }

    fn env_registry() -> StaticRegistry {
        let mut registry = StaticRegistry::new();
        registry.register(
            "env",
            DecoratorEntry {
                capabilities: Capabilities { idempotent: true, transport_sensitive: true },
                transport: None,
            },
            |calls| {
                calls
                    .iter()
                    .map(|call| Ok(Value::Str(format!("value-of-{}", call.primary.clone().unwrap_or_default()))))
                    .collect()
            },
        );
        registry
    }

    fn resolve_graph(events: &[Event]) -> Result<ResolveResult, ErrorList> {
        let graph = ir::build(events).expect("valid event stream");
        let registry = env_registry();
        let mut vault = plain_vault();
        let context = NeverCancel;
        let config = ResolveConfig::<NeverCancel, NoopSink>::new(&context);
        resolve(&graph, &mut vault, &registry, config)
    }

    #[test]
    fn simple_var_decl_resolves_to_literal_value() {
        let events = vec![
            Event::Open(NodeKind::VarDecl),
            Event::Token(ident("X")),
            Event::Token(num("1", true)),
            Event::Close(NodeKind::VarDecl),
        ];
        let result = resolve_graph(&events).expect("resolves");
        assert_eq!(result.statements.len(), 1);
        assert!(matches!(&result.statements[0], Stmt::VarDecl { name, .. } if name == "X"));
    }

    #[test]
    fn undefined_variable_reference_is_an_error() {
        let events = vec![
            Event::Open(NodeKind::VarDecl),
            Event::Token(ident("X")),
            Event::Token(ident("Y")),
            Event::Close(NodeKind::VarDecl),
        ];
        let err = resolve_graph(&events).expect_err("Y is undefined");
        assert!(err.as_slice().iter().any(|e| matches!(e, ResolveError::UndefinedVariable { name, .. } if name == "Y")));
    }

    #[test]
    fn if_blocker_prunes_the_untaken_branch() {
        let events = vec![
            Event::Open(NodeKind::If),
            Event::Token(num("1", false)),
            Event::Open(NodeKind::Then),
            Event::Open(NodeKind::Block),
            Event::Open(NodeKind::VarDecl),
            Event::Token(ident("A")),
            Event::Token(num("1", true)),
            Event::Close(NodeKind::VarDecl),
            Event::Close(NodeKind::Block),
            Event::Close(NodeKind::Then),
            Event::Open(NodeKind::Else),
            Event::Open(NodeKind::Block),
            Event::Open(NodeKind::VarDecl),
            Event::Token(ident("B")),
            Event::Token(num("2", true)),
            Event::Close(NodeKind::VarDecl),
            Event::Close(NodeKind::Block),
            Event::Close(NodeKind::Else),
            Event::Close(NodeKind::If),
        ];
        let result = resolve_graph(&events).expect("resolves");
        let Stmt::Blocker(Blocker::If { then_branch, else_branch, taken, .. }) = &result.statements[0] else {
            panic!("expected If blocker");
        };
        assert_eq!(*taken, Some(true));
        assert_eq!(then_branch.len(), 1);
        assert!(else_branch.is_none());
    }

    #[test]
    fn for_loop_unrolls_one_iteration_per_item_with_distinct_expr_ids() {
        // Loop mechanics are exercised directly against `eval_for` with a
        // hand-built literal list, rather than routing a list value through
        // the decorator registry fixture (which only ever returns strings).
        let registry = env_registry();
        let mut vault = plain_vault();
        let context = NeverCancel;
        let config = ResolveConfig::<NeverCancel, NoopSink>::new(&context);
        let mut engine = {
            let plan_hash = vault.get_plan_key().to_vec();
            Engine {
                vault: &mut vault,
                registry: &registry,
                context: &context,
                telemetry: None::<&mut NoopSink>,
                telemetry_level: config.telemetry_level,
                plan_hash,
                step_path: config.step_path,
                scope: ScopeStack::new(),
                env_allowance: EnvAllowanceStack::new(),
                session_stack: Vec::new(),
                decorator_expr_ids: AHashMap::new(),
                wave_counter: 0,
            }
        };
        let collection = Expr::new(
            crate::span::Span::synthetic(),
            ExprKind::Literal(Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
        );
        let body = vec![Stmt::VarDecl {
            name: "copy".into(),
            value: Expr::new(crate::span::Span::synthetic(), ExprKind::VarRef("item".into())),
            expr_id: ExprId::from_raw("placeholder:copy"),
        }];
        let blocker = engine.eval_for("item", &collection, &body).expect("resolves");
        let Blocker::For { iterations, .. } = blocker else {
            panic!("expected For blocker");
        };
        assert_eq!(iterations.len(), 3);
        let ids: Vec<&ExprId> = iterations
            .iter()
            .map(|it| match &it.body[0] {
                Stmt::VarDecl { expr_id, .. } => expr_id,
                _ => panic!("expected VarDecl"),
            })
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn env_decorator_forbidden_inside_non_idempotent_transport_block() {
        let mut registry = env_registry();
        registry.register(
            "ssh",
            DecoratorEntry {
                capabilities: Capabilities { idempotent: false, transport_sensitive: false },
                transport: Some(Box::new(NonIdempotentTransport)),
            },
            |calls| calls.iter().map(|_| Ok(Value::Nil)).collect(),
        );

        let events = vec![
            Event::Open(NodeKind::Decorator),
            Event::Token(ident("ssh")),
            Event::Open(NodeKind::ArgList),
            Event::Close(NodeKind::ArgList),
            Event::Open(NodeKind::Block),
            Event::Open(NodeKind::VarDecl),
            Event::Token(ident("X")),
            Event::Open(NodeKind::Decorator),
            Event::Token(ident("env")),
            Event::Token(ident("HOME")),
            Event::Close(NodeKind::Decorator),
            Event::Close(NodeKind::VarDecl),
            Event::Close(NodeKind::Block),
            Event::Close(NodeKind::Decorator),
        ];
        let graph = ir::build(&events).expect("valid event stream");
        let mut vault = plain_vault();
        let context = NeverCancel;
        let config = ResolveConfig::<NeverCancel, NoopSink>::new(&context);
        let err = resolve(&graph, &mut vault, &registry, config).expect_err("env should be forbidden");
        assert!(err.as_slice().iter().any(|e| matches!(e, ResolveError::EnvForbidden { decorator, .. } if decorator == "@ssh")));
    }

    #[derive(Debug)]
    struct NonIdempotentTransport;

    impl Transport for NonIdempotentTransport {
        fn open(&self, _parent: &TransportId, _params: &AHashMap<String, Value>) -> TransportId {
            TransportId::from_raw("transport:ssh-session")
        }
    }

    #[test]
    fn function_not_found_is_an_error() {
        let graph = crate::stmt::ExecutionGraph::default();
        let registry = env_registry();
        let mut vault = plain_vault();
        let context = NeverCancel;
        let config = ResolveConfig::<NeverCancel, NoopSink>::new(&context).with_target_function("missing");
        let err = resolve(&graph, &mut vault, &registry, config).expect_err("no such function");
        assert!(err.as_slice().iter().any(|e| matches!(e, ResolveError::FunctionNotFound { name } if name == "missing")));
    }
}
