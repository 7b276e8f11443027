//! The Vault external-collaborator contract (spec.md §4.4) plus
//! `InMemoryVault`, a concrete, deterministic reference implementation.
//!
//! Grounded on the donor's `capability.rs` (trait-first: policy lives behind
//! a trait so the resolver never hardcodes a concrete store) and
//! `namespace.rs` (id minting with a dedup/reuse table).

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::idgen::keyed_digest_b64url;
use crate::transport::TransportId;
use crate::value::Value;

/// Opaque identity of an expression occurrence (spec.md §3).
///
/// Two expressions with identical raw serialization always yield identical
/// ids — this is enforced by `InMemoryVault` deduplicating on `raw`, not by
/// anything intrinsic to the type itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ExprId(String);

impl ExprId {
    /// Mints an id from a raw serialization. Not itself deduplicating —
    /// callers (the Vault) are responsible for the identity invariant.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        Self(format!("expr:{}", crate::idgen::sha256_b64url(raw.as_bytes(), 16)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque placeholder that stands in for a resolved value in the emitted
/// plan (spec.md §3): `opal:<22 base64url chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DisplayId(String);

impl DisplayId {
    #[must_use]
    pub fn mint(salt: &[u8], value: &Value) -> Self {
        let encoded = keyed_digest_b64url(salt, value.canonical_print().as_bytes(), 16);
        Self(format!("opal:{encoded}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raised by `Vault::check_transport_boundary` (spec.md §3 invariant 6, §7
/// `TransportBoundary`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBoundaryViolation {
    pub expr_id: ExprId,
    pub declared_in: TransportId,
    pub current_in: TransportId,
}

impl fmt::Display for TransportBoundaryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transport boundary violation: expression {} declared under {} cannot be read under {}",
            self.expr_id, self.declared_in, self.current_in
        )
    }
}

impl std::error::Error for TransportBoundaryViolation {}

/// The Vault contract (spec.md §4.4). The resolver treats implementations
/// as atomic operations on a thread-confined object (spec.md §5).
pub trait Vault {
    fn declare_variable(&mut self, name: &str, raw: &str) -> ExprId;
    fn declare_variable_transport_sensitive(&mut self, name: &str, raw: &str) -> ExprId;
    fn track_expression(&mut self, raw: &str) -> ExprId;
    fn track_expression_transport_sensitive(&mut self, raw: &str) -> ExprId;

    fn store_unresolved_value(&mut self, id: &ExprId, value: Value);
    fn get_unresolved_value(&self, id: &ExprId) -> Option<&Value>;
    fn mark_touched(&mut self, id: &ExprId);
    /// Assigns DisplayIDs in bulk for every touched exprId (spec.md §4.4).
    fn resolve_all_touched(&mut self);
    fn display_id(&self, id: &ExprId) -> Option<&DisplayId>;

    fn is_expression_transport_sensitive(&self, id: &ExprId) -> bool;

    fn enter_transport(&mut self, id: TransportId);
    /// Pops the transport context pushed by the matching `enter_transport`.
    /// Not named in spec.md §4.4's operation list verbatim, but required by
    /// §5's "push/pop … must be paired on every exit path" — the Vault owns
    /// the transport stack, so it must expose how to unwind it.
    fn leave_transport(&mut self);
    fn current_transport(&self) -> TransportId;
    fn get_plan_key(&self) -> &[u8];

    fn check_transport_boundary(&self, id: &ExprId) -> Result<(), TransportBoundaryViolation>;
}

/// Deterministic, in-memory reference implementation. Suitable both for
/// embedding a real planner and for the test suite.
#[derive(Debug)]
pub struct InMemoryVault {
    plan_key: Vec<u8>,
    /// raw serialization -> exprId, enforcing the identity invariant.
    raw_to_id: AHashMap<String, ExprId>,
    values: AHashMap<ExprId, Value>,
    touched: AHashSet<ExprId>,
    display_ids: AHashMap<ExprId, DisplayId>,
    sensitive: AHashSet<ExprId>,
    declared_in: AHashMap<ExprId, TransportId>,
    transport_stack: Vec<TransportId>,
}

impl InMemoryVault {
    #[must_use]
    pub fn new(plan_key: Vec<u8>, root_transport: TransportId) -> Self {
        Self {
            plan_key,
            raw_to_id: AHashMap::new(),
            values: AHashMap::new(),
            touched: AHashSet::new(),
            display_ids: AHashMap::new(),
            sensitive: AHashSet::new(),
            declared_in: AHashMap::new(),
            transport_stack: vec![root_transport],
        }
    }

    fn mint_or_reuse(&mut self, raw: &str, sensitive: bool) -> ExprId {
        if let Some(id) = self.raw_to_id.get(raw) {
            return id.clone();
        }
        let id = ExprId::from_raw(raw);
        self.raw_to_id.insert(raw.to_owned(), id.clone());
        self.declared_in.insert(id.clone(), self.current_transport());
        if sensitive {
            self.sensitive.insert(id.clone());
        }
        id
    }

    /// Returns every exprId touched since the last `resolve_all_touched`
    /// call, for tests that want to assert on batching/pruning behavior.
    #[must_use]
    pub fn touched_ids(&self) -> Vec<ExprId> {
        self.touched.iter().cloned().collect()
    }
}

impl Vault for InMemoryVault {
    fn declare_variable(&mut self, _name: &str, raw: &str) -> ExprId {
        self.mint_or_reuse(raw, false)
    }

    fn declare_variable_transport_sensitive(&mut self, _name: &str, raw: &str) -> ExprId {
        self.mint_or_reuse(raw, true)
    }

    fn track_expression(&mut self, raw: &str) -> ExprId {
        self.mint_or_reuse(raw, false)
    }

    fn track_expression_transport_sensitive(&mut self, raw: &str) -> ExprId {
        self.mint_or_reuse(raw, true)
    }

    fn store_unresolved_value(&mut self, id: &ExprId, value: Value) {
        self.values.insert(id.clone(), value);
    }

    fn get_unresolved_value(&self, id: &ExprId) -> Option<&Value> {
        self.values.get(id)
    }

    fn mark_touched(&mut self, id: &ExprId) {
        self.touched.insert(id.clone());
    }

    fn resolve_all_touched(&mut self) {
        for id in &self.touched {
            if self.display_ids.contains_key(id) {
                continue;
            }
            if let Some(value) = self.values.get(id) {
                let display_id = DisplayId::mint(&self.plan_key, value);
                self.display_ids.insert(id.clone(), display_id);
            }
        }
    }

    fn display_id(&self, id: &ExprId) -> Option<&DisplayId> {
        self.display_ids.get(id)
    }

    fn is_expression_transport_sensitive(&self, id: &ExprId) -> bool {
        self.sensitive.contains(id)
    }

    fn enter_transport(&mut self, id: TransportId) {
        self.transport_stack.push(id);
    }

    fn leave_transport(&mut self) {
        if self.transport_stack.len() > 1 {
            self.transport_stack.pop();
        }
    }

    fn current_transport(&self) -> TransportId {
        self.transport_stack
            .last()
            .cloned()
            .expect("transport stack always has the root transport")
    }

    fn get_plan_key(&self) -> &[u8] {
        &self.plan_key
    }

    fn check_transport_boundary(&self, id: &ExprId) -> Result<(), TransportBoundaryViolation> {
        if !self.is_expression_transport_sensitive(id) {
            return Ok(());
        }
        let Some(declared_in) = self.declared_in.get(id) else {
            return Ok(());
        };
        let current_in = self.current_transport();
        if *declared_in == current_in {
            return Ok(());
        }
        Err(TransportBoundaryViolation {
            expr_id: id.clone(),
            declared_in: declared_in.clone(),
            current_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::deterministic_root_transport;

    fn vault() -> InMemoryVault {
        InMemoryVault::new(b"plan-salt".to_vec(), deterministic_root_transport(b"plan-salt"))
    }

    #[test]
    fn identical_raw_yields_identical_expr_id() {
        let mut v = vault();
        let a = v.declare_variable("X", "literal:1");
        let b = v.declare_variable("Y", "literal:1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_raw_yields_different_expr_id() {
        let mut v = vault();
        let a = v.declare_variable("X", "literal:1");
        let b = v.declare_variable("X", "literal:2");
        assert_ne!(a, b);
    }

    #[test]
    fn display_id_only_minted_after_resolve_all_touched() {
        let mut v = vault();
        let id = v.track_expression("literal:\"hi\"");
        v.store_unresolved_value(&id, Value::Str("hi".into()));
        assert!(v.display_id(&id).is_none());
        v.mark_touched(&id);
        v.resolve_all_touched();
        assert!(v.display_id(&id).is_some());
    }

    #[test]
    fn untouched_expressions_never_get_display_ids() {
        let mut v = vault();
        let id = v.track_expression("literal:\"hi\"");
        v.store_unresolved_value(&id, Value::Str("hi".into()));
        v.resolve_all_touched();
        assert!(v.display_id(&id).is_none());
    }

    #[test]
    fn transport_boundary_violation_when_crossing() {
        let mut v = vault();
        let id = v.declare_variable_transport_sensitive("LOCAL_HOME", "env:HOME");
        let other = TransportId::from_raw("transport:other-context");
        v.enter_transport(other.clone());
        let err = v.check_transport_boundary(&id).unwrap_err();
        assert_eq!(err.current_in, other);
    }

    #[test]
    fn same_transport_is_not_a_violation() {
        let mut v = vault();
        let id = v.declare_variable_transport_sensitive("LOCAL_HOME", "env:HOME");
        assert!(v.check_transport_boundary(&id).is_ok());
    }

    #[test]
    fn non_sensitive_expressions_never_violate_boundary() {
        let mut v = vault();
        let id = v.declare_variable("ENV", "literal:\"prod\"");
        v.enter_transport(TransportId::from_raw("transport:ssh"));
        assert!(v.check_transport_boundary(&id).is_ok());
    }

    #[test]
    fn enter_leave_transport_is_a_paired_stack() {
        let mut v = vault();
        let root = v.current_transport();
        v.enter_transport(TransportId::from_raw("transport:inner"));
        assert_ne!(v.current_transport(), root);
        v.leave_transport();
        assert_eq!(v.current_transport(), root);
    }

    #[test]
    fn leave_transport_on_root_is_noop() {
        let mut v = vault();
        let root = v.current_transport();
        v.leave_transport();
        assert_eq!(v.current_transport(), root);
    }
}
