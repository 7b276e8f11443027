//! The decorator registry external collaborator (spec.md §4.6, §6): batched
//! resolution of `@name.sel(args)` calls, plus the capability metadata the
//! resolver needs to drive transport-boundary and env-allowance behavior.
//!
//! Grounded on the donor's `capability.rs`: permissions (here, a
//! decorator's `Capabilities`) are data attached to a registered entry and
//! checked by the caller, not baked into the call itself.

use std::fmt;

use ahash::AHashMap;

use crate::transport::TransportId;
use crate::value::Value;

/// One decorator invocation queued for batch resolution (spec.md §4.5 step
/// 3: `ValueCall{path, primary: first selector if any, params: argN →
/// evaluated arg}`).
#[derive(Debug, Clone)]
pub struct ValueCall {
    /// The decorator name all calls in a batch share, e.g. `"env"`.
    pub path: String,
    /// The first selector segment, if the reference had one (`@env.HOME` →
    /// `Some("HOME")`).
    pub primary: Option<String>,
    /// Named/positional arguments, evaluated to values before the call.
    pub params: AHashMap<String, Value>,
}

/// Whether a decorator is safe to call more than once with the same
/// arguments, and whether its result may not cross a transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Idempotent transport decorators open a session and permit `@env`
    /// inside their block (spec.md §4.5 step 4).
    pub idempotent: bool,
    /// Values produced by this decorator may only be read under the
    /// transport they were produced under (spec.md §3 invariant 6).
    pub transport_sensitive: bool,
}

/// A transport decorator's session factory (spec.md §4.5 step 4:
/// `transport.Open(parent, params)`).
pub trait Transport: fmt::Debug {
    fn open(&self, parent: &TransportId, params: &AHashMap<String, Value>) -> TransportId;
}

/// Everything the resolver needs to know about a registered decorator
/// besides how to call it (spec.md §6: "each entry exposes
/// `Descriptor.Capabilities.{Idempotent, TransportSensitive}` and possibly
/// a `Transport`").
pub struct DecoratorEntry {
    pub capabilities: Capabilities,
    pub transport: Option<Box<dyn Transport>>,
}

impl fmt::Debug for DecoratorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratorEntry")
            .field("capabilities", &self.capabilities)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// Ambient context passed to the registry's batch call. Spec.md §6 leaves
/// the shape of this opaque ("ctx") beyond naming it — this crate gives it
/// a plan hash and the configured provenance prefix, the two pieces of
/// plan-wide identity `ResolveConfig` already carries (spec.md §6:
/// `planHash`, `stepPath`).
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub plan_hash: String,
    pub step_path: String,
}

/// The decorator registry contract (spec.md §6): `Global().ResolveValues(ctx,
/// scope, calls…) → (results[], error)`; `Global().Lookup(name) → (entry,
/// found)`.
///
/// "Process-wide and read-only during resolution" (spec.md §5) — the trait
/// takes `&self`, not `&mut self`.
pub trait DecoratorRegistry: fmt::Debug {
    /// Resolves a batch of calls that all share one decorator name. Returns
    /// one value per call, in call order (spec.md §6: "ordering matches the
    /// input call ordering exactly").
    fn resolve_values(
        &self,
        ctx: &ResolveContext,
        scope: &TransportId,
        calls: &[ValueCall],
    ) -> Result<Vec<Value>, String>;

    fn lookup(&self, name: &str) -> Option<&DecoratorEntry>;
}

/// A fixed, explicitly-populated registry. Suitable for tests and for
/// embedding a small fixed set of built-in decorators (`@env`, `@ssh`, …)
/// without standing up a plugin system.
#[derive(Default)]
pub struct StaticRegistry {
    entries: AHashMap<String, DecoratorEntry>,
    resolvers: AHashMap<String, Box<dyn Fn(&[ValueCall]) -> Result<Vec<Value>, String>>>,
}

impl fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            resolvers: AHashMap::new(),
        }
    }

    /// Registers a decorator by name with its capabilities and resolver
    /// function. The resolver receives every call in a batch at once so it
    /// can itself issue one external request for many selectors.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        entry: DecoratorEntry,
        resolve: impl Fn(&[ValueCall]) -> Result<Vec<Value>, String> + 'static,
    ) {
        let name = name.into();
        self.entries.insert(name.clone(), entry);
        self.resolvers.insert(name, Box::new(resolve));
    }
}

impl DecoratorRegistry for StaticRegistry {
    fn resolve_values(&self, _ctx: &ResolveContext, _scope: &TransportId, calls: &[ValueCall]) -> Result<Vec<Value>, String> {
        let Some(first) = calls.first() else {
            return Ok(Vec::new());
        };
        let resolver = self
            .resolvers
            .get(&first.path)
            .ok_or_else(|| format!("no resolver registered for decorator '{}'", first.path))?;
        let results = resolver(calls)?;
        if results.len() != calls.len() {
            return Err(format!(
                "resolver for '{}' returned {} results for {} calls",
                first.path,
                results.len(),
                calls.len()
            ));
        }
        Ok(results)
    }

    fn lookup(&self, name: &str) -> Option<&DecoratorEntry> {
        self.entries.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_registry() -> StaticRegistry {
        let mut env_vars = AHashMap::new();
        env_vars.insert("HOME".to_owned(), "/home/opal".to_owned());
        env_vars.insert("USER".to_owned(), "opal".to_owned());

        let mut registry = StaticRegistry::new();
        registry.register(
            "env",
            DecoratorEntry {
                capabilities: Capabilities {
                    idempotent: true,
                    transport_sensitive: true,
                },
                transport: None,
            },
            move |calls| {
                calls
                    .iter()
                    .map(|call| {
                        let key = call.primary.clone().unwrap_or_default();
                        env_vars
                            .get(&key)
                            .cloned()
                            .map(Value::Str)
                            .ok_or_else(|| format!("undefined env var '{key}'"))
                    })
                    .collect()
            },
        );
        registry
    }

    fn call(primary: &str) -> ValueCall {
        ValueCall {
            path: "env".to_owned(),
            primary: Some(primary.to_owned()),
            params: AHashMap::new(),
        }
    }

    #[test]
    fn lookup_returns_registered_capabilities() {
        let registry = env_registry();
        let entry = registry.lookup("env").expect("env should be registered");
        assert!(entry.capabilities.idempotent);
        assert!(entry.capabilities.transport_sensitive);
    }

    #[test]
    fn lookup_misses_unregistered_decorator() {
        let registry = env_registry();
        assert!(registry.lookup("aws").is_none());
    }

    #[test]
    fn batch_resolves_one_value_per_call_in_order() {
        let registry = env_registry();
        let ctx = ResolveContext::default();
        let scope = TransportId::from_raw("transport:local");
        let calls = vec![call("HOME"), call("USER")];
        let results = registry.resolve_values(&ctx, &scope, &calls).unwrap();
        assert_eq!(results, vec![Value::Str("/home/opal".into()), Value::Str("opal".into())]);
    }

    #[test]
    fn unresolvable_selector_surfaces_as_error() {
        let registry = env_registry();
        let ctx = ResolveContext::default();
        let scope = TransportId::from_raw("transport:local");
        let calls = vec![call("NOT_SET")];
        assert!(registry.resolve_values(&ctx, &scope, &calls).is_err());
    }

    #[test]
    fn empty_batch_resolves_to_empty_results() {
        let registry = env_registry();
        let ctx = ResolveContext::default();
        let scope = TransportId::from_raw("transport:local");
        assert_eq!(registry.resolve_values(&ctx, &scope, &[]).unwrap(), Vec::<Value>::new());
    }
}
