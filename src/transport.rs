//! Transport identity derivation and env-allowance tracking (spec.md §4.6).

use std::fmt;

use ahash::AHashMap;

use crate::idgen::keyed_digest_b64url;
use crate::value::Value;

/// `transport:<id>` — deterministic identity of an execution context
/// (local, SSH, container, …).
///
/// spec.md §3 states the suffix is "16 base64url chars" while spec.md §4.6's
/// algorithm says to keep 16 *bytes* of the digest before encoding (which
/// yields 22 chars, matching DisplayID's encoding). We follow the
/// procedural algorithm in §4.6 over the prose summary in §3 — a
/// byte/char mismatch in descriptive prose is far more likely than an error
/// in a spelled-out, numbered algorithm — so transport ids use the same
/// 16-byte/22-char shape as DisplayID. Recorded in DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TransportId(String);

impl TransportId {
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type-tags a value for the canonical descriptor encoding (spec.md §4.6
/// step 1). Composite/unknown shapes (`List`) fall back to canonical JSON,
/// matching the spec's `json:` catch-all; there is no `bytes:` tag here
/// since this crate's `Value` has no binary variant.
fn tag_and_value(value: &Value) -> String {
    match value {
        Value::Nil => "null:".to_owned(),
        Value::Bool(b) => format!("bool:{b}"),
        Value::Int(i) => format!("int64:{i}"),
        Value::Float(f) => format!("float64:{f:?}"),
        Value::Str(s) => format!("string:{s}"),
        Value::List(_) => {
            let json = serde_json::to_string(&value_to_json(value)).unwrap_or_default();
            format!("json:{json}")
        }
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    }
}

/// Builds the canonical descriptor bytes: `name\0parent\0` followed by
/// `key=tag:value\0` for each arg, sorted by key for determinism (spec.md
/// §4.6 step 1, §5 "decorator groups are flushed in sorted-by-name order").
fn build_descriptor(decorator_name: &str, parent_id: &str, args: &AHashMap<String, Value>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(decorator_name.len() + parent_id.len() + args.len() * 16 + 2);
    buf.extend_from_slice(decorator_name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(parent_id.as_bytes());
    buf.push(0);

    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    for key in keys {
        buf.extend_from_slice(key.as_bytes());
        buf.push(b'=');
        buf.extend_from_slice(tag_and_value(&args[key]).as_bytes());
        buf.push(0);
    }
    buf
}

/// `deriveTransportID(planKey, decoratorName, args, parentId)` (spec.md
/// §4.6).
#[must_use]
pub fn derive_transport_id(
    plan_key: &[u8],
    decorator_name: &str,
    args: &AHashMap<String, Value>,
    parent_id: &str,
) -> TransportId {
    let descriptor = build_descriptor(decorator_name, parent_id, args);
    let encoded = keyed_digest_b64url(plan_key, &descriptor, 16);
    TransportId(format!("transport:{encoded}"))
}

/// The local root transport, entered before resolution begins (spec.md
/// §4.6: `deriveTransportID(planKey, "local", nil, "")`).
#[must_use]
pub fn deterministic_root_transport(plan_key: &[u8]) -> TransportId {
    derive_transport_id(plan_key, "local", &AHashMap::new(), "")
}

/// Independent stack mirroring scope pushes, tracking whether `@env` is
/// currently permitted (spec.md §4.5, §8 property 5).
///
/// Once a non-idempotent transport block forbids `@env`, no nested block —
/// idempotent or not — can re-allow it. Each frame also carries the name of
/// the transport decorator responsible for the current forbidding state (if
/// any), so an `EnvForbidden` error can name the non-idempotent transport
/// decorator (spec.md §4.5 step 5, §8 scenario 5) rather than the `@env`
/// reference it forbids.
#[derive(Debug, Clone, Default)]
pub struct EnvAllowanceStack {
    frames: Vec<(bool, Option<String>)>,
}

impl EnvAllowanceStack {
    #[must_use]
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.frames.last().is_none_or(|(allowed, _)| *allowed)
    }

    /// The transport decorator currently forbidding `@env`, if any.
    #[must_use]
    pub fn forbidding_decorator(&self) -> Option<&str> {
        self.frames.last().and_then(|(allowed, name)| if *allowed { None } else { name.as_deref() })
    }

    /// Pushes a new frame for entering a transport block with the given
    /// idempotency. `@env` remains allowed only if it was already allowed
    /// *and* this block is idempotent; once forbidden, the original
    /// forbidding decorator's name carries forward unchanged through nested
    /// frames rather than being replaced by theirs.
    pub fn push(&mut self, idempotent: bool, decorator_name: &str) {
        match self.frames.last() {
            Some((false, name)) => {
                let name = name.clone();
                self.frames.push((false, name));
            }
            _ if idempotent => self.frames.push((true, None)),
            _ => self.frames.push((false, Some(decorator_name.to_owned()))),
        }
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }
}
