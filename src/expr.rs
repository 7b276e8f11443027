//! Expression model and evaluator (spec.md §4.1).
//!
//! Mirrors the donor interpreter's `expressions.rs`: a tagged-variant `Expr`
//! sum, one payload per variant, with source spans carried on each node.

use smallvec::SmallVec;
use strum::Display;

use crate::span::Span;
use crate::value::Value;

/// Binary operators, restricted to the set the evaluator actually knows how
/// to execute (spec.md §3: `{==, !=, <, <=, >, >=, &&, ||}`).
///
/// `Range` is carried so the IR builder can represent `When` range patterns
/// (`lo…hi`) as an ordinary `Expr::BinaryOp`, but the evaluator does not
/// implement it — spec.md §9 documents range/regex `When` patterns as
/// "evaluated only via equality", a known limitation of the system this was
/// distilled from, not a goal. Evaluating `Range` directly is an
/// `UnknownOperator` error; see `resolver.rs`'s `When` handling for how
/// range patterns are actually compared (by equality against the rendered
/// pattern value, same limitation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    // `==`
    Eq,
    // `!=`
    Ne,
    // `<`
    Lt,
    // `<=`
    Le,
    // `>`
    Gt,
    // `>=`
    Ge,
    // `&&`
    And,
    // `||`
    Or,
    // `…` (When range pattern; not executable, see type docs)
    Range,
}

/// One `@name.sel1.sel2(arg1, k=arg2)` reference.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecoratorRef {
    pub name: String,
    pub selector: SmallVec<[String; 2]>,
    pub args: Vec<Expr>,
    /// Parallel to `args`; empty string for a positional slot.
    pub arg_names: SmallVec<[String; 2]>,
}

impl DecoratorRef {
    /// The lookup key a prior resolution is recorded under:
    /// `<name>.<sel1>.<sel2>…` (spec.md §4.1).
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = self.name.clone();
        for seg in &self.selector {
            key.push('.');
            key.push_str(seg);
        }
        key
    }

    /// The raw used for var-decl exprId derivation: selector only, no
    /// arguments (spec.md §4.5, and the open question in spec.md §9 about
    /// whether this is intentional — kept as specified). Applies only to a
    /// `DecoratorRef` that is itself the direct value of a `VarDecl`; every
    /// other occurrence must use `canonical_raw_with_args` instead, or two
    /// differently-argued calls sharing a name/selector collide on exprId.
    #[must_use]
    pub fn canonical_raw(&self) -> String {
        format!("@{}", self.key())
    }

    /// The raw used for every occurrence that is not a var-decl's own value
    /// (command parts/args, nested decorator arguments): selector plus
    /// arguments, so differently-argued calls never share an exprId. Args
    /// aren't evaluated yet at collection time, so this serializes the
    /// argument expression trees themselves via their `serde` encoding, not
    /// their eventual values.
    #[must_use]
    pub fn canonical_raw_with_args(&self) -> String {
        if self.args.is_empty() {
            return self.canonical_raw();
        }
        let mut raw = self.canonical_raw();
        raw.push('(');
        for (i, (arg, name)) in self.args.iter().zip(self.arg_names.iter()).enumerate() {
            if i > 0 {
                raw.push(',');
            }
            if !name.is_empty() {
                raw.push_str(name);
                raw.push('=');
            }
            raw.push_str(&serde_json::to_string(arg).unwrap_or_default());
        }
        raw.push(')');
        raw
    }
}

/// An expression node, spanned (spec.md §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

impl Expr {
    #[must_use]
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self { span, kind }
    }
}

/// The four expression variants from spec.md §3.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ExprKind {
    Literal(Value),
    VarRef(String),
    DecoratorRef(DecoratorRef),
    BinaryOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Ordered sequence of expressions whose concatenation yields a shell
/// command string after rendering (spec.md §3).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CommandExpr {
    pub parts: SmallVec<[Expr; 4]>,
}

impl CommandExpr {
    #[must_use]
    pub fn new(parts: SmallVec<[Expr; 4]>) -> Self {
        Self { parts }
    }
}

/// Evaluation failure. Kept separate from `ResolveError` (error.rs) so the
/// pure-evaluator layer doesn't need to know about resolver-level concerns
/// like transport boundaries; `resolver.rs` wraps these into
/// `ResolveError` at the call site.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    UndefinedVariable { name: String, span: Span },
    UnresolvedDecorator { key: String, span: Span },
    CannotCompareNonNumeric { span: Span },
    UnknownOperator { op: String, span: Span },
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UndefinedVariable { name, span } => write!(f, "undefined variable '{name}' at {span}"),
            Self::UnresolvedDecorator { key, span } => write!(f, "unresolved decorator '{key}' at {span}"),
            Self::CannotCompareNonNumeric { span } => write!(f, "cannot compare non-numeric values at {span}"),
            Self::UnknownOperator { op, span } => write!(f, "unknown operator '{op}' at {span}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// A value lookup consulted by the evaluator: variable reads go through
/// `lookup_var`, decorator reads through `lookup_decorator` keyed by
/// `DecoratorRef::key()` (spec.md §4.1: "a prior resolution in the lookup
/// table under the key `<name>.<sel1>.<sel2>…`").
pub trait ExprEnv {
    fn lookup_var(&self, name: &str) -> Option<&Value>;
    fn lookup_decorator(&self, key: &str) -> Option<&Value>;
}

/// Evaluates a pure expression against `env`. Never mutates anything
/// reachable from `env` or `expr` — spec.md §8 property 7, "idempotence of
/// evaluation".
pub fn eval(expr: &Expr, env: &impl ExprEnv) -> Result<Value, EvalError> {
    match &expr.kind {
        ExprKind::Literal(value) => Ok(value.clone()),
        ExprKind::VarRef(name) => env
            .lookup_var(name)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedVariable {
                name: name.clone(),
                span: expr.span,
            }),
        ExprKind::DecoratorRef(decorator_ref) => {
            let key = decorator_ref.key();
            env.lookup_decorator(&key)
                .cloned()
                .ok_or_else(|| EvalError::UnresolvedDecorator { key, span: expr.span })
        }
        ExprKind::BinaryOp { op, left, right } => eval_binary_op(*op, left, right, env, expr.span),
    }
}

fn eval_binary_op(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    env: &impl ExprEnv,
    span: Span,
) -> Result<Value, EvalError> {
    match op {
        BinOp::And => {
            let left_val = eval(left, env)?;
            if !left_val.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(right, env)?.is_truthy()))
        }
        BinOp::Or => {
            let left_val = eval(left, env)?;
            if left_val.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(right, env)?.is_truthy()))
        }
        BinOp::Eq | BinOp::Ne => {
            let left_val = eval(left, env)?;
            let right_val = eval(right, env)?;
            let is_eq = values_equal(&left_val, &right_val);
            Ok(Value::Bool(if matches!(op, BinOp::Eq) { is_eq } else { !is_eq }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let left_val = eval(left, env)?;
            let right_val = eval(right, env)?;
            compare_numeric(op, &left_val, &right_val, span)
        }
        BinOp::Range => Err(EvalError::UnknownOperator {
            op: op.to_string(),
            span,
        }),
    }
}

/// Equality per spec.md §4.1: both-int compares as i64; both-numeric
/// compares as f64; else structural equality of identical types; else
/// false.
#[must_use]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a == b,
        _ if left.is_numeric() && right.is_numeric() => {
            left.as_f64().expect("numeric") == right.as_f64().expect("numeric")
        }
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y)),
        _ => false,
    }
}

fn compare_numeric(op: BinOp, left: &Value, right: &Value, span: Span) -> Result<Value, EvalError> {
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(EvalError::CannotCompareNonNumeric { span });
    };
    let result = match op {
        BinOp::Lt => a < b,
        BinOp::Le => a < b || a == b,
        BinOp::Gt => b < a,
        BinOp::Ge => b < a || a == b,
        _ => unreachable!("compare_numeric only called for ordering operators"),
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    struct MapEnv {
        vars: AHashMap<String, Value>,
        decorators: AHashMap<String, Value>,
    }

    impl ExprEnv for MapEnv {
        fn lookup_var(&self, name: &str) -> Option<&Value> {
            self.vars.get(name)
        }

        fn lookup_decorator(&self, key: &str) -> Option<&Value> {
            self.decorators.get(key)
        }
    }

    fn lit(value: Value) -> Expr {
        Expr::new(Span::synthetic(), ExprKind::Literal(value))
    }

    fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::new(
            Span::synthetic(),
            ExprKind::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    fn empty_env() -> MapEnv {
        MapEnv {
            vars: AHashMap::new(),
            decorators: AHashMap::new(),
        }
    }

    #[test]
    fn int_and_float_equality_compares_as_double() {
        let env = empty_env();
        let expr = binop(BinOp::Eq, lit(Value::Int(2)), lit(Value::Float(2.0)));
        assert_eq!(eval(&expr, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn string_vs_int_equality_is_false_not_error() {
        let env = empty_env();
        let expr = binop(BinOp::Eq, lit(Value::Str("2".into())), lit(Value::Int(2)));
        assert_eq!(eval(&expr, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn ordering_on_non_numeric_fails() {
        let env = empty_env();
        let expr = binop(BinOp::Lt, lit(Value::Str("a".into())), lit(Value::Str("b".into())));
        assert!(matches!(eval(&expr, &env), Err(EvalError::CannotCompareNonNumeric { .. })));
    }

    #[test]
    fn short_circuit_and_does_not_evaluate_right_when_left_false() {
        let env = empty_env();
        // right side references an undefined var; if evaluated this would error.
        let right = Expr::new(Span::synthetic(), ExprKind::VarRef("undefined".into()));
        let expr = binop(BinOp::And, lit(Value::Bool(false)), right);
        assert_eq!(eval(&expr, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn short_circuit_or_does_not_evaluate_right_when_left_true() {
        let env = empty_env();
        let right = Expr::new(Span::synthetic(), ExprKind::VarRef("undefined".into()));
        let expr = binop(BinOp::Or, lit(Value::Bool(true)), right);
        assert_eq!(eval(&expr, &env).unwrap(), Value::Bool(true));
    }

    #[test]
    fn truthiness_rules() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(Value::Str("x".into()).is_truthy());
    }

    #[test]
    fn undefined_variable_errors_with_name_and_span() {
        let env = empty_env();
        let expr = Expr::new(Span::synthetic(), ExprKind::VarRef("X".into()));
        let err = eval(&expr, &env).unwrap_err();
        assert!(matches!(err, EvalError::UndefinedVariable { name, .. } if name == "X"));
    }

    #[test]
    fn decorator_ref_resolves_through_lookup_table() {
        let mut env = empty_env();
        env.decorators.insert("env.HOME".into(), Value::Str("/home/x".into()));
        let expr = Expr::new(
            Span::synthetic(),
            ExprKind::DecoratorRef(DecoratorRef {
                name: "env".into(),
                selector: SmallVec::from_vec(vec!["HOME".into()]),
                args: vec![],
                arg_names: SmallVec::new(),
            }),
        );
        assert_eq!(eval(&expr, &env).unwrap(), Value::Str("/home/x".into()));
    }

    #[test]
    fn range_operator_is_not_executable() {
        let env = empty_env();
        let expr = binop(BinOp::Range, lit(Value::Int(1)), lit(Value::Int(10)));
        assert!(matches!(eval(&expr, &env), Err(EvalError::UnknownOperator { .. })));
    }

    fn secret_ref(key: &str) -> DecoratorRef {
        DecoratorRef {
            name: "aws".into(),
            selector: SmallVec::from_vec(vec!["secret".into()]),
            args: vec![lit(Value::Str(key.into()))],
            arg_names: SmallVec::from_vec(vec![String::new()]),
        }
    }

    #[test]
    fn canonical_raw_drops_arguments_but_with_args_variant_keeps_them() {
        let a = secret_ref("key1");
        let b = secret_ref("key2");
        assert_eq!(a.canonical_raw(), b.canonical_raw(), "var-decl raw is intentionally arg-blind");
        assert_ne!(
            a.canonical_raw_with_args(),
            b.canonical_raw_with_args(),
            "non-var-decl raw must distinguish differently-argued calls"
        );
    }

    #[test]
    fn canonical_raw_with_args_is_stable_for_identical_calls() {
        let a = secret_ref("key1");
        let b = secret_ref("key1");
        assert_eq!(a.canonical_raw_with_args(), b.canonical_raw_with_args());
    }
}
