//! Directive Values
//!
//! Directive arguments arrive loosely typed (a thread count may be an
//! integer, a float or a function) and are validated when applied to a
//! rule. Resource values that depend on a job are kept as [`Resolver`]s
//! and only evaluated once the job is materialized.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A fully evaluated resource or parameter value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Str(value) => write!(f, "{}", value),
        }
    }
}

/// Job attributes visible to resolver functions.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext<'a> {
    pub rule: &'a str,
    pub wildcards: BTreeMap<String, String>,
    pub input: Vec<String>,
    pub attempt: u32,
    /// Total cores available to the run (`_cores` of the global pool)
    pub cores: i64,
}

type ResolverFn = dyn Fn(&ResolveContext<'_>) -> Literal + Send + Sync;

/// A named function computing a value per job.
#[derive(Clone)]
pub struct Resolver {
    name: String,
    func: Arc<ResolverFn>,
}

impl Resolver {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&ResolveContext<'_>) -> Literal + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, ctx: &ResolveContext<'_>) -> Literal {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolver({})", self.name)
    }
}

impl PartialEq for Resolver {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Entry of a rule's resource map.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    Int(i64),
    Str(String),
    Resolver(Resolver),
}

impl ResourceValue {
    /// Evaluates the value for one job.
    pub fn evaluate(&self, ctx: &ResolveContext<'_>) -> Literal {
        match self {
            Self::Int(value) => Literal::Int(*value),
            Self::Str(value) => Literal::Str(value.clone()),
            Self::Resolver(resolver) => resolver.call(ctx),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<i64> for ResourceValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Literal> for ResourceValue {
    fn from(value: Literal) -> Self {
        match value {
            Literal::Int(v) => Self::Int(v),
            Literal::Str(v) => Self::Str(v),
        }
    }
}

/// Loosely typed argument of a directive, prior to validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Resolver(Resolver),
}

impl Value {
    /// Short type description used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "mapping",
            Self::Resolver(_) => "function",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value for shell substitution and provenance records.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.render()))
                .collect::<Vec<_>>()
                .join(" "),
            Self::Resolver(r) => format!("<{}>", r.name()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Resolver> for Value {
    fn from(value: Resolver) -> Self {
        Self::Resolver(value)
    }
}

/// Concrete job attributes handed to inline rule functions.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub rule: String,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub wildcards: BTreeMap<String, String>,
    pub threads: i64,
    pub resources: BTreeMap<String, Literal>,
    pub log: Vec<String>,
    pub workdir: PathBuf,
}

type RunFn = dyn Fn(&JobContext) -> Result<(), String> + Send + Sync;

/// Inline function body of a rule (the `run` execution method).
#[derive(Clone)]
pub struct InlineFn {
    name: String,
    func: Arc<RunFn>,
}

impl InlineFn {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&JobContext) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, ctx: &JobContext) -> Result<(), String> {
        (self.func)(ctx)
    }
}

impl fmt::Debug for InlineFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InlineFn({})", self.name)
    }
}

impl PartialEq for InlineFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_evaluated_lazily_per_job() {
        let resolver = Resolver::new("mem", |ctx| Literal::Int(ctx.attempt as i64 * 1000));
        let value = ResourceValue::Resolver(resolver);

        let first = ResolveContext {
            attempt: 1,
            ..Default::default()
        };
        let second = ResolveContext {
            attempt: 2,
            ..Default::default()
        };
        assert_eq!(value.evaluate(&first), Literal::Int(1000));
        assert_eq!(value.evaluate(&second), Literal::Int(2000));
        assert_eq!(value.as_int(), None);
    }

    #[test]
    fn test_value_kind_and_render() {
        assert_eq!(Value::from(3.9).kind(), "float");
        assert_eq!(Value::from("x").kind(), "string");
        assert_eq!(
            Value::List(vec![Value::from(1), Value::from("a")]).render(),
            "1 a"
        );
    }

    #[test]
    fn test_literal_display() {
        assert_eq!(Literal::Int(4).to_string(), "4");
        assert_eq!(Literal::Str("fast".into()).to_string(), "fast");
    }

    #[test]
    fn test_inline_fn_call() {
        let f = InlineFn::new("touch", |ctx| {
            if ctx.output.is_empty() {
                Err("no output".into())
            } else {
                Ok(())
            }
        });
        assert!(f.call(&JobContext::default()).is_err());
        let ctx = JobContext {
            output: vec!["x".into()],
            ..Default::default()
        };
        assert!(f.call(&ctx).is_ok());
    }
}
