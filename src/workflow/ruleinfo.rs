//! Directive Accumulator
//!
//! A [`RuleInfo`] collects the directives applied to a rule under
//! construction. Nothing is validated here; the registry validates the
//! accumulated values as a whole when the rule is finalized. Applying the
//! same directive twice keeps the later value.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use super::modifier::PathModifier;
use super::rule::ExecMethod;
use super::value::Value;

/// One input/output/log path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoPath {
    pub pattern: String,
    /// Declared through the grouped multi-extension construct
    pub multiext: bool,
    /// Removed once no consumer needs it any more
    pub temp: bool,
    /// Provided by the named sub-workflow
    pub subworkflow: Option<String>,
}

impl IoPath {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            multiext: false,
            temp: false,
            subworkflow: None,
        }
    }

    /// Expands `prefix` with every extension, flagging the results as one group.
    pub fn multiext(prefix: &str, extensions: &[&str]) -> Vec<Self> {
        extensions
            .iter()
            .map(|ext| Self {
                multiext: true,
                ..Self::new(format!("{}{}", prefix, ext))
            })
            .collect()
    }

    pub fn temp(pattern: impl Into<String>) -> Self {
        Self {
            temp: true,
            ..Self::new(pattern)
        }
    }

    pub fn from_subworkflow(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            subworkflow: Some(name.into()),
            ..Self::new(pattern)
        }
    }
}

impl From<&str> for IoPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Ordered positional and named path specs of one directive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InOutput {
    pub paths: Vec<IoPath>,
    pub named: IndexMap<String, IoPath>,
}

impl InOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a positional-only spec from plain path templates.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: patterns.into_iter().map(|p| IoPath::new(p)).collect(),
            named: IndexMap::new(),
        }
    }

    pub fn with_path(mut self, path: IoPath) -> Self {
        self.paths.push(path);
        self
    }

    pub fn with_named(mut self, name: impl Into<String>, path: IoPath) -> Self {
        self.named.insert(name.into(), path);
        self
    }

    /// All paths, positional first, then named in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &IoPath> {
        self.paths.iter().chain(self.named.values())
    }

    pub fn patterns(&self) -> Vec<String> {
        self.iter().map(|p| p.pattern.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&IoPath> {
        self.named.get(name)
    }

    pub fn len(&self) -> usize {
        self.paths.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a module path rewrite to every plain path.
    pub fn modify_paths(&mut self, modifier: &PathModifier) {
        for path in self.paths.iter_mut().chain(self.named.values_mut()) {
            if path.subworkflow.is_none() {
                path.pattern = modifier.modify(&path.pattern);
            }
        }
    }
}

/// Positional and named parameters of a rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub positional: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl Params {
    pub fn named(pairs: Vec<(&str, Value)>) -> Self {
        Self {
            positional: Vec::new(),
            named: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Container directive as written by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerDirective {
    /// `container: null`: no image, not even the global one
    Disabled,
    Image { url: String, containerized: bool },
}

/// A single directive applied to a rule under construction.
#[derive(Debug, Clone)]
pub enum Directive {
    Input(InOutput),
    Output(InOutput),
    Params(Params),
    Log(InOutput),
    Benchmark(IoPath),
    Threads(Value),
    Resources {
        positional: Vec<Value>,
        named: IndexMap<String, Value>,
    },
    Priority(Value),
    Retries(Value),
    Shadow(Value),
    Conda(String),
    Container(ContainerDirective),
    EnvModules(Vec<String>),
    Message(String),
    Group(String),
    Cache(Value),
    Handover(bool),
    Name(String),
    Docstring(String),
    DefaultTarget(Value),
    LocalRule(Value),
    WildcardConstraints(BTreeMap<String, String>),
    Version(String),
    Exec(ExecMethod),
}

impl Directive {
    /// Builds a resources directive from named values only.
    pub fn resources(named: Vec<(&str, Value)>) -> Self {
        Self::Resources {
            positional: Vec::new(),
            named: named.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    /// Directive keyword, as reported in errors.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Output(_) => "output",
            Self::Params(_) => "params",
            Self::Log(_) => "log",
            Self::Benchmark(_) => "benchmark",
            Self::Threads(_) => "threads",
            Self::Resources { .. } => "resources",
            Self::Priority(_) => "priority",
            Self::Retries(_) => "retries",
            Self::Shadow(_) => "shadow",
            Self::Conda(_) => "conda",
            Self::Container(_) => "container",
            Self::EnvModules(_) => "envmodules",
            Self::Message(_) => "message",
            Self::Group(_) => "group",
            Self::Cache(_) => "cache",
            Self::Handover(_) => "handover",
            Self::Name(_) => "name",
            Self::Docstring(_) => "docstring",
            Self::DefaultTarget(_) => "default_target",
            Self::LocalRule(_) => "localrule",
            Self::WildcardConstraints(_) => "wildcard_constraints",
            Self::Version(_) => "version",
            Self::Exec(_) => "execution",
        }
    }
}

/// Accumulated directive values of one rule.
#[derive(Debug, Clone, Default)]
pub struct RuleInfo {
    pub input: Option<InOutput>,
    pub output: Option<InOutput>,
    pub params: Option<Params>,
    pub log: Option<InOutput>,
    pub benchmark: Option<IoPath>,
    pub threads: Option<Value>,
    pub resources: Option<(Vec<Value>, IndexMap<String, Value>)>,
    pub priority: Option<Value>,
    pub retries: Option<Value>,
    pub shadow: Option<Value>,
    pub conda: Option<String>,
    pub container: Option<ContainerDirective>,
    pub env_modules: Option<Vec<String>>,
    pub message: Option<String>,
    pub group: Option<String>,
    pub cache: Option<Value>,
    pub handover: Option<bool>,
    pub name: Option<String>,
    pub docstring: Option<String>,
    pub default_target: Option<Value>,
    pub localrule: Option<Value>,
    pub wildcard_constraints: Option<BTreeMap<String, String>>,
    pub version: Option<String>,
    pub exec: Option<ExecMethod>,
}

impl RuleInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a directive, replacing any earlier value of the same kind.
    pub fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Input(v) => self.input = Some(v),
            Directive::Output(v) => self.output = Some(v),
            Directive::Params(v) => self.params = Some(v),
            Directive::Log(v) => self.log = Some(v),
            Directive::Benchmark(v) => self.benchmark = Some(v),
            Directive::Threads(v) => self.threads = Some(v),
            Directive::Resources { positional, named } => {
                self.resources = Some((positional, named))
            }
            Directive::Priority(v) => self.priority = Some(v),
            Directive::Retries(v) => self.retries = Some(v),
            Directive::Shadow(v) => self.shadow = Some(v),
            Directive::Conda(v) => self.conda = Some(v),
            Directive::Container(v) => self.container = Some(v),
            Directive::EnvModules(v) => self.env_modules = Some(v),
            Directive::Message(v) => self.message = Some(v),
            Directive::Group(v) => self.group = Some(v),
            Directive::Cache(v) => self.cache = Some(v),
            Directive::Handover(v) => self.handover = Some(v),
            Directive::Name(v) => self.name = Some(v),
            Directive::Docstring(v) => self.docstring = Some(v.trim().to_string()),
            Directive::DefaultTarget(v) => self.default_target = Some(v),
            Directive::LocalRule(v) => self.localrule = Some(v),
            Directive::WildcardConstraints(v) => self.wildcard_constraints = Some(v),
            Directive::Version(v) => self.version = Some(v),
            Directive::Exec(v) => self.exec = Some(v),
        }
    }

    /// Replaces every field that is set in `overwrite`.
    ///
    /// Used by `use rule ... with:` to specialize an inherited rule.
    pub fn apply_overwrite(&mut self, overwrite: &RuleInfo) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = &overwrite.$field {
                        self.$field = Some(value.clone());
                    }
                )*
            };
        }
        take!(
            input, output, params, log, benchmark, threads, resources, priority, retries,
            shadow, conda, container, env_modules, message, group, cache, handover, name,
            docstring, default_target, localrule, wildcard_constraints, version, exec
        );
    }

    /// True if the rule runs a shell command, script, notebook or wrapper.
    pub fn allows_software_env(&self) -> bool {
        self.exec
            .as_ref()
            .map(ExecMethod::allows_software_env)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiext_flags_group() {
        let paths = IoPath::multiext("ref/genome", &[".fa", ".fai"]);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].pattern, "ref/genome.fa");
        assert!(paths.iter().all(|p| p.multiext));
    }

    #[test]
    fn test_inoutput_iteration_order() {
        let io = InOutput::from_patterns(["a.txt"])
            .with_named("idx", IoPath::new("a.idx"))
            .with_path(IoPath::new("b.txt"));
        assert_eq!(io.patterns(), vec!["a.txt", "b.txt", "a.idx"]);
        assert_eq!(io.get("idx").unwrap().pattern, "a.idx");
        assert_eq!(io.len(), 3);
    }

    #[test]
    fn test_later_directive_overwrites_earlier() {
        let mut info = RuleInfo::new();
        info.apply(Directive::Threads(Value::Int(2)));
        info.apply(Directive::Threads(Value::Int(8)));
        assert_eq!(info.threads, Some(Value::Int(8)));
    }

    #[test]
    fn test_apply_overwrite_only_replaces_set_fields() {
        let mut base = RuleInfo::new();
        base.apply(Directive::Threads(Value::Int(2)));
        base.apply(Directive::Message("base".into()));

        let mut overwrite = RuleInfo::new();
        overwrite.apply(Directive::Threads(Value::Int(16)));

        base.apply_overwrite(&overwrite);
        assert_eq!(base.threads, Some(Value::Int(16)));
        assert_eq!(base.message.as_deref(), Some("base"));
    }

    #[test]
    fn test_docstring_trimmed() {
        let mut info = RuleInfo::new();
        info.apply(Directive::Docstring("  Align reads.\n".into()));
        assert_eq!(info.docstring.as_deref(), Some("Align reads."));
    }

    #[test]
    fn test_allows_software_env() {
        let mut info = RuleInfo::new();
        assert!(!info.allows_software_env());
        info.apply(Directive::Exec(ExecMethod::Shell("echo".into())));
        assert!(info.allows_software_env());
    }
}
