//! Rule Data Model
//!
//! A [`Rule`] is a finalized transformation step: what it reads, what it
//! writes, how it runs and what it needs. Rules are produced by the
//! registry from an accumulated [`RuleInfo`] and are not mutated after
//! registration.
//!
//! # Example
//!
//! ```
//! use rulerunner::workflow::{Directive, ExecMethod, InOutput, Registry, Value};
//!
//! let mut registry = Registry::default();
//! let mut handle = registry.register(Some("align"), false).unwrap();
//! registry.apply_directive(&mut handle, Directive::Input(InOutput::from_patterns(["{sample}.fq"]))).unwrap();
//! registry.apply_directive(&mut handle, Directive::Output(InOutput::from_patterns(["{sample}.bam"]))).unwrap();
//! registry.apply_directive(&mut handle, Directive::Threads(Value::Int(4))).unwrap();
//! registry.apply_directive(&mut handle, Directive::Exec(ExecMethod::Shell("bwa {input} > {output}".into()))).unwrap();
//! registry.finalize(handle).unwrap();
//!
//! let rule = registry.get_rule("align").unwrap();
//! assert_eq!(rule.threads(), Some(4));
//! assert!(rule.has_wildcards());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use super::ruleinfo::{InOutput, IoPath, Params, RuleInfo};
use super::value::{InlineFn, ResourceValue};
use super::wildcards::extract_wildcard_names;

/// Reserved resource holding the thread count.
pub const CORES: &str = "_cores";
/// Reserved resource holding the node count.
pub const NODES: &str = "_nodes";

/// How a rule produces its outputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExecMethod {
    /// Dependency-only rule, nothing is executed
    #[default]
    NoRun,
    Run(InlineFn),
    Shell(String),
    Script(String),
    Notebook(String),
    Wrapper(String),
    TemplateEngine(String),
}

impl ExecMethod {
    /// Methods that may be combined with conda, containers or env modules.
    pub fn allows_software_env(&self) -> bool {
        matches!(
            self,
            Self::Shell(_) | Self::Script(_) | Self::Notebook(_) | Self::Wrapper(_)
        )
    }

    /// Text identifying the code of the rule, used for provenance.
    pub fn code(&self) -> String {
        match self {
            Self::NoRun => String::new(),
            Self::Run(f) => format!("run:{}", f.name()),
            Self::Shell(cmd) => cmd.clone(),
            Self::Script(path) => format!("script:{}", path),
            Self::Notebook(path) => format!("notebook:{}", path),
            Self::Wrapper(name) => format!("wrapper:{}", name),
            Self::TemplateEngine(engine) => format!("template_engine:{}", engine),
        }
    }
}

/// Shadow directory isolation of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowMode {
    #[default]
    None,
    Minimal,
    CopyMinimal,
    Shallow,
    Full,
}

impl ShadowMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minimal" => Some(Self::Minimal),
            "copy-minimal" => Some(Self::CopyMinimal),
            "shallow" => Some(Self::Shallow),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Between-workflow cache eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    All,
    OmitSoftware,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::OmitSoftware => "omit-software",
        }
    }
}

/// Software environment of a rule.
///
/// When environment modules are given they take precedence over conda
/// and containers at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    pub conda: Option<String>,
    pub env_modules: Vec<String>,
    pub container: Option<String>,
    pub is_containerized: bool,
}

impl Environment {
    pub fn is_empty(&self) -> bool {
        self.conda.is_none() && self.env_modules.is_empty() && self.container.is_none()
    }
}

/// A finalized rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub input: InOutput,
    pub output: InOutput,
    pub log: InOutput,
    pub benchmark: Option<IoPath>,
    pub params: Params,
    pub resources: BTreeMap<String, ResourceValue>,
    pub priority: f64,
    pub restart_times: u32,
    pub shadow: ShadowMode,
    pub exec: ExecMethod,
    pub environment: Environment,
    pub group: Option<String>,
    pub is_checkpoint: bool,
    pub is_handover: bool,
    pub wildcard_constraints: BTreeMap<String, String>,
    pub docstring: Option<String>,
    pub message: Option<String>,
    pub version: Option<String>,
    /// Directory of the definition file the rule came from
    pub basedir: Option<PathBuf>,
    /// Directives the rule was built from, kept for `use rule` cloning
    pub info: RuleInfo,
}

impl Rule {
    /// Creates an empty rule, as referenced by name before any directive.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: InOutput::new(),
            output: InOutput::new(),
            log: InOutput::new(),
            benchmark: None,
            params: Params::default(),
            resources: BTreeMap::new(),
            priority: 0.0,
            restart_times: 0,
            shadow: ShadowMode::None,
            exec: ExecMethod::NoRun,
            environment: Environment::default(),
            group: None,
            is_checkpoint: false,
            is_handover: false,
            wildcard_constraints: BTreeMap::new(),
            docstring: None,
            message: None,
            version: None,
            basedir: None,
            info: RuleInfo::default(),
        }
    }

    /// Thread count if it is a plain integer.
    pub fn threads(&self) -> Option<i64> {
        self.resources.get(CORES).and_then(ResourceValue::as_int)
    }

    pub fn is_norun(&self) -> bool {
        self.exec == ExecMethod::NoRun
    }

    pub fn is_template_engine(&self) -> bool {
        matches!(self.exec, ExecMethod::TemplateEngine(_))
    }

    /// True if any output contains a wildcard.
    pub fn has_wildcards(&self) -> bool {
        !self.wildcard_names().is_empty()
    }

    /// Wildcard names declared by the outputs.
    pub fn wildcard_names(&self) -> BTreeSet<String> {
        self.output
            .iter()
            .flat_map(|p| extract_wildcard_names(&p.pattern))
            .collect()
    }

    /// Checks that input and log wildcards are all defined by the outputs.
    pub fn undefined_wildcards(&self) -> Vec<String> {
        let defined = self.wildcard_names();
        let mut missing: Vec<String> = self
            .input
            .iter()
            .chain(self.log.iter())
            .filter(|p| p.subworkflow.is_none())
            .flat_map(|p| extract_wildcard_names(&p.pattern))
            .filter(|name| !defined.contains(name))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Read-only view for referencing this rule from other rules.
    pub fn proxy(&self) -> RuleProxy {
        RuleProxy {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            log: self.log.clone(),
            params: self.params.clone(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Read-only snapshot of a finalized rule's files and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleProxy {
    pub name: String,
    pub input: InOutput,
    pub output: InOutput,
    pub log: InOutput,
    pub params: Params,
}

impl RuleProxy {
    /// Looks up `input`, `output` or `log` by position or name.
    pub fn file(&self, section: &str, key: &str) -> Option<&IoPath> {
        let io = match section {
            "input" => &self.input,
            "output" => &self.output,
            "log" => &self.log,
            _ => return None,
        };
        match key.parse::<usize>() {
            Ok(index) => io.iter().nth(index),
            Err(_) => io.get(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> Rule {
        let mut rule = Rule::new("align");
        rule.input = InOutput::from_patterns(["reads/{sample}.fq"]);
        rule.output = InOutput::from_patterns(["mapped/{sample}.bam"])
            .with_named("bai", IoPath::new("mapped/{sample}.bam.bai"));
        rule.resources.insert(CORES.to_string(), ResourceValue::Int(4));
        rule
    }

    #[test]
    fn test_rule_creation_defaults() {
        let rule = Rule::new("empty");
        assert!(rule.is_norun());
        assert_eq!(rule.priority, 0.0);
        assert_eq!(rule.shadow, ShadowMode::None);
        assert!(rule.environment.is_empty());
        assert!(!rule.has_wildcards());
    }

    #[test]
    fn test_threads_from_cores_resource() {
        assert_eq!(sample_rule().threads(), Some(4));
    }

    #[test]
    fn test_wildcard_names() {
        let rule = sample_rule();
        assert!(rule.has_wildcards());
        assert_eq!(
            rule.wildcard_names().into_iter().collect::<Vec<_>>(),
            vec!["sample".to_string()]
        );
    }

    #[test]
    fn test_undefined_wildcards() {
        let mut rule = sample_rule();
        assert!(rule.undefined_wildcards().is_empty());
        rule.input = InOutput::from_patterns(["reads/{sample}_{lane}.fq"]);
        assert_eq!(rule.undefined_wildcards(), vec!["lane".to_string()]);
    }

    #[test]
    fn test_proxy_file_lookup() {
        let proxy = sample_rule().proxy();
        assert_eq!(
            proxy.file("output", "0").unwrap().pattern,
            "mapped/{sample}.bam"
        );
        assert_eq!(
            proxy.file("output", "bai").unwrap().pattern,
            "mapped/{sample}.bam.bai"
        );
        assert!(proxy.file("params", "0").is_none());
    }

    #[test]
    fn test_shadow_parse() {
        assert_eq!(ShadowMode::parse("copy-minimal"), Some(ShadowMode::CopyMinimal));
        assert_eq!(ShadowMode::parse("deep"), None);
    }

    #[test]
    fn test_exec_method_software_env() {
        assert!(ExecMethod::Shell("ls".into()).allows_software_env());
        assert!(ExecMethod::Wrapper("bio/bwa".into()).allows_software_env());
        assert!(!ExecMethod::NoRun.allows_software_env());
        assert!(!ExecMethod::TemplateEngine("yte".into()).allows_software_env());
    }
}
