//! Rule Registry
//!
//! The registry owns every finalized rule together with the workflow-level
//! state rule definitions contribute to: default target, rule order,
//! local rules, modules, sub-workflows, cache policy and forwarded
//! environment variables.
//!
//! Rules are built in three steps:
//!
//! 1. [`Registry::register`] reserves a name and returns a [`RuleHandle`]
//! 2. [`Registry::apply_directive`] records directive values on the handle
//! 3. [`Registry::finalize`] validates the accumulated directives and
//!    commits the rule
//!
//! Nothing is visible in the registry until step 3 succeeds, so a rule
//! that fails validation never leaks into later lookups.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value as YamlValue;

use crate::error::{Error, Result};

use super::modifier::{get_name_modifier_func, Modifier, PathModifier};
use super::module::{ModuleInfo, RuleSource};
use super::rule::{CacheMode, ExecMethod, Rule, RuleProxy, ShadowMode, CORES, NODES};
use super::ruleinfo::{ContainerDirective, Directive, IoPath, RuleInfo};
use super::settings::{update_config, WorkflowSettings};
use super::sourcecache::SourceCache;
use super::subworkflow::Subworkflow;
use super::value::{InlineFn, ResourceValue, Resolver, Value};
use super::wildcards::WildcardPattern;

static ENVVAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("envvar regex should compile"));

/// Callback run at the start, success or failure of a run.
///
/// Receives the log file of the run, if there is one.
pub type Hook = Arc<dyn Fn(Option<&Path>) + Send + Sync>;

/// A rule under construction.
#[derive(Debug)]
pub struct RuleHandle {
    rule: Rule,
    orig_name: String,
    info: RuleInfo,
    /// Rule was filtered out by the active scope; directives are ignored
    skipped: bool,
}

impl RuleHandle {
    /// Name the rule will be registered under, before any rename directive.
    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn orig_name(&self) -> &str {
        &self.orig_name
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn info(&self) -> &RuleInfo {
        &self.info
    }
}

/// A `use rule` statement.
#[derive(Debug, Clone, Default)]
pub struct UseRule {
    /// Rule names, or `*` for all rules of a module
    pub rules: Vec<String>,
    pub from_module: Option<String>,
    pub exclude: Vec<String>,
    /// `as <name>`; a `*` stands for the original name
    pub name_modifier: Option<String>,
    /// Directives given in the `with:` block
    pub overwrite: Option<RuleInfo>,
}

/// Registry-level effects of finalizing one rule.
#[derive(Default)]
struct Effects {
    localrule: bool,
    cache: Option<CacheMode>,
    default_target: bool,
}

#[derive(Default, Clone)]
pub struct Hooks {
    pub onstart: Option<Hook>,
    pub onsuccess: Option<Hook>,
    pub onerror: Option<Hook>,
}

pub struct Registry {
    settings: WorkflowSettings,
    rules: IndexMap<String, Rule>,
    default_target: Option<String>,
    ruleorder: Vec<Vec<String>>,
    localrules: BTreeSet<String>,
    modules: BTreeMap<String, ModuleInfo>,
    subworkflows: IndexMap<String, Subworkflow>,
    cache_rules: BTreeMap<String, CacheMode>,
    envvars: BTreeSet<String>,
    base_modifier: Modifier,
    modifier_stack: Vec<Modifier>,
    proxies: BTreeMap<String, RuleProxy>,
    /// Lookup name (final or original) to registered checkpoint name
    checkpoints: BTreeMap<String, String>,
    resolvers: BTreeMap<String, Resolver>,
    inline_fns: BTreeMap<String, InlineFn>,
    config: YamlValue,
    configfiles: Vec<PathBuf>,
    report_text: Option<PathBuf>,
    workdir: Option<PathBuf>,
    global_container: Option<(String, bool)>,
    included: Vec<PathBuf>,
    included_stack: Vec<PathBuf>,
    source: Option<Arc<dyn RuleSource>>,
    sourcecache: SourceCache,
    hooks: Hooks,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(WorkflowSettings::default())
    }
}

impl Registry {
    pub fn new(settings: WorkflowSettings) -> Self {
        let mut config = YamlValue::Mapping(serde_yaml::Mapping::new());
        update_config(&mut config, &settings.overwrite_config);
        let workdir = settings.overwrite_workdir.clone();

        Self {
            settings,
            rules: IndexMap::new(),
            default_target: None,
            ruleorder: Vec::new(),
            localrules: BTreeSet::new(),
            modules: BTreeMap::new(),
            subworkflows: IndexMap::new(),
            cache_rules: BTreeMap::new(),
            envvars: BTreeSet::new(),
            base_modifier: Modifier::default(),
            modifier_stack: Vec::new(),
            proxies: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            resolvers: BTreeMap::new(),
            inline_fns: BTreeMap::new(),
            config,
            configfiles: Vec::new(),
            report_text: None,
            workdir,
            global_container: None,
            included: Vec::new(),
            included_stack: Vec::new(),
            source: None,
            sourcecache: SourceCache::new(),
            hooks: Hooks::default(),
        }
    }

    /// Sets the parser used by `include` and module imports.
    pub fn with_source(mut self, source: Arc<dyn RuleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn set_source(&mut self, source: Arc<dyn RuleSource>) {
        self.source = Some(source);
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    // ------------------------------------------------------------------
    // Rule construction
    // ------------------------------------------------------------------

    /// Reserves a rule name and starts a rule.
    ///
    /// Without a name, the rule is named after its position (`"1"`, `"2"`,
    /// ...). Fails if the (possibly rewritten) name is already taken and
    /// the active scope does not permit overwriting.
    pub fn register(&mut self, name: Option<&str>, checkpoint: bool) -> Result<RuleHandle> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| (self.rules.len() + 1).to_string());
        let modifier = self.modifier();

        if modifier.skip_rule(&name) {
            debug!("Skipping rule '{}' (not requested in this scope)", name);
            return Ok(RuleHandle {
                rule: Rule::new(name.clone()),
                orig_name: name,
                info: RuleInfo::new(),
                skipped: true,
            });
        }

        let final_name = modifier.modify_rulename(&name);
        if !modifier.allow_rule_overwrite && self.rules.contains_key(&final_name) {
            return Err(Error::DuplicateRule { name: final_name });
        }

        let mut rule = Rule::new(final_name);
        rule.is_checkpoint = checkpoint;
        rule.basedir = self.current_basedir();

        Ok(RuleHandle {
            rule,
            orig_name: name,
            info: RuleInfo::new(),
            skipped: false,
        })
    }

    /// Records one directive on a rule under construction.
    ///
    /// Paths are rewritten by the active scope's path modifier here, so
    /// that a cloned rule keeps the paths of the scope it was defined in.
    pub fn apply_directive(&self, handle: &mut RuleHandle, directive: Directive) -> Result<()> {
        if handle.skipped {
            return Ok(());
        }
        handle.info.apply(self.prepare_directive(directive));
        Ok(())
    }

    /// Rewrites the paths of a directive for the active scope.
    pub fn prepare_directive(&self, directive: Directive) -> Directive {
        let paths = &self.modifier().path_modifier;
        if paths.is_identity() {
            return directive;
        }
        match directive {
            Directive::Input(mut io) => {
                io.modify_paths(paths);
                Directive::Input(io)
            }
            Directive::Output(mut io) => {
                io.modify_paths(paths);
                Directive::Output(io)
            }
            Directive::Log(mut io) => {
                io.modify_paths(paths);
                Directive::Log(io)
            }
            Directive::Benchmark(mut path) => {
                path.pattern = paths.modify(&path.pattern);
                Directive::Benchmark(path)
            }
            other => other,
        }
    }

    /// Validates the accumulated directives and commits the rule.
    ///
    /// Returns `None` for rules skipped by the active scope.
    pub fn finalize(&mut self, handle: RuleHandle) -> Result<Option<&Rule>> {
        if handle.skipped {
            return Ok(None);
        }
        let RuleHandle {
            mut rule,
            orig_name,
            mut info,
            ..
        } = handle;

        if let Some(overwrite) = &self.modifier().ruleinfo_overwrite {
            info.apply_overwrite(overwrite);
        }

        let effects = self.build_rule(&mut rule, &info)?;
        let name = rule.name.clone();

        if !self.modifier().allow_rule_overwrite && self.rules.contains_key(&name) {
            return Err(Error::DuplicateRule { name });
        }

        rule.info = info;
        let proxy = rule.proxy();
        if rule.is_checkpoint {
            self.checkpoints.insert(name.clone(), name.clone());
            self.checkpoints
                .entry(orig_name.clone())
                .or_insert_with(|| name.clone());
        }
        self.rules.insert(name.clone(), rule);

        if self.default_target.is_none() || effects.default_target {
            self.default_target = Some(name.clone());
        }
        if effects.localrule {
            self.localrules.insert(name.clone());
        }
        if let Some(mode) = effects.cache {
            self.cache_rules.insert(name.clone(), mode);
        }
        self.proxies.insert(orig_name, proxy.clone());
        self.proxies.insert(name.clone(), proxy);
        self.modifier_mut().rules.push(name.clone());

        debug!("Registered rule '{}'", name);
        Ok(self.rules.get(&name))
    }

    /// Turns accumulated directives into rule attributes.
    ///
    /// Does not touch registry state; registry-level effects are returned.
    fn build_rule(&self, rule: &mut Rule, info: &RuleInfo) -> Result<Effects> {
        let mut effects = Effects::default();
        let modifier = self.modifier();

        // Wildcard constraints: rule-level ones win over scope-level ones
        rule.wildcard_constraints = modifier.wildcard_constraints.clone();
        if let Some(constraints) = &info.wildcard_constraints {
            rule.wildcard_constraints.extend(constraints.clone());
        }
        for (wildcard, constraint) in &rule.wildcard_constraints {
            if let Err(e) = Regex::new(constraint) {
                return Err(Error::rule_definition(
                    &rule.name,
                    "wildcard_constraints",
                    format!("invalid regex for wildcard '{}': {}", wildcard, e),
                ));
            }
        }

        if let Some(name) = &info.name {
            rule.name = name.clone();
        }
        let name = rule.name.clone();

        if let Some(input) = &info.input {
            rule.input = input.clone();
        }
        if let Some(output) = &info.output {
            rule.output = output.clone();
            for path in rule.output.iter() {
                WildcardPattern::compile(&path.pattern, &rule.wildcard_constraints).map_err(
                    |e| Error::rule_definition(&name, "output", e.to_string()),
                )?;
            }
        }
        if let Some(log) = &info.log {
            rule.log = log.clone();
        }
        let undefined = rule.undefined_wildcards();
        if !undefined.is_empty() {
            return Err(Error::rule_definition(
                &name,
                "input",
                format!(
                    "wildcards {:?} in input or log files cannot be determined from output files",
                    undefined
                ),
            ));
        }
        if let Some(params) = &info.params {
            rule.params = params.clone();
        }

        rule.resources = self.settings.default_resources.clone();

        if let Some(threads) = &info.threads {
            let cores = match threads {
                Value::Int(n) => ResourceValue::Int(*n),
                Value::Float(f) => ResourceValue::Int(f.trunc() as i64),
                Value::Resolver(r) => ResourceValue::Resolver(r.clone()),
                other => {
                    return Err(Error::rule_definition(
                        &name,
                        "threads",
                        format!(
                            "threads value has to be an integer, float, or a function, not a {}",
                            other.kind()
                        ),
                    ))
                }
            };
            rule.resources.insert(CORES.to_string(), cores);
        }
        if let Some(threads) = self.settings.overwrite_threads.get(&name) {
            rule.resources
                .insert(CORES.to_string(), ResourceValue::Int(*threads));
        }

        if let Some(shadow) = &info.shadow {
            rule.shadow = match shadow {
                Value::Bool(true) => {
                    warn!(
                        "Shadow is set to true in rule {} (equivalent to 'full'). \
                         Use the explicit options 'minimal|copy-minimal|shallow|full' instead.",
                        name
                    );
                    ShadowMode::Full
                }
                Value::Bool(false) | Value::Null => ShadowMode::None,
                Value::Str(mode) => ShadowMode::parse(mode).ok_or_else(|| shadow_error(&name))?,
                _ => return Err(shadow_error(&name)),
            };
        }

        if let Some((positional, named)) = &info.resources {
            if !positional.is_empty() {
                return Err(Error::rule_definition(
                    &name,
                    "resources",
                    "resources have to be named",
                ));
            }
            for (key, value) in named {
                let resource = match value {
                    Value::Int(n) => ResourceValue::Int(*n),
                    Value::Str(s) => ResourceValue::Str(s.clone()),
                    Value::Resolver(r) => ResourceValue::Resolver(r.clone()),
                    other => {
                        return Err(Error::rule_definition(
                            &name,
                            "resources",
                            format!(
                                "value of resource '{}' has to be an integer, string, or function, not a {}",
                                key,
                                other.kind()
                            ),
                        ))
                    }
                };
                rule.resources.insert(key.clone(), resource);
            }
        }
        if let Some(overrides) = self.settings.overwrite_resources.get(&name) {
            rule.resources
                .extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if let Some(priority) = &info.priority {
            rule.priority = match priority {
                Value::Int(n) => *n as f64,
                Value::Float(f) => *f,
                other => {
                    return Err(Error::rule_definition(
                        &name,
                        "priority",
                        format!("priority values have to be numeric, not a {}", other.kind()),
                    ))
                }
            };
        }

        rule.restart_times = match &info.retries {
            None => self.settings.restart_times,
            Some(Value::Int(n)) if *n >= 0 => *n as u32,
            Some(_) => {
                return Err(Error::rule_definition(
                    &name,
                    "retries",
                    "retries values have to be integers >= 0",
                ))
            }
        };

        rule.version = info.version.clone();
        rule.message = info.message.clone();
        rule.benchmark = info.benchmark.clone();
        rule.docstring = info.docstring.clone();

        if !self.settings.run_local {
            rule.group = self
                .settings
                .overwrite_groups
                .get(&name)
                .cloned()
                .or_else(|| info.group.clone());
        }

        let exec = info.exec.clone().unwrap_or_default();
        let software_env_allowed = exec.allows_software_env();
        if let ExecMethod::Wrapper(wrapper) = &exec {
            rule.environment.conda = Some(format!(
                "{}{}/environment.yaml",
                self.settings.wrapper_prefix, wrapper
            ));
        }

        if let Some(modules) = &info.env_modules {
            if !software_env_allowed {
                return Err(software_env_error(&name, "envmodules"));
            }
            rule.environment.env_modules = modules.clone();
        }
        if let Some(conda) = &info.conda {
            if !software_env_allowed {
                return Err(software_env_error(&name, "conda"));
            }
            rule.environment.conda = Some(conda.clone());
        }
        match &info.container {
            Some(ContainerDirective::Image { url, containerized }) => {
                if !software_env_allowed {
                    return Err(software_env_error(&name, "container"));
                }
                rule.environment.container = Some(url.clone());
                rule.environment.is_containerized = *containerized;
            }
            Some(ContainerDirective::Disabled) => {}
            None => {
                if let Some((url, containerized)) = &self.global_container {
                    if software_env_allowed {
                        rule.environment.container = Some(url.clone());
                        rule.environment.is_containerized = *containerized;
                    }
                }
            }
        }
        rule.exec = exec;

        if info.handover == Some(true) {
            if info.resources.is_none() {
                for (resource, value) in &self.settings.global_resources {
                    rule.resources
                        .insert(resource.clone(), ResourceValue::Int(*value));
                }
            }
            rule.is_handover = true;
            effects.localrule = true;
        }

        if let Some(cache) = &info.cache {
            let mode = match cache {
                Value::Bool(true) => Some(CacheMode::All),
                Value::Bool(false) | Value::Null => None,
                Value::Str(s) if s == "all" => Some(CacheMode::All),
                Value::Str(s) if s == "omit-software" => Some(CacheMode::OmitSoftware),
                _ => {
                    return Err(Error::rule_definition(
                        &name,
                        "cache",
                        "invalid value for cache directive, use true, 'all' or 'omit-software'",
                    ))
                }
            };
            if let Some(mode) = mode {
                effects.cache = self.check_cache(rule, mode)?;
            }
        }

        match &info.default_target {
            None | Some(Value::Bool(false)) => {}
            Some(Value::Bool(true)) => effects.default_target = true,
            Some(_) => {
                return Err(Error::workflow_in_rule(
                    &name,
                    "invalid argument for 'default_target:' directive, only true is allowed",
                ))
            }
        }

        match &info.localrule {
            None | Some(Value::Bool(false)) => {}
            Some(Value::Bool(true)) => effects.localrule = true,
            Some(other) => {
                return Err(Error::rule_definition(
                    &name,
                    "localrule",
                    format!("localrule has to be a boolean, not a {}", other.kind()),
                ))
            }
        }

        Ok(effects)
    }

    /// Validates between-workflow caching of a rule.
    fn check_cache(&self, rule: &Rule, mode: CacheMode) -> Result<Option<CacheMode>> {
        if rule.is_norun() {
            return Err(Error::rule_definition(
                &rule.name,
                "cache",
                "rules without an execution method cannot be cached",
            ));
        }
        if rule.benchmark.is_some() {
            return Err(Error::rule_definition(
                &rule.name,
                "cache",
                "rules with a benchmark directive may not be eligible for \
                 between-workflow caching at the same time",
            ));
        }
        let multi_output = rule.output.len() > 1 && !rule.output.iter().all(|p| p.multiext);

        if !self.settings.enable_cache {
            if multi_output {
                warn!(
                    "Rule {} is marked for caching but has multiple output files not \
                     declared with multiext(); enabling the cache will fail",
                    rule.name
                );
            }
            warn!(
                "Workflow defines that rule {} is eligible for caching between workflows \
                 (use the --cache argument to enable this).",
                rule.name
            );
            return Ok(None);
        }
        if multi_output {
            return Err(Error::workflow_in_rule(
                &rule.name,
                "rule is marked for between workflow caching but has multiple output files. \
                 This is only allowed if multiext() is used to declare them.",
            ));
        }
        let requested = self.settings.cache_rules.is_empty()
            || self.settings.cache_rules.contains(&rule.name);
        Ok(requested.then_some(mode))
    }

    // ------------------------------------------------------------------
    // Workflow-level statements
    // ------------------------------------------------------------------

    /// Adds a rule order clause; names pass through the active scope.
    pub fn ruleorder<S: AsRef<str>>(&mut self, names: &[S]) {
        let modifier = self.modifier();
        let clause = names
            .iter()
            .map(|n| modifier.modify_rulename(n.as_ref()))
            .collect();
        self.ruleorder.push(clause);
    }

    pub fn localrules<S: AsRef<str>>(&mut self, names: &[S]) {
        self.localrules
            .extend(names.iter().map(|n| n.as_ref().to_string()));
    }

    /// Fails if a rule order clause names an undefined rule.
    pub fn check(&self) -> Result<()> {
        for clause in &self.ruleorder {
            for name in clause {
                if !self.rules.contains_key(name) {
                    return Err(Error::unknown_rule(name, "Error in ruleorder definition"));
                }
            }
        }
        Ok(())
    }

    /// Warns about `localrules` entries without a rule; returns them.
    pub fn check_localrules(&self) -> Vec<String> {
        let undefined: Vec<String> = self
            .localrules
            .iter()
            .filter(|name| !self.rules.contains_key(*name))
            .cloned()
            .collect();
        if !undefined.is_empty() {
            warn!(
                "localrules directive specifies rules that are not present in the workflow:\n{}",
                undefined
                    .iter()
                    .map(|n| format!("\t{}", n))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
        }
        undefined
    }

    /// Registers environment variables forwarded to jobs.
    pub fn register_envvars<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let invalid: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| !ENVVAR_NAME.is_match(n))
            .collect();
        if !invalid.is_empty() {
            return Err(Error::EnvironmentVariable(format!(
                "invalid environment variables requested: {:?}. Names may only contain \
                 alphanumeric characters and the underscore.",
                invalid
            )));
        }
        let undefined: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| std::env::var_os(n).is_none())
            .collect();
        if self.settings.check_envvars && !undefined.is_empty() {
            return Err(Error::EnvironmentVariable(format!(
                "the following environment variables are requested by the workflow but undefined:\n{}",
                undefined.join("\n")
            )));
        }
        self.envvars
            .extend(names.iter().map(|n| n.as_ref().to_string()));
        Ok(())
    }

    /// Parses another definition file into this registry.
    ///
    /// A file is only included once unless the active scope permits
    /// overwriting rules. Rules from the included file do not become the
    /// default target unless `overwrite_default_target` is set.
    pub fn include(&mut self, path: &str, overwrite_default_target: bool) -> Result<()> {
        let basedir = self.current_basedir();
        let path = self.sourcecache.resolve(path, basedir.as_deref())?;

        if !self.modifier().allow_rule_overwrite && self.included.contains(&path) {
            info!("Multiple includes of {} ignored", path.display());
            return Ok(());
        }
        let source = self.source.clone().ok_or_else(|| {
            Error::workflow(format!(
                "Cannot include {}: no rule-definition source configured",
                path.display()
            ))
        })?;

        self.included.push(path.clone());
        self.included_stack.push(path.clone());
        let default_target = self.default_target.clone();

        let result = source.load(self, &path);
        self.included_stack.pop();
        result?;

        if !overwrite_default_target {
            self.default_target = default_target;
        }
        Ok(())
    }

    /// Loads a YAML (or JSON) config file and merges it into the config.
    pub fn configfile(&mut self, path: &str) -> Result<()> {
        if self.modifier().skip_configfile {
            return Ok(());
        }
        let full = self.resolve_path(path);
        if full.exists() {
            let content = fs::read_to_string(&full)?;
            let loaded: YamlValue = serde_yaml::from_str(&content)?;
            update_config(&mut self.config, &loaded);
            self.configfiles.push(full);
            if !is_empty_mapping(&self.settings.overwrite_config) {
                info!(
                    "Config file {} is extended by additional config specified via the command line.",
                    path
                );
                update_config(&mut self.config, &self.settings.overwrite_config);
            }
            Ok(())
        } else if self.settings.overwrite_configfiles.is_empty() {
            Err(Error::workflow(format!(
                "Workflow defines configfile {} but it is not present or accessible (full checked path: {}).",
                path,
                full.display()
            )))
        } else {
            update_config(&mut self.config, &self.settings.overwrite_config);
            Ok(())
        }
    }

    /// Merges an inline config mapping.
    pub fn update_config(&mut self, config: &YamlValue) {
        update_config(&mut self.config, config);
        update_config(&mut self.config, &self.settings.overwrite_config);
    }

    /// Sets the global report caption.
    pub fn report(&mut self, path: &str) {
        if !self.modifier().skip_global_report_caption {
            let base = self.current_basedir().unwrap_or_default();
            self.report_text = Some(base.join(path));
        }
    }

    /// Sets the working directory unless one was given on the command line.
    ///
    /// The directory is created when a run starts in it.
    pub fn workdir(&mut self, path: &str) {
        if self.settings.overwrite_workdir.is_none() {
            self.workdir = Some(PathBuf::from(path));
        }
    }

    /// Adds wildcard constraints for the active scope and every rule it registered.
    pub fn global_wildcard_constraints(&mut self, constraints: BTreeMap<String, String>) -> Result<()> {
        for (wildcard, constraint) in &constraints {
            Regex::new(constraint).map_err(|e| {
                Error::workflow(format!(
                    "Invalid global constraint for wildcard '{}': {}",
                    wildcard, e
                ))
            })?;
        }
        let modifier = self.modifier_mut();
        modifier.wildcard_constraints.extend(constraints.clone());
        let scoped: Vec<String> = modifier.rules.clone();
        for name in scoped {
            if let Some(rule) = self.rules.get_mut(&name) {
                for (wildcard, constraint) in &constraints {
                    rule.wildcard_constraints
                        .entry(wildcard.clone())
                        .or_insert_with(|| constraint.clone());
                }
            }
        }
        Ok(())
    }

    /// Container image for every rule without its own container directive.
    pub fn global_container(&mut self, url: &str, containerized: bool) {
        self.global_container = Some((url.to_string(), containerized));
    }

    pub fn subworkflow(
        &mut self,
        name: &str,
        snakefile: Option<&str>,
        workdir: Option<&str>,
        configfile: Option<&str>,
    ) -> Result<()> {
        let configfile = match configfile {
            Some(path) => {
                let path = self.resolve_path(path);
                Some(if path.is_absolute() {
                    path
                } else {
                    std::env::current_dir()?.join(path)
                })
            }
            None => None,
        };
        let basedir = match self.current_basedir() {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let sub = Subworkflow::new(
            name,
            snakefile.map(PathBuf::from),
            workdir.map(PathBuf::from),
            configfile,
            basedir,
        );
        self.subworkflows.insert(name.to_string(), sub);
        Ok(())
    }

    /// Marks a path as provided by the named sub-workflow.
    pub fn subworkflow_target(&self, name: &str, path: &str) -> Result<IoPath> {
        self.subworkflows
            .get(name)
            .map(|sub| sub.target(path))
            .ok_or_else(|| Error::workflow(format!("Sub-workflow '{}' is not defined", name)))
    }

    /// Registers a module; its file is only parsed on `use rule`.
    pub fn module(&mut self, module: ModuleInfo) {
        self.modules.insert(module.name.clone(), module);
    }

    /// Imports rules from a module, or clones a local rule.
    pub fn use_rule(&mut self, statement: UseRule) -> Result<()> {
        match &statement.from_module {
            Some(module) => self.use_module_rules(module, &statement),
            None => self.inherit_rule(statement),
        }
    }

    fn use_module_rules(&mut self, module_name: &str, statement: &UseRule) -> Result<()> {
        let module = self.modules.get(module_name).cloned().ok_or_else(|| {
            Error::InvalidUseRule(format!(
                "module '{}' has not been registered with a 'module' statement before using it",
                module_name
            ))
        })?;
        let definition = module.definition_file(&self.settings.wrapper_prefix)?;
        let parent = self.modifier();
        let rulename_modifier = get_name_modifier_func(
            &statement.rules,
            statement.name_modifier.as_deref(),
            parent,
        )?;

        let modifier = Modifier {
            namespace: Some(module.name.clone()),
            rulename_modifier,
            path_modifier: PathModifier::new(module.prefix.clone(), module.replace_prefix.clone()),
            rule_whitelist: ModuleInfo::rule_whitelist(&statement.rules),
            rule_exclude: statement.exclude.iter().cloned().collect(),
            ruleinfo_overwrite: statement.overwrite.clone(),
            wildcard_constraints: BTreeMap::new(),
            skip_configfile: module.config.is_some(),
            skip_global_report_caption: self.report_text.is_some(),
            skip_validation: module.skip_validation,
            allow_rule_overwrite: true,
            config: module.config.clone().or_else(|| parent.config.clone()),
            rules: Vec::new(),
        };

        info!("Using rules {:?} from module '{}'", statement.rules, module.name);
        let mut scope = self.push_modifier(modifier);
        scope.include(&definition, true)
    }

    fn inherit_rule(&mut self, statement: UseRule) -> Result<()> {
        if let Some(name_modifier) = &statement.name_modifier {
            if self.modifier().skip_rule(name_modifier) {
                return Ok(());
            }
        }
        if statement.rules.len() != 1 {
            return Err(Error::InvalidUseRule(
                "'use rule' statement from rule in the same module must declare a single rule \
                 but multiple rules are declared"
                    .to_string(),
            ));
        }
        let Some(name_modifier) = statement.name_modifier.as_deref() else {
            return Err(Error::InvalidUseRule(format!(
                "'use rule {}' within the same module needs a new name ('as <name>')",
                statement.rules[0]
            )));
        };

        let source_name = self.modifier().modify_rulename(&statement.rules[0]);
        let source = self
            .rules
            .get(&source_name)
            .ok_or_else(|| Error::unknown_rule(&source_name, "use rule"))?;
        let mut info = source.info.clone();
        info.name = None;
        let checkpoint = source.is_checkpoint;

        let parent = self.modifier();
        let modifier = Modifier::child_of(parent)
            .with_rulename_modifier(get_name_modifier_func(
                &statement.rules,
                Some(name_modifier),
                parent,
            )?)
            .with_overwrite(statement.overwrite);

        let mut scope = self.push_modifier(modifier);
        let mut handle = scope.register(Some(&statement.rules[0]), checkpoint)?;
        handle.info = info;
        scope.finalize(handle)?;
        Ok(())
    }

    /// Activates a registration scope until the guard is dropped.
    pub fn push_modifier(&mut self, modifier: Modifier) -> ModifierGuard<'_> {
        self.modifier_stack.push(modifier);
        ModifierGuard { registry: self }
    }

    /// The active (topmost) scope.
    pub fn modifier(&self) -> &Modifier {
        self.modifier_stack.last().unwrap_or(&self.base_modifier)
    }

    fn modifier_mut(&mut self) -> &mut Modifier {
        match self.modifier_stack.last_mut() {
            Some(modifier) => modifier,
            None => &mut self.base_modifier,
        }
    }

    pub fn modifier_depth(&self) -> usize {
        self.modifier_stack.len()
    }

    // ------------------------------------------------------------------
    // Functions and hooks
    // ------------------------------------------------------------------

    pub fn register_function(&mut self, resolver: Resolver) {
        self.resolvers.insert(resolver.name().to_string(), resolver);
    }

    pub fn register_inline(&mut self, func: InlineFn) {
        self.inline_fns.insert(func.name().to_string(), func);
    }

    pub fn function(&self, name: &str) -> Option<&Resolver> {
        self.resolvers.get(name)
    }

    pub fn inline_fn(&self, name: &str) -> Option<&InlineFn> {
        self.inline_fns.get(name)
    }

    pub fn onstart(&mut self, hook: Hook) {
        self.hooks.onstart = Some(hook);
    }

    pub fn onsuccess(&mut self, hook: Hook) {
        self.hooks.onsuccess = Some(hook);
    }

    pub fn onerror(&mut self, hook: Hook) {
        self.hooks.onerror = Some(hook);
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn get_rule(&self, name: &str) -> Result<&Rule> {
        if self.rules.is_empty() {
            return Err(Error::NoRules);
        }
        self.rules
            .get(name)
            .ok_or_else(|| Error::unknown_rule(name, "Lookup failed"))
    }

    pub fn is_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Rules in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules sorted by name; with `only_targets`, rules without wildcards.
    pub fn list_rules(&self, only_targets: bool) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self
            .rules
            .values()
            .filter(|rule| !only_targets || !rule.has_wildcards())
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// User-defined resource names used by any rule.
    pub fn list_resources(&self) -> BTreeSet<String> {
        self.rules
            .values()
            .flat_map(|rule| rule.resources.keys())
            .filter(|name| name.as_str() != CORES && name.as_str() != NODES)
            .cloned()
            .collect()
    }

    /// Input and output paths without wildcards.
    pub fn concrete_files(&self) -> Vec<String> {
        self.rules
            .values()
            .flat_map(|rule| rule.input.iter().chain(rule.output.iter()))
            .map(|path| path.pattern.clone())
            .filter(|pattern| !super::wildcards::has_wildcards(pattern))
            .collect()
    }

    /// True if jobs of the rule always run on the local machine.
    pub fn is_local(&self, rule: &Rule) -> bool {
        rule.group.is_none()
            && (self.localrules.contains(&rule.name) || rule.is_norun() || rule.is_template_engine())
    }

    pub fn rule_proxy(&self, name: &str) -> Option<&RuleProxy> {
        self.proxies.get(name)
    }

    /// Checkpoint by final name, falling back to its name before renaming.
    pub fn checkpoint(&self, name: &str) -> Option<&Rule> {
        self.checkpoints
            .get(name)
            .and_then(|registered| self.rules.get(registered))
    }

    pub fn cache_mode(&self, rule: &str) -> Option<CacheMode> {
        self.cache_rules.get(rule).copied()
    }

    pub fn default_target(&self) -> Option<&str> {
        self.default_target.as_deref()
    }

    pub fn ruleorder_clauses(&self) -> &[Vec<String>] {
        &self.ruleorder
    }

    pub fn localrule_names(&self) -> &BTreeSet<String> {
        &self.localrules
    }

    pub fn envvars(&self) -> &BTreeSet<String> {
        &self.envvars
    }

    pub fn modules(&self) -> &BTreeMap<String, ModuleInfo> {
        &self.modules
    }

    pub fn subworkflows(&self) -> impl Iterator<Item = &Subworkflow> {
        self.subworkflows.values()
    }

    /// Config visible in the active scope.
    pub fn config(&self) -> &YamlValue {
        self.modifier().config.as_ref().unwrap_or(&self.config)
    }

    pub fn configfiles(&self) -> &[PathBuf] {
        &self.configfiles
    }

    pub fn report_text(&self) -> Option<&Path> {
        self.report_text.as_deref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn included(&self) -> &[PathBuf] {
        &self.included
    }

    /// Directory of the definition file being parsed.
    pub fn current_basedir(&self) -> Option<PathBuf> {
        self.included_stack
            .last()
            .and_then(|file| file.parent())
            .map(Path::to_path_buf)
    }

    /// Resolves a path against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match &self.workdir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    }
}

/// Pops its scope when dropped.
pub struct ModifierGuard<'a> {
    registry: &'a mut Registry,
}

impl Deref for ModifierGuard<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        self.registry
    }
}

impl DerefMut for ModifierGuard<'_> {
    fn deref_mut(&mut self) -> &mut Registry {
        self.registry
    }
}

impl Drop for ModifierGuard<'_> {
    fn drop(&mut self) {
        self.registry.modifier_stack.pop();
    }
}

fn shadow_error(rule: &str) -> Error {
    Error::rule_definition(
        rule,
        "shadow",
        "shadow must either be 'minimal', 'copy-minimal', 'shallow', 'full', or true (equivalent to 'full')",
    )
}

fn software_env_error(rule: &str, directive: &str) -> Error {
    Error::rule_definition(
        rule,
        directive,
        "only allowed with shell, script, notebook, or wrapper directives (not with run or template_engine)",
    )
}

fn is_empty_mapping(value: &YamlValue) -> bool {
    match value {
        YamlValue::Mapping(map) => map.is_empty(),
        YamlValue::Null => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ruleinfo::InOutput;
    use crate::workflow::settings::config_lookup;
    use crate::workflow::value::Literal;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn shell(cmd: &str) -> Directive {
        Directive::Exec(ExecMethod::Shell(cmd.to_string()))
    }

    fn add_rule(registry: &mut Registry, name: Option<&str>, directives: Vec<Directive>) -> Result<String> {
        let mut handle = registry.register(name, false)?;
        for directive in directives {
            registry.apply_directive(&mut handle, directive)?;
        }
        let rule = registry.finalize(handle)?;
        Ok(rule.map(|r| r.name.clone()).unwrap_or_default())
    }

    #[test]
    fn test_duplicate_rule_fails() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![]).unwrap();
        let result = registry.register(Some("a"), false);
        assert!(matches!(result, Err(Error::DuplicateRule { .. })));
    }

    #[test]
    fn test_duplicate_handles_fail_on_finalize() {
        let mut registry = Registry::default();
        let mut first = registry.register(Some("a"), false).unwrap();
        let second = registry.register(Some("a"), false).unwrap();
        registry
            .apply_directive(&mut first, Directive::Message("first".into()))
            .unwrap();
        registry.finalize(first).unwrap();

        let result = registry.finalize(second);
        assert!(matches!(result, Err(Error::DuplicateRule { name }) if name == "a"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_rule("a").unwrap().message.as_deref(), Some("first"));
    }

    #[test]
    fn test_overwrite_replaces_rule_entirely() {
        let mut registry = Registry::default();
        add_rule(
            &mut registry,
            Some("a"),
            vec![Directive::Message("old".into()), Directive::Threads(Value::Int(8))],
        )
        .unwrap();

        let modifier = Modifier {
            allow_rule_overwrite: true,
            ..Modifier::default()
        };
        let mut scope = registry.push_modifier(modifier);
        add_rule(&mut scope, Some("a"), vec![shell("echo new")]).unwrap();
        drop(scope);

        let rule = registry.get_rule("a").unwrap();
        assert!(rule.message.is_none());
        assert_eq!(rule.threads(), Some(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unnamed_rules_numbered_by_position() {
        let mut registry = Registry::default();
        let first = add_rule(&mut registry, None, vec![]).unwrap();
        let named = add_rule(&mut registry, Some("a"), vec![]).unwrap();
        let third = add_rule(&mut registry, None, vec![]).unwrap();
        assert_eq!((first.as_str(), named.as_str(), third.as_str()), ("1", "a", "3"));
    }

    #[test]
    fn test_float_threads_truncated() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![Directive::Threads(Value::Float(3.9))]).unwrap();
        assert_eq!(registry.get_rule("a").unwrap().threads(), Some(3));
    }

    #[test]
    fn test_string_threads_rejected() {
        let mut registry = Registry::default();
        let result = add_rule(&mut registry, Some("a"), vec![Directive::Threads(Value::from("x"))]);
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_threads_resolver_kept_lazy() {
        let mut registry = Registry::default();
        let resolver = Resolver::new("half", |ctx| Literal::Int(ctx.cores / 2));
        add_rule(&mut registry, Some("a"), vec![Directive::Threads(resolver.into())]).unwrap();
        let rule = registry.get_rule("a").unwrap();
        assert!(matches!(rule.resources[CORES], ResourceValue::Resolver(_)));
    }

    #[test]
    fn test_positional_resource_rejected() {
        let mut registry = Registry::default();
        let mut named = IndexMap::new();
        named.insert("mem".to_string(), Value::Int(100));
        let directive = Directive::Resources {
            positional: vec![Value::from("bad")],
            named,
        };
        let result = add_rule(&mut registry, Some("a"), vec![directive]);
        match result {
            Err(Error::RuleDefinition { directive, .. }) => assert_eq!(directive, "resources"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_float_resource_rejected() {
        let mut registry = Registry::default();
        let result = add_rule(
            &mut registry,
            Some("a"),
            vec![Directive::resources(vec![("mem", Value::Float(1.5))])],
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut settings = WorkflowSettings::default();
        settings.overwrite_threads.insert("a".to_string(), 2);
        let mut mem = BTreeMap::new();
        mem.insert("mem_mb".to_string(), ResourceValue::Int(500));
        settings.overwrite_resources.insert("a".to_string(), mem);

        let mut registry = Registry::new(settings);
        let resolver = Resolver::new("mem", |_| Literal::Int(100));
        add_rule(
            &mut registry,
            Some("a"),
            vec![
                Directive::Threads(Value::Int(16)),
                Directive::resources(vec![("mem_mb", resolver.into())]),
            ],
        )
        .unwrap();

        let rule = registry.get_rule("a").unwrap();
        assert_eq!(rule.threads(), Some(2));
        assert_eq!(rule.resources["mem_mb"], ResourceValue::Int(500));
    }

    #[test]
    fn test_priority_and_retries_validation() {
        let mut registry = Registry::default();
        assert!(add_rule(&mut registry, Some("a"), vec![Directive::Priority(Value::from("high"))]).is_err());
        assert!(add_rule(&mut registry, Some("b"), vec![Directive::Retries(Value::Int(-1))]).is_err());
        add_rule(
            &mut registry,
            Some("c"),
            vec![Directive::Priority(Value::Int(5)), Directive::Retries(Value::Int(2))],
        )
        .unwrap();
        let rule = registry.get_rule("c").unwrap();
        assert_eq!(rule.priority, 5.0);
        assert_eq!(rule.restart_times, 2);
    }

    #[test]
    fn test_shadow_true_is_full() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![Directive::Shadow(Value::Bool(true))]).unwrap();
        assert_eq!(registry.get_rule("a").unwrap().shadow, ShadowMode::Full);
        assert!(add_rule(&mut registry, Some("b"), vec![Directive::Shadow(Value::from("deep"))]).is_err());
    }

    #[test]
    fn test_conda_on_inline_function_rejected() {
        let mut registry = Registry::default();
        let run = InlineFn::new("noop", |_| Ok(()));
        let result = add_rule(
            &mut registry,
            Some("a"),
            vec![
                Directive::Exec(ExecMethod::Run(run)),
                Directive::Conda("envs/tools.yaml".into()),
            ],
        );
        match result {
            Err(Error::RuleDefinition { rule, directive, .. }) => {
                assert_eq!(rule, "a");
                assert_eq!(directive, "conda");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_container_on_norun_rejected() {
        let mut registry = Registry::default();
        let result = add_rule(
            &mut registry,
            Some("a"),
            vec![Directive::Container(ContainerDirective::Image {
                url: "docker://ubuntu".into(),
                containerized: false,
            })],
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_global_container_applies_unless_disabled() {
        let mut registry = Registry::default();
        registry.global_container("docker://ubuntu", false);
        add_rule(&mut registry, Some("a"), vec![shell("ls")]).unwrap();
        add_rule(
            &mut registry,
            Some("b"),
            vec![shell("ls"), Directive::Container(ContainerDirective::Disabled)],
        )
        .unwrap();
        add_rule(&mut registry, Some("c"), vec![]).unwrap();

        assert_eq!(
            registry.get_rule("a").unwrap().environment.container.as_deref(),
            Some("docker://ubuntu")
        );
        assert!(registry.get_rule("b").unwrap().environment.container.is_none());
        assert!(registry.get_rule("c").unwrap().environment.container.is_none());
    }

    #[test]
    fn test_wrapper_derives_conda_env() {
        let mut registry = Registry::default();
        add_rule(
            &mut registry,
            Some("a"),
            vec![Directive::Exec(ExecMethod::Wrapper("v1/bio/bwa/mem".into()))],
        )
        .unwrap();
        let conda = registry.get_rule("a").unwrap().environment.conda.clone().unwrap();
        assert!(conda.ends_with("v1/bio/bwa/mem/environment.yaml"));
    }

    fn cached_two_outputs(multiext: bool) -> Vec<Directive> {
        let output = if multiext {
            InOutput {
                paths: IoPath::multiext("ref/genome", &[".fa", ".fai"]),
                ..InOutput::default()
            }
        } else {
            InOutput::from_patterns(["a.txt", "b.txt"])
        };
        vec![shell("touch {output}"), Directive::Output(output), Directive::Cache(Value::Bool(true))]
    }

    #[test]
    fn test_cache_multi_output_requires_multiext_when_enabled() {
        let settings = WorkflowSettings {
            enable_cache: true,
            ..WorkflowSettings::default()
        };
        let mut registry = Registry::new(settings);
        let result = add_rule(&mut registry, Some("a"), cached_two_outputs(false));
        assert!(matches!(result, Err(Error::Workflow { .. })));

        add_rule(&mut registry, Some("b"), cached_two_outputs(true)).unwrap();
        assert_eq!(registry.cache_mode("b"), Some(CacheMode::All));
    }

    #[test]
    fn test_cache_multi_output_only_warns_when_disabled() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), cached_two_outputs(false)).unwrap();
        assert_eq!(registry.cache_mode("a"), None);
    }

    #[test]
    fn test_cache_with_benchmark_fails() {
        let mut registry = Registry::default();
        let mut directives = cached_two_outputs(true);
        directives.push(Directive::Benchmark(IoPath::new("bench.tsv")));
        let result = add_rule(&mut registry, Some("a"), directives);
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_ruleorder_unknown_rule() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![]).unwrap();
        registry.ruleorder(&["a", "b"]);
        match registry.check() {
            Err(Error::UnknownRule { name, .. }) => assert_eq!(name, "b"),
            other => panic!("unexpected: {:?}", other),
        }

        add_rule(&mut registry, Some("b"), vec![]).unwrap();
        registry.ruleorder(&["b", "a"]);
        assert!(registry.check().is_ok());
        assert_eq!(
            registry.ruleorder_clauses(),
            &[vec!["a".to_string(), "b".to_string()], vec!["b".to_string(), "a".to_string()]]
        );
    }

    #[test]
    fn test_local_use_rule_multiple_names_fails() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![]).unwrap();
        add_rule(&mut registry, Some("b"), vec![]).unwrap();
        let result = registry.use_rule(UseRule {
            rules: vec!["a".into(), "b".into()],
            name_modifier: Some("c_*".into()),
            ..UseRule::default()
        });
        assert!(matches!(result, Err(Error::InvalidUseRule(_))));
        assert_eq!(registry.modifier_depth(), 0);
    }

    #[test]
    fn test_local_use_rule_clones_independently() {
        let mut registry = Registry::default();
        add_rule(
            &mut registry,
            Some("a"),
            vec![
                shell("sort {input} > {output}"),
                Directive::Output(InOutput::from_patterns(["{x}.sorted"])),
                Directive::Threads(Value::Int(2)),
            ],
        )
        .unwrap();

        let mut overwrite = RuleInfo::new();
        overwrite.apply(Directive::Threads(Value::Int(8)));
        registry
            .use_rule(UseRule {
                rules: vec!["a".into()],
                name_modifier: Some("b".into()),
                overwrite: Some(overwrite),
                ..UseRule::default()
            })
            .unwrap();

        // Mutating the source afterwards does not reach the clone
        let modifier = Modifier {
            allow_rule_overwrite: true,
            ..Modifier::default()
        };
        let mut scope = registry.push_modifier(modifier);
        add_rule(&mut scope, Some("a"), vec![Directive::Threads(Value::Int(1))]).unwrap();
        drop(scope);

        let clone = registry.get_rule("b").unwrap();
        assert_eq!(clone.threads(), Some(8));
        assert_eq!(clone.output.patterns(), vec!["{x}.sorted"]);
        assert_eq!(clone.exec, ExecMethod::Shell("sort {input} > {output}".into()));
        assert!(registry.get_rule("a").unwrap().output.is_empty());
        assert_eq!(registry.modifier_depth(), 0);
    }

    #[test]
    fn test_modifier_popped_after_failed_finalize() {
        let mut registry = Registry::default();
        let result = (|| -> Result<()> {
            let mut scope = registry.push_modifier(Modifier::default());
            add_rule(&mut scope, Some("a"), vec![Directive::Threads(Value::from("x"))])?;
            Ok(())
        })();
        assert!(result.is_err());
        assert_eq!(registry.modifier_depth(), 0);
    }

    #[test]
    fn test_rename_directive_moves_key() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![Directive::Name("renamed".into())]).unwrap();
        assert!(!registry.is_rule("a"));
        assert!(registry.is_rule("renamed"));
        assert!(registry.rule_proxy("a").is_some());
        assert!(registry.rule_proxy("renamed").is_some());
        assert_eq!(registry.default_target(), Some("renamed"));
    }

    #[test]
    fn test_checkpoint_registered_under_original_name() {
        let mut registry = Registry::default();
        let mut handle = registry.register(Some("split"), true).unwrap();
        registry
            .apply_directive(&mut handle, Directive::Name("split_v2".into()))
            .unwrap();
        registry.finalize(handle).unwrap();
        assert_eq!(registry.checkpoint("split").unwrap().name, "split_v2");
        assert_eq!(registry.checkpoint("split_v2").unwrap().name, "split_v2");
    }

    #[test]
    fn test_default_target_directive() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![]).unwrap();
        add_rule(&mut registry, Some("all"), vec![Directive::DefaultTarget(Value::Bool(true))]).unwrap();
        assert_eq!(registry.default_target(), Some("all"));
        assert!(add_rule(&mut registry, Some("c"), vec![Directive::DefaultTarget(Value::from("yes"))]).is_err());
    }

    #[test]
    fn test_handover_gets_global_resources_and_is_local() {
        let mut settings = WorkflowSettings::default();
        settings.set_cores(16);
        settings.global_resources.insert("mem_mb".to_string(), 64000);
        let mut registry = Registry::new(settings);
        add_rule(&mut registry, Some("nf"), vec![shell("nextflow run"), Directive::Handover(true)]).unwrap();

        let rule = registry.get_rule("nf").unwrap();
        assert!(rule.is_handover);
        assert_eq!(rule.threads(), Some(16));
        assert_eq!(rule.resources["mem_mb"], ResourceValue::Int(64000));
        assert!(registry.is_local(rule));
    }

    #[test]
    fn test_is_local() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("norun"), vec![]).unwrap();
        add_rule(&mut registry, Some("work"), vec![shell("ls")]).unwrap();
        add_rule(&mut registry, Some("listed"), vec![shell("ls")]).unwrap();
        registry.localrules(&["listed", "ghost"]);

        assert!(registry.is_local(registry.get_rule("norun").unwrap()));
        assert!(!registry.is_local(registry.get_rule("work").unwrap()));
        assert!(registry.is_local(registry.get_rule("listed").unwrap()));
        assert_eq!(registry.check_localrules(), vec!["ghost".to_string()]);
    }

    #[test]
    fn test_input_wildcards_must_come_from_output() {
        let mut registry = Registry::default();
        let result = add_rule(
            &mut registry,
            Some("a"),
            vec![
                Directive::Input(InOutput::from_patterns(["{sample}.fq"])),
                Directive::Output(InOutput::from_patterns(["out.txt"])),
            ],
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_envvars() {
        std::env::set_var("RULERUNNER_TEST_TOKEN", "x");
        let mut registry = Registry::default();
        registry.register_envvars(&["RULERUNNER_TEST_TOKEN"]).unwrap();
        assert!(registry.envvars().contains("RULERUNNER_TEST_TOKEN"));

        assert!(matches!(
            registry.register_envvars(&["BAD-NAME"]),
            Err(Error::EnvironmentVariable(_))
        ));
        assert!(matches!(
            registry.register_envvars(&["RULERUNNER_SURELY_UNDEFINED_VAR"]),
            Err(Error::EnvironmentVariable(_))
        ));
    }

    #[test]
    fn test_get_rule_errors() {
        let mut registry = Registry::default();
        assert!(matches!(registry.get_rule("a"), Err(Error::NoRules)));
        add_rule(&mut registry, Some("a"), vec![]).unwrap();
        assert!(matches!(registry.get_rule("b"), Err(Error::UnknownRule { .. })));
    }

    #[test]
    fn test_listings() {
        let mut registry = Registry::default();
        add_rule(
            &mut registry,
            Some("b"),
            vec![
                Directive::Output(InOutput::from_patterns(["{s}.txt"])),
                Directive::resources(vec![("mem_mb", Value::Int(10))]),
            ],
        )
        .unwrap();
        add_rule(
            &mut registry,
            Some("a"),
            vec![
                Directive::Input(InOutput::from_patterns(["x.txt"])),
                Directive::Output(InOutput::from_patterns(["all.done"])),
            ],
        )
        .unwrap();

        let names: Vec<&str> = registry.list_rules(false).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let targets: Vec<&str> = registry.list_rules(true).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(targets, vec!["a"]);
        assert_eq!(registry.list_resources().into_iter().collect::<Vec<_>>(), vec!["mem_mb"]);
        assert_eq!(registry.concrete_files(), vec!["x.txt", "all.done"]);
    }

    #[test]
    fn test_global_wildcard_constraints_update_scope_rules() {
        let mut registry = Registry::default();
        add_rule(&mut registry, Some("a"), vec![Directive::Output(InOutput::from_patterns(["{s}.txt"]))]).unwrap();
        let mut constraints = BTreeMap::new();
        constraints.insert("s".to_string(), "[a-z]+".to_string());
        registry.global_wildcard_constraints(constraints).unwrap();
        add_rule(&mut registry, Some("b"), vec![Directive::Output(InOutput::from_patterns(["{s}.csv"]))]).unwrap();

        assert_eq!(registry.get_rule("a").unwrap().wildcard_constraints["s"], "[a-z]+");
        assert_eq!(registry.get_rule("b").unwrap().wildcard_constraints["s"], "[a-z]+");
    }

    #[test]
    fn test_configfile_merges_and_missing_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.yaml"), "samples: [A, B]\nthreads: 2\n").unwrap();
        let mut settings = WorkflowSettings {
            overwrite_workdir: Some(temp.path().to_path_buf()),
            ..WorkflowSettings::default()
        };
        settings.add_config_override("threads", "4");

        let mut registry = Registry::new(settings);
        registry.configfile("config.yaml").unwrap();
        assert_eq!(
            config_lookup(registry.config(), "threads"),
            Some(&YamlValue::from(4))
        );
        assert!(matches!(registry.configfile("missing.yaml"), Err(Error::Workflow { .. })));
    }

    struct RecordingSource {
        loads: Mutex<Vec<PathBuf>>,
    }

    impl RuleSource for RecordingSource {
        fn load(&self, registry: &mut Registry, path: &Path) -> Result<()> {
            if let Ok(mut loads) = self.loads.lock() {
                loads.push(path.to_path_buf());
            }
            for name in ["align", "sort", "index"] {
                let mut handle = registry.register(Some(name), false)?;
                registry.apply_directive(
                    &mut handle,
                    Directive::Output(InOutput::from_patterns([format!("{}/{{s}}.out", name)])),
                )?;
                registry.apply_directive(&mut handle, shell("true"))?;
                registry.finalize(handle)?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_module_rules_loaded_lazily_and_renamed() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("module.yaml");
        fs::write(&file, "").unwrap();
        let source = Arc::new(RecordingSource {
            loads: Mutex::new(Vec::new()),
        });
        let mut registry = Registry::default().with_source(source.clone());

        registry.module(ModuleInfo {
            prefix: Some("mod".to_string()),
            ..ModuleInfo::new("mapping", file.to_string_lossy())
        });
        assert!(source.loads.lock().unwrap().is_empty());

        let mut overwrite = RuleInfo::new();
        overwrite.apply(Directive::Threads(Value::Int(4)));
        registry
            .use_rule(UseRule {
                rules: vec!["*".into()],
                from_module: Some("mapping".into()),
                exclude: vec!["index".into()],
                name_modifier: Some("mapping_*".into()),
                overwrite: Some(overwrite),
            })
            .unwrap();

        assert_eq!(source.loads.lock().unwrap().len(), 1);
        let names: Vec<&str> = registry.rules().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["mapping_align", "mapping_sort"]);
        let align = registry.get_rule("mapping_align").unwrap();
        assert_eq!(align.output.patterns(), vec!["mod/align/{s}.out"]);
        assert_eq!(align.threads(), Some(4));
        assert_eq!(registry.modifier_depth(), 0);
    }

    #[test]
    fn test_use_rule_unknown_module() {
        let mut registry = Registry::default();
        let result = registry.use_rule(UseRule {
            rules: vec!["*".into()],
            from_module: Some("nope".into()),
            ..UseRule::default()
        });
        assert!(matches!(result, Err(Error::InvalidUseRule(_))));
    }

    #[test]
    fn test_repeated_include_ignored() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("rules.yaml");
        fs::write(&file, "").unwrap();
        let source = Arc::new(RecordingSource {
            loads: Mutex::new(Vec::new()),
        });
        let mut registry = Registry::default().with_source(source.clone());
        let path = file.to_string_lossy().to_string();
        registry.include(&path, true).unwrap();
        registry.include(&path, true).unwrap();
        assert_eq!(source.loads.lock().unwrap().len(), 1);
        assert_eq!(registry.default_target(), Some("align"));
    }
}
