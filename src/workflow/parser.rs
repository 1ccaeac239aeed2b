//! Workflow Parser
//!
//! Loads YAML workflow documents and turns them, in declaration order,
//! into directive calls on a [`Registry`]. The document is plain data:
//! functions are referenced by the name they were registered under
//! (`{fn: name}`, `run: name`), never evaluated.
//!
//! ```yaml
//! configfile: config.yaml
//! rules:
//!   - name: all
//!     input: [results/a.txt]
//!   - name: make
//!     output: ["results/{sample}.txt"]
//!     threads: 2
//!     shell: "echo {wildcards.sample} > {output}"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::{Mapping, Value as YamlValue};

use crate::error::{Error, Result};

use super::module::{ModuleInfo, RuleSource};
use super::registry::{Registry, UseRule};
use super::rule::ExecMethod;
use super::ruleinfo::{ContainerDirective, Directive, InOutput, IoPath, Params, RuleInfo};
use super::settings::{config_lookup, WorkflowSettings};
use super::value::Value;

static RULE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^rules\.(?P<rule>[\w-]+)\.(?P<section>input|output|log)(?:\[(?P<index>\d+)\]|\.(?P<key>\w+))$",
    )
    .expect("rule reference regex should compile")
});

const EXEC_KEYS: [&str; 6] = ["shell", "script", "notebook", "wrapper", "template_engine", "run"];

/// Rule source reading YAML workflow documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlRuleSource;

impl RuleSource for YamlRuleSource {
    fn load(&self, registry: &mut Registry, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::workflow(format!(
                "Failed to read workflow file '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("YAML content loaded ({} bytes)", content.len());
        let document: YamlValue = serde_yaml::from_str(&content)?;
        apply_document(registry, &document)
    }
}

/// Loads a workflow file into a fresh registry.
///
/// ```rust,no_run
/// use rulerunner::workflow::{load_workflow, WorkflowSettings};
///
/// let registry = load_workflow("workflow.yaml", WorkflowSettings::default())?;
/// println!("Loaded {} rules", registry.len());
/// # Ok::<(), rulerunner::error::Error>(())
/// ```
pub fn load_workflow(path: impl AsRef<Path>, settings: WorkflowSettings) -> Result<Registry> {
    let mut registry = Registry::new(settings).with_source(Arc::new(YamlRuleSource));
    load_into(&mut registry, path)?;
    Ok(registry)
}

/// Loads a workflow file into a registry that already has functions registered.
pub fn load_into(registry: &mut Registry, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());
    if !registry.has_source() {
        registry.set_source(Arc::new(YamlRuleSource));
    }
    registry.include(&path.to_string_lossy(), true)?;
    info!("Parsed {} rules", registry.len());
    Ok(())
}

/// Applies the top-level statements of one document.
pub fn apply_document(registry: &mut Registry, document: &YamlValue) -> Result<()> {
    let map = match document {
        YamlValue::Null => return Ok(()),
        YamlValue::Mapping(map) => map,
        _ => return Err(Error::workflow("Workflow document must be a mapping")),
    };

    for (key, value) in map {
        let key = key_str(key)?;
        match key {
            "configfile" => {
                for path in strings(value, key)? {
                    registry.configfile(&path)?;
                }
            }
            "config" => registry.update_config(value),
            "report" => registry.report(&string(value, key)?),
            "workdir" => registry.workdir(&string(value, key)?),
            "envvars" => registry.register_envvars(&strings(value, key)?)?,
            "wildcard_constraints" => {
                registry.global_wildcard_constraints(string_map(value, key)?)?
            }
            "container" => registry.global_container(&string(value, key)?, false),
            "containerized" => registry.global_container(&string(value, key)?, true),
            "localrules" => registry.localrules(&strings(value, key)?),
            "ruleorder" => {
                for clause in sequence(value, key)? {
                    let names = match clause {
                        YamlValue::String(s) => s.split('>').map(|n| n.trim().to_string()).collect(),
                        other => strings(other, key)?,
                    };
                    registry.ruleorder(&names);
                }
            }
            "include" => {
                for path in strings(value, key)? {
                    registry.include(&path, false)?;
                }
            }
            "subworkflows" => {
                for (name, spec) in mapping(value, key)? {
                    let name = key_str(name)?;
                    let field = |field: &str| -> Result<Option<String>> {
                        spec.get(field).map(|v| string(v, field)).transpose()
                    };
                    registry.subworkflow(
                        name,
                        field("snakefile")?.as_deref(),
                        field("workdir")?.as_deref(),
                        field("configfile")?.as_deref(),
                    )?;
                }
            }
            "modules" => {
                for (name, spec) in mapping(value, key)? {
                    registry.module(module_info(key_str(name)?, spec)?);
                }
            }
            "use_rules" => {
                for statement in sequence(value, key)? {
                    let statement = use_rule(registry, statement)?;
                    registry.use_rule(statement)?;
                }
            }
            "rules" => {
                for entry in sequence(value, key)? {
                    load_rule(registry, entry)?;
                }
            }
            other => {
                return Err(Error::workflow(format!(
                    "Unknown top-level key '{}' in workflow document",
                    other
                )))
            }
        }
    }
    Ok(())
}

fn load_rule(registry: &mut Registry, entry: &YamlValue) -> Result<()> {
    let map = entry
        .as_mapping()
        .ok_or_else(|| Error::workflow("Rule entries must be mappings"))?;
    let name = map.get("name").map(|v| string(v, "name")).transpose()?;
    let checkpoint = match map.get("checkpoint") {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| Error::workflow("'checkpoint' must be a boolean"))?,
        None => false,
    };

    let mut handle = registry.register(name.as_deref(), checkpoint)?;
    if handle.is_skipped() {
        return Ok(());
    }
    let rule = handle.name().to_string();
    for directive in rule_directives(registry, &rule, map, &["name", "checkpoint"])? {
        registry.apply_directive(&mut handle, directive)?;
    }
    registry.finalize(handle)?;
    Ok(())
}

/// Translates the directive keys of a rule entry.
fn rule_directives(
    registry: &Registry,
    rule: &str,
    map: &Mapping,
    skip: &[&str],
) -> Result<Vec<Directive>> {
    let exec_count = map
        .keys()
        .filter_map(YamlValue::as_str)
        .filter(|k| EXEC_KEYS.contains(k))
        .count();
    if exec_count > 1 {
        return Err(Error::rule_definition(
            rule,
            "execution",
            format!("only one of {} may be given", EXEC_KEYS.join(", ")),
        ));
    }

    let mut directives = Vec::new();
    for (key, value) in map {
        let key = key_str(key)?;
        if skip.contains(&key) {
            continue;
        }
        let invalid = |message: &str| Error::rule_definition(rule, key, message);
        let text = || value.as_str().map(str::to_string).ok_or_else(|| invalid("expected a string"));

        let directive = match key {
            "input" => Directive::Input(in_output(registry, rule, key, value)?),
            "output" => Directive::Output(in_output(registry, rule, key, value)?),
            "log" => Directive::Log(in_output(registry, rule, key, value)?),
            "benchmark" => {
                let mut paths = path_items(registry, rule, key, value)?;
                if paths.len() != 1 {
                    return Err(invalid("expected a single path"));
                }
                Directive::Benchmark(paths.remove(0))
            }
            "params" => {
                let mut params = Params::default();
                match value {
                    YamlValue::Mapping(named) => {
                        for (name, v) in named {
                            params
                                .named
                                .insert(key_str(name)?.to_string(), to_value(registry, rule, key, v)?);
                        }
                    }
                    YamlValue::Sequence(items) => {
                        for v in items {
                            params.positional.push(to_value(registry, rule, key, v)?);
                        }
                    }
                    other => params.positional.push(to_value(registry, rule, key, other)?),
                }
                Directive::Params(params)
            }
            "resources" => {
                let mut positional = Vec::new();
                let mut named = indexmap::IndexMap::new();
                match value {
                    YamlValue::Mapping(entries) => {
                        for (name, v) in entries {
                            named.insert(key_str(name)?.to_string(), to_value(registry, rule, key, v)?);
                        }
                    }
                    YamlValue::Sequence(items) => {
                        for v in items {
                            match v {
                                YamlValue::Mapping(entry) if entry.len() == 1 => {
                                    for (name, v) in entry {
                                        named.insert(
                                            key_str(name)?.to_string(),
                                            to_value(registry, rule, key, v)?,
                                        );
                                    }
                                }
                                other => positional.push(to_value(registry, rule, key, other)?),
                            }
                        }
                    }
                    other => positional.push(to_value(registry, rule, key, other)?),
                }
                Directive::Resources { positional, named }
            }
            "threads" => Directive::Threads(to_value(registry, rule, key, value)?),
            "priority" => Directive::Priority(to_value(registry, rule, key, value)?),
            "retries" => Directive::Retries(to_value(registry, rule, key, value)?),
            "shadow" => Directive::Shadow(to_value(registry, rule, key, value)?),
            "cache" => Directive::Cache(to_value(registry, rule, key, value)?),
            "default_target" => Directive::DefaultTarget(to_value(registry, rule, key, value)?),
            "localrule" => Directive::LocalRule(to_value(registry, rule, key, value)?),
            "conda" => Directive::Conda(text()?),
            "container" | "containerized" => match value {
                YamlValue::Null => Directive::Container(ContainerDirective::Disabled),
                _ => Directive::Container(ContainerDirective::Image {
                    url: text()?,
                    containerized: key == "containerized",
                }),
            },
            "envmodules" => Directive::EnvModules(
                strings(value, key).map_err(|_| invalid("expected a list of module names"))?,
            ),
            "message" => Directive::Message(text()?),
            "group" => Directive::Group(text()?),
            "version" => match value {
                YamlValue::Number(n) => Directive::Version(n.to_string()),
                _ => Directive::Version(text()?),
            },
            "doc" => Directive::Docstring(text()?),
            "rename" => Directive::Name(text()?),
            "handover" => Directive::Handover(
                value.as_bool().ok_or_else(|| invalid("expected a boolean"))?,
            ),
            "wildcard_constraints" => Directive::WildcardConstraints(
                string_map(value, key).map_err(|_| invalid("expected a mapping of regexes"))?,
            ),
            "shell" => Directive::Exec(ExecMethod::Shell(text()?)),
            "script" => Directive::Exec(ExecMethod::Script(text()?)),
            "notebook" => Directive::Exec(ExecMethod::Notebook(text()?)),
            "wrapper" => Directive::Exec(ExecMethod::Wrapper(text()?)),
            "template_engine" => Directive::Exec(ExecMethod::TemplateEngine(text()?)),
            "run" => {
                let name = text()?;
                let func = registry.inline_fn(&name).cloned().ok_or_else(|| {
                    Error::rule_definition(
                        rule,
                        key,
                        format!("no inline function named '{}' is registered", name),
                    )
                })?;
                Directive::Exec(ExecMethod::Run(func))
            }
            other => {
                return Err(Error::rule_definition(
                    rule,
                    other,
                    "unknown directive",
                ))
            }
        };
        directives.push(directive);
    }
    Ok(directives)
}

/// Positional and named paths of an input/output/log directive.
fn in_output(registry: &Registry, rule: &str, directive: &str, value: &YamlValue) -> Result<InOutput> {
    let mut io = InOutput::new();
    let items: Vec<&YamlValue> = match value {
        YamlValue::Sequence(items) => items.iter().collect(),
        YamlValue::Mapping(map) if !is_path_form(map) => {
            for (name, item) in map {
                io.named
                    .insert(key_str(name)?.to_string(), named_path(registry, rule, directive, item)?);
            }
            return Ok(io);
        }
        other => vec![other],
    };

    for item in items {
        match item {
            YamlValue::Mapping(map) if !is_path_form(map) && map.len() == 1 => {
                for (name, item) in map {
                    io.named
                        .insert(key_str(name)?.to_string(), named_path(registry, rule, directive, item)?);
                }
            }
            other => io.paths.extend(path_items(registry, rule, directive, other)?),
        }
    }
    Ok(io)
}

fn named_path(registry: &Registry, rule: &str, directive: &str, value: &YamlValue) -> Result<IoPath> {
    let mut paths = path_items(registry, rule, directive, value)?;
    if paths.len() != 1 {
        return Err(Error::rule_definition(
            rule,
            directive,
            "a named entry must hold exactly one path",
        ));
    }
    Ok(paths.remove(0))
}

fn is_path_form(map: &Mapping) -> bool {
    ["multiext", "temp", "subworkflow"]
        .iter()
        .any(|k| map.contains_key(*k))
}

/// One path item; `multiext` expands to several paths.
fn path_items(registry: &Registry, rule: &str, directive: &str, value: &YamlValue) -> Result<Vec<IoPath>> {
    let invalid = |message: String| Error::rule_definition(rule, directive, message);
    match value {
        YamlValue::String(path) => match RULE_REFERENCE.captures(path) {
            Some(caps) => {
                let target = &caps["rule"];
                let section = &caps["section"];
                let key = caps
                    .name("index")
                    .or_else(|| caps.name("key"))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                let proxy = registry
                    .rule_proxy(target)
                    .ok_or_else(|| Error::unknown_rule(target, format!("Reference in rule '{}'", rule)))?;
                let file = proxy.file(section, key).ok_or_else(|| {
                    invalid(format!("rule '{}' has no {} '{}'", target, section, key))
                })?;
                Ok(vec![file.clone()])
            }
            None => Ok(vec![IoPath::new(path.as_str())]),
        },
        YamlValue::Mapping(map) => {
            if let Some(spec) = map.get("multiext") {
                let parts = strings(spec, "multiext").map_err(|e| invalid(e.to_string()))?;
                let Some((prefix, extensions)) = parts.split_first() else {
                    return Err(invalid("multiext needs a prefix and extensions".to_string()));
                };
                let extensions: Vec<&str> = extensions.iter().map(String::as_str).collect();
                Ok(IoPath::multiext(prefix, &extensions))
            } else if let Some(path) = map.get("temp") {
                let path = string(path, "temp").map_err(|e| invalid(e.to_string()))?;
                Ok(vec![IoPath::temp(path)])
            } else if let Some(name) = map.get("subworkflow") {
                let name = string(name, "subworkflow").map_err(|e| invalid(e.to_string()))?;
                let path = map
                    .get("path")
                    .ok_or_else(|| invalid("subworkflow path needs a 'path'".to_string()))
                    .and_then(|p| string(p, "path").map_err(|e| invalid(e.to_string())))?;
                Ok(vec![registry.subworkflow_target(&name, &path)?])
            } else {
                Err(invalid("unrecognised path item".to_string()))
            }
        }
        other => Err(invalid(format!("a {} is not a path", yaml_kind(other)))),
    }
}

/// Converts a YAML value, resolving `{fn: name}` and `{config: key}` references.
fn to_value(registry: &Registry, rule: &str, directive: &str, value: &YamlValue) -> Result<Value> {
    Ok(match value {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        YamlValue::String(s) => Value::Str(s.clone()),
        YamlValue::Sequence(items) => Value::List(
            items
                .iter()
                .map(|v| to_value(registry, rule, directive, v))
                .collect::<Result<_>>()?,
        ),
        YamlValue::Mapping(map) => {
            if let (1, Some(name)) = (map.len(), map.get("fn").and_then(YamlValue::as_str)) {
                let resolver = registry.function(name).cloned().ok_or_else(|| {
                    Error::rule_definition(
                        rule,
                        directive,
                        format!("no function named '{}' is registered", name),
                    )
                })?;
                return Ok(Value::Resolver(resolver));
            }
            if let (1, Some(key)) = (map.len(), map.get("config").and_then(YamlValue::as_str)) {
                let found = config_lookup(registry.config(), key).ok_or_else(|| {
                    Error::rule_definition(rule, directive, format!("config key '{}' is not set", key))
                })?;
                return to_value(registry, rule, directive, found);
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(key_str(k)?.to_string(), to_value(registry, rule, directive, v)?);
            }
            Value::Map(out)
        }
        YamlValue::Tagged(tagged) => to_value(registry, rule, directive, &tagged.value)?,
    })
}

fn module_info(name: &str, spec: &YamlValue) -> Result<ModuleInfo> {
    let map = mapping(spec, name)?;
    let mut module = ModuleInfo {
        name: name.to_string(),
        ..ModuleInfo::default()
    };
    for (key, value) in map {
        match key_str(key)? {
            "snakefile" => module.snakefile = Some(string(value, "snakefile")?),
            "meta_wrapper" => module.meta_wrapper = Some(string(value, "meta_wrapper")?),
            "config" => module.config = Some(value.clone()),
            "skip_validation" => module.skip_validation = value.as_bool().unwrap_or(false),
            "prefix" => module.prefix = Some(string(value, "prefix")?),
            "replace_prefix" => module.replace_prefix = string_map(value, "replace_prefix")?,
            other => {
                return Err(Error::InvalidUseRule(format!(
                    "unknown key '{}' in module '{}'",
                    other, name
                )))
            }
        }
    }
    Ok(module)
}

fn use_rule(registry: &Registry, statement: &YamlValue) -> Result<UseRule> {
    let map = mapping(statement, "use_rules")?;
    let mut use_rule = UseRule::default();
    for (key, value) in map {
        match key_str(key)? {
            "rules" => use_rule.rules = strings(value, "rules")?,
            "from" => use_rule.from_module = Some(string(value, "from")?),
            "exclude" => use_rule.exclude = strings(value, "exclude")?,
            "as" => use_rule.name_modifier = Some(string(value, "as")?),
            "with" => {
                let overrides = mapping(value, "with")?;
                let label = use_rule.rules.join(",");
                let mut info = RuleInfo::new();
                for directive in rule_directives(registry, &label, overrides, &[])? {
                    info.apply(directive);
                }
                use_rule.overwrite = Some(info);
            }
            other => {
                return Err(Error::InvalidUseRule(format!(
                    "unknown key '{}' in use rule statement",
                    other
                )))
            }
        }
    }
    if use_rule.rules.is_empty() {
        return Err(Error::InvalidUseRule("no rules given".to_string()));
    }
    Ok(use_rule)
}

// ----------------------------------------------------------------------
// YAML helpers
// ----------------------------------------------------------------------

fn key_str(key: &YamlValue) -> Result<&str> {
    key.as_str()
        .ok_or_else(|| Error::workflow(format!("Keys must be strings, found a {}", yaml_kind(key))))
}

fn string(value: &YamlValue, field: &str) -> Result<String> {
    match value {
        YamlValue::String(s) => Ok(s.clone()),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(Error::workflow(format!(
            "'{}' must be a string, found a {}",
            field,
            yaml_kind(other)
        ))),
    }
}

/// A string or a list of strings.
fn strings(value: &YamlValue, field: &str) -> Result<Vec<String>> {
    match value {
        YamlValue::Sequence(items) => items.iter().map(|v| string(v, field)).collect(),
        other => Ok(vec![string(other, field)?]),
    }
}

fn sequence<'a>(value: &'a YamlValue, field: &str) -> Result<&'a Vec<YamlValue>> {
    value
        .as_sequence()
        .ok_or_else(|| Error::workflow(format!("'{}' must be a list", field)))
}

fn mapping<'a>(value: &'a YamlValue, field: &str) -> Result<&'a Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| Error::workflow(format!("'{}' must be a mapping", field)))
}

fn string_map(value: &YamlValue, field: &str) -> Result<BTreeMap<String, String>> {
    mapping(value, field)?
        .iter()
        .map(|(k, v)| Ok((key_str(k)?.to_string(), string(v, field)?)))
        .collect()
}

fn yaml_kind(value: &YamlValue) -> &'static str {
    match value {
        YamlValue::Null => "null",
        YamlValue::Bool(_) => "boolean",
        YamlValue::Number(_) => "number",
        YamlValue::String(_) => "string",
        YamlValue::Sequence(_) => "list",
        YamlValue::Mapping(_) => "mapping",
        YamlValue::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::rule::{ShadowMode, CORES};
    use crate::workflow::value::{Literal, Resolver, ResourceValue};
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn load_str(content: &str) -> Result<Registry> {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "workflow.yaml", content);
        load_workflow(&path, WorkflowSettings::default())
    }

    #[test]
    fn test_load_basic_workflow() {
        let registry = load_str(
            r#"
rules:
  - name: all
    input: [y.txt]
  - name: b
    input: x.txt
    output: y.txt
    threads: 2
    shell: "cat {input} > {output}"
"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.default_target(), Some("all"));
        let b = registry.get_rule("b").unwrap();
        assert_eq!(b.threads(), Some(2));
        assert_eq!(b.input.patterns(), vec!["x.txt"]);
        assert!(matches!(b.exec, ExecMethod::Shell(_)));
    }

    #[test]
    fn test_unknown_rule_key_fails() {
        let result = load_str(
            r#"
rules:
  - name: a
    outptu: x.txt
"#,
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_two_exec_methods_fail() {
        let result = load_str(
            r#"
rules:
  - name: a
    shell: "true"
    script: run.py
"#,
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_path_forms() {
        let registry = load_str(
            r#"
rules:
  - name: index
    output:
      - multiext: ["ref/genome", ".amb", ".bwt"]
      - temp: tmp/x.txt
      - stats: ref/stats.txt
  - name: use
    input:
      - rules.index.output[0]
      - rules.index.output.stats
    output: done.txt
"#,
        )
        .unwrap();

        let index = registry.get_rule("index").unwrap();
        assert_eq!(index.output.paths.len(), 3);
        assert!(index.output.paths[0].multiext);
        assert!(index.output.paths[2].temp);
        assert_eq!(index.output.get("stats").unwrap().pattern, "ref/stats.txt");

        let consumer = registry.get_rule("use").unwrap();
        assert_eq!(
            consumer.input.patterns(),
            vec!["ref/genome.amb", "ref/stats.txt"]
        );
    }

    #[test]
    fn test_resources_and_shadow() {
        let registry = load_str(
            r#"
rules:
  - name: a
    output: a.txt
    threads: 3.9
    resources:
      mem_mb: 100
      disk: "10G"
    shadow: minimal
"#,
        )
        .unwrap();
        let rule = registry.get_rule("a").unwrap();
        assert_eq!(rule.threads(), Some(3));
        assert_eq!(rule.resources.get("mem_mb"), Some(&ResourceValue::Int(100)));
        assert_eq!(rule.shadow, ShadowMode::Minimal);
    }

    #[test]
    fn test_positional_resource_fails() {
        let result = load_str(
            r#"
rules:
  - name: a
    output: a.txt
    resources: [{mem: 100}, bad]
"#,
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_function_reference() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "workflow.yaml",
            r#"
rules:
  - name: a
    output: a.txt
    threads: {fn: half}
"#,
        );
        let mut registry = Registry::default();
        registry.register_function(Resolver::new("half", |ctx| Literal::Int(ctx.cores / 2)));
        load_into(&mut registry, &path).unwrap();

        let rule = registry.get_rule("a").unwrap();
        assert!(matches!(rule.resources.get(CORES), Some(ResourceValue::Resolver(_))));
    }

    #[test]
    fn test_unregistered_function_fails() {
        let result = load_str(
            r#"
rules:
  - name: a
    output: a.txt
    threads: {fn: missing}
"#,
        );
        assert!(matches!(result, Err(Error::RuleDefinition { .. })));
    }

    #[test]
    fn test_config_reference() {
        let registry = load_str(
            r#"
config:
  threads: 4
rules:
  - name: a
    output: a.txt
    threads: {config: threads}
"#,
        )
        .unwrap();
        assert_eq!(registry.get_rule("a").unwrap().threads(), Some(4));
    }

    #[test]
    fn test_ruleorder_and_localrules() {
        let registry = load_str(
            r#"
localrules: [a]
ruleorder:
  - "a > b"
  - [b, a]
rules:
  - name: a
    output: "{x}.txt"
  - name: b
    output: "{x}.txt"
"#,
        )
        .unwrap();
        assert_eq!(registry.ruleorder_clauses().len(), 2);
        assert_eq!(registry.ruleorder_clauses()[0], vec!["a", "b"]);
        assert!(registry.localrule_names().contains("a"));
        registry.check().unwrap();
    }

    #[test]
    fn test_include_and_module_use() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "lib.yaml",
            r#"
rules:
  - name: fetch
    output: raw.txt
    shell: "touch {output}"
  - name: other
    output: other.txt
"#,
        );
        let path = write(
            &dir,
            "workflow.yaml",
            r#"
modules:
  lib:
    snakefile: lib.yaml
    prefix: mod
use_rules:
  - rules: [fetch]
    from: lib
    as: "lib_*"
    with:
      threads: 2
"#,
        );
        let registry = load_workflow(&path, WorkflowSettings::default()).unwrap();
        let rule = registry.get_rule("lib_fetch").unwrap();
        assert_eq!(rule.threads(), Some(2));
        assert_eq!(rule.output.patterns(), vec!["mod/raw.txt"]);
        assert!(!registry.is_rule("lib_other"));
        assert_eq!(registry.modifier_depth(), 0);
    }

    #[test]
    fn test_local_use_rule() {
        let registry = load_str(
            r#"
rules:
  - name: a
    output: "{x}.txt"
    threads: 1
    shell: "touch {output}"
use_rules:
  - rules: [a]
    as: a_big
    with:
      threads: 8
"#,
        )
        .unwrap();
        assert_eq!(registry.get_rule("a").unwrap().threads(), Some(1));
        assert_eq!(registry.get_rule("a_big").unwrap().threads(), Some(8));
    }

    #[test]
    fn test_unknown_top_level_key_fails() {
        assert!(load_str("rulez: []").is_err());
    }

    #[test]
    fn test_empty_document() {
        let registry = load_str("").unwrap();
        assert!(registry.is_empty());
    }
}
