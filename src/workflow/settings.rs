//! Workflow Settings
//!
//! Everything the command line can change about how rules are registered
//! and how a run behaves. Per-rule overrides are keyed by the final rule
//! name and win over whatever the rule definition declares.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_yaml::Value as YamlValue;

use super::rule::{CORES, NODES};
use super::value::ResourceValue;

/// Which recorded provenance changes may trigger a re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RerunTrigger {
    Mtime,
    Params,
    Input,
    Software,
    Code,
}

impl RerunTrigger {
    pub fn all() -> BTreeSet<Self> {
        [
            Self::Mtime,
            Self::Params,
            Self::Input,
            Self::Software,
            Self::Code,
        ]
        .into()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mtime" => Some(Self::Mtime),
            "params" => Some(Self::Params),
            "input" => Some(Self::Input),
            "software-env" | "software" => Some(Self::Software),
            "code" => Some(Self::Code),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mtime => "mtime",
            Self::Params => "params",
            Self::Input => "input",
            Self::Software => "software-env",
            Self::Code => "code",
        }
    }
}

/// Registry and run configuration.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Global resource pool; `_cores` and `_nodes` are always present
    pub global_resources: BTreeMap<String, i64>,
    /// Resources every rule starts with before its own directive applies
    pub default_resources: BTreeMap<String, ResourceValue>,
    pub overwrite_threads: BTreeMap<String, i64>,
    pub overwrite_resources: BTreeMap<String, BTreeMap<String, ResourceValue>>,
    pub overwrite_groups: BTreeMap<String, String>,
    pub overwrite_workdir: Option<PathBuf>,
    /// Config given with `--config`, merged after every config file
    pub overwrite_config: YamlValue,
    pub overwrite_configfiles: Vec<PathBuf>,
    pub use_conda: bool,
    pub use_singularity: bool,
    pub use_env_modules: bool,
    pub run_local: bool,
    pub enable_cache: bool,
    /// Rule names requested for between-workflow caching; empty means all eligible
    pub cache_rules: BTreeSet<String>,
    pub restart_times: u32,
    pub wrapper_prefix: String,
    pub check_envvars: bool,
    pub latency_wait: u64,
    pub immediate_submit: bool,
    pub rerun_triggers: BTreeSet<RerunTrigger>,
    pub nolock: bool,
    pub conda_prefix: Option<PathBuf>,
    pub singularity_prefix: Option<PathBuf>,
}

impl WorkflowSettings {
    pub fn cores(&self) -> i64 {
        self.global_resources.get(CORES).copied().unwrap_or(1)
    }

    pub fn nodes(&self) -> Option<i64> {
        self.global_resources.get(NODES).copied()
    }

    pub fn set_cores(&mut self, cores: i64) {
        self.global_resources.insert(CORES.to_string(), cores);
    }

    /// Applies a `key=value` override to `overwrite_config`.
    ///
    /// Dotted keys address nested mappings; values are parsed as YAML so
    /// numbers and booleans keep their type.
    pub fn add_config_override(&mut self, key: &str, value: &str) {
        let parsed: YamlValue =
            serde_yaml::from_str(value).unwrap_or_else(|_| YamlValue::String(value.to_string()));
        let mut nested = parsed;
        for part in key.rsplit('.') {
            let mut map = serde_yaml::Mapping::new();
            map.insert(YamlValue::String(part.to_string()), nested);
            nested = YamlValue::Mapping(map);
        }
        update_config(&mut self.overwrite_config, &nested);
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        let mut global_resources = BTreeMap::new();
        global_resources.insert(CORES.to_string(), num_cpus::get() as i64);
        global_resources.insert(NODES.to_string(), 1);

        let mut default_resources = BTreeMap::new();
        default_resources.insert(CORES.to_string(), ResourceValue::Int(1));
        default_resources.insert(NODES.to_string(), ResourceValue::Int(1));

        Self {
            global_resources,
            default_resources,
            overwrite_threads: BTreeMap::new(),
            overwrite_resources: BTreeMap::new(),
            overwrite_groups: BTreeMap::new(),
            overwrite_workdir: None,
            overwrite_config: YamlValue::Mapping(serde_yaml::Mapping::new()),
            overwrite_configfiles: Vec::new(),
            use_conda: false,
            use_singularity: false,
            use_env_modules: false,
            run_local: true,
            enable_cache: false,
            cache_rules: BTreeSet::new(),
            restart_times: 0,
            wrapper_prefix: "https://github.com/snakemake/snakemake-wrappers/raw/".to_string(),
            check_envvars: true,
            latency_wait: 5,
            immediate_submit: false,
            rerun_triggers: RerunTrigger::all(),
            nolock: false,
            conda_prefix: None,
            singularity_prefix: None,
        }
    }
}

/// Deep-merges `update` into `config`; mappings merge, everything else is replaced.
pub fn update_config(config: &mut YamlValue, update: &YamlValue) {
    if !(config.is_mapping() && update.is_mapping()) {
        *config = update.clone();
        return;
    }
    let (Some(base), Some(other)) = (config.as_mapping_mut(), update.as_mapping()) else {
        return;
    };
    for (key, value) in other {
        let nested = value.is_mapping() && base.get(key).map_or(false, YamlValue::is_mapping);
        if nested {
            if let Some(existing) = base.get_mut(key) {
                update_config(existing, value);
            }
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Looks up a dotted key in a config tree.
pub fn config_lookup<'a>(config: &'a YamlValue, key: &str) -> Option<&'a YamlValue> {
    key.split('.').try_fold(config, |node, part| match node {
        YamlValue::Mapping(map) => map.get(part),
        YamlValue::Sequence(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = WorkflowSettings::default();
        assert!(settings.cores() >= 1);
        assert_eq!(settings.nodes(), Some(1));
        assert_eq!(
            settings.default_resources.get(CORES),
            Some(&ResourceValue::Int(1))
        );
        assert_eq!(settings.rerun_triggers.len(), 5);
    }

    #[test]
    fn test_update_config_deep_merges() {
        let mut base: YamlValue = serde_yaml::from_str("a: {x: 1, y: 2}\nb: 3").unwrap();
        let update: YamlValue = serde_yaml::from_str("a: {y: 5}\nc: 4").unwrap();
        update_config(&mut base, &update);
        assert_eq!(config_lookup(&base, "a.x"), Some(&YamlValue::from(1)));
        assert_eq!(config_lookup(&base, "a.y"), Some(&YamlValue::from(5)));
        assert_eq!(config_lookup(&base, "c"), Some(&YamlValue::from(4)));
    }

    #[test]
    fn test_config_override_dotted_key() {
        let mut settings = WorkflowSettings::default();
        settings.add_config_override("samples.A", "reads/A.fq");
        settings.add_config_override("threads", "8");
        assert_eq!(
            config_lookup(&settings.overwrite_config, "samples.A"),
            Some(&YamlValue::from("reads/A.fq"))
        );
        assert_eq!(
            config_lookup(&settings.overwrite_config, "threads"),
            Some(&YamlValue::from(8))
        );
    }

    #[test]
    fn test_config_lookup_sequence_index() {
        let config: YamlValue = serde_yaml::from_str("units: [a, b]").unwrap();
        assert_eq!(config_lookup(&config, "units.1"), Some(&YamlValue::from("b")));
        assert!(config_lookup(&config, "units.5").is_none());
    }

    #[test]
    fn test_rerun_trigger_parse() {
        assert_eq!(RerunTrigger::parse("mtime"), Some(RerunTrigger::Mtime));
        assert_eq!(RerunTrigger::parse("software-env"), Some(RerunTrigger::Software));
        assert_eq!(RerunTrigger::parse("other"), None);
    }
}
