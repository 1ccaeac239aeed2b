//! Modules
//!
//! A module names an external rule-definition file. Defining a module only
//! records where it lives; the file is parsed when a `use rule` statement
//! asks for rules from it, inside a scope that renames, filters and
//! relocates what it registers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_yaml::Value as YamlValue;

use crate::error::{Error, Result};

use super::registry::Registry;

/// Parses a definition file into directive calls on a registry.
pub trait RuleSource: Send + Sync {
    fn load(&self, registry: &mut Registry, path: &Path) -> Result<()>;
}

/// A deferred, independently scoped rule namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    /// Definition file, relative to the defining file
    pub snakefile: Option<String>,
    /// Packaged workflow fetched from the wrapper prefix
    pub meta_wrapper: Option<String>,
    /// Replaces the module's own config files when given
    pub config: Option<YamlValue>,
    pub skip_validation: bool,
    pub replace_prefix: BTreeMap<String, String>,
    pub prefix: Option<String>,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, snakefile: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snakefile: Some(snakefile.into()),
            ..Self::default()
        }
    }

    /// Location of the definition file to parse.
    pub fn definition_file(&self, wrapper_prefix: &str) -> Result<String> {
        match (&self.snakefile, &self.meta_wrapper) {
            (Some(file), _) => Ok(file.clone()),
            (None, Some(wrapper)) => Ok(format!("{}{}/test/Snakefile", wrapper_prefix, wrapper)),
            (None, None) => Err(Error::workflow(format!(
                "Module '{}' needs either a definition file or a meta-wrapper",
                self.name
            ))),
        }
    }

    /// Rules admitted by a `use rule` statement; `*` admits all.
    pub fn rule_whitelist(rules: &[String]) -> Option<BTreeSet<String>> {
        if rules.iter().any(|r| r == "*") {
            None
        } else {
            Some(rules.iter().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_file_from_meta_wrapper() {
        let module = ModuleInfo {
            name: "qc".to_string(),
            meta_wrapper: Some("v1.0/meta/bio/qc".to_string()),
            ..Default::default()
        };
        assert_eq!(
            module.definition_file("https://wrappers/").unwrap(),
            "https://wrappers/v1.0/meta/bio/qc/test/Snakefile"
        );
    }

    #[test]
    fn test_definition_file_missing() {
        let module = ModuleInfo {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(module.definition_file("").is_err());
    }

    #[test]
    fn test_rule_whitelist() {
        assert!(ModuleInfo::rule_whitelist(&["*".to_string()]).is_none());
        let whitelist = ModuleInfo::rule_whitelist(&["a".to_string()]).unwrap();
        assert!(whitelist.contains("a"));
    }
}
