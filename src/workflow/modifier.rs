//! Registration Scopes
//!
//! A [`Modifier`] changes how rules are registered while it is active:
//! rule names may be rewritten, paths prefixed, rules skipped and
//! directives overridden. Modifiers form a stack owned by the registry;
//! the topmost one is consulted by every directive call. A scope is
//! pushed with [`Registry::push_modifier`](super::Registry::push_modifier)
//! and popped when the returned guard is dropped, so an error inside an
//! imported module never leaves its modifier active.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::ruleinfo::RuleInfo;

/// Rewrites rule names inside a scope.
pub type NameModifierFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Rewrites relative paths of rules imported from a module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathModifier {
    pub prefix: Option<String>,
    pub replace_prefix: BTreeMap<String, String>,
}

impl PathModifier {
    pub fn new(prefix: Option<String>, replace_prefix: BTreeMap<String, String>) -> Self {
        Self {
            prefix,
            replace_prefix,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.prefix.is_none() && self.replace_prefix.is_empty()
    }

    /// Applies the longest matching prefix replacement, or else the prefix.
    ///
    /// Absolute paths are left untouched by the prefix.
    pub fn modify(&self, path: &str) -> String {
        let replacement = self
            .replace_prefix
            .iter()
            .filter(|(old, _)| path.starts_with(old.as_str()))
            .max_by_key(|(old, _)| old.len());
        if let Some((old, new)) = replacement {
            return format!("{}{}", new, &path[old.len()..]);
        }

        match &self.prefix {
            Some(prefix) if !Path::new(path).is_absolute() => {
                format!("{}/{}", prefix.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }
}

/// One registration scope.
#[derive(Clone, Default)]
pub struct Modifier {
    /// Module the scope belongs to, if any
    pub namespace: Option<String>,
    pub rulename_modifier: Option<NameModifierFn>,
    pub path_modifier: PathModifier,
    /// Only these rules are registered; `None` admits all
    pub rule_whitelist: Option<BTreeSet<String>>,
    pub rule_exclude: BTreeSet<String>,
    /// Directive values merged over every rule registered in this scope
    pub ruleinfo_overwrite: Option<RuleInfo>,
    pub wildcard_constraints: BTreeMap<String, String>,
    pub skip_configfile: bool,
    pub skip_global_report_caption: bool,
    pub skip_validation: bool,
    pub allow_rule_overwrite: bool,
    /// Config visible to rules registered in this scope
    pub config: Option<serde_yaml::Value>,
    /// Names of rules registered while this scope was active
    pub rules: Vec<String>,
}

impl Modifier {
    /// Starts a nested scope that inherits the parent's path rewriting,
    /// wildcard constraints and config.
    pub fn child_of(parent: &Modifier) -> Self {
        Self {
            namespace: parent.namespace.clone(),
            path_modifier: parent.path_modifier.clone(),
            wildcard_constraints: parent.wildcard_constraints.clone(),
            skip_configfile: parent.skip_configfile,
            skip_global_report_caption: parent.skip_global_report_caption,
            skip_validation: parent.skip_validation,
            config: parent.config.clone(),
            ..Self::default()
        }
    }

    pub fn with_rulename_modifier(mut self, modifier: Option<NameModifierFn>) -> Self {
        self.rulename_modifier = modifier;
        self
    }

    pub fn with_overwrite(mut self, overwrite: Option<RuleInfo>) -> Self {
        self.ruleinfo_overwrite = overwrite;
        self
    }

    pub fn skip_rule(&self, name: &str) -> bool {
        let not_whitelisted = self
            .rule_whitelist
            .as_ref()
            .map(|whitelist| !whitelist.contains(name))
            .unwrap_or(false);
        not_whitelisted || self.rule_exclude.contains(name)
    }

    pub fn modify_rulename(&self, name: &str) -> String {
        match &self.rulename_modifier {
            Some(modifier) => modifier(name),
            None => name.to_string(),
        }
    }
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modifier")
            .field("namespace", &self.namespace)
            .field("renames", &self.rulename_modifier.is_some())
            .field("path_modifier", &self.path_modifier)
            .field("rule_whitelist", &self.rule_whitelist)
            .field("rule_exclude", &self.rule_exclude)
            .field("allow_rule_overwrite", &self.allow_rule_overwrite)
            .finish()
    }
}

/// Builds the name rewrite of a `use rule ... as <name_modifier>` statement.
///
/// A `*` in `name_modifier` stands for the original rule name. Without a
/// `*` only a single rule may be renamed. The parent scope's rewrite is
/// applied on top, so nested module imports compose.
pub fn get_name_modifier_func(
    rules: &[String],
    name_modifier: Option<&str>,
    parent: &Modifier,
) -> Result<Option<NameModifierFn>> {
    let Some(name_modifier) = name_modifier else {
        return Ok(None);
    };
    let parent_fn = parent.rulename_modifier.clone();
    let apply_parent = move |name: String| match &parent_fn {
        Some(f) => f(&name),
        None => name,
    };

    if name_modifier.contains('*') {
        let pattern = name_modifier.to_string();
        Ok(Some(Arc::new(move |name: &str| {
            apply_parent(pattern.replace('*', name))
        })))
    } else if rules.len() == 1 {
        let fixed = name_modifier.to_string();
        Ok(Some(Arc::new(move |_: &str| apply_parent(fixed.clone()))))
    } else {
        Err(Error::InvalidUseRule(format!(
            "multiple rules are used but the name modification '{}' does not contain a wildcard '*'",
            name_modifier
        )))
    }
}
