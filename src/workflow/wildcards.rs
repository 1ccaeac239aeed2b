//! Wildcard Pattern Matching
//!
//! Path templates name their placeholders in braces, e.g.
//! `mapped/{sample}.bam`. A placeholder may carry an inline constraint
//! (`{sample,[A-Z]+}`); otherwise the rule's or the global wildcard
//! constraints apply, falling back to `.+`.
//!
//! Templates are compiled into anchored regexes so that a requested file
//! can be matched against a rule's outputs and the wildcard values
//! recovered.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static WILDCARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\s*(?P<name>\w+?)(\s*,\s*(?P<constraint>([^{}]+|\{\d+(,\d+)?\})*))?\s*\}")
        .expect("wildcard regex should compile")
});

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    WILDCARD.is_match(text)
}

/// Extracts wildcard names from a pattern, in order of appearance.
///
/// # Example
/// ```
/// use rulerunner::workflow::wildcards::extract_wildcard_names;
///
/// let names = extract_wildcard_names("reads/{sample}_{lane,\\d+}.fastq");
/// assert_eq!(names, vec!["sample", "lane"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in WILDCARD.captures_iter(pattern) {
        let name = caps["name"].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// A path template compiled into an anchored regex.
///
/// A wildcard that occurs more than once must match the same text each
/// time; the regex crate has no backreferences, so repeated occurrences
/// are compared after matching.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    template: String,
    regex: Regex,
    /// Wildcard name of each `w<i>` capture group
    groups: Vec<String>,
}

impl WildcardPattern {
    pub fn compile(template: &str, constraints: &BTreeMap<String, String>) -> Result<Self> {
        let mut expr = String::from("^");
        let mut groups = Vec::new();
        let mut last = 0;

        for caps in WILDCARD.captures_iter(template) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            expr.push_str(&regex::escape(&template[last..whole.start]));
            let name = caps["name"].to_string();
            let constraint = caps
                .name("constraint")
                .map(|m| m.as_str().to_string())
                .or_else(|| constraints.get(&name).cloned())
                .unwrap_or_else(|| ".+".to_string());
            expr.push_str(&format!("(?P<w{}>{})", groups.len(), constraint));
            groups.push(name);
            last = whole.end;
        }
        expr.push_str(&regex::escape(&template[last..]));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            Error::workflow(format!("Invalid wildcard constraint in '{}': {}", template, e))
        })?;

        Ok(Self {
            template: template.to_string(),
            regex,
            groups,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Matches a concrete path, returning the wildcard values.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut values: BTreeMap<String, String> = BTreeMap::new();

        for (i, name) in self.groups.iter().enumerate() {
            let value = caps.name(&format!("w{}", i))?.as_str();
            match values.get(name) {
                Some(existing) if existing != value => return None,
                _ => {
                    values.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(values)
    }
}

/// Substitutes wildcard values into a template.
///
/// Fails if the template names a wildcard without a value.
pub fn apply_wildcards(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = None;
    let applied = WILDCARD.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps["name"];
        match values.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(Error::workflow(format!(
            "Wildcard '{}' in '{}' has no value",
            name, template
        ))),
        None => Ok(applied.into_owned()),
    }
}

/// Strips inline constraints, leaving plain `{name}` placeholders.
pub fn strip_constraints(template: &str) -> String {
    WILDCARD
        .replace_all(template, |caps: &regex::Captures<'_>| {
            format!("{{{}}}", &caps["name"])
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{sample}.fastq"));
        assert!(has_wildcards("output/{id,\\d+}.txt"));
        assert!(!has_wildcards("regular_file.txt"));
    }

    #[test]
    fn test_extract_wildcard_names() {
        assert_eq!(extract_wildcard_names("reads/{sample}.fastq"), vec!["sample"]);
        assert_eq!(
            extract_wildcard_names("{id}_{replicate}/{id}.txt"),
            vec!["id", "replicate"]
        );
    }

    #[test]
    fn test_pattern_matches_and_recovers_values() {
        let pattern = WildcardPattern::compile("mapped/{sample}.bam", &BTreeMap::new()).unwrap();
        let values = pattern.matches("mapped/A1.bam").unwrap();
        assert_eq!(values["sample"], "A1");
        assert!(pattern.matches("mapped/A1.sam").is_none());
    }

    #[test]
    fn test_inline_constraint_restricts_match() {
        let pattern = WildcardPattern::compile("run_{n,\\d+}.txt", &BTreeMap::new()).unwrap();
        assert!(pattern.matches("run_12.txt").is_some());
        assert!(pattern.matches("run_ab.txt").is_none());
    }

    #[test]
    fn test_rule_constraints_apply_when_no_inline_one() {
        let mut constraints = BTreeMap::new();
        constraints.insert("sample".to_string(), "[a-z]+".to_string());
        let pattern = WildcardPattern::compile("{sample}.txt", &constraints).unwrap();
        assert!(pattern.matches("abc.txt").is_some());
        assert!(pattern.matches("ABC.txt").is_none());
    }

    #[test]
    fn test_nested_groups_in_constraint() {
        let pattern =
            WildcardPattern::compile("{a,(x|y)+}-{b}.txt", &BTreeMap::new()).unwrap();
        let values = pattern.matches("xyx-foo.txt").unwrap();
        assert_eq!(values["a"], "xyx");
        assert_eq!(values["b"], "foo");
    }

    #[test]
    fn test_repeated_wildcard_must_agree() {
        let pattern = WildcardPattern::compile("{s}/{s}.txt", &BTreeMap::new()).unwrap();
        assert!(pattern.matches("a/a.txt").is_some());
        assert!(pattern.matches("a/b.txt").is_none());
    }

    #[test]
    fn test_apply_wildcards() {
        let mut values = BTreeMap::new();
        values.insert("sample".to_string(), "A1".to_string());
        assert_eq!(
            apply_wildcards("reads/{sample,\\w+}.fq", &values).unwrap(),
            "reads/A1.fq"
        );
        assert!(apply_wildcards("{lane}.fq", &values).is_err());
    }

    #[test]
    fn test_strip_constraints() {
        assert_eq!(strip_constraints("{a,\\d+}/{b}"), "{a}/{b}");
    }
}
