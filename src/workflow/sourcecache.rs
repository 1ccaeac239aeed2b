//! Source File Resolution
//!
//! Definition files, scripts and notebooks are referenced relative to the
//! file that mentions them. Each distinct reference is resolved to a
//! local path once and remembered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct SourceCache {
    resolved: HashMap<(Option<PathBuf>, String), PathBuf>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `reference` against `basedir` (the including file's directory).
    pub fn resolve(&mut self, reference: &str, basedir: Option<&Path>) -> Result<PathBuf> {
        let key = (basedir.map(Path::to_path_buf), reference.to_string());
        if let Some(path) = self.resolved.get(&key) {
            return Ok(path.clone());
        }

        if is_remote(reference) {
            return Err(Error::workflow(format!(
                "Remote source '{}' cannot be retrieved; only local files are supported",
                reference
            )));
        }

        let candidate = Path::new(reference);
        let joined = match basedir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        };
        let path = joined.canonicalize().map_err(|e| {
            Error::workflow(format!("Source file '{}' not found: {}", joined.display(), e))
        })?;

        debug!("Resolved source '{}' to {}", reference, path.display());
        self.resolved.insert(key, path.clone());
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

pub fn is_remote(reference: &str) -> bool {
    ["http://", "https://", "ftp://", "git+", "gh:", "gl:"]
        .iter()
        .any(|scheme| reference.starts_with(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_relative_to_basedir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("rules.yaml"), "rules: []").unwrap();

        let mut cache = SourceCache::new();
        let path = cache.resolve("rules.yaml", Some(temp.path())).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("rules.yaml"));
    }

    #[test]
    fn test_resolve_is_cached() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.yaml");
        fs::write(&file, "").unwrap();

        let mut cache = SourceCache::new();
        let first = cache.resolve("a.yaml", Some(temp.path())).unwrap();
        fs::remove_file(&file).unwrap();
        let second = cache.resolve("a.yaml", Some(temp.path())).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_and_remote_sources_fail() {
        let temp = TempDir::new().unwrap();
        let mut cache = SourceCache::new();
        assert!(cache.resolve("nope.yaml", Some(temp.path())).is_err());
        assert!(cache.resolve("https://example.org/x.yaml", None).is_err());
    }
}
