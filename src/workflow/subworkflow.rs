//! Sub-workflows
//!
//! A sub-workflow is another workflow with its own working directory that
//! provides some of this workflow's inputs. Its files are referenced by
//! absolute path; before the parent run schedules anything, the
//! sub-workflow is run for the files the parent needs.

use std::path::{Path, PathBuf};

use super::ruleinfo::IoPath;

/// Default definition file of a workflow directory.
pub const DEFAULT_DEFINITION_FILE: &str = "workflow.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct Subworkflow {
    pub name: String,
    snakefile: Option<PathBuf>,
    workdir: Option<PathBuf>,
    pub configfile: Option<PathBuf>,
    /// Directory of the file that declared the sub-workflow
    basedir: PathBuf,
}

impl Subworkflow {
    pub fn new(
        name: impl Into<String>,
        snakefile: Option<PathBuf>,
        workdir: Option<PathBuf>,
        configfile: Option<PathBuf>,
        basedir: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            snakefile,
            workdir,
            configfile,
            basedir,
        }
    }

    pub fn workdir(&self) -> PathBuf {
        let workdir = self.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
        if workdir.is_absolute() {
            workdir
        } else {
            normalize(&self.basedir.join(workdir))
        }
    }

    pub fn snakefile(&self) -> PathBuf {
        match &self.snakefile {
            None => self.workdir().join(DEFAULT_DEFINITION_FILE),
            Some(file) if file.is_relative() => normalize(&self.basedir.join(file)),
            Some(file) => file.clone(),
        }
    }

    /// Marks `path` as provided by this sub-workflow.
    pub fn target(&self, path: &str) -> IoPath {
        let resolved = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workdir().join(path)
        };
        IoPath::from_subworkflow(&self.name, resolved.to_string_lossy())
    }

    /// Converts the requested files back to paths relative to the workdir.
    pub fn targets<'a>(&self, files: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let workdir = self.workdir();
        files
            .into_iter()
            .map(|file| match Path::new(file).strip_prefix(&workdir) {
                Ok(relative) => relative.to_string_lossy().into_owned(),
                Err(_) => file.to_string(),
            })
            .collect()
    }
}

/// Drops `.` components and folds `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> Subworkflow {
        Subworkflow::new(
            "ref",
            None,
            Some(PathBuf::from("../reference")),
            None,
            PathBuf::from("/data/project"),
        )
    }

    #[test]
    fn test_workdir_relative_to_basedir() {
        assert_eq!(sub().workdir(), PathBuf::from("/data/reference"));
        assert_eq!(
            sub().snakefile(),
            PathBuf::from("/data/reference/workflow.yaml")
        );
    }

    #[test]
    fn test_target_marks_path() {
        let target = sub().target("genome.fa");
        assert_eq!(target.pattern, "/data/reference/genome.fa");
        assert_eq!(target.subworkflow.as_deref(), Some("ref"));
    }

    #[test]
    fn test_targets_relative_to_workdir() {
        let targets = sub().targets(["/data/reference/genome.fa", "/elsewhere/x"]);
        assert_eq!(targets, vec!["genome.fa", "/elsewhere/x"]);
    }
}
