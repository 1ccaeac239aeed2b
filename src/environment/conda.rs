//! Conda/Micromamba Environment Management
//!
//! Rules name their software environment either by a YAML environment
//! file (relative to the rule's definition file) or by the name of an
//! existing environment. File-based environments are created under the
//! conda prefix in a directory named after a hash of the file, so an
//! edited environment file yields a fresh environment.
//!
//! # Binary Resolution Priority
//!
//! The micromamba binary is resolved in the following order:
//! 1. `RULERUNNER_MICROMAMBA` environment variable
//! 2. Next to the rulerunner executable
//! 3. System PATH: falls back to `micromamba`

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, info};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Lazily-initialized path to the micromamba binary.
pub static MICROMAMBA_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("RULERUNNER_MICROMAMBA") {
        return PathBuf::from(path);
    }

    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("micromamba")))
        .filter(|path| path.exists());
    if let Some(path) = bundled {
        info!("Using bundled micromamba: {}", path.display());
        return path;
    }

    PathBuf::from("micromamba")
});

/// Directory name prefix of environments created inside containers.
const CONTAINER_ENV_ROOT: &str = "/conda-envs";

/// Creates a Command with the given root prefix.
fn micromamba_command(prefix: &Path) -> Command {
    let mut cmd = Command::new(&*MICROMAMBA_PATH);
    cmd.env("MAMBA_ROOT_PREFIX", prefix);
    cmd
}

/// Software environment of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CondaEnv {
    /// Environment definition file
    File(PathBuf),
    /// Pre-existing environment, referenced by name
    Named(String),
}

impl CondaEnv {
    /// Interprets a `conda` directive; `.yaml`/`.yml` values are files.
    pub fn parse(spec: &str, basedir: Option<&Path>) -> Self {
        if spec.ends_with(".yaml") || spec.ends_with(".yml") {
            let path = Path::new(spec);
            match basedir {
                Some(base) if path.is_relative() => Self::File(base.join(path)),
                _ => Self::File(path.to_path_buf()),
            }
        } else {
            Self::Named(spec.to_string())
        }
    }

    /// Content hash of a file-based environment.
    pub fn hash(&self) -> Result<String> {
        let mut hasher = DefaultHasher::new();
        match self {
            Self::File(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    Error::workflow(format!(
                        "Failed to read conda environment file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                content.hash(&mut hasher);
            }
            Self::Named(name) => name.hash(&mut hasher),
        }
        Ok(format!("{:016x}", hasher.finish()))
    }

    /// Directory a file-based environment is created in.
    pub fn address(&self, prefix: &Path) -> Result<Option<PathBuf>> {
        match self {
            Self::File(_) => Ok(Some(prefix.join(self.hash()?))),
            Self::Named(_) => Ok(None),
        }
    }

    /// Creates the environment unless it already exists.
    pub fn create(&self, prefix: &Path, dryrun: bool) -> Result<()> {
        match self {
            Self::Named(name) => {
                if dryrun || check_env(name, prefix)? {
                    debug!("Using existing environment '{}'", name);
                    return Ok(());
                }
                Err(Error::workflow(format!(
                    "Conda environment '{}' does not exist",
                    name
                )))
            }
            Self::File(path) => {
                let Some(address) = self.address(prefix)? else {
                    return Ok(());
                };
                if address.exists() {
                    debug!("Environment for {} already exists", path.display());
                    return Ok(());
                }
                if dryrun {
                    info!("Would create conda environment {}", path.display());
                    return Ok(());
                }

                info!(
                    "Creating conda environment {} in {}",
                    path.display(),
                    address.display()
                );
                fs::create_dir_all(prefix)?;
                let output = micromamba_command(prefix)
                    .arg("create")
                    .arg("-y")
                    .arg("-p")
                    .arg(&address)
                    .arg("-f")
                    .arg(path)
                    .output()?;

                if output.status.success() {
                    info!("Successfully created environment for {}", path.display());
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!("Failed to create environment {}: {}", path.display(), stderr);
                    let _ = fs::remove_dir_all(&address);
                    Err(Error::workflow(format!(
                        "Failed to create conda environment {}",
                        path.display()
                    )))
                }
            }
        }
    }

    /// Command running `program` inside the environment.
    pub fn run_command(&self, prefix: &Path, program: &str) -> Result<Command> {
        let mut cmd = micromamba_command(prefix);
        cmd.arg("run");
        match self {
            Self::Named(name) => {
                cmd.arg("-n").arg(name);
            }
            Self::File(_) => {
                if let Some(address) = self.address(prefix)? {
                    cmd.arg("-p").arg(address);
                }
            }
        }
        cmd.arg(program);
        Ok(cmd)
    }
}

impl fmt::Display for CondaEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Checks whether a named micromamba environment exists.
fn check_env(env_name: &str, prefix: &Path) -> Result<bool> {
    let output = micromamba_command(prefix).arg("env").arg("list").output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Failed to list environments: {}", stderr);
        return Err(Error::workflow("Failed to list micromamba environments"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let exists = stdout.lines().any(|line| {
        matches!(line.split_whitespace().next(), Some(name) if name == env_name)
    });

    Ok(exists)
}

/// Dockerfile installing every file-based environment at a fixed location.
///
/// Paths in `COPY` lines are given relative to `workdir` where possible.
pub fn containerfile(envs: &[CondaEnv], workdir: &Path) -> Result<String> {
    if !envs.iter().any(|env| matches!(env, CondaEnv::File(_))) {
        return Err(Error::workflow(
            "Containerization requires at least one rule with a conda environment file",
        ));
    }

    let mut lines = vec![
        "FROM condaforge/mambaforge:latest".to_string(),
        "LABEL io.github.rulerunner.containerized=\"true\"".to_string(),
        String::new(),
        "# Step 1: Retrieve conda environments".to_string(),
    ];
    let mut creates = Vec::new();
    for env in envs {
        let CondaEnv::File(path) = env else {
            continue;
        };
        let hash = env.hash()?;
        let target = format!("{}/{}", CONTAINER_ENV_ROOT, hash);
        let source = path.strip_prefix(workdir).unwrap_or(path);
        lines.push(String::new());
        lines.push("# Conda environment:".to_string());
        lines.push(format!("#   source: {}", source.display()));
        lines.push(format!("#   prefix: {}", target));
        lines.push(format!("RUN mkdir -p {}", target));
        lines.push(format!("COPY {} {}/environment.yaml", source.display(), target));
        creates.push(format!(
            "mamba env create --prefix {} --file {}/environment.yaml",
            target, target
        ));
    }
    lines.push(String::new());
    lines.push("# Step 2: Generate conda environments".to_string());
    lines.push(String::new());
    lines.push(format!(
        "RUN {} && \\\n    mamba clean --all -y",
        creates.join(" && \\\n    ")
    ));
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_file_and_named() {
        let base = Path::new("/pipelines/rna");
        assert_eq!(
            CondaEnv::parse("envs/align.yaml", Some(base)),
            CondaEnv::File(PathBuf::from("/pipelines/rna/envs/align.yaml"))
        );
        assert_eq!(
            CondaEnv::parse("/abs/env.yml", Some(base)),
            CondaEnv::File(PathBuf::from("/abs/env.yml"))
        );
        assert_eq!(
            CondaEnv::parse("alignment_env", Some(base)),
            CondaEnv::Named("alignment_env".to_string())
        );
    }

    #[test]
    fn test_hash_follows_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.yaml");
        fs::write(&path, "dependencies:\n  - samtools\n").unwrap();
        let env = CondaEnv::File(path.clone());
        let first = env.hash().unwrap();
        assert_eq!(first, env.hash().unwrap());

        fs::write(&path, "dependencies:\n  - samtools=1.17\n").unwrap();
        assert_ne!(first, env.hash().unwrap());
    }

    #[test]
    fn test_address_only_for_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.yaml");
        fs::write(&path, "dependencies: []\n").unwrap();

        let prefix = dir.path().join("conda");
        let address = CondaEnv::File(path).address(&prefix).unwrap().unwrap();
        assert!(address.starts_with(&prefix));
        assert!(CondaEnv::Named("x".into()).address(&prefix).unwrap().is_none());
    }

    #[test]
    fn test_missing_file_fails_hash() {
        let env = CondaEnv::File(PathBuf::from("/nonexistent/env.yaml"));
        assert!(env.hash().is_err());
    }

    #[test]
    fn test_containerfile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("envs").join("align.yaml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "dependencies: [bwa]\n").unwrap();

        let envs = vec![CondaEnv::File(path), CondaEnv::Named("base".into())];
        let text = containerfile(&envs, dir.path()).unwrap();
        assert!(text.starts_with("FROM condaforge/mambaforge"));
        assert!(text.contains("COPY envs/align.yaml /conda-envs/"));
        assert!(text.contains("mamba env create --prefix /conda-envs/"));
    }

    #[test]
    fn test_containerfile_without_env_files_fails() {
        let envs = vec![CondaEnv::Named("base".into())];
        assert!(containerfile(&envs, Path::new("/tmp")).is_err());
    }

    #[test]
    fn test_create_file_env_dryrun_does_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.yaml");
        fs::write(&path, "dependencies: []\n").unwrap();
        let prefix = dir.path().join("conda");

        CondaEnv::File(path).create(&prefix, true).unwrap();
        assert!(!prefix.exists());
    }
}
