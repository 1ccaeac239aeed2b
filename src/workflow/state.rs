//! Persistent Run State
//!
//! Run state lives in `.rulerunner/` inside the working directory:
//!
//! - `locks/`: one lock record per running invocation, listing the files
//!   it reads and writes
//! - `metadata/`: one JSON record per output file (rule, code, params,
//!   inputs, timing) used to detect provenance changes between runs
//! - `incomplete/`: markers for outputs whose job has started but not
//!   finished
//! - `shadow/`: scratch directories of shadowed jobs
//!
//! The orchestrator talks to the state through the [`Persistence`]
//! trait; [`StateStore`] is the filesystem implementation.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::settings::WorkflowSettings;

/// Name of the state directory inside the working directory.
pub const STATE_DIR: &str = ".rulerunner";

/// Provenance recorded for one output file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutputRecord {
    pub rule: String,
    pub version: Option<String>,
    /// Text of the shell command, script path, etc.
    pub code: String,
    /// Rendered parameter values
    pub params: String,
    pub input: Vec<String>,
    pub software_env: Option<String>,
    pub log: Vec<String>,
    pub starttime: DateTime<Utc>,
    pub endtime: DateTime<Utc>,
}

/// Lock held by one running invocation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LockRecord {
    pub pid: u32,
    pub created: DateTime<Utc>,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
}

impl LockRecord {
    /// Two runs conflict if either writes a file the other reads or writes.
    fn conflicts_with(&self, inputs: &BTreeSet<String>, outputs: &BTreeSet<String>) -> bool {
        !self.outputs.is_disjoint(outputs)
            || !self.outputs.is_disjoint(inputs)
            || !self.inputs.is_disjoint(outputs)
    }
}

/// Persistent state collaborator of a run.
pub trait Persistence {
    /// Takes the run lock for the given files.
    fn lock(&mut self, inputs: &BTreeSet<String>, outputs: &BTreeSet<String>) -> Result<()>;

    /// Releases the lock taken by this instance, if any.
    fn unlock(&mut self) -> Result<()>;

    /// Removes every lock, including those of other (dead) runs.
    fn cleanup_locks(&mut self) -> Result<()>;

    fn is_locked(&self) -> bool;

    /// Stops serving metadata from the in-memory cache.
    fn deactivate_cache(&mut self);

    /// Removes the metadata of `path`; false if there was none.
    fn cleanup_metadata(&mut self, path: &str) -> Result<bool>;

    fn cleanup_shadow(&mut self) -> Result<()>;

    fn metadata(&self, path: &str) -> Option<OutputRecord>;

    fn record(&mut self, path: &str, record: &OutputRecord) -> Result<()>;

    fn mark_incomplete(&mut self, outputs: &[String]) -> Result<()>;

    fn clear_incomplete(&mut self, outputs: &[String]) -> Result<()>;

    fn is_incomplete(&self, path: &str) -> bool;

    /// Directory where job environments are created.
    fn conda_prefix(&self) -> PathBuf;

    /// Directory where container images are pulled to.
    fn container_prefix(&self) -> PathBuf;

    fn shadow_prefix(&self) -> PathBuf;

    /// Removes environments below the conda prefix that are not in `in_use`.
    fn conda_cleanup_envs(&mut self, in_use: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>>;

    /// Removes images below the container prefix that are not in `in_use`.
    fn cleanup_containers(&mut self, in_use: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>>;
}

/// Filesystem-backed run state.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    lock_file: Option<PathBuf>,
    cache: Mutex<HashMap<String, Option<OutputRecord>>>,
    cache_active: bool,
    conda_prefix: Option<PathBuf>,
    container_prefix: Option<PathBuf>,
}

impl StateStore {
    /// Opens (and creates) the state directory below `workdir`.
    pub fn open(workdir: &Path) -> Result<Self> {
        let root = workdir.join(STATE_DIR);
        for sub in ["locks", "metadata", "incomplete", "shadow"] {
            fs::create_dir_all(root.join(sub))?;
        }
        debug!("Opened run state at {}", root.display());
        Ok(Self {
            root,
            lock_file: None,
            cache: Mutex::new(HashMap::new()),
            cache_active: true,
            conda_prefix: None,
            container_prefix: None,
        })
    }

    pub fn with_conda_prefix(mut self, prefix: Option<PathBuf>) -> Self {
        self.conda_prefix = prefix;
        self
    }

    pub fn with_container_prefix(mut self, prefix: Option<PathBuf>) -> Self {
        self.container_prefix = prefix;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn metadata_path(&self, path: &str) -> PathBuf {
        self.root.join("metadata").join(encode_path(path))
    }

    fn incomplete_path(&self, path: &str) -> PathBuf {
        self.root.join("incomplete").join(encode_path(path))
    }

    fn read_locks(&self) -> Result<Vec<(PathBuf, LockRecord)>> {
        let mut locks = Vec::new();
        for entry in fs::read_dir(self.locks_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<LockRecord>(&content) {
                Ok(record) => locks.push((path, record)),
                Err(e) => warn!("Ignoring unreadable lock {}: {}", path.display(), e),
            }
        }
        Ok(locks)
    }

    fn read_metadata(&self, path: &str) -> Option<OutputRecord> {
        let content = fs::read_to_string(self.metadata_path(path)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn invalidate(&self, path: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(path);
        }
    }
}

impl Persistence for StateStore {
    fn lock(&mut self, inputs: &BTreeSet<String>, outputs: &BTreeSet<String>) -> Result<()> {
        for (path, record) in self.read_locks()? {
            if record.conflicts_with(inputs, outputs) {
                return Err(Error::LockConflict { path });
            }
        }

        let record = LockRecord {
            pid: std::process::id(),
            created: Utc::now(),
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        };
        let mut index = 0;
        let (lock_file, file) = loop {
            let candidate = self.locks_dir().join(format!("{}.json", index));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => break (candidate, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => index += 1,
                Err(e) => return Err(e.into()),
            }
        };
        serde_json::to_writer_pretty(file, &record)?;
        debug!("Locked working directory ({})", lock_file.display());
        self.lock_file = Some(lock_file);
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if let Some(lock_file) = self.lock_file.take() {
            if lock_file.exists() {
                fs::remove_file(&lock_file)?;
            }
            debug!("Released lock {}", lock_file.display());
        }
        Ok(())
    }

    fn cleanup_locks(&mut self) -> Result<()> {
        for entry in fs::read_dir(self.locks_dir())? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        self.lock_file = None;
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.lock_file.is_some()
    }

    fn deactivate_cache(&mut self) {
        self.cache_active = false;
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn cleanup_metadata(&mut self, path: &str) -> Result<bool> {
        self.invalidate(path);
        let file = self.metadata_path(path);
        if file.exists() {
            fs::remove_file(&file)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn cleanup_shadow(&mut self) -> Result<()> {
        let shadow = self.shadow_prefix();
        if shadow.exists() {
            info!("Removing shadow directory {}", shadow.display());
            fs::remove_dir_all(&shadow)?;
        }
        fs::create_dir_all(&shadow)?;
        Ok(())
    }

    fn metadata(&self, path: &str) -> Option<OutputRecord> {
        if !self.cache_active {
            return self.read_metadata(path);
        }
        let Ok(mut cache) = self.cache.lock() else {
            return self.read_metadata(path);
        };
        cache
            .entry(path.to_string())
            .or_insert_with(|| self.read_metadata(path))
            .clone()
    }

    fn record(&mut self, path: &str, record: &OutputRecord) -> Result<()> {
        self.invalidate(path);
        fs::write(self.metadata_path(path), serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn mark_incomplete(&mut self, outputs: &[String]) -> Result<()> {
        for output in outputs {
            fs::write(self.incomplete_path(output), output)?;
        }
        Ok(())
    }

    fn clear_incomplete(&mut self, outputs: &[String]) -> Result<()> {
        for output in outputs {
            let marker = self.incomplete_path(output);
            if marker.exists() {
                fs::remove_file(marker)?;
            }
        }
        Ok(())
    }

    fn is_incomplete(&self, path: &str) -> bool {
        self.incomplete_path(path).exists()
    }

    fn conda_prefix(&self) -> PathBuf {
        self.conda_prefix
            .clone()
            .unwrap_or_else(|| self.root.join("conda"))
    }

    fn container_prefix(&self) -> PathBuf {
        self.container_prefix
            .clone()
            .unwrap_or_else(|| self.root.join("singularity"))
    }

    fn shadow_prefix(&self) -> PathBuf {
        self.root.join("shadow")
    }

    fn conda_cleanup_envs(&mut self, in_use: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
        // Environment directories are named by a 16 digit content hash
        remove_unused(&self.conda_prefix(), in_use, |entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.len() == 16 && name.chars().all(|c| c.is_ascii_hexdigit()) && entry.path().is_dir()
        })
    }

    fn cleanup_containers(&mut self, in_use: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
        remove_unused(&self.container_prefix(), in_use, |entry| {
            entry.path().extension().and_then(|e| e.to_str()) == Some("simg")
        })
    }
}

/// Removes the entries of `dir` accepted by `managed` that are not in use.
fn remove_unused(
    dir: &Path,
    in_use: &BTreeSet<PathBuf>,
    managed: impl Fn(&fs::DirEntry) -> bool,
) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !dir.exists() {
        return Ok(removed);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !managed(&entry) || in_use.contains(&path) {
            continue;
        }
        info!("Removing {}", path.display());
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!("Failed to release lock: {}", e);
        }
    }
}

/// Opens the run state of a working directory.
pub trait PersistenceFactory: Send + Sync {
    fn open(&self, workdir: &Path, settings: &WorkflowSettings) -> Result<Box<dyn Persistence>>;
}

/// Opens a [`StateStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StateStoreFactory;

impl PersistenceFactory for StateStoreFactory {
    fn open(&self, workdir: &Path, settings: &WorkflowSettings) -> Result<Box<dyn Persistence>> {
        let store = StateStore::open(workdir)?
            .with_conda_prefix(settings.conda_prefix.clone())
            .with_container_prefix(settings.singularity_prefix.clone());
        Ok(Box::new(store))
    }
}

/// Encodes a path as a single file name.
fn encode_path(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}
