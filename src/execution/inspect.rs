//! Read-Only Reports and Workdir Maintenance
//!
//! Renderings of a [`FileDag`] (graphviz, JSON), summaries, provenance
//! change listings and the file-level maintenance actions (archive,
//! clean, environment provisioning) that run instead of a scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde_json::json;

use crate::environment::{container, containerfile, CondaEnv};
use crate::error::{Error, Result};
use crate::workflow::state::{Persistence, STATE_DIR};

use super::dag::{ChangeKind, Job};
use super::graph::FileDag;

const DOT_HEADER: &str = "    graph[bgcolor=white, margin=0];\n    \
                          node[shape=box, style=rounded, fontname=sans, fontsize=10, penwidth=2];\n    \
                          edge[penwidth=2, color=grey];";

/// Order-insensitive comparison of two file lists.
fn same_files(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

impl FileDag {
    pub(super) fn job_stats(&self) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for job in self.jobs.iter().filter(|job| job.needrun) {
            *counts.entry(job.rule.as_str()).or_default() += 1;
        }
        let total: usize = counts.values().sum();
        let width = counts.keys().map(|r| r.len()).max().unwrap_or(0).max(5);

        let mut lines = vec![
            "Job stats:".to_string(),
            format!("{:<width$}  {:>5}", "job", "count"),
            format!("{}  {}", "-".repeat(width), "-".repeat(5)),
        ];
        for (rule, count) in &counts {
            lines.push(format!("{:<width$}  {:>5}", rule, count));
        }
        lines.push(format!("{:<width$}  {:>5}", "total", total));
        lines.join("\n")
    }

    /// Distinct rule names in job order, used for node colors.
    fn rule_colors(&self) -> BTreeMap<&str, String> {
        let mut names: Vec<&str> = Vec::new();
        for job in &self.jobs {
            if !names.contains(&job.rule.as_str()) {
                names.push(&job.rule);
            }
        }
        let n = names.len().max(1) as f64;
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, format!("{:.2} 0.6 0.85", i as f64 / n)))
            .collect()
    }

    fn digraph(&self, nodes: Vec<String>, edges: BTreeSet<(usize, usize)>) -> String {
        let mut lines = vec!["digraph rulerunner_dag {".to_string(), DOT_HEADER.to_string()];
        lines.extend(nodes);
        lines.extend(edges.into_iter().map(|(from, to)| format!("\t{} -> {}", from, to)));
        lines.push("}".to_string());
        lines.join("\n")
    }

    pub(super) fn render_dot(&self) -> String {
        let colors = self.rule_colors();
        let nodes = self
            .jobs
            .iter()
            .map(|job| {
                let mut label = job.rule.clone();
                for (name, value) in &job.wildcards {
                    label.push_str(&format!("\\n{}: {}", name, value));
                }
                let style = if job.needrun { "rounded" } else { "rounded,dashed" };
                format!(
                    "\t{}[label = \"{}\", color = \"{}\", style=\"{}\"];",
                    job.id, label, colors[job.rule.as_str()], style
                )
            })
            .collect();
        let edges = self
            .jobs
            .iter()
            .flat_map(|job| job.dependencies.iter().map(move |&dep| (dep, job.id)))
            .collect();
        self.digraph(nodes, edges)
    }

    pub(super) fn render_rule_dot(&self) -> String {
        let colors = self.rule_colors();
        let ids: BTreeMap<&str, usize> = colors.keys().enumerate().map(|(i, r)| (*r, i)).collect();
        let nodes = colors
            .iter()
            .map(|(rule, color)| {
                format!(
                    "\t{}[label = \"{}\", color = \"{}\", style=\"rounded\"];",
                    ids[rule], rule, color
                )
            })
            .collect();
        let mut edges = BTreeSet::new();
        for job in &self.jobs {
            for &dep in &job.dependencies {
                let from = ids[self.jobs[dep].rule.as_str()];
                let to = ids[job.rule.as_str()];
                if from != to {
                    edges.insert((from, to));
                }
            }
        }
        self.digraph(nodes, edges)
    }

    pub(super) fn render_filegraph_dot(&self) -> String {
        let colors = self.rule_colors();
        let nodes = self
            .jobs
            .iter()
            .map(|job| {
                let label = format!(
                    "{}\\ninput: {}\\noutput: {}",
                    job.rule,
                    job.input.join(", "),
                    job.output.join(", ")
                );
                format!(
                    "\t{}[label = \"{}\", color = \"{}\", style=\"rounded\"];",
                    job.id, label, colors[job.rule.as_str()]
                )
            })
            .collect();
        let edges = self
            .jobs
            .iter()
            .flat_map(|job| job.dependencies.iter().map(move |&dep| (dep, job.id)))
            .collect();
        self.digraph(nodes, edges)
    }

    pub(super) fn render_d3dag(&self) -> Result<String> {
        let nodes: Vec<_> = self
            .jobs
            .iter()
            .map(|job| {
                json!({
                    "id": job.id,
                    "value": {
                        "jobid": job.id,
                        "label": job.label(),
                        "rule": job.rule,
                    }
                })
            })
            .collect();
        let links: Vec<_> = self
            .jobs
            .iter()
            .flat_map(|job| {
                job.dependencies
                    .iter()
                    .map(move |&dep| json!({ "u": dep, "v": job.id }))
            })
            .collect();
        Ok(serde_json::to_string(&json!({ "nodes": nodes, "links": links }))?)
    }

    fn file_date(&self, file: &str) -> String {
        self.mtime(file)
            .map(|time| DateTime::<Local>::from(time).format("%a %b %e %H:%M:%S %Y").to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    fn output_status(&self, job: &Job, file: &str, persistence: &dyn Persistence) -> &'static str {
        if !self.exists(file) {
            return "missing";
        }
        if persistence.is_incomplete(file) {
            return "incomplete";
        }
        match persistence.metadata(file) {
            Some(record) if record.code != job.code() => "rule implementation changed",
            Some(record) if !same_files(&record.input, &job.input) => "set of input files changed",
            Some(record) if record.params != job.params_text() => "params changed",
            Some(record) if record.version != job.version => "version changed",
            _ => "ok",
        }
    }

    pub(super) fn summary_lines(&self, detailed: bool, persistence: &dyn Persistence) -> Vec<String> {
        let mut header = vec!["output_file", "date", "rule", "version", "log-file(s)", "status", "plan"];
        if detailed {
            header.extend(["input-file(s)", "shellcmd"]);
        }
        let mut lines = vec![header.join("\t")];

        for job in &self.jobs {
            for output in &job.output {
                let record = persistence.metadata(output);
                let rule = record.as_ref().map(|r| r.rule.clone()).unwrap_or_else(|| job.rule.clone());
                let version = record
                    .as_ref()
                    .and_then(|r| r.version.clone())
                    .or_else(|| job.version.clone())
                    .unwrap_or_else(|| "-".to_string());
                let log = if job.log.is_empty() { "-".to_string() } else { job.log.join(",") };
                let plan = if job.needrun { "update pending" } else { "no update" };

                let mut fields = vec![
                    output.clone(),
                    self.file_date(output),
                    rule,
                    version,
                    log,
                    self.output_status(job, output, persistence).to_string(),
                    plan.to_string(),
                ];
                if detailed {
                    fields.push(job.input.join(","));
                    fields.push(job.code());
                }
                lines.push(fields.join("\t"));
            }
        }
        lines
    }

    pub(super) fn changes(&self, kind: ChangeKind, persistence: &dyn Persistence) -> Vec<String> {
        let mut changed = BTreeSet::new();
        for job in &self.jobs {
            for output in &job.output {
                let Some(record) = persistence.metadata(output) else {
                    continue;
                };
                let differs = match kind {
                    ChangeKind::Version => record.version != job.version,
                    ChangeKind::Code => record.code != job.code(),
                    ChangeKind::Input => !same_files(&record.input, &job.input),
                    ChangeKind::Params => record.params != job.params_text(),
                };
                if differs {
                    changed.insert(output.clone());
                }
            }
        }
        changed.into_iter().collect()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.workdir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// Every file the workflow knows about, relative to the workdir.
    fn tracked_files(&self) -> BTreeSet<String> {
        let mut tracked: BTreeSet<String> = self.sources.iter().map(|p| self.relative(p)).collect();
        for job in &self.jobs {
            tracked.extend(job.input.iter().cloned());
            tracked.extend(job.output.iter().cloned());
            tracked.extend(job.log.iter().cloned());
            tracked.extend(job.benchmark.iter().cloned());
        }
        for env in self.conda_envs() {
            if let CondaEnv::File(path) = env {
                tracked.insert(self.relative(&path));
            }
        }
        tracked
    }

    pub(super) fn list_untracked(&self) -> Result<Vec<String>> {
        let tracked = self.tracked_files();
        let mut untracked = Vec::new();
        let mut stack = vec![self.workdir.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let relative = self.relative(&path);
                if relative == STATE_DIR {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else if !tracked.contains(&relative) {
                    untracked.push(relative);
                }
            }
        }
        untracked.sort();
        Ok(untracked)
    }

    pub(super) fn write_archive(&self, path: &Path) -> Result<()> {
        let name = path.to_string_lossy();
        let compress = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            true
        } else if name.ends_with(".tar") {
            false
        } else {
            return Err(Error::workflow(
                "Unsupported archive format (use .tar or .tar.gz)",
            ));
        };

        let mut files: BTreeSet<String> = self.sources.iter().map(|p| self.relative(p)).collect();
        for job in &self.jobs {
            files.extend(
                job.input
                    .iter()
                    .filter(|input| !self.producers.contains_key(*input))
                    .cloned(),
            );
        }
        for env in self.conda_envs() {
            if let CondaEnv::File(env_path) = env {
                files.insert(self.relative(&env_path));
            }
        }

        let missing: Vec<&String> = files.iter().filter(|f| !self.path(f).exists()).collect();
        if let Some(first) = missing.first() {
            return Err(Error::workflow(format!(
                "Cannot archive {}: file does not exist",
                first
            )));
        }

        let out = File::create(path)?;
        if compress {
            let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
            self.append_files(&mut builder, &files)?;
            builder.into_inner()?.finish()?;
        } else {
            let mut builder = tar::Builder::new(out);
            self.append_files(&mut builder, &files)?;
            builder.into_inner()?.flush()?;
        }
        info!("Archived {} files to {}", files.len(), path.display());
        Ok(())
    }

    fn append_files<W: Write>(&self, builder: &mut tar::Builder<W>, files: &BTreeSet<String>) -> Result<()> {
        for file in files {
            let source = self.path(file);
            let name = Path::new(file);
            if name.is_absolute() {
                warn!("Skipping {} in archive: outside of the working directory", file);
                continue;
            }
            builder.append_path_with_name(&source, name)?;
        }
        builder.finish()?;
        Ok(())
    }

    pub(super) fn delete_outputs(&self, only_temp: bool, dryrun: bool) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for job in &self.jobs {
            let files = if only_temp { &job.temp_output } else { &job.output };
            for file in files {
                let path = self.path(file);
                if !path.exists() {
                    continue;
                }
                if dryrun {
                    println!("Would delete {}", file);
                } else {
                    info!("Deleting {}", file);
                    if path.is_dir() {
                        fs::remove_dir_all(&path)?;
                    } else {
                        fs::remove_file(&path)?;
                    }
                }
                deleted.push(file.clone());
            }
        }
        if !dryrun {
            self.remove_empty_dirs();
        }
        Ok(deleted)
    }

    fn conda_envs(&self) -> Vec<CondaEnv> {
        let envs: BTreeSet<&String> = self.jobs.iter().filter_map(|job| job.conda_env.as_ref()).collect();
        envs.into_iter().map(|spec| CondaEnv::parse(spec, None)).collect()
    }

    pub(super) fn container_definition(&self) -> Result<String> {
        containerfile(&self.conda_envs(), &self.workdir)
    }

    pub(super) fn pull_images(&self, dryrun: bool, prefix: &Path) -> Result<()> {
        let images: BTreeSet<&String> = self
            .jobs
            .iter()
            .filter(|job| job.needrun)
            .filter_map(|job| job.container.as_ref())
            .collect();
        for image in images {
            container::pull(image, prefix, dryrun)?;
        }
        Ok(())
    }

    pub(super) fn create_envs(&self, dryrun: bool, prefix: &Path) -> Result<()> {
        for env in self.conda_envs() {
            env.create(prefix, dryrun)?;
        }
        Ok(())
    }

    pub(super) fn env_table(&self, prefix: &Path) -> Result<Vec<(String, String, PathBuf)>> {
        let mut rows = BTreeSet::new();
        for job in &self.jobs {
            let Some(spec) = &job.conda_env else {
                continue;
            };
            let env = CondaEnv::parse(spec, None);
            if let (CondaEnv::File(path), Some(address)) = (&env, env.address(prefix)?) {
                let image = job.container.clone().unwrap_or_default();
                rows.insert((path.display().to_string(), image, address));
            }
        }
        Ok(rows.into_iter().collect())
    }

    pub(super) fn env_addresses(&self, prefix: &Path) -> Result<BTreeSet<PathBuf>> {
        let mut addresses = BTreeSet::new();
        for env in self.conda_envs() {
            if let Some(address) = env.address(prefix)? {
                addresses.insert(address);
            }
        }
        Ok(addresses)
    }

    pub(super) fn image_paths(&self, prefix: &Path) -> BTreeSet<PathBuf> {
        self.jobs
            .iter()
            .filter_map(|job| job.container.as_ref())
            .map(|url| container::image_path(url, prefix))
            .collect()
    }

    /// Removes output directories that ended up empty.
    pub(super) fn remove_empty_dirs(&self) {
        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for job in &self.jobs {
            for file in job.output.iter().chain(job.temp_output.iter()) {
                let mut parent = Path::new(file).parent();
                while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
                    dirs.insert(dir.to_path_buf());
                    parent = dir.parent();
                }
            }
        }
        // Deepest first
        let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            let path = self.workdir.join(&dir);
            let is_empty = fs::read_dir(&path).map(|mut e| e.next().is_none()).unwrap_or(false);
            if is_empty && fs::remove_dir(&path).is_ok() {
                info!("Removed empty directory {}", dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::execution::dag::{ChangeKind, Dag, DagBuilder, TargetSets};
    use crate::execution::graph::FileDagBuilder;
    use crate::workflow::rule::ExecMethod;
    use crate::workflow::ruleinfo::{ContainerDirective, Directive, InOutput};
    use crate::workflow::state::{OutputRecord, Persistence, StateStore};
    use crate::workflow::Registry;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> Registry {
        let mut registry = Registry::default();
        for (name, input, output) in [("a", vec![], vec!["x.txt"]), ("b", vec!["x.txt"], vec!["out/y.txt"])] {
            let mut handle = registry.register(Some(name), false).unwrap();
            registry
                .apply_directive(&mut handle, Directive::Input(InOutput::from_patterns(input)))
                .unwrap();
            registry
                .apply_directive(&mut handle, Directive::Output(InOutput::from_patterns(output)))
                .unwrap();
            registry
                .apply_directive(&mut handle, Directive::Exec(ExecMethod::Shell("touch {output}".into())))
                .unwrap();
            registry.finalize(handle).unwrap();
        }
        registry
    }

    fn dag(dir: &TempDir) -> Box<dyn Dag> {
        let targets = TargetSets {
            targetfiles: ["out/y.txt".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut dag = FileDagBuilder.build(&registry(), &targets, dir.path()).unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        dag.init(&store).unwrap();
        dag
    }

    #[test]
    fn test_dot_renderings() {
        let dir = TempDir::new().unwrap();
        let dag = dag(&dir);

        let dot = dag.dot();
        assert!(dot.starts_with("digraph rulerunner_dag {"));
        assert!(dot.contains("\t0 -> 1"));
        assert!(dot.contains("label = \"a\""));

        let rules = dag.rule_dot();
        assert!(rules.contains("\t0 -> 1"));

        let files = dag.filegraph_dot();
        assert!(files.contains("output: out/y.txt"));
    }

    #[test]
    fn test_d3dag_is_json() {
        let dir = TempDir::new().unwrap();
        let dag = dag(&dir);
        let value: serde_json::Value = serde_json::from_str(&dag.d3dag().unwrap()).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(value["links"][0]["u"], 0);
        assert_eq!(value["links"][0]["v"], 1);
    }

    #[test]
    fn test_stats_counts_rules() {
        let dir = TempDir::new().unwrap();
        let stats = dag(&dir).stats();
        assert!(stats.starts_with("Job stats:"));
        assert!(stats.lines().last().unwrap().starts_with("total"));
        assert!(stats.lines().last().unwrap().ends_with('2'));
    }

    #[test]
    fn test_summary_and_changes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        let dag = dag(&dir);
        let mut store = StateStore::open(dir.path()).unwrap();
        store
            .record(
                "x.txt",
                &OutputRecord {
                    rule: "a".to_string(),
                    version: None,
                    code: "echo old".to_string(),
                    params: String::new(),
                    input: Vec::new(),
                    software_env: None,
                    log: Vec::new(),
                    starttime: Utc::now(),
                    endtime: Utc::now(),
                },
            )
            .unwrap();

        let summary = dag.summary(false, &store);
        assert!(summary[0].starts_with("output_file\tdate\trule"));
        assert!(summary.iter().any(|l| l.starts_with("x.txt") && l.contains("rule implementation changed")));
        assert!(summary.iter().any(|l| l.starts_with("out/y.txt") && l.contains("missing")));

        let detailed = dag.summary(true, &store);
        assert!(detailed[0].ends_with("input-file(s)\tshellcmd"));

        assert_eq!(dag.changed_files(ChangeKind::Code, &store), vec!["x.txt"]);
        assert!(dag.changed_files(ChangeKind::Params, &store).is_empty());
    }

    #[test]
    fn test_untracked_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        fs::write(dir.path().join("notes.md"), "n").unwrap();
        let dag = dag(&dir);
        assert_eq!(dag.untracked_files().unwrap(), vec!["notes.md"]);
    }

    #[test]
    fn test_clean_outputs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/y.txt"), "y").unwrap();
        let dag = dag(&dir);

        let listed = dag.clean(false, true).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(dir.path().join("x.txt").exists());

        let deleted: BTreeSet<String> = dag.clean(false, false).unwrap().into_iter().collect();
        assert!(deleted.contains("out/y.txt"));
        assert!(!dir.path().join("x.txt").exists());
        assert!(!dir.path().join("out").exists());

        assert!(dag.clean(true, false).unwrap().is_empty());
    }

    #[test]
    fn test_software_environments_in_use() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join("env.yaml");
        fs::write(&env_file, "dependencies:\n  - samtools\n").unwrap();

        let mut registry = Registry::default();
        let mut handle = registry.register(Some("sort"), false).unwrap();
        for directive in [
            Directive::Output(InOutput::from_patterns(["sorted.bam"])),
            Directive::Conda(env_file.display().to_string()),
            Directive::Container(ContainerDirective::Image {
                url: "docker://ubuntu".to_string(),
                containerized: false,
            }),
            Directive::Exec(ExecMethod::Shell("touch {output}".into())),
        ] {
            registry.apply_directive(&mut handle, directive).unwrap();
        }
        registry.finalize(handle).unwrap();

        let targets = TargetSets {
            targetfiles: ["sorted.bam".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let dag = FileDagBuilder.build(&registry, &targets, dir.path()).unwrap();
        let prefix = dir.path().join("envs");

        let listing = dag.conda_env_listing(&prefix).unwrap();
        assert_eq!(listing.len(), 1);
        let (file, image, address) = &listing[0];
        assert_eq!(file, &env_file.display().to_string());
        assert_eq!(image, "docker://ubuntu");
        assert!(address.starts_with(&prefix));

        let addresses = dag.conda_env_addresses(&prefix).unwrap();
        assert!(addresses.contains(address));

        let images = dag.container_images(&dir.path().join("images"));
        assert_eq!(images.len(), 1);
        assert!(images.iter().all(|p| p.extension().and_then(|e| e.to_str()) == Some("simg")));
    }

    #[test]
    fn test_archive_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let dag = dag(&dir);
        assert!(dag.archive(&dir.path().join("wf.zip")).is_err());
    }

    #[test]
    fn test_archive_tar_gz() {
        let dir = TempDir::new().unwrap();
        let dag = dag(&dir);
        let path = dir.path().join("wf.tar.gz");
        dag.archive(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_containerize_without_envs_fails() {
        let dir = TempDir::new().unwrap();
        assert!(dag(&dir).containerize().is_err());
    }
}
