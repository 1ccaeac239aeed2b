//! File-Based Job Graph
//!
//! [`FileDagBuilder`] resolves targets backwards: a requested file is
//! matched against the output patterns of every rule, the winning rule is
//! instantiated with the matched wildcard values, and its inputs are
//! resolved the same way. Jobs are numbered in the order they are
//! completed, so a job's dependencies always have smaller ids.
//!
//! When several rules can produce a file, `ruleorder` clauses decide
//! first, then rule priority; otherwise resolution fails with
//! [`Error::AmbiguousRule`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use log::debug;

use crate::environment::conda::CondaEnv;
use crate::error::{Error, Result};
use crate::workflow::rule::{Rule, CORES};
use crate::workflow::ruleinfo::InOutput;
use crate::workflow::settings::RerunTrigger;
use crate::workflow::state::Persistence;
use crate::workflow::value::{Literal, ResolveContext, Value};
use crate::workflow::wildcards::{apply_wildcards, has_wildcards, WildcardPattern};
use crate::workflow::Registry;

use super::dag::{ChangeKind, Dag, DagBuilder, Job, RunReason, TargetSets};

/// Maximum nesting of jobs while resolving one target.
///
/// Only reached by rules whose inputs match their own output pattern with
/// ever longer wildcard values.
const MAX_DEPTH: usize = 2000;

/// Builds [`FileDag`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDagBuilder;

impl DagBuilder for FileDagBuilder {
    fn build(&self, registry: &Registry, targets: &TargetSets, workdir: &Path) -> Result<Box<dyn Dag>> {
        let mut resolution = Resolution::new(registry, targets, workdir)?;
        let target_jobs = resolution.resolve_targets()?;

        let producers = resolution
            .producers
            .iter()
            .filter_map(|(file, job)| job.map(|id| (file.clone(), id)))
            .collect();
        let mut sources: Vec<PathBuf> = registry.included().to_vec();
        sources.extend(registry.configfiles().iter().cloned());

        debug!("Resolved {} jobs", resolution.jobs.len());
        Ok(Box::new(FileDag {
            workdir: workdir.to_path_buf(),
            jobs: resolution.jobs,
            target_jobs,
            producers,
            targets: targets.clone(),
            sources,
            updated_files: BTreeSet::new(),
            iocache: Mutex::new(HashMap::new()),
            iocache_active: true,
        }))
    }
}

type JobKey = (String, BTreeMap<String, String>);

/// Backward resolution state.
struct Resolution<'a> {
    registry: &'a Registry,
    targets: &'a TargetSets,
    workdir: &'a Path,
    candidates: Vec<(&'a Rule, Vec<WildcardPattern>)>,
    jobs: Vec<Job>,
    index: HashMap<JobKey, usize>,
    producers: HashMap<String, Option<usize>>,
    in_progress: HashSet<JobKey>,
}

impl<'a> Resolution<'a> {
    fn new(registry: &'a Registry, targets: &'a TargetSets, workdir: &'a Path) -> Result<Self> {
        let mut candidates = Vec::new();
        for rule in registry.rules() {
            if let Some(allowed) = &targets.allowed_rules {
                if !allowed.contains(&rule.name) {
                    continue;
                }
            }
            let patterns = rule
                .output
                .iter()
                .map(|path| WildcardPattern::compile(&path.pattern, &rule.wildcard_constraints))
                .collect::<Result<Vec<_>>>()?;
            candidates.push((rule, patterns));
        }

        Ok(Self {
            registry,
            targets,
            workdir,
            candidates,
            jobs: Vec::new(),
            index: HashMap::new(),
            producers: HashMap::new(),
            in_progress: HashSet::new(),
        })
    }

    fn resolve_targets(&mut self) -> Result<BTreeSet<usize>> {
        let mut target_jobs = BTreeSet::new();

        for name in &self.targets.targetrules {
            let rule = self.registry.get_rule(name)?;
            if rule.has_wildcards() {
                return Err(Error::workflow_in_rule(
                    name,
                    "Target rules may not contain wildcards. Please specify concrete files \
                     or a rule without wildcards, e.g. a rule 'all' that collects every result.",
                ));
            }
            if let Some(allowed) = &self.targets.allowed_rules {
                if !allowed.contains(name) {
                    return Err(Error::workflow_in_rule(name, "rule is not in the allowed rules"));
                }
            }
            target_jobs.insert(self.job_for(rule, BTreeMap::new(), name)?);
        }

        for file in &self.targets.targetfiles {
            let file = normalize_target(file, self.workdir);
            match self.resolve_file(&file)? {
                Some(id) => {
                    target_jobs.insert(id);
                }
                None if self.workdir.join(&file).exists() => {
                    debug!("Target {} exists and has no producing rule", file);
                }
                None => return Err(Error::MissingRuleForTarget(file)),
            }
        }
        Ok(target_jobs)
    }

    /// Job producing `file`, if any rule can.
    fn resolve_file(&mut self, file: &str) -> Result<Option<usize>> {
        if let Some(producer) = self.producers.get(file) {
            return Ok(*producer);
        }

        let mut matches: Vec<(&'a Rule, BTreeMap<String, String>)> = Vec::new();
        for (rule, patterns) in &self.candidates {
            if let Some(wildcards) = patterns.iter().find_map(|p| p.matches(file)) {
                matches.push((*rule, wildcards));
            }
        }
        if matches.is_empty() {
            self.producers.insert(file.to_string(), None);
            return Ok(None);
        }

        let (rule, wildcards) = self.select(file, matches)?;
        let id = self.job_for(rule, wildcards, file)?;
        self.producers.insert(file.to_string(), Some(id));
        Ok(Some(id))
    }

    /// Picks one producer among several candidate rules.
    fn select(
        &self,
        file: &str,
        mut matches: Vec<(&'a Rule, BTreeMap<String, String>)>,
    ) -> Result<(&'a Rule, BTreeMap<String, String>)> {
        if matches.len() == 1 {
            return Ok(matches.remove(0));
        }

        let clauses = self.registry.ruleorder_clauses();
        let beats = |a: &str, b: &str| {
            clauses.iter().any(|clause| {
                let pa = clause.iter().position(|n| n == a);
                let pb = clause.iter().position(|n| n == b);
                matches!((pa, pb), (Some(pa), Some(pb)) if pa < pb)
            })
        };
        let preferred: Vec<usize> = (0..matches.len())
            .filter(|&i| {
                matches
                    .iter()
                    .enumerate()
                    .all(|(j, other)| i == j || beats(&matches[i].0.name, &other.0.name))
            })
            .collect();
        if let [winner] = preferred[..] {
            return Ok(matches.swap_remove(winner));
        }

        let top = matches
            .iter()
            .map(|(rule, _)| rule.priority)
            .fold(f64::MIN, f64::max);
        let highest: Vec<usize> = (0..matches.len())
            .filter(|&i| matches[i].0.priority == top)
            .collect();
        if let [winner] = highest[..] {
            return Ok(matches.swap_remove(winner));
        }

        Err(Error::AmbiguousRule {
            file: file.to_string(),
            rules: matches.iter().map(|(rule, _)| rule.name.clone()).collect(),
        })
    }

    fn job_for(
        &mut self,
        rule: &'a Rule,
        wildcards: BTreeMap<String, String>,
        requested: &str,
    ) -> Result<usize> {
        let key = (rule.name.clone(), wildcards);
        if let Some(&id) = self.index.get(&key) {
            return Ok(id);
        }
        if !self.in_progress.insert(key.clone()) {
            return Err(Error::CyclicDependency(requested.to_string()));
        }
        if self.in_progress.len() > MAX_DEPTH {
            return Err(Error::workflow_in_rule(
                &rule.name,
                format!(
                    "jobs nest deeper than {} levels while resolving '{}'; \
                     the rule's input may match its own output pattern",
                    MAX_DEPTH, requested
                ),
            ));
        }
        let result = self.create_job(rule, &key.1);
        self.in_progress.remove(&key);

        let mut job = result?;
        let id = self.jobs.len();
        job.id = id;
        for output in &job.output {
            self.producers.insert(output.clone(), Some(id));
        }
        self.jobs.push(job);
        self.index.insert(key, id);
        Ok(id)
    }

    fn create_job(&mut self, rule: &'a Rule, wildcards: &BTreeMap<String, String>) -> Result<Job> {
        let mut output = Vec::new();
        let mut temp_output = Vec::new();
        for path in rule.output.iter() {
            let file = apply_wildcards(&path.pattern, wildcards)?;
            if path.temp {
                temp_output.push(file.clone());
            }
            output.push(file);
        }

        let mut input = Vec::new();
        let mut subworkflow_input = BTreeMap::new();
        let mut dependencies = BTreeSet::new();
        let mut missing = Vec::new();
        for path in rule.input.iter() {
            let file = apply_wildcards(&path.pattern, wildcards)?;
            if let Some(sub) = &path.subworkflow {
                subworkflow_input.insert(file.clone(), sub.clone());
            } else if !self.targets.nodeps {
                match self.resolve_file(&file)? {
                    Some(dep) => {
                        dependencies.insert(dep);
                    }
                    None if !self.workdir.join(&file).exists() => missing.push(file.clone()),
                    None => {}
                }
            }
            input.push(file);
        }
        if !missing.is_empty() {
            return Err(Error::MissingInput {
                rule: rule.name.clone(),
                files: missing,
            });
        }

        let log = rule
            .log
            .iter()
            .map(|path| apply_wildcards(&path.pattern, wildcards))
            .collect::<Result<Vec<_>>>()?;
        let benchmark = rule
            .benchmark
            .as_ref()
            .map(|path| apply_wildcards(&path.pattern, wildcards))
            .transpose()?;

        let cores = self.registry.settings().cores();
        let ctx = ResolveContext {
            rule: &rule.name,
            wildcards: wildcards.clone(),
            input: input.clone(),
            attempt: 1,
            cores,
        };
        let mut resources: BTreeMap<String, Literal> = rule
            .resources
            .iter()
            .map(|(name, value)| (name.clone(), value.evaluate(&ctx)))
            .collect();
        let threads = match resources.get(CORES) {
            Some(Literal::Int(n)) => (*n).clamp(1, cores.max(1)),
            Some(Literal::Str(s)) => {
                return Err(Error::workflow_in_rule(
                    &rule.name,
                    format!("threads must evaluate to an integer, got '{}'", s),
                ))
            }
            None => 1,
        };
        resources.insert(CORES.to_string(), Literal::Int(threads));

        let mut params = BTreeMap::new();
        for (i, value) in rule.params.positional.iter().enumerate() {
            params.insert(i.to_string(), render_param(value, &ctx));
        }
        for (name, value) in &rule.params.named {
            params.insert(name.clone(), render_param(value, &ctx));
        }

        let conda_env = rule
            .environment
            .conda
            .as_ref()
            .map(|spec| {
                let spec = apply_wildcards(spec, wildcards)?;
                Ok::<_, Error>(CondaEnv::parse(&spec, rule.basedir.as_deref()).to_string())
            })
            .transpose()?;

        Ok(Job {
            id: 0,
            rule: rule.name.clone(),
            wildcards: wildcards.clone(),
            input,
            output,
            named_input: named_positions(&rule.input),
            named_output: named_positions(&rule.output),
            log,
            benchmark,
            temp_output,
            subworkflow_input,
            params,
            resources,
            threads,
            priority: rule.priority,
            restart_times: rule.restart_times,
            shadow: rule.shadow,
            exec: rule.exec.clone(),
            conda_env,
            container: rule.environment.container.clone(),
            env_modules: rule.environment.env_modules.clone(),
            message: rule.message.clone(),
            version: rule.version.clone(),
            group: rule.group.clone(),
            is_checkpoint: rule.is_checkpoint,
            is_local: self.registry.is_local(rule),
            basedir: rule.basedir.clone(),
            dependencies,
            needrun: false,
            reason: RunReason::default(),
        })
    }
}

fn named_positions(io: &InOutput) -> BTreeMap<String, usize> {
    io.named
        .keys()
        .enumerate()
        .map(|(i, name)| (name.clone(), io.paths.len() + i))
        .collect()
}

fn render_param(value: &Value, ctx: &ResolveContext<'_>) -> String {
    match value {
        Value::Resolver(resolver) => resolver.call(ctx).to_string(),
        other => other.render(),
    }
}

/// Makes a target relative to the working directory where possible.
fn normalize_target(file: &str, workdir: &Path) -> String {
    let path = Path::new(file);
    let relative = path.strip_prefix(workdir).unwrap_or(path);
    let text = relative.to_string_lossy();
    text.strip_prefix("./").unwrap_or(&text).to_string()
}

/// Job graph over files in one working directory.
pub struct FileDag {
    pub(super) workdir: PathBuf,
    pub(super) jobs: Vec<Job>,
    pub(super) target_jobs: BTreeSet<usize>,
    /// Output file to producing job
    pub(super) producers: HashMap<String, usize>,
    targets: TargetSets,
    /// Definition and config files of the workflow
    pub(super) sources: Vec<PathBuf>,
    updated_files: BTreeSet<String>,
    iocache: Mutex<HashMap<String, Option<SystemTime>>>,
    iocache_active: bool,
}

impl FileDag {
    pub(super) fn path(&self, file: &str) -> PathBuf {
        self.workdir.join(file)
    }

    pub(super) fn exists(&self, file: &str) -> bool {
        self.mtime(file).is_some()
    }

    /// Modification time, cached while the io cache is active.
    pub(super) fn mtime(&self, file: &str) -> Option<SystemTime> {
        let lookup = || {
            std::fs::metadata(self.path(file))
                .and_then(|meta| meta.modified())
                .ok()
        };
        if !self.iocache_active {
            return lookup();
        }
        match self.iocache.lock() {
            Ok(mut cache) => *cache.entry(file.to_string()).or_insert_with(lookup),
            Err(_) => lookup(),
        }
    }

    /// Jobs consuming each job's outputs.
    pub(super) fn dependents(&self) -> Vec<BTreeSet<usize>> {
        let mut dependents = vec![BTreeSet::new(); self.jobs.len()];
        for job in &self.jobs {
            for &dep in &job.dependencies {
                dependents[dep].insert(job.id);
            }
        }
        dependents
    }

    fn matches_sets(&self, job: &Job, rules: &BTreeSet<String>, files: &BTreeSet<String>) -> bool {
        rules.contains(&job.rule) || job.output.iter().any(|o| files.contains(o))
    }

    /// Reason for a job to run, ignoring missing temp outputs.
    fn stale_reason(&self, job: &Job, persistence: &dyn Persistence) -> (RunReason, bool) {
        let targets = &self.targets;
        let triggers = &targets.rerun_triggers;
        let mut reason = RunReason {
            forced: targets.forceall
                || self.matches_sets(job, &targets.forcerules, &targets.forcefiles)
                || (targets.forcetargets && self.target_jobs.contains(&job.id)),
            no_output: job.output.is_empty(),
            ..RunReason::default()
        };

        let mut only_temp_missing = false;
        for output in &job.output {
            if !self.exists(output) {
                if job.temp_output.contains(output) {
                    only_temp_missing = true;
                } else {
                    reason.missing_output.push(output.clone());
                }
            } else if !targets.ignore_incomplete && persistence.is_incomplete(output) {
                reason.incomplete_output.push(output.clone());
            }
        }
        if !reason.missing_output.is_empty() {
            only_temp_missing = false;
        }

        reason.updated_by_job = job.dependencies.iter().any(|&d| self.jobs[d].needrun);
        reason.updated_input = job
            .input
            .iter()
            .filter(|input| self.updated_files.contains(*input))
            .cloned()
            .collect();

        let all_outputs_exist = !job.output.is_empty() && job.output.iter().all(|o| self.exists(o));
        if all_outputs_exist && triggers.contains(&RerunTrigger::Mtime) {
            let oldest = job.output.iter().filter_map(|o| self.mtime(o)).min();
            if let Some(oldest) = oldest {
                for input in &job.input {
                    if self.mtime(input).is_some_and(|t| t > oldest)
                        && !reason.updated_input.contains(input)
                    {
                        reason.updated_input.push(input.clone());
                    }
                }
            }
        }

        if all_outputs_exist {
            let inputs: BTreeSet<&String> = job.input.iter().collect();
            for output in &job.output {
                let Some(record) = persistence.metadata(output) else {
                    continue;
                };
                if triggers.contains(&RerunTrigger::Code) && record.code != job.code() {
                    reason.code_changed = true;
                }
                if triggers.contains(&RerunTrigger::Params) && record.params != job.params_text() {
                    reason.params_changed = true;
                }
                if triggers.contains(&RerunTrigger::Input)
                    && record.input.iter().collect::<BTreeSet<_>>() != inputs
                {
                    reason.input_changed = true;
                }
                if triggers.contains(&RerunTrigger::Software) && record.software_env != job.software_env() {
                    reason.software_changed = true;
                }
            }
        }
        (reason, only_temp_missing)
    }

    fn compute_needrun(&mut self, persistence: &dyn Persistence) {
        let mut temp_only = BTreeSet::new();
        for id in 0..self.jobs.len() {
            let (reason, only_temp_missing) = self.stale_reason(&self.jobs[id], persistence);
            let job = &mut self.jobs[id];
            job.needrun = reason.is_set();
            job.reason = reason;
            if !job.needrun && only_temp_missing {
                temp_only.insert(id);
            }
        }

        // Missing temp files only matter if a consumer runs
        let dependents = self.dependents();
        for id in temp_only.iter().rev().copied() {
            let consumer_runs = dependents[id].iter().any(|&d| self.jobs[d].needrun);
            if consumer_runs || self.target_jobs.contains(&id) {
                let job = &mut self.jobs[id];
                job.needrun = true;
                job.reason.missing_output = job.temp_output.clone();
            }
        }

        let targets = &self.targets;
        if !targets.omitrules.is_empty() || !targets.omitfiles.is_empty() {
            let seeds: Vec<usize> = self
                .jobs
                .iter()
                .filter(|job| self.matches_sets(job, &targets.omitrules, &targets.omitfiles))
                .map(|job| job.id)
                .collect();
            for id in closure(&seeds, |id| dependents[id].iter().copied().collect()) {
                self.jobs[id].needrun = false;
            }
        }
        if !targets.untilrules.is_empty() || !targets.untilfiles.is_empty() {
            let seeds: Vec<usize> = self
                .jobs
                .iter()
                .filter(|job| self.matches_sets(job, &targets.untilrules, &targets.untilfiles))
                .map(|job| job.id)
                .collect();
            let allowed = closure(&seeds, |id| self.jobs[id].dependencies.iter().copied().collect());
            for job in &mut self.jobs {
                if !allowed.contains(&job.id) {
                    job.needrun = false;
                }
            }
        }
        if !targets.priorityrules.is_empty() || !targets.priorityfiles.is_empty() {
            let seeds: Vec<usize> = self
                .jobs
                .iter()
                .filter(|job| self.matches_sets(job, &targets.priorityrules, &targets.priorityfiles))
                .map(|job| job.id)
                .collect();
            for id in closure(&seeds, |id| self.jobs[id].dependencies.iter().copied().collect()) {
                self.jobs[id].priority = f64::MAX;
            }
        }
    }
}

/// Seeds plus everything reachable through `next`.
fn closure(seeds: &[usize], next: impl Fn(usize) -> Vec<usize>) -> BTreeSet<usize> {
    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut stack: Vec<usize> = seeds.to_vec();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(next(id));
        }
    }
    seen
}

impl Dag for FileDag {
    fn lock_files(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let inputs = self.jobs.iter().flat_map(|j| j.input.iter().cloned()).collect();
        let outputs = self.jobs.iter().flat_map(|j| j.output.iter().cloned()).collect();
        (inputs, outputs)
    }

    fn init(&mut self, persistence: &dyn Persistence) -> Result<()> {
        self.compute_needrun(persistence);
        for job in self.jobs.iter().filter(|job| job.needrun) {
            debug!("Job {} ({}) needs to run: {}", job.id, job.label(), job.reason);
        }
        Ok(())
    }

    fn update_checkpoint_dependencies(&mut self) -> Result<()> {
        for job in self.jobs.iter().filter(|job| job.is_checkpoint) {
            if job.needrun {
                debug!("Checkpoint {} is pending", job.label());
            } else {
                debug!("Checkpoint {} is complete", job.label());
            }
        }
        Ok(())
    }

    fn check_dynamic(&self) -> Result<()> {
        for job in &self.jobs {
            if let Some(output) = job.output.iter().find(|o| has_wildcards(o)) {
                return Err(Error::workflow_in_rule(
                    &job.rule,
                    format!("output '{}' still contains a placeholder", output),
                ));
            }
        }
        Ok(())
    }

    fn deactivate_iocache(&mut self) {
        self.iocache_active = false;
        if let Ok(mut cache) = self.iocache.lock() {
            cache.clear();
        }
    }

    fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    fn subworkflow_files(&self, name: &str) -> Vec<String> {
        let files: BTreeSet<String> = self
            .jobs
            .iter()
            .flat_map(|job| job.subworkflow_input.iter())
            .filter(|(_, sub)| sub.as_str() == name)
            .map(|(file, _)| file.clone())
            .collect();
        files.into_iter().collect()
    }

    fn mark_updated(&mut self, files: &[String], persistence: &dyn Persistence) -> Result<()> {
        self.updated_files.extend(files.iter().cloned());
        self.compute_needrun(persistence);
        Ok(())
    }

    fn missing_inputs(&self) -> Vec<String> {
        self.target_jobs
            .iter()
            .map(|&id| &self.jobs[id])
            .filter(|job| job.needrun)
            .flat_map(|job| job.input.iter())
            .filter(|input| !self.path(input).exists())
            .cloned()
            .collect()
    }

    fn stats(&self) -> String {
        self.job_stats()
    }

    fn dot(&self) -> String {
        self.render_dot()
    }

    fn rule_dot(&self) -> String {
        self.render_rule_dot()
    }

    fn filegraph_dot(&self) -> String {
        self.render_filegraph_dot()
    }

    fn d3dag(&self) -> Result<String> {
        self.render_d3dag()
    }

    fn summary(&self, detailed: bool, persistence: &dyn Persistence) -> Vec<String> {
        self.summary_lines(detailed, persistence)
    }

    fn changed_files(&self, kind: ChangeKind, persistence: &dyn Persistence) -> Vec<String> {
        self.changes(kind, persistence)
    }

    fn untracked_files(&self) -> Result<Vec<String>> {
        self.list_untracked()
    }

    fn archive(&self, path: &Path) -> Result<()> {
        self.write_archive(path)
    }

    fn clean(&self, only_temp: bool, dryrun: bool) -> Result<Vec<String>> {
        self.delete_outputs(only_temp, dryrun)
    }

    fn containerize(&self) -> Result<String> {
        self.container_definition()
    }

    fn pull_container_images(&self, dryrun: bool, prefix: &Path) -> Result<()> {
        self.pull_images(dryrun, prefix)
    }

    fn create_conda_envs(&self, dryrun: bool, prefix: &Path) -> Result<()> {
        self.create_envs(dryrun, prefix)
    }

    fn conda_env_listing(&self, prefix: &Path) -> Result<Vec<(String, String, PathBuf)>> {
        self.env_table(prefix)
    }

    fn conda_env_addresses(&self, prefix: &Path) -> Result<BTreeSet<PathBuf>> {
        self.env_addresses(prefix)
    }

    fn container_images(&self, prefix: &Path) -> BTreeSet<PathBuf> {
        self.image_paths(prefix)
    }

    fn cleanup_workdir(&self) {
        self.remove_empty_dirs()
    }
}
