//! Job Scheduling
//!
//! The orchestrator hands a materialized [`Dag`] to a [`Scheduler`] built
//! by a [`SchedulerFactory`] from a [`SchedulerPolicy`]. The built-in
//! [`LocalScheduler`] runs jobs on worker threads of this machine: a job
//! becomes ready once every job it depends on finished, and ready jobs
//! start in priority order while cores, user resources and the job limit
//! allow.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::monitoring::{EventType, ExecutionTimeline, FileStats, ResourceMonitor, RunStats};
use crate::workflow::state::{OutputRecord, Persistence};
use crate::workflow::value::Literal;

use super::dag::{Dag, Job};
use super::step::{execute_job, render_command, StepContext};
use crate::workflow::rule::{ExecMethod, CORES, NODES};

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Where jobs are executed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Executor {
    #[default]
    Local,
    /// Submission through a cluster command such as `sbatch`
    Cluster { submit: String },
    /// A named remote execution backend
    Remote { name: String },
}

/// Everything a scheduler needs to know about how to run the jobs.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub cores: i64,
    pub nodes: Option<i64>,
    /// Global pool of user resources
    pub resources: BTreeMap<String, i64>,
    pub max_jobs: Option<usize>,
    pub max_jobs_per_second: Option<f64>,
    pub keepgoing: bool,
    pub dryrun: bool,
    pub touch: bool,
    pub printreason: bool,
    pub printshellcmds: bool,
    pub immediate_submit: bool,
    pub executor: Executor,
    pub step: StepContext,
    /// Write run statistics here
    pub stats: Option<PathBuf>,
}

impl SchedulerPolicy {
    pub fn new(step: StepContext) -> Self {
        Self {
            cores: 1,
            nodes: None,
            resources: BTreeMap::new(),
            max_jobs: None,
            max_jobs_per_second: None,
            keepgoing: false,
            dryrun: false,
            touch: false,
            printreason: false,
            printshellcmds: false,
            immediate_submit: false,
            executor: Executor::Local,
            step,
            stats: None,
        }
    }
}

/// Runs the jobs of a graph to completion.
pub trait Scheduler {
    /// Blocks until every job that needs to run finished; false if any failed.
    fn run(&mut self, dag: &dyn Dag, persistence: &mut dyn Persistence) -> Result<bool>;

    /// Outputs produced by the last run.
    fn updated_files(&self) -> &[String];
}

/// Builds schedulers for a policy.
pub trait SchedulerFactory: Send + Sync {
    fn create(&self, policy: SchedulerPolicy) -> Result<Box<dyn Scheduler>>;
}

/// Builds [`LocalScheduler`]s; other executors are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSchedulerFactory;

impl SchedulerFactory for LocalSchedulerFactory {
    fn create(&self, policy: SchedulerPolicy) -> Result<Box<dyn Scheduler>> {
        match &policy.executor {
            Executor::Local => Ok(Box::new(LocalScheduler::new(policy))),
            Executor::Cluster { submit } => Err(Error::IncompatibleMode(format!(
                "cluster submission ('{}') is not supported by the local scheduler",
                submit
            ))),
            Executor::Remote { name } => Err(Error::IncompatibleMode(format!(
                "remote executor '{}' is not supported by the local scheduler",
                name
            ))),
        }
    }
}

/// Stops the monitor thread when dropped.
struct MonitorThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<ResourceMonitor>>,
}

impl MonitorThread {
    fn start() -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut monitor = ResourceMonitor::new();
            while flag.load(Ordering::Relaxed) {
                monitor.sample();
                thread::sleep(MONITOR_SAMPLE_INTERVAL);
            }
            monitor
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    fn finish(mut self) -> Option<ResourceMonitor> {
        self.running.store(false, Ordering::Relaxed);
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for MonitorThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

type Completion = (usize, Result<()>, DateTime<Utc>, DateTime<Utc>);

/// Thread-based scheduler for this machine.
pub struct LocalScheduler {
    policy: SchedulerPolicy,
    updated: Vec<String>,
}

impl LocalScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            policy,
            updated: Vec::new(),
        }
    }

    fn print_dryrun(&self, jobs: &[&Job]) {
        for job in jobs {
            println!();
            match &job.message {
                Some(message) => println!("[DRY RUN] {}", message),
                None => println!("[DRY RUN] rule {}:", job.rule),
            }
            if !job.input.is_empty() {
                println!("    input: {}", job.input.join(", "));
            }
            if !job.output.is_empty() {
                println!("    output: {}", job.output.join(", "));
            }
            if !job.log.is_empty() {
                println!("    log: {}", job.log.join(", "));
            }
            println!("    jobid: {}", job.id);
            if self.policy.printreason {
                println!("    reason: {}", job.reason);
            }
            if !job.wildcards.is_empty() {
                let wildcards: Vec<String> =
                    job.wildcards.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                println!("    wildcards: {}", wildcards.join(", "));
            }
            println!("    threads: {}", job.threads);
            if self.policy.printshellcmds {
                if let ExecMethod::Shell(command) = &job.exec {
                    match render_command(command, job) {
                        Ok(text) => println!("    shell: {}", text),
                        Err(e) => println!("    shell: {} ({})", command, e),
                    }
                }
            }
        }
        println!();
    }

    fn touch(&mut self, jobs: &[&Job]) -> Result<bool> {
        let now = SystemTime::now();
        for job in jobs {
            for output in &job.output {
                let path = self.policy.step.workdir.join(output);
                if !path.exists() {
                    warn!("Cannot touch {}: file does not exist", output);
                    continue;
                }
                info!("Touching output file {}", output);
                File::options().write(true).open(&path)?.set_modified(now)?;
                self.updated.push(output.clone());
            }
        }
        Ok(true)
    }

    /// Whether the pool has room for `job`.
    fn fits(&self, job: &Job, used_cores: i64, used: &BTreeMap<String, i64>) -> bool {
        if used_cores > 0 && used_cores + job.threads > self.policy.cores {
            return false;
        }
        user_resources(job).all(|(name, value)| match (value, self.policy.resources.get(name)) {
            (Literal::Int(need), Some(limit)) => used.get(name).copied().unwrap_or(0) + need <= *limit,
            _ => true,
        })
    }

    /// Jobs needing more of a resource than the whole pool holds.
    fn oversized(&self, jobs: &[&Job]) -> Vec<String> {
        jobs.iter()
            .flat_map(|job| {
                user_resources(job).filter_map(move |(name, value)| match (value, self.policy.resources.get(name)) {
                    (Literal::Int(need), Some(limit)) if need > limit => Some(format!(
                        "{} needs {}={} (available: {})",
                        job.label(),
                        name,
                        need,
                        limit
                    )),
                    _ => None,
                })
            })
            .collect()
    }

    fn remove_outputs(&self, job: &Job) {
        for output in &job.output {
            let path = self.policy.step.workdir.join(output);
            if path.exists() {
                info!("Removing output files of failed job {}: {}", job.label(), output);
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(e) = result {
                    warn!("Failed to remove {}: {}", output, e);
                }
            }
        }
    }

    /// Deletes temp outputs of `dep` once none of its consumers is left to run.
    fn release_temp(&self, dep: &Job, consumers: &BTreeSet<usize>, finished: &BTreeSet<usize>) {
        if dep.temp_output.is_empty() || !consumers.iter().all(|c| finished.contains(c)) {
            return;
        }
        for file in &dep.temp_output {
            let path = self.policy.step.workdir.join(file);
            if path.exists() {
                info!("Removing temporary output {}", file);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", file, e);
                }
            }
        }
    }

    fn record(
        &self,
        job: &Job,
        persistence: &mut dyn Persistence,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let record = OutputRecord {
            rule: job.rule.clone(),
            version: job.version.clone(),
            code: job.code(),
            params: job.params_text(),
            input: job.input.clone(),
            software_env: job.software_env(),
            log: job.log.clone(),
            starttime: start,
            endtime: end,
        };
        for output in &job.output {
            persistence.record(output, &record)?;
        }
        persistence.clear_incomplete(&job.output)
    }

    fn write_stats(&self, jobs: &[&Job], timeline: &ExecutionTimeline, monitor: Option<&ResourceMonitor>) -> Result<()> {
        let Some(path) = &self.policy.stats else {
            return Ok(());
        };
        let durations = timeline.get_durations();
        let mut files = BTreeMap::new();
        for job in jobs {
            let label = job.label();
            let Some((start, stop)) = timeline.span(&label) else {
                continue;
            };
            let duration = durations.get(&label).map(|ms| *ms as f64 / 1000.0).unwrap_or(0.0);
            for output in &job.output {
                files.insert(
                    output.clone(),
                    FileStats {
                        start_time: start.to_rfc2822(),
                        stop_time: stop.to_rfc2822(),
                        duration,
                        priority: job.priority,
                        resources: job.resources.clone(),
                    },
                );
            }
        }
        let stats = RunStats {
            total_runtime: timeline.elapsed().as_secs_f64(),
            rules: timeline.rule_runtimes(),
            files,
            resources: monitor.map(ResourceMonitor::summary),
        };
        stats.write(path)?;
        info!("Wrote run statistics to {}", path.display());
        Ok(())
    }
}

/// Resources other than the internal `_cores`/`_nodes` pools.
fn user_resources(job: &Job) -> impl Iterator<Item = (&String, &Literal)> {
    job.resources.iter().filter(|(name, _)| name.as_str() != CORES && name.as_str() != NODES)
}

fn spawn_job(job: Job, step: StepContext, tx: Sender<Completion>) {
    thread::spawn(move || {
        let start = Utc::now();
        let mut result = execute_job(&job, &step);
        let mut attempt = 1;
        while result.is_err() && attempt <= job.restart_times {
            attempt += 1;
            warn!("Restarting job {} (attempt {})", job.label(), attempt);
            result = execute_job(&job, &step);
        }
        if let Err(e) = tx.send((job.id, result, start, Utc::now())) {
            error!("Failed to send completion signal: {}", e);
        }
    });
}

impl Scheduler for LocalScheduler {
    fn run(&mut self, dag: &dyn Dag, persistence: &mut dyn Persistence) -> Result<bool> {
        self.updated.clear();
        let needrun = dag.needrun_jobs();
        if needrun.is_empty() {
            return Ok(true);
        }
        if self.policy.dryrun {
            self.print_dryrun(&needrun);
            return Ok(true);
        }
        if self.policy.touch {
            return self.touch(&needrun);
        }

        let oversized = self.oversized(&needrun);
        if !oversized.is_empty() {
            return Err(Error::workflow(format!(
                "Jobs exceed the available resources and can never run:\n{}",
                oversized.join("\n")
            )));
        }

        let all_jobs = dag.jobs();
        let total = needrun.len();
        let mut pending: BTreeSet<usize> = needrun.iter().map(|job| job.id).collect();
        let mut consumers: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for job in &needrun {
            for &dep in &job.dependencies {
                consumers.entry(dep).or_default().insert(job.id);
            }
        }

        let max_jobs = self.policy.max_jobs.unwrap_or(usize::MAX).max(1);
        let min_interval = self
            .policy
            .max_jobs_per_second
            .filter(|rate| *rate > 0.0)
            .map(|rate| Duration::from_secs_f64(1.0 / rate));
        info!(
            "Using {} cores, {} jobs to run",
            self.policy.cores, total
        );

        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let monitor = MonitorThread::start();
        let mut timeline = ExecutionTimeline::new();

        let mut finished: BTreeSet<usize> = BTreeSet::new();
        let mut running: BTreeSet<usize> = BTreeSet::new();
        let mut failed = false;
        let mut used_cores = 0;
        let mut used: BTreeMap<String, i64> = BTreeMap::new();
        let mut last_spawn: Option<Instant> = None;

        loop {
            if !failed || self.policy.keepgoing {
                let mut ready: Vec<&Job> = pending
                    .iter()
                    .map(|&id| &all_jobs[id])
                    .filter(|job| {
                        job.dependencies
                            .iter()
                            .all(|dep| finished.contains(dep) || !all_jobs[*dep].needrun)
                    })
                    .collect();
                ready.sort_by(|a, b| b.priority.total_cmp(&a.priority).then(a.id.cmp(&b.id)));

                for job in ready {
                    if running.len() >= max_jobs || !self.fits(job, used_cores, &used) {
                        continue;
                    }
                    if let (Some(interval), Some(last)) = (min_interval, last_spawn) {
                        let since = last.elapsed();
                        if since < interval {
                            thread::sleep(interval - since);
                        }
                    }

                    match &job.message {
                        Some(message) => info!("{}", message),
                        None => info!("rule {} (jobid {}): {}", job.rule, job.id, job.label()),
                    }
                    if self.policy.printreason {
                        info!("    reason: {}", job.reason);
                    }
                    persistence.mark_incomplete(&job.output)?;
                    timeline.add_event(job.label(), job.rule.clone(), EventType::Started);

                    pending.remove(&job.id);
                    running.insert(job.id);
                    used_cores += job.threads;
                    for (name, value) in user_resources(job) {
                        if let Literal::Int(n) = value {
                            *used.entry(name.clone()).or_default() += n;
                        }
                    }
                    last_spawn = Some(Instant::now());
                    spawn_job(job.clone(), self.policy.step.clone(), tx.clone());
                }
            }

            if running.is_empty() {
                break;
            }

            let (id, result, start, end) = rx
                .recv()
                .map_err(|e| Error::workflow(format!("Failed to receive job completion: {}", e)))?;
            let job = &all_jobs[id];
            running.remove(&id);
            used_cores -= job.threads;
            for (name, value) in user_resources(job) {
                if let (Literal::Int(n), Some(in_use)) = (value, used.get_mut(name)) {
                    *in_use -= n;
                }
            }

            match result {
                Ok(()) => {
                    self.record(job, persistence, start, end)?;
                    timeline.add_event(job.label(), job.rule.clone(), EventType::Completed);
                    finished.insert(id);
                    self.updated.extend(job.output.iter().cloned());
                    for &dep in &job.dependencies {
                        if let Some(users) = consumers.get(&dep) {
                            self.release_temp(&all_jobs[dep], users, &finished);
                        }
                    }
                    info!("Finished job {}.", id);
                    info!(
                        "{} of {} steps ({}%) done",
                        finished.len(),
                        total,
                        finished.len() * 100 / total
                    );
                }
                Err(e) => {
                    error!("Error in rule {}: {}", job.rule, e);
                    timeline.add_event(job.label(), job.rule.clone(), EventType::Failed);
                    self.remove_outputs(job);
                    persistence.clear_incomplete(&job.output)?;
                    failed = true;
                    if !self.policy.keepgoing {
                        info!("Waiting for running jobs to finish before exiting");
                    }
                }
            }
        }

        let monitor = monitor.finish();
        debug!("{}", timeline.gantt_chart());
        if let Some(monitor) = &monitor {
            debug!("{}", monitor.get_summary());
        }
        self.write_stats(&needrun, &timeline, monitor.as_ref())?;

        if !pending.is_empty() {
            if !failed {
                let stuck: Vec<String> = pending.iter().map(|&id| all_jobs[id].label()).collect();
                return Err(Error::workflow(format!(
                    "Jobs could not be scheduled: {}",
                    stuck.join(", ")
                )));
            }
            warn!("{} jobs were not run because of failed dependencies", pending.len());
        }
        Ok(!failed)
    }

    fn updated_files(&self) -> &[String] {
        &self.updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::dag::{DagBuilder, TargetSets};
    use crate::execution::graph::FileDagBuilder;
    use crate::workflow::ruleinfo::{Directive, InOutput};
    use crate::workflow::state::StateStore;
    use crate::workflow::value::Value;
    use crate::workflow::Registry;
    use tempfile::TempDir;

    fn add_rule(registry: &mut Registry, name: &str, input: &[&str], output: &[&str], shell: &str) {
        let mut handle = registry.register(Some(name), false).unwrap();
        registry
            .apply_directive(&mut handle, Directive::Input(InOutput::from_patterns(input.to_vec())))
            .unwrap();
        registry
            .apply_directive(&mut handle, Directive::Output(InOutput::from_patterns(output.to_vec())))
            .unwrap();
        registry
            .apply_directive(&mut handle, Directive::Exec(ExecMethod::Shell(shell.into())))
            .unwrap();
        registry.finalize(handle).unwrap();
    }

    fn policy(dir: &TempDir) -> SchedulerPolicy {
        let mut step = StepContext::new(dir.path());
        step.latency_wait = Duration::from_millis(200);
        let mut policy = SchedulerPolicy::new(step);
        policy.cores = 2;
        policy
    }

    fn dag(registry: &Registry, target: &str, dir: &TempDir, store: &StateStore) -> Box<dyn Dag> {
        let targets = TargetSets {
            targetfiles: [target.to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut dag = FileDagBuilder.build(registry, &targets, dir.path()).unwrap();
        dag.init(store).unwrap();
        dag
    }

    #[test]
    fn test_runs_jobs_in_dependency_order() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        add_rule(&mut registry, "a", &[], &["x.txt"], "echo a > {output}");
        add_rule(&mut registry, "b", &["x.txt"], &["y.txt"], "cat {input} > {output}; echo b >> {output}");

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "y.txt", &dir, &store);
        let mut scheduler = LocalScheduler::new(policy(&dir));
        assert!(scheduler.run(dag.as_ref(), &mut store).unwrap());

        assert_eq!(fs::read_to_string(dir.path().join("y.txt")).unwrap(), "a\nb\n");
        assert_eq!(scheduler.updated_files(), &["x.txt".to_string(), "y.txt".to_string()]);
        let record = store.metadata("y.txt").unwrap();
        assert_eq!(record.rule, "b");
        assert!(!store.is_incomplete("y.txt"));
    }

    #[test]
    fn test_failure_removes_outputs_and_stops() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        add_rule(&mut registry, "a", &[], &["x.txt"], "echo a > {output}; exit 1");
        add_rule(&mut registry, "b", &["x.txt"], &["y.txt"], "touch {output}");

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "y.txt", &dir, &store);
        let mut scheduler = LocalScheduler::new(policy(&dir));
        assert!(!scheduler.run(dag.as_ref(), &mut store).unwrap());
        assert!(!dir.path().join("x.txt").exists());
        assert!(!dir.path().join("y.txt").exists());
        assert!(!store.is_incomplete("x.txt"));
    }

    #[test]
    fn test_keepgoing_runs_independent_jobs() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        add_rule(&mut registry, "bad", &[], &["bad.txt"], "exit 1");
        add_rule(&mut registry, "good", &[], &["good.txt"], "touch {output}");
        add_rule(&mut registry, "all", &["bad.txt", "good.txt"], &["all.txt"], "touch {output}");

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "all.txt", &dir, &store);
        let mut policy = policy(&dir);
        policy.keepgoing = true;
        policy.cores = 1;
        let mut scheduler = LocalScheduler::new(policy);
        assert!(!scheduler.run(dag.as_ref(), &mut store).unwrap());
        assert!(dir.path().join("good.txt").exists());
        assert!(!dir.path().join("all.txt").exists());
    }

    #[test]
    fn test_retries_failed_jobs() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        let mut handle = registry.register(Some("flaky"), false).unwrap();
        registry
            .apply_directive(&mut handle, Directive::Output(InOutput::from_patterns(["out.txt"])))
            .unwrap();
        registry
            .apply_directive(
                &mut handle,
                Directive::Exec(ExecMethod::Shell(
                    "if [ -e marker ]; then touch {output}; else touch marker; exit 1; fi".into(),
                )),
            )
            .unwrap();
        registry
            .apply_directive(&mut handle, Directive::Retries(Value::from(1i64)))
            .unwrap();
        registry.finalize(handle).unwrap();

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "out.txt", &dir, &store);
        let mut scheduler = LocalScheduler::new(policy(&dir));
        assert!(scheduler.run(dag.as_ref(), &mut store).unwrap());
        assert!(dir.path().join("out.txt").exists());
    }

    #[test]
    fn test_dryrun_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        add_rule(&mut registry, "a", &[], &["x.txt"], "touch {output}");

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "x.txt", &dir, &store);
        let mut policy = policy(&dir);
        policy.dryrun = true;
        let mut scheduler = LocalScheduler::new(policy);
        assert!(scheduler.run(dag.as_ref(), &mut store).unwrap());
        assert!(!dir.path().join("x.txt").exists());
        assert!(scheduler.updated_files().is_empty());
    }

    #[test]
    fn test_stats_written() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        add_rule(&mut registry, "a", &[], &["x.txt"], "touch {output}");

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "x.txt", &dir, &store);
        let mut policy = policy(&dir);
        let stats = dir.path().join("stats.json");
        policy.stats = Some(stats.clone());
        let mut scheduler = LocalScheduler::new(policy);
        assert!(scheduler.run(dag.as_ref(), &mut store).unwrap());

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(stats).unwrap()).unwrap();
        assert!(value["rules"]["a"]["mean-runtime"].is_number());
        assert!(value["files"]["x.txt"]["duration"].is_number());
    }

    #[test]
    fn test_job_larger_than_pool_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut registry = Registry::default();
        let mut handle = registry.register(Some("big"), false).unwrap();
        registry
            .apply_directive(&mut handle, Directive::Output(InOutput::from_patterns(["big.txt"])))
            .unwrap();
        registry
            .apply_directive(&mut handle, Directive::Exec(ExecMethod::Shell("touch {output}".into())))
            .unwrap();
        registry
            .apply_directive(&mut handle, Directive::resources(vec![("mem_mb", Value::from(1000i64))]))
            .unwrap();
        registry.finalize(handle).unwrap();

        let mut store = StateStore::open(dir.path()).unwrap();
        let dag = dag(&registry, "big.txt", &dir, &store);
        let mut policy = policy(&dir);
        policy.resources.insert("mem_mb".to_string(), 500);
        let mut scheduler = LocalScheduler::new(policy);

        let err = scheduler.run(dag.as_ref(), &mut store).unwrap_err();
        assert!(err.to_string().contains("mem_mb=1000"));
        assert!(!dir.path().join("big.txt").exists());
    }

    #[test]
    fn test_factory_rejects_cluster() {
        let dir = TempDir::new().unwrap();
        let mut policy = policy(&dir);
        policy.executor = Executor::Cluster {
            submit: "sbatch".to_string(),
        };
        assert!(matches!(
            LocalSchedulerFactory.create(policy),
            Err(Error::IncompatibleMode(_))
        ));
    }
}
