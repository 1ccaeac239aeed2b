//! Individual Job Execution
//!
//! Handles the execution of a single job including:
//! - Command placeholder substitution
//! - Script generation
//! - Environment activation (env modules, container, conda)
//! - Shadow directories and benchmark records
//! - Output directory creation and the final output check

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tempfile::{Builder, NamedTempFile, TempPath};

use crate::environment::{container, CondaEnv};
use crate::error::{Error, Result};
use crate::workflow::rule::{ExecMethod, ShadowMode};
use crate::workflow::state::STATE_DIR;
use crate::workflow::value::{JobContext, Literal};

use super::dag::Job;

/// Environment variable pointing scripts and notebooks at their job description.
pub const JOB_ENV_VAR: &str = "RULERUNNER_JOB";

/// Interval between checks for files that are not there yet.
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*)|\[(\d+)\])?\}")
        .expect("placeholder pattern should compile")
});

/// Run-wide settings for executing jobs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workdir: PathBuf,
    /// Set when conda environments are used
    pub conda_prefix: Option<PathBuf>,
    /// Set when singularity containers are used
    pub singularity_prefix: Option<PathBuf>,
    pub use_env_modules: bool,
    pub wrapper_prefix: String,
    pub shadow_prefix: PathBuf,
    pub latency_wait: Duration,
    pub printshellcmds: bool,
}

impl StepContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            shadow_prefix: workdir.join(STATE_DIR).join("shadow"),
            workdir,
            conda_prefix: None,
            singularity_prefix: None,
            use_env_modules: false,
            wrapper_prefix: String::new(),
            latency_wait: Duration::from_secs(5),
            printshellcmds: false,
        }
    }
}

/// Job description handed to scripts and notebooks.
#[derive(Serialize)]
struct ScriptJob<'a> {
    rule: &'a str,
    input: &'a [String],
    output: &'a [String],
    named_input: &'a BTreeMap<String, usize>,
    named_output: &'a BTreeMap<String, usize>,
    params: &'a BTreeMap<String, String>,
    wildcards: &'a BTreeMap<String, String>,
    threads: i64,
    resources: &'a BTreeMap<String, Literal>,
    log: &'a [String],
}

/// Executes a single job.
///
/// # Placeholder Substitution
///
/// Shell commands may reference `{input}`, `{output}`, `{log}` (all
/// files, space separated), `{input[0]}`, `{output.name}`, `{params}`,
/// `{params.name}`, `{wildcards.name}`, `{resources.name}`, `{threads}`
/// and `{rule}`. `{{` and `}}` produce literal braces.
pub fn execute_job(job: &Job, ctx: &StepContext) -> Result<()> {
    let started = Instant::now();
    ensure_output_directories(job, &ctx.workdir)?;

    let shadow = prepare_shadow(job, ctx)?;
    let exec_dir = shadow.clone().unwrap_or_else(|| ctx.workdir.clone());

    let result = run(job, ctx, &exec_dir);
    if let Some(dir) = &shadow {
        if result.is_ok() {
            collect_shadow_outputs(job, dir, &ctx.workdir)?;
        }
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to remove shadow directory {}: {}", dir.display(), e);
        }
    }
    result?;

    if let Some(benchmark) = &job.benchmark {
        write_benchmark(&ctx.workdir.join(benchmark), started.elapsed())?;
    }

    wait_for_files(&job.output, &ctx.workdir, ctx.latency_wait).map_err(|e| Error::Job {
        job: job.label(),
        message: e.to_string(),
    })
}

fn run(job: &Job, ctx: &StepContext, exec_dir: &Path) -> Result<()> {
    match &job.exec {
        ExecMethod::NoRun => Ok(()),
        ExecMethod::Shell(command) => {
            let text = render_command(command, job)?;
            run_in_env(job, ctx, exec_dir, &text, None)
        }
        ExecMethod::Script(path) => {
            let path = resolve_source(path, job);
            let interpreter = interpreter_for(&path).ok_or_else(|| Error::Job {
                job: job.label(),
                message: format!("Unsupported script type: {}", path.display()),
            })?;
            let job_file = write_job_file(job, exec_dir)?;
            let text = format!("{} '{}'", interpreter, path.display());
            run_in_env(job, ctx, exec_dir, &text, Some(job_file))
        }
        ExecMethod::Notebook(path) => {
            let path = resolve_source(path, job);
            let job_file = write_job_file(job, exec_dir)?;
            let text = format!(
                "jupyter nbconvert --to notebook --execute --stdout '{}' > /dev/null",
                path.display()
            );
            run_in_env(job, ctx, exec_dir, &text, Some(job_file))
        }
        ExecMethod::Wrapper(name) => {
            let prefix = &ctx.wrapper_prefix;
            if prefix.is_empty() || prefix.contains("://") {
                return Err(Error::Job {
                    job: job.label(),
                    message: format!(
                        "Wrapper '{}' requires a local wrapper prefix (--wrapper-prefix)",
                        name
                    ),
                });
            }
            let script = Path::new(prefix).join(name).join("wrapper.py");
            let job_file = write_job_file(job, exec_dir)?;
            let text = format!("python '{}'", script.display());
            run_in_env(job, ctx, exec_dir, &text, Some(job_file))
        }
        ExecMethod::TemplateEngine(engine) => {
            let (Some(template), Some(output)) = (job.input.first(), job.output.first()) else {
                return Err(Error::Job {
                    job: job.label(),
                    message: "Template rendering needs one input and one output".to_string(),
                });
            };
            debug!("Rendering {} with {}", template, engine);
            let text = fs::read_to_string(exec_dir.join(template))?;
            fs::write(exec_dir.join(output), render_command(&text, job)?)?;
            Ok(())
        }
        ExecMethod::Run(func) => {
            let context = JobContext {
                rule: job.rule.clone(),
                input: job.input.clone(),
                output: job.output.clone(),
                params: job.params.clone(),
                wildcards: job.wildcards.clone(),
                threads: job.threads,
                resources: job.resources.clone(),
                log: job.log.clone(),
                workdir: exec_dir.to_path_buf(),
            };
            func.call(&context).map_err(|message| Error::Job {
                job: job.label(),
                message,
            })
        }
    }
}

/// Substitutes job attributes into a command template.
pub fn render_command(template: &str, job: &Job) -> Result<String> {
    let mut failure = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        match placeholder_value(caps, job) {
            Ok(value) => value,
            Err(message) => {
                failure.get_or_insert(message);
                String::new()
            }
        }
    });
    match failure {
        Some(message) => Err(Error::Job {
            job: job.label(),
            message,
        }),
        None => Ok(rendered.into_owned()),
    }
}

fn placeholder_value(caps: &Captures, job: &Job) -> std::result::Result<String, String> {
    let whole = &caps[0];
    if whole == "{{" {
        return Ok("{".to_string());
    }
    if whole == "}}" {
        return Ok("}".to_string());
    }
    let name = &caps[1];
    let attr = caps.get(2).map(|m| m.as_str());
    let index = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());
    let unknown = || format!("Unknown placeholder {} in command", whole);

    let files = |list: &[String], named: &BTreeMap<String, usize>| match (attr, index) {
        (None, None) => Ok(list.join(" ")),
        (None, Some(i)) => list.get(i).cloned().ok_or_else(unknown),
        (Some(key), _) => named
            .get(key)
            .and_then(|&i| list.get(i))
            .cloned()
            .ok_or_else(unknown),
    };

    match name {
        "input" => files(&job.input, &job.named_input),
        "output" => files(&job.output, &job.named_output),
        "log" => files(&job.log, &BTreeMap::new()),
        "params" => match (attr, index) {
            (None, None) => Ok(job.params.values().cloned().collect::<Vec<_>>().join(" ")),
            (Some(key), _) => job.params.get(key).cloned().ok_or_else(unknown),
            (None, Some(i)) => job.params.get(&i.to_string()).cloned().ok_or_else(unknown),
        },
        "wildcards" => attr
            .and_then(|key| job.wildcards.get(key))
            .cloned()
            .ok_or_else(unknown),
        "resources" => attr
            .and_then(|key| job.resources.get(key))
            .map(Literal::to_string)
            .ok_or_else(unknown),
        "threads" => Ok(job.threads.to_string()),
        "rule" => Ok(job.rule.clone()),
        "jobid" => Ok(job.id.to_string()),
        _ => Err(unknown()),
    }
}

fn resolve_source(path: &str, job: &Job) -> PathBuf {
    let path = Path::new(path);
    match &job.basedir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "py" => Some("python"),
        "R" | "r" => Some("Rscript --vanilla"),
        "jl" => Some("julia"),
        "sh" => Some("bash"),
        "rs" => Some("rust-script"),
        _ => None,
    }
}

fn write_job_file(job: &Job, exec_dir: &Path) -> Result<TempPath> {
    let description = ScriptJob {
        rule: &job.rule,
        input: &job.input,
        output: &job.output,
        named_input: &job.named_input,
        named_output: &job.named_output,
        params: &job.params,
        wildcards: &job.wildcards,
        threads: job.threads,
        resources: &job.resources,
        log: &job.log,
    };
    let mut file = scratch_file(job, ".json")?;
    serde_json::to_writer_pretty(file.as_file_mut(), &description)?;
    debug!("Wrote job description for {} in {}", job.label(), exec_dir.display());
    Ok(file.into_temp_path())
}

/// A uniquely named file under the shared scripts directory.
fn scratch_file(job: &Job, suffix: &str) -> Result<NamedTempFile> {
    let dir = std::env::temp_dir().join("rulerunner_scripts");
    fs::create_dir_all(&dir)?;
    Ok(Builder::new()
        .prefix(&format!("job_{}_", job.id))
        .suffix(suffix)
        .tempfile_in(&dir)?)
}

/// Creates parent directories for outputs, logs and benchmarks.
fn ensure_output_directories(job: &Job, workdir: &Path) -> Result<()> {
    let files = job
        .output
        .iter()
        .chain(job.log.iter())
        .chain(job.benchmark.iter());
    for file in files {
        if let Some(parent) = workdir.join(file).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Creates a temporary bash script for the job.
fn create_execution_script(job: &Job, ctx: &StepContext, command_text: &str) -> Result<TempPath> {
    let mut script = scratch_file(job, ".sh")?;
    let file = script.as_file_mut();

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    if ctx.use_env_modules && !job.env_modules.is_empty() {
        writeln!(file, "module purge")?;
        writeln!(file, "module load {}", job.env_modules.join(" "))?;
    }
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(script.path(), fs::Permissions::from_mode(0o755))?;
    }

    Ok(script.into_temp_path())
}

/// Bash, wrapped in the job's container or conda environment.
fn environment_command(job: &Job, ctx: &StepContext) -> Result<Command> {
    if ctx.use_env_modules && !job.env_modules.is_empty() {
        return Ok(Command::new("bash"));
    }
    if let (Some(url), Some(prefix)) = (&job.container, &ctx.singularity_prefix) {
        let image = container::image_path(url, prefix);
        return Ok(container::exec_command(&image, &ctx.workdir, "bash"));
    }
    if let (Some(env), Some(prefix)) = (&job.conda_env, &ctx.conda_prefix) {
        return CondaEnv::parse(env, None).run_command(prefix, "bash");
    }
    Ok(Command::new("bash"))
}

fn run_in_env(
    job: &Job,
    ctx: &StepContext,
    exec_dir: &Path,
    command_text: &str,
    job_file: Option<TempPath>,
) -> Result<()> {
    if ctx.printshellcmds {
        info!("{}", command_text);
    }
    let script_path = create_execution_script(job, ctx, command_text)?;

    let mut cmd = environment_command(job, ctx)?;
    cmd.arg(script_path.as_os_str()).current_dir(exec_dir);
    if let Some(file) = &job_file {
        cmd.env(JOB_ENV_VAR, file.as_os_str());
    }
    debug!("Executing {} in {}", job.label(), exec_dir.display());
    let output = cmd.output();

    for path in std::iter::once(script_path).chain(job_file) {
        let shown = path.display().to_string();
        if let Err(e) = path.close() {
            warn!("Failed to clean up {}: {}", shown, e);
        }
    }
    let output = output?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("Job '{}' output:\n{}", job.label(), stdout);
        }
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Job '{}' failed with exit code: {:?}",
            job.label(),
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        Err(Error::Job {
            job: job.label(),
            message: format!("command exited with status {:?}", output.status.code()),
        })
    }
}

fn prepare_shadow(job: &Job, ctx: &StepContext) -> Result<Option<PathBuf>> {
    if job.shadow == ShadowMode::None {
        return Ok(None);
    }
    let dir = ctx
        .shadow_prefix
        .join(format!("job{}_{}", job.id, std::process::id()));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    match job.shadow {
        ShadowMode::None => {}
        ShadowMode::Minimal | ShadowMode::CopyMinimal => {
            for input in &job.input {
                let target = dir.join(input);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let source = ctx.workdir.join(input);
                if job.shadow == ShadowMode::CopyMinimal {
                    fs::copy(&source, &target)?;
                } else {
                    link(&source, &target)?;
                }
            }
        }
        ShadowMode::Shallow => {
            for entry in fs::read_dir(&ctx.workdir)? {
                let entry = entry?;
                if entry.file_name() != STATE_DIR {
                    link(&entry.path(), &dir.join(entry.file_name()))?;
                }
            }
        }
        ShadowMode::Full => link_tree(&ctx.workdir, &dir)?,
    }

    for output in job.output.iter().chain(job.log.iter()) {
        if let Some(parent) = dir.join(output).parent() {
            fs::create_dir_all(parent)?;
        }
    }
    debug!("Prepared shadow directory {}", dir.display());
    Ok(Some(dir))
}

fn link_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if entry.file_name() == STATE_DIR {
            continue;
        }
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            link_tree(&entry.path(), &to)?;
        } else {
            link(&entry.path(), &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn link(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

fn collect_shadow_outputs(job: &Job, shadow: &Path, workdir: &Path) -> Result<()> {
    for file in job.output.iter().chain(job.log.iter()) {
        let from = shadow.join(file);
        if !from.exists() || fs::symlink_metadata(&from)?.file_type().is_symlink() {
            continue;
        }
        let to = workdir.join(file);
        if fs::rename(&from, &to).is_err() {
            fs::copy(&from, &to)?;
            fs::remove_file(&from)?;
        }
    }
    Ok(())
}

fn write_benchmark(path: &Path, elapsed: Duration) -> Result<()> {
    let secs = elapsed.as_secs_f64();
    let total = elapsed.as_secs();
    let hms = format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60);
    fs::write(path, format!("s\th:m:s\n{:.4}\t{}\n", secs, hms))?;
    Ok(())
}

/// Waits up to `latency` for all `files` (relative to `base`) to appear.
pub fn wait_for_files(files: &[String], base: &Path, latency: Duration) -> Result<()> {
    let deadline = Instant::now() + latency;
    loop {
        let missing: Vec<&String> = files.iter().filter(|f| !base.join(f).exists()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let list: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "Missing files after {} seconds: {}",
                    latency.as_secs(),
                    list.join(", ")
                ),
            )));
        }
        thread::sleep(FILE_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::dag::RunReason;
    use crate::workflow::value::InlineFn;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn job(exec: ExecMethod) -> Job {
        Job {
            id: 0,
            rule: "align".to_string(),
            wildcards: [("sample".to_string(), "s1".to_string())].into_iter().collect(),
            input: vec!["s1.fq".to_string(), "ref.fa".to_string()],
            output: vec!["s1.bam".to_string()],
            named_input: [("reference".to_string(), 1)].into_iter().collect(),
            named_output: BTreeMap::new(),
            log: vec!["logs/s1.log".to_string()],
            benchmark: None,
            temp_output: Vec::new(),
            subworkflow_input: BTreeMap::new(),
            params: [("mode".to_string(), "fast".to_string())].into_iter().collect(),
            resources: [("mem_mb".to_string(), Literal::Int(100))].into_iter().collect(),
            threads: 2,
            priority: 0.0,
            restart_times: 0,
            shadow: ShadowMode::None,
            exec,
            conda_env: None,
            container: None,
            env_modules: Vec::new(),
            message: None,
            version: None,
            group: None,
            is_checkpoint: false,
            is_local: false,
            basedir: None,
            dependencies: BTreeSet::new(),
            needrun: true,
            reason: RunReason::default(),
        }
    }

    fn context(dir: &TempDir) -> StepContext {
        let mut ctx = StepContext::new(dir.path());
        ctx.latency_wait = Duration::from_millis(200);
        ctx
    }

    #[test]
    fn test_render_command() {
        let job = job(ExecMethod::NoRun);
        let text = render_command(
            "bwa -t {threads} {input.reference} {input[0]} > {output} 2> {log} # {params.mode} {wildcards.sample} {resources.mem_mb} {rule} {{x}}",
            &job,
        )
        .unwrap();
        assert_eq!(
            text,
            "bwa -t 2 ref.fa s1.fq > s1.bam 2> logs/s1.log # fast s1 100 align {x}"
        );
        assert_eq!(render_command("cat {input}", &job).unwrap(), "cat s1.fq ref.fa");
    }

    #[test]
    fn test_render_unknown_placeholder_fails() {
        let job = job(ExecMethod::NoRun);
        assert!(render_command("echo {wildcards.lane}", &job).is_err());
        assert!(render_command("echo {sample}", &job).is_err());
        assert!(render_command("echo {input[5]}", &job).is_err());
    }

    #[test]
    fn test_shell_job_creates_output() {
        let dir = TempDir::new().unwrap();
        let mut job = job(ExecMethod::Shell("echo {wildcards.sample} > {output}".into()));
        job.input.clear();
        execute_job(&job, &context(&dir)).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("s1.bam")).unwrap(), "s1\n");
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_failing_command() {
        let dir = TempDir::new().unwrap();
        let job = job(ExecMethod::Shell("exit 3".into()));
        let result = execute_job(&job, &context(&dir));
        assert!(matches!(result, Err(Error::Job { .. })));
    }

    #[test]
    fn test_missing_output_fails_after_latency() {
        let dir = TempDir::new().unwrap();
        let job = job(ExecMethod::Shell("true".into()));
        let err = execute_job(&job, &context(&dir)).unwrap_err();
        assert!(err.to_string().contains("s1.bam"));
    }

    #[test]
    fn test_inline_function_job() {
        let dir = TempDir::new().unwrap();
        let func = InlineFn::new("write", |ctx: &JobContext| {
            fs::write(ctx.workdir.join(&ctx.output[0]), ctx.params["mode"].as_bytes()).map_err(|e| e.to_string())
        });
        execute_job(&job(ExecMethod::Run(func)), &context(&dir)).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("s1.bam")).unwrap(), "fast");
    }

    #[test]
    fn test_template_engine_job() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("s1.fq"), "sample={wildcards.sample} threads={threads}").unwrap();
        execute_job(&job(ExecMethod::TemplateEngine("yte".into())), &context(&dir)).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("s1.bam")).unwrap(),
            "sample=s1 threads=2"
        );
    }

    #[test]
    fn test_minimal_shadow_moves_outputs_back() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("s1.fq"), "reads").unwrap();
        fs::write(dir.path().join("ref.fa"), "ref").unwrap();
        let mut job = job(ExecMethod::Shell("cat {input} > {output}".into()));
        job.shadow = ShadowMode::Minimal;

        let ctx = context(&dir);
        execute_job(&job, &ctx).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("s1.bam")).unwrap(), "readsref");
        assert_eq!(fs::read_dir(&ctx.shadow_prefix).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[test]
    fn test_benchmark_written() {
        let dir = TempDir::new().unwrap();
        let mut job = job(ExecMethod::Shell("touch {output}".into()));
        job.benchmark = Some("bench/s1.tsv".to_string());
        execute_job(&job, &context(&dir)).unwrap();

        let text = fs::read_to_string(dir.path().join("bench/s1.tsv")).unwrap();
        assert!(text.starts_with("s\th:m:s\n"));
    }

    #[test]
    fn test_script_type_detection() {
        assert_eq!(interpreter_for(Path::new("scripts/plot.py")), Some("python"));
        assert_eq!(interpreter_for(Path::new("plot.R")), Some("Rscript --vanilla"));
        assert_eq!(interpreter_for(Path::new("plot.xyz")), None);
    }

    #[test]
    fn test_wrapper_requires_local_prefix() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        ctx.wrapper_prefix = "https://wrappers.example.org/".to_string();
        let result = execute_job(&job(ExecMethod::Wrapper("bio/bwa".into())), &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_jobs_with_same_id() {
        let workers: Vec<_> = (0..4)
            .map(|n| {
                thread::spawn(move || {
                    for round in 0..10 {
                        let dir = TempDir::new().unwrap();
                        let mut job = job(ExecMethod::Shell(format!(
                            "sleep 0.01; echo {} {} > {{output}}",
                            n, round
                        )));
                        job.input.clear();
                        execute_job(&job, &context(&dir)).unwrap();
                        let written = fs::read_to_string(dir.path().join("s1.bam")).unwrap();
                        assert_eq!(written, format!("{} {}\n", n, round));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_wait_for_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        wait_for_files(&["a.txt".to_string()], dir.path(), Duration::from_millis(10)).unwrap();

        let err = wait_for_files(&["b.txt".to_string()], dir.path(), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
