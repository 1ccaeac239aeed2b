//! RuleRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Produce the default target
//! rulerunner workflow.yaml
//!
//! # Produce specific files with 8 cores
//! rulerunner workflow.yaml results/a.txt results/b.txt --cores 8
//!
//! # Dry run mode (list the jobs that would run)
//! rulerunner workflow.yaml --dry-run
//!
//! # Print the rule graph
//! rulerunner workflow.yaml --rulegraph | dot -Tsvg > rules.svg
//!
//! # Remove a stale lock
//! rulerunner workflow.yaml --unlock
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use rulerunner::execution::{ChangeKind, Collaborators, Executor, ExecuteRequest, Inspection, Orchestrator};
use rulerunner::workflow::parser::load_workflow;
use rulerunner::workflow::subworkflow::DEFAULT_DEFINITION_FILE;
use rulerunner::workflow::{RerunTrigger, ResourceValue, WorkflowSettings};
use rulerunner::{APP_NAME, VERSION};

/// Registry-level listings answered without building a graph.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Listing {
    Rules,
    TargetRules,
    Resources,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    working_dir: Option<PathBuf>,
    verbose: bool,
    listing: Option<Listing>,
    settings: WorkflowSettings,
    request: ExecuteRequest,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_DEFINITION_FILE.to_string(),
            working_dir: None,
            verbose: false,
            listing: None,
            settings: WorkflowSettings::default(),
            request: ExecuteRequest::default(),
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Rule-Based Workflow Execution Engine");
    eprintln!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: rulerunner [OPTIONS] <WORKFLOW_FILE> [TARGETS...]");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>              Path to workflow YAML file");
    println!("  [TARGETS...]                 Files or rules to produce (default: the default target)");
    println!();
    println!("Execution:");
    println!("  --cores N, -c N              Number of cores to use (default: all)");
    println!("  --dry-run, -n                List the jobs that would run");
    println!("  --touch, -t                  Touch outputs instead of running jobs");
    println!("  --working-dir PATH           Set working directory for file operations");
    println!("  --keep-going, -k             Run independent jobs after a failure");
    println!("  --forcerun, -R TARGETS...    Force the given rules or files to run");
    println!("  --forceall, -F               Force all jobs to run");
    println!("  --force, -f                  Force the target jobs to run");
    println!("  --until, -U TARGETS...       Run only up to the given rules or files");
    println!("  --omit-from, -O TARGETS...   Skip the given rules or files and everything after them");
    println!("  --prioritize, -P TARGETS...  Run jobs for these targets first");
    println!("  --allowed-rules RULES...     Only use the given rules");
    println!("  --nodeps                     Do not resolve dependencies");
    println!("  --ignore-incomplete          Do not rerun incomplete outputs");
    println!("  --rerun-triggers KINDS...    mtime, params, input, software-env, code");
    println!("  --restart-times N            Retries of failed jobs");
    println!("  --max-jobs N                 Maximum number of concurrent jobs");
    println!("  --max-jobs-per-second N      Maximum number of job starts per second");
    println!("  --latency-wait SECONDS       Wait for output files (default: 5)");
    println!("  --wait-for-files FILES...    Wait for these files before starting");
    println!("  --immediate-submit           Submit all jobs at once");
    println!("  --cluster CMD                Submit jobs through a cluster command");
    println!("  --printshellcmds, -p         Print shell commands");
    println!("  --reason, -r                 Print why jobs run");
    println!("  --stats FILE                 Write run statistics as JSON");
    println!();
    println!("Configuration:");
    println!("  --config KEY=VALUE...        Override config values");
    println!("  --configfile FILES...        Additional config files");
    println!("  --resources NAME=N...        Global resource limits");
    println!("  --set-threads RULE=N...      Override threads of rules");
    println!("  --set-resources RULE:NAME=V...  Override resources of rules");
    println!("  --cache [RULES...]           Cache outputs of rules");
    println!("  --use-conda                  Run jobs in their conda environments");
    println!("  --conda-prefix DIR           Directory for conda environments");
    println!("  --conda-create-envs-only     Only create conda environments");
    println!("  --list-conda-envs            List conda environments and their locations");
    println!("  --conda-cleanup-envs         Remove conda environments no longer used");
    println!("  --use-singularity            Run jobs in their containers");
    println!("  --singularity-prefix DIR     Directory for container images");
    println!("  --cleanup-containers         Remove container images no longer used");
    println!("  --use-envmodules             Load environment modules");
    println!("  --wrapper-prefix DIR         Location of rule wrappers");
    println!();
    println!("State:");
    println!("  --unlock                     Remove a stale lock");
    println!("  --nolock                     Do not lock the working directory");
    println!("  --cleanup-metadata FILES...  Remove recorded metadata of files");
    println!("  --cleanup-shadow             Remove shadow directories");
    println!();
    println!("Inspection:");
    println!("  --list, -l                   List rules");
    println!("  --list-target-rules          List rules usable as targets");
    println!("  --list-resources             List user resources");
    println!("  --summary, -S                Print output file status");
    println!("  --detailed-summary, -D       Print output file status with inputs and commands");
    println!("  --dag                        Print the job graph (graphviz)");
    println!("  --rulegraph                  Print the rule graph (graphviz)");
    println!("  --filegraph                  Print the file graph (graphviz)");
    println!("  --d3dag                      Print the job graph as JSON");
    println!("  --list-version-changes       Outputs created with another rule version");
    println!("  --list-code-changes          Outputs created with other code");
    println!("  --list-input-changes         Outputs created from other inputs");
    println!("  --list-params-changes        Outputs created with other params");
    println!("  --list-untracked             Files not used by the workflow");
    println!("  --archive FILE               Archive the workflow (.tar, .tar.gz)");
    println!("  --delete-all-output          Delete all outputs");
    println!("  --delete-temp-output         Delete temporary outputs");
    println!("  --containerize               Print a Dockerfile for the conda environments");
    println!();
    println!("  --verbose, -v                Enable debug logging");
    println!("  --help, -h                   Show this help message");
    println!("  --version, -V                Show version information");
    println!();
    println!("Examples:");
    println!("  rulerunner workflow.yaml");
    println!("  rulerunner workflow.yaml results/summary.txt --cores 8");
    println!("  rulerunner workflow.yaml --dry-run --reason");
}

/// Returns the value following a flag.
fn value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Returns all values following a flag up to the next option.
fn values(args: &[String], i: &mut usize) -> Vec<String> {
    let mut collected = Vec::new();
    while let Some(next) = args.get(*i + 1) {
        if next.starts_with('-') {
            break;
        }
        collected.push(next.clone());
        *i += 1;
    }
    collected
}

fn number<T: std::str::FromStr>(text: &str, flag: &str) -> Result<T, String> {
    text.parse()
        .map_err(|_| format!("Invalid {} value: {}", flag, text))
}

/// Splits `key=value`.
fn key_value<'a>(text: &'a str, flag: &str) -> Result<(&'a str, &'a str), String> {
    text.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("{} expects KEY=VALUE, got '{}'", flag, text))
}

fn resource_value(text: &str) -> ResourceValue {
    match text.parse::<i64>() {
        Ok(n) => ResourceValue::Int(n),
        Err(_) => ResourceValue::Str(text.to_string()),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = args[i].as_str();
        let settings = &mut config.settings;
        let request = &mut config.request;

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--working-dir" | "-d" => {
                let dir = PathBuf::from(value(args, &mut i, arg)?);
                settings.overwrite_workdir = Some(dir.clone());
                config.working_dir = Some(dir);
            }
            "--cores" | "-c" | "--jobs" | "-j" => {
                let cores = value(args, &mut i, arg)?;
                let cores = if cores == "all" {
                    num_cpus::get() as i64
                } else {
                    number(&cores, arg)?
                };
                settings.set_cores(cores);
            }
            "--dry-run" | "-n" => request.dryrun = true,
            "--touch" | "-t" => request.touch = true,
            "--keep-going" | "-k" => request.keepgoing = true,
            "--forcerun" | "-R" => {
                request.forcerun = values(args, &mut i);
            }
            "--forceall" | "-F" => request.forceall = true,
            "--force" | "-f" => request.forcetargets = true,
            "--until" | "-U" => request.until = values(args, &mut i),
            "--omit-from" | "-O" => request.omit_from = values(args, &mut i),
            "--prioritize" | "-P" => request.prioritytargets = values(args, &mut i),
            "--allowed-rules" => request.allowed_rules = Some(values(args, &mut i)),
            "--nodeps" => request.nodeps = true,
            "--ignore-incomplete" => request.ignore_incomplete = true,
            "--rerun-triggers" => {
                let mut triggers = std::collections::BTreeSet::new();
                for kind in values(args, &mut i) {
                    let trigger = RerunTrigger::parse(&kind)
                        .ok_or_else(|| format!("Unknown rerun trigger: {}", kind))?;
                    triggers.insert(trigger);
                }
                settings.rerun_triggers = triggers;
            }
            "--restart-times" | "--retries" => {
                settings.restart_times = number(&value(args, &mut i, arg)?, arg)?;
            }
            "--max-jobs" => request.max_jobs = Some(number(&value(args, &mut i, arg)?, arg)?),
            "--max-jobs-per-second" => {
                request.max_jobs_per_second = Some(number(&value(args, &mut i, arg)?, arg)?);
            }
            "--latency-wait" | "-w" => {
                settings.latency_wait = number(&value(args, &mut i, arg)?, arg)?;
            }
            "--wait-for-files" => request.wait_for_files = values(args, &mut i),
            "--immediate-submit" => settings.immediate_submit = true,
            "--cluster" => {
                request.executor = Executor::Cluster {
                    submit: value(args, &mut i, arg)?,
                };
                settings.run_local = false;
            }
            "--printshellcmds" | "-p" => request.printshellcmds = true,
            "--reason" | "-r" => request.printreason = true,
            "--stats" => request.stats = Some(PathBuf::from(value(args, &mut i, arg)?)),
            "--config" | "-C" => {
                for item in values(args, &mut i) {
                    let (key, val) = key_value(&item, arg)?;
                    settings.add_config_override(key, val);
                }
            }
            "--configfile" | "--configfiles" => {
                settings
                    .overwrite_configfiles
                    .extend(values(args, &mut i).into_iter().map(PathBuf::from));
            }
            "--resources" => {
                for item in values(args, &mut i) {
                    let (name, val) = key_value(&item, arg)?;
                    settings.global_resources.insert(name.to_string(), number(val, arg)?);
                }
            }
            "--set-threads" => {
                for item in values(args, &mut i) {
                    let (rule, val) = key_value(&item, arg)?;
                    settings.overwrite_threads.insert(rule.to_string(), number(val, arg)?);
                }
            }
            "--set-resources" => {
                for item in values(args, &mut i) {
                    let (target, val) = key_value(&item, arg)?;
                    let (rule, resource) = target
                        .split_once(':')
                        .ok_or_else(|| format!("{} expects RULE:RESOURCE=VALUE, got '{}'", arg, item))?;
                    settings
                        .overwrite_resources
                        .entry(rule.to_string())
                        .or_default()
                        .insert(resource.to_string(), resource_value(val));
                }
            }
            "--cache" => {
                settings.enable_cache = true;
                settings.cache_rules.extend(values(args, &mut i));
            }
            "--use-conda" => settings.use_conda = true,
            "--conda-prefix" => settings.conda_prefix = Some(PathBuf::from(value(args, &mut i, arg)?)),
            "--conda-create-envs-only" => {
                settings.use_conda = true;
                request.conda_create_envs_only = true;
            }
            "--list-conda-envs" => request.list_conda_envs = true,
            "--conda-cleanup-envs" => request.conda_cleanup_envs = true,
            "--cleanup-containers" => request.cleanup_containers = true,
            "--use-singularity" => settings.use_singularity = true,
            "--singularity-prefix" => {
                settings.singularity_prefix = Some(PathBuf::from(value(args, &mut i, arg)?));
            }
            "--use-envmodules" => settings.use_env_modules = true,
            "--wrapper-prefix" => settings.wrapper_prefix = value(args, &mut i, arg)?,
            "--unlock" => request.unlock = true,
            "--nolock" => request.nolock = true,
            "--cleanup-metadata" | "--cm" => request.cleanup_metadata = values(args, &mut i),
            "--cleanup-shadow" => request.cleanup_shadow = true,
            "--list" | "-l" => config.listing = Some(Listing::Rules),
            "--list-target-rules" | "--lt" => config.listing = Some(Listing::TargetRules),
            "--list-resources" => config.listing = Some(Listing::Resources),
            "--summary" | "-S" => request.inspection = Some(Inspection::Summary),
            "--detailed-summary" | "-D" => request.inspection = Some(Inspection::DetailedSummary),
            "--dag" => request.inspection = Some(Inspection::Dag),
            "--rulegraph" => request.inspection = Some(Inspection::RuleGraph),
            "--filegraph" => request.inspection = Some(Inspection::FileGraph),
            "--d3dag" => request.inspection = Some(Inspection::D3Dag),
            "--list-version-changes" | "--lv" => {
                request.inspection = Some(Inspection::Changes(ChangeKind::Version));
            }
            "--list-code-changes" | "--lc" => request.inspection = Some(Inspection::Changes(ChangeKind::Code)),
            "--list-input-changes" | "--li" => request.inspection = Some(Inspection::Changes(ChangeKind::Input)),
            "--list-params-changes" | "--lp" => {
                request.inspection = Some(Inspection::Changes(ChangeKind::Params));
            }
            "--list-untracked" | "--lu" => request.inspection = Some(Inspection::Untracked),
            "--archive" => {
                request.inspection = Some(Inspection::Archive(PathBuf::from(value(args, &mut i, arg)?)));
            }
            "--delete-all-output" => request.inspection = Some(Inspection::DeleteAllOutput),
            "--delete-temp-output" => request.inspection = Some(Inspection::DeleteTempOutput),
            "--containerize" => request.containerize = true,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.workflow_path = arg.to_string(),
                    _ => request.targets.push(arg.to_string()),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Validates the working directory; relative paths are kept as given.
fn check_working_directory(working_dir: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        info!("Working directory: {}", env::current_dir()?.display());
        return Ok(());
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    info!("Working directory: {}", dir.display());
    Ok(())
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.request.dryrun {
        info!("Mode: DRY RUN (jobs will not execute)");
    }

    check_working_directory(config.working_dir.as_ref())?;

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let registry = load_workflow(&config.workflow_path, config.settings).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    info!("Workflow loaded: {} rules", registry.len());

    if let Some(listing) = config.listing {
        match listing {
            Listing::Rules | Listing::TargetRules => {
                for rule in registry.list_rules(listing == Listing::TargetRules) {
                    println!("{}", rule.name);
                    if let Some(doc) = &rule.docstring {
                        println!("    {}", doc);
                    }
                }
            }
            Listing::Resources => {
                for resource in registry.list_resources() {
                    println!("{}", resource);
                }
            }
        }
        return Ok(true);
    }

    let mut orchestrator = Orchestrator::new(registry, env::current_dir()?, Collaborators::builtin());
    let outcome = orchestrator.execute(&config.request)?;
    Ok(outcome.success)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => {
            eprintln!("{}", "Workflow finished successfully".green().bold());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!();
            eprintln!("{}", "Workflow finished with errors".red().bold());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
