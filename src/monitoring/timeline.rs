//! Execution Timeline
//!
//! Tracks job start/end times for the Gantt chart shown after a run and
//! for the statistics file written with `--stats`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::Result;
use crate::workflow::value::Literal;

use super::resource::ResourceSummary;

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Job label
    pub step_id: String,
    pub rule: String,
    pub event_type: EventType,
    pub timestamp: Instant,
    pub wallclock: DateTime<Local>,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a job of `rule`.
    pub fn add_event(&mut self, step_id: impl Into<String>, rule: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            rule: rule.into(),
            event_type,
            timestamp: Instant::now(),
            wallclock: Local::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Generates an ASCII Gantt chart representation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut step_times: HashMap<String, (u128, u128)> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    step_times.entry(event.step_id.clone()).or_insert((elapsed, 0)).0 = elapsed;
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(times) = step_times.get_mut(&event.step_id) {
                        times.1 = elapsed;
                    }
                }
            }
        }

        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by_key(|(_, (start, _))| *start);

        for (step_id, (start, end)) in sorted_steps {
            if end > start {
                let start_pos = (start as f64 * scale) as usize;
                let duration = ((end - start) as f64 * scale).max(1.0) as usize;

                let mut bar = " ".repeat(start_pos);
                bar.push_str(&"#".repeat(duration));

                output.push_str(&format!(
                    "{:12} |{}| ({} ms)\n",
                    truncate(&step_id, 12),
                    bar,
                    end - start
                ));
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns job durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<String, u128> = HashMap::new();
        let mut durations: HashMap<String, u128> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.clone(), elapsed);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(&event.step_id) {
                        durations.insert(event.step_id.clone(), elapsed - start);
                    }
                }
            }
        }

        durations
    }

    /// Wall clock start and end of a finished job.
    pub fn span(&self, step_id: &str) -> Option<(DateTime<Local>, DateTime<Local>)> {
        let start = self
            .events
            .iter()
            .rev()
            .find(|e| e.step_id == step_id && e.event_type == EventType::Started)?;
        let end = self
            .events
            .iter()
            .rev()
            .find(|e| e.step_id == step_id && e.event_type != EventType::Started)?;
        Some((start.wallclock, end.wallclock))
    }

    /// Mean, min and max runtime in seconds of successful jobs per rule.
    pub fn rule_runtimes(&self) -> BTreeMap<String, RuleRuntime> {
        let durations = self.get_durations();
        let mut per_rule: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for event in self.events.iter().filter(|e| e.event_type == EventType::Completed) {
            if let Some(ms) = durations.get(&event.step_id) {
                per_rule
                    .entry(event.rule.clone())
                    .or_default()
                    .push(*ms as f64 / 1000.0);
            }
        }

        per_rule
            .into_iter()
            .map(|(rule, times)| {
                let mean = times.iter().sum::<f64>() / times.len() as f64;
                let min = times.iter().copied().fold(f64::INFINITY, f64::min);
                let max = times.iter().copied().fold(0.0, f64::max);
                (rule, RuleRuntime { mean, min, max })
            })
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleRuntime {
    #[serde(rename = "mean-runtime")]
    pub mean: f64,
    #[serde(rename = "min-runtime")]
    pub min: f64,
    #[serde(rename = "max-runtime")]
    pub max: f64,
}

/// Timing of one produced file.
#[derive(Debug, Clone, Serialize)]
pub struct FileStats {
    #[serde(rename = "start-time")]
    pub start_time: String,
    #[serde(rename = "stop-time")]
    pub stop_time: String,
    pub duration: f64,
    pub priority: f64,
    pub resources: BTreeMap<String, Literal>,
}

/// Content of the `--stats` file.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub total_runtime: f64,
    pub rules: BTreeMap<String, RuleRuntime>,
    pub files: BTreeMap<String, FileStats>,
    pub resources: Option<ResourceSummary>,
}

impl RunStats {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
