//! Playbook run report parsing.
//!
//! The runner forces Ansible's JSON stdout callback, so one run produces a
//! single JSON document carrying per-play task results and a final `stats`
//! map per host. Some Ansible components print warnings on stdout before
//! that document; those lines are logged and skipped. Output with no JSON
//! document at all leaves us without recap counts, which makes the run
//! unusable and is an error.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::{BuildError, Result};

/// Final status of one task on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ok,
    Changed,
    Unreachable,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Unreachable => "unreachable",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One task outcome on one host, in playbook order.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub host: String,
    pub task: String,
    pub status: TaskStatus,
    /// Raw per-host result payload (module output, stdout/stderr, ...).
    pub detail: serde_json::Value,
}

/// Recap counters summed across all hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ok: u64,
    pub changed: u64,
    pub unreachable: u64,
    pub failed: u64,
}

/// Parsed result of one playbook run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcomes: Vec<TaskOutcome>,
    pub stats: RunStats,
}

impl RunReport {
    /// Whether any task failed.
    pub fn failed(&self) -> bool {
        self.stats.failed > 0
    }

    /// Whether the run touched anything. Unreachable hosts count as a
    /// change: the tree's state after such a run is not trustworthy enough
    /// to keep serving the previous cache entry for.
    pub fn changed_anything(&self) -> bool {
        self.stats.changed > 0 || self.stats.unreachable > 0
    }
}

#[derive(Debug, Deserialize)]
struct Document {
    stats: BTreeMap<String, HostStats>,
    #[serde(default)]
    plays: Vec<Play>,
}

#[derive(Debug, Deserialize)]
struct HostStats {
    #[serde(default)]
    ok: u64,
    #[serde(default)]
    changed: u64,
    #[serde(default)]
    unreachable: u64,
    #[serde(default)]
    failures: u64,
}

#[derive(Debug, Deserialize)]
struct Play {
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct Task {
    task: TaskMeta,
    #[serde(default)]
    hosts: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TaskMeta {
    #[serde(default)]
    name: String,
}

/// Parse the automation tool's stdout into a [`RunReport`].
pub fn parse(stdout: &str) -> Result<RunReport> {
    let mut payload = None;
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            payload = Some(&stdout[offset..]);
            break;
        }
        let noise = line.trim_end();
        if !noise.is_empty() {
            warn!(line = noise, "playbook remarks");
        }
        offset += line.len();
    }

    let Some(payload) = payload else {
        return Err(BuildError::Report(
            "no JSON payload in playbook output".to_string(),
        ));
    };

    let doc: Document = serde_json::from_str(payload)
        .map_err(|err| BuildError::Report(format!("malformed JSON payload: {err}")))?;

    let mut stats = RunStats::default();
    for host in doc.stats.values() {
        stats.ok += host.ok;
        stats.changed += host.changed;
        stats.unreachable += host.unreachable;
        stats.failed += host.failures;
    }

    let mut outcomes = Vec::new();
    for play in doc.plays {
        for task in play.tasks {
            for (host, detail) in task.hosts {
                let status = status_of(&detail);
                outcomes.push(TaskOutcome {
                    host,
                    task: task.task.name.clone(),
                    status,
                    detail,
                });
            }
        }
    }

    Ok(RunReport { outcomes, stats })
}

fn status_of(detail: &serde_json::Value) -> TaskStatus {
    let flag = |key| detail.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
    if flag("failed") {
        TaskStatus::Failed
    } else if flag("unreachable") {
        TaskStatus::Unreachable
    } else if flag("changed") {
        TaskStatus::Changed
    } else {
        TaskStatus::Ok
    }
}
