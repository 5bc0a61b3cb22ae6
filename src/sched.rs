//! Sequential scheduler and executor.
//!
//! Tasks run in topological order. A task is skipped when every declared
//! output exists and is at least as new as every declared input, and no
//! predecessor ran earlier in the same invocation. Freshness is judged by
//! modification time only; content changes that preserve mtimes are not
//! detected. On failure the task's outputs are removed so a later run never
//! trusts a half-written artifact, its transitive dependents are marked
//! unreached, and independent branches keep going.
//!
//! Interruption is handled through an on-disk journal: the outputs of the
//! task about to run are recorded before it starts and the record is cleared
//! once it finishes. A run that finds a leftover record purges those outputs
//! before judging freshness, so a task killed mid-write is re-executed
//! rather than skipped on the strength of a fresh mtime.

use crate::graph::PipelineGraph;
use crate::task::{Step, Task};
use crate::toolkit::ToolEnv;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    SkippedUpToDate,
    RanSucceeded,
    RanFailed,
    Unreached,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub label: String,
    pub status: TaskStatus,
}

/// Machine-readable account of one invocation.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub tasks: Vec<TaskReport>,
    pub ran: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unreached: usize,
    pub success: bool,
}

impl RunReport {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write run report {}", path.display()))?;
        Ok(())
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Whether a task's outputs all exist and none is older than any input.
/// A task without outputs is trivially up to date.
pub fn up_to_date(task: &Task) -> bool {
    let mut oldest_output = None;
    for output in &task.outputs {
        match mtime(output) {
            None => return false,
            Some(t) => {
                oldest_output = Some(oldest_output.map_or(t, |o: SystemTime| o.min(t)));
            }
        }
    }
    let Some(oldest_output) = oldest_output else {
        return true;
    };
    for input in &task.inputs {
        match mtime(input) {
            None => return false,
            Some(t) if t > oldest_output => return false,
            Some(_) => {}
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanAction {
    Run,
    SkipUpToDate,
}

#[derive(Debug, Serialize)]
pub struct PlanEntry {
    pub label: String,
    pub action: PlanAction,
}

/// Predicted per-task work for this configuration, staleness propagated
/// through the dependency edges. Listed in execution order.
pub fn classify(graph: &PipelineGraph) -> Result<Vec<PlanEntry>> {
    let order = graph.topo_order()?;
    let mut stale = vec![false; graph.tasks().len()];
    let mut entries = Vec::with_capacity(order.len());
    for id in &order {
        let task = graph.task(*id);
        let dep_stale = graph.dependencies(task).iter().any(|d| stale[d.0]);
        stale[id.0] = dep_stale || !up_to_date(task);
        entries.push(PlanEntry {
            label: task.label.clone(),
            action: if stale[id.0] {
                PlanAction::Run
            } else {
                PlanAction::SkipUpToDate
            },
        });
    }
    Ok(entries)
}

/// On-disk record of the task currently executing.
#[derive(Debug, Serialize, Deserialize)]
struct InflightTask {
    label: String,
    outputs: Vec<PathBuf>,
}

/// Purge the outputs recorded by a run that never finished its task.
fn recover_interrupted(journal: &Path) -> Result<()> {
    if !journal.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(journal)
        .with_context(|| format!("failed to read journal {}", journal.display()))?;
    let inflight: InflightTask = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse journal {}", journal.display()))?;
    warn!(task = %inflight.label, "previous run was interrupted; purging its outputs");
    for output in &inflight.outputs {
        if output.exists() {
            fs::remove_file(output).with_context(|| {
                format!("failed to remove interrupted output {}", output.display())
            })?;
        }
    }
    fs::remove_file(journal)
        .with_context(|| format!("failed to clear journal {}", journal.display()))?;
    Ok(())
}

fn purge_outputs(task: &Task) {
    for output in &task.outputs {
        if output.exists() {
            if let Err(err) = fs::remove_file(output) {
                error!(
                    output = %output.display(),
                    %err,
                    "failed to remove output of failed task"
                );
            }
        }
    }
}

fn run_task(task: &Task, env: &ToolEnv) -> Result<()> {
    for step in &task.steps {
        match step {
            Step::Run(call) => env.invoke(call)?,
            Step::Copy { from, to } => {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
            }
        }
    }
    Ok(())
}

/// Run the whole graph, sequentially, honoring freshness. `journal` is the
/// in-flight record used to recover from an interrupted previous run.
pub fn execute(graph: &PipelineGraph, env: &ToolEnv, journal: &Path) -> Result<RunReport> {
    recover_interrupted(journal)?;
    let order = graph.topo_order()?;
    let count = graph.tasks().len();
    let mut status: Vec<Option<TaskStatus>> = vec![None; count];
    let mut ran_this_run = vec![false; count];

    for id in order {
        let task = graph.task(id);
        let deps = graph.dependencies(task);
        let blocked = deps.iter().any(|d| {
            matches!(
                status[d.0],
                Some(TaskStatus::RanFailed) | Some(TaskStatus::Unreached)
            )
        });
        if blocked {
            debug!(task = %task.label, "unreached: a dependency failed");
            status[id.0] = Some(TaskStatus::Unreached);
            continue;
        }
        let predecessor_ran = deps.iter().any(|d| ran_this_run[d.0]);
        if !predecessor_ran && up_to_date(task) {
            debug!(task = %task.label, "up to date");
            status[id.0] = Some(TaskStatus::SkippedUpToDate);
            continue;
        }
        info!(task = %task.label, "running");
        let inflight = InflightTask {
            label: task.label.clone(),
            outputs: task.outputs.clone(),
        };
        fs::write(journal, serde_json::to_string(&inflight)?)
            .with_context(|| format!("failed to write journal {}", journal.display()))?;
        match run_task(task, env) {
            Ok(()) => {
                ran_this_run[id.0] = true;
                status[id.0] = Some(TaskStatus::RanSucceeded);
            }
            Err(err) => {
                error!(task = %task.label, err = format!("{err:#}"), "task failed");
                purge_outputs(task);
                status[id.0] = Some(TaskStatus::RanFailed);
            }
        }
        fs::remove_file(journal)
            .with_context(|| format!("failed to clear journal {}", journal.display()))?;
    }

    let tasks: Vec<TaskReport> = graph
        .tasks()
        .iter()
        .map(|task| TaskReport {
            label: task.label.clone(),
            status: status[task.id.0].unwrap_or(TaskStatus::Unreached),
        })
        .collect();
    let count_of = |wanted: TaskStatus| tasks.iter().filter(|t| t.status == wanted).count();
    let success = graph.terminals().iter().all(|terminal| {
        graph.producer(terminal).is_some_and(|id| {
            matches!(
                status[id.0],
                Some(TaskStatus::RanSucceeded) | Some(TaskStatus::SkippedUpToDate)
            )
        })
    });
    Ok(RunReport {
        ran: count_of(TaskStatus::RanSucceeded),
        skipped: count_of(TaskStatus::SkippedUpToDate),
        failed: count_of(TaskStatus::RanFailed),
        unreached: count_of(TaskStatus::Unreached),
        success,
        tasks,
    })
}

#[cfg(test)]
#[path = "sched_tests.rs"]
mod tests;
