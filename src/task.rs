//! Task model: the unit of work scheduled over the artifact namespace.
//!
//! A task declares its input and output paths up front; the scheduler derives
//! every ordering from those declarations plus the explicit `after` list
//! (used only for constraints that shared artifacts cannot express). Steps
//! are plain data rather than closures so `wmlpipe plan` can render exactly
//! what a task would invoke.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Index of a task inside its graph; stable for one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(pub usize);

/// One external invocation, arguments already coerced to text.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub program: String,
    pub args: Vec<String>,
    /// Capture stdout into this file on success. Used only where a command's
    /// sole purpose is to emit text consumed as a report body; exit status
    /// remains the success signal everywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_to: Option<PathBuf>,
}

impl ToolCall {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdout_to: None,
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn capture_stdout(mut self, path: PathBuf) -> Self {
        self.stdout_to = Some(path);
        self
    }
}

/// A single action within a task.
#[derive(Debug, Clone, Serialize)]
pub enum Step {
    Run(ToolCall),
    /// Plain file copy, used to import the identity transform when sequences
    /// are declared pre-registered.
    Copy { from: PathBuf, to: PathBuf },
}

/// A unit of work with declared inputs, declared outputs, and explicit
/// predecessors. Re-running a task has no side effect beyond overwriting its
/// declared outputs.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub after: Vec<TaskId>,
    pub steps: Vec<Step>,
}

/// Conversion of call arguments to the positional text form the external
/// toolkit expects.
pub trait ToArg {
    fn to_arg(&self) -> String;
}

impl ToArg for &str {
    fn to_arg(&self) -> String {
        (*self).to_string()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> String {
        self.clone()
    }
}

impl ToArg for &Path {
    fn to_arg(&self) -> String {
        self.display().to_string()
    }
}

impl ToArg for &PathBuf {
    fn to_arg(&self) -> String {
        self.display().to_string()
    }
}

impl ToArg for PathBuf {
    fn to_arg(&self) -> String {
        self.display().to_string()
    }
}

impl ToArg for u32 {
    fn to_arg(&self) -> String {
        self.to_string()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> String {
        // Integral values render without a trailing ".0" to match the
        // positional contract the toolkit binaries were written against.
        if self.fract() == 0.0 && self.is_finite() {
            format!("{}", *self as i64)
        } else {
            format!("{self}")
        }
    }
}
