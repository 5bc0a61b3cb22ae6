//! External tool adapter.
//!
//! Every image operation is delegated to an external binary: the WML toolkit
//! executables, a handful of FSL utilities, and `mri_convert`. Only commands
//! on the allow-list can be invoked; anything else is a programming error
//! surfaced before a process is spawned. Invocations run synchronously with
//! captured output and a logged wall-clock duration.

use crate::task::ToolCall;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info};

/// Executables shipped with the WML toolkit.
const TOOLKIT_COMMANDS: [&str; 13] = [
    "linRegister",
    "resample",
    "resampleVector",
    "inhomogeneity",
    "brainExtraction",
    "extractCSF",
    "separateWG",
    "refineBTS",
    "modelFree",
    "localFeature",
    "relabel",
    "combine",
    "ks",
];

/// FSL utilities the pipeline relies on.
const FSL_COMMANDS: [&str; 4] = ["fslchfiletype", "fslreorient2std", "fslmaths", "fslstats"];

/// Prefix some distributions put on FSL binaries.
const FSL_PREFIX: &str = "fsl5.0-";

pub const TOOLKIT_DIR_VAR: &str = "WMLPIPE_TOOLKIT_DIR";
pub const FSL_DIR_VAR: &str = "WMLPIPE_FSL_DIR";
pub const WRAPPER_VAR: &str = "WMLPIPE_TOOL_WRAPPER";

/// Where to find external binaries, resolved once per invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolEnv {
    pub toolkit_dir: Option<PathBuf>,
    pub fsl_dir: Option<PathBuf>,
    pub wrapper: Vec<String>,
}

impl ToolEnv {
    /// Resolve from an explicit flag and the process environment.
    pub fn resolve(toolkit_dir: Option<PathBuf>) -> Result<Self> {
        let toolkit_dir = toolkit_dir.or_else(|| env::var_os(TOOLKIT_DIR_VAR).map(PathBuf::from));
        let fsl_dir = env::var_os(FSL_DIR_VAR).map(PathBuf::from);
        let wrapper = match env::var(WRAPPER_VAR) {
            Ok(raw) => shell_words::split(&raw)
                .with_context(|| format!("failed to parse {WRAPPER_VAR}"))?,
            Err(_) => Vec::new(),
        };
        Ok(Self {
            toolkit_dir,
            fsl_dir,
            wrapper,
        })
    }

    fn resolve_program(&self, program: &str) -> Result<OsString> {
        if TOOLKIT_COMMANDS.contains(&program) {
            if let Some(dir) = &self.toolkit_dir {
                let candidate = dir.join(program);
                if candidate.is_file() {
                    return Ok(candidate.into_os_string());
                }
            }
            return which::which(program)
                .map(PathBuf::into_os_string)
                .map_err(|_| {
                    anyhow!(
                        "toolkit command {program} not found (set {TOOLKIT_DIR_VAR} or add it to PATH)"
                    )
                });
        }
        if FSL_COMMANDS.contains(&program) {
            let prefixed = format!("{FSL_PREFIX}{program}");
            if let Some(dir) = &self.fsl_dir {
                for name in [program, prefixed.as_str()] {
                    let candidate = dir.join(name);
                    if candidate.is_file() {
                        return Ok(candidate.into_os_string());
                    }
                }
            }
            if let Ok(found) = which::which(program) {
                return Ok(found.into_os_string());
            }
            return which::which(&prefixed)
                .map(PathBuf::into_os_string)
                .map_err(|_| {
                    anyhow!("FSL command {program} not found (tried {program} and {prefixed})")
                });
        }
        if program == "mri_convert" {
            return which::which(program)
                .map(PathBuf::into_os_string)
                .map_err(|_| anyhow!("mri_convert not found on PATH"));
        }
        bail!("command {program} is not on the tool allow-list")
    }

    /// Run one tool synchronously, capturing its output.
    pub fn invoke(&self, call: &ToolCall) -> Result<()> {
        let resolved = self.resolve_program(&call.program)?;
        let mut command = if let Some((head, rest)) = self.wrapper.split_first() {
            let mut c = Command::new(head);
            c.args(rest).arg(&resolved);
            c
        } else {
            Command::new(&resolved)
        };
        command.args(&call.args);
        debug!(tool = %call.program, args = ?call.args, "invoking");

        let started = Instant::now();
        let output = command
            .output()
            .with_context(|| format!("failed to spawn {}", call.program))?;
        let elapsed = started.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {} after {:.1?}: {}",
                call.program,
                output.status,
                elapsed,
                stderr.trim()
            );
        }
        info!(tool = %call.program, elapsed_ms = elapsed.as_millis() as u64, "tool finished");
        if let Some(path) = &call.stdout_to {
            fs::write(path, &output.stdout).with_context(|| {
                format!("failed to write captured output to {}", path.display())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "toolkit_tests.rs"]
mod tests;
