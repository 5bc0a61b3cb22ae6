//! CLI argument parsing for the pipeline driver.
//!
//! The CLI is intentionally thin: flags map one-to-one onto the pipeline
//! configuration and carry no policy of their own. Mutually exclusive
//! selections are declared here and re-checked during configuration so the
//! rules hold for non-CLI callers too.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "wmlpipe",
    version,
    about = "Per-subject white-matter-lesion MRI pipeline driver",
    after_help = "Examples:\n  wmlpipe run --root /data/subj01 --t1 t1.nii --flair flair.nii --simple\n  wmlpipe run --root /data/subj01 --t1 t1.nii --flair flair.nii --model-dir /models\n  wmlpipe plan --root /data/subj01 --t1 t1.nii --flair flair.nii --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Emit debug-level logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the task graph and execute every stale task
    Run(RunArgs),
    /// Build the task graph and report what would run, without executing
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Emit the plan as machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

/// Pipeline inputs shared by `run` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Subject output root directory
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// T1 image (mandatory primary sequence)
    #[arg(long, value_name = "FILE")]
    pub t1: PathBuf,

    /// FLAIR image
    #[arg(long, value_name = "FILE")]
    pub flair: Option<PathBuf>,

    /// T2 image
    #[arg(long, value_name = "FILE")]
    pub t2: Option<PathBuf>,

    /// PD image
    #[arg(long, value_name = "FILE")]
    pub pd: Option<PathBuf>,

    /// Calculation space, the frame all native processing happens in
    #[arg(long, value_name = "SPACE", default_value = "T1")]
    pub calc_space: String,

    /// Precomputed brain mask to import instead of running brain extraction
    #[arg(
        long,
        value_name = "FILE",
        requires = "brain_mask_space",
        conflicts_with = "import_seg"
    )]
    pub brain_mask: Option<PathBuf>,

    /// Space the imported brain mask lives in
    #[arg(long, value_name = "SPACE")]
    pub brain_mask_space: Option<String>,

    /// Externally computed segmentation directory (expects mri/rawavg.mgz
    /// and mri/aseg.mgz); short-circuits extraction and tissue segmentation
    #[arg(long, value_name = "DIR")]
    pub import_seg: Option<PathBuf>,

    /// Trained-model directory; selects test mode
    #[arg(long, value_name = "DIR", conflicts_with = "simple")]
    pub model_dir: Option<PathBuf>,

    /// Stop after model-free scoring
    #[arg(long)]
    pub simple: bool,

    /// Assume sequences are already co-registered; intra-subject transforms
    /// are imported as identities instead of computed
    #[arg(long)]
    pub pre_registered: bool,

    /// Mask evidently normal white matter out of the model-free score
    #[arg(long)]
    pub trim_evident: bool,

    /// Radius of the local histogram in millimeters
    #[arg(long, value_name = "MM", default_value_t = 1.0)]
    pub radius: f64,

    /// Relative brightness/darkness of WML; higher spread, smaller lesions
    #[arg(long, value_name = "F", default_value_t = 2.0)]
    pub spread: f64,

    /// Number of histogram levels to evaluate
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub levels: u32,

    /// Standard atlas data directory (default: $WMLPIPE_DATA_DIR)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the toolkit binaries (default: $WMLPIPE_TOOLKIT_DIR)
    #[arg(long, value_name = "DIR")]
    pub toolkit_dir: Option<PathBuf>,
}
