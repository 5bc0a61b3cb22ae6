use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod graph;
mod layout;
mod modality;
mod plan;
mod sched;
mod task;
mod toolkit;

use cli::{Command, RootArgs, RunArgs};
use config::PipelineConfig;
use layout::SubjectLayout;
use toolkit::ToolEnv;

fn main() -> Result<()> {
    let args = RootArgs::parse();
    init_tracing(args.verbose);
    match &args.command {
        Command::Run(run) => cmd_run(run),
        Command::Plan(plan_args) => plan::run(plan_args),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = PipelineConfig::from_args(&args.pipeline)?;
    let layout = SubjectLayout::create(&config.root)?;
    let graph = graph::build(&config, &layout)?;
    let env = ToolEnv::resolve(args.pipeline.toolkit_dir.clone())?;

    let journal = layout.report("run", "inflight.json")?;
    let report = sched::execute(&graph, &env, &journal)?;
    let report_path = layout.report("run", "run.json")?;
    report.write(&report_path)?;
    info!(
        ran = report.ran,
        skipped = report.skipped,
        failed = report.failed,
        unreached = report.unreached,
        "pipeline finished"
    );
    if !report.success {
        bail!(
            "pipeline did not produce all terminal artifacts (see {})",
            report_path.display()
        );
    }
    Ok(())
}
