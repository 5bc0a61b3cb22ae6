//! The `plan` subcommand: dry-run staleness analysis.

use crate::cli::PlanArgs;
use crate::config::PipelineConfig;
use crate::graph;
use crate::layout::SubjectLayout;
use crate::sched::{self, PlanAction, PlanEntry};
use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct PlanOutput<'a> {
    mode: &'a str,
    tasks: &'a [PlanEntry],
}

pub fn run(args: &PlanArgs) -> Result<()> {
    let config = PipelineConfig::from_args(&args.pipeline)?;
    let layout = SubjectLayout::create(&config.root)?;
    let graph = graph::build(&config, &layout)?;
    let entries = sched::classify(&graph)?;

    if args.json {
        let output = PlanOutput {
            mode: config.mode.name(),
            tasks: &entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let stale = entries
        .iter()
        .filter(|e| e.action == PlanAction::Run)
        .count();
    println!(
        "{} mode: {} tasks, {} would run",
        config.mode.name(),
        entries.len(),
        stale
    );
    for entry in &entries {
        let marker = match entry.action {
            PlanAction::Run => "run ",
            PlanAction::SkipUpToDate => "skip",
        };
        println!("  {marker} {}", entry.label);
    }
    Ok(())
}
