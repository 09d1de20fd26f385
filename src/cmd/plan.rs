//! Graph preview: `containment plan`.

use anyhow::{Context, Result};
use console::style;
use containment::input::SequenceSource;
use containment::logging::{self, LogOptions};
use containment::pipeline::{Pipeline, RunPlan};
use containment::ui::progress::format_memory;

use super::super::{Cli, RunArgs};

pub fn cmd_plan(cli: &Cli, args: &RunArgs, json: bool) -> Result<()> {
    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        quiet_console: true,
        file: None,
    })?;

    let config = super::load_config(cli, args, false)?;
    let plan = Pipeline::new(config).plan()?;

    if json {
        let out = serde_json::to_string_pretty(&plan).context("Failed to serialize plan")?;
        println!("{}", out);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn source_line(source: &SequenceSource) -> String {
    let kind = if source.is_presketched() {
        "sketch"
    } else {
        "sequences"
    };
    format!(
        "{} ({}) {}",
        style(&source.id).yellow(),
        kind,
        style(source.path.display()).dim()
    )
}

fn print_plan(plan: &RunPlan) {
    println!();
    println!("{}", style("Containment Run Plan").bold().cyan());
    println!("────────────────────");
    println!("Reference: {}", source_line(&plan.inputs.reference));
    println!("Samples: {}", plan.inputs.samples.len());
    for sample in &plan.inputs.samples {
        println!("  {}", source_line(sample));
    }

    let reference = plan.graph.reference_sketch();
    let origin = match reference.producer.and_then(|i| plan.graph.node(i)) {
        Some(node) => format!("built by {}", node.id),
        None => "supplied".to_string(),
    };
    println!(
        "Reference sketch: {} ({})",
        style(reference.path.display()).dim(),
        origin
    );

    println!();
    println!("{}", style("Branches:").underlined());
    for sample in plan.graph.samples() {
        let stages: Vec<&str> = plan
            .graph
            .branch(sample)
            .iter()
            .map(|n| n.stage.as_str())
            .collect();
        println!("  {}: {}", style(sample).yellow(), stages.join(" -> "));
    }

    println!();
    println!(
        "{} nodes in {} waves",
        style(plan.graph.len()).yellow().bold(),
        style(plan.waves.len()).yellow().bold()
    );
    for (i, wave) in plan.waves.iter().enumerate() {
        let parallel = if wave.len() > 1 {
            format!(" {}", style("(parallel)").dim())
        } else {
            String::new()
        };
        println!("  Wave {}: [{}]{}", style(i).cyan(), wave.join(", "), parallel);
    }

    println!();
    println!("{}", style("Nodes:").underlined());
    for node in plan.graph.nodes() {
        let deps: Vec<&str> = plan
            .graph
            .dependencies(node.index)
            .iter()
            .filter_map(|&i| plan.graph.node(i))
            .map(|n| n.id.as_str())
            .collect();
        let retry = if node.retryable {
            format!(", up to {} attempts", node.max_attempts)
        } else {
            String::new()
        };
        println!(
            "  {} [{} cpus, {}{}]",
            style(&node.id).green(),
            node.resources.cpus,
            format_memory(node.resources.memory_mb),
            retry
        );
        if !deps.is_empty() {
            println!("      after: {}", style(deps.join(", ")).dim());
        }
        for output in &node.outputs {
            println!("      -> {}", style(output.path.display()).dim());
        }
    }
    println!();
}
