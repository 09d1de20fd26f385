//! Run progress display.
//!
//! Consumes [`NodeEvent`]s from the executor and renders them in one of
//! three modes:
//! - `full`: progress bars per running node plus an overall bar
//! - `minimal`: one line per finished node
//! - `json`: one JSON object per event on stdout

use crate::dag::{NodeEvent, NodeResult, RunSummary, Stage};
use crate::ui::icons::{CHECK, CLOCK, CROSS, RETRY, RUNNING, SKIP, SPARKLE, STOP, WAVE};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Output mode for the run display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// One line per finished node
    Minimal,
    /// JSON events
    Json,
}

/// Terminal display for a pipeline run.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    /// Overall progress over all nodes
    header_bar: ProgressBar,
    /// Spinners for nodes currently running
    node_bars: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = if mode == UiMode::Full {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style_or_default(
                "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                "█▓▒░",
            ));
            bar.set_prefix("containment");
            bar.set_message("Planning...");
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            mode,
            multi,
            header_bar,
            node_bars: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    /// Update the display for one executor event.
    pub fn handle_event(&self, event: &NodeEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &NodeEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &NodeEvent) {
        let line = match event {
            NodeEvent::GraphReady { nodes, samples, .. } => {
                format!("Running {} nodes for {} samples", nodes, samples)
            }
            NodeEvent::Retrying {
                node,
                attempt,
                max_attempts,
                memory_mb,
                ..
            } => format!(
                "↻ {} (attempt {}/{}, {})",
                node,
                attempt,
                max_attempts,
                format_memory(*memory_mb)
            ),
            NodeEvent::Completed { node, result } if result.success => format!("✓ {}", node),
            NodeEvent::Completed { node, result } => format!(
                "✗ {} ({})",
                node,
                result.error.as_deref().unwrap_or("failed")
            ),
            NodeEvent::Skipped { node, .. } => format!("- {} (skipped)", node),
            NodeEvent::RunCompleted { success, summary } => format!(
                "Done: {}/{} {}",
                summary.completed,
                summary.total_nodes,
                if *success { "✓" } else { "✗" }
            ),
            NodeEvent::Started { .. } | NodeEvent::Cancelled { .. } => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &NodeEvent) {
        match event {
            NodeEvent::GraphReady {
                nodes,
                samples,
                waves,
            } => self.on_graph_ready(*nodes, *samples, waves),
            NodeEvent::Started {
                node,
                stage,
                attempt,
                memory_mb,
                ..
            } => self.on_node_started(node, *stage, *attempt, *memory_mb),
            NodeEvent::Retrying {
                node,
                attempt,
                max_attempts,
                backoff_ms,
                memory_mb,
                reason,
            } => self.on_node_retrying(node, *attempt, *max_attempts, *backoff_ms, *memory_mb, reason),
            NodeEvent::Completed { node, result } => self.on_node_completed(node, result),
            NodeEvent::Skipped { node, reason } => self.on_node_skipped(node, reason),
            NodeEvent::Cancelled { node } => self.on_node_cancelled(node),
            NodeEvent::RunCompleted { success, summary } => self.on_run_completed(*success, summary),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<String, ProgressBar>> {
        self.node_bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_graph_ready(&self, nodes: usize, samples: usize, waves: &[Vec<String>]) {
        self.header_bar.set_length(nodes as u64);
        self.header_bar.set_message(format!("{} samples", samples));
        self.print_plan(nodes, samples, waves);
    }

    /// Print the wave breakdown of a graph.
    pub fn print_plan(&self, nodes: usize, samples: usize, waves: &[Vec<String>]) {
        if self.mode != UiMode::Full {
            return;
        }
        self.multi
            .println(format!(
                "{} {} nodes for {} samples in {} waves",
                WAVE,
                style(nodes).yellow().bold(),
                style(samples).yellow().bold(),
                style(waves.len()).yellow().bold()
            ))
            .ok();

        if self.verbose {
            for (i, wave) in waves.iter().enumerate() {
                self.multi
                    .println(format!(
                        "  Wave {}: [{}]",
                        style(i).cyan(),
                        style(wave.join(", ")).dim()
                    ))
                    .ok();
            }
        }
        self.multi.println("").ok();
    }

    fn on_node_started(&self, node: &str, stage: Stage, attempt: u32, memory_mb: u64) {
        let mut bars = self.bars();
        let bar = bars.entry(node.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("  {spinner:.green} {prefix:.bold} {msg} {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix(format!("[{}]", node));
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });

        let msg = if stage.is_retryable() {
            format!(
                "{}attempt {} ({})",
                RUNNING,
                attempt,
                format_memory(memory_mb)
            )
        } else {
            format!("{}running", RUNNING)
        };
        bar.set_message(msg);
    }

    fn on_node_retrying(
        &self,
        node: &str,
        attempt: u32,
        max_attempts: u32,
        backoff_ms: u64,
        memory_mb: u64,
        reason: &str,
    ) {
        if let Some(bar) = self.bars().get(node) {
            bar.set_message(format!(
                "{}retry in {} with {}",
                RETRY,
                format_duration(Duration::from_millis(backoff_ms)),
                format_memory(memory_mb)
            ));
        }

        self.multi
            .println(format!(
                "  {}{} retrying as attempt {}/{}: {}",
                RETRY,
                style(node).yellow(),
                attempt,
                max_attempts,
                style(first_line(reason)).dim()
            ))
            .ok();
    }

    fn on_node_completed(&self, node: &str, result: &NodeResult) {
        if let Some(bar) = self.bars().remove(node) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        self.header_bar.inc(1);

        if result.success {
            let retried = if result.was_retried() {
                format!(
                    " after {} attempts ({})",
                    result.attempts,
                    format_memory(result.memory_mb)
                )
            } else {
                String::new()
            };
            self.multi
                .println(format!(
                    "  {}{} {}{} ({})",
                    CHECK,
                    style(node).green(),
                    style("complete").green(),
                    retried,
                    format_duration(result.duration)
                ))
                .ok();
            if self.verbose {
                for output in &result.outputs {
                    self.multi
                        .println(format!("      {}", style(output.display()).dim()))
                        .ok();
                }
            }
        } else {
            self.multi
                .println(format!(
                    "  {}{} {}: {}",
                    CROSS,
                    style(node).red().bold(),
                    style("failed").red(),
                    first_line(result.error.as_deref().unwrap_or("unknown error"))
                ))
                .ok();
        }
    }

    fn on_node_skipped(&self, node: &str, reason: &str) {
        self.header_bar.inc(1);
        self.multi
            .println(format!(
                "  {}{} {}",
                SKIP,
                style(node).yellow(),
                style(reason).dim()
            ))
            .ok();
    }

    fn on_node_cancelled(&self, node: &str) {
        if let Some(bar) = self.bars().remove(node) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        self.header_bar.inc(1);
        if self.verbose {
            self.multi
                .println(format!("  {}{} cancelled", STOP, style(node).dim()))
                .ok();
        }
    }

    fn on_run_completed(&self, success: bool, summary: &RunSummary) {
        for (_, bar) in self.bars().drain() {
            bar.finish_and_clear();
        }
        self.header_bar.finish_and_clear();

        let rule = style("═".repeat(60)).cyan().to_string();
        self.multi.println("").ok();
        self.multi.println(&rule).ok();
        if success {
            self.multi
                .println(format!(
                    "{}Run {} {}",
                    SPARKLE,
                    style("COMPLETE").green().bold(),
                    SPARKLE
                ))
                .ok();
        } else {
            self.multi
                .println(format!("{}Run {}", CROSS, style("FAILED").red().bold()))
                .ok();
        }
        self.multi.println(&rule).ok();

        self.multi
            .println(format!(
                "{}Nodes: {}/{} completed",
                CLOCK,
                style(summary.completed).green().bold(),
                summary.total_nodes
            ))
            .ok();
        if summary.failed > 0 {
            self.multi
                .println(format!("     {} failed", style(summary.failed).red().bold()))
                .ok();
        }
        if summary.skipped > 0 {
            self.multi
                .println(format!("     {} skipped", style(summary.skipped).yellow()))
                .ok();
        }
        if summary.cancelled > 0 {
            self.multi
                .println(format!("     {} cancelled", style(summary.cancelled).yellow()))
                .ok();
        }
        if summary.retries > 0 {
            self.multi
                .println(format!("     {} retries", style(summary.retries).yellow()))
                .ok();
        }
        self.multi
            .println(format!(
                "     Duration: {}",
                style(format_duration(summary.duration)).cyan()
            ))
            .ok();

        if self.verbose && !summary.node_results.is_empty() {
            self.multi.println("").ok();
            self.multi
                .println(format!("{}", style("Node breakdown:").underlined()))
                .ok();
            for (node, result) in &summary.node_results {
                let status = if result.success {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                self.multi
                    .println(format!(
                        "  {} {} - {} attempt(s), {}",
                        status,
                        node,
                        result.attempts,
                        format_duration(result.duration)
                    ))
                    .ok();
            }
        }
        self.multi.println("").ok();
    }
}

fn style_or_default(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .map(|s| s.progress_chars(chars))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Format a memory grant in MB for display.
pub fn format_memory(mb: u64) -> String {
    if mb >= 1024 && mb % 1024 == 0 {
        format!("{} GB", mb / 1024)
    } else {
        format!("{} MB", mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::from_str("json", true).unwrap(), UiMode::Json);
        assert_eq!(UiMode::from_str("MINIMAL", true).unwrap(), UiMode::Minimal);
        assert_eq!(UiMode::from_str("full", false).unwrap(), UiMode::Full);
        assert!(UiMode::from_str("fancy", true).is_err());
        assert_eq!(UiMode::default(), UiMode::Full);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512 MB");
        assert_eq!(format_memory(4096), "4 GB");
        assert_eq!(format_memory(1536), "1536 MB");
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("Killed\nmore"), "Killed");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn test_full_mode_tracks_running_nodes() {
        let ui = RunUI::new(UiMode::Full, false);
        ui.handle_event(&NodeEvent::GraphReady {
            nodes: 2,
            samples: 1,
            waves: vec![vec!["sketch_sample:s1".into()]],
        });
        ui.handle_event(&NodeEvent::Started {
            node: "sketch_sample:s1".into(),
            stage: Stage::SketchSample,
            sample: Some("s1".into()),
            attempt: 1,
            memory_mb: 4096,
        });
        assert!(ui.bars().contains_key("sketch_sample:s1"));

        let result = NodeResult::success(
            "sketch_sample:s1",
            Stage::SketchSample,
            Some("s1"),
            1,
            4096,
            Vec::new(),
            Duration::from_secs(1),
        );
        ui.handle_event(&NodeEvent::Completed {
            node: "sketch_sample:s1".into(),
            result: Box::new(result),
        });
        assert!(ui.bars().is_empty());
        assert_eq!(ui.header_bar.position(), 1);
    }

    #[test]
    fn test_event_json_tag() {
        let event = NodeEvent::Skipped {
            node: "render_combined:containment".into(),
            reason: "dependency failed".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"skipped\""));
        assert!(json.contains("render_combined:containment"));
    }
}
