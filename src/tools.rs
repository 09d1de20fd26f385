//! External tool invocation.
//!
//! Every stage that does real work shells out to a configured program. The
//! argument template is rendered per attempt, wrapped in the optional
//! launcher prefix, and run under the attempt's wall-time limit:
//! - `TemplateVars` - placeholder values for one attempt
//! - `Invocation` - the fully rendered command
//! - `ProcessRunner` - spawns it, enforcing the time limit and cancellation
//! - `ProcessOutcome::into_result` - classifies the exit status

use crate::config::{ParamsSection, ResourceProfile, ToolCommand};
use crate::dag::{RetryPolicy, Stage};
use crate::errors::{ExitSignal, TaskError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

const COMMON_PLACEHOLDERS: &[&str] = &[
    "kmer",
    "scaled",
    "min_depth",
    "threshold",
    "cpus",
    "memory_mb",
    "time_secs",
    "name",
    "abundance",
];

/// Placeholders a stage's template may use beyond the common ones.
fn stage_placeholders(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::SketchReference | Stage::SketchSample | Stage::FilterAbundance => {
            &["input", "output"]
        }
        Stage::SearchContainment => &["reference", "query", "output"],
        Stage::RenderSample | Stage::RenderCombined => {
            &["inputs", "output_csv", "output_plot", "plot_flag"]
        }
    }
}

/// Find `{name}` tokens in an argument, as `(start, end, name)`.
fn scan_placeholders(arg: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(open) = arg[offset..].find('{') {
        let start = offset + open;
        let Some(len) = arg[start + 1..].find('}') else {
            break;
        };
        let end = start + 1 + len;
        let name = &arg[start + 1..end];
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            found.push((start, end + 1, name));
            offset = end + 1;
        } else {
            offset = start + 1;
        }
    }
    found
}

/// Placeholders in `tool` that `stage` never provides.
pub fn unknown_placeholders(stage: Stage, tool: &ToolCommand) -> Vec<String> {
    let allowed = stage_placeholders(stage);
    let mut unknown: Vec<String> = Vec::new();
    for arg in &tool.args {
        for (_, _, name) in scan_placeholders(arg) {
            if !COMMON_PLACEHOLDERS.contains(&name)
                && !allowed.contains(&name)
                && !unknown.iter().any(|u| u == name)
            {
                unknown.push(name.to_string());
            }
        }
    }
    unknown
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateValue {
    Single(String),
    List(Vec<String>),
}

/// Placeholder values for rendering one attempt's command.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<&'static str, TemplateValue>,
}

impl TemplateVars {
    /// Values shared by every stage: run parameters and the attempt's resources.
    pub fn new(params: &ParamsSection, resources: ResourceProfile) -> Self {
        Self::default()
            .set("kmer", params.kmer.to_string())
            .set("scaled", params.scaled.to_string())
            .set("min_depth", params.min_depth.to_string())
            .set("threshold", params.threshold.to_string())
            .set("abundance", "abund")
            .with_resources(resources)
    }

    /// Replace the resource values, as done for each retry.
    pub fn with_resources(self, resources: ResourceProfile) -> Self {
        self.set("cpus", resources.cpus.to_string())
            .set("memory_mb", resources.memory_mb.to_string())
            .set("time_secs", resources.time_secs.to_string())
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(name, TemplateValue::Single(value.into()));
        self
    }

    pub fn set_path(self, name: &'static str, path: &Path) -> Self {
        self.set(name, path.to_string_lossy().into_owned())
    }

    /// A list value. As a whole argument it expands to one argument per item.
    pub fn set_list(mut self, name: &'static str, values: Vec<String>) -> Self {
        self.values.insert(name, TemplateValue::List(values));
        self
    }

    /// Render an argument template. Unknown placeholders are left as written.
    pub fn render(&self, template: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(template.len());
        for arg in template {
            let found = scan_placeholders(arg);
            if let [(0, end, name)] = found.as_slice()
                && *end == arg.len()
                && let Some(TemplateValue::List(items)) = self.values.get(*name)
            {
                args.extend(items.iter().cloned());
                continue;
            }
            args.push(self.render_arg(arg));
        }
        args
    }

    fn render_arg(&self, arg: &str) -> String {
        let mut out = String::with_capacity(arg.len());
        let mut last = 0;
        for (start, end, name) in scan_placeholders(arg) {
            out.push_str(&arg[last..start]);
            match self.values.get(name) {
                Some(TemplateValue::Single(value)) => out.push_str(value),
                Some(TemplateValue::List(items)) => out.push_str(&items.join(",")),
                None => out.push_str(&arg[start..end]),
            }
            last = end;
        }
        out.push_str(&arg[last..]);
        out
    }
}

/// A fully rendered command for one attempt of one node.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: Stage,
    pub sample: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub resources: ResourceProfile,
    pub attempt: u32,
}

impl Invocation {
    /// Render `tool` with `vars`, wrapped in `launcher` when one is configured.
    pub fn build(
        stage: Stage,
        sample: Option<&str>,
        tool: &ToolCommand,
        launcher: &[String],
        vars: &TemplateVars,
        resources: ResourceProfile,
        attempt: u32,
    ) -> Self {
        let rendered = vars.render(&tool.args);
        let (program, args) = match vars.render(launcher).split_first() {
            Some((first, rest)) => {
                let mut args = rest.to_vec();
                args.push(tool.program.clone());
                args.extend(rendered);
                (first.clone(), args)
            }
            None => (tool.program.clone(), rendered),
        };

        let mut env = vec![
            ("CONTAINMENT_STAGE".to_string(), stage.to_string()),
            ("CONTAINMENT_CPUS".to_string(), resources.cpus.to_string()),
            (
                "CONTAINMENT_MEMORY_MB".to_string(),
                resources.memory_mb.to_string(),
            ),
            (
                "CONTAINMENT_TIME_SECS".to_string(),
                resources.time_secs.to_string(),
            ),
            ("CONTAINMENT_ATTEMPT".to_string(), attempt.to_string()),
        ];
        if let Some(sample) = sample {
            env.push(("CONTAINMENT_SAMPLE".to_string(), sample.to_string()));
        }

        Self {
            stage,
            sample: sample.map(String::from),
            program,
            args,
            env,
            resources,
            attempt,
        }
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// How a finished process ended.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ExitSignal,
    /// Last few KiB of stderr
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit.code == Some(0)
    }

    /// Classify the exit status: out-of-memory kills become
    /// `ResourceExhaustion`, every other non-zero exit `ToolInvocation`.
    pub fn into_result(self, invocation: &Invocation, policy: &RetryPolicy) -> Result<(), TaskError> {
        if self.success() {
            return Ok(());
        }
        if policy.is_oom(&self.exit) {
            Err(TaskError::ResourceExhaustion {
                stage: invocation.stage,
                exit: self.exit,
                memory_mb: invocation.resources.memory_mb,
                stderr: self.stderr,
            })
        } else {
            Err(TaskError::ToolInvocation {
                stage: invocation.stage,
                exit: self.exit,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs rendered invocations.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run to completion. Errors only for spawn failures, timeouts and
    /// cancellation; a non-zero exit is reported in the outcome.
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, TaskError>;
}

/// Runs invocations as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, TaskError> {
        let stage = invocation.stage;
        debug!(
            stage = %stage,
            attempt = invocation.attempt,
            command = %invocation.command_line(),
            "Spawning tool"
        );

        let started = Instant::now();
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TaskError::Spawn {
                stage,
                program: invocation.program.clone(),
                source,
            })?;

        // A zero time limit means unlimited.
        let limit = invocation.resources.time_limit();
        let wait = child.wait_with_output();
        let bounded = async {
            if limit.is_zero() {
                Ok(wait.await)
            } else {
                timeout(limit, wait).await.map_err(|_| limit)
            }
        };

        // Dropping the wait future kills the child.
        let output = tokio::select! {
            result = bounded => match result {
                Ok(output) => output.map_err(|source| TaskError::Wait { stage, source })?,
                Err(limit) => return Err(TaskError::Timeout { stage, limit }),
            },
            _ = cancel.cancelled() => return Err(TaskError::Cancelled { stage }),
        };

        if !output.stdout.is_empty() {
            trace!(stage = %stage, stdout = %String::from_utf8_lossy(&output.stdout), "Tool stdout");
        }

        Ok(ProcessOutcome {
            exit: exit_signal(&output.status),
            stderr: stderr_tail(&output.stderr),
            duration: started.elapsed(),
        })
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> ExitSignal {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitSignal {
        code: status.code(),
        signal,
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsSection;

    fn tool(program: &str, args: &[&str]) -> ToolCommand {
        ToolCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn vars() -> TemplateVars {
        TemplateVars::new(&ParamsSection::default(), ResourceProfile::new(2, 4096, 60))
    }

    fn shell(script: &str, time_secs: u64) -> Invocation {
        Invocation::build(
            Stage::SearchContainment,
            Some("s1"),
            &tool("sh", &["-c", script]),
            &[],
            &TemplateVars::default(),
            ResourceProfile::new(1, 4096, time_secs),
            1,
        )
    }

    #[test]
    fn test_default_templates_use_known_placeholders() {
        let tools = ToolsSection::default();
        for stage in Stage::ALL {
            assert!(
                unknown_placeholders(stage, tools.for_stage(stage)).is_empty(),
                "{stage}"
            );
        }
    }

    #[test]
    fn test_unknown_placeholders_are_reported_once() {
        let t = tool("x", &["{input}", "{bogus}", "a={bogus}", "{reference}"]);
        assert_eq!(
            unknown_placeholders(Stage::SketchSample, &t),
            vec!["bogus", "reference"]
        );
        assert!(unknown_placeholders(Stage::SearchContainment, &tool("x", &["{reference}"])).is_empty());
    }

    #[test]
    fn test_render_substitutes_embedded_placeholders() {
        let args = vars().render(&strings(&["k={kmer},scaled={scaled},{abundance}", "-c", "{cpus}"]));
        assert_eq!(args, vec!["k=31,scaled=100,abund", "-c", "2"]);
    }

    #[test]
    fn test_render_expands_whole_argument_lists() {
        let vars = vars()
            .set_list("inputs", strings(&["a.csv", "b.csv"]))
            .set_list("plot_flag", Vec::new());
        let args = vars.render(&strings(&["{inputs}", "--combined", "{plot_flag}", "x{inputs}"]));
        assert_eq!(args, vec!["a.csv", "b.csv", "--combined", "xa.csv,b.csv"]);
    }

    #[test]
    fn test_render_leaves_unknown_and_literal_braces() {
        let args = vars().render(&strings(&["{missing}", "{}", "{Not_A_Name}", "{kmer"]));
        assert_eq!(args, vec!["{missing}", "{}", "{Not_A_Name}", "{kmer"]);
    }

    #[test]
    fn test_launcher_prefix_gets_attempt_resources() {
        let resources = ResourceProfile::new(4, 8192, 120);
        let vars = vars().with_resources(resources).set("output", "out.csv");
        let launcher = strings(&["systemd-run", "-p", "MemoryMax={memory_mb}M", "--"]);
        let invocation = Invocation::build(
            Stage::SearchContainment,
            Some("s1"),
            &tool("sourmash", &["-o", "{output}"]),
            &launcher,
            &vars,
            resources,
            2,
        );

        assert_eq!(invocation.program, "systemd-run");
        assert_eq!(
            invocation.args,
            vec!["-p", "MemoryMax=8192M", "--", "sourmash", "-o", "out.csv"]
        );
        assert!(invocation
            .env
            .contains(&("CONTAINMENT_MEMORY_MB".to_string(), "8192".to_string())));
        assert!(invocation
            .env
            .contains(&("CONTAINMENT_SAMPLE".to_string(), "s1".to_string())));
        assert!(invocation
            .env
            .contains(&("CONTAINMENT_ATTEMPT".to_string(), "2".to_string())));
    }

    #[test]
    fn test_command_line_quotes_whitespace() {
        let invocation = shell("echo hi", 10);
        assert_eq!(invocation.command_line(), "sh -c 'echo hi'");
    }

    #[tokio::test]
    async fn test_successful_process() {
        let outcome = ProcessRunner::new()
            .run(&shell("echo \"$CONTAINMENT_STAGE\"", 10), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_oom_exit_code_is_resource_exhaustion() {
        let invocation = shell("echo Killed >&2; exit 137", 10);
        let outcome = ProcessRunner::new()
            .run(&invocation, &CancellationToken::new())
            .await
            .unwrap();

        let err = outcome
            .into_result(&invocation, &RetryPolicy::default())
            .unwrap_err();
        match err {
            TaskError::ResourceExhaustion {
                memory_mb, stderr, ..
            } => {
                assert_eq!(memory_mb, 4096);
                assert_eq!(stderr, "Killed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_other_exit_code_is_tool_invocation() {
        let invocation = shell("echo 'bad input' >&2; exit 2", 10);
        let outcome = ProcessRunner::new()
            .run(&invocation, &CancellationToken::new())
            .await
            .unwrap();
        let err = outcome
            .into_result(&invocation, &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, TaskError::ToolInvocation { .. }));
        assert!(err.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let err = ProcessRunner::new()
            .run(&shell("sleep 5", 1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancellation_stops_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(&shell("sleep 5", 0), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let invocation = Invocation::build(
            Stage::SketchSample,
            None,
            &tool("/nonexistent/containment-tool", &[]),
            &[],
            &TemplateVars::default(),
            ResourceProfile::new(1, 1024, 10),
            1,
        );
        let err = ProcessRunner::new()
            .run(&invocation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Spawn { .. }));
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(STDERR_TAIL_BYTES) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("END"));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
    }
}
