//! Stage configuration — one process's invocation plan.
//!
//! A [`StageConfig`] is built by the fluent [`PipelineBuilder`], frozen when
//! the pipeline is built, and consumed exactly once by the executor. It
//! records everything needed to spawn one process and route its streams:
//! program, arguments, working directory, environment overrides, input
//! source, per-stream capture and tap claimants, diagnostics gathering, and
//! the soft/hard termination deadlines.
//!
//! [`PipelineBuilder`]: crate::builder::PipelineBuilder

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Bounded capture size used by gather-on-fail diagnostics.
pub const DEFAULT_GATHER_MAX_BYTES: usize = 64 * 1024;

/// Default cap on a single consumed line.
pub const DEFAULT_LINE_MAX_BYTES: usize = 8 * 1024;

/// Where a stage's stdin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Inherit the caller's stdin.
    Inherit,
    /// Closed immediately — the process sees EOF on first read.
    Null,
    /// Fixed content, written then closed.
    Bytes(Vec<u8>),
    /// A sequence of lines, joined with `\n`, newline-terminated, then closed.
    Lines(Vec<String>),
    /// Wired from the previous stage's stdout. Implicit for every stage
    /// after the first.
    Piped,
}

/// Per-line callback claimant on a stream.
///
/// Each tap is one extra tee claimant: it observes the full stream without
/// consuming the downstream pipe slot or altering what flows onward.
#[derive(Clone)]
pub struct Tap {
    /// Lines longer than this are truncated before delivery.
    pub max_line_bytes: usize,
    pub(crate) consumer: LineConsumer,
}

/// Callback receiving each (possibly truncated) line of a tapped stream.
pub type LineConsumer = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Callback invoked once, on a dedicated blocking thread, while the stage's
/// process runs. The stage is not considered complete until it returns.
pub type WhileRunning = Arc<dyn Fn(&StageProcess) + Send + Sync + 'static>;

impl fmt::Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tap")
            .field("max_line_bytes", &self.max_line_bytes)
            .finish()
    }
}

/// Terminal materialization of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Capture {
    /// Nothing retained (the stream is still drained).
    #[default]
    None,
    /// Retain up to `max_bytes` as a single string.
    Text { max_bytes: usize },
    /// Retain up to `max_lines` lines, each capped at `max_line_bytes`.
    Lines {
        max_lines: usize,
        max_line_bytes: usize,
    },
}

/// Routing plan for one stream (stdout or stderr) of a stage.
#[derive(Debug, Clone, Default)]
pub struct StreamPlan {
    pub capture: Capture,
    pub taps: Vec<Tap>,
}

impl StreamPlan {
    /// Number of tee claimants this plan contributes (excluding the
    /// downstream pipe and gather-on-fail, which the executor adds).
    pub(crate) fn claimants(&self) -> usize {
        self.taps.len() + usize::from(self.capture != Capture::None)
    }
}

/// One process's invocation plan, immutable once the pipeline is built.
pub struct StageConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Inherits the caller's working directory if absent.
    pub cwd: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting.
    pub clear_env: bool,
    pub input: Input,
    pub stdout: StreamPlan,
    pub stderr: StreamPlan,
    /// Retain a bounded copy of both streams purely for failure diagnostics,
    /// even when no sink was requested.
    pub gather_on_fail: bool,
    /// Deadline after which cooperative termination is requested.
    pub soft_timeout: Option<Duration>,
    /// Deadline after which termination is forced. Never shorter than the
    /// soft deadline; the builder rejects that at build time.
    pub hard_timeout: Option<Duration>,
    pub while_running: Option<WhileRunning>,
}

impl StageConfig {
    pub(crate) fn new(program: String) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            clear_env: false,
            input: Input::Inherit,
            stdout: StreamPlan::default(),
            stderr: StreamPlan::default(),
            gather_on_fail: false,
            soft_timeout: None,
            hard_timeout: None,
            while_running: None,
        }
    }

    /// The command line as one display string, for logs and failure messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Debug for StageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("clear_env", &self.clear_env)
            .field("input", &self.input)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("gather_on_fail", &self.gather_on_fail)
            .field("soft_timeout", &self.soft_timeout)
            .field("hard_timeout", &self.hard_timeout)
            .field("while_running", &self.while_running.is_some())
            .finish()
    }
}

/// Handle to a live stage process, passed to the `while_running` callback.
#[derive(Debug, Clone)]
pub struct StageProcess {
    pid: Option<u32>,
    command: String,
}

impl StageProcess {
    pub(crate) fn new(pid: Option<u32>, command: String) -> Self {
        Self { pid, command }
    }

    /// OS process id, if the process is (still) running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The stage's rendered command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Request cooperative termination of this stage's process.
    ///
    /// Delivers SIGTERM on unix; a no-op elsewhere. The process may ignore
    /// it — the stage's hard timeout (if any) still applies.
    pub fn terminate(&self) {
        crate::executor::terminate_pid(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_program_and_args() {
        let mut config = StageConfig::new("tr".to_string());
        config.args = vec!["a-z".to_string(), "A-Z".to_string()];
        assert_eq!(config.command_line(), "tr a-z A-Z");
    }

    #[test]
    fn command_line_without_args_is_program() {
        let config = StageConfig::new("true".to_string());
        assert_eq!(config.command_line(), "true");
    }

    #[test]
    fn claimant_count_includes_taps_and_capture() {
        let mut plan = StreamPlan::default();
        assert_eq!(plan.claimants(), 0);

        plan.taps.push(Tap {
            max_line_bytes: DEFAULT_LINE_MAX_BYTES,
            consumer: Arc::new(|_| {}),
        });
        assert_eq!(plan.claimants(), 1);

        plan.capture = Capture::Text { max_bytes: 1024 };
        assert_eq!(plan.claimants(), 2);
    }

    #[test]
    fn debug_omits_callback_bodies() {
        let mut config = StageConfig::new("sleep".to_string());
        config.while_running = Some(Arc::new(|_| {}));
        let rendered = format!("{config:?}");
        assert!(rendered.contains("while_running: true"));
    }
}
