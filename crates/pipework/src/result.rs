//! StageResult and PipelineReport — the structured outcomes of a run.
//!
//! Every stage produces a [`StageResult`] whether it succeeded or not: exit
//! code, elapsed time, timeout flags, gathered output, and any stream I/O
//! errors folded in for visibility. A successful run yields a
//! [`PipelineReport`] carrying the last stage's materialized [`Output`] plus
//! every stage's result in pipeline order.

use std::time::Duration;

/// Terminal outcome of a single stage.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    /// Rendered command line, for logs and failure messages.
    pub command: String,
    /// Exit code. 0 means success; -1 means the process died without one
    /// (killed by a signal).
    pub code: i64,
    /// Captured stdout, when gathered or captured.
    pub stdout: Option<String>,
    /// Captured stderr, when gathered or captured.
    pub stderr: Option<String>,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
    /// The soft deadline elapsed before the process exited. Recorded even if
    /// the process went on to exit on its own.
    pub soft_timed_out: bool,
    /// The hard deadline elapsed and termination was forced.
    pub hard_timed_out: bool,
    /// Stream pump I/O errors, isolated from the stage outcome but kept
    /// visible here.
    pub stream_errors: Vec<String>,
}

impl StageResult {
    /// True if the stage's process exited with code 0.
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// The last stage's materialized output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// No terminal materialization was requested.
    Empty,
    /// `output_to_string` materialization.
    Text(String),
    /// `output_to_lines` materialization.
    Lines(Vec<String>),
}

impl Output {
    /// The output as one string. Lines are joined with `\n`.
    pub fn into_string(self) -> String {
        match self {
            Output::Empty => String::new(),
            Output::Text(text) => text,
            Output::Lines(lines) => lines.join("\n"),
        }
    }

    /// The output as lines. Text is split on `\n`.
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Output::Empty => Vec::new(),
            Output::Text(text) => text.lines().map(str::to_string).collect(),
            Output::Lines(lines) => lines,
        }
    }

    /// Borrow the text form, if this is a `Text` output.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Success value of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// The last stage's materialized output.
    pub output: Output,
    /// Every stage's result, in pipeline order.
    pub stages: Vec<StageResult>,
}

impl PipelineReport {
    /// The pipeline's output as one string.
    pub fn into_string(self) -> String {
        self.output.into_string()
    }

    /// The pipeline's output as lines.
    pub fn into_lines(self) -> Vec<String> {
        self.output.into_lines()
    }
}
