//! Fluent pipeline construction.
//!
//! [`PipelineBuilder`] is the mutable accumulator; [`Pipeline`] is the frozen
//! plan it produces. One builder describes one or more stages: configuration
//! calls apply to the currently open stage, and [`PipelineBuilder::pipe_to`]
//! freezes it and opens the next one downstream.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pipework::PipelineError> {
//! use pipework::PipelineBuilder;
//!
//! let report = PipelineBuilder::new("sort")
//!     .input_string("b\na\nc\n")
//!     .pipe_to("head")
//!     .args(["-n", "2"])
//!     .output_to_string(64 * 1024)
//!     .run()
//!     .await?;
//! assert_eq!(report.into_string(), "a\nb\n");
//! # Ok(())
//! # }
//! ```
//!
//! Misuse — an empty program, a hard timeout shorter than the soft one,
//! piping after the output was already captured, explicit input on a piped
//! stage, NUL bytes anywhere in the command — is recorded at the offending
//! call and surfaces as a [`ConfigError`] from [`PipelineBuilder::build`],
//! before any process spawns. It never surfaces mid-run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Capture, Input, StageConfig, StageProcess, Tap};
use crate::error::{ConfigError, PipelineError};
use crate::executor::Executor;
use crate::handle::{self, PipelineHandle};
use crate::result::PipelineReport;

/// A frozen, validated sequence of stages, executed exactly once.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) stages: Vec<StageConfig>,
}

impl Pipeline {
    /// The stages in pipeline order.
    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    /// Run the pipeline, resolving in place when it completes or fails.
    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        Executor::new(self).run().await
    }

    /// Run the pipeline on the runtime's own tasks, returning immediately.
    pub fn run_async(self) -> PipelineHandle {
        handle::spawn(self)
    }
}

/// Fluent accumulator for one or more stages.
pub struct PipelineBuilder {
    frozen: Vec<StageConfig>,
    current: StageConfig,
    defect: Option<ConfigError>,
}

impl PipelineBuilder {
    /// Start a pipeline with its first stage. Arguments are added with
    /// [`arg`](Self::arg)/[`args`](Self::args).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            frozen: Vec::new(),
            current: StageConfig::new(program.into()),
            defect: None,
        }
    }

    fn stage_index(&self) -> usize {
        self.frozen.len()
    }

    fn record(&mut self, defect: ConfigError) {
        // First defect wins; later ones are usually knock-on effects.
        if self.defect.is_none() {
            self.defect = Some(defect);
        }
    }

    /// Append one argument to the open stage.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.current.args.push(arg.into());
        self
    }

    /// Append arguments to the open stage.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the open stage's working directory.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current.cwd = Some(dir.into());
        self
    }

    /// Add one environment override for the open stage.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.current.env.push((key.into(), value.into()));
        self
    }

    /// Add environment overrides for the open stage.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.current
            .env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Start the open stage from an empty environment instead of inheriting.
    pub fn clear_env(mut self) -> Self {
        self.current.clear_env = true;
        self
    }

    fn set_input(mut self, input: Input) -> Self {
        if self.stage_index() > 0 {
            let stage = self.stage_index();
            self.record(ConfigError::InputOnPipedStage { stage });
            return self;
        }
        self.current.input = input;
        self
    }

    /// Feed the first stage fixed string content on stdin.
    pub fn input_string(self, content: impl Into<String>) -> Self {
        self.set_input(Input::Bytes(content.into().into_bytes()))
    }

    /// Feed the first stage fixed byte content on stdin.
    pub fn input_bytes(self, content: impl Into<Vec<u8>>) -> Self {
        self.set_input(Input::Bytes(content.into()))
    }

    /// Feed the first stage a sequence of lines on stdin, each
    /// newline-terminated.
    pub fn input_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_input(Input::Lines(lines.into_iter().map(Into::into).collect()))
    }

    /// Let the first stage inherit the caller's stdin. This is the default.
    pub fn inherit_stdin(self) -> Self {
        self.set_input(Input::Inherit)
    }

    /// Give the first stage a closed stdin: EOF on first read.
    pub fn no_stdin(self) -> Self {
        self.set_input(Input::Null)
    }

    /// Deadline after which cooperative termination is requested for the
    /// open stage.
    pub fn soft_timeout(mut self, timeout: Duration) -> Self {
        self.current.soft_timeout = Some(timeout);
        self
    }

    /// Deadline after which the open stage is forcibly terminated. Must not
    /// be shorter than the soft timeout.
    pub fn hard_timeout(mut self, timeout: Duration) -> Self {
        self.current.hard_timeout = Some(timeout);
        self
    }

    /// Retain a bounded copy of the open stage's output and error streams
    /// purely for failure diagnostics, even without an explicit sink.
    pub fn gather_on_fail(mut self, gather: bool) -> Self {
        self.current.gather_on_fail = gather;
        self
    }

    /// Invoke `callback` once, on a dedicated blocking thread, while the open
    /// stage's process runs. The stage is not complete until it returns.
    pub fn while_running(
        mut self,
        callback: impl Fn(&StageProcess) + Send + Sync + 'static,
    ) -> Self {
        self.current.while_running = Some(Arc::new(callback));
        self
    }

    fn set_capture(&mut self, stderr: bool, capture: Capture) {
        let stage = self.stage_index();
        let plan = if stderr {
            &mut self.current.stderr
        } else {
            &mut self.current.stdout
        };
        if plan.capture != Capture::None {
            let stream = if stderr { "stderr" } else { "stdout" };
            self.record(ConfigError::CaptureAlreadySet { stage, stream });
            return;
        }
        plan.capture = capture;
    }

    /// Materialize the open stage's output as a single string, capped at
    /// `max_bytes`. Terminal: the stage can no longer pipe onward.
    pub fn output_to_string(mut self, max_bytes: usize) -> Self {
        self.set_capture(false, Capture::Text { max_bytes });
        self
    }

    /// Materialize the open stage's output as a list of lines.
    pub fn output_to_lines(mut self, max_lines: usize, max_line_bytes: usize) -> Self {
        self.set_capture(
            false,
            Capture::Lines {
                max_lines,
                max_line_bytes,
            },
        );
        self
    }

    /// Add a per-line tap on the open stage's output. Repeatable; taps run
    /// in parallel and do not consume the pipe slot or alter what flows
    /// downstream.
    pub fn consume_output_lines(
        mut self,
        max_line_bytes: usize,
        consumer: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.current.stdout.taps.push(Tap {
            max_line_bytes,
            consumer: Arc::new(consumer),
        });
        self
    }

    /// Materialize the open stage's error stream as a single string.
    pub fn error_to_string(mut self, max_bytes: usize) -> Self {
        self.set_capture(true, Capture::Text { max_bytes });
        self
    }

    /// Materialize the open stage's error stream as a list of lines.
    pub fn error_to_lines(mut self, max_lines: usize, max_line_bytes: usize) -> Self {
        self.set_capture(
            true,
            Capture::Lines {
                max_lines,
                max_line_bytes,
            },
        );
        self
    }

    /// Add a per-line tap on the open stage's error stream.
    pub fn consume_error_lines(
        mut self,
        max_line_bytes: usize,
        consumer: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.current.stderr.taps.push(Tap {
            max_line_bytes,
            consumer: Arc::new(consumer),
        });
        self
    }

    /// Freeze the open stage and open a new one downstream; the frozen
    /// stage's stdout becomes the new stage's stdin.
    pub fn pipe_to(mut self, program: impl Into<String>) -> Self {
        if self.current.stdout.capture != Capture::None {
            let stage = self.stage_index();
            self.record(ConfigError::PipeAfterCapture { stage });
        }
        let mut next = StageConfig::new(program.into());
        next.input = Input::Piped;
        let frozen = std::mem::replace(&mut self.current, next);
        self.frozen.push(frozen);
        self
    }

    /// Validate and freeze the whole pipeline.
    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        if let Some(defect) = self.defect {
            return Err(defect.into());
        }
        self.frozen.push(self.current);

        for (stage, config) in self.frozen.iter().enumerate() {
            validate_stage(stage, config)?;
        }

        Ok(Pipeline {
            stages: self.frozen,
        })
    }

    /// Build and run, blocking the calling task until completion or failure.
    pub async fn run(self) -> Result<PipelineReport, PipelineError> {
        self.build()?.run().await
    }

    /// Build and run on the runtime's own tasks, returning a handle
    /// immediately. Configuration errors resolve the handle; they are not
    /// raised on the calling thread.
    pub fn run_async(self) -> PipelineHandle {
        match self.build() {
            Ok(pipeline) => pipeline.run_async(),
            Err(error) => handle::ready(error),
        }
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("frozen", &self.frozen.len())
            .field("current", &self.current.program)
            .field("defect", &self.defect)
            .finish()
    }
}

fn validate_stage(stage: usize, config: &StageConfig) -> Result<(), ConfigError> {
    if config.program.is_empty() {
        return Err(ConfigError::EmptyProgram { stage });
    }
    if let (Some(soft), Some(hard)) = (config.soft_timeout, config.hard_timeout) {
        if hard < soft {
            return Err(ConfigError::TimeoutOrder { stage, soft, hard });
        }
    }
    if config.program.contains('\0') {
        return Err(ConfigError::NulByte {
            stage,
            what: "executable",
        });
    }
    if config.args.iter().any(|arg| arg.contains('\0')) {
        return Err(ConfigError::NulByte {
            stage,
            what: "argument",
        });
    }
    if config
        .env
        .iter()
        .any(|(key, value)| key.contains('\0') || value.contains('\0'))
    {
        return Err(ConfigError::NulByte {
            stage,
            what: "environment variable",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_build() {
        let pipeline = PipelineBuilder::new("echo")
            .arg("hi")
            .build()
            .unwrap();
        assert_eq!(pipeline.stages().len(), 1);
        assert_eq!(pipeline.stages()[0].command_line(), "echo hi");
    }

    #[test]
    fn pipe_to_freezes_stages_in_order() {
        let pipeline = PipelineBuilder::new("cat")
            .pipe_to("sort")
            .pipe_to("uniq")
            .build()
            .unwrap();
        let stages = pipeline.stages();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].program, "cat");
        assert_eq!(stages[1].program, "sort");
        assert_eq!(stages[2].program, "uniq");
        assert_eq!(stages[0].input, Input::Inherit);
        assert_eq!(stages[1].input, Input::Piped);
        assert_eq!(stages[2].input, Input::Piped);
    }

    #[test]
    fn empty_program_is_rejected() {
        let result = PipelineBuilder::new("").build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::EmptyProgram { stage: 0 }))
        ));
    }

    #[test]
    fn hard_timeout_must_not_undercut_soft() {
        let result = PipelineBuilder::new("sleep")
            .arg("10")
            .soft_timeout(Duration::from_secs(5))
            .hard_timeout(Duration::from_secs(1))
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::TimeoutOrder {
                stage: 0,
                ..
            }))
        ));
    }

    #[test]
    fn equal_soft_and_hard_timeouts_are_fine() {
        let result = PipelineBuilder::new("sleep")
            .soft_timeout(Duration::from_secs(1))
            .hard_timeout(Duration::from_secs(1))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn pipe_after_capture_is_rejected() {
        let result = PipelineBuilder::new("echo")
            .output_to_string(1024)
            .pipe_to("cat")
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::PipeAfterCapture {
                stage: 0
            }))
        ));
    }

    #[test]
    fn taps_do_not_block_piping() {
        let pipeline = PipelineBuilder::new("echo")
            .consume_output_lines(1024, |_| {})
            .consume_output_lines(1024, |_| {})
            .pipe_to("cat")
            .output_to_string(1024)
            .build()
            .unwrap();
        assert_eq!(pipeline.stages()[0].stdout.taps.len(), 2);
        assert_eq!(pipeline.stages()[0].stdout.capture, Capture::None);
    }

    #[test]
    fn double_capture_is_rejected() {
        let result = PipelineBuilder::new("echo")
            .output_to_string(1024)
            .output_to_lines(10, 1024)
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::CaptureAlreadySet {
                stage: 0,
                stream: "stdout"
            }))
        ));
    }

    #[test]
    fn explicit_input_on_piped_stage_is_rejected() {
        let result = PipelineBuilder::new("echo")
            .pipe_to("cat")
            .input_string("nope")
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::InputOnPipedStage {
                stage: 1
            }))
        ));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let result = PipelineBuilder::new("echo").arg("a\0b").build();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::NulByte {
                stage: 0,
                what: "argument"
            }))
        ));
    }

    #[test]
    fn error_capture_is_independent_of_output() {
        let pipeline = PipelineBuilder::new("sh")
            .error_to_string(4096)
            .pipe_to("cat")
            .output_to_lines(100, 1024)
            .build()
            .unwrap();
        assert!(matches!(
            pipeline.stages()[0].stderr.capture,
            Capture::Text { max_bytes: 4096 }
        ));
        assert_eq!(pipeline.stages()[0].stdout.capture, Capture::None);
    }
}
