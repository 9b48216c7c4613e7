//! Failure taxonomy for pipeline execution.
//!
//! Three layers, matching where a failure can originate:
//!
//! - [`ConfigError`] — invalid builder usage, detected before anything spawns.
//! - [`StageError`] — one stage failed to spawn or exited non-zero; carries
//!   the stage's result including gathered output.
//! - [`PipelineError`] — what a run surfaces. Multi-stage pipelines aggregate
//!   every failed stage's error in stage order under `Failed`; single-stage
//!   pipelines surface their lone `StageError` directly. Successful stages
//!   are never mentioned.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::result::StageResult;

/// Invalid builder usage, raised from `build()` before any process spawns.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stage {stage}: executable must not be empty")]
    EmptyProgram { stage: usize },

    #[error("stage {stage}: hard timeout {hard:?} is shorter than soft timeout {soft:?}")]
    TimeoutOrder {
        stage: usize,
        soft: Duration,
        hard: Duration,
    },

    #[error("stage {stage}: cannot pipe to a new stage after output was captured")]
    PipeAfterCapture { stage: usize },

    #[error("stage {stage}: {stream} capture was already set")]
    CaptureAlreadySet {
        stage: usize,
        stream: &'static str,
    },

    #[error("stage {stage}: input is supplied by the previous stage")]
    InputOnPipedStage { stage: usize },

    #[error("stage {stage}: NUL byte in {what}")]
    NulByte { stage: usize, what: &'static str },
}

/// Failure of a single stage.
#[derive(Debug)]
pub enum StageError {
    /// The host OS refused or failed to create the process.
    Spawn {
        stage: usize,
        command: String,
        source: std::io::Error,
    },

    /// The process exited with a non-zero code (or died to a signal).
    Exit { stage: usize, result: StageResult },
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StageError::Spawn { source, .. } => Some(source),
            StageError::Exit { .. } => None,
        }
    }
}

impl StageError {
    /// Index of the failed stage within the pipeline.
    pub fn stage(&self) -> usize {
        match self {
            StageError::Spawn { stage, .. } => *stage,
            StageError::Exit { stage, .. } => *stage,
        }
    }

    /// The child's exit code, if it got far enough to have one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            StageError::Spawn { .. } => None,
            StageError::Exit { result, .. } => Some(result.code),
        }
    }
}

impl fmt::Display for StageError {
    /// Render the failure with its diagnostics: command, code, timeout
    /// flags, and the gathered streams when present.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Spawn {
                stage,
                command,
                source,
            } => {
                write!(f, "stage {stage}: failed to spawn `{command}`: {source}")
            }
            StageError::Exit { stage, result } => {
                write!(
                    f,
                    "stage {stage}: command `{}` exited with code {}",
                    result.command, result.code
                )?;
                if result.hard_timed_out {
                    write!(f, " (hard timeout)")?;
                } else if result.soft_timed_out {
                    write!(f, " (soft timeout)")?;
                }
                if let Some(stdout) = &result.stdout {
                    if !stdout.is_empty() {
                        write!(f, "\n--- captured stdout ---\n{stdout}")?;
                    }
                }
                if let Some(stderr) = &result.stderr {
                    if !stderr.is_empty() {
                        write!(f, "\n--- captured stderr ---\n{stderr}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// What a pipeline run surfaces when it does not complete.
#[derive(Debug)]
pub enum PipelineError {
    /// Invalid builder usage; nothing was spawned.
    Config(ConfigError),

    /// Single-stage pipeline: the lone stage's failure, directly.
    Stage(StageError),

    /// Multi-stage pipeline: every failed stage's error, in stage order.
    Failed { failures: Vec<StageError> },

    /// The asynchronous handle was cancelled while the pipeline ran.
    Cancelled,

    /// The executor task itself died (panicked).
    Internal(String),
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(error) => Some(error),
            PipelineError::Stage(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        PipelineError::Config(error)
    }
}

impl PipelineError {
    /// The per-stage failures behind this error, in stage order. Empty for
    /// configuration, cancellation, and internal errors.
    pub fn stage_failures(&self) -> &[StageError] {
        match self {
            PipelineError::Stage(failure) => std::slice::from_ref(failure),
            PipelineError::Failed { failures } => failures,
            _ => &[],
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(error) => error.fmt(f),
            PipelineError::Stage(failure) => failure.fmt(f),
            PipelineError::Failed { failures } => {
                write!(f, "{} pipeline stage(s) failed", failures.len())?;
                for failure in failures {
                    write!(f, "\n{failure}")?;
                }
                Ok(())
            }
            PipelineError::Cancelled => write!(f, "pipeline was cancelled"),
            PipelineError::Internal(message) => {
                write!(f, "pipeline task failed: {message}")
            }
        }
    }
}
