//! pipework: a process pipeline execution engine.
//!
//! This crate spawns one or more external processes, wires their standard
//! streams together into a shell-like pipe chain, fans a stream out to
//! several independent consumers at once, enforces soft and hard timeouts,
//! and reports failures from every stage as a single aggregated result.
//!
//! - **Builder**: fluent construction of one or more stages, frozen into an
//!   immutable [`Pipeline`]
//! - **Pump**: copies bytes from one stream into zero or more sinks on its
//!   own task
//! - **Tee**: splits one stream into N bounded, independently-paced views
//! - **Executor**: spawns, wires, and drains a pipeline, honoring timeouts
//! - **Errors**: per-stage failures aggregated under one pipeline error
//!
//! ```no_run
//! # async fn demo() -> Result<(), pipework::PipelineError> {
//! use pipework::PipelineBuilder;
//!
//! let report = PipelineBuilder::new("cat")
//!     .input_string("c\na\nb\n")
//!     .pipe_to("sort")
//!     .output_to_lines(1000, 8 * 1024)
//!     .run()
//!     .await?;
//! assert_eq!(report.into_lines(), vec!["a", "b", "c"]);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod error;
mod executor;
pub mod handle;
pub mod pump;
pub mod result;
pub mod tee;

pub use builder::{Pipeline, PipelineBuilder};
pub use config::{
    Capture, Input, LineConsumer, StageConfig, StageProcess, StreamPlan, Tap, WhileRunning,
    DEFAULT_GATHER_MAX_BYTES, DEFAULT_LINE_MAX_BYTES,
};
pub use error::{ConfigError, PipelineError, StageError};
pub use handle::PipelineHandle;
pub use pump::{Pump, PumpReport};
pub use result::{Output, PipelineReport, StageResult};
pub use tee::{tee, TeeSink, TeeView, TEE_BUFFER_SIZE};
