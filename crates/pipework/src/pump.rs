//! Stream pump: copies bytes from one source into zero or more sinks.
//!
//! A pump owns its source for the lifetime of one copy. It runs as its own
//! task and never blocks the caller beyond the spawn. With zero sinks the
//! source is still fully drained — a producing process must never be left
//! blocked on a full OS pipe buffer just because nobody asked for its output.
//!
//! A sink that fails mid-write is dropped from the fan-out; the remaining
//! sinks keep receiving, and the error is recorded in the pump's report. A
//! read error on the source terminates the pump and lands in the report as
//! well — errors surface as the task's result, never into nowhere.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Read chunk size for the copy loop.
const COPY_CHUNK: usize = 8 * 1024;

/// Boxed source stream accepted by [`Pump::new`].
pub type BoxedSource = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed sink stream accepted by [`Pump::sink`].
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// What a pump did, reported when its task finishes.
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Total bytes read from the source.
    pub bytes_copied: u64,
    /// Sinks that failed mid-write, by registration index, with their errors.
    pub sink_errors: Vec<(usize, io::Error)>,
    /// Error that terminated the source read, if any.
    pub read_error: Option<io::Error>,
}

impl PumpReport {
    /// True if the source reached EOF and every sink accepted every byte.
    pub fn is_clean(&self) -> bool {
        self.read_error.is_none() && self.sink_errors.is_empty()
    }

    /// All errors rendered for folding into a stage result.
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages: Vec<String> = self
            .sink_errors
            .iter()
            .map(|(index, err)| format!("sink {index}: {err}"))
            .collect();
        if let Some(err) = &self.read_error {
            messages.push(format!("read: {err}"));
        }
        messages
    }
}

/// Copies all bytes from a source to every registered sink until EOF.
pub struct Pump {
    source: BoxedSource,
    sinks: Vec<Option<BoxedSink>>,
}

impl Pump {
    /// Create a pump over the given source, with no sinks yet.
    pub fn new(source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            source: Box::new(source),
            sinks: Vec::new(),
        }
    }

    /// Register one more sink. Sinks receive bytes in registration order.
    pub fn sink(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.sinks.push(Some(Box::new(sink)));
        self
    }

    /// Spawn the copy loop on its own task.
    pub fn spawn(self) -> JoinHandle<PumpReport> {
        tokio::spawn(self.run())
    }

    /// The copy loop itself. Runs to source EOF (or read error), then
    /// half-closes every surviving sink.
    pub async fn run(mut self) -> PumpReport {
        let mut report = PumpReport::default();
        let mut buf = [0u8; COPY_CHUNK];

        loop {
            let n = match self.source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    report.read_error = Some(e);
                    break;
                }
            };
            report.bytes_copied += n as u64;

            for (index, slot) in self.sinks.iter_mut().enumerate() {
                if let Some(sink) = slot {
                    if let Err(e) = sink.write_all(&buf[..n]).await {
                        tracing::warn!(sink = index, error = %e, "pump sink failed, dropping it");
                        report.sink_errors.push((index, e));
                        *slot = None;
                    }
                }
            }
        }

        for slot in self.sinks.iter_mut() {
            if let Some(sink) = slot {
                let _ = sink.shutdown().await;
            }
        }

        report
    }
}

impl std::fmt::Debug for Pump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pump")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
