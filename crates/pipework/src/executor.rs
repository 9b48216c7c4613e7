//! Pipeline execution: spawn, wire, drain.
//!
//! The executor drives a frozen [`Pipeline`] through its run:
//!
//! ```text
//!   SPAWNING ──▶ RUNNING ──▶ DRAINING ──▶ COMPLETED | FAILED
//!   spawn every   start pumps,  await exits,   report or
//!   stage's       tees, taps,   pumps, taps,   aggregated
//!   process       feeders,      callbacks;     failure
//!   in order      callbacks     fire timeouts
//! ```
//!
//! Every stream of every stage is owned by exactly one pump or tee claimant
//! for the lifetime of the run. A spawn failure part-way through terminates
//! and reaps the already-spawned stages before surfacing. Soft timeouts send
//! SIGTERM; hard timeouts and cancellation force a kill. Children are spawned
//! with `kill_on_drop`, so even a dropped executor leaves no orphans.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::builder::Pipeline;
use crate::config::{
    Capture, Input, StageConfig, StageProcess, StreamPlan, Tap, DEFAULT_GATHER_MAX_BYTES,
};
use crate::error::{PipelineError, StageError};
use crate::pump::{Pump, PumpReport};
use crate::result::{Output, PipelineReport, StageResult};
use crate::tee::{tee, TeeView, TEE_BUFFER_SIZE};

/// Grace between a cancellation's termination request and the forced kill.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Stand-in deadline for timers that are not armed.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Deliver SIGTERM to a process by pid. No-op without a pid, or off unix.
#[cfg(unix)]
pub(crate) fn terminate_pid(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to deliver SIGTERM");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_pid(_pid: Option<u32>) {}

/// Cooperative termination: SIGTERM on unix, forced kill elsewhere.
#[cfg(unix)]
fn request_soft_kill(_child: &mut Child, pid: Option<u32>) {
    terminate_pid(pid);
}

#[cfg(not(unix))]
fn request_soft_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Runs one frozen pipeline to completion or failure.
pub(crate) struct Executor {
    stages: Vec<StageConfig>,
    cancel: CancellationToken,
}

/// One spawned stage awaiting wiring.
struct SpawnedStage {
    config: StageConfig,
    command_line: String,
    child: Child,
    pid: Option<u32>,
    started: Instant,
}

/// The tasks attached to one running stage.
#[derive(Default)]
struct StageTasks {
    pumps: Vec<JoinHandle<PumpReport>>,
    /// Stdin feeders, downstream feeders, taps.
    aux: Vec<JoinHandle<()>>,
    stdout_capture: Option<JoinHandle<Output>>,
    stderr_capture: Option<JoinHandle<Output>>,
    gather_out: Option<JoinHandle<String>>,
    gather_err: Option<JoinHandle<String>>,
    callback: Option<JoinHandle<()>>,
}

/// One stage in flight: its waiter plus its attached tasks.
struct StageRuntime {
    command_line: String,
    wait: JoinHandle<WaitOutcome>,
    tasks: StageTasks,
}

/// What the per-stage wait loop observed.
#[derive(Debug, Default)]
struct WaitOutcome {
    code: i64,
    soft_timed_out: bool,
    hard_timed_out: bool,
    cancelled: bool,
    wait_error: Option<String>,
    elapsed: Duration,
}

impl Executor {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self::with_cancel(pipeline, CancellationToken::new())
    }

    pub(crate) fn with_cancel(pipeline: Pipeline, cancel: CancellationToken) -> Self {
        Self {
            stages: pipeline.stages,
            cancel,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(stages = self.stages.len()))]
    pub(crate) async fn run(self) -> Result<PipelineReport, PipelineError> {
        let Executor { stages, cancel } = self;
        let total = stages.len();
        let multi = total > 1;

        // ── SPAWNING ────────────────────────────────────────────────────
        tracing::debug!("spawning {total} stage(s)");
        let mut spawned: Vec<SpawnedStage> = Vec::with_capacity(total);
        for (index, config) in stages.into_iter().enumerate() {
            let command_line = config.command_line();
            let mut cmd = Command::new(&config.program);
            cmd.args(&config.args);
            if let Some(dir) = &config.cwd {
                cmd.current_dir(dir);
            }
            if config.clear_env {
                cmd.env_clear();
            }
            for (key, value) in &config.env {
                cmd.env(key, value);
            }
            cmd.stdin(match &config.input {
                Input::Inherit => Stdio::inherit(),
                Input::Null => Stdio::null(),
                Input::Bytes(_) | Input::Lines(_) | Input::Piped => Stdio::piped(),
            });
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.kill_on_drop(true);

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(source) => {
                    tracing::warn!(
                        stage = index,
                        command = %command_line,
                        error = %source,
                        "spawn failed, reaping earlier stages"
                    );
                    for earlier in spawned.iter_mut() {
                        let _ = earlier.child.start_kill();
                    }
                    for earlier in spawned.iter_mut() {
                        let _ = earlier.child.wait().await;
                    }
                    let failure = StageError::Spawn {
                        stage: index,
                        command: command_line,
                        source,
                    };
                    return Err(if multi {
                        PipelineError::Failed {
                            failures: vec![failure],
                        }
                    } else {
                        PipelineError::Stage(failure)
                    });
                }
            };
            let pid = child.id();
            tracing::trace!(stage = index, ?pid, command = %command_line, "stage spawned");
            spawned.push(SpawnedStage {
                config,
                command_line,
                child,
                pid,
                started: Instant::now(),
            });
        }

        // ── RUNNING ─────────────────────────────────────────────────────
        tracing::debug!("running: attaching pumps, tees, feeders, callbacks");

        // Pull every stdin handle up front so stage k's wiring can hand
        // stage k+1 its write end.
        let mut stdins: Vec<Option<ChildStdin>> = spawned
            .iter_mut()
            .map(|stage| stage.child.stdin.take())
            .collect();

        let mut runtimes: Vec<StageRuntime> = Vec::with_capacity(total);
        for (i, mut stage) in spawned.into_iter().enumerate() {
            let mut tasks = StageTasks::default();

            // Fixed stdin content is written by its own feeder task.
            let input = std::mem::replace(&mut stage.config.input, Input::Null);
            let feed: Option<Vec<u8>> = match input {
                Input::Bytes(bytes) => Some(bytes),
                Input::Lines(lines) => {
                    if lines.is_empty() {
                        Some(Vec::new())
                    } else {
                        let mut data = lines.join("\n").into_bytes();
                        data.push(b'\n');
                        Some(data)
                    }
                }
                _ => None,
            };
            if let Some(data) = feed {
                if let Some(mut stdin) = stdins[i].take() {
                    tasks.aux.push(tokio::spawn(async move {
                        if let Err(e) = stdin.write_all(&data).await {
                            tracing::debug!(error = %e, "stage stopped reading its stdin");
                        }
                        let _ = stdin.shutdown().await;
                    }));
                }
            }

            let stdout_plan = std::mem::take(&mut stage.config.stdout);
            let stderr_plan = std::mem::take(&mut stage.config.stderr);
            let gather = stage.config.gather_on_fail;

            let downstream = if i + 1 < total {
                stdins[i + 1].take()
            } else {
                None
            };

            if let Some(out) = stage.child.stdout.take() {
                let gather_wanted = gather && stdout_plan.capture == Capture::None;
                let wired = wire_stream(out, stdout_plan, gather_wanted, downstream);
                tasks.pumps.extend(wired.pump);
                tasks.aux.extend(wired.aux);
                tasks.stdout_capture = wired.capture;
                tasks.gather_out = wired.gather;
            }

            if let Some(err) = stage.child.stderr.take() {
                let gather_wanted = gather && stderr_plan.capture == Capture::None;
                let wired = wire_stream(err, stderr_plan, gather_wanted, None);
                tasks.pumps.extend(wired.pump);
                tasks.aux.extend(wired.aux);
                tasks.stderr_capture = wired.capture;
                tasks.gather_err = wired.gather;
            }

            if let Some(callback) = stage.config.while_running.take() {
                let process = StageProcess::new(stage.pid, stage.command_line.clone());
                tasks.callback = Some(tokio::task::spawn_blocking(move || callback(&process)));
            }

            let wait = tokio::spawn(wait_child(
                stage.child,
                stage.pid,
                stage.started,
                stage.config.soft_timeout,
                stage.config.hard_timeout,
                cancel.clone(),
            ));

            runtimes.push(StageRuntime {
                command_line: stage.command_line,
                wait,
                tasks,
            });
        }

        // ── DRAINING ────────────────────────────────────────────────────
        tracing::debug!("draining: awaiting exits, pumps, taps, callbacks");
        let mut results: Vec<StageResult> = Vec::with_capacity(total);
        let mut failures: Vec<StageError> = Vec::new();
        let mut output = Output::Empty;
        let mut cancelled = false;

        for (index, runtime) in runtimes.into_iter().enumerate() {
            let outcome = match runtime.wait.await {
                Ok(outcome) => outcome,
                Err(e) => WaitOutcome {
                    code: -1,
                    wait_error: Some(format!("wait task: {e}")),
                    ..WaitOutcome::default()
                },
            };
            cancelled |= outcome.cancelled;

            let mut stream_errors: Vec<String> = outcome.wait_error.into_iter().collect();
            for pump in runtime.tasks.pumps {
                match pump.await {
                    Ok(report) => stream_errors.extend(report.error_messages()),
                    Err(e) => stream_errors.push(format!("pump task: {e}")),
                }
            }
            for task in runtime.tasks.aux {
                if let Err(e) = task.await {
                    stream_errors.push(format!("stream task: {e}"));
                }
            }
            if let Some(callback) = runtime.tasks.callback {
                if let Err(e) = callback.await {
                    stream_errors.push(format!("while_running callback: {e}"));
                }
            }

            let stdout_value = match runtime.tasks.stdout_capture {
                Some(handle) => handle.await.ok(),
                None => None,
            };
            let stderr_value = match runtime.tasks.stderr_capture {
                Some(handle) => handle.await.ok(),
                None => None,
            };
            let gather_out = match runtime.tasks.gather_out {
                Some(handle) => handle.await.ok(),
                None => None,
            };
            let gather_err = match runtime.tasks.gather_err {
                Some(handle) => handle.await.ok(),
                None => None,
            };

            // Exactly one of capture/gather exists per stream.
            let stdout_text = gather_out.or_else(|| stdout_value.clone().map(Output::into_string));
            let stderr_text = gather_err.or_else(|| stderr_value.map(Output::into_string));

            if index + 1 == total {
                if let Some(value) = stdout_value {
                    output = value;
                }
            }

            let result = StageResult {
                command: runtime.command_line,
                code: outcome.code,
                stdout: stdout_text,
                stderr: stderr_text,
                elapsed: outcome.elapsed,
                soft_timed_out: outcome.soft_timed_out,
                hard_timed_out: outcome.hard_timed_out,
                stream_errors,
            };
            if !result.ok() {
                tracing::debug!(stage = index, code = result.code, "stage failed");
                failures.push(StageError::Exit {
                    stage: index,
                    result: result.clone(),
                });
            }
            results.push(result);
        }

        if cancelled {
            tracing::debug!("pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }
        if failures.is_empty() {
            tracing::debug!("pipeline completed");
            Ok(PipelineReport {
                output,
                stages: results,
            })
        } else if multi {
            Err(PipelineError::Failed { failures })
        } else {
            Err(PipelineError::Stage(failures.remove(0)))
        }
    }
}

/// Wait for one child to exit, arming the stage's deadlines.
///
/// Soft expiry requests cooperative termination; hard expiry forces it;
/// cancellation requests termination and forces it after a short grace.
/// The flags record that a deadline elapsed, regardless of whether the
/// termination shortened the process's run.
async fn wait_child(
    mut child: Child,
    pid: Option<u32>,
    started: Instant,
    soft: Option<Duration>,
    hard: Option<Duration>,
    cancel: CancellationToken,
) -> WaitOutcome {
    let far = started + FAR_FUTURE;
    let soft_at = soft.map(|d| started + d).unwrap_or(far);
    let hard_at = hard.map(|d| started + d).unwrap_or(far);
    let mut kill_at = far;
    let mut outcome = WaitOutcome::default();

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        outcome.code = status.code().map(i64::from).unwrap_or(-1);
                    }
                    Err(e) => {
                        outcome.code = -1;
                        outcome.wait_error = Some(format!("wait: {e}"));
                    }
                }
                break;
            }
            _ = sleep_until(soft_at), if soft.is_some() && !outcome.soft_timed_out => {
                outcome.soft_timed_out = true;
                tracing::debug!(?pid, "soft timeout elapsed, requesting termination");
                request_soft_kill(&mut child, pid);
            }
            _ = sleep_until(hard_at), if hard.is_some() && !outcome.hard_timed_out => {
                outcome.hard_timed_out = true;
                tracing::debug!(?pid, "hard timeout elapsed, forcing termination");
                let _ = child.start_kill();
            }
            _ = cancel.cancelled(), if !outcome.cancelled => {
                outcome.cancelled = true;
                tracing::debug!(?pid, "cancellation requested, terminating stage");
                request_soft_kill(&mut child, pid);
                kill_at = Instant::now() + CANCEL_GRACE;
            }
            _ = sleep_until(kill_at), if outcome.cancelled => {
                let _ = child.start_kill();
                kill_at = far;
            }
        }
    }

    outcome.elapsed = started.elapsed();
    outcome
}

/// The tasks wired onto one stream of one stage.
#[derive(Default)]
struct WiredStream {
    pump: Option<JoinHandle<PumpReport>>,
    aux: Vec<JoinHandle<()>>,
    capture: Option<JoinHandle<Output>>,
    gather: Option<JoinHandle<String>>,
}

/// Attach a stream's claimants: the downstream pipe (stdout only), every
/// tap, the terminal capture, and the gather-on-fail slot. With no claimants
/// the stream is drained outright so the producer never blocks.
fn wire_stream<R>(
    source: R,
    plan: StreamPlan,
    gather_wanted: bool,
    downstream: Option<ChildStdin>,
) -> WiredStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let claimants =
        plan.claimants() + usize::from(downstream.is_some()) + usize::from(gather_wanted);
    let mut wired = WiredStream::default();

    if claimants == 0 {
        wired.pump = Some(Pump::new(source).spawn());
        return wired;
    }

    let (sink, views) = tee(claimants, TEE_BUFFER_SIZE);
    wired.pump = Some(Pump::new(source).sink(sink).spawn());
    let mut views = views.into_iter();

    if let Some(stdin) = downstream {
        if let Some(view) = views.next() {
            wired.aux.push(tokio::spawn(feed_downstream(view, stdin)));
        }
    }
    for tap in plan.taps {
        if let Some(view) = views.next() {
            wired.aux.push(tokio::spawn(run_tap(view, tap)));
        }
    }
    match plan.capture {
        Capture::None => {}
        Capture::Text { max_bytes } => {
            if let Some(view) = views.next() {
                wired.capture = Some(tokio::spawn(async move {
                    Output::Text(read_capped_text(view, max_bytes).await)
                }));
            }
        }
        Capture::Lines {
            max_lines,
            max_line_bytes,
        } => {
            if let Some(view) = views.next() {
                wired.capture = Some(tokio::spawn(async move {
                    Output::Lines(read_capped_lines(view, max_lines, max_line_bytes).await)
                }));
            }
        }
    }
    if gather_wanted {
        if let Some(view) = views.next() {
            wired.gather = Some(tokio::spawn(read_capped_text(view, DEFAULT_GATHER_MAX_BYTES)));
        }
    }

    wired
}

/// Copy a tee view into the next stage's stdin, then half-close it.
async fn feed_downstream(mut view: TeeView, mut stdin: ChildStdin) {
    if let Err(e) = tokio::io::copy(&mut view, &mut stdin).await {
        // Downstream stage went away; dropping the view discards the rest.
        tracing::debug!(error = %e, "downstream stage stopped consuming");
    }
    let _ = stdin.shutdown().await;
}

/// Deliver each line of a view to its tap consumer.
async fn run_tap(view: TeeView, tap: Tap) {
    let consumer = tap.consumer;
    for_each_line(view, tap.max_line_bytes, |line| consumer(line)).await;
}

/// Read a stream to EOF, retaining at most `max_bytes`. The remainder is
/// still drained so the tee never stalls on this claimant.
async fn read_capped_text(mut source: impl AsyncRead + Unpin, max_bytes: usize) -> String {
    let mut retained: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(retained.len());
                retained.extend_from_slice(&chunk[..room.min(n)]);
            }
        }
    }
    String::from_utf8_lossy(&retained).into_owned()
}

/// Read a stream to EOF, retaining at most `max_lines` lines of at most
/// `max_line_bytes` each. The remainder is still drained.
async fn read_capped_lines(
    source: impl AsyncRead + Unpin,
    max_lines: usize,
    max_line_bytes: usize,
) -> Vec<String> {
    let mut lines = Vec::new();
    for_each_line(source, max_line_bytes, |line| {
        if lines.len() < max_lines {
            lines.push(line.to_string());
        }
    })
    .await;
    lines
}

/// Split a stream into `\n`-terminated lines and feed each to `f`, capping
/// every line at `max_line_bytes` (overflow is dropped, not re-split). A
/// trailing `\r` is trimmed; a final unterminated line is still delivered.
async fn for_each_line(
    mut source: impl AsyncRead + Unpin,
    max_line_bytes: usize,
    mut f: impl FnMut(&str),
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut overflowed = false;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match source.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut rest = &chunk[..n];
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            push_capped(&mut pending, &rest[..pos], max_line_bytes, &mut overflowed);
            emit_line(&mut pending, &mut f);
            overflowed = false;
            rest = &rest[pos + 1..];
        }
        push_capped(&mut pending, rest, max_line_bytes, &mut overflowed);
    }
    if !pending.is_empty() || overflowed {
        emit_line(&mut pending, &mut f);
    }
}

fn push_capped(pending: &mut Vec<u8>, bytes: &[u8], cap: usize, overflowed: &mut bool) {
    let room = cap.saturating_sub(pending.len());
    if bytes.len() > room {
        *overflowed = true;
    }
    pending.extend_from_slice(&bytes[..room.min(bytes.len())]);
}

fn emit_line(pending: &mut Vec<u8>, f: &mut impl FnMut(&str)) {
    if pending.last() == Some(&b'\r') {
        pending.pop();
    }
    f(&String::from_utf8_lossy(pending));
    pending.clear();
}
