//! Integration tests for pipeline construction and execution.
//!
//! These drive real external commands (`sh`, `cat`, `sort`, `tr`, `wc`),
//! verifying stream wiring, materialization, taps, working directories,
//! environment handling, and the async handle.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipework::{Output, PipelineBuilder, PipelineError};

const MAX: usize = 64 * 1024;
const LINE_MAX: usize = 8 * 1024;

// ============================================================================
// Single-Stage Basics
// ============================================================================

#[tokio::test]
async fn echo_output_as_string() {
    let report = PipelineBuilder::new("echo")
        .arg("hello")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "hello\n");
}

#[tokio::test]
async fn fixed_string_input_reaches_stdin() {
    let report = PipelineBuilder::new("cat")
        .input_string("over the pipe")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "over the pipe");
}

#[tokio::test]
async fn line_input_is_newline_terminated() {
    let report = PipelineBuilder::new("cat")
        .input_lines(["x", "y"])
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "x\ny\n");
}

#[tokio::test]
async fn closed_stdin_is_immediate_eof() {
    let report = PipelineBuilder::new("cat")
        .no_stdin()
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "");
}

#[tokio::test]
async fn no_capture_yields_empty_output() {
    let report = PipelineBuilder::new("true").run().await.unwrap();
    assert_eq!(report.output, Output::Empty);
    assert!(report.stages[0].ok());
}

#[tokio::test]
async fn output_as_lines_respects_line_cap() {
    let report = PipelineBuilder::new("sh")
        .args(["-c", "printf 'a\\nb\\nc\\n'"])
        .output_to_lines(2, LINE_MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_lines(), vec!["a", "b"]);
}

// ============================================================================
// Multi-Stage Pipelines
// ============================================================================

#[tokio::test]
async fn two_stage_pipeline_sorts() {
    let report = PipelineBuilder::new("cat")
        .input_string("c\na\nb\n")
        .pipe_to("sort")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "a\nb\nc\n");
}

/// Identity transforms composed at least 8 deep return the input unchanged.
#[tokio::test]
async fn identity_pipeline_of_eight_stages_preserves_input() {
    let input = "first line\nsecond line\nthird line\nfourth line\n";
    let mut builder = PipelineBuilder::new("cat").input_string(input);
    for _ in 0..8 {
        builder = builder.pipe_to("cat");
    }
    let report = builder.output_to_string(MAX).run().await.unwrap();
    assert_eq!(report.stages.len(), 9);
    assert!(report.stages.iter().all(|stage| stage.ok()));
    assert_eq!(report.into_string(), input);
}

#[tokio::test]
async fn transform_stage_applies_between_identities() {
    let report = PipelineBuilder::new("cat")
        .input_string("shout\n")
        .pipe_to("tr")
        .args(["a-z", "A-Z"])
        .pipe_to("cat")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "SHOUT\n");
}

/// Data larger than any single pipe buffer flows through the whole chain.
#[tokio::test]
async fn large_payload_crosses_stage_boundaries() {
    let report = PipelineBuilder::new("sh")
        .args(["-c", "head -c 200000 /dev/zero"])
        .pipe_to("wc")
        .arg("-c")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string().trim(), "200000");
}

/// A stage whose output nobody claims is still drained; the producer must
/// never wedge on a full OS pipe buffer.
#[tokio::test]
async fn unclaimed_output_is_drained() {
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        PipelineBuilder::new("sh")
            .args(["-c", "head -c 1000000 /dev/zero"])
            .run(),
    )
    .await;
    let report = result.expect("producer deadlocked on unclaimed output").unwrap();
    assert!(report.stages[0].ok());
}

// ============================================================================
// Taps
// ============================================================================

#[tokio::test]
async fn tap_sees_every_line() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let report = PipelineBuilder::new("cat")
        .input_string("alpha\nbeta\n")
        .consume_output_lines(LINE_MAX, move |line| {
            sink.lock().unwrap().push(line.to_string());
        })
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();

    assert_eq!(report.into_string(), "alpha\nbeta\n");
    assert_eq!(*seen.lock().unwrap(), vec!["alpha", "beta"]);
}

/// A tap on an intermediate stage must not change what the final stage sees.
#[tokio::test]
async fn tap_does_not_alter_downstream_data() {
    let tapped = Arc::new(Mutex::new(Vec::new()));
    let sink = tapped.clone();

    let report = PipelineBuilder::new("cat")
        .input_string("alpha\nbeta\n")
        .consume_output_lines(LINE_MAX, move |line| {
            sink.lock().unwrap().push(line.to_string());
        })
        .pipe_to("tr")
        .args(["a-z", "A-Z"])
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();

    // Downstream saw the untouched stream; the tap saw the original lines.
    assert_eq!(report.into_string(), "ALPHA\nBETA\n");
    assert_eq!(*tapped.lock().unwrap(), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn multiple_taps_each_see_the_full_stream() {
    let first = Arc::new(Mutex::new(0usize));
    let second = Arc::new(Mutex::new(0usize));
    let a = first.clone();
    let b = second.clone();

    PipelineBuilder::new("sh")
        .args(["-c", "printf '1\\n2\\n3\\n4\\n'"])
        .consume_output_lines(LINE_MAX, move |_| *a.lock().unwrap() += 1)
        .consume_output_lines(LINE_MAX, move |_| *b.lock().unwrap() += 1)
        .run()
        .await
        .unwrap();

    assert_eq!(*first.lock().unwrap(), 4);
    assert_eq!(*second.lock().unwrap(), 4);
}

#[tokio::test]
async fn stderr_tap_is_independent_of_stdout() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();

    let report = PipelineBuilder::new("sh")
        .args(["-c", "echo out; echo warn >&2"])
        .consume_error_lines(LINE_MAX, move |line| {
            sink.lock().unwrap().push(line.to_string());
        })
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();

    assert_eq!(report.into_string(), "out\n");
    assert_eq!(*errors.lock().unwrap(), vec!["warn"]);
}

// ============================================================================
// Stderr Capture
// ============================================================================

#[tokio::test]
async fn stderr_capture_lands_in_stage_result() {
    let report = PipelineBuilder::new("sh")
        .args(["-c", "echo oops >&2"])
        .error_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.stages[0].stderr.as_deref(), Some("oops\n"));
}

// ============================================================================
// Working Directory and Environment
// ============================================================================

#[tokio::test]
async fn working_directory_is_applied_per_pipeline() {
    let in_tmp = PipelineBuilder::new("pwd")
        .directory("/tmp")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    let in_root = PipelineBuilder::new("pwd")
        .directory("/")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();

    assert!(
        in_tmp.into_string().trim().contains("tmp"),
        "first pipeline should observe /tmp"
    );
    assert_eq!(in_root.into_string().trim(), "/");
}

#[tokio::test]
async fn environment_overrides_are_visible() {
    let report = PipelineBuilder::new("sh")
        .args(["-c", "echo $PIPEWORK_TEST_VAR"])
        .env("PIPEWORK_TEST_VAR", "42")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    assert_eq!(report.into_string(), "42\n");
}

#[tokio::test]
async fn clear_env_starts_from_empty_environment() {
    let report = PipelineBuilder::new("/usr/bin/env")
        .clear_env()
        .env("ONLY_VAR", "present")
        .output_to_string(MAX)
        .run()
        .await
        .unwrap();
    let output = report.into_string();
    assert!(output.contains("ONLY_VAR=present"), "{output}");
    assert!(!output.contains("HOME="), "{output}");
}

// ============================================================================
// while_running Callback
// ============================================================================

#[tokio::test]
async fn while_running_gets_a_live_process_handle() {
    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();

    let report = PipelineBuilder::new("sh")
        .args(["-c", "sleep 0.2"])
        .while_running(move |process| {
            *slot.lock().unwrap() = Some((process.pid(), process.command().to_string()));
        })
        .run()
        .await
        .unwrap();

    assert!(report.stages[0].ok());
    let (pid, command) = observed.lock().unwrap().clone().expect("callback never ran");
    assert!(pid.is_some(), "callback should see a pid");
    assert!(command.starts_with("sh"), "{command}");
}

// ============================================================================
// Async Handle
// ============================================================================

#[tokio::test]
async fn run_async_resolves_with_the_same_report() {
    let handle = PipelineBuilder::new("echo")
        .arg("async")
        .output_to_string(MAX)
        .run_async();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.into_string(), "async\n");
}

#[tokio::test]
async fn cancel_terminates_running_stages() {
    let started = std::time::Instant::now();
    let handle = PipelineBuilder::new("sleep").arg("5").run_async();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let result = handle.wait().await;
    assert!(matches!(result, Err(PipelineError::Cancelled)), "{result:?}");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "cancellation left the stage running"
    );
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let handle = PipelineBuilder::new("true").run_async();
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();
    let report = handle.wait().await.unwrap();
    assert!(report.stages[0].ok());
}

#[tokio::test]
async fn config_defect_resolves_async_handle() {
    let handle = PipelineBuilder::new("").run_async();
    let result = handle.wait().await;
    assert!(matches!(result, Err(PipelineError::Config(_))), "{result:?}");
}
