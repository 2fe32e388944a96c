//! Callbacks the agent hands to the pipeline executor.
//!
//! `UploadLogger` captures a step's output into JSON log lines and uploads
//! them once the stream ends. `StatusTracer` stamps build variables into the
//! step environment and reports step state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::domain::{ExecutionState, LogArtifact, LogLine, Step, TaskId, now_unix};
use crate::ports::{LogStream, StepLogger, TraceState, Tracer};
use crate::rpc::Peer;

/// Largest read from a step's output stream in one go.
const READ_CHUNK: u64 = 64 * 1024;

/// Collects output lines for one step, up to a byte limit.
///
/// Bytes past the limit are dropped; a line straddling it is cut.
#[derive(Debug)]
pub struct LineWriter {
    proc: String,
    opened: Instant,
    limit: usize,
    written: usize,
    truncated: bool,
    lines: Vec<LogLine>,
}

impl LineWriter {
    pub fn new(proc: impl Into<String>, limit: usize) -> Self {
        Self {
            proc: proc.into(),
            opened: Instant::now(),
            limit,
            written: 0,
            truncated: false,
            lines: Vec::new(),
        }
    }

    /// Append one raw line (trailing newline included, if any).
    pub fn write(&mut self, raw: &str) {
        let remaining = self.remaining();
        if remaining == 0 {
            self.truncated |= !raw.is_empty();
            return;
        }

        let kept = if raw.len() > remaining {
            self.truncated = true;
            let mut end = remaining;
            while !raw.is_char_boundary(end) {
                end -= 1;
            }
            &raw[..end]
        } else {
            raw
        };
        if kept.is_empty() {
            return;
        }

        self.written += kept.len();
        self.lines.push(LogLine {
            proc: self.proc.clone(),
            pos: self.lines.len(),
            time: self.opened.elapsed().as_secs() as i64,
            out: kept.to_string(),
        });
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    /// Bytes that can still be captured before the limit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.written)
    }

    /// Encode the lines as a JSON array of at most `max_bytes`, dropping
    /// lines from the end until it fits.
    pub fn encode(&self, max_bytes: usize) -> serde_json::Result<String> {
        let encoded = self
            .lines
            .iter()
            .map(serde_json::to_string)
            .collect::<serde_json::Result<Vec<_>>>()?;

        // "[" + items joined by "," + "]"
        let mut size = 2;
        let mut keep = 0;
        for (i, item) in encoded.iter().enumerate() {
            let next = size + item.len() + usize::from(i > 0);
            if next > max_bytes {
                break;
            }
            size = next;
            keep += 1;
        }

        let mut out = String::with_capacity(size);
        out.push('[');
        for (i, item) in encoded.iter().take(keep).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(item);
        }
        out.push(']');
        Ok(out)
    }
}

/// Captures step output and uploads it as a log artifact.
///
/// Every `log` call, and the upload it starts, is tracked by `uploads`, so
/// closing and waiting on the tracker waits for all logs to be delivered.
pub struct UploadLogger {
    peer: Arc<dyn Peer>,
    task_id: TaskId,
    max_log_bytes: usize,
    max_upload_bytes: usize,
    mirror: bool,
    uploads: TaskTracker,
}

impl UploadLogger {
    pub fn new(
        peer: Arc<dyn Peer>,
        task_id: TaskId,
        max_log_bytes: usize,
        max_upload_bytes: usize,
        mirror: bool,
        uploads: TaskTracker,
    ) -> Self {
        Self {
            peer,
            task_id,
            max_log_bytes,
            max_upload_bytes,
            mirror,
            uploads,
        }
    }
}

#[async_trait]
impl StepLogger for UploadLogger {
    async fn log(&self, step: &Step, output: LogStream) -> std::io::Result<()> {
        let _tracked = self.uploads.token();
        let mut reader = BufReader::new(output);
        let mut writer = LineWriter::new(&step.alias, self.max_log_bytes);
        let mut stderr = tokio::io::stderr();
        let mut chunk = Vec::new();
        // Current line, held to one byte past what the writer still accepts.
        let mut line = Vec::new();

        loop {
            chunk.clear();
            let read = (&mut reader)
                .take(READ_CHUNK)
                .read_until(b'\n', &mut chunk)
                .await;
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        task_id = %self.task_id,
                        proc = %step.alias,
                        error = %e,
                        "step output stream failed"
                    );
                    break;
                }
            }
            if self.mirror && stderr.write_all(&chunk).await.is_err() {
                debug!("stderr mirror closed");
            }

            let room = writer
                .remaining()
                .saturating_add(1)
                .saturating_sub(line.len());
            line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if chunk.ends_with(b"\n") {
                writer.write(&String::from_utf8_lossy(&line));
                line.clear();
            }
        }
        if !line.is_empty() {
            writer.write(&String::from_utf8_lossy(&line));
        }

        if writer.is_truncated() {
            warn!(
                task_id = %self.task_id,
                proc = %step.alias,
                limit = self.max_log_bytes,
                "step output truncated"
            );
        }

        let data = writer.encode(self.max_upload_bytes)?;
        let file = LogArtifact::logs(&step.alias, data);
        let peer = self.peer.clone();
        let task_id = self.task_id.clone();
        self.uploads.spawn(async move {
            let proc = file.proc.clone();
            match peer.upload(&task_id, file).await {
                Ok(()) => debug!(task_id = %task_id, proc = %proc, "logs uploaded"),
                Err(e) => warn!(task_id = %task_id, proc = %proc, error = %e, "cannot upload logs"),
            }
        });
        Ok(())
    }
}

/// Stamps build variables into steps and reports each step transition.
pub struct StatusTracer {
    peer: Arc<dyn Peer>,
    task_id: TaskId,
    seq: AtomicU64,
}

impl StatusTracer {
    pub fn new(peer: Arc<dyn Peer>, task_id: TaskId) -> Self {
        Self {
            peer,
            task_id,
            seq: AtomicU64::new(0),
        }
    }
}

/// Set the `CI_BUILD_*` and `CI_JOB_*` variables for a step about to run.
pub fn stamp_environment(state: &mut TraceState, now: i64) {
    let status = if state.pipeline.error.is_some() {
        "failure"
    } else {
        "success"
    };
    let started = state.pipeline.started.to_string();
    let finished = now.to_string();

    let env = state.step.environment_mut();
    env.insert("CI_BUILD_STATUS".into(), status.into());
    env.insert("CI_BUILD_STARTED".into(), started.clone());
    env.insert("CI_BUILD_FINISHED".into(), finished.clone());
    env.insert("CI_JOB_STATUS".into(), status.into());
    env.insert("CI_JOB_STARTED".into(), started);
    env.insert("CI_JOB_FINISHED".into(), finished);
}

#[async_trait]
impl Tracer for StatusTracer {
    async fn trace(&self, state: &mut TraceState) {
        let now = now_unix();
        let process = &state.process;
        let report = ExecutionState {
            proc: state.step.alias.clone(),
            started: if process.started != 0 { process.started } else { now },
            finished: if process.exited { now } else { 0 },
            exited: process.exited,
            exit_code: process.exit_code,
            error: None,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
        };

        if !state.process.exited {
            stamp_environment(state, now);
        }

        if let Err(e) = self.peer.update(&self.task_id, report).await {
            warn!(
                task_id = %self.task_id,
                proc = %state.step.alias,
                error = %e,
                "cannot update step status"
            );
        }
    }
}
