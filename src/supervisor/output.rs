//! Output capture - bounded ring of recent server console lines
//!
//! The ring has exactly one writer: the reader task spawned for each process
//! generation. Any number of observers (status API, console polling, readiness
//! detector) read from it concurrently.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::state_machine::StateMachine;

/// Default number of console lines kept per server.
/// Can be overridden via `log_buffer_size` in config/global.toml.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A single line of console output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`GET /api/server/console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself
    System,
}

struct RingInner {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    capacity: usize,
}

/// Thread-safe FIFO ring of the most recent console lines.
#[derive(Clone)]
pub struct OutputRing {
    inner: Arc<Mutex<RingInner>>,
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl OutputRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(RingInner {
                lines: VecDeque::with_capacity(capacity),
                next_id: 1,
                capacity,
            })),
        }
    }

    // 읽기 전용 스냅샷이 대부분이라 poison 상태여도 내부 데이터를 그대로 사용
    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Append a line, evicting the oldest one when full.
    pub fn push(&self, source: LogSource, content: impl Into<String>) -> ConsoleLine {
        let mut inner = self.lock();
        let line = ConsoleLine {
            id: inner.next_id,
            timestamp: current_timestamp(),
            source,
            content: content.into(),
        };
        inner.next_id += 1;
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.clone());
        line
    }

    /// Drop all buffered lines. IDs keep counting so pollers never see reuse.
    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Buffered line contents in arrival order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().lines.iter().map(|l| l.content.clone()).collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(count);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// All lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    pub fn any_line(&self, mut predicate: impl FnMut(&str) -> bool) -> bool {
        self.lock().lines.iter().any(|l| predicate(&l.content))
    }
}

// ─── Reader task ─────────────────────────────────────────────

/// Line source that survives cancellation inside `select!` and decodes lossily.
struct LineSource<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

async fn next_from<R: AsyncRead + Unpin>(
    source: &mut Option<LineSource<R>>,
) -> io::Result<Option<String>> {
    match source {
        Some(s) => s.next_line().await,
        None => std::future::pending().await,
    }
}

/// Spawn the single reader task for one process generation.
///
/// stdout and stderr are merged into the ring in arrival order. When both
/// streams are closed the task reports end-of-stream to the state machine,
/// which is how an unexpected exit of the server is detected.
pub(crate) fn spawn_reader<O, E>(
    stdout: O,
    stderr: Option<E>,
    ring: OutputRing,
    state: StateMachine,
    generation: u64,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut out = Some(LineSource::new(stdout));
        let mut err = stderr.map(LineSource::new);

        loop {
            let (source, next) = tokio::select! {
                line = next_from(&mut out), if out.is_some() => (LogSource::Stdout, line),
                line = next_from(&mut err), if err.is_some() => (LogSource::Stderr, line),
                else => break,
            };

            match next {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        tracing::debug!(target: "server", "{}", trimmed);
                        ring.push(source, trimmed);
                    }
                }
                Ok(None) => close_source(source, &mut out, &mut err),
                Err(e) => {
                    tracing::warn!("Failed to read server {:?}: {}", source, e);
                    close_source(source, &mut out, &mut err);
                }
            }
        }

        tracing::info!("Server output closed (generation {})", generation);
        if let Some(next) = state.finish_generation(generation) {
            ring.push(
                LogSource::System,
                format!("Server process output closed; server is now {}", next),
            );
        }
    })
}

fn close_source<O, E>(source: LogSource, out: &mut Option<O>, err: &mut Option<E>) {
    match source {
        LogSource::Stdout => *out = None,
        LogSource::Stderr => *err = None,
        LogSource::System => {}
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
