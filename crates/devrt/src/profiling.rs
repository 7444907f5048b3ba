//! Trace capture for client operations.
//!
//! Client calls open a [`ScopeGuard`]; while at least one
//! [`ProfilingSession`] is active, each guard records a Chrome trace
//! complete event (`"ph": "X"`) when dropped. A session exports the events
//! recorded since it started.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::error::{RuntimeError, RuntimeResult};
use crate::shape::DeviceId;

#[derive(Debug, Clone, Serialize)]
struct ChromeTraceArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ChromeTraceEvent {
    name: &'static str,
    cat: &'static str,
    ph: &'static str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: u64,
    args: ChromeTraceArgs,
}

#[derive(Debug, Serialize)]
struct ChromeTrace<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<&'a ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
}

#[derive(Default)]
struct RecorderState {
    next_seq: u64,
    /// Recorded events keyed by sequence number.
    events: BTreeMap<u64, ChromeTraceEvent>,
    /// Active sessions and the first sequence number each one sees.
    sessions: BTreeMap<u64, u64>,
}

struct TraceRecorder {
    epoch: Instant,
    state: Mutex<RecorderState>,
}

impl TraceRecorder {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<TraceRecorder> = OnceLock::new();
        INSTANCE.get_or_init(|| TraceRecorder {
            epoch: Instant::now(),
            state: Mutex::new(RecorderState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enabled(&self) -> bool {
        !self.lock().sessions.is_empty()
    }

    fn record(&self, mut event: ChromeTraceEvent, start: Instant) {
        event.ts = start.saturating_duration_since(self.epoch).as_micros() as u64;
        let mut state = self.lock();
        if state.sessions.is_empty() {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.events.insert(seq, event);
    }

    fn open_session(&self, id: u64) {
        let mut state = self.lock();
        let start = state.next_seq;
        state.sessions.insert(id, start);
    }

    /// Removes the session and returns its trace JSON.
    fn close_session(&self, id: u64) -> serde_json::Result<Vec<u8>> {
        let mut state = self.lock();
        let start = state.sessions.remove(&id).unwrap_or(state.next_seq);
        let json = {
            let trace = ChromeTrace {
                trace_events: state
                    .events
                    .range(start..)
                    .map(|(_, event)| event)
                    .collect(),
                display_time_unit: "ms",
            };
            serde_json::to_vec_pretty(&trace)
        };
        Self::prune(&mut state);
        json
    }

    fn discard_session(&self, id: u64) {
        let mut state = self.lock();
        state.sessions.remove(&id);
        Self::prune(&mut state);
    }

    fn prune(state: &mut RecorderState) {
        match state.sessions.values().min().copied() {
            Some(oldest) => state.events = state.events.split_off(&oldest),
            None => state.events.clear(),
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRACE_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TRACE_THREAD_ID: u64 = NEXT_TRACE_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_trace_thread_id() -> u64 {
    TRACE_THREAD_ID.with(|tid| *tid)
}

/// Records one span on drop if a session was active when it was opened.
pub struct ScopeGuard {
    event: Option<(ChromeTraceEvent, Instant)>,
}

impl ScopeGuard {
    fn inactive() -> Self {
        Self { event: None }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((mut event, start)) = self.event.take() {
            event.dur = start.elapsed().as_micros() as u64;
            TraceRecorder::instance().record(event, start);
        }
    }
}

/// Opens a span named `name`. `detail` is only evaluated while a session is
/// active.
pub fn scope(
    name: &'static str,
    device: Option<DeviceId>,
    detail: impl FnOnce() -> String,
) -> ScopeGuard {
    if !TraceRecorder::instance().enabled() {
        return ScopeGuard::inactive();
    }
    ScopeGuard {
        event: Some((
            ChromeTraceEvent {
                name,
                cat: "devrt",
                ph: "X",
                ts: 0,
                dur: 0,
                pid: std::process::id(),
                tid: current_trace_thread_id(),
                args: ChromeTraceArgs {
                    device,
                    detail: Some(detail()),
                },
            },
            Instant::now(),
        )),
    }
}

/// Active trace capture. Call [`ProfilingSession::stop`] to export.
pub struct ProfilingSession {
    id: u64,
    stopped: bool,
}

impl ProfilingSession {
    pub fn start() -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        TraceRecorder::instance().open_session(id);
        log::debug!("profiling session {id} started");
        Self { id, stopped: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ends the capture and writes a Chrome trace JSON file into
    /// `export_directory`, creating it if needed. Returns the file path.
    pub fn stop(mut self, export_directory: impl AsRef<Path>) -> RuntimeResult<PathBuf> {
        const OP: &str = "profiling_session.stop";
        self.stopped = true;
        let json = TraceRecorder::instance()
            .close_session(self.id)
            .map_err(|err| RuntimeError::Io {
                op: OP,
                path: export_directory.as_ref().to_path_buf(),
                source: io::Error::other(err),
            })?;

        let dir = export_directory.as_ref();
        fs::create_dir_all(dir).map_err(|source| RuntimeError::Io {
            op: OP,
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!(
            "devrt-trace-{}-{}.json",
            std::process::id(),
            self.id
        ));
        fs::write(&path, json).map_err(|source| RuntimeError::Io {
            op: OP,
            path: path.clone(),
            source,
        })?;
        log::info!(
            "profiling session {} exported to {}",
            self.id,
            path.display()
        );
        Ok(path)
    }
}

impl Drop for ProfilingSession {
    fn drop(&mut self) {
        if !self.stopped {
            TraceRecorder::instance().discard_session(self.id);
        }
    }
}
