//! Telemetry events delivered by the hook layer.
//!
//! Each event names the thread it fired on, a monotonic timestamp in
//! nanoseconds, and a kind-specific payload. On the wire an event is one JSON
//! object per line, e.g. `{"tid":7,"ts":100,"kind":"malloc","size":1024}`.

pub mod replay;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Handle, RequestId, ThreadId};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Which handle-bind instrumentation point fired. Each has its own
/// configured rebind policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindEntry {
    /// A worker picking up a handed-off handle.
    #[default]
    Handoff,
    /// A connection-processing thread.
    Connection,
}

fn unspecified_peer() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A new request was created and is reachable through `handle`.
    NewRequest { handle: Handle },
    /// `handle` belongs to an externally identified request.
    Associate { handle: Handle, request_id: RequestId },
    /// `handle` now belongs to the request this thread serves.
    PropagateHandle { handle: Handle },
    /// As `PropagateHandle`, and the thread stops serving the request.
    PropagateAndRelease { handle: Handle },
    /// The thread starts serving whatever request `handle` maps to.
    BindHandle {
        handle: Handle,
        #[serde(default)]
        entry: BindEntry,
    },
    BindDirect { request_id: RequestId },
    BindAndFlush { request_id: RequestId },
    Unbind,
    /// Periodic on-CPU accounting tick.
    CpuCheckpoint,
    /// The scheduler switched from `prev_tid` to this event's thread.
    ContextSwitch { prev_tid: ThreadId },
    PageFault,
    /// Allocation or reallocation growth of `size` bytes.
    Malloc { size: u64 },
    TcpSent { size: u64 },
    TcpReceived {
        size: i64,
        #[serde(default = "unspecified_peer")]
        peer: Ipv4Addr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub tid: ThreadId,
    pub ts: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TelemetryEvent {
    pub fn new(tid: ThreadId, ts: u64, kind: EventKind) -> Self {
        Self { tid, ts, kind }
    }
}

/// Parse one NDJSON line. Blank lines and `#` comments yield `None`.
pub fn parse_line(text: &str, line: usize) -> Result<Option<TelemetryEvent>, TelemetryError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|source| TelemetryError::Parse { line, source })
}
