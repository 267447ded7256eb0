use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast direction a captured frame travelled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Client,
    Target,
}

/// Leg lifecycle milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    ProxyStarted,
    ProxyDisposed,
    ListenerBound,
    ListenerClosed,
    ConnectionOpened,
    ConnectionClosed,
    LinkConnected,
    LinkClosed,
    RetryScheduled,
}

/// One thing worth capturing.
///
/// `Frame` and `Closed` mirror the fabric's broadcasts: every envelope is
/// either data or the close sentinel, never both. They count against the
/// capture's frame budget; `Lifecycle` records never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficRecord {
    Lifecycle {
        event: LifecycleEvent,
        component: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        details: serde_json::Value,
    },
    Frame {
        side: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
        binary: bool,
        len: usize,
        /// Text frames only, cut to the capture's text limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },
    Closed {
        side: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
    },
    /// Written once when the capture ends.
    Summary {
        frames: u64,
        dropped: u64,
    },
}

impl TrafficRecord {
    pub fn lifecycle(event: LifecycleEvent, component: impl Into<String>) -> Self {
        TrafficRecord::Lifecycle {
            event,
            component: component.into(),
            socket: None,
            address: None,
            details: serde_json::Value::Null,
        }
    }

    /// Capture a data frame. Binary payloads are recorded by length only;
    /// text is kept up to `max_text` bytes, cut on a character boundary.
    pub fn frame(
        side: Direction,
        origin: Option<Uuid>,
        data: &[u8],
        binary: bool,
        max_text: usize,
    ) -> Self {
        let (text, truncated) = if binary {
            (None, false)
        } else {
            let full = String::from_utf8_lossy(data);
            let mut end = full.len().min(max_text);
            while !full.is_char_boundary(end) {
                end -= 1;
            }
            (Some(full[..end].to_string()), end < full.len())
        };
        TrafficRecord::Frame {
            side,
            origin,
            binary,
            len: data.len(),
            text,
            truncated,
        }
    }

    pub fn closed(side: Direction, origin: Option<Uuid>) -> Self {
        TrafficRecord::Closed { side, origin }
    }

    /// Set the socket of a lifecycle record. Other kinds are unchanged.
    pub fn with_socket(mut self, id: impl Into<Uuid>) -> Self {
        if let TrafficRecord::Lifecycle { socket, .. } = &mut self {
            *socket = Some(id.into());
        }
        self
    }

    pub fn with_address(mut self, addr: impl ToString) -> Self {
        if let TrafficRecord::Lifecycle { address, .. } = &mut self {
            *address = Some(addr.to_string());
        }
        self
    }

    pub fn with_details(mut self, value: serde_json::Value) -> Self {
        if let TrafficRecord::Lifecycle { details, .. } = &mut self {
            *details = value;
        }
        self
    }

    /// Whether this record counts against the frame budget.
    pub fn is_frame(&self) -> bool {
        matches!(self, TrafficRecord::Frame { .. } | TrafficRecord::Closed { .. })
    }
}

/// A record as it appears on disk: capture-wide sequence number, wall-clock
/// time, and the record itself.
///
/// Sequence numbers are taken when the record is submitted; gaps mean records
/// were dropped before reaching the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub record: TrafficRecord,
}
