//! JSON-lines traffic capture for ws-proxy.
//!
//! The proxy hands every broadcast envelope (data frame or close sentinel)
//! and every leg lifecycle milestone to a [`TrafficRecorder`]. A background
//! task appends them as [`TrafficLine`]s, one JSON object per line, each
//! carrying a capture-wide sequence number so drops show up as gaps.
//!
//! ```rust,no_run
//! use traffic_log::{CaptureOptions, Direction, TrafficRecorder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (recorder, handle) =
//!     TrafficRecorder::start("traffic.jsonl", CaptureOptions::default()).await?;
//! recorder.frame(Direction::Target, None, b"hello", false);
//! drop(recorder);
//! let summary = handle.await?;
//! println!("{} frames captured", summary.frames);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod record;
pub mod recorder;

pub use capture::{CaptureError, CaptureFile};
pub use record::{Direction, LifecycleEvent, TrafficLine, TrafficRecord};
pub use recorder::{CaptureOptions, CaptureSummary, TrafficRecorder};
