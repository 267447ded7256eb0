use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureFile};
use crate::record::{Direction, TrafficLine, TrafficRecord};

/// Most lines the writer takes off the channel before flushing.
const BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Stop capturing frames after this many; lifecycle records continue.
    pub max_frames: Option<u64>,
    /// Bytes of text kept per text frame.
    pub max_text: usize,
    /// Lines queued between the proxy and the writer task.
    pub buffer: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: None,
            max_text: 256,
            buffer: 1024,
        }
    }
}

/// Totals reported when a capture ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Lines written, the trailing summary line included.
    pub lines: u64,
    pub frames: u64,
    /// Frames lost to a full queue or the frame budget.
    pub dropped: u64,
}

/// Cloneable handle feeding the capture writer.
///
/// Submission never blocks: the proxy records from synchronous broadcast
/// paths. When the queue is full frames are counted as dropped and lifecycle
/// records are dropped with a warning. The writer ends once every clone is
/// gone, appending a summary line.
#[derive(Clone)]
pub struct TrafficRecorder {
    tx: mpsc::Sender<TrafficLine>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    max_text: usize,
}

impl TrafficRecorder {
    pub async fn start(
        path: impl AsRef<Path>,
        options: CaptureOptions,
    ) -> Result<(Self, JoinHandle<CaptureSummary>), CaptureError> {
        let file = CaptureFile::open(path).await?;
        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        let seq = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run_capture(
            file,
            rx,
            options.max_frames,
            Arc::clone(&seq),
            Arc::clone(&dropped),
        ));

        let recorder = Self {
            tx,
            seq,
            dropped,
            max_text: options.max_text,
        };
        Ok((recorder, handle))
    }

    pub fn record(&self, record: TrafficRecord) {
        let line = TrafficLine {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            at: Utc::now(),
            record,
        };
        match self.tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(line)) if line.record.is_frame() => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(seq = line.seq, "capture queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Full(line)) => {
                tracing::warn!(seq = line.seq, "capture queue full, record dropped");
            }
            Err(mpsc::error::TrySendError::Closed(line)) => {
                tracing::debug!(seq = line.seq, "capture writer gone, record dropped");
            }
        }
    }

    pub fn frame(&self, side: Direction, origin: Option<Uuid>, data: &[u8], binary: bool) {
        self.record(TrafficRecord::frame(side, origin, data, binary, self.max_text));
    }

    pub fn closed(&self, side: Direction, origin: Option<Uuid>) {
        self.record(TrafficRecord::closed(side, origin));
    }
}

async fn run_capture(
    mut file: CaptureFile,
    mut rx: mpsc::Receiver<TrafficLine>,
    max_frames: Option<u64>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
) -> CaptureSummary {
    let mut frames = 0u64;
    let mut batch = Vec::with_capacity(BATCH);

    while rx.recv_many(&mut batch, BATCH).await > 0 {
        for line in batch.drain(..) {
            let is_frame = line.record.is_frame();
            if is_frame && max_frames.is_some_and(|max| frames >= max) {
                if dropped.fetch_add(1, Ordering::SeqCst) == 0 {
                    tracing::info!(frames, "capture frame budget reached");
                }
                continue;
            }
            match file.append(&line).await {
                Ok(()) if is_frame => frames += 1,
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(error = %err, seq = line.seq, "failed to capture record");
                    if is_frame {
                        dropped.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
        if let Err(err) = file.flush().await {
            tracing::warn!(error = %err, "failed to flush capture");
        }
    }

    let dropped = dropped.load(Ordering::SeqCst);
    let summary = TrafficLine {
        seq: seq.fetch_add(1, Ordering::SeqCst),
        at: Utc::now(),
        record: TrafficRecord::Summary { frames, dropped },
    };
    if let Err(err) = file.append(&summary).await {
        tracing::warn!(error = %err, "failed to write capture summary");
    }
    if let Err(err) = file.flush().await {
        tracing::warn!(error = %err, "failed to flush capture");
    }

    tracing::debug!(lines = file.lines(), frames, dropped, "capture finished");
    CaptureSummary {
        lines: file.lines(),
        frames,
        dropped,
    }
}
