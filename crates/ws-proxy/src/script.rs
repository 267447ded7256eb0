//! Scripted message injection.
//!
//! A script is a `;`-separated list of entries:
//!
//! ```text
//! c:100:hi there; t:1000:go fast; 2000:turn left; repeat
//! ```
//!
//! * `c:<delay>:<text>` sends `text` to every service's client handler after
//!   `delay` milliseconds.
//! * `t:<delay>:<text>` (or any other tag) does the same on the target side.
//! * `<delay>:<text>` is shorthand for a target message.
//! * `repeat` restarts from the first entry after a short pause.
//! * `close` disposes the whole proxy.
//!
//! Fields are split on every `:`, so text ends at the next `:`
//! (`t:1000:go t:fast` sends `go t`). Entries with a missing or non-numeric
//! delay, or with empty text, are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::{deliver, ProxyContext, Service, ServiceId};
use crate::message::{Envelope, Payload, Side};

/// Pause before a `repeat` entry wraps back to the start.
pub const REPEAT_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEntry {
    Message {
        side: Side,
        delay: Duration,
        text: String,
    },
    Repeat,
    Close,
}

/// Parse a script, silently dropping malformed entries.
pub fn parse_script(script: &str) -> Vec<ScriptEntry> {
    script.split(';').filter_map(parse_entry).collect()
}

fn parse_entry(raw: &str) -> Option<ScriptEntry> {
    let fields: Vec<&str> = raw.split(':').map(str::trim).collect();
    let field = |index: usize| fields.get(index).copied().unwrap_or("");
    let tag = field(0);

    match tag {
        "repeat" => return Some(ScriptEntry::Repeat),
        "close" => return Some(ScriptEntry::Close),
        _ => {}
    }

    let (side, delay, text) = match tag.parse::<u64>() {
        Ok(delay) => (Side::Target, Some(delay), field(1)),
        Err(_) => {
            let side = if tag == "c" { Side::Client } else { Side::Target };
            (side, field(1).parse::<u64>().ok(), field(2))
        }
    };

    let delay = delay?;
    if text.is_empty() {
        return None;
    }
    Some(ScriptEntry::Message {
        side,
        delay: Duration::from_millis(delay),
        text: text.to_string(),
    })
}

/// Replays a parsed script against the context on its own task.
pub struct ScriptService {
    id: ServiceId,
    ctx: Arc<ProxyContext>,
    entries: Vec<ScriptEntry>,
    disposed: AtomicBool,
}

impl ScriptService {
    /// Parse `script`, register, and start replaying.
    pub fn start(ctx: &Arc<ProxyContext>, script: &str) -> Option<Arc<Self>> {
        let entries = parse_script(script);
        tracing::info!(entries = entries.len(), "script loaded");

        let service = Arc::new(Self {
            id: ctx.next_service_id(),
            ctx: Arc::clone(ctx),
            entries,
            disposed: AtomicBool::new(false),
        });
        if !ctx.register(service.clone()) {
            return None;
        }

        tokio::spawn(Arc::clone(&service).replay());
        Some(service)
    }

    pub fn entries(&self) -> &[ScriptEntry] {
        &self.entries
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn stopped(&self) -> bool {
        self.is_disposed() || self.ctx.is_disposed()
    }

    async fn replay(self: Arc<Self>) {
        let mut index = 0;
        while let Some(entry) = self.entries.get(index) {
            if self.stopped() {
                return;
            }
            match entry {
                ScriptEntry::Close => {
                    tracing::info!("script requested shutdown");
                    self.ctx.dispose();
                    return;
                }
                ScriptEntry::Repeat => {
                    tokio::time::sleep(REPEAT_PAUSE).await;
                    index = 0;
                    continue;
                }
                ScriptEntry::Message { side, delay, text } => {
                    tokio::time::sleep(*delay).await;
                    if self.stopped() {
                        return;
                    }
                    tracing::debug!(side = side.as_str(), text, "script message");
                    // Straight to the handlers: scripted traffic has no origin
                    // socket and is not fanned out as if a socket produced it.
                    let envelope = Envelope::new(None, Payload::text(text.as_str()), false);
                    self.ctx.capture(*side, &envelope);
                    for service in self.ctx.services() {
                        deliver(service.as_ref(), *side, &envelope);
                    }
                }
            }
            index += 1;
        }
        tracing::debug!("script finished");
    }
}

impl Service for ScriptService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &'static str {
        "messages"
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.ctx.deregister(self.id);
    }
}
