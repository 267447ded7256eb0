use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use traffic_log::{LifecycleEvent, TrafficRecord};

use crate::context::{lock, ProxyContext, Service, ServiceId};
use crate::message::{Envelope, Payload, Side};
use crate::socket::{self, SocketEvent, SocketHandle};

/// Scheme prefix that makes the target address indirect.
pub const FILE_SCHEME: &str = "file://";

/// Fixed delay before a failed connector is recreated.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to read target address from {path}: {source}")]
    ReadAddress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("target address file {path} is empty")]
    EmptyAddress { path: PathBuf },

    #[error("websocket connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Which outbound leg a connector plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorRole {
    /// The real backend. Carries client traffic out and target traffic in.
    /// Connects lazily on the first client message and may resolve its
    /// address through a `file://` indirection.
    Target,
    /// A link to another instance's relay port. Carries target traffic out
    /// and client traffic in. Connects as soon as it is created.
    Forward,
}

impl ConnectorRole {
    pub fn name(self) -> &'static str {
        match self {
            ConnectorRole::Target => "target",
            ConnectorRole::Forward => "forward",
        }
    }

    /// Direction in which frames arriving on the outbound socket are
    /// broadcast.
    pub fn inbound_side(self) -> Side {
        match self {
            ConnectorRole::Target => Side::Target,
            ConnectorRole::Forward => Side::Client,
        }
    }

    fn connects_eagerly(self) -> bool {
        self == ConnectorRole::Forward
    }

    fn resolves_files(self) -> bool {
        self == ConnectorRole::Target
    }
}

/// Turn a configured address into a connectable URL.
///
/// `file://<path>` addresses are read from disk on every call, so the target
/// may change between reconnects.
pub fn resolve_address(address: &str) -> Result<String, ConnectorError> {
    let Some(path) = address.strip_prefix(FILE_SCHEME) else {
        return Ok(address.to_string());
    };
    let path = PathBuf::from(path);
    let contents = std::fs::read_to_string(&path).map_err(|source| ConnectorError::ReadAddress {
        path: path.clone(),
        source,
    })?;
    let url = contents.trim();
    if url.is_empty() {
        return Err(ConnectorError::EmptyAddress { path });
    }
    Ok(url.to_string())
}

#[derive(Debug)]
struct Pending {
    data: Bytes,
    is_binary: bool,
}

#[derive(Debug)]
enum LinkState {
    /// No connection attempt yet (lazy target).
    Idle,
    /// Attempt in flight; broadcasts are queued.
    Connecting { pending: Vec<Pending> },
    Open { socket: SocketHandle },
    /// Disposed. A replacement may be pending.
    Closed,
}

/// An outbound WebSocket leg.
///
/// Each instance makes at most one connection. Any failure disposes the
/// instance, announces the close sentinel to the opposite side, and
/// schedules a brand-new instance after the retry delay; queued messages are
/// not carried over.
pub struct ConnectorService {
    id: ServiceId,
    role: ConnectorRole,
    address: String,
    retry_delay: Duration,
    ctx: Arc<ProxyContext>,
    me: Weak<ConnectorService>,
    state: Mutex<LinkState>,
    retried: AtomicBool,
}

impl ConnectorService {
    /// Register a connector. Forward connectors begin connecting right away.
    ///
    /// Returns `None` if the context is already disposing.
    pub fn start(
        ctx: &Arc<ProxyContext>,
        role: ConnectorRole,
        address: impl Into<String>,
        retry_delay: Duration,
    ) -> Option<Arc<Self>> {
        let connector = Arc::new_cyclic(|me| Self {
            id: ctx.next_service_id(),
            role,
            address: address.into(),
            retry_delay,
            ctx: Arc::clone(ctx),
            me: me.clone(),
            state: Mutex::new(LinkState::Idle),
            retried: AtomicBool::new(false),
        });

        if !ctx.register(connector.clone()) {
            return None;
        }

        if role.connects_eagerly() {
            *lock(&connector.state) = LinkState::Connecting {
                pending: Vec::new(),
            };
            connector.connect();
        }
        Some(connector)
    }

    pub fn role(&self) -> ConnectorRole {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        matches!(*lock(&self.state), LinkState::Open { .. })
    }

    /// Number of messages waiting for the link to open.
    pub fn pending_len(&self) -> usize {
        match &*lock(&self.state) {
            LinkState::Connecting { pending } => pending.len(),
            _ => 0,
        }
    }

    fn handle_broadcast(&self, envelope: &Envelope) {
        let data = match &envelope.payload {
            Payload::Data(data) => data,
            Payload::Closed => {
                let reason = match *lock(&self.state) {
                    LinkState::Closed => return,
                    LinkState::Open { .. } => "peer closed",
                    LinkState::Idle | LinkState::Connecting { .. } => {
                        "peer closed before link was ready"
                    }
                };
                self.fail(reason);
                return;
            }
        };

        let needs_connect = {
            let mut state = lock(&self.state);
            match &mut *state {
                LinkState::Closed => false,
                LinkState::Open { socket } => {
                    socket.send(data, envelope.is_binary);
                    false
                }
                LinkState::Connecting { pending } => {
                    pending.push(Pending {
                        data: data.clone(),
                        is_binary: envelope.is_binary,
                    });
                    false
                }
                LinkState::Idle => {
                    *state = LinkState::Connecting {
                        pending: vec![Pending {
                            data: data.clone(),
                            is_binary: envelope.is_binary,
                        }],
                    };
                    true
                }
            }
        };
        if needs_connect {
            self.connect();
        }
    }

    /// Resolve the address and spawn the connection attempt.
    fn connect(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let name = self.role.name();

        let url = if self.role.resolves_files() {
            match resolve_address(&self.address) {
                Ok(url) => {
                    if url != self.address {
                        tracing::info!("{name} look up: {} -> {url}", self.address);
                    }
                    url
                }
                Err(err) => {
                    tracing::error!(%err, "create web socket client failed");
                    self.fail("address resolution failed");
                    return;
                }
            }
        } else {
            self.address.clone()
        };

        tokio::spawn(me.run_link(url));
    }

    async fn run_link(self: Arc<Self>, url: String) {
        let name = self.role.name();

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(source) => {
                let err = ConnectorError::Connect { url, source };
                tracing::warn!(%err, "{name} error");
                self.fail("connect failed");
                return;
            }
        };

        let (socket, reader) = socket::open(ws);
        let socket_id = socket.id();
        {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, LinkState::Open { socket: socket.clone() }) {
                LinkState::Connecting { pending } => {
                    for message in pending {
                        socket.send(&message.data, message.is_binary);
                    }
                }
                LinkState::Closed => {
                    // Disposed while the handshake was in flight.
                    *state = LinkState::Closed;
                    socket.close();
                    return;
                }
                LinkState::Idle | LinkState::Open { .. } => {}
            }
        }

        tracing::info!(socket = %socket_id, "{name} connected - {}", self.address);
        self.ctx.record(
            TrafficRecord::lifecycle(LifecycleEvent::LinkConnected, name)
                .with_socket(socket_id)
                .with_address(&url),
        );

        let ctx = Arc::clone(&self.ctx);
        let side = self.role.inbound_side();
        let me = self.me.clone();
        reader.spawn(move |event| match event {
            SocketEvent::Message { data, is_binary } => {
                ctx.broadcast(side, &Envelope::new(Some(socket_id), Payload::Data(data), is_binary));
            }
            SocketEvent::Closed => {
                tracing::info!(socket = %socket_id, "{name} closed");
                ctx.record(
                    TrafficRecord::lifecycle(LifecycleEvent::LinkClosed, name)
                        .with_socket(socket_id)
                        .with_address(&url),
                );
                if let Some(connector) = me.upgrade() {
                    connector.fail("link closed");
                }
            }
        });
    }

    /// Dispose this instance and, once per failure episode, announce the
    /// outage and schedule a replacement.
    fn fail(&self, reason: &'static str) {
        if self.retried.swap(true, Ordering::SeqCst) {
            self.dispose();
            return;
        }

        // Taken before disposing so the context never looks exhausted while
        // the replacement is pending.
        let retry = (!self.ctx.is_disposed()).then(|| self.ctx.hold_retry());
        self.dispose();

        self.ctx.broadcast(self.role.inbound_side(), &Envelope::closed(None));

        let Some(retry) = retry else {
            return;
        };
        if self.ctx.is_disposed() {
            return;
        }

        let name = self.role.name();
        tracing::info!(
            reason,
            delay_ms = self.retry_delay.as_millis() as u64,
            "{name} reconnect scheduled"
        );
        self.ctx.record(
            TrafficRecord::lifecycle(LifecycleEvent::RetryScheduled, name)
                .with_address(&self.address)
                .with_details(serde_json::json!({
                    "reason": reason,
                    "delay_ms": self.retry_delay.as_millis() as u64,
                })),
        );

        let ctx = Arc::clone(&self.ctx);
        let role = self.role;
        let address = self.address.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            let _retry = retry;
            tokio::time::sleep(delay).await;
            if !ctx.is_disposed() {
                ConnectorService::start(&ctx, role, address, delay);
            }
        });
    }
}

impl Service for ConnectorService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.role.name()
    }

    fn on_client_message(&self, envelope: &Envelope) {
        if self.role.inbound_side() == Side::Target {
            self.handle_broadcast(envelope);
        }
    }

    fn on_target_message(&self, envelope: &Envelope) {
        if self.role.inbound_side() == Side::Client {
            self.handle_broadcast(envelope);
        }
    }

    fn dispose(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), LinkState::Closed);
        if let LinkState::Open { socket } = previous {
            socket.close();
        }
        self.ctx.deregister(self.id);
    }
}
