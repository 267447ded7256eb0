use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use traffic_log::{LifecycleEvent, TrafficRecord};

use crate::context::{lock, ProxyContext, Service, ServiceId};
use crate::message::{Envelope, Payload, Side};
use crate::socket::{self, SocketEvent, SocketHandle, SocketId};

/// Which side of the fabric a listener bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// Accepts normal clients. Inbound traffic is client traffic; target
    /// traffic is pushed back out to the clients.
    Port,
    /// Accepts forward links from other ws-proxy instances. Inbound traffic is
    /// target traffic; client traffic is pushed out to the relayed instances.
    Relay,
}

impl ListenerRole {
    pub fn name(self) -> &'static str {
        match self {
            ListenerRole::Port => "Client Listener",
            ListenerRole::Relay => "Relay Listener",
        }
    }

    /// Direction in which inbound frames are broadcast.
    pub fn inbound_side(self) -> Side {
        match self {
            ListenerRole::Port => Side::Client,
            ListenerRole::Relay => Side::Target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Binding,
    Bound(SocketAddr),
    Closed,
}

/// A WebSocket server leg.
///
/// Every accepted socket feeds the context; every broadcast from the other
/// side is written to all currently connected sockets. Bind/accept failures
/// dispose the listener without retrying.
pub struct ListenerService {
    id: ServiceId,
    role: ListenerRole,
    ctx: Arc<ProxyContext>,
    clients: Mutex<Vec<SocketHandle>>,
    disposed: AtomicBool,
    shutdown: Notify,
    state: watch::Sender<ListenerState>,
}

impl ListenerService {
    /// Register a listener and start binding `addr` in the background.
    ///
    /// Returns `None` if the context is already disposing.
    pub fn start(ctx: &Arc<ProxyContext>, role: ListenerRole, addr: SocketAddr) -> Option<Arc<Self>> {
        let (state, _) = watch::channel(ListenerState::Binding);
        let listener = Arc::new(Self {
            id: ctx.next_service_id(),
            role,
            ctx: Arc::clone(ctx),
            clients: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            shutdown: Notify::new(),
            state,
        });

        if !ctx.register(listener.clone()) {
            return None;
        }

        tokio::spawn(Arc::clone(&listener).run(addr));
        Some(listener)
    }

    pub fn role(&self) -> ListenerRole {
        self.role
    }

    /// The bound address, once binding has finished. `None` if binding failed
    /// or the listener has been disposed.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| *s != ListenerState::Binding).await {
            Ok(state) => *state,
            Err(_) => ListenerState::Closed,
        };
        match state {
            ListenerState::Bound(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, addr: SocketAddr) {
        let name = self.role.name();

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, %err, "{name} error");
                self.dispose();
                return;
            }
        };
        let bound = listener.local_addr().unwrap_or(addr);

        if self.is_disposed() {
            return;
        }
        self.state.send_replace(ListenerState::Bound(bound));
        tracing::info!(
            addr = %bound,
            "{name} listening on port {port}. ws://localhost:{port}",
            port = bound.port()
        );
        self.ctx.record(
            TrafficRecord::lifecycle(LifecycleEvent::ListenerBound, name).with_address(bound),
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        tokio::spawn(Arc::clone(&self).handle_connection(stream, remote_addr));
                    }
                    Err(err) => {
                        tracing::error!(%err, "{name} error");
                        break;
                    }
                },
            }
        }

        tracing::info!("{name} closed");
        self.dispose();
    }

    /// Complete the WebSocket handshake and wire the socket into the context.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let name = self.role.name();

        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                tracing::debug!(%remote_addr, %err, "{name} handshake failed");
                return;
            }
        };

        let (handle, reader) = socket::open(ws);
        let socket_id = handle.id();
        {
            let mut clients = lock(&self.clients);
            if self.is_disposed() {
                handle.close();
                return;
            }
            clients.push(handle);
        }

        tracing::info!(%remote_addr, socket = %socket_id, "{name} new connection");
        self.ctx.record(
            TrafficRecord::lifecycle(LifecycleEvent::ConnectionOpened, name)
                .with_socket(socket_id)
                .with_address(remote_addr),
        );

        let ctx = Arc::clone(&self.ctx);
        let side = self.role.inbound_side();
        let listener: Weak<Self> = Arc::downgrade(&self);
        reader.spawn(move |event| match event {
            SocketEvent::Message { data, is_binary } => {
                ctx.broadcast(side, &Envelope::new(Some(socket_id), Payload::Data(data), is_binary));
            }
            SocketEvent::Closed => {
                tracing::debug!(%remote_addr, socket = %socket_id, "{name} connection closed");
                if let Some(listener) = listener.upgrade() {
                    listener.remove_client(socket_id);
                }
                ctx.record(
                    TrafficRecord::lifecycle(LifecycleEvent::ConnectionClosed, name)
                        .with_socket(socket_id)
                        .with_address(remote_addr),
                );
                ctx.broadcast(side, &Envelope::closed(Some(socket_id)));
            }
        });
    }

    fn remove_client(&self, socket_id: SocketId) {
        lock(&self.clients).retain(|c| c.id() != socket_id);
    }

    /// Push a broadcast to every connected socket; the close sentinel closes
    /// them instead.
    fn fan_out(&self, envelope: &Envelope) {
        let clients = lock(&self.clients).clone();
        for client in &clients {
            match &envelope.payload {
                Payload::Closed => client.close(),
                Payload::Data(data) => client.send(data, envelope.is_binary),
            }
        }
    }
}

impl Service for ListenerService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.role.name()
    }

    fn on_client_message(&self, envelope: &Envelope) {
        if self.role == ListenerRole::Relay {
            self.fan_out(envelope);
        }
    }

    fn on_target_message(&self, envelope: &Envelope) {
        if self.role == ListenerRole::Port {
            self.fan_out(envelope);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();

        let clients: Vec<SocketHandle> = lock(&self.clients).drain(..).collect();
        for client in &clients {
            client.close();
        }

        let previous = self.state.send_replace(ListenerState::Closed);
        if let ListenerState::Bound(addr) = previous {
            self.ctx.record(
                TrafficRecord::lifecycle(LifecycleEvent::ListenerClosed, self.role.name())
                    .with_address(addr)
                    .with_details(serde_json::json!({ "connections": clients.len() })),
            );
        }
        // Last: removing the final service may dispose the whole context.
        self.ctx.deregister(self.id);
    }
}
