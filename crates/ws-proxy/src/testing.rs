//! Helpers shared by the unit tests of this crate.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::context::{ProxyContext, Service, ServiceId};
use crate::message::{Envelope, Side};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub type Events = mpsc::UnboundedReceiver<(Side, Envelope)>;
pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Records every broadcast it observes and counts its disposals.
pub struct RecordingService {
    id: ServiceId,
    ctx: Arc<ProxyContext>,
    tx: mpsc::UnboundedSender<(Side, Envelope)>,
    disposals: AtomicUsize,
}

impl RecordingService {
    /// Build without registering.
    pub fn new(ctx: &Arc<ProxyContext>) -> (Arc<Self>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            id: ctx.next_service_id(),
            ctx: Arc::clone(ctx),
            tx,
            disposals: AtomicUsize::new(0),
        });
        (service, rx)
    }

    pub fn start(ctx: &Arc<ProxyContext>) -> (Arc<Self>, Events) {
        let (service, rx) = Self::new(ctx);
        assert!(ctx.register(service.clone()));
        (service, rx)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl Service for RecordingService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn on_client_message(&self, envelope: &Envelope) {
        let _ = self.tx.send((Side::Client, envelope.clone()));
    }

    fn on_target_message(&self, envelope: &Envelope) {
        let _ = self.tx.send((Side::Target, envelope.clone()));
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.ctx.deregister(self.id);
    }
}

/// Await `future`, failing the test if it takes longer than a few seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    within(rx.recv()).await.expect("channel closed")
}

/// Next broadcast observed on `side`, skipping the other direction.
pub async fn next_on(events: &mut Events, side: Side) -> Envelope {
    loop {
        let (observed, envelope) = recv(events).await;
        if observed == side {
            return envelope;
        }
    }
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn count_named(ctx: &ProxyContext, name: &str) -> usize {
    ctx.services().iter().filter(|s| s.name() == name).count()
}

/// Accept WebSocket connections on an ephemeral loopback port, handing each
/// to `handler`. The counter tracks accepted TCP connections.
pub async fn serve<F, Fut>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    handler(ws).await;
                }
            });
        }
    });

    (addr, accepted)
}

/// A server that sends every text/binary frame straight back.
pub async fn echo_server() -> SocketAddr {
    let (addr, _) = serve(|mut ws| async move {
        while let Some(Ok(message)) = ws.next().await {
            if (message.is_text() || message.is_binary()) && ws.send(message).await.is_err() {
                break;
            }
        }
    })
    .await;
    addr
}

/// A loopback address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = within(tokio_tungstenite::connect_async(format!("ws://{addr}")))
        .await
        .unwrap();
    ws
}

/// Next text frame from `client`, skipping control frames.
pub async fn next_text(client: &mut Client) -> String {
    loop {
        let message = within(client.next())
            .await
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = message {
            return text.as_str().to_owned();
        }
    }
}

/// Wait until `client` has been closed by the server.
pub async fn expect_closed(client: &mut Client) {
    within(async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
}
