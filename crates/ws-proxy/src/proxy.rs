use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use traffic_log::{LifecycleEvent, TrafficRecord, TrafficRecorder};

use crate::connector::{ConnectorRole, ConnectorService, DEFAULT_RETRY_DELAY};
use crate::context::ProxyContext;
use crate::echo::EchoService;
use crate::listener::{ListenerRole, ListenerService};
use crate::script::ScriptService;

/// Which legs to run. Every leg is optional; empty strings count as unset.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Port for client connections.
    pub port: Option<u16>,
    /// Port for forward links from other instances.
    pub relay: Option<u16>,
    /// Backend address, or `file://<path>` to read it on every connect.
    pub target: Option<String>,
    /// Relay address of another instance.
    pub forward: Option<String>,
    /// Log every broadcast.
    pub echo: bool,
    /// Script of injected messages (see [`crate::script`]).
    pub messages: Option<String>,
    /// Interface the listeners bind to.
    pub listen_host: IpAddr,
    /// Backoff before a failed connector is recreated.
    pub retry_delay: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            port: None,
            relay: None,
            target: None,
            forward: None,
            echo: false,
            messages: None,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Blank or whitespace-only strings count as unset.
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// One proxy run: a fresh [`ProxyContext`] plus the configured legs.
pub struct Proxy {
    options: ProxyOptions,
    recorder: Option<TrafficRecorder>,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options,
            recorder: None,
        }
    }

    /// Capture traffic and lifecycle events to `recorder`.
    pub fn with_recorder(mut self, recorder: TrafficRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Create every configured leg and return without waiting.
    ///
    /// Legs are created in a fixed order: port, relay, target, forward,
    /// echo, messages. If nothing is left running once they all exist, the
    /// context disposes straight away.
    pub fn start(self) -> RunningProxy {
        let options = self.options;
        let ctx = ProxyContext::with_recorder(self.recorder);

        tracing::info!(
            port = ?options.port,
            relay = ?options.relay,
            target = ?non_empty(&options.target),
            forward = ?non_empty(&options.forward),
            echo = options.echo,
            scripted = non_empty(&options.messages).is_some(),
            "Starting ws-proxy"
        );
        ctx.record(
            TrafficRecord::lifecycle(LifecycleEvent::ProxyStarted, "ws-proxy").with_details(
                serde_json::json!({
                    "port": options.port,
                    "relay": options.relay,
                    "target": non_empty(&options.target),
                    "forward": non_empty(&options.forward),
                    "echo": options.echo,
                }),
            ),
        );

        let port = options.port.and_then(|port| {
            ListenerService::start(
                &ctx,
                ListenerRole::Port,
                SocketAddr::new(options.listen_host, port),
            )
        });
        let relay = options.relay.and_then(|port| {
            ListenerService::start(
                &ctx,
                ListenerRole::Relay,
                SocketAddr::new(options.listen_host, port),
            )
        });
        if let Some(target) = non_empty(&options.target) {
            ConnectorService::start(&ctx, ConnectorRole::Target, target, options.retry_delay);
        }
        if let Some(forward) = non_empty(&options.forward) {
            ConnectorService::start(&ctx, ConnectorRole::Forward, forward, options.retry_delay);
        }
        if options.echo {
            EchoService::start(&ctx);
        }
        if let Some(script) = non_empty(&options.messages) {
            ScriptService::start(&ctx, script);
        }

        ctx.mark_started();
        RunningProxy { ctx, port, relay }
    }

    /// Run until the context is disposed.
    pub async fn run(self) {
        self.start().wait().await;
    }
}

/// Handle to a started proxy.
pub struct RunningProxy {
    ctx: Arc<ProxyContext>,
    port: Option<Arc<ListenerService>>,
    relay: Option<Arc<ListenerService>>,
}

impl RunningProxy {
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    pub fn port_listener(&self) -> Option<&Arc<ListenerService>> {
        self.port.as_ref()
    }

    pub fn relay_listener(&self) -> Option<&Arc<ListenerService>> {
        self.relay.as_ref()
    }

    /// Tear the proxy down. Idempotent.
    pub fn dispose(&self) {
        self.ctx.dispose();
    }

    /// Resolves once the context has been disposed.
    pub async fn wait(&self) {
        self.ctx.closed().await;
    }
}
