use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};
use traffic_log::{LifecycleEvent, TrafficRecord, TrafficRecorder};

use crate::message::{Envelope, Payload, Side};
use crate::socket::SocketId;

/// Identity of a registered [`Service`], unique within one [`ProxyContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(u64);

/// A participant in the routing fabric.
///
/// Both handlers default to no-ops, so each leg only implements the
/// direction it cares about. `dispose` must be idempotent and must
/// deregister the service from its context.
pub trait Service: Send + Sync {
    fn id(&self) -> ServiceId;

    /// Short label used in logs.
    fn name(&self) -> &'static str;

    fn on_client_message(&self, _envelope: &Envelope) {}

    fn on_target_message(&self, _envelope: &Envelope) {}

    fn dispose(&self);
}

/// Invoke the handler of `service` that matches `side`.
pub fn deliver(service: &dyn Service, side: Side, envelope: &Envelope) {
    match side {
        Side::Client => service.on_client_message(envelope),
        Side::Target => service.on_target_message(envelope),
    }
}

/// The shared routing fabric for one proxy run.
///
/// Owns the live set of services, fans broadcasts out to them, and tears
/// everything down exactly once. Broadcasts iterate over a snapshot of the
/// collection, so handlers are free to register or dispose services
/// (including themselves) while a broadcast is in progress.
pub struct ProxyContext {
    services: Mutex<Vec<Arc<dyn Service>>>,
    next_service_id: AtomicU64,
    disposing: AtomicBool,
    started: AtomicBool,
    pending_retries: AtomicUsize,
    done: watch::Sender<bool>,
    recorder: Mutex<Option<TrafficRecorder>>,
}

impl ProxyContext {
    pub fn new() -> Arc<Self> {
        Self::with_recorder(None)
    }

    /// Create a context that captures broadcasts and lifecycle events to
    /// `recorder`.
    pub fn with_recorder(recorder: Option<TrafficRecorder>) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            services: Mutex::new(Vec::new()),
            next_service_id: AtomicU64::new(1),
            disposing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pending_retries: AtomicUsize::new(0),
            done,
            recorder: Mutex::new(recorder),
        })
    }

    pub fn next_service_id(&self) -> ServiceId {
        ServiceId(self.next_service_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add `service` to the live set.
    ///
    /// Returns `false` (and leaves the collection untouched) once disposal
    /// has begun. Registering the same service twice is a no-op.
    pub fn register(&self, service: Arc<dyn Service>) -> bool {
        let mut services = lock(&self.services);
        if self.is_disposed() {
            debug!(service = service.name(), "proxy is disposing; registration refused");
            return false;
        }
        if !services.iter().any(|s| s.id() == service.id()) {
            services.push(service);
        }
        true
    }

    /// Remove the service with `id`. Returns whether it was present.
    pub fn deregister(&self, id: ServiceId) -> bool {
        let removed = {
            let mut services = lock(&self.services);
            services
                .iter()
                .position(|s| s.id() == id)
                .map(|index| services.remove(index))
        };

        match removed {
            Some(service) => {
                debug!(service = service.name(), "service removed");
                drop(service);
                self.dispose_if_exhausted();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the live services in registration order.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        lock(&self.services).clone()
    }

    pub fn service_count(&self) -> usize {
        lock(&self.services).len()
    }

    /// Deliver `envelope` to the `side` handler of every live service.
    pub fn broadcast(&self, side: Side, envelope: &Envelope) {
        self.capture(side, envelope);
        for service in self.services() {
            deliver(service.as_ref(), side, envelope);
        }
    }

    pub fn send_client_message(&self, origin: Option<SocketId>, payload: Payload, is_binary: bool) {
        self.broadcast(Side::Client, &Envelope::new(origin, payload, is_binary));
    }

    pub fn send_target_message(&self, origin: Option<SocketId>, payload: Payload, is_binary: bool) {
        self.broadcast(Side::Target, &Envelope::new(origin, payload, is_binary));
    }

    /// Tear down every service and signal completion. Runs once; later calls
    /// return immediately.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing ws-proxy server");

        let snapshot = self.services();
        for service in &snapshot {
            service.dispose();
        }

        self.record(
            TrafficRecord::lifecycle(LifecycleEvent::ProxyDisposed, "ws-proxy")
                .with_details(serde_json::json!({ "services": snapshot.len() })),
        );
        // Release the recorder so its writer can flush and exit.
        lock(&self.recorder).take();

        self.done.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Mark start-up as finished. From here on an empty context with no
    /// pending retries disposes itself.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.dispose_if_exhausted();
    }

    /// Keep the context alive while a reconnect timer is outstanding.
    pub fn hold_retry(self: &Arc<Self>) -> PendingRetry {
        self.pending_retries.fetch_add(1, Ordering::SeqCst);
        PendingRetry {
            ctx: Arc::clone(self),
        }
    }

    /// Resolves once [`dispose`](Self::dispose) has run.
    pub async fn closed(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this only errors if we are dropped.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Hand `record` to the traffic recorder, if one is attached.
    pub fn record(&self, record: TrafficRecord) {
        if let Some(recorder) = lock(&self.recorder).as_ref() {
            recorder.record(record);
        }
    }

    /// Capture one envelope travelling toward `side`.
    pub(crate) fn capture(&self, side: Side, envelope: &Envelope) {
        let Some(recorder) = lock(&self.recorder).clone() else {
            return;
        };
        let origin = envelope.origin.map(Into::into);
        match &envelope.payload {
            Payload::Data(data) => recorder.frame(side.into(), origin, data, envelope.is_binary),
            Payload::Closed => recorder.closed(side.into(), origin),
        }
    }

    fn dispose_if_exhausted(&self) {
        if !self.started.load(Ordering::SeqCst) || self.is_disposed() {
            return;
        }
        if self.pending_retries.load(Ordering::SeqCst) == 0 && lock(&self.services).is_empty() {
            info!("no services left running");
            self.dispose();
        }
    }
}

/// Guard returned by [`ProxyContext::hold_retry`].
pub struct PendingRetry {
    ctx: Arc<ProxyContext>,
}

impl Drop for PendingRetry {
    fn drop(&mut self) {
        self.ctx.pending_retries.fetch_sub(1, Ordering::SeqCst);
        self.ctx.dispose_if_exhausted();
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{self, RecordingService};

    /// Appends `name` to a shared log on every client broadcast.
    struct OrderLog {
        id: ServiceId,
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Service for OrderLog {
        fn id(&self) -> ServiceId {
            self.id
        }
        fn name(&self) -> &'static str {
            self.name
        }
        fn on_client_message(&self, _envelope: &Envelope) {
            lock(&self.log).push(self.name);
        }
        fn dispose(&self) {}
    }

    /// On its first client broadcast, disposes `victim` and registers a late
    /// recorder.
    struct Meddler {
        id: ServiceId,
        ctx: Arc<ProxyContext>,
        victim: Arc<dyn Service>,
        late: Mutex<Option<Arc<RecordingService>>>,
        late_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<(Side, Envelope)>>>,
    }

    impl Service for Meddler {
        fn id(&self) -> ServiceId {
            self.id
        }
        fn name(&self) -> &'static str {
            "meddler"
        }
        fn on_client_message(&self, _envelope: &Envelope) {
            let mut late = lock(&self.late);
            if late.is_none() {
                self.victim.dispose();
                let (service, rx) = RecordingService::start(&self.ctx);
                *late = Some(service);
                *lock(&self.late_rx) = Some(rx);
            }
        }
        fn dispose(&self) {
            self.ctx.deregister(self.id);
        }
    }

    #[test]
    fn broadcasts_reach_services_in_registration_order() {
        let ctx = ProxyContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            ctx.register(Arc::new(OrderLog {
                id: ctx.next_service_id(),
                name,
                log: Arc::clone(&log),
            }));
        }

        ctx.send_client_message(None, Payload::text("x"), false);
        ctx.send_target_message(None, Payload::text("ignored"), false);

        assert_eq!(*lock(&log), vec!["first", "second", "third"]);
    }

    #[test]
    fn late_registration_never_sees_earlier_broadcasts() {
        let ctx = ProxyContext::new();
        let (_early, mut early_rx) = RecordingService::start(&ctx);

        ctx.send_client_message(None, Payload::text("before"), false);
        let (_late, mut late_rx) = RecordingService::start(&ctx);
        ctx.send_target_message(None, Payload::text("after"), false);

        assert_eq!(early_rx.try_recv().unwrap().1.payload, Payload::text("before"));
        assert_eq!(early_rx.try_recv().unwrap().1.payload, Payload::text("after"));

        let (side, envelope) = late_rx.try_recv().unwrap();
        assert_eq!(side, Side::Target);
        assert_eq!(envelope.payload, Payload::text("after"));
        assert!(late_rx.try_recv().is_err());
    }

    #[test]
    fn handlers_may_dispose_and_register_during_a_broadcast() {
        let ctx = ProxyContext::new();
        let (victim, mut victim_rx) = RecordingService::start(&ctx);
        let meddler = Arc::new(Meddler {
            id: ctx.next_service_id(),
            ctx: Arc::clone(&ctx),
            victim: victim.clone(),
            late: Mutex::new(None),
            late_rx: Mutex::new(None),
        });
        ctx.register(meddler.clone());

        ctx.send_client_message(None, Payload::text("one"), false);

        // The victim was in the snapshot and saw the message before it was
        // disposed; the newcomer was registered mid-broadcast and did not.
        assert_eq!(victim_rx.try_recv().unwrap().1.payload, Payload::text("one"));
        assert_eq!(victim.disposals(), 1);
        let mut late_rx = lock(&meddler.late_rx).take().unwrap();
        assert!(late_rx.try_recv().is_err());

        ctx.send_client_message(None, Payload::text("two"), false);
        assert!(victim_rx.try_recv().is_err());
        assert_eq!(late_rx.try_recv().unwrap().1.payload, Payload::text("two"));
    }

    #[test]
    fn handlers_are_optional() {
        struct Mute(ServiceId);
        impl Service for Mute {
            fn id(&self) -> ServiceId {
                self.0
            }
            fn name(&self) -> &'static str {
                "mute"
            }
            fn dispose(&self) {}
        }

        let ctx = ProxyContext::new();
        ctx.register(Arc::new(Mute(ctx.next_service_id())));
        ctx.send_client_message(None, Payload::Closed, false);
        ctx.send_target_message(None, Payload::text("x"), true);
    }

    #[test]
    fn registering_twice_keeps_one_entry() {
        let ctx = ProxyContext::new();
        let (service, _rx) = RecordingService::start(&ctx);
        assert!(ctx.register(service.clone()));
        assert_eq!(ctx.service_count(), 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_tears_down_each_service_once() {
        let ctx = ProxyContext::new();
        let (a, _a_rx) = RecordingService::start(&ctx);
        let (b, _b_rx) = RecordingService::start(&ctx);

        ctx.dispose();
        ctx.dispose();
        a.dispose();

        assert!(ctx.is_disposed());
        assert_eq!(ctx.service_count(), 0);
        assert_eq!(a.disposals(), 2);
        assert_eq!(b.disposals(), 1);

        testing::within(ctx.closed()).await;
    }

    #[test]
    fn registration_is_refused_after_dispose() {
        let ctx = ProxyContext::new();
        ctx.dispose();
        let (service, _rx) = RecordingService::new(&ctx);
        assert!(!ctx.register(service));
        assert_eq!(ctx.service_count(), 0);
    }

    #[tokio::test]
    async fn empty_context_disposes_once_started() {
        let ctx = ProxyContext::new();
        assert!(!ctx.is_disposed());
        ctx.mark_started();
        assert!(ctx.is_disposed());
        testing::within(ctx.closed()).await;
    }

    #[test]
    fn removing_the_last_service_disposes_after_start() {
        let ctx = ProxyContext::new();
        let (service, _rx) = RecordingService::start(&ctx);

        // Before start-up finishes an empty collection is tolerated.
        service.dispose();
        assert!(!ctx.is_disposed());

        let (service, _rx) = RecordingService::start(&ctx);
        ctx.mark_started();
        assert!(!ctx.is_disposed());
        service.dispose();
        assert!(ctx.is_disposed());
    }

    #[test]
    fn pending_retry_keeps_an_empty_context_alive() {
        let ctx = ProxyContext::new();
        let (service, _rx) = RecordingService::start(&ctx);
        ctx.mark_started();

        let retry = ctx.hold_retry();
        service.dispose();
        assert!(!ctx.is_disposed());

        drop(retry);
        assert!(ctx.is_disposed());
    }

    #[tokio::test]
    async fn broadcasts_are_captured_with_side_and_origin() {
        use traffic_log::{CaptureOptions, Direction, TrafficLine};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let (recorder, writer) = TrafficRecorder::start(&path, CaptureOptions::default())
            .await
            .unwrap();
        let ctx = ProxyContext::with_recorder(Some(recorder));
        let (_service, _rx) = RecordingService::start(&ctx);

        let origin = SocketId::new();
        ctx.send_client_message(Some(origin), Payload::text("up"), false);
        ctx.send_target_message(None, Payload::binary(vec![1u8, 2]), true);
        ctx.send_client_message(Some(origin), Payload::Closed, false);
        // Dispose releases the recorder; the writer then finishes.
        ctx.dispose();
        let summary = testing::within(writer).await.unwrap();
        assert_eq!(summary.frames, 3);

        let records: Vec<TrafficRecord> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<TrafficLine>(l).unwrap().record)
            .collect();
        let origin = Some(uuid::Uuid::from(origin));
        assert_eq!(
            records[0],
            TrafficRecord::frame(Direction::Client, origin, b"up", false, 256)
        );
        assert_eq!(
            records[1],
            TrafficRecord::frame(Direction::Target, None, &[1, 2], true, 256)
        );
        assert_eq!(records[2], TrafficRecord::closed(Direction::Client, origin));
        assert!(matches!(
            records[3],
            TrafficRecord::Lifecycle {
                event: LifecycleEvent::ProxyDisposed,
                ..
            }
        ));
        assert!(matches!(records[4], TrafficRecord::Summary { .. }));
    }

    #[tokio::test]
    async fn closed_waits_for_dispose() {
        let ctx = ProxyContext::new();
        let (_service, _rx) = RecordingService::start(&ctx);
        ctx.mark_started();

        let pending = tokio::time::timeout(Duration::from_millis(50), ctx.closed()).await;
        assert!(pending.is_err());

        let counter = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let ctx = Arc::clone(&ctx);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                ctx.closed().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        ctx.dispose();
        testing::within(waiter).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
