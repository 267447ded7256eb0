use std::sync::Arc;

use crate::context::{ProxyContext, Service, ServiceId};
use crate::message::{Envelope, Side};

/// Diagnostic sink that logs every broadcast in both directions.
pub struct EchoService {
    id: ServiceId,
    ctx: Arc<ProxyContext>,
}

impl EchoService {
    pub fn start(ctx: &Arc<ProxyContext>) -> Option<Arc<Self>> {
        let echo = Arc::new(Self {
            id: ctx.next_service_id(),
            ctx: Arc::clone(ctx),
        });
        ctx.register(echo.clone()).then_some(echo)
    }

    fn echo(&self, side: Side, envelope: &Envelope) {
        tracing::info!(
            side = side.as_str(),
            origin = ?envelope.origin.map(|id| id.to_string()),
            "{}",
            echo_line(side, envelope)
        );
    }
}

fn echo_line(side: Side, envelope: &Envelope) -> String {
    format!("{} message: {}", side.as_str(), envelope.render())
}

impl Service for EchoService {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn name(&self) -> &'static str {
        "echo"
    }

    fn on_client_message(&self, envelope: &Envelope) {
        self.echo(Side::Client, envelope);
    }

    fn on_target_message(&self, envelope: &Envelope) {
        self.echo(Side::Target, envelope);
    }

    fn dispose(&self) {
        self.ctx.deregister(self.id);
    }
}
