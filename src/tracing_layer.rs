//! Custom tracing layer that re-emits structured log records onto the
//! management WebSocket's broadcast channel, so operators watching
//! `GET /events` see the same log lines as the process's own stdout.

use tokio::sync::broadcast;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::events::HvEvent;

pub struct EventBroadcastLayer {
    tx: broadcast::Sender<HvEvent>,
}

impl EventBroadcastLayer {
    pub fn new(tx: broadcast::Sender<HvEvent>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for EventBroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "debug",
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(msg) = visitor.message {
            // Only distribute to subscribers if any exist; a broadcast send
            // with no receivers is an error we don't care about.
            let _ = self.tx.send(HvEvent::LogLine {
                level: level.to_string(),
                target: event.metadata().target().to_string(),
                message: msg,
                ts_millis: chrono::Utc::now().timestamp_millis(),
            });
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}
