//! Token Event Listener
//!
//! Drains the broadcast sink and logs each lifecycle event. Stands in for the
//! subscribers a surrounding application would attach.

use action_tokens_core::TokenEvent;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::handlers::RequestContext;

pub struct EventLogger {
    events: broadcast::Receiver<TokenEvent>,
}

impl EventLogger {
    pub fn new(events: broadcast::Receiver<TokenEvent>) -> Self {
        Self { events }
    }

    /// Run until shutdown is signalled or the sink is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("token event listener started");

        loop {
            tokio::select! {
                received = self.events.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "token event listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("token event listener stopped");
    }
}

fn log_event(event: &TokenEvent) {
    let request = event
        .context
        .as_ref()
        .and_then(|ctx| ctx.downcast_ref::<RequestContext>())
        .map(|req| format!("{} {}", req.method, req.uri));

    info!(
        event = %event.name,
        event_id = %event.event_id,
        token = %event.token.id(),
        request = request.as_deref().unwrap_or("-"),
        "token event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_tokens_core::{BroadcastEventSink, EventSink, Lifecycle, Token};

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let sink = BroadcastEventSink::new(4);
        let logger = EventLogger::new(sink.subscribe());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(logger.run(rx));
        sink.dispatch(TokenEvent::new(
            Lifecycle::Create,
            "create".to_string(),
            Token::simple("t1"),
            None,
        ))
        .await
        .unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_sink_is_dropped() {
        let sink = BroadcastEventSink::new(4);
        let logger = EventLogger::new(sink.subscribe());
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(logger.run(rx));
        drop(sink);
        handle.await.unwrap();
    }
}
