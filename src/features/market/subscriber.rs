#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    features::market::Market,
    infra::relay::{RelayInbox, RelayMessage},
};

/// Drains the relay inbox one frame at a time so handlers observe arrival order.
pub async fn subscriber(market: Arc<Market>, mut inbox: RelayInbox, cancel: CancellationToken) {
    info!("Starting market subscriber");

    while let Some(msg) = inbox.next_event(&cancel).await {
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if let Err(err) = market.handle_event(&event).await {
                    warn!(
                        "market: event {} on {subscription_id} failed: {err}",
                        event.id.to_hex()
                    );
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if accepted {
                    debug!("Relay accepted {event_id}");
                } else {
                    warn!("Relay rejected {event_id}: {message}");
                }
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                debug!("End of stored events for {subscription_id}");
            }
            RelayMessage::Notice(notice) => warn!("Relay notice: {notice}"),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => warn!("Relay closed {subscription_id}: {message}"),
        }
    }

    info!("Market subscriber stopped");
}
