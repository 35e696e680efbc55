use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const LIVE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct LiveUpdate {
    pub merchant_id: String,
    pub payload: Value,
}

/// Fire-and-forget push to connected merchant dashboards.
#[derive(Debug, Clone)]
pub struct LiveNotifier {
    tx: broadcast::Sender<LiveUpdate>,
}

impl Default for LiveNotifier {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self { tx }
    }
}

impl LiveNotifier {
    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.tx.subscribe()
    }

    pub fn notify(&self, merchant_id: &str, payload: Value) {
        // no viewers is not an error
        let _ = self.tx.send(LiveUpdate {
            merchant_id: merchant_id.to_string(),
            payload,
        });
    }
}
