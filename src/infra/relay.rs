//! Persistent link to one relay gateway.
//!
//! [`RelayLink`] is the background worker that owns the socket. Domain code
//! only ever talks to it through two queues: [`RelayHandle`] pushes outbound
//! frames (`EVENT`, `REQ`, `CLOSE`) and [`RelayInbox`] pulls inbound frames
//! in arrival order. Active `REQ` frames are replayed after every reconnect.

use std::collections::BTreeMap;

use futures_util::{SinkExt, StreamExt};
use nostr::{event::Event, filter::Filter};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::sleep,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::LinkConfig,
    infra::nostr::{CodecError, verify_event},
};

const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay link unavailable")]
    Unavailable,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Relay closed the connection")]
    Closed,

    #[error("Malformed relay frame: {0}")]
    Malformed(String),

    #[error("Invalid event in relay frame: {0}")]
    InvalidEvent(#[from] CodecError),

    #[error("Frame serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Event(Box<Event>),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, RelayError> {
        let value = match self {
            OutboundFrame::Event(event) => json!(["EVENT", event]),
            OutboundFrame::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            OutboundFrame::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    /// Parses one inbound frame; events must carry a valid id and signature.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| RelayError::Malformed("frame is not an array".into()))?;
        let verb = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Malformed("missing verb".into()))?;
        let str_at = |i: usize| -> Result<String, RelayError> {
            frame
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RelayError::Malformed(format!("{verb}: missing field {i}")))
        };

        match verb {
            "EVENT" => {
                let subscription_id = str_at(1)?;
                let raw = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| RelayError::Malformed("EVENT: missing event".into()))?;
                let event: Event = serde_json::from_value(raw)?;
                verify_event(&event)?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents(str_at(1)?)),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(1)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            other => Err(RelayError::Malformed(format!("unknown verb {other}"))),
        }
    }
}

/// Cloneable sending side of the link.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    state: watch::Receiver<LinkState>,
}

impl RelayHandle {
    /// A handle with no worker behind it; frames land on the returned receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (_state_tx, state) = watch::channel(LinkState::Disconnected);
        (Self { outbound, state }, rx)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn publish(&self, event: Event) -> Result<(), RelayError> {
        self.send(OutboundFrame::Event(Box::new(event)))
    }

    pub fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<(), RelayError> {
        self.send(OutboundFrame::Req {
            subscription_id: subscription_id.into(),
            filters,
        })
    }

    pub fn unsubscribe(&self, subscription_id: impl Into<String>) -> Result<(), RelayError> {
        self.send(OutboundFrame::Close(subscription_id.into()))
    }

    fn send(&self, frame: OutboundFrame) -> Result<(), RelayError> {
        self.outbound.send(frame).map_err(|_| RelayError::Unavailable)
    }
}

/// Receiving side of the link; a single consumer drains it in arrival order.
#[derive(Debug)]
pub struct RelayInbox {
    inbound: mpsc::Receiver<RelayMessage>,
}

impl RelayInbox {
    /// Waits for the next frame; `None` once cancelled or the link is gone.
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> Option<RelayMessage> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            msg = self.inbound.recv() => msg,
        }
    }
}

enum SessionEnd {
    Cancelled,
    HandlesDropped,
    Failed(RelayError),
}

pub struct RelayLink {
    url: String,
    config: LinkConfig,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::Sender<RelayMessage>,
    state: watch::Sender<LinkState>,
    /// Last `REQ` sent per subscription id, replayed on reconnect.
    active: BTreeMap<String, String>,
}

impl RelayLink {
    pub fn new(url: impl Into<String>, config: LinkConfig) -> (Self, RelayHandle, RelayInbox) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        let link = Self {
            url: url.into(),
            config,
            outbound: outbound_rx,
            inbound: inbound_tx,
            state: state_tx,
            active: BTreeMap::new(),
        };
        let handle = RelayHandle {
            outbound: outbound_tx,
            state: state_rx,
        };
        let inbox = RelayInbox {
            inbound: inbound_rx,
        };
        (link, handle, inbox)
    }

    fn set_state(&self, state: LinkState) {
        if *self.state.borrow() != state {
            info!("Relay link {} -> {:?}", self.url, state);
        }
        self.state.send_replace(state);
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(LinkState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws, _)) => {
                    self.set_state(LinkState::Connected);
                    match self.session(ws, &cancel).await {
                        SessionEnd::Cancelled | SessionEnd::HandlesDropped => break,
                        SessionEnd::Failed(err) => {
                            warn!("Relay link {} dropped: {err}", self.url);
                        }
                    }
                }
                Err(err) => {
                    warn!("Relay connection to {} failed: {err}", self.url);
                }
            }

            self.set_state(LinkState::Disconnected);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.backoff()) => {}
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    async fn session(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = sleep(self.config.settle()) => {}
        }

        for frame in self.active.values() {
            if let Err(err) = sink.send(Message::Text(frame.clone())).await {
                return SessionEnd::Failed(err.into());
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::HandlesDropped;
                    };
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("Dropping unserializable outbound frame: {err}");
                            continue;
                        }
                    };
                    match &frame {
                        OutboundFrame::Req { subscription_id, .. } => {
                            self.active.insert(subscription_id.clone(), text.clone());
                        }
                        OutboundFrame::Close(subscription_id) => {
                            self.active.remove(subscription_id);
                        }
                        OutboundFrame::Event(_) => {}
                    }
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        return SessionEnd::Failed(err.into());
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match RelayMessage::parse(&text) {
                        Ok(message) => {
                            if self.inbound.send(message).await.is_err() {
                                return SessionEnd::HandlesDropped;
                            }
                        }
                        Err(err) => warn!("Dropping relay frame: {err}"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = sink.send(Message::Pong(payload)).await {
                            return SessionEnd::Failed(err.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Failed(RelayError::Closed),
                    Some(Ok(other)) => debug!("Ignoring relay frame {other:?}"),
                    Some(Err(err)) => return SessionEnd::Failed(err.into()),
                },
            }
        }
    }
}
