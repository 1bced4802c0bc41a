//! Realtime event channel: one WebSocket to `{ws_base}/ws`, JSON frames of the form
//! `{"event": ..., "data": ...}`, reconnecting on a bounded backoff schedule.

use futures::{SinkExt, StreamExt};
use locator::Locator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use signance_core::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Envelope { event: event.into(), data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected { url: String },
    Disconnected { reason: Option<String> },
    Message(Envelope),
    /// Reconnect attempts exhausted; the client is idle until dropped.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("realtime client has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub path: String,
    pub backoff: Backoff,
    pub channel_capacity: usize,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        RealtimeOptions { path: "/ws".into(), backoff: Backoff::default(), channel_capacity: 256 }
    }
}

pub struct RealtimeClient {
    outbound: mpsc::Sender<Envelope>,
    events: broadcast::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Start connecting in the background. Subscribe before the first await to see
    /// the initial `Connected` event.
    pub fn spawn(locator: Locator, opts: RealtimeOptions) -> Self {
        let capacity = opts.channel_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(locator, opts, events.clone(), outbound_rx, connected.clone()));
        RealtimeClient { outbound, events, connected, task }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue one frame. Frames are not buffered across reconnects.
    pub async fn send(&self, event: &str, data: Value) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            warn!(event, "realtime channel not connected; dropping frame");
            return Err(RealtimeError::NotConnected);
        }
        self.outbound.send(Envelope::new(event, data)).await.map_err(|_| RealtimeError::Stopped)
    }

    pub fn close(self) {}
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Exit {
    Lost(Option<String>),
    ClientGone,
}

async fn run(
    locator: Locator,
    opts: RealtimeOptions,
    events: broadcast::Sender<RealtimeEvent>,
    mut outbound: mpsc::Receiver<Envelope>,
    connected: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;
    loop {
        match locator.realtime_url(&opts.path).await {
            Ok(url) => match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(%url, "realtime connected");
                    attempt = 0;
                    connected.store(true, Ordering::SeqCst);
                    let _ = events.send(RealtimeEvent::Connected { url: url.clone() });
                    let exit = pump(ws, &events, &mut outbound).await;
                    connected.store(false, Ordering::SeqCst);
                    match exit {
                        Exit::ClientGone => return,
                        Exit::Lost(reason) => {
                            info!(%url, reason = reason.as_deref().unwrap_or(""), "realtime disconnected");
                            let _ = events.send(RealtimeEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    warn!(%url, error = %e, "realtime connect failed");
                    locator.invalidate();
                }
            },
            Err(e) => warn!(error = %e, "no backend for realtime channel"),
        }

        attempt += 1;
        let Some(delay) = opts.backoff.delay(attempt) else {
            let attempts = attempt - 1;
            warn!(attempts, "giving up on realtime channel");
            let _ = events.send(RealtimeEvent::GaveUp { attempts });
            return;
        };
        info!(attempt, max = opts.backoff.max_attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: &broadcast::Sender<RealtimeEvent>,
    outbound: &mut mpsc::Receiver<Envelope>,
) -> Exit {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), events),
                Some(Ok(Message::Close(frame))) => {
                    return Exit::Lost(frame.map(|f| f.reason.as_str().to_owned()).filter(|r| !r.is_empty()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Lost(Some(e.to_string())),
                None => return Exit::Lost(None),
            },
            out = outbound.recv() => match out {
                Some(env) => {
                    let json = match serde_json::to_string(&env) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!(event = %env.event, error = %e, "cannot encode frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(json)).await {
                        return Exit::Lost(Some(e.to_string()));
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::ClientGone;
                }
            },
        }
    }
}

fn dispatch(text: &str, events: &broadcast::Sender<RealtimeEvent>) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(env) => {
            debug!(event = %env.event, "realtime event");
            let _ = events.send(RealtimeEvent::Message(env));
        }
        Err(e) => debug!(error = %e, "ignoring malformed realtime frame"),
    }
}
