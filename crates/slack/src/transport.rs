//! Real-time websocket connection with reconnect policy.
//!
//! One [`Transport`] task per workspace. Inbound text frames are validated
//! and forwarded as [`TransportEvent`]s; frames queued on the session's
//! outbound sender are written verbatim. The workspace state is marked
//! connected on establishment and disconnected (session handle dropped)
//! before any reconnect is scheduled. The failure count resets only after
//! the first valid frame, so a server that accepts and then misbehaves still
//! backs off and eventually exhausts the attempt limit.

use std::time::Duration;

use {
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    Error, Result, api,
    state::{SessionHandle, SharedState},
};

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established,
    Receiving,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Connect,
    Handshake,
    Frame,
    Error,
    Close,
    Shutdown,
}

impl ConnectionState {
    /// Pure transition function. Signals that make no sense in the current
    /// state leave it unchanged.
    #[must_use]
    pub fn on(self, signal: TransportSignal) -> Self {
        use {ConnectionState::*, TransportSignal as S};
        match (self, signal) {
            (_, S::Shutdown) => Closed,
            (Disconnected | Closed, S::Connect) => Connecting,
            (Connecting, S::Handshake) => Established,
            (Connecting, S::Error) => Disconnected,
            (Established | Receiving, S::Frame) => Receiving,
            (Established | Receiving, S::Error | S::Close) => Closed,
            (Connecting, S::Close) => Closed,
            (state, _) => state,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Established | Self::Receiving)
    }
}

// ── Frame validation ────────────────────────────────────────────────────────

/// What to do with one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    Dispatch(Value),
    /// Protocol violation; the connection must be closed.
    Close(String),
}

/// Every inbound frame must be a JSON object with a string `type`.
pub fn classify_frame(text: &str) -> FrameAction {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return FrameAction::Close(format!("unparseable frame: {e}")),
    };
    match value.get("type") {
        Some(Value::String(_)) => FrameAction::Dispatch(value),
        Some(_) => FrameAction::Close("frame type is not a string".into()),
        None => FrameAction::Close("frame has no type".into()),
    }
}

// ── Reconnect policy ────────────────────────────────────────────────────────

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before giving up; 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` once the attempt limit is reached.
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        if self.max_attempts != 0 && failures >= self.max_attempts {
            return None;
        }
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

// ── Endpoint ────────────────────────────────────────────────────────────────

/// Where the websocket URL comes from on each attempt.
#[derive(Clone)]
pub enum Endpoint {
    Fixed(String),
    /// Ask `rtm.connect` for a fresh URL every time.
    Rtm {
        http: reqwest::Client,
        api_base: String,
        token: Secret<String>,
    },
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(url) => f.debug_tuple("Fixed").field(url).finish(),
            Self::Rtm { api_base, .. } => f
                .debug_struct("Rtm")
                .field("api_base", api_base)
                .finish_non_exhaustive(),
        }
    }
}

impl Endpoint {
    async fn resolve(&self, state: &SharedState) -> Result<String> {
        let raw = match self {
            Self::Fixed(url) => url.clone(),
            Self::Rtm {
                http,
                api_base,
                token,
            } => {
                let session = api::rtm_connect(http, api_base, token.expose_secret()).await?;
                if let Ok(mut st) = state.write() {
                    st.identity = Some(session.identity);
                }
                session.url
            },
        };
        validate_ws_url(&raw)?;
        Ok(raw)
    }
}

/// Accept only `ws://` and `wss://` URLs.
pub fn validate_ws_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::Config(format!("bad websocket url: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(Error::Config(format!(
            "websocket url must use ws or wss, got {other}"
        ))),
    }
}

// ── Transport task ──────────────────────────────────────────────────────────

/// Events sent from the transport task to the workspace loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { generation: u64 },
    Frame(Value),
    Disconnected,
    /// Out of reconnect attempts; the task has exited.
    GaveUp,
}

enum SessionEnd {
    Closed,
    Cancelled,
}

pub struct Transport {
    workspace: String,
    endpoint: Endpoint,
    policy: ReconnectPolicy,
    state: SharedState,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    phase: ConnectionState,
    generation: u64,
    failures: u32,
}

impl Transport {
    pub fn new(
        workspace: impl Into<String>,
        endpoint: Endpoint,
        policy: ReconnectPolicy,
        state: SharedState,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            endpoint,
            policy,
            state,
            events,
            cancel,
            phase: ConnectionState::Disconnected,
            generation: 0,
            failures: 0,
        }
    }

    /// Run the transport on its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn advance(&mut self, signal: TransportSignal) {
        let next = self.phase.on(signal);
        if next != self.phase {
            debug!(workspace = %self.workspace, from = ?self.phase, to = ?next, "transport state");
            self.phase = next;
        }
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means the workspace is shutting down.
        let _ = self.events.send(event);
    }

    fn mark_disconnected(&self) {
        if let Ok(mut st) = self.state.write() {
            st.mark_disconnected();
        }
    }

    /// Connect, pump frames, reconnect per policy until cancelled or out of
    /// attempts.
    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.advance(TransportSignal::Connect);

            match self.connect_and_run().await {
                Ok(SessionEnd::Cancelled) => {
                    self.mark_disconnected();
                    self.emit(TransportEvent::Disconnected);
                    break;
                },
                Ok(SessionEnd::Closed) => {
                    info!(workspace = %self.workspace, "connection closed");
                    self.advance(TransportSignal::Close);
                },
                Err(e) => {
                    error!(workspace = %self.workspace, error = %e, "connection error");
                    self.advance(TransportSignal::Error);
                },
            }

            self.mark_disconnected();
            self.emit(TransportEvent::Disconnected);

            self.failures += 1;
            let Some(delay) = self.policy.delay(self.failures) else {
                error!(
                    workspace = %self.workspace,
                    attempts = self.failures,
                    "giving up on real-time connection"
                );
                self.emit(TransportEvent::GaveUp);
                break;
            };

            info!(
                workspace = %self.workspace,
                delay_ms = delay.as_millis(),
                attempt = self.failures,
                "reconnecting after delay"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = self.cancel.cancelled() => break,
            }
        }
        self.advance(TransportSignal::Shutdown);
        debug!(workspace = %self.workspace, "transport stopped");
    }

    /// Single connection attempt: resolve, connect, then forward frames.
    async fn connect_and_run(&mut self) -> Result<SessionEnd> {
        let connect = async {
            let url = self.endpoint.resolve(&self.state).await?;
            info!(workspace = %self.workspace, "connecting to real-time endpoint");
            Ok::<_, Error>(connect_async(url.as_str()).await?)
        };
        let (ws_stream, _response) = tokio::select! {
            res = connect => res?,
            () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        };
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        self.advance(TransportSignal::Handshake);
        self.generation += 1;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        if let Ok(mut st) = self.state.write() {
            st.mark_connected(SessionHandle {
                generation: self.generation,
                outbound: outbound_tx,
            });
        }
        info!(workspace = %self.workspace, generation = self.generation, "connected");
        self.emit(TransportEvent::Connected {
            generation: self.generation,
        });

        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match classify_frame(&text) {
                            FrameAction::Dispatch(frame) => {
                                self.advance(TransportSignal::Frame);
                                // A valid frame proves the session; the handshake alone does not.
                                self.failures = 0;
                                self.emit(TransportEvent::Frame(frame));
                            },
                            FrameAction::Close(reason) => {
                                warn!(workspace = %self.workspace, %reason, "protocol violation, closing");
                                let _ = ws_sink.send(Message::Close(None)).await;
                                return Err(Error::Protocol(reason));
                            },
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sink.send(Message::Pong(data)).await?;
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(workspace = %self.workspace, "websocket closed by server");
                            return Ok(SessionEnd::Closed);
                        },
                        Some(Ok(_)) => {},
                        Some(Err(e)) => return Err(e.into()),
                    }
                },
                Some(text) = outbound_rx.recv() => {
                    ws_sink.send(Message::Text(text.into())).await?;
                },
                () = self.cancel.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                },
            }
        }
    }
}
