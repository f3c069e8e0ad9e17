//! Per-workspace runtime: owns the state, and wires the crawler, the
//! transport and the dispatcher together.

use std::{sync::Arc, time::Duration};

use {
    secrecy::ExposeSecret,
    skiff_channels::MessageSink,
    tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    config::SlackWorkspaceConfig,
    crawler::{CrawlReport, Crawler},
    dispatch::EventDispatcher,
    state::{SharedState, WorkspaceState},
    transport::{Endpoint, Transport, TransportEvent, validate_ws_url},
};

pub struct SlackWorkspace {
    name: String,
    config: Arc<SlackWorkspaceConfig>,
    state: SharedState,
    http: reqwest::Client,
    sink: Arc<dyn MessageSink>,
    cancel: CancellationToken,
}

impl SlackWorkspace {
    pub fn new(
        name: impl Into<String>,
        config: SlackWorkspaceConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        if config.token.expose_secret().is_empty() {
            return Err(Error::Config("token is required".into()));
        }
        if let Some(url) = &config.ws_url {
            validate_ws_url(url)?;
        }
        let name = name.into();
        Ok(Self {
            state: WorkspaceState::shared(name.clone()),
            name,
            config: Arc::new(config),
            http: reqwest::Client::new(),
            sink,
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &SlackWorkspaceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_ok_and(|st| st.is_connected())
    }

    pub fn crawler(&self) -> Crawler {
        Crawler::new(
            self.name.clone(),
            self.http.clone(),
            self.config.clone(),
            Arc::clone(&self.state),
        )
        .with_timeout(self.config.request_timeout())
        .with_page_limit(self.config.page_limit)
    }

    /// Run the whole listing chain. Returns early with what was done so far
    /// if the workspace is stopped.
    pub async fn crawl_all(&self) -> CrawlReport {
        let crawler = self.crawler();
        tokio::select! {
            report = crawler.crawl_all() => report,
            () = self.cancel.cancelled() => {
                debug!(workspace = %self.name, "crawl cancelled");
                CrawlReport::default()
            },
        }
    }

    fn endpoint(&self) -> Endpoint {
        match &self.config.ws_url {
            Some(url) => Endpoint::Fixed(url.clone()),
            None => Endpoint::Rtm {
                http: self.http.clone(),
                api_base: self.config.api_base.clone(),
                token: self.config.token.clone(),
            },
        }
    }

    /// Start the real-time connection and the event loop. The returned
    /// handle completes once the workspace is stopped or the transport gives
    /// up.
    pub fn connect(&self) -> JoinHandle<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Transport::new(
            self.name.clone(),
            self.endpoint(),
            self.config.reconnect_policy(),
            Arc::clone(&self.state),
            events_tx,
            self.cancel.child_token(),
        )
        .spawn();

        let dispatcher = EventDispatcher::new(Arc::clone(&self.state), Arc::clone(&self.sink))
            .with_typing_timeout(self.config.typing_timeout());
        info!(workspace = %self.name, "starting real-time session");
        tokio::spawn(event_loop(
            self.name.clone(),
            dispatcher,
            events_rx,
            self.config.typing_sweep_interval(),
            self.cancel.clone(),
        ))
    }

    /// Cancel the transport, the event loop and any running crawl.
    pub fn stop(&self) {
        info!(workspace = %self.name, "stopping workspace");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn event_loop(
    workspace: String,
    dispatcher: EventDispatcher,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sweep_every: Duration,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Frame(frame)) => dispatcher.dispatch(&frame).await,
                Some(TransportEvent::Connected { generation }) => {
                    debug!(workspace = %workspace, generation, "session established");
                },
                Some(TransportEvent::Disconnected) => {
                    info!(workspace = %workspace, "disconnected");
                },
                Some(TransportEvent::GaveUp) => {
                    warn!(workspace = %workspace, "real-time connection abandoned");
                    break;
                },
                None => break,
            },
            tick = sweep.tick() => dispatcher.sweep_typing(tick.into_std()).await,
            () = cancel.cancelled() => break,
        }
    }
    debug!(workspace = %workspace, "event loop stopped");
}
