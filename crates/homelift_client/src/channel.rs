//! Resilient notification channel.
//!
//! One background task per subscription owns the socket, the reconnect timer
//! and the dedup window. Abnormal closes and socket errors all take the same
//! path: wait `min(initial * 2^attempt, max)` and reconnect. A close with the
//! normal-closure code ends the session. Unsubscribing cancels the task, which
//! closes any open socket and abandons any pending reconnect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{Config, ConfigError};
use crate::error::ConnectError;
use crate::messages::{parse_frame, NotificationEvent};

/// Close code of an intentional, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame without a status code.
pub const NO_STATUS: u16 = 1005;
/// How long teardown waits for the peer to acknowledge a close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Exponential reconnect delay, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(10_000))
    }
}

impl Backoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the reconnect that follows abnormal close number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Recently seen message bodies; a body is suppressed while its first sighting is younger than the window.
#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    seen: HashMap<String, Instant>,
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// True if `message` has not been seen within the window; records it.
    pub fn admit(&mut self, message: &str, now: Instant) -> bool {
        let ttl = self.ttl;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < ttl);
        if self.seen.contains_key(message) {
            return false;
        }
        self.seen.insert(message.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    ClosedNormal,
    ClosedAbnormal,
    /// Torn down by unsubscribe.
    Stopped,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::ClosedNormal | ChannelState::Stopped)
    }
}

/// Observable state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Abnormal closes since the last successful open.
    pub attempt: u32,
}

impl ChannelStatus {
    pub const IDLE: ChannelStatus = ChannelStatus {
        state: ChannelState::Idle,
        attempt: 0,
    };
}

/// What a live connection yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed(Option<u16>),
    Error(String),
}

/// An open push connection.
pub trait Connection: Send + 'static {
    /// Next event. After `Closed` or `Error` the connection is not read again.
    fn recv(&mut self) -> impl Future<Output = Inbound> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens push connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;
}

/// Receives notifications that passed dedup.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, event: NotificationEvent);

    /// Transient user-facing alert.
    fn alert(&self, message: &str) {
        tracing::info!(message, "notification");
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

pub struct WsConnection {
    stream: WsStream,
}

impl Connector for TungsteniteConnector {
    type Connection = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, ConnectError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(WsConnection { stream })
    }
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Inbound {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Inbound::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    return Inbound::Closed(Some(
                        frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Inbound::Error(e.to_string()),
                None => return Inbound::Closed(Some(ABNORMAL_CLOSURE)),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "close handshake failed");
        }
    }
}

/// Where subscriber channels live: `<scheme>://<host>/ws/notifications/<subscriber>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEndpoint {
    base: Url,
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

impl NotificationEndpoint {
    /// `host` may carry a port.
    pub fn new(scheme: &str, host: &str) -> Result<Self, ConfigError> {
        let raw = format!("{scheme}://{host}/");
        let base = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { url: raw, source })?;
        Ok(Self { base })
    }

    /// Explicit `host` wins; loopback API hosts map to `127.0.0.1:<port>`, others keep their name.
    pub fn resolve(api_base: &Url, host: Option<&str>, port: u16) -> Result<Self, ConfigError> {
        let scheme = if api_base.scheme() == "https" { "wss" } else { "ws" };
        let host = match (host, api_base.host_str()) {
            (Some(host), _) => host.to_string(),
            (None, Some(api_host)) if !is_loopback(api_host) => format!("{api_host}:{port}"),
            (None, _) => format!("127.0.0.1:{port}"),
        };
        Self::new(scheme, &host)
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::resolve(
            &config.base_url()?,
            config.notifications.host.as_deref(),
            config.notification_port(),
        )
    }

    /// The subscriber goes in as a single percent-encoded path segment.
    pub fn url_for(&self, subscriber: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .clear()
                .extend(["ws", "notifications", subscriber])
                .push("");
        }
        url.into()
    }
}

enum Termination {
    Closed(Option<u16>),
    Failed,
}

enum Next {
    Reconnect(Duration),
    Finish,
}

/// State owned by one subscription task.
struct ChannelSession {
    state: ChannelState,
    attempt: u32,
    backoff: Backoff,
    dedup: DedupWindow,
}

impl ChannelSession {
    fn new(backoff: Backoff, dedup_window: Duration) -> Self {
        Self {
            state: ChannelState::Idle,
            attempt: 0,
            backoff,
            dedup: DedupWindow::new(dedup_window),
        }
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state,
            attempt: self.attempt,
        }
    }

    fn connecting(&mut self) {
        self.state = ChannelState::Connecting;
    }

    fn opened(&mut self) {
        self.state = ChannelState::Open;
        self.attempt = 0;
    }

    fn terminated(&mut self, termination: Termination) -> Next {
        if let Termination::Closed(Some(NORMAL_CLOSURE)) = termination {
            self.state = ChannelState::ClosedNormal;
            return Next::Finish;
        }
        self.state = ChannelState::ClosedAbnormal;
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Next::Reconnect(delay)
    }

    fn stopped(&mut self) {
        self.state = ChannelState::Stopped;
    }

    fn handle_text(&mut self, text: &str, sink: &dyn NotificationSink) {
        let payload = match parse_frame(text) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!("ignoring frame without message");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed notification frame");
                return;
            }
        };
        if !self.dedup.admit(&payload.message, Instant::now()) {
            tracing::debug!(message = %payload.message, "suppressed duplicate notification");
            return;
        }
        let event = NotificationEvent::received(payload);
        tracing::info!(id = event.id.get(), message = %event.message, "notification received");
        sink.deliver(event.clone());
        sink.alert(&event.message);
    }
}

async fn close_bounded(connection: &mut impl Connection) {
    if tokio::time::timeout(CLOSE_TIMEOUT, connection.close()).await.is_err() {
        tracing::warn!(
            timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
            "notification channel close not acknowledged, dropping socket"
        );
    }
}

async fn run_session<C: Connector>(
    connector: Arc<C>,
    url: String,
    sink: Arc<dyn NotificationSink>,
    mut session: ChannelSession,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
) {
    loop {
        session.connecting();
        status.send_replace(session.status());
        tracing::debug!(%url, attempt = session.attempt, "connecting notification channel");

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connector.connect(&url) => result,
        };

        let next = match connected {
            Err(e) => {
                tracing::warn!(%url, error = %e, "notification channel connection failed");
                session.terminated(Termination::Failed)
            }
            Ok(mut connection) => {
                session.opened();
                status.send_replace(session.status());
                tracing::info!(%url, "notification channel open");

                let termination = loop {
                    let inbound = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        inbound = connection.recv() => Some(inbound),
                    };
                    match inbound {
                        None => break None,
                        Some(Inbound::Text(text)) => session.handle_text(&text, sink.as_ref()),
                        Some(Inbound::Closed(code)) => {
                            tracing::info!(?code, "notification channel closed");
                            break Some(Termination::Closed(code));
                        }
                        Some(Inbound::Error(e)) => {
                            tracing::error!(error = %e, "notification channel error");
                            close_bounded(&mut connection).await;
                            break Some(Termination::Failed);
                        }
                    }
                };
                match termination {
                    Some(termination) => session.terminated(termination),
                    None => {
                        close_bounded(&mut connection).await;
                        break;
                    }
                }
            }
        };
        status.send_replace(session.status());

        match next {
            Next::Finish => {
                tracing::info!(%url, "notification channel closed normally");
                return;
            }
            Next::Reconnect(delay) => {
                tracing::warn!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = session.attempt,
                    "scheduling notification channel reconnect"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    session.stopped();
    status.send_replace(session.status());
    tracing::debug!(%url, "notification channel torn down");
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    live: HashMap<String, (u64, CancellationToken)>,
}

struct Running {
    identity: String,
    session_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: watch::Receiver<ChannelStatus>,
    registry: Arc<Mutex<Registry>>,
}

impl Running {
    fn stop(&self) {
        self.cancel.cancel();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.live.get(&self.identity).map(|(id, _)| *id) == Some(self.session_id) {
            registry.live.remove(&self.identity);
        }
    }
}

/// Subscription handle. Dropping it tears the subscription down as well.
pub struct ChannelHandle {
    running: Option<Running>,
}

impl ChannelHandle {
    fn inactive() -> Self {
        Self { running: None }
    }

    /// False for handles from a subscribe without identity, and after unsubscribe.
    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    pub fn status(&self) -> ChannelStatus {
        match &self.running {
            Some(running) => *running.status.borrow(),
            None => ChannelStatus::IDLE,
        }
    }

    pub fn watch_status(&self) -> Option<watch::Receiver<ChannelStatus>> {
        self.running.as_ref().map(|r| r.status.clone())
    }

    /// Resolves once the session ends on its own (normal close) or is torn down.
    pub async fn finished(&self) {
        if let Some(mut status) = self.watch_status() {
            // Sender dropped means the task is gone.
            let _ = status.wait_for(|s| s.state.is_terminal()).await;
        }
    }

    /// Tear down the subscription and wait for its task to exit. Idempotent.
    pub async fn unsubscribe(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop();
        if let Err(e) = running.task.await {
            if e.is_panic() {
                tracing::error!(identity = %running.identity, "notification channel task panicked");
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop();
        }
    }
}

/// Subscribes identities to their notification channels; one live session per identity.
pub struct NotificationChannel<C = TungsteniteConnector> {
    connector: Arc<C>,
    endpoint: NotificationEndpoint,
    sink: Arc<dyn NotificationSink>,
    backoff: Backoff,
    dedup_window: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl NotificationChannel<TungsteniteConnector> {
    pub fn from_config(config: &Config, sink: Arc<dyn NotificationSink>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            TungsteniteConnector,
            NotificationEndpoint::from_config(config)?,
            sink,
        )
        .with_backoff(Backoff::new(config.reconnect_initial(), config.reconnect_max()))
        .with_dedup_window(config.dedup_window()))
    }
}

impl<C: Connector> NotificationChannel<C> {
    pub fn new(connector: C, endpoint: NotificationEndpoint, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            connector: Arc::new(connector),
            endpoint,
            sink,
            backoff: Backoff::default(),
            dedup_window: Duration::from_millis(2000),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn endpoint(&self) -> &NotificationEndpoint {
        &self.endpoint
    }

    /// Open the channel for `identity`. Without an identity nothing is opened.
    ///
    /// Subscribing an identity that already has a live session tears the old one down.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, identity: Option<&str>) -> ChannelHandle {
        let Some(identity) = identity.map(str::trim).filter(|id| !id.is_empty()) else {
            tracing::debug!("no subscriber identity, notification channel not opened");
            return ChannelHandle::inactive();
        };

        let cancel = CancellationToken::new();
        let session_id = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.next_id += 1;
            let session_id = registry.next_id;
            if let Some((_, previous)) = registry
                .live
                .insert(identity.to_string(), (session_id, cancel.clone()))
            {
                tracing::debug!(identity, "replacing live notification session");
                previous.cancel();
            }
            session_id
        };

        let (status_tx, status_rx) = watch::channel(ChannelStatus::IDLE);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.connector),
            self.endpoint.url_for(identity),
            Arc::clone(&self.sink),
            ChannelSession::new(self.backoff, self.dedup_window),
            status_tx,
            cancel.clone(),
        ));

        ChannelHandle {
            running: Some(Running {
                identity: identity.to_string(),
                session_id,
                cancel,
                task,
                status: status_rx,
                registry: Arc::clone(&self.registry),
            }),
        }
    }

    /// Number of identities with a live session.
    pub fn live_sessions(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }
}
