//! Shared test support: a scripted HTTP transport, a scripted push connector,
//! and an in-process axum server that records what it receives.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use homelift_client::{
    ApiResponse, ConnectError, Connection, Connector, Inbound, LoginRoute, NotificationEvent,
    NotificationSink, OutboundRequest, SessionHooks, SessionStore, Transport, TransportError,
};
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// HTTP side
// ---------------------------------------------------------------------------

/// One scripted reply, optionally held back until `gate` is notified.
struct Scripted {
    reply: Result<ApiResponse, String>,
    gate: Option<Arc<Notify>>,
}

/// Replies per path, consumed in order. Unscripted calls get 404.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sent: Mutex<Vec<OutboundRequest>>,
    observed: Option<Arc<dyn SessionStore>>,
    stored_at_send: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, path: &str, status: u16, body: &str) -> Self {
        self.push(path, response(status, body), None);
        self
    }

    /// Like [`reply`](Self::reply), but the response is only released once `gate` is notified.
    pub fn reply_when(self, path: &str, gate: Arc<Notify>, status: u16, body: &str) -> Self {
        self.push(path, response(status, body), Some(gate));
        self
    }

    pub fn fail(self, path: &str, message: &str) -> Self {
        self.push(path, Err(message.to_string()), None);
        self
    }

    /// Record what `session` holds at the moment each request goes out.
    pub fn observe(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.observed = Some(session);
        self
    }

    fn push(&self, path: &str, reply: Result<ApiResponse, String>, gate: Option<Arc<Notify>>) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(Scripted { reply, gate });
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, path: &str) -> Vec<OutboundRequest> {
        self.sent()
            .into_iter()
            .filter(|r| r.url.path() == path)
            .collect()
    }

    /// Stored access credential at each send to `path`, in order. Needs [`observe`](Self::observe).
    pub fn stored_at_send(&self, path: &str) -> Vec<Option<String>> {
        self.stored_at_send
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, token)| token.clone())
            .collect()
    }
}

fn response(status: u16, body: &str) -> Result<ApiResponse, String> {
    Ok(ApiResponse::new(
        StatusCode::from_u16(status).unwrap(),
        body.as_bytes().to_vec(),
    ))
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ApiResponse, TransportError> {
        let path = request.url.path().to_string();
        if let Some(session) = &self.observed {
            let token = session.access_token().unwrap();
            self.stored_at_send.lock().unwrap().push((path.clone(), token));
        }
        self.sent.lock().unwrap().push(request);
        // Let concurrent calls interleave like real network round trips.
        tokio::task::yield_now().await;
        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        let Some(Scripted { reply, gate }) = scripted else {
            return Ok(ApiResponse::new(StatusCode::NOT_FOUND, Vec::new()));
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        reply.map_err(TransportError::new)
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<(LoginRoute, String)>>,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<(LoginRoute, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl SessionHooks for RecordingHooks {
    fn session_terminated(&self, route: LoginRoute, redirect: &str) {
        self.calls.lock().unwrap().push((route, redirect.to_string()));
    }
}

/// Request as seen by [`spawn_http`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    /// Path and query.
    pub path: String,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.status).unwrap();
        let mut response = (status, self.body).into_response();
        for (name, value) in self.headers {
            response.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(&value).unwrap(),
            );
        }
        response
    }
}

pub type Handler = Arc<dyn Fn(&SeenRequest) -> Reply + Send + Sync>;

#[derive(Clone)]
struct ServerState {
    handler: Handler,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// Catch-all route: record the request, then let the test's handler answer.
async fn record(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let request = SeenRequest {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };
    let reply = (state.handler)(&request);
    state.seen.lock().unwrap().push(request);
    reply
}

fn router(handler: Handler, seen: Arc<Mutex<Vec<SeenRequest>>>) -> Router {
    Router::new()
        .fallback(record)
        .with_state(ServerState { handler, seen })
}

/// Serve `handler` on an ephemeral port in the current runtime.
pub async fn spawn_http(handler: Handler) -> (SocketAddr, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = router(handler, seen.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, seen)
}

/// Serve `handler` from a background thread with its own runtime (for binary tests).
pub fn spawn_http_thread(handler: Handler) -> SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let (addr, _seen) = spawn_http(handler).await;
            tx.send(addr).unwrap();
            std::future::pending::<()>().await;
        });
    });
    rx.recv().unwrap()
}

// ---------------------------------------------------------------------------
// Push channel side
// ---------------------------------------------------------------------------

/// One scripted step of an open connection.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Wait(Duration),
    Close(u16),
    Error(String),
}

/// Outcome of one connection attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    Refuse,
    /// Never completes the handshake.
    Stall,
    /// Opens, plays the steps, then stays open.
    Open(Vec<Step>),
    /// Like `Open`, but the peer never acknowledges our close.
    Unresponsive(Vec<Step>),
}

pub fn text(message: &str) -> Step {
    Step::Text(format!(r#"{{"message":"{message}"}}"#))
}

/// Plays attempts in order; once exhausted every attempt is refused.
#[derive(Default)]
pub struct ScriptedConnector {
    attempts: Mutex<VecDeque<Attempt>>,
    count: AtomicUsize,
    times: Mutex<Vec<Instant>>,
    urls: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive connection attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        let times = self.times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Connections closed from the client side.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnection {
    steps: VecDeque<Step>,
    closed: Arc<AtomicUsize>,
    close_hangs: bool,
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self, url: &str) -> Result<ScriptedConnection, ConnectError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.times.lock().unwrap().push(Instant::now());
        self.urls.lock().unwrap().push(url.to_string());
        let attempt = self
            .attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Refuse);
        match attempt {
            Attempt::Refuse => Err(ConnectError("connection refused".into())),
            Attempt::Stall => std::future::pending().await,
            Attempt::Open(steps) => Ok(ScriptedConnection {
                steps: steps.into(),
                closed: self.closes.clone(),
                close_hangs: false,
            }),
            Attempt::Unresponsive(steps) => Ok(ScriptedConnection {
                steps: steps.into(),
                closed: self.closes.clone(),
                close_hangs: true,
            }),
        }
    }
}

impl Connection for ScriptedConnection {
    async fn recv(&mut self) -> Inbound {
        loop {
            match self.steps.pop_front() {
                Some(Step::Text(text)) => return Inbound::Text(text),
                Some(Step::Wait(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Close(code)) => return Inbound::Closed(Some(code)),
                Some(Step::Error(e)) => return Inbound::Error(e),
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.close_hangs {
            std::future::pending::<()>().await;
        }
    }
}

/// Sink that records deliveries and alerts separately.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
    alerts: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }
}
