//! Authenticated API client.
//!
//! Every call carries `Authorization: Bearer <access>` read from the
//! [`SessionStore`] at send time. A `401` triggers one out-of-band refresh
//! (authenticated by the refresh cookie held in the transport's jar) and one
//! resend with the new credential. A second `401`, or a failed refresh, ends
//! the session: the store is cleared, the [`SessionHooks`] are told where to
//! send the user, and the error is returned to the caller.
//!
//! Refreshes are single-flight: calls that hit `401` while a refresh is in
//! progress wait for it and reuse its outcome instead of issuing their own.
//! A call that finds no refresh running issues its own, even if an earlier
//! one already completed.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::error::{RefreshError, RequestError};
use crate::session::SessionStore;
use crate::transport::{ApiResponse, Body, OutboundRequest, ReqwestTransport, Transport};

/// Which login surface a torn-down session is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRoute {
    Standard,
    Admin,
}

/// Paths of the two login surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRoutes {
    pub login: String,
    pub admin_login: String,
}

impl Default for LoginRoutes {
    fn default() -> Self {
        Self {
            login: "/login".into(),
            admin_login: "/admin/login".into(),
        }
    }
}

impl LoginRoutes {
    pub fn path(&self, route: LoginRoute) -> &str {
        match route {
            LoginRoute::Standard => &self.login,
            LoginRoute::Admin => &self.admin_login,
        }
    }
}

/// Side effects of a terminal logout. Called after the session store has been cleared.
pub trait SessionHooks: Send + Sync {
    fn session_terminated(&self, route: LoginRoute, redirect: &str);
}

/// Logs the redirect; the default when the embedding application supplies no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl SessionHooks for LogHooks {
    fn session_terminated(&self, route: LoginRoute, redirect: &str) {
        tracing::warn!(?route, redirect, "session ended, login required");
    }
}

/// Extra per-call settings.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Progress of one call. A call is refreshed at most once.
#[derive(Debug)]
enum CallState {
    Initial,
    Refreshing,
    Retrying { credential: String },
}

/// Refresh failure, tagged with whether this call ran the refresh itself.
enum RefreshFailure {
    Owned(RefreshError),
    Shared(RefreshError),
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default, alias = "access_token")]
    access: Option<String>,
}

/// The lock is held for the whole of a refresh. It then holds that refresh's
/// outcome, which only callers that queued behind it may reuse.
#[derive(Default)]
struct RefreshCoordinator {
    last: tokio::sync::Mutex<Option<Result<String, RefreshError>>>,
}

/// HTTP client for the HomeLift API.
pub struct ApiClient<T = ReqwestTransport> {
    transport: T,
    base_url: Url,
    refresh_url: Url,
    session: Arc<dyn SessionStore>,
    hooks: Arc<dyn SessionHooks>,
    routes: LoginRoutes,
    refresh: RefreshCoordinator,
}

impl ApiClient<ReqwestTransport> {
    /// Client with a cookie-enabled `reqwest` transport, configured from `config`.
    pub fn from_config(config: &Config, session: Arc<dyn SessionStore>) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(config.timeout())
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        let base_url = config.base_url()?;
        let raw = joined(&base_url, config.refresh_path());
        let refresh_url = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        Ok(Self {
            transport,
            base_url,
            refresh_url,
            session,
            hooks: Arc::new(LogHooks),
            routes: LoginRoutes {
                login: config.login_route().to_string(),
                admin_login: config.admin_login_route().to_string(),
            },
            refresh: RefreshCoordinator::default(),
        })
    }
}

impl<T: Transport> ApiClient<T> {
    pub fn new(
        transport: T,
        base_url: &str,
        session: Arc<dyn SessionStore>,
    ) -> Result<Self, RequestError> {
        let base_url = Url::parse(base_url).map_err(|source| RequestError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;
        let refresh_url = join_path(&base_url, crate::endpoints::auth::REFRESH)?;
        Ok(Self {
            transport,
            base_url,
            refresh_url,
            session,
            hooks: Arc::new(LogHooks),
            routes: LoginRoutes::default(),
            refresh: RefreshCoordinator::default(),
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_routes(mut self, routes: LoginRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_refresh_path(mut self, path: &str) -> Result<Self, RequestError> {
        self.refresh_url = join_path(&self.base_url, path)?;
        Ok(self)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn session(&self) -> &Arc<dyn SessionStore> {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, RequestError> {
        self.request(Method::GET, path, Body::Empty, RequestOptions::default())
            .await
    }

    pub async fn post(&self, path: &str, body: Body) -> Result<ApiResponse, RequestError> {
        self.request(Method::POST, path, body, RequestOptions::default())
            .await
    }

    pub async fn patch(&self, path: &str, body: Body) -> Result<ApiResponse, RequestError> {
        self.request(Method::PATCH, path, body, RequestOptions::default())
            .await
    }

    pub async fn put(&self, path: &str, body: Body) -> Result<ApiResponse, RequestError> {
        self.request(Method::PUT, path, body, RequestOptions::default())
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, RequestError> {
        self.request(Method::DELETE, path, Body::Empty, RequestOptions::default())
            .await
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, RequestError> {
        Ok(self.get(path).await?.json()?)
    }

    /// POST `payload` as JSON and decode the JSON reply.
    pub async fn post_json<P: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        payload: &P,
    ) -> Result<R, RequestError> {
        Ok(self.post(path, Body::json(payload)?).await?.json()?)
    }

    /// Send `method path` with the current credential, recovering once from an expired credential.
    ///
    /// Returns the response for any success status. A non-401 failure status is
    /// [`RequestError::Status`]; transport failures are [`RequestError::Transport`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Body,
        options: RequestOptions,
    ) -> Result<ApiResponse, RequestError> {
        let mut url = join_path(&self.base_url, path)?;
        if !options.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&options.query);
        }

        let mut state = CallState::Initial;
        loop {
            state = match state {
                CallState::Initial => {
                    let credential = self.session.access_token()?;
                    let response = self
                        .dispatch(&method, &url, &body, &options, credential.as_deref())
                        .await?;
                    if response.status != StatusCode::UNAUTHORIZED {
                        return into_result(response);
                    }
                    tracing::debug!(%method, path, "access credential rejected, refreshing");
                    CallState::Refreshing
                }
                CallState::Refreshing => match self.refresh_credential().await {
                    Ok(credential) => CallState::Retrying { credential },
                    Err(RefreshFailure::Owned(error)) => {
                        self.terminate_session();
                        return Err(error.into());
                    }
                    Err(RefreshFailure::Shared(error)) => return Err(error.into()),
                },
                CallState::Retrying { credential } => {
                    let response = self
                        .dispatch(&method, &url, &body, &options, Some(&credential))
                        .await?;
                    if response.status == StatusCode::UNAUTHORIZED {
                        tracing::warn!(%method, path, "request rejected after refresh");
                        self.terminate_session();
                        return Err(RequestError::Unauthenticated {
                            status: response.status,
                        });
                    }
                    return into_result(response);
                }
            };
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        body: &Body,
        options: &RequestOptions,
        credential: Option<&str>,
    ) -> Result<ApiResponse, RequestError> {
        let mut headers = options.headers.clone();
        match body {
            Body::Json(_) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            // The transport writes the multipart type together with its boundary.
            Body::Multipart(_) => {
                headers.remove(CONTENT_TYPE);
            }
            Body::Empty => {}
        }
        if let Some(token) = credential {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        tracing::debug!(%method, %url, "sending request");
        let response = self
            .transport
            .send(OutboundRequest {
                method: method.clone(),
                url: url.clone(),
                headers,
                body: body.clone(),
            })
            .await?;
        Ok(response)
    }

    /// New credential for a call that saw `401`.
    ///
    /// Joins a refresh that is already running; otherwise runs a fresh one.
    async fn refresh_credential(&self) -> Result<String, RefreshFailure> {
        let mut last = match self.refresh.last.try_lock() {
            Ok(idle) => idle,
            Err(_) => {
                let finished = self.refresh.last.lock().await;
                // None if the running refresh was abandoned mid-flight.
                if let Some(outcome) = finished.as_ref() {
                    tracing::debug!("reusing concurrent refresh outcome");
                    return outcome.clone().map_err(RefreshFailure::Shared);
                }
                finished
            }
        };
        *last = None;
        let outcome = self.perform_refresh().await;
        *last = Some(outcome.clone());
        outcome.map_err(RefreshFailure::Owned)
    }

    async fn perform_refresh(&self) -> Result<String, RefreshError> {
        let request = OutboundRequest {
            method: Method::POST,
            url: self.refresh_url.clone(),
            headers: HeaderMap::new(),
            body: Body::Empty,
        };
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        if !response.status.is_success() {
            tracing::warn!(status = %response.status, "credential refresh rejected");
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
            });
        }
        let access = response
            .json::<RefreshResponse>()
            .ok()
            .and_then(|r| r.access)
            .filter(|token| !token.is_empty())
            .ok_or(RefreshError::MissingCredential)?;
        self.session
            .set_access_token(&access)
            .map_err(|e| RefreshError::Session(e.to_string()))?;
        tracing::info!("access credential refreshed");
        Ok(access)
    }

    /// Login surface for the cached profile's role.
    pub fn login_route(&self) -> LoginRoute {
        match self.session.profile() {
            Ok(Some(profile)) if profile.is_admin() => LoginRoute::Admin,
            Ok(_) => LoginRoute::Standard,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read cached profile");
                LoginRoute::Standard
            }
        }
    }

    pub fn routes(&self) -> &LoginRoutes {
        &self.routes
    }

    fn terminate_session(&self) {
        let route = self.login_route();
        if let Err(e) = self.session.clear() {
            tracing::warn!(error = %e, "failed to clear session");
        }
        let redirect = self.routes.path(route);
        tracing::warn!(redirect, "session terminated");
        self.hooks.session_terminated(route, redirect);
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, RequestError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(RequestError::Status {
            status: response.status,
            body: response.text(),
        })
    }
}

/// `base` + `path`, keeping any path prefix of `base` (`/api` + `/user/` = `/api/user/`).
fn join_path(base: &Url, path: &str) -> Result<Url, RequestError> {
    let url = joined(base, path);
    Url::parse(&url).map_err(|source| RequestError::InvalidUrl { url, source })
}

fn joined(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
