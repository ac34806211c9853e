//! Typed calls over [`ApiClient`]: authentication, the notification list and
//! the provider application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{ApiClient, LoginRoute};
use crate::endpoints;
use crate::error::RequestError;
use crate::messages::NotificationRecord;
use crate::session::Profile;
use crate::transport::{Body, FormPart, Transport};

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Body of a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: Profile,
    pub access_token: String,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct AuthService<'a, T: Transport> {
    client: &'a ApiClient<T>,
}

impl<'a, T: Transport> AuthService<'a, T> {
    pub fn new(client: &'a ApiClient<T>) -> Self {
        Self { client }
    }

    /// Customer/provider login. Persists the access credential and profile.
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, RequestError> {
        self.login_at(endpoints::auth::LOGIN, credentials).await
    }

    /// Administrator login. Persists the access credential and profile.
    pub async fn admin_login(
        &self,
        credentials: &Credentials,
    ) -> Result<LoginResponse, RequestError> {
        self.login_at(endpoints::admin_auth::LOGIN, credentials).await
    }

    async fn login_at(
        &self,
        path: &str,
        credentials: &Credentials,
    ) -> Result<LoginResponse, RequestError> {
        let response: LoginResponse = self.client.post_json(path, credentials).await?;
        let session = self.client.session();
        session.set_access_token(&response.access_token)?;
        session.set_profile(&response.user)?;
        tracing::info!(admin = response.user.is_admin(), "logged in");
        Ok(response)
    }

    /// End the session. A failing backend logout is logged and ignored; the
    /// local session is always cleared. Returns where to send the user next.
    pub async fn logout(&self, call_backend: bool) -> Result<LoginRoute, RequestError> {
        let route = self.client.login_route();
        if call_backend {
            if let Err(e) = self.client.post(endpoints::auth::LOGOUT, Body::Empty).await {
                tracing::warn!(error = %e, "backend logout failed or credential already invalid");
            }
        }
        self.client.session().clear()?;
        Ok(route)
    }
}

pub struct NotificationService<'a, T: Transport> {
    client: &'a ApiClient<T>,
}

impl<'a, T: Transport> NotificationService<'a, T> {
    pub fn new(client: &'a ApiClient<T>) -> Self {
        Self { client }
    }

    pub async fn list(&self) -> Result<Vec<NotificationRecord>, RequestError> {
        self.client.get_json(endpoints::notifications::LIST).await
    }

    pub async fn mark_read(&self, id: i64) -> Result<(), RequestError> {
        self.client
            .patch(&endpoints::notifications::mark_read(id), Body::Empty)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
}

/// A provider application as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderApplication {
    #[serde(default)]
    pub id: Option<i64>,
    pub status: ApplicationStatus,
    /// Empty unless rejected.
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replied_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderApplication {
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref().filter(|r| !r.is_empty())
    }
}

pub struct ProviderService<'a, T: Transport> {
    client: &'a ApiClient<T>,
}

impl<'a, T: Transport> ProviderService<'a, T> {
    pub fn new(client: &'a ApiClient<T>) -> Self {
        Self { client }
    }

    /// Submit an application. `form` carries the service fields and identity documents.
    pub async fn apply(&self, form: Vec<FormPart>) -> Result<ProviderApplication, RequestError> {
        let application: ProviderApplication = self
            .client
            .post(endpoints::provider::APPLY, Body::Multipart(form))
            .await?
            .json()?;
        tracing::info!(status = ?application.status, "provider application submitted");
        Ok(application)
    }

    /// The caller's most recent application.
    pub async fn status(&self) -> Result<ProviderApplication, RequestError> {
        self.client.get_json(endpoints::provider::STATUS).await
    }
}
