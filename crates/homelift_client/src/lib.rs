//! HomeLift client core: an authenticated API client that transparently
//! refreshes expired credentials, and a self-healing notification channel.
//! Used by the `homelift` CLI.

pub mod channel;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod messages;
pub mod services;
pub mod session;
pub mod store;
pub mod transport;

pub use channel::{
    Backoff, ChannelHandle, ChannelState, ChannelStatus, Connection, Connector, DedupWindow,
    Inbound, NotificationChannel, NotificationEndpoint, NotificationSink, TungsteniteConnector,
    CLOSE_TIMEOUT,
};
pub use client::{ApiClient, LogHooks, LoginRoute, LoginRoutes, RequestOptions, SessionHooks};
pub use config::{default_config_path, Config};
pub use error::{
    ConfigError, ConnectError, RefreshError, RequestError, SessionError, TransportError,
};
pub use messages::{EventId, NotificationEvent, NotificationRecord};
pub use services::{
    ApplicationStatus, AuthService, Credentials, LoginResponse, NotificationService,
    ProviderApplication, ProviderService,
};
pub use session::{FileSessionStore, MemorySessionStore, Profile, SessionData, SessionStore};
pub use store::NotificationStore;
pub use transport::{ApiResponse, Body, FormPart, OutboundRequest, ReqwestTransport, Transport};
