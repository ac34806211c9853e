//! homelift: command-line client for the HomeLift API.
//! Reads config, keeps the session in a local file, sends authenticated
//! requests and listens for live notifications.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use homelift_client::config;
use homelift_client::{
    ApiClient, AuthService, Body, Config, Credentials, FileSessionStore, FormPart, LoginRoute,
    NotificationChannel, NotificationService, NotificationStore, RequestOptions, SessionHooks,
    SessionStore,
};
use reqwest::Method;

#[derive(Debug, Parser)]
#[command(name = "homelift", version, about = "HomeLift API client")]
struct Cli {
    /// Config file (default: $HOMELIFT_CONFIG, then ~/.homelift/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send an authenticated request and print the response body
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long, conflicts_with_all = ["form", "file"])]
        json: Option<String>,
        /// Multipart text field, `name=value`
        #[arg(long)]
        form: Vec<String>,
        /// Multipart file field, `name=path`
        #[arg(long)]
        file: Vec<String>,
        /// Query parameter, `key=value`
        #[arg(long)]
        query: Vec<String>,
    },
    /// Log in and store the session
    Login {
        email: String,
        password: String,
        /// Use the administrator login
        #[arg(long)]
        admin: bool,
    },
    /// End the session
    Logout {
        /// Only clear the local session, do not notify the server
        #[arg(long)]
        local: bool,
    },
    /// Stored notifications
    Notifications {
        #[command(subcommand)]
        action: NotificationsAction,
    },
    /// Print live notifications until interrupted
    Listen {
        /// Subscriber id (default: the logged-in user's id)
        subscriber: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum NotificationsAction {
    List,
    Read { id: i64 },
}

/// Tells the user where to log in again once the session is gone.
struct CliHooks;

impl SessionHooks for CliHooks {
    fn session_terminated(&self, route: LoginRoute, redirect: &str) {
        let surface = match route {
            LoginRoute::Admin => "admin login",
            LoginRoute::Standard => "login",
        };
        eprintln!("Session expired. Please sign in again ({surface}: {redirect}).");
    }
}

fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Ok(val) = std::env::var("HOMELIFT_CONFIG") {
        return Ok(PathBuf::from(val));
    }
    config::default_config_path()
        .context("unable to determine config path (set --config or HOMELIFT_CONFIG)")
}

fn split_pair(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected `name=value`, got `{raw}`"),
    }
}

fn request_body(json: Option<String>, form: Vec<String>, file: Vec<String>) -> anyhow::Result<Body> {
    if let Some(json) = json {
        let value = serde_json::from_str(&json).context("--json is not valid JSON")?;
        return Ok(Body::Json(value));
    }
    if form.is_empty() && file.is_empty() {
        return Ok(Body::Empty);
    }
    let mut parts = Vec::new();
    for field in &form {
        let (name, value) = split_pair(field)?;
        parts.push(FormPart::text(name, value));
    }
    for field in &file {
        let (name, path) = split_pair(field)?;
        let bytes = std::fs::read(&path).with_context(|| format!("cannot read {path}"))?;
        let file_name = PathBuf::from(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        parts.push(FormPart::file(name, file_name, bytes));
    }
    Ok(Body::Multipart(parts))
}

fn print_body(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{text}"),
        },
        Err(_) => println!("{text}"),
    }
}

async fn run(cli: Cli, cfg: Config) -> anyhow::Result<()> {
    let session_path = cfg
        .session_path()
        .context("unable to determine session path (set session.path)")?;
    let session: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(session_path));
    let client = ApiClient::from_config(&cfg, Arc::clone(&session))?.with_hooks(Arc::new(CliHooks));

    match cli.command {
        Command::Request {
            method,
            path,
            json,
            form,
            file,
            query,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method `{method}`"))?;
            let body = request_body(json, form, file)?;
            let mut options = RequestOptions::default();
            for pair in &query {
                let (key, value) = split_pair(pair)?;
                options = options.query(key, value);
            }
            let response = client.request(method, &path, body, options).await?;
            print_body(&response.text());
        }
        Command::Login {
            email,
            password,
            admin,
        } => {
            let auth = AuthService::new(&client);
            let credentials = Credentials::new(email, password);
            let response = if admin {
                auth.admin_login(&credentials).await?
            } else {
                auth.login(&credentials).await?
            };
            println!(
                "{}",
                response.message.as_deref().unwrap_or("Login successful")
            );
        }
        Command::Logout { local } => {
            let route = AuthService::new(&client).logout(!local).await?;
            println!("Logged out. Sign in again at {}", client.routes().path(route));
        }
        Command::Notifications { action } => {
            let notifications = NotificationService::new(&client);
            match action {
                NotificationsAction::List => {
                    for n in notifications.list().await? {
                        let marker = if n.is_read { " " } else { "*" };
                        println!(
                            "{marker} {:>5}  {}  {}",
                            n.id,
                            n.created_at.format("%Y-%m-%d %H:%M"),
                            n.message
                        );
                    }
                }
                NotificationsAction::Read { id } => {
                    notifications.mark_read(id).await?;
                    println!("Notification {id} marked as read");
                }
            }
        }
        Command::Listen { subscriber } => {
            let subscriber = match subscriber {
                Some(s) => Some(s),
                None => session.profile()?.and_then(|p| p.id).map(|id| id.to_string()),
            };
            let Some(subscriber) = subscriber else {
                bail!("no subscriber given and no logged-in user");
            };

            let store = Arc::new(NotificationStore::new());
            match NotificationService::new(&client).list().await {
                Ok(records) => {
                    store.replace_all(records.into_iter().map(Into::into).collect());
                    println!("{} unread notification(s)", store.unread_count());
                }
                Err(e) => tracing::warn!(error = %e, "could not fetch stored notifications"),
            }
            let mut updates = store.subscribe_updates();
            let channel = NotificationChannel::from_config(&cfg, store.clone())?;
            tracing::info!(url = %channel.endpoint().url_for(&subscriber), "listening");
            let mut handle = channel.subscribe(Some(&subscriber));

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(event) => {
                            for alert in store.take_alerts() {
                                println!("{alert}");
                            }
                            tracing::debug!(id = event.id.get(), "delivered");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "listener fell behind");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    () = handle.finished() => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            handle.unsubscribe().await;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "homelift=info,homelift_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.clone())?;
    let cfg = config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?
        .apply_env();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    rt.block_on(run(cli, cfg))
}
