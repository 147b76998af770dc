//! Noticeboard dashboard client entry point.
//!
//! Logs in if no session is stored, joins the announcement feed and logs
//! every change to the announcements list until interrupted.

use std::sync::Arc;

use noticeboard_client::{CampusApi, HttpCampusApi, PushClient, RequestClient, WsConnector};
use noticeboard_common::{AppError, AppResult, Config};
use noticeboard_core::{CacheValue, SyncScope, Synchronizer};
use noticeboard_model::{LoginRequest, Role};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

fn parse_role(value: &str) -> AppResult<Role> {
    match value.trim().to_ascii_lowercase().as_str() {
        "student" => Ok(Role::Student),
        "teacher" => Ok(Role::Teacher),
        "admin" => Ok(Role::Admin),
        "superadmin" | "super_admin" => Ok(Role::SuperAdmin),
        other => Err(AppError::Config(format!("unknown role: {other}"))),
    }
}

/// Log in from `NOTICEBOARD_IDENTIFIER`, `NOTICEBOARD_PASSWORD` and
/// `NOTICEBOARD_ROLE` unless a session is already stored.
async fn ensure_session(client: &RequestClient) -> AppResult<()> {
    if client.credentials().await?.is_some() {
        info!("Using stored session");
        return Ok(());
    }

    let var = |name: &str| {
        std::env::var(name).map_err(|_| AppError::Config(format!("{name} is not set")))
    };
    let request = LoginRequest {
        identifier: var("NOTICEBOARD_IDENTIFIER")?,
        password: var("NOTICEBOARD_PASSWORD")?,
        role: parse_role(&var("NOTICEBOARD_ROLE").unwrap_or_else(|_| "student".to_string()))?,
    };
    client.login(&request).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noticeboard=debug".into()),
        )
        .init();

    info!("Starting noticeboard client...");

    let config = Config::load()?;

    let client = RequestClient::from_config(&config)?;
    ensure_session(&client).await?;

    let api: Arc<dyn CampusApi> = Arc::new(HttpCampusApi::new(client.clone()));
    let sync = Synchronizer::new(api, config.cache.clone());
    let session = sync.watch_session(client.session_events());

    let connector = WsConnector::new(&config.push.url, client.clone())?;
    let push = PushClient::connect(Arc::new(connector), config.push.clone());
    let _feed = sync.attach(&push, SyncScope::AnnouncementFeed);

    let announcements = sync.announcements();
    let mut states = announcements.stream();
    let watch = async {
        while let Some(state) = states.next().await {
            if let Some(e) = &state.error {
                warn!(error = %e, "Announcements unavailable");
                if e.is_session_fatal() {
                    break;
                }
                continue;
            }
            if state.is_loading {
                continue;
            }
            let list = state
                .data
                .as_ref()
                .and_then(CacheValue::announcements)
                .unwrap_or_default();
            info!(count = list.len(), stale = state.is_stale, "Announcements");
            for announcement in list {
                info!(
                    id = announcement.id,
                    title = %announcement.title,
                    comments = announcement.comment_count(),
                    poll = announcement.is_poll,
                    "Announcement"
                );
            }
        }
    };

    tokio::select! {
        () = shutdown_signal() => {}
        () = watch => {
            warn!("Session ended, log in again to continue");
        }
    }

    session.abort();
    push.shutdown().await;
    info!("Client shutdown complete");
    Ok(())
}
