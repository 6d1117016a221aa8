//! twitch-bridge - Matrix application service for Twitch chat
//!
//! Joins mapped Twitch channels and relays every chat line into its Matrix
//! room under a per-Twitch-user puppet account. Matrix users can link their
//! own Twitch account through the bot's private room.

mod bridge;
mod common;
mod config;
mod matrix;
mod protocol;
#[cfg(test)]
mod testing;
mod twitch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge::directory::{BotRecord, Directory, JsonDirectory};
use bridge::provisioner::{IdentityProvisioner, Namespace};
use bridge::{intake, Bridge, MatrixIntake, RoomRelay, SessionRegistry};
use common::error::AppError;
use common::types::{ChatAccount, Credential};
use config::{load_and_validate, env::get_config_path};
use matrix::{MatrixClient, RoomMessenger};
use twitch::api::TwitchApi;
use twitch::login::{self, LoginService};
use twitch::WebSocketDialer;

/// How long sessions get to close after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("twitch-bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Homeserver: {}", config.matrix.homeserver_url);
    info!("  Bot user: {}", config.matrix.bot_user_id);
    info!("  Directory: {}", config.directory.path);
    info!("  Mapped rooms: {}", config.rooms.len());

    // ============================================================
    // Directory and registry
    // ============================================================
    let directory = Arc::new(JsonDirectory::new(&config.directory.path));
    let snapshot = directory.load().await.map_err(AppError::from)?;
    info!(
        "Directory loaded: {} room(s), {} bridged identities, {} real user(s)",
        snapshot.rooms.len(),
        snapshot.bridged.len(),
        snapshot.real_users.len()
    );

    let registry = Arc::new(SessionRegistry::from_snapshot(&snapshot));
    for mapping in config.room_mappings() {
        registry.add_room_mapping(&mapping).await;
        if let Err(e) = directory.save_room(&mapping).await {
            warn!("Failed to persist room mapping #{}: {}", mapping.channel, e);
        }
    }

    // ============================================================
    // Collaborators
    // ============================================================
    let messenger = Arc::new(
        MatrixClient::new(&config.matrix.homeserver_url, &config.matrix.as_token).map_err(|e| AppError::Startup {
            message: format!("Matrix client: {}", e),
        })?,
    );
    let twitch_api = Arc::new(
        TwitchApi::new(
            &config.twitch.client_id,
            &config.twitch.client_secret,
            &config.twitch.redirect_uri,
        )
        .map_err(|e| AppError::Startup {
            message: format!("Twitch API client: {}", e),
        })?,
    );
    let namespace = Namespace::parse(&config.matrix.user_namespace).map_err(AppError::from)?;
    let bot = Credential::new(config.matrix.bot_user_id.clone());
    ensure_bot_account(messenger.as_ref(), &bot).await;

    let provisioner = Arc::new(IdentityProvisioner::new(
        registry.clone(),
        messenger.clone(),
        twitch_api.clone(),
        directory.clone(),
        namespace,
    ));
    let relay = Arc::new(RoomRelay::new(messenger.clone(), bot.clone()));
    let mappings = registry.room_mappings().await;
    let joined = relay.join_rooms(&mappings).await;
    info!("Bot joined {}/{} mapped room(s)", joined, mappings.len());
    let bridge = Arc::new(Bridge::new(
        registry.clone(),
        provisioner,
        relay,
        Arc::new(WebSocketDialer::default()),
    ));

    // ============================================================
    // Chat sessions
    // ============================================================
    let bot_account = match (config.bot_account(), snapshot.bot.as_ref()) {
        (Some(account), _) => {
            let record = BotRecord {
                twitch_name: account.username.clone(),
                twitch_token: account.token.as_str().to_string(),
            };
            if let Err(e) = directory.save_bot(&record).await {
                warn!("Failed to persist bot account: {}", e);
            }
            account
        }
        (None, Some(record)) => ChatAccount::new(record.twitch_name.clone(), record.twitch_token.clone()),
        (None, None) => {
            error!("No Twitch bot account configured");
            error!("Set twitch.bot in {} or TWITCH_BRIDGE_BOT_USERNAME/TWITCH_BRIDGE_BOT_TOKEN.", config_path);
            return Err(AppError::Startup {
                message: "missing Twitch bot account".to_string(),
            }
            .into());
        }
    };
    info!("Twitch bot account: {}", bot_account.username);

    let bot_sessions = bridge.start_bot_sessions(&bot_account).await;
    info!("Started {} bot session(s)", bot_sessions.len());
    bridge.resume_user_sessions().await;

    // ============================================================
    // HTTP listeners
    // ============================================================
    let login_service = Arc::new(LoginService::new(
        registry.clone(),
        twitch_api,
        messenger,
        directory.clone(),
        bridge.clone(),
        bot.clone(),
    ));
    let matrix_intake = Arc::new(MatrixIntake::new(
        registry,
        login_service.clone(),
        bridge.clone(),
        directory,
        &bot.user_id,
        &config.matrix.hs_token,
    ));

    let cancel = bridge.cancel_token();
    let appservice_server = serve(
        "appservice",
        &config.matrix.listen,
        intake::router(matrix_intake),
        cancel.clone(),
    )
    .await?;
    let callback_server = serve(
        "OAuth callback",
        &config.twitch.callback_listen,
        login::router(login_service),
        cancel.clone(),
    )
    .await?;

    // ============================================================
    // Run until signalled
    // ============================================================
    shutdown_signal().await;
    info!("Shutdown signal received - closing chat sessions...");
    bridge.shutdown(SHUTDOWN_GRACE).await;

    for (name, server) in [("appservice", appservice_server), ("OAuth callback", callback_server)] {
        match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} listener task panicked: {}", name, e),
            Err(_) => warn!("{} listener did not stop in time", name),
        }
    }

    info!("Exiting...");
    Ok(())
}

/// Bind `addr` and serve `router` until `cancel` fires.
async fn serve(
    name: &'static str,
    addr: &str,
    router: axum::Router,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| AppError::Startup {
        message: format!("failed to bind {} listener on {}: {}", name, addr, e),
    })?;
    info!("{} listener on {}", name, addr);

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("{} listener failed: {}", name, e);
        }
    }))
}

/// Register the bot's own Matrix account. Already existing is fine.
async fn ensure_bot_account(messenger: &dyn RoomMessenger, bot: &Credential) {
    let localpart = bot
        .user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or_default();
    if let Err(e) = messenger.register_user(localpart).await {
        warn!("Failed to register bot account {}: {}", bot.user_id, e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
