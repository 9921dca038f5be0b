// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{error::Error, net::SocketAddr, sync::Arc};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ventura_server::{
    api::router,
    config::{AppConfig, KmsBackend, KmsConfig, LogFormat, DEFAULT_LOG_FILTER},
    crypto::{
        kms::{LocalKeyring, MemoryTransit, TransitBackend, VaultTransit},
        DataKey, KeyManager,
    },
    generation::HttpGenerator,
    session::{SessionReaper, SessionStore},
    state::{AppState, AuthConfig},
    storage::{AppDatabase, CreditLedger, KeyVersionRepository, ProjectRepository},
};

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).init(),
    }
}

fn build_key_manager(
    config: &KmsConfig,
    db: &Arc<AppDatabase>,
) -> Result<KeyManager, Box<dyn Error>> {
    let master = match &config.local_key {
        Some(key) => key.clone(),
        None => {
            warn!("LOCAL_ENCRYPTION_KEY not set; locally encrypted data will not survive a restart");
            DataKey::generate()?
        }
    };

    let remote: Option<Arc<dyn TransitBackend>> = match &config.backend {
        KmsBackend::Vault { url, token, mount } => {
            info!(url = %url, mount = %mount, "Using Vault transit for user keys");
            Some(Arc::new(VaultTransit::new(
                url.clone(),
                token.clone(),
                mount.clone(),
                config.timeout,
            )?))
        }
        KmsBackend::Memory => {
            warn!("Using in-process transit backend; keys are lost on restart");
            Some(Arc::new(MemoryTransit::new()))
        }
        KmsBackend::None => {
            info!("No transit backend configured; using local keyring only");
            None
        }
    };

    let keyring = LocalKeyring::new(master)
        .with_version_store(Arc::new(KeyVersionRepository::new(db.clone())));
    Ok(KeyManager::new(remote, Some(keyring)).with_timeout(config.timeout))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_env()?;
    init_tracing(config.log_format);

    let db_path = config.database_path();
    let db = Arc::new(AppDatabase::open(&db_path)?);
    info!(path = %db_path.display(), "Opened database");

    let keys = Arc::new(build_key_manager(&config.kms, &db)?);
    let sessions = Arc::new(SessionStore::new(config.session_ttl));

    if config.jwt_secret.is_none() {
        warn!("AUTH_JWT_SECRET not set; tokens are accepted unverified in debug and dev builds only");
    }

    let ledger = CreditLedger::new(db.clone()).with_initial_allowance(config.initial_credits);
    info!(initial_credits = config.initial_credits, "Credit ledger ready");
    let mut state = AppState::with_ledger(db.clone(), sessions.clone(), keys, ledger)
        .with_auth_config(AuthConfig {
            jwt_secret: config.jwt_secret.clone(),
            issuer: config.issuer.clone(),
        });
    match &config.generator {
        Some(generator) => {
            info!(url = %generator.url, "Content generation enabled");
            state = state.with_generator(Arc::new(HttpGenerator::new(
                generator.url.clone(),
                generator.api_key.clone(),
            )?));
        }
        None => warn!("GENERATOR_URL not set; stage generation endpoints will return 503"),
    }

    let shutdown = CancellationToken::new();
    let reaper = SessionReaper::new(sessions)
        .with_interval(config.reaper_interval)
        .with_retention(
            Arc::new(ProjectRepository::new(db)),
            state.ledger.clone(),
            config.retention,
        );
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Ventura server listening (docs at /docs)");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        error!(error = %e, "Session reaper task failed");
    }
    info!("Server stopped");
    Ok(())
}
