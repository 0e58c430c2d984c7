//! rolegate entry point

mod cli;

use crate::cli::{Cli, Commands, ServeArgs, StoreKind};
use anyhow::{Context, Result};
use clap::Parser;
use rolegate::config::ServiceConfig;
use rolegate::server::{run_server, AppState};
use rolegate::service::SessionService;
use rolegate::storage::{KeyedStore, MemoryStore, PostgresConfig, PostgresStore};
use rolegate::transport::{BrokerConfig, BrokerHttpTransport, TransportHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => serve(&cli, args).await,
        Commands::AccountToken { user_id, username } => {
            let service = build_service(&cli, ServiceConfig::default()).await?;
            let issued = service.issue_account(*user_id, username).await?;
            println!("{}", issued.token);
            println!();
            println!("User ID:    {}", user_id);
            println!("Expires at: {}", issued.expires_at().to_rfc3339());
            Ok(())
        }
        Commands::RevokeUser { user_id } => {
            let service = build_service(&cli, ServiceConfig::default()).await?;
            let revoked = service.revoke_user_devices(user_id).await?;
            println!("Revoked {} device credential(s) for {}", revoked, user_id);
            Ok(())
        }
        Commands::Sessions { user_id } => {
            let service = build_service(&cli, ServiceConfig::default()).await?;
            let sessions = service.list_sessions(user_id).await?;
            if sessions.is_empty() {
                println!("(none)");
            }
            for s in sessions {
                let role = s.role.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<12} {:<32} expires {}",
                    s.kind.as_str(),
                    role,
                    s.holder,
                    s.expires_at.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::Init => {
            let _store = open_postgres(&cli).await?;
            println!("Database schema initialized successfully");
            Ok(())
        }
    }
}

fn postgres_config(cli: &Cli) -> Result<PostgresConfig> {
    match &cli.database_url {
        Some(url) => PostgresConfig::from_url(url).context("Invalid DATABASE_URL"),
        None => PostgresConfig::from_env().context("DATABASE_URL not set"),
    }
}

async fn open_postgres(cli: &Cli) -> Result<PostgresStore> {
    let store = PostgresStore::new(postgres_config(cli)?)
        .await
        .context("Failed to open postgres store")?;
    Ok(store)
}

async fn open_store(cli: &Cli) -> Result<Arc<dyn KeyedStore>> {
    Ok(match cli.store {
        StoreKind::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Postgres => Arc::new(open_postgres(cli).await?),
    })
}

fn secret(cli: &Cli) -> Result<Vec<u8>> {
    let secret = cli
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .context("ROLEGATE_SECRET or --secret required")?;
    Ok(secret.as_bytes().to_vec())
}

async fn build_service(cli: &Cli, config: ServiceConfig) -> Result<SessionService> {
    let config = config.with_secret(secret(cli)?);
    let store = open_store(cli).await?;
    Ok(SessionService::new(store, TransportHandle::unset(), config))
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = args.service_config(secret(cli)?);
    let store = open_store(cli).await?;

    let transport = match &args.broker_url {
        Some(url) => {
            let broker = BrokerConfig::new(url, &args.broker_api_key, &args.broker_api_secret);
            let transport = BrokerHttpTransport::new(broker).context("Failed to build broker client")?;
            info!(broker = %url, "Broker notifications enabled");
            TransportHandle::new(Arc::new(transport))
        }
        None => {
            warn!("No broker URL configured; kicks will not be delivered to devices");
            TransportHandle::unset()
        }
    };

    let bind_addr: SocketAddr = args.bind.parse().context("Invalid bind address")?;

    let service = SessionService::new(store, transport, config);
    let background = service.spawn_background();

    info!(addr = %bind_addr, "rolegate starting");
    run_server(bind_addr, AppState::new(service), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutdown signal received, stopping background tasks");
    background.shutdown().await;

    info!("rolegate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
