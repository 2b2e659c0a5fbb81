use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use zlh_provision::agent::{GuestAgent, HttpGuestAgent};
use zlh_provision::agent_status::AgentStatusRefresher;
use zlh_provision::edge::EdgePublisher;
use zlh_provision::edge::cloudflare::{CloudflareConfig, CloudflareDns};
use zlh_provision::edge::technitium::{TechnitiumConfig, TechnitiumDns};
use zlh_provision::edge::traefik::TraefikRoutes;
use zlh_provision::edge::velocity::{VelocityConfig, VelocityProxy};
use zlh_provision::hypervisor::Hypervisor;
use zlh_provision::hypervisor::proxmox::{ProxmoxClient, ProxmoxConfig};
use zlh_provision::workloads::WorkloadCatalog;
use zlh_provision::{Decommissioner, Orchestrator, PublishMode, Settings};

mod routes;
mod state;

use state::AppState;

async fn init_db_and_migrate() -> anyhow::Result<DatabaseConnection> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
    let db = zlh_db::connect(&database_url)
        .await
        .context("connect to database")?;

    // Apply migrations on boot (idempotent).
    zlh_migration::Migrator::up(&db, None)
        .await
        .context("apply migrations")?;
    Ok(db)
}

fn edge_publisher(settings: &Settings) -> anyhow::Result<EdgePublisher> {
    let zone = settings.edge.zone.as_str();
    let internal = TechnitiumDns::new(TechnitiumConfig::from_env(zone).context("technitium config")?)
        .context("technitium client")?;
    let public = CloudflareDns::new(CloudflareConfig::from_env(zone).context("cloudflare config")?)
        .context("cloudflare client")?;
    let proxy = VelocityProxy::new(VelocityConfig::from_env().context("velocity config")?)
        .context("velocity client")?;

    Ok(EdgePublisher::new(
        Arc::new(WorkloadCatalog::from_env()),
        Arc::new(internal),
        Arc::new(public),
        Arc::new(proxy),
        Arc::new(TraefikRoutes::from_env()),
        settings.edge.clone(),
    ))
}

fn listen_addr() -> anyhow::Result<SocketAddr> {
    match std::env::var("ZLH_LISTEN_ADDR") {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid ZLH_LISTEN_ADDR {raw:?}")),
        _ => Ok(([0, 0, 0, 0], 8080).into()),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env();
    let db = init_db_and_migrate().await?;

    let hypervisor: Arc<dyn Hypervisor> = Arc::new(
        ProxmoxClient::new(ProxmoxConfig::from_env().context("proxmox config")?)
            .context("proxmox client")?,
    );
    let agent: Arc<dyn GuestAgent> =
        Arc::new(HttpGuestAgent::new(&settings.agent).context("guest agent client")?);
    let publisher = edge_publisher(&settings)?;

    let orchestrator = Orchestrator::new(
        db.clone(),
        settings.clone(),
        hypervisor,
        agent.clone(),
        publisher.clone(),
    );

    let seeded = orchestrator
        .ports()
        .seed(&settings.ports.class, settings.ports.range.clone())
        .await
        .context("seed port pool")?;
    tracing::info!(
        class = %settings.ports.class,
        start = *settings.ports.range.start(),
        end = *settings.ports.range.end(),
        seeded,
        "port pool ready"
    );

    if settings.publish.mode == PublishMode::Queued {
        orchestrator.publish_queue().clone().spawn();
    }
    AgentStatusRefresher::new(db.clone(), agent, settings.agent_refresh_interval).spawn();

    let decommissioner = Decommissioner::new(
        db,
        orchestrator.ports().clone(),
        orchestrator.driver().clone(),
        publisher,
    );

    let app = routes::router(AppState {
        orchestrator: Arc::new(orchestrator),
        decommissioner: Arc::new(decommissioner),
    });

    let addr = listen_addr()?;
    tracing::info!(%addr, "zlh-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
