//! Portalcrane entry point.
//!
//! Wires the persisted stores, the credential/policy resolver, the audit
//! sink, and the three core engines (staging, replication, lifecycle) into
//! one axum server exposing the registry reverse proxy at `/v2/` and the
//! admin/core-ops surface at `/api/`.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use portalcrane::api;
use portalcrane::audit::AuditSink;
use portalcrane::auth::PolicyResolver;
use portalcrane::config::Config;
use portalcrane::lifecycle::LifecycleController;
use portalcrane::proxy::{self, ProxyState};
use portalcrane::registry_client::RegistryClient;
use portalcrane::replication::ReplicationEngine;
use portalcrane::staging::StagingEngine;
use portalcrane::store::folders::FolderStore;
use portalcrane::store::registries::RegistryStore;
use portalcrane::store::users::UserStore;
use portalcrane::supervisor::SupervisorClient;
use portalcrane::Result;

#[tokio::main]
async fn main() -> Result<()> {
    portalcrane::telemetry::init();

    let config = Arc::new(Config::parse());
    info!(version = env!("CARGO_PKG_VERSION"), "starting portalcrane");

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.staging_root).await?;

    let users = Arc::new(UserStore::open(config.data_dir.join("local_users.json")).await?);
    let folders = Arc::new(FolderStore::open(config.data_dir.join("folders.json")).await?);
    let registries = Arc::new(RegistryStore::open(config.data_dir.join("external_registries.json")).await?);

    let audit = Arc::new(
        AuditSink::open(config.data_dir.join("audit-events.jsonl"), config.audit_max_events).await?,
    );

    let resolver = Arc::new(PolicyResolver::new(
        Arc::clone(&config),
        Arc::clone(&users),
        Arc::clone(&folders),
    ));

    let registry_client = Arc::new(RegistryClient::new(
        config.registry_url.clone(),
        std::time::Duration::from_secs(config.proxy_timeout_secs),
    )?);

    let staging = Arc::new(StagingEngine::new(Arc::clone(&config)));
    let replication = Arc::new(ReplicationEngine::new(Arc::clone(&config), Arc::clone(&registry_client)));

    let supervisor = Arc::new(SupervisorClient::new(config.supervisor_rpc_url.clone()));
    let lifecycle = Arc::new(LifecycleController::new(
        Arc::clone(&config),
        Arc::clone(&supervisor),
        Arc::clone(&registry_client),
    ));

    let proxy_state = Arc::new(ProxyState::new(Arc::clone(&config), Arc::clone(&resolver), Arc::clone(&audit))?);
    let app_state = Arc::new(api::AppState {
        resolver: Arc::clone(&resolver),
        staging: Arc::clone(&staging),
        replication: Arc::clone(&replication),
        registries: Arc::clone(&registries),
        lifecycle: Arc::clone(&lifecycle),
        audit: Arc::clone(&audit),
    });

    let app = proxy::router(proxy_state).merge(api::router(app_state));

    let listener = tokio::net::TcpListener::bind(config.http_listen_addr.as_str()).await?;
    info!(addr = %config.http_listen_addr, "listening");

    let shutdown_staging = Arc::clone(&staging);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, marking pending staging jobs failed");
            shutdown_staging.fail_all_pending().await;
        })
        .await?;

    Ok(())
}
