// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use haven_core::config::{self, CoreConfig};
use haven_core::keys::MasterSecret;
use haven_core::state::AppState;
use haven_core::tasks::Maintenance;
use haven_core::api;

#[tokio::main]
async fn main() {
    let core_config = CoreConfig::from_env();
    init_tracing(&core_config);

    let master = match &core_config.master_key {
        Some(encoded) => MasterSecret::from_base64(encoded)
            .expect("HAVEN_MASTER_KEY must be base64 for 32 bytes"),
        None => {
            warn!(
                "No {} set; generating an ephemeral master secret. \
                 Persisted ciphertext will be unreadable after restart.",
                config::MASTER_KEY_ENV
            );
            MasterSecret::generate().expect("system RNG unavailable")
        }
    };

    let state = AppState::bootstrap(&core_config.data_dir, master)
        .expect("Failed to bootstrap security core");
    info!(data_dir = %core_config.data_dir.display(), "Security core initialized");

    let shutdown = CancellationToken::new();
    let maintenance_handles = Maintenance::new(state.clone()).spawn_all(shutdown.clone());

    let app = api::router(state);
    let addr: SocketAddr = format!("{}:{}", core_config.host, core_config.port)
        .parse()
        .expect("Failed to parse bind address");

    info!("Haven core listening on http://{addr} (docs at /docs)");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for shutdown signal");
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .expect("HTTP server failed");

    shutdown.cancel();
    for handle in maintenance_handles {
        let _ = handle.await;
    }
    info!("Haven core stopped");
}

fn init_tracing(core_config: &CoreConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));

    if core_config.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
