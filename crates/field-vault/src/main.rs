//! `field-vault` service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Build the root secret source and the key derivation service.
//! 4. Probe the secret source once; refuse to start without it.
//! 5. Build the session registry and encryption facade.
//! 6. Start the periodic sweep of stale named contexts.
//! 7. Build the Axum router and serve until Ctrl-C / SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use field_vault::{
    audit::TracingAuditSink,
    config::Config,
    derivation::KeyDerivationService,
    server::{self, contexts::SWEEP_INTERVAL, state::AppState},
    session::SystemClock,
    telemetry, EncryptionFacade, SessionRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let otlp_endpoint = cfg
        .otel_exporter_otlp_endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty());
    telemetry::init_telemetry(otlp_endpoint, &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.listen_port,
        secret_source = ?cfg.secret_source,
        derivation_version = cfg.derivation_version,
        "field-vault starting"
    );

    // -----------------------------------------------------------------------
    // 3-4. Secret source and key derivation
    // -----------------------------------------------------------------------
    let deriver = KeyDerivationService::new(
        cfg.build_secret_source(),
        cfg.secret_timeout(),
        cfg.derivation_version,
    );
    let probe = deriver.clone();
    tokio::task::spawn_blocking(move || probe.probe())
        .await
        .context("secret probe task failed")?
        .context("root secret unavailable at startup")?;
    info!("root secret available");

    // -----------------------------------------------------------------------
    // 5. Sessions and facade
    // -----------------------------------------------------------------------
    let registry = SessionRegistry::new(
        deriver,
        cfg.session_policy(),
        Arc::new(SystemClock),
        Arc::new(TracingAuditSink),
    );
    let facade = EncryptionFacade::new(registry);

    let state = AppState::new(
        facade,
        cfg.pii_field_paths(),
        cfg.context_header_name.clone(),
        cfg.max_contexts,
    )
    .with_request_timeout(cfg.request_timeout());

    // -----------------------------------------------------------------------
    // 6. Context sweeper
    // -----------------------------------------------------------------------
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let now = sweeper.facade.registry().clock().now();
            let swept = sweeper.contexts.sweep(now);
            if swept > 0 {
                info!(swept, open = sweeper.contexts.len(), "stale named contexts swept");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("field-vault stopped");
    telemetry::shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
