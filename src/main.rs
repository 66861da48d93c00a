mod classifier;
mod config;
mod error;
mod remote;
mod routes;
mod runner;
mod service;
mod types;

use axum::{extract::DefaultBodyLimit, http::HeaderValue, routing::get};
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::{Config, DownloadConfig, LocalClassifierConfig, RemoteClassifierConfig};
use remote::RemoteHttpClassifier;
use runner::LocalProcessClassifier;
use service::{CleanlinessDetectionService, DamageDetectionService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,car_inspect_gateway=debug".into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        address = %config.server_address(),
        remote_classifier = %config.remote_classifier_url,
        interpreter = %config.classifier_interpreter,
        script = %config.classifier_script_path.display(),
        model = %config.classifier_model_path.display(),
        "Starting car inspection gateway"
    );

    config.validate()?;
    let problems = config.report_readiness();
    if problems.is_empty() {
        tracing::info!("All detection backends are configured");
    }

    let remote = RemoteHttpClassifier::new(RemoteClassifierConfig::from(&config))?;
    let local = LocalProcessClassifier::new(LocalClassifierConfig::from(&config));

    let scratch_and_dent = Arc::new(DamageDetectionService::new(Arc::new(remote)));
    let dirty_clean = Arc::new(CleanlinessDetectionService::new(
        Arc::new(local),
        DownloadConfig::from(&config),
    )?);

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let mut app = routes::router(scratch_and_dent, dirty_clean)
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    if let Some(origin) = &config.cors_allow_origin {
        app = app.layer(cors_layer(origin)?);
        tracing::info!(origin = %origin, "CORS enabled");
    }

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return Ok(layer.allow_origin(Any));
    }

    let origin = HeaderValue::from_str(origin)
        .map_err(|e| anyhow::anyhow!("CORS_ALLOW_ORIGIN {origin:?} is not a valid origin: {e}"))?;
    Ok(layer.allow_origin(origin))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received, draining connections");
}
