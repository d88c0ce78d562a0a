use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use liveproof_core::{ByteBudget, DetectorConfig, DetectorError, FaceDetect, ScrfdDetector};
use liveproof_models::ResolvedModel;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod protocol;
mod rate_limiter;
mod session;
mod store;

use config::{Config, Policy};
use engine::PoolConfig;
use http::{AppState, ModelInfo};
use rate_limiter::HandshakeLimiter;
use session::SessionDeps;
use store::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "liveproofd starting");

    let config = Config::from_env();
    let policy = config
        .load_policy()
        .context("failed to load verification policy")?;
    tracing::info!(
        bind = %config.bind_addr,
        model_dir = %config.model_dir.display(),
        challenges = policy.challenges_per_attempt,
        timeout_ms = policy.challenge_timeout_ms,
        "configuration loaded"
    );

    let (detector_config, model) = resolve_model(&config, &policy);
    let models: Vec<ModelInfo> = model
        .iter()
        .map(|m| ModelInfo {
            tag: m.tag.clone(),
            path: m.path.display().to_string(),
            metadata: m.metadata.clone(),
        })
        .collect();

    // Each worker loads its own session; ort sessions are not shared.
    let factory = move |worker: usize| -> Result<Option<Box<dyn FaceDetect>>, DetectorError> {
        let Some(model) = &model else {
            return Ok(None);
        };
        let detector = ScrfdDetector::load(&model.path, detector_config.clone(), model.tag.clone())?;
        tracing::info!(worker, model = %model.tag, "SCRFD detector loaded");
        Ok(Some(Box::new(detector)))
    };
    let engine = engine::spawn_pool(
        PoolConfig {
            workers: config.inference_workers,
            queue_depth: config.inference_queue_depth,
            timeout: Duration::from_millis(config.inference_timeout_ms),
            grid_size: policy.pad.flicker_grid_size,
        },
        &factory,
    )
    .context("failed to start inference workers")?;

    let store = SessionStore::new(
        Duration::from_secs(config.session_ttl_secs),
        HandshakeLimiter::new(
            policy.handshake_max_failures,
            Duration::from_secs(policy.handshake_lockout_secs),
        ),
        policy.enabled_challenges.clone(),
    );
    let sweeper = store.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs.max(1)));

    let state = AppState {
        sessions: SessionDeps {
            policy: Arc::new(policy),
            store,
            engine,
            budget: ByteBudget::new(config.buffer_max_bytes),
            buffer_max_frames: config.buffer_max_frames,
            max_fps: config.max_fps,
        },
        models: Arc::new(models),
        max_message_bytes: config.max_message_bytes,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "liveproofd ready");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    sweeper.abort();
    tracing::info!("liveproofd shutting down");
    Ok(())
}

/// Locate and verify the detector model, folding its metadata into the
/// detector settings. Any failure leaves the daemon running without
/// server-side detection.
fn resolve_model(config: &Config, policy: &Policy) -> (DetectorConfig, Option<ResolvedModel>) {
    let mut detector = policy.detector.clone();
    if !config.detector_enabled {
        tracing::warn!("detector disabled by configuration, running degraded");
        return (detector, None);
    }

    match liveproof_models::resolve_detector(&config.model_dir) {
        Ok(model) => {
            if let Some(meta) = &model.metadata {
                if let Some(size) = meta.input_size() {
                    detector.input_size = size;
                }
                if let Some(mean) = meta.mean() {
                    detector.mean = mean;
                }
                if let Some(std) = meta.std() {
                    detector.std = std;
                }
                if let Err(e) = config::validate_detector(&detector) {
                    tracing::warn!(model = %model.tag, error = %e, "ignoring unusable model metadata");
                    detector = policy.detector.clone();
                }
            }
            tracing::info!(
                model = %model.tag,
                path = %model.path.display(),
                input_size = detector.input_size,
                "detector model verified"
            );
            (detector, Some(model))
        }
        Err(e) => {
            tracing::warn!(error = %e, "detector model unavailable, running degraded");
            (detector, None)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
