//! Voice gateway entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_gateway_backend::{BackendClient, GenerationBackend};
use voice_gateway_config::{load_settings, Settings};
use voice_gateway_pipeline::vad::{ensure_model_file, VadModel};
use voice_gateway_server::{create_router, AppState};
use voice_gateway_telephony::{CallActions, Gateway, SipStack, TelephonyError};

/// Placeholder SIP stack used until the pjsip adapter registers.
///
/// The adapter crate links against the proprietary media stack and is built
/// separately; without it the control REST stays up and `/call` answers 503.
struct UninitializedSipStack;

impl SipStack for UninitializedSipStack {
    fn make_call(&self, _to_uri: &str) -> Result<Arc<dyn CallActions>, TelephonyError> {
        Err(TelephonyError::SipUnavailable)
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings()?;
    settings.validate()?;
    init_tracing(&settings);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend_url = %settings.backend_url,
        "Starting voice gateway"
    );

    let backend = Arc::new(BackendClient::from_settings(&settings)?);
    let capabilities = backend.capabilities().await?;
    tracing::info!(capabilities = %capabilities, "Backend capabilities received");

    let model_path = ensure_model_file(&settings.vad_model_file(), &settings.vad_model_url).await?;
    let model = Arc::new(VadModel::new(&model_path, settings.vad_sampling_rate)?);
    tracing::info!(
        path = %model_path.display(),
        sampling_rate = settings.vad_sampling_rate,
        "VAD model loaded"
    );

    let backend: Arc<dyn GenerationBackend> = backend;
    let gateway = Arc::new(Gateway::new(
        &settings,
        backend,
        Arc::new(UninitializedSipStack),
        model,
    ));

    let state = AppState {
        gateway: Arc::clone(&gateway),
        authorization_token: settings.authorization_token.clone(),
    };
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.sip_rest_api_port));
    tracing::info!(%addr, "Control REST listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    tracing::info!("Voice gateway shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("voice_gateway={},tower_http=info", settings.log_level).into());

    let fmt_layer = if settings.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
