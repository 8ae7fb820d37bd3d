//! Deploy webhook: a minimal HTTP listener that triggers the refresh script
//! when the scraper repository publishes new snapshots.
//!
//! Verification is HMAC-SHA256 over the raw request body, compared in
//! constant time against the `X-Hub-Signature-256` header. Without a
//! configured secret the endpoint accepts everything (intended for local
//! development only, and loudly logged).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::WebhookConfig;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Webhook listener failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
struct WebhookState {
    config: Arc<WebhookConfig>,
}

/// Bind and run the webhook listener until the process is stopped.
pub async fn serve(config: WebhookConfig) -> Result<(), WebhookError> {
    let addr = config.bind_addr.clone();
    if config.secret.is_none() {
        warn!("No webhook secret configured, signature verification is DISABLED");
    }

    let state = WebhookState {
        config: Arc::new(config),
    };
    let app = Router::new()
        .route("/webhook", post(handle_notification))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| WebhookError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr = %addr, "Webhook listener running");

    axum::serve(listener, app).await.map_err(WebhookError::Serve)
}

async fn handle_notification(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = state.config.secret.as_deref() {
        let Some(signature) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        else {
            warn!("Rejecting webhook notification without signature header");
            return StatusCode::FORBIDDEN;
        };
        if !verify_signature(secret, &body, signature) {
            warn!("Rejecting webhook notification with invalid signature");
            return StatusCode::FORBIDDEN;
        }
    }

    info!(command = %state.config.refresh_command.display(), "Verified notification, launching refresh");
    match tokio::process::Command::new(&state.config.refresh_command).spawn() {
        Ok(_child) => StatusCode::OK,
        Err(e) => {
            error!(
                command = %state.config.refresh_command.display(),
                error = %e,
                "Failed to launch refresh command"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Check `header` ("sha256=<hex>") against the HMAC-SHA256 of `body`.
fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    // verify_slice is constant time.
    mac.verify_slice(&expected).is_ok()
}
