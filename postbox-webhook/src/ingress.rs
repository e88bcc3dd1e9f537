//! The HTTP-shaped webhook boundary
//!
//! The engine does not own an HTTP server; whatever web layer hosts the
//! endpoint verifies the provider signature and hands the raw body here.
//! [`WebhookIngress`] classifies the outcome into the response the provider
//! expects: an unverified signature is answered as if the endpoint did not
//! exist.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::WebhookError;
use crate::reconciler::{ReconcileReport, WebhookReconciler};

/// Response classification for a webhook request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResponse {
    /// Payload accepted and reconciled.
    Ok(ReconcileReport),
    /// Signature verification failed; answered as a missing resource so
    /// probes learn nothing about the endpoint.
    NotFound,
    /// Payload could not be processed.
    Error,
}

impl WebhookResponse {
    /// The HTTP status code this classification maps to.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Ok(_) => 200,
            Self::NotFound => 404,
            Self::Error => 500,
        }
    }
}

/// Entry point tying signature verification outcome to reconciliation.
pub struct WebhookIngress {
    reconciler: Arc<WebhookReconciler>,
}

impl WebhookIngress {
    #[must_use]
    pub fn new(reconciler: Arc<WebhookReconciler>) -> Self {
        Self { reconciler }
    }

    /// Handle one webhook request body.
    ///
    /// `signature_verified` is the web layer's verdict on the provider
    /// signature; the body is not touched at all when it is false.
    pub async fn handle(&self, body: &[u8], signature_verified: bool) -> WebhookResponse {
        if !signature_verified {
            warn!("webhook request with invalid signature");
            return WebhookResponse::NotFound;
        }

        match self.reconciler.process_payload(body).await {
            Ok(report) => WebhookResponse::Ok(report),
            Err(err @ WebhookError::AccountSuspended(_)) => {
                error!(%err, "provider account suspended");
                WebhookResponse::Error
            }
            Err(err) => {
                warn!(%err, "webhook payload rejected");
                WebhookResponse::Error
            }
        }
    }
}
