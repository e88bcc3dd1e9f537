//! Provider webhook reconciliation
//!
//! An email provider reports delivery and engagement outcomes asynchronously
//! through webhooks. This crate translates provider-specific event
//! vocabularies into the engine's canonical [`Event`] taxonomy and reconciles
//! message and log state under out-of-order and duplicate delivery:
//! - [`ProviderVocabulary`]: pluggable translation from provider JSON to
//!   canonical events; one table per provider
//! - [`WebhookReconciler`]: the timestamp-guarded state machine applying
//!   events to the message store
//! - [`WebhookIngress`]: the HTTP-shaped boundary (signature outcome in,
//!   response classification out)

pub mod error;
pub mod event;
pub mod ingress;
pub mod provider;
pub mod reconciler;

pub use error::WebhookError;
pub use event::Event;
pub use ingress::{WebhookIngress, WebhookResponse};
pub use provider::{MandrillVocabulary, ProviderEvent, ProviderVocabulary};
pub use reconciler::{ReconcileReport, WebhookReconciler};
