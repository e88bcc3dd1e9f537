//! Postbox: an asynchronous outbound mail queueing and delivery engine
//!
//! Mail is enqueued through the [`Mailer`], persisted in a
//! [`postbox_store::MessageStore`], and delivered by periodic dispatch runs
//! serialized across hosts with a lease-based distributed lock. Providers
//! report outcomes back through webhooks, reconciled by
//! [`postbox_webhook::WebhookReconciler`].
//!
//! This crate ties the member crates together: configuration, the
//! producer-facing [`Mailer`], and the periodic [`Service`] loop.

pub mod config;
pub mod mailer;
pub mod service;

pub use postbox_webhook as webhook;

pub use config::{Config, ConfigError, DispatchConfig, LockConfig};
pub use mailer::{Mailer, MailerError};
pub use service::Service;
