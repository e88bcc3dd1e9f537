//! Transport contract and registry
//!
//! A [`Transport`] opens connections; a [`TransportConnection`] sends
//! rendered messages over an open session. Each dispatch worker opens one
//! connection per backend and reuses it for its whole slice of the batch,
//! the usual open/send-many/close pattern.
//!
//! The actual SMTP/HTTP adapters live outside this crate; the
//! [`LoopbackTransport`] here records messages in memory for tests and
//! transient deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use postbox_common::{AttachmentRef, CorrelationToken, Message};
use thiserror::Error;

use crate::template::RenderedContent;

/// Errors surfaced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the connection failed. Counts as one failed attempt for every
    /// message that would have used it.
    #[error("failed to open transport connection: {0}")]
    Connect(String),

    /// Transient send failure.
    #[error("send failed: {0}")]
    Send(String),

    /// The remote end permanently rejected the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The connection is no longer usable.
    #[error("connection closed: {0}")]
    Closed(String),
}

/// The final wire-ready payload handed to a transport.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<AttachmentRef>,
    /// Embedded so the provider can echo it back in webhook events.
    pub correlation_token: CorrelationToken,
}

impl RenderedMessage {
    /// Assemble the wire payload from a message and its rendered content.
    #[must_use]
    pub fn assemble(message: &Message, content: RenderedContent) -> Self {
        Self {
            sender: message.sender.clone(),
            to: message.to.clone(),
            cc: message.cc.clone(),
            bcc: message.bcc.clone(),
            subject: content.subject,
            body: content.body,
            html_body: content.html_body,
            headers: message.headers.clone(),
            attachments: message.attachments.clone(),
            correlation_token: message.correlation_token.clone(),
        }
    }
}

/// An open transport session.
///
/// Connections are owned by exactly one worker for the duration of its batch
/// partition and are never shared.
#[async_trait]
pub trait TransportConnection: Send {
    /// Send one rendered message over this session.
    async fn send(&mut self, message: &RenderedMessage) -> Result<(), TransportError>;

    /// Close the session. Errors on close are not actionable and are
    /// swallowed by implementations.
    async fn close(&mut self);
}

/// A transport configuration capable of opening connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session. Failures here are delivery failures, not run
    /// failures: each affected message is counted as one failed attempt.
    async fn open(&self) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// Named transports, selected per message through its backend alias.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under an alias, replacing any previous entry.
    pub fn register(&mut self, alias: impl Into<String>, transport: Arc<dyn Transport>) {
        self.transports.insert(alias.into(), transport);
    }

    /// Resolve a backend alias.
    #[must_use]
    pub fn resolve(&self, alias: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(alias).cloned()
    }

    /// Registered aliases, for diagnostics.
    #[must_use]
    pub fn aliases(&self) -> Vec<&str> {
        self.transports.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("TransportRegistry")
            .field("aliases", &self.aliases())
            .finish()
    }
}

/// Transport that records every sent message in memory.
///
/// Useful for tests and for transient deployments where outbound mail should
/// be captured rather than delivered.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    sent: Arc<Mutex<Vec<RenderedMessage>>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent through this transport so far.
    #[must_use]
    pub fn sent(&self) -> Vec<RenderedMessage> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

struct LoopbackConnection {
    sent: Arc<Mutex<Vec<RenderedMessage>>>,
    open: bool,
}

#[async_trait]
impl TransportConnection for LoopbackConnection {
    async fn send(&mut self, message: &RenderedMessage) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed("loopback connection closed".into()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<Box<dyn TransportConnection>, TransportError> {
        Ok(Box::new(LoopbackConnection {
            sent: Arc::clone(&self.sent),
            open: true,
        }))
    }
}
