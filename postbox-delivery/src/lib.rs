//! Queued delivery engine for outbound mail
//!
//! This crate is the state machine between "a message sits in the queue" and
//! "a message is sent, failed, or waiting for its next retry":
//! - [`RetryPolicy`]: deterministic backoff and terminal-failure decisions
//! - [`BatchSelector`]: bounded, priority-ordered selection of eligible mail
//! - [`Dispatcher`]: one message through one transport connection, with
//!   per-attempt logging
//! - [`DispatchRunner`]: lock-protected fan-out of a whole batch across a
//!   bounded worker pool with a global wall-clock timeout

pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod runner;
pub mod selector;
pub mod template;
pub mod transport;

pub use dispatcher::{DispatchOutcome, Dispatcher, LogLevel};
pub use error::{DeliveryError, DispatchError, PermanentError, SystemError, TemporaryError};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{DispatchRunner, RunCounts, DISPATCH_LOCK_NAME};
pub use selector::BatchSelector;
pub use template::{RenderedContent, SimpleTemplateEngine, TemplateEngine, TemplateError};
pub use transport::{
    LoopbackTransport, RenderedMessage, Transport, TransportConnection, TransportError,
    TransportRegistry,
};
