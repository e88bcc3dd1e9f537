//! Template engine seam
//!
//! Template rendering is an external collaborator; the engine only needs the
//! contract: a template reference plus a key-value context in, final
//! subject/body/html out. The [`SimpleTemplateEngine`] here does plain
//! `{{ key }}` substitution for tests and small deployments.

use std::collections::{BTreeMap, HashMap};

use postbox_common::TemplateRef;
use thiserror::Error;

/// Errors surfaced by template rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("template rendering failed: {0}")]
    Render(String),
}

/// Rendered message content, ready for transport assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
}

/// The rendering contract consumed by the dispatcher.
pub trait TemplateEngine: Send + Sync {
    /// Render a stored template against a key-value context.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NotFound`] for an unknown template reference
    /// or [`TemplateError::Render`] when rendering itself fails.
    fn render(
        &self,
        template: &TemplateRef,
        context: &BTreeMap<String, String>,
    ) -> Result<RenderedContent, TemplateError>;
}

/// A stored template in the simple engine.
#[derive(Debug, Clone)]
pub struct StoredTemplate {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
}

/// Minimal `{{ key }}` substitution engine.
#[derive(Debug, Clone, Default)]
pub struct SimpleTemplateEngine {
    templates: HashMap<String, StoredTemplate>,
}

impl SimpleTemplateEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, template: StoredTemplate) {
        self.templates.insert(name.into(), template);
    }

    fn substitute(text: &str, context: &BTreeMap<String, String>) -> String {
        let mut rendered = text.to_string();
        for (key, value) in context {
            rendered = rendered.replace(&format!("{{{{ {key} }}}}"), value);
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered
    }
}

impl TemplateEngine for SimpleTemplateEngine {
    fn render(
        &self,
        template: &TemplateRef,
        context: &BTreeMap<String, String>,
    ) -> Result<RenderedContent, TemplateError> {
        let stored = self
            .templates
            .get(&template.0)
            .ok_or_else(|| TemplateError::NotFound(template.0.clone()))?;

        Ok(RenderedContent {
            subject: Self::substitute(&stored.subject, context),
            body: Self::substitute(&stored.body, context),
            html_body: stored
                .html_body
                .as_deref()
                .map(|html| Self::substitute(html, context)),
        })
    }
}
