//! Template engine for configuration files
//!
//! Uses minijinja with the standard Jinja delimiters:
//! - Variable delimiters: `{{...}}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//!
//! Block tags swallow their trailing newline and leading indentation, so
//! templates can be indented for readability without leaking whitespace into
//! line-oriented formats such as haproxy.cfg or YAML manifests.

use minijinja::{Environment, UndefinedBehavior, Value};
use serde::Serialize;

use super::error::TemplateError;
use super::filters;

/// Template engine for rendering configuration files
///
/// Supports:
/// - Strict undefined variable handling
/// - Custom filters (default, required, ip_literal)
/// - Deterministic output: identical input renders byte-identical output
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);

        // Register filters
        env.add_filter("default", filters::default_filter);
        env.add_filter("required", filters::required);
        env.add_filter("ip_literal", filters::ip_literal);

        Self { env }
    }

    /// Render a template string with a serializable context
    ///
    /// Map-typed fields in the context should use ordered maps (`BTreeMap`)
    /// so that iteration order, and therefore the output, is stable.
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if:
    /// - Template syntax is invalid
    /// - A referenced variable is undefined
    /// - A filter operation fails
    pub fn render<S: Serialize>(&self, template: &str, ctx: &S) -> Result<String, TemplateError> {
        self.env
            .render_str(template, Value::from_serialize(ctx))
            .map_err(TemplateError::from)
    }

    /// Check if a template compiles without rendering it
    ///
    /// Filters are resolved at render time, so a fresh environment is enough
    /// to check the syntax of an operator-supplied template.
    pub fn validate_syntax(&self, template: &str) -> Result<(), TemplateError> {
        Environment::new()
            .template_from_str(template)
            .map(|_| ())
            .map_err(TemplateError::from)
    }
}
