//! Templating for configuration files pushed into instances
//!
//! Configuration files (haproxy.cfg, static pod manifests) are rendered from
//! Jinja templates with minijinja. Operators may supply their own templates,
//! so rendering is strict about undefined variables and deterministic for a
//! given context.
//!
//! - `{{ value }}` - Variables
//! - `{% if %}...{% endif %}` - Conditionals
//! - `{% for %}...{% endfor %}` - Loops
//! - Filters: `{{ value | default("fallback") }}`, `{{ address | ip_literal }}`

mod engine;
mod error;
mod filters;

pub use engine::TemplateEngine;
pub use error::TemplateError;
