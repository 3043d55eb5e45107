use std::collections::BTreeMap;
use std::sync::Arc;

/// Substring marking a string attribute as a template.
pub const TEMPLATE_SENTINEL: &str = "{{";

pub type Scope = BTreeMap<String, serde_json::Value>;

/// A parsed template. Rendering resolves variable references against the
/// per-call scope merged over the source's globals.
pub trait Template: Send + Sync {
    fn render(&self, scope: &Scope) -> anyhow::Result<String>;
    fn text(&self) -> &str;
}

/// Factory for templates plus the global variable store shared by all of
/// them. The concrete engine lives outside the core; this is its contract.
pub trait TemplateSource: Send + Sync {
    /// `location` names where the template text came from, for diagnostics.
    fn new_template(&self, location: &str, text: &str) -> anyhow::Result<Arc<dyn Template>>;
    fn add_global(&self, key: &str, value: serde_json::Value);
}
