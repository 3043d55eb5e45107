use std::sync::{Arc, RwLock};

use anyhow::Context;
use schema::{Scope, Template, TemplateSource};

/// Minimal `{{ path.to.var }}` expander over a JSON scope. Stands in for the
/// full configuration-language engine, which is out of scope for the core;
/// rendering semantics (missing variables are hard errors) match what the
/// orchestrator and package commands rely on.
#[derive(Default)]
pub struct SimpleTemplateSource {
    globals: Arc<RwLock<Scope>>,
}

impl SimpleTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateSource for SimpleTemplateSource {
    fn new_template(&self, location: &str, text: &str) -> anyhow::Result<Arc<dyn Template>> {
        let segments = parse(text).with_context(|| format!("bad template at {location}"))?;
        Ok(Arc::new(SimpleTemplate {
            text: text.to_string(),
            segments,
            globals: Arc::clone(&self.globals),
        }))
    }

    fn add_global(&self, key: &str, value: serde_json::Value) {
        self.globals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }
}

enum Segment {
    Literal(String),
    Var(Vec<String>),
}

struct SimpleTemplate {
    text: String,
    segments: Vec<Segment>,
    globals: Arc<RwLock<Scope>>,
}

impl Template for SimpleTemplate {
    fn render(&self, scope: &Scope) -> anyhow::Result<String> {
        let globals = self
            .globals
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(path) => {
                    let root = path.first().map(String::as_str).unwrap_or_default();
                    let value = scope
                        .get(root)
                        .or_else(|| globals.get(root))
                        .with_context(|| format!("unknown variable {:?}", path.join(".")))?;
                    let resolved = walk(value, &path[1..])
                        .with_context(|| format!("unknown variable {:?}", path.join(".")))?;
                    out.push_str(&stringify(resolved, &path.join("."))?);
                }
            }
        }
        Ok(out)
    }

    fn text(&self) -> &str {
        &self.text
    }
}

fn walk<'a>(mut value: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    for key in path {
        value = value.as_object()?.get(key)?;
    }
    Some(value)
}

fn stringify(value: &serde_json::Value, path: &str) -> anyhow::Result<String> {
    match value {
        serde_json::Value::String(text) => Ok(text.clone()),
        serde_json::Value::Number(number) => Ok(number.to_string()),
        serde_json::Value::Bool(flag) => Ok(flag.to_string()),
        _ => anyhow::bail!("variable {path:?} does not render to a string"),
    }
}

fn parse(text: &str) -> anyhow::Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .with_context(|| format!("unterminated template reference in {text:?}"))?;
        let name = after[..end].trim();
        if name.is_empty() {
            anyhow::bail!("empty template reference in {text:?}");
        }
        segments.push(Segment::Var(
            name.split('.').map(|part| part.trim().to_string()).collect(),
        ));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(text: &str, scope: &Scope) -> anyhow::Result<String> {
        SimpleTemplateSource::new()
            .new_template("test", text)?
            .render(scope)
    }

    #[test]
    fn literals_pass_through() {
        assert_eq!(render("plain text", &Scope::new()).expect("render"), "plain text");
    }

    #[test]
    fn variables_resolve_by_path() {
        let mut scope = Scope::new();
        scope.insert("self".to_string(), json!({"host": "10.0.0.4", "port": 22}));
        assert_eq!(
            render("ssh {{ self.host }}:{{ self.port }}", &scope).expect("render"),
            "ssh 10.0.0.4:22"
        );
    }

    #[test]
    fn globals_back_the_scope() {
        let source = SimpleTemplateSource::new();
        source.add_global("vars", json!({"domain": "example.com"}));
        let template = source.new_template("test", "https://{{ vars.domain }}/").expect("parse");
        assert_eq!(template.render(&Scope::new()).expect("render"), "https://example.com/");
    }

    #[test]
    fn missing_variables_are_errors() {
        let err = render("{{ self.nope }}", &Scope::new()).expect_err("must fail");
        assert!(err.to_string().contains("self.nope"));
    }

    #[test]
    fn unterminated_references_fail_to_parse() {
        let source = SimpleTemplateSource::new();
        assert!(source.new_template("test", "{{ broken").is_err());
    }

    #[test]
    fn objects_do_not_stringify() {
        let mut scope = Scope::new();
        scope.insert("self".to_string(), json!({"nested": {"a": 1}}));
        assert!(render("{{ self.nested }}", &scope).is_err());
    }
}
