/// `{name}` placeholder resolution for message text and templated config values
///
/// Lookup is scope-ordered: session, then persistent, then well-known context fields.
/// Dotted names walk into JSON objects (`{contact.phone}`). Unknown placeholders are
/// left untouched so authors can spot them in the sent text.

use crate::runtime::condition::render;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}")
            .unwrap_or_else(|e| unreachable!("placeholder regex is static: {}", e))
    })
}

/// Layered variable view used for placeholder lookup and expressions
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub session: Map<String, Value>,
    pub persistent: Map<String, Value>,
    pub context: Map<String, Value>,
}

impl Namespace {
    /// Scope-ordered lookup of a possibly dotted name
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut parts = name.split('.');
        let head = parts.next()?;
        let mut current = self
            .session
            .get(head)
            .or_else(|| self.persistent.get(head))
            .or_else(|| self.context.get(head))?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Single map with the same precedence as `lookup`
    pub fn flatten(&self) -> Map<String, Value> {
        let mut merged = self.context.clone();
        merged.extend(self.persistent.clone());
        merged.extend(self.session.clone());
        merged
    }

    /// Replace every known `{name}` in `text`
    pub fn render_text(&self, text: &str) -> String {
        placeholder()
            .replace_all(text, |caps: &regex::Captures| match self.lookup(&caps[1]) {
                Some(value) => render(value),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Render every string inside a JSON value. A string that is exactly one
    /// placeholder is replaced by the raw value, keeping its JSON type.
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(caps) = placeholder().captures(s) {
                    if caps[0].len() == s.len() {
                        if let Some(found) = self.lookup(&caps[1]) {
                            return found.clone();
                        }
                    }
                }
                Value::String(self.render_text(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
