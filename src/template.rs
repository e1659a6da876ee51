//! Typed template rendering for instructions and tool inputs.
//!
//! Templates use `{{ path }}` placeholders resolved against a [`RenderScope`]
//! built from the session: `input`, `state`, `outputs`, `lineage`, `history`,
//! plus any extra bindings a call site injects. Two rendering modes exist:
//!
//! - [`render_value`]: a string that is exactly one placeholder resolves to
//!   the **native** JSON value (lists and dicts stay lists and dicts), so
//!   downstream tools receive real objects instead of stringified ones.
//! - [`render_text`]: placeholders embedded in surrounding text interpolate
//!   as strings (objects serialize to compact JSON).
//!
//! Paths are dot-separated with optional numeric indexing:
//! `outputs.load.data`, `lineage.0.cell`, `input.files.2`. An unresolvable
//! path is a hard error; silent empty substitutions hide real wiring bugs.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while rendering templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A placeholder path did not resolve against the scope.
    #[error("unresolved template variable '{path}'")]
    Unresolved { path: String },

    /// A placeholder was syntactically malformed.
    #[error("malformed template placeholder: '{placeholder}'")]
    Malformed { placeholder: String },
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap())
}

/// The data a template renders against.
#[derive(Debug, Clone, Default)]
pub struct RenderScope {
    roots: Map<String, Value>,
}

impl RenderScope {
    #[must_use]
    pub fn new() -> Self {
        Self { roots: Map::new() }
    }

    /// Standard scope for cell execution: input, state, outputs, lineage,
    /// history.
    #[must_use]
    pub fn for_cell(
        input: &Value,
        state: &Value,
        outputs: &Value,
        lineage: &Value,
        history: &Value,
    ) -> Self {
        let mut scope = Self::new();
        scope.bind("input", input.clone());
        scope.bind("state", state.clone());
        scope.bind("outputs", outputs.clone());
        scope.bind("lineage", lineage.clone());
        scope.bind("history", history.clone());
        scope
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.roots.insert(name.to_string(), value);
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    /// Resolve a dotted path (`outputs.load.data`, `lineage.0.cell`).
    pub fn resolve(&self, path: &str) -> Result<Value, TemplateError> {
        let mut segments = path.split('.');
        let root_name = segments.next().unwrap_or_default();
        let mut current = self
            .roots
            .get(root_name)
            .ok_or_else(|| TemplateError::Unresolved {
                path: path.to_string(),
            })?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            }
            .ok_or_else(|| TemplateError::Unresolved {
                path: path.to_string(),
            })?;
        }
        Ok(current.clone())
    }
}

/// True when the string contains at least one placeholder.
#[must_use]
pub fn is_template(text: &str) -> bool {
    placeholder_regex().is_match(text)
}

/// Render a template to its native value.
///
/// A bare `{{ path }}` (ignoring surrounding whitespace) yields the value at
/// `path` as-is; anything else falls back to string interpolation. The
/// `| tojson` filter is accepted and ignored in native position, since the
/// native value already carries its structure.
pub fn render_value(template: &str, scope: &RenderScope) -> Result<Value, TemplateError> {
    let trimmed = template.trim();
    let re = placeholder_regex();
    if let Some(captures) = re.captures(trimmed) {
        let full = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        if full == trimmed {
            let path = strip_filters(&captures[1]);
            return scope.resolve(&path);
        }
    }
    render_text(template, scope).map(Value::String)
}

/// Render a template as text, interpolating every placeholder.
pub fn render_text(template: &str, scope: &RenderScope) -> Result<String, TemplateError> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for captures in re.captures_iter(template) {
        let whole = captures.get(0).expect("capture group 0 always exists");
        out.push_str(&template[last_end..whole.start()]);
        let path = strip_filters(&captures[1]);
        let value = scope.resolve(&path)?;
        out.push_str(&value_to_text(&value));
        last_end = whole.end();
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

/// Render a map of tool-input templates to native values.
///
/// Non-string values pass through untouched; nested dicts and lists are
/// walked so templates buried in structure still render.
pub fn render_inputs(
    inputs: &Map<String, Value>,
    scope: &RenderScope,
) -> Result<Map<String, Value>, TemplateError> {
    let mut rendered = Map::new();
    for (name, value) in inputs {
        rendered.insert(name.clone(), render_any(value, scope)?);
    }
    Ok(rendered)
}

fn render_any(value: &Value, scope: &RenderScope) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) if is_template(text) => render_value(text, scope),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                out.insert(key.clone(), render_any(inner, scope)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_any(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn strip_filters(expr: &str) -> String {
    expr.split('|').next().unwrap_or(expr).trim().to_string()
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> RenderScope {
        RenderScope::for_cell(
            &json!({"file": "/x.csv", "n": 3}),
            &json!({"phase": "ready"}),
            &json!({"load": {"data": [1, 2, 3]}}),
            &json!([{"cell": "load"}]),
            &json!([]),
        )
    }

    #[test]
    fn bare_placeholder_yields_native_value() {
        let value = render_value("{{ outputs.load.data }}", &scope()).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn bare_placeholder_with_tojson_filter_stays_native() {
        let value = render_value("{{ outputs.load.data | tojson }}", &scope()).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn embedded_placeholder_interpolates_text() {
        let value = render_value("path={{ input.file }}!", &scope()).unwrap();
        assert_eq!(value, json!("path=/x.csv!"));
    }

    #[test]
    fn array_indexing_resolves() {
        let value = render_value("{{ lineage.0.cell }}", &scope()).unwrap();
        assert_eq!(value, json!("load"));
    }

    #[test]
    fn unresolved_path_is_an_error() {
        let err = render_value("{{ outputs.missing.data }}", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::Unresolved { ref path } if path == "outputs.missing.data"));
    }

    #[test]
    fn render_inputs_walks_nested_structure() {
        let mut inputs = Map::new();
        inputs.insert("data".into(), json!("{{ outputs.load.data }}"));
        inputs.insert("nested".into(), json!({"file": "{{ input.file }}", "k": 7}));
        let rendered = render_inputs(&inputs, &scope()).unwrap();
        assert_eq!(rendered["data"], json!([1, 2, 3]));
        assert_eq!(rendered["nested"], json!({"file": "/x.csv", "k": 7}));
    }

    #[test]
    fn non_template_strings_pass_through() {
        let mut inputs = Map::new();
        inputs.insert("plain".into(), json!("no placeholders here"));
        let rendered = render_inputs(&inputs, &scope()).unwrap();
        assert_eq!(rendered["plain"], json!("no placeholders here"));
    }
}
