//! Ward and validator configuration.
//!
//! A validator spec is a sum type: a registered name, an explicit tool call,
//! or an inline polyglot block tagged by exactly one language key. Wards wrap
//! a validator with a position-independent mode (blocking / advisory / retry).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Languages accepted in inline validator blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolyglotLanguage {
    Python,
    Javascript,
    Sql,
    Clojure,
    Bash,
}

impl PolyglotLanguage {
    /// The data tool that executes code in this language.
    #[must_use]
    pub fn tool_name(&self) -> &'static str {
        match self {
            PolyglotLanguage::Python => "python_data",
            PolyglotLanguage::Javascript => "js_data",
            PolyglotLanguage::Sql => "sql_data",
            PolyglotLanguage::Clojure => "clojure_data",
            PolyglotLanguage::Bash => "bash_data",
        }
    }

    /// The input key the interpreter tool expects (`code` or `query`).
    #[must_use]
    pub fn code_input(&self) -> &'static str {
        match self {
            PolyglotLanguage::Sql => "query",
            _ => "code",
        }
    }
}

/// Inline code block with exactly one language key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolyglotBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub javascript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clojure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash: Option<String>,
}

/// The block declared zero or more than one language.
#[derive(Debug, Error)]
#[error("inline validator must set exactly one language key, found {found}")]
pub struct AmbiguousPolyglotBlock {
    pub found: usize,
}

impl PolyglotBlock {
    /// The single language and its code.
    pub fn language(&self) -> Result<(PolyglotLanguage, &str), AmbiguousPolyglotBlock> {
        let mut found: Vec<(PolyglotLanguage, &str)> = Vec::new();
        if let Some(code) = &self.python {
            found.push((PolyglotLanguage::Python, code));
        }
        if let Some(code) = &self.javascript {
            found.push((PolyglotLanguage::Javascript, code));
        }
        if let Some(code) = &self.sql {
            found.push((PolyglotLanguage::Sql, code));
        }
        if let Some(code) = &self.clojure {
            found.push((PolyglotLanguage::Clojure, code));
        }
        if let Some(code) = &self.bash {
            found.push((PolyglotLanguage::Bash, code));
        }
        match found.len() {
            1 => Ok(found.remove(0)),
            n => Err(AmbiguousPolyglotBlock { found: n }),
        }
    }

    #[must_use]
    pub fn python(code: impl Into<String>) -> Self {
        Self {
            python: Some(code.into()),
            ..Self::default()
        }
    }
}

/// Explicit tool invocation form of a validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorCall {
    pub tool: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// A validator spec: named tool or cascade, explicit call, or inline code.
///
/// Untagged: a plain string is a name, a map with `tool` is an explicit
/// call, and a map with a single language key is inline code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidatorSpec {
    Named(String),
    Call(ValidatorCall),
    Inline(PolyglotBlock),
}

impl ValidatorSpec {
    /// Short description for log rows and error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            ValidatorSpec::Named(name) => name.clone(),
            ValidatorSpec::Call(call) => format!("tool:{}", call.tool),
            ValidatorSpec::Inline(block) => match block.language() {
                Ok((lang, _)) => format!("inline:{}", lang.tool_name()),
                Err(_) => "inline:invalid".to_string(),
            },
        }
    }
}

/// How a ward failure affects the cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    /// First failure fails the cell.
    #[default]
    Blocking,
    /// Failures are logged and never block.
    Advisory,
    /// Failures re-enter the cell's main work up to `max_attempts`, then
    /// become blocking.
    Retry,
}

fn default_max_attempts() -> u32 {
    3
}

/// One ward: a validator plus failure semantics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardSpec {
    pub validator: ValidatorSpec,
    #[serde(default)]
    pub mode: WardMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Appended as a user message when a retry-mode turn ward fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_instructions: Option<String>,
}

impl WardSpec {
    #[must_use]
    pub fn blocking(validator: ValidatorSpec) -> Self {
        Self {
            validator,
            mode: WardMode::Blocking,
            max_attempts: default_max_attempts(),
            retry_instructions: None,
        }
    }
}

/// Wards grouped by position around the cell's main work.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<WardSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<WardSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn: Vec<WardSpec>,
}
