//! `Capability` — a named action a module exports.

use serde::{Deserialize, Serialize};

/// Describes one action a module exposes. Informational: the dispatcher
/// does not enforce `input_kinds`/`output_kind` today, but tests may.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_kinds: Vec<String>,
    #[serde(default)]
    pub output_kind: Option<String>,
    #[serde(default)]
    pub async_ok: bool,
    #[serde(default)]
    pub deps: Vec<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_kinds: Vec::new(),
            output_kind: None,
            async_ok: true,
            deps: Vec::new(),
        }
    }

    pub fn with_input_kinds(mut self, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.input_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_kind(mut self, kind: impl Into<String>) -> Self {
        self.output_kind = Some(kind.into());
        self
    }
}
