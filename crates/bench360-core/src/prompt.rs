use serde::{Deserialize, Serialize};

/// One or more acceptable reference answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    One(String),
    Many(Vec<String>),
}

impl Default for Reference {
    fn default() -> Self {
        Reference::Many(Vec::new())
    }
}

impl Reference {
    pub fn answers(&self) -> Vec<&str> {
        match self {
            Reference::One(s) => vec![s.as_str()],
            Reference::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Reference::One(_) => false,
            Reference::Many(v) => v.is_empty(),
        }
    }
}

/// A prompt and its reference answer(s), as produced by a task generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptUnit {
    pub prompt: String,
    #[serde(default)]
    pub reference: Reference,
}

impl PromptUnit {
    pub fn new(prompt: impl Into<String>, reference: Reference) -> Self {
        Self {
            prompt: prompt.into(),
            reference,
        }
    }
}
