//! Conversation data model
//!
//! Produced by script parsers (or deserialized from JSON), consumed by the
//! runner, connectors and asserters.

use crate::error::{TestError, TestResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Who speaks in a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Bot,
}

/// Reference to an asserter, logic hook or user input attached to a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub not: bool,
}

impl StepRef {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            not: false,
        }
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.not = true;
        self
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoStep {
    #[serde(default)]
    pub step_tag: String,
    pub sender: Sender,
    #[serde(default)]
    pub message_text: Option<String>,
    /// Negates the text expectation of a bot step
    #[serde(default)]
    pub not: bool,
    #[serde(default)]
    pub asserters: Vec<StepRef>,
    #[serde(default)]
    pub logic_hooks: Vec<StepRef>,
    #[serde(default)]
    pub user_inputs: Vec<StepRef>,
}

impl ConvoStep {
    pub fn me(text: impl Into<String>) -> Self {
        Self {
            step_tag: String::new(),
            sender: Sender::Me,
            message_text: Some(text.into()),
            not: false,
            asserters: Vec::new(),
            logic_hooks: Vec::new(),
            user_inputs: Vec::new(),
        }
    }

    pub fn bot() -> Self {
        Self {
            step_tag: String::new(),
            sender: Sender::Bot,
            message_text: None,
            not: false,
            asserters: Vec::new(),
            logic_hooks: Vec::new(),
            user_inputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.step_tag = tag.into();
        self
    }

    #[must_use]
    pub fn expecting(mut self, text: impl Into<String>) -> Self {
        self.message_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_asserter(mut self, asserter: StepRef) -> Self {
        self.asserters.push(asserter);
        self
    }

    #[must_use]
    pub fn with_logic_hook(mut self, hook: StepRef) -> Self {
        self.logic_hooks.push(hook);
        self
    }

    #[must_use]
    pub fn with_user_input(mut self, input: StepRef) -> Self {
        self.user_inputs.push(input);
        self
    }
}

/// A scripted conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<ConvoStep>,
}

impl Convo {
    pub fn new(name: impl Into<String>, steps: Vec<ConvoStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    /// Fill in missing step tags with their position (`#1`, `#2`, ...)
    #[must_use]
    pub fn with_default_step_tags(mut self) -> Self {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            if step.step_tag.is_empty() {
                step.step_tag = format!("#{}", idx + 1);
            }
        }
        self
    }
}

/// A convo file holds one convo or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum ConvoFile {
    One(Convo),
    Many(Vec<Convo>),
}

/// Load the convos of a JSON file
pub fn load_convos(path: &Path) -> TestResult<Vec<Convo>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        TestError::configuration(format!("Failed to read convo file {}: {e}", path.display()))
    })?;
    let file: ConvoFile = serde_json::from_str(&text).map_err(|e| {
        TestError::configuration(format!("Failed to parse convo file {}: {e}", path.display()))
    })?;
    Ok(match file {
        ConvoFile::One(convo) => vec![convo],
        ConvoFile::Many(convos) => convos,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub media_uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Structured response from the bot for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotMsg {
    #[serde(default)]
    pub message_text: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
    #[serde(default)]
    pub media: Vec<Media>,
    /// Raw (possibly nested) response payload for structured asserters
    #[serde(default)]
    pub source_data: Value,
}

impl BotMsg {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_source(source_data: Value) -> Self {
        Self {
            source_data,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message_text.as_deref().map_or(true, str::is_empty)
            && self.buttons.is_empty()
            && self.media.is_empty()
    }
}

/// Outbound message from the test user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeMsg {
    #[serde(default)]
    pub message_text: Option<String>,
    #[serde(default)]
    pub buttons: Vec<Button>,
    #[serde(default)]
    pub media: Vec<Media>,
    /// Extra fields set by logic hooks, visible to request templates as `msg.<key>`
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl MeMsg {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Template view: the message fields with custom keys flattened in
    pub fn to_view(&self) -> Value {
        let mut view = Map::new();
        view.insert(
            "messageText".to_string(),
            self.message_text.clone().map_or(Value::Null, Value::String),
        );
        view.insert(
            "buttons".to_string(),
            serde_json::to_value(&self.buttons).unwrap_or(Value::Null),
        );
        view.insert(
            "media".to_string(),
            serde_json::to_value(&self.media).unwrap_or(Value::Null),
        );
        for (key, value) in &self.custom {
            view.insert(key.clone(), value.clone());
        }
        Value::Object(view)
    }
}
