//! Turning response payloads into bot messages and context updates

use crate::capabilities::{Capabilities, Capability};
use crate::convo::{BotMsg, Button, Media};
use crate::error::{TestError, TestResult};
use crate::json_query::{looks_like_json_path, query_flat, JsonQuery};
use crate::template::value_to_text;
use serde_json::Value;

/// How `SIMPLEREST_CONTEXT_JSONPATH` results enter the session context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    #[default]
    Merge,
    Replace,
}

/// Which part of a payload updates the session context
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    /// Leave the context alone
    Skip,
    /// Only what `SIMPLEREST_CONTEXT_JSONPATH` selects
    Selected,
    /// The whole payload, merged
    Full,
    /// Every node the query selects, merged
    Path(JsonQuery),
}

impl ContextUpdate {
    /// Read a `*_UPDATE_CONTEXT` capability: a JSONPath selects what is
    /// merged, `true` merges the whole payload
    pub fn from_caps(caps: &Capabilities, cap: Capability) -> TestResult<Self> {
        let Some(value) = caps.get(cap) else {
            return Ok(Self::Skip);
        };
        if let Value::String(path) = value {
            if looks_like_json_path(path.trim()) {
                return JsonQuery::parse(path.trim()).map(Self::Path);
            }
        }
        match caps.get_bool(cap) {
            Some(true) => Ok(Self::Full),
            Some(false) => Ok(Self::Skip),
            None => Err(TestError::configuration(format!(
                "Capability {} must be a boolean or a JSONPath, got {value}",
                cap.as_str()
            ))),
        }
    }
}

/// Context updates of the non-conversational endpoints and inbound events
#[derive(Debug, Clone)]
pub struct ContextUpdates {
    pub start: ContextUpdate,
    pub ping: ContextUpdate,
    pub poll: ContextUpdate,
    pub inbound: ContextUpdate,
}

impl ContextUpdates {
    pub fn from_caps(caps: &Capabilities) -> TestResult<Self> {
        Ok(Self {
            start: ContextUpdate::from_caps(caps, Capability::SIMPLEREST_START_UPDATE_CONTEXT)?,
            ping: ContextUpdate::from_caps(caps, Capability::SIMPLEREST_PING_UPDATE_CONTEXT)?,
            poll: ContextUpdate::from_caps(caps, Capability::SIMPLEREST_POLL_UPDATE_CONTEXT)?,
            inbound: ContextUpdate::from_caps(caps, Capability::SIMPLEREST_INBOUND_UPDATE_CONTEXT)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    body: Option<JsonQuery>,
    text: Option<JsonQuery>,
    media: Option<JsonQuery>,
    buttons: Option<JsonQuery>,
    context: Option<JsonQuery>,
    context_mode: ContextMode,
    ignore_empty: bool,
}

fn query_cap(caps: &Capabilities, cap: Capability) -> TestResult<Option<JsonQuery>> {
    caps.get_str(cap).map(|path| JsonQuery::parse(&path)).transpose()
}

impl ResponseParser {
    pub fn from_caps(caps: &Capabilities) -> TestResult<Self> {
        let context_mode = match caps.get_str(Capability::SIMPLEREST_CONTEXT_MERGE_OR_REPLACE) {
            None => ContextMode::Merge,
            Some(mode) => match mode.to_ascii_uppercase().as_str() {
                "MERGE" => ContextMode::Merge,
                "REPLACE" => ContextMode::Replace,
                _ => {
                    return Err(TestError::configuration(format!(
                        "SIMPLEREST_CONTEXT_MERGE_OR_REPLACE \"{mode}\" unknown, expected MERGE or REPLACE"
                    )))
                }
            },
        };
        Ok(Self {
            body: query_cap(caps, Capability::SIMPLEREST_BODY_JSONPATH)?,
            text: query_cap(caps, Capability::SIMPLEREST_RESPONSE_JSONPATH)?,
            media: query_cap(caps, Capability::SIMPLEREST_MEDIA_JSONPATH)?,
            buttons: query_cap(caps, Capability::SIMPLEREST_BUTTONS_JSONPATH)?,
            context: query_cap(caps, Capability::SIMPLEREST_CONTEXT_JSONPATH)?,
            context_mode,
            ignore_empty: caps.flag(Capability::SIMPLEREST_IGNORE_EMPTY),
        })
    }

    /// Bot messages contained in a payload.
    ///
    /// Each node selected by the body path is one candidate (the whole
    /// payload without a body path). Several texts in one candidate become
    /// several messages; buttons and media go with the first.
    pub fn messages(&self, payload: &Value) -> Vec<BotMsg> {
        let candidates = match &self.body {
            Some(body) => query_flat(body, payload),
            None => vec![payload],
        };

        let mut messages = Vec::new();
        for candidate in candidates {
            let texts: Vec<String> = match &self.text {
                Some(text) => query_flat(text, candidate)
                    .into_iter()
                    .map(value_to_text)
                    .collect(),
                None => Vec::new(),
            };
            let media = self.media.as_ref().map_or_else(Vec::new, |q| {
                query_flat(q, candidate).into_iter().filter_map(to_media).collect()
            });
            let buttons = self.buttons.as_ref().map_or_else(Vec::new, |q| {
                query_flat(q, candidate).into_iter().map(to_button).collect()
            });

            let mut first = BotMsg {
                message_text: texts.first().cloned(),
                buttons,
                media,
                source_data: candidate.clone(),
            };
            let rest: Vec<BotMsg> = texts
                .iter()
                .skip(1)
                .map(|text| BotMsg {
                    message_text: Some(text.clone()),
                    source_data: candidate.clone(),
                    ..BotMsg::default()
                })
                .collect();
            if first.message_text.is_none() && !rest.is_empty() {
                first.message_text = Some(String::new());
            }
            messages.push(first);
            messages.extend(rest);
        }

        if self.ignore_empty {
            messages.retain(|msg| !msg.is_empty());
        }
        messages
    }

    /// Apply a payload to the session context
    pub fn update_context(&self, context: &mut Value, payload: &Value, update: &ContextUpdate) {
        match update {
            ContextUpdate::Skip => {}
            ContextUpdate::Full => merge_into(context, payload),
            ContextUpdate::Path(query) => {
                for selected in query.query(payload) {
                    merge_into(context, selected);
                }
            }
            ContextUpdate::Selected => {
                let Some(selected) = self.context.as_ref().and_then(|q| q.first(payload)) else {
                    return;
                };
                match self.context_mode {
                    ContextMode::Replace => *context = selected.clone(),
                    ContextMode::Merge => merge_into(context, selected),
                }
            }
        }
    }
}

/// Shallow merge of object keys; non-objects replace the context
pub fn merge_into(context: &mut Value, update: &Value) {
    match (context, update) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        (context, Value::Object(_)) => *context = update.clone(),
        (_, _) => {}
    }
}

fn to_media(node: &Value) -> Option<Media> {
    match node {
        Value::String(uri) if !uri.is_empty() => Some(Media {
            media_uri: uri.clone(),
            mime_type: mime_guess::from_path(uri)
                .first()
                .map(|m| m.essence_str().to_string()),
        }),
        Value::Object(_) => serde_json::from_value(node.clone()).ok(),
        _ => None,
    }
}

fn to_button(node: &Value) -> Button {
    match node {
        Value::Object(map) => Button {
            text: map
                .get("text")
                .or_else(|| map.get("title"))
                .map(value_to_text),
            payload: map.get("payload").cloned(),
        },
        other => Button {
            text: Some(value_to_text(other)),
            payload: None,
        },
    }
}
