//! Built-in user inputs: structured (non-text) user messages

use super::{Binding, UserInput, UserInputContext};
use crate::convo::{Button, Media};
use crate::error::{TestError, TestResult};
use async_trait::async_trait;
use serde_json::Value;

/// Simulates a button click: `BUTTON <payload> [text]`
#[derive(Debug)]
pub struct ButtonInput {
    name: String,
}

impl ButtonInput {
    pub fn new(binding: Binding) -> Self {
        Self {
            name: binding.name_or("ButtonInput"),
        }
    }
}

#[async_trait]
impl UserInput for ButtonInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_user_input(&self, ctx: UserInputContext<'_>) -> TestResult<()> {
        let (payload, text) = match ctx.args {
            [payload] => (payload, payload),
            [payload, text] => (payload, text),
            _ => {
                return Err(TestError::configuration(format!(
                    "{}: 1 or 2 arguments expected (payload, text)",
                    self.name
                ))
                .tagged(&ctx.convo_step.step_tag))
            }
        };
        ctx.msg.buttons = vec![Button {
            text: Some(text.clone()),
            payload: Some(Value::String(payload.clone())),
        }];
        ctx.msg.message_text = Some(payload.clone());
        Ok(())
    }
}

/// Attaches media: `MEDIA <uri> [<uri> ...]`
#[derive(Debug)]
pub struct MediaInput {
    name: String,
}

impl MediaInput {
    pub fn new(binding: Binding) -> Self {
        Self {
            name: binding.name_or("MediaInput"),
        }
    }
}

fn guess_mime_type(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    mime_guess::from_path(path).first().map(|mime| mime.essence_str().to_string())
}

#[async_trait]
impl UserInput for MediaInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_user_input(&self, ctx: UserInputContext<'_>) -> TestResult<()> {
        if ctx.args.is_empty() {
            return Err(TestError::configuration(format!(
                "{}: at least 1 argument expected (media uri)",
                self.name
            ))
            .tagged(&ctx.convo_step.step_tag));
        }
        ctx.msg.media.extend(ctx.args.iter().map(|uri| Media {
            media_uri: uri.clone(),
            mime_type: guess_mime_type(uri),
        }));
        Ok(())
    }
}
