//! Micro-templates: literal text with `{{ path }}` placeholders
//!
//! A path is a dotted sequence of keys and zero-based indices, e.g.
//! `args.0`, `msg.messageText`, `context.user.id`. Templates are compiled
//! once and rendered many times.

use crate::error::{TestError, TestResult};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPart {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { raw: String, path: Vec<PathPart> },
}

/// A compiled template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(source: &str) -> TestResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some((literal, after_open)) = rest.split_once("{{") {
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
            let Some((inner, after_close)) = after_open.split_once("}}") else {
                return Err(TestError::configuration(format!(
                    "Unterminated placeholder in template \"{source}\""
                )));
            };
            let raw = inner.trim();
            if raw.is_empty() {
                return Err(TestError::configuration(format!(
                    "Empty placeholder in template \"{source}\""
                )));
            }
            segments.push(Segment::Placeholder {
                raw: raw.to_string(),
                path: parse_path(raw),
            });
            rest = after_close;
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Resolve against a positional argument list (`{{args.N}}`).
    ///
    /// Strict: any placeholder that does not resolve is a configuration error.
    pub fn render_args(&self, args: &[String]) -> TestResult<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { raw, path } => match path.as_slice() {
                    [PathPart::Key(root), PathPart::Index(idx)] if root == "args" => {
                        let value = args.get(*idx).ok_or_else(|| {
                            TestError::configuration(format!(
                                "Template \"{}\" references {{{{{raw}}}}} but only {} argument(s) given",
                                self.source,
                                args.len()
                            ))
                        })?;
                        out.push_str(value);
                    }
                    _ => {
                        return Err(TestError::configuration(format!(
                            "Template \"{}\" has unsupported placeholder {{{{{raw}}}}}, expected {{{{args.<index>}}}}",
                            self.source
                        )))
                    }
                },
            }
        }
        Ok(out)
    }

    /// Resolve against an arbitrary JSON scope.
    ///
    /// Lenient: unresolved placeholders render as the empty string.
    pub fn render(&self, scope: &Value) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { path, .. } => {
                    if let Some(value) = lookup(scope, path) {
                        out.push_str(&value_to_text(value));
                    }
                }
            }
        }
        out
    }
}

/// Render every string leaf of a JSON template against a scope
pub fn render_json(template: &Value, scope: &Value) -> TestResult<Value> {
    Ok(match template {
        Value::String(s) => Value::String(Template::compile(s)?.render(scope)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_json(item, scope))
                .collect::<TestResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render_json(value, scope)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

/// Text form of a JSON value: strings raw, everything else compact JSON
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_path(raw: &str) -> Vec<PathPart> {
    raw.split('.')
        .map(str::trim)
        .map(|part| match part.parse::<usize>() {
            Ok(idx) => PathPart::Index(idx),
            Err(_) => PathPart::Key(part.to_string()),
        })
        .collect()
}

fn lookup<'a>(scope: &'a Value, path: &[PathPart]) -> Option<&'a Value> {
    path.iter().try_fold(scope, |current, part| match part {
        PathPart::Key(key) => current.get(key.as_str()),
        PathPart::Index(idx) => match current {
            Value::Array(items) => items.get(*idx),
            Value::Object(map) => map.get(&idx.to_string()),
            _ => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TestErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_literal_only() {
        let t = Template::compile("$.test").unwrap();
        assert_eq!(t.render_args(&[]).unwrap(), "$.test");
    }

    #[test]
    fn test_args_substitution() {
        let t = Template::compile("$.{{args.0}}.{{ args.1 }}").unwrap();
        assert_eq!(t.render_args(&args(&["a", "b"])).unwrap(), "$.a.b");
    }

    #[test]
    fn test_args_out_of_range_is_configuration_error() {
        let t = Template::compile("{{args.2}}").unwrap();
        let err = t.render_args(&args(&["a"])).unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Configuration);
        assert!(err.message.contains("only 1 argument(s) given"));
    }

    #[test]
    fn test_non_args_placeholder_rejected_in_args_mode() {
        let t = Template::compile("{{msg.messageText}}").unwrap();
        assert!(t.render_args(&args(&["a"])).is_err());
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = Template::compile("$.{{args.0").unwrap_err();
        assert_eq!(err.kind, TestErrorKind::Configuration);
    }

    #[test]
    fn test_empty_placeholder() {
        assert!(Template::compile("{{  }}").is_err());
    }

    #[test]
    fn test_render_scope() {
        let scope = json!({
            "msg": { "messageText": "hello" },
            "context": { "user": { "id": 7 }, "tags": ["x", "y"] },
            "botium": { "conversationId": "c-1" }
        });
        let t = Template::compile(
            "{{botium.conversationId}}:{{msg.messageText}}:{{context.user.id}}:{{context.tags.1}}:{{missing.key}}",
        )
        .unwrap();
        assert_eq!(t.render(&scope), "c-1:hello:7:y:");
    }

    #[test]
    fn test_render_json_template() {
        let scope = json!({ "msg": { "messageText": "hi" }, "botium": { "conversationId": "c" } });
        let template = json!({
            "text": "{{msg.messageText}}",
            "session": { "id": "{{botium.conversationId}}" },
            "count": 1
        });
        let rendered = render_json(&template, &scope).unwrap();
        assert_eq!(
            rendered,
            json!({ "text": "hi", "session": { "id": "c" }, "count": 1 })
        );
    }

    proptest! {
        #[test]
        fn prop_literal_text_renders_unchanged(text in "[a-zA-Z0-9 $._\\[\\]-]{0,40}") {
            let t = Template::compile(&text).unwrap();
            prop_assert_eq!(t.render_args(&[]).unwrap(), text);
        }

        #[test]
        fn prop_args_resolve_in_order(values in proptest::collection::vec("[a-z0-9]{0,8}", 1..6)) {
            let source: String = (0..values.len())
                .map(|i| format!("{{{{args.{i}}}}}|"))
                .collect();
            let t = Template::compile(&source).unwrap();
            let expected: String = values.iter().map(|v| format!("{v}|")).collect();
            prop_assert_eq!(t.render_args(&values).unwrap(), expected);
        }
    }
}
