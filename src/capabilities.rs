//! Capability map: flat, enumerated session configuration
//!
//! Unknown keys are dropped on load, never rejected.

use crate::error::{TestError, TestResult};
use crate::matching::{MatchMode, Matcher};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

macro_rules! capabilities {
    ($($name:ident),+ $(,)?) => {
        /// Every recognised capability key
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Capability {
            $($name),+
        }

        impl Capability {
            pub const ALL: &'static [Capability] = &[$(Capability::$name),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Capability::$name => stringify!($name)),+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $(stringify!($name) => Some(Capability::$name),)+
                    _ => None,
                }
            }
        }
    };
}

capabilities! {
    PROJECTNAME,
    TESTSESSIONNAME,
    TESTCASENAME,
    WAITFORBOTTIMEOUT,
    SIMPLEREST_PING_URL,
    SIMPLEREST_PING_VERB,
    SIMPLEREST_PING_BODY,
    SIMPLEREST_PING_BODY_RAW,
    SIMPLEREST_PING_HEADERS,
    SIMPLEREST_PING_REQUEST_HOOK,
    SIMPLEREST_PING_RETRIES,
    SIMPLEREST_PING_TIMEOUT,
    SIMPLEREST_PING_UPDATE_CONTEXT,
    SIMPLEREST_PING_PROCESS_RESPONSE,
    SIMPLEREST_START_URL,
    SIMPLEREST_START_VERB,
    SIMPLEREST_START_BODY,
    SIMPLEREST_START_BODY_RAW,
    SIMPLEREST_START_HEADERS,
    SIMPLEREST_START_REQUEST_HOOK,
    SIMPLEREST_START_RETRIES,
    SIMPLEREST_START_TIMEOUT,
    SIMPLEREST_START_UPDATE_CONTEXT,
    SIMPLEREST_START_PROCESS_RESPONSE,
    SIMPLEREST_STOP_URL,
    SIMPLEREST_STOP_VERB,
    SIMPLEREST_STOP_BODY,
    SIMPLEREST_STOP_BODY_RAW,
    SIMPLEREST_STOP_HEADERS,
    SIMPLEREST_STOP_REQUEST_HOOK,
    SIMPLEREST_STOP_RETRIES,
    SIMPLEREST_STOP_TIMEOUT,
    SIMPLEREST_INIT_CONTEXT,
    SIMPLEREST_INIT_TEXT,
    SIMPLEREST_PROXY_URL,
    SIMPLEREST_STRICT_SSL,
    SIMPLEREST_URL,
    SIMPLEREST_IGNORE_EMPTY,
    SIMPLEREST_TIMEOUT,
    SIMPLEREST_RETRIES,
    SIMPLEREST_METHOD,
    SIMPLEREST_VERB,
    SIMPLEREST_HEADERS_TEMPLATE,
    SIMPLEREST_BODY_TEMPLATE,
    SIMPLEREST_BODY_RAW,
    SIMPLEREST_START_HOOK,
    SIMPLEREST_STOP_HOOK,
    SIMPLEREST_REQUEST_HOOK,
    SIMPLEREST_RESPONSE_HOOK,
    SIMPLEREST_PARSER_HOOK,
    SIMPLEREST_POLL_URL,
    SIMPLEREST_POLL_VERB,
    SIMPLEREST_POLL_BODY,
    SIMPLEREST_POLL_BODY_RAW,
    SIMPLEREST_POLL_HEADERS,
    SIMPLEREST_POLL_REQUEST_HOOK,
    SIMPLEREST_POLL_INTERVAL,
    SIMPLEREST_POLL_TIMEOUT,
    SIMPLEREST_POLL_SELECTOR_JSONPATH,
    SIMPLEREST_POLL_UPDATE_CONTEXT,
    SIMPLEREST_BODY_JSONPATH,
    SIMPLEREST_RESPONSE_JSONPATH,
    SIMPLEREST_MEDIA_JSONPATH,
    SIMPLEREST_BUTTONS_JSONPATH,
    SIMPLEREST_CONTEXT_JSONPATH,
    SIMPLEREST_CONTEXT_MERGE_OR_REPLACE,
    SIMPLEREST_CONVERSATION_ID_TEMPLATE,
    SIMPLEREST_STEP_ID_TEMPLATE,
    SIMPLEREST_INBOUND_ENDPOINT,
    SIMPLEREST_INBOUND_PORT,
    SIMPLEREST_INBOUND_SELECTOR_JSONPATH,
    SIMPLEREST_INBOUND_SELECTOR_VALUE,
    SIMPLEREST_INBOUND_UPDATE_CONTEXT,
    SIMPLEREST_INBOUND_ORDER_UNSETTLED_EVENTS_JSONPATH,
    SIMPLEREST_INBOUND_DEBOUNCE_TIMEOUT,
    SCRIPTING_TXT_EOL,
    SCRIPTING_XLSX_MODE,
    SCRIPTING_XLSX_EOL_WRITE,
    SCRIPTING_XLSX_STARTROW,
    SCRIPTING_XLSX_STARTCOL,
    SCRIPTING_XLSX_HASNAMECOL,
    SCRIPTING_XLSX_HASHEADERS,
    SCRIPTING_XLSX_SHEETNAMES,
    SCRIPTING_XLSX_SHEETNAMES_PCONVOS,
    SCRIPTING_XLSX_SHEETNAMES_UTTERANCES,
    SCRIPTING_XLSX_SHEETNAMES_SCRIPTING_MEMORY,
    SCRIPTING_CSV_DELIMITER,
    SCRIPTING_CSV_SKIP_HEADER,
    SCRIPTING_CSV_QUOTE,
    SCRIPTING_CSV_ESCAPE,
    SCRIPTING_CSV_MULTIROW_COLUMN_CONVERSATION_ID,
    SCRIPTING_CSV_MULTIROW_COLUMN_SENDER,
    SCRIPTING_CSV_MULTIROW_COLUMN_TEXT,
    SCRIPTING_CSV_QA_COLUMN_QUESTION,
    SCRIPTING_CSV_QA_COLUMN_ANSWER,
    SCRIPTING_NORMALIZE_TEXT,
    SCRIPTING_ENABLE_MEMORY,
    SCRIPTING_ENABLE_MULTIPLE_ASSERT_ERRORS,
    SCRIPTING_FORCE_BOT_CONSUMED,
    SCRIPTING_MATCHING_MODE,
    SCRIPTING_UTTEXPANSION_MODE,
    SCRIPTING_UTTEXPANSION_RANDOM_COUNT,
    SCRIPTING_UTTEXPANSION_INCOMPREHENSION,
    SCRIPTING_UTTEXPANSION_USENAMEASINTENT,
    SCRIPTING_UTTEXPANSION_NAMING_MODE,
    SCRIPTING_UTTEXPANSION_NAMING_UTTERANCE_MAX,
    SCRIPTING_MEMORYEXPANSION_KEEP_ORIG,
    SCRIPTING_MEMORY_MATCHING_MODE,
    CUSTOMHOOK_ONSTART,
    CUSTOMHOOK_ONUSERSAYS,
    CUSTOMHOOK_ONBOTRESPONSE,
    CUSTOMHOOK_ONSTOP,
    ASSERTERS,
    LOGIC_HOOKS,
    USER_INPUTS,
    RATELIMIT_USERSAYS_MAXCONCURRENT,
    RATELIMIT_USERSAYS_MINTIME,
}

const DEFAULT_WAIT_FOR_BOT: Duration = Duration::from_secs(10);

/// Read-only capability map for one test session
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    values: HashMap<Capability, Value>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, ignoring unknown keys
    pub fn from_json(value: &Value) -> TestResult<Self> {
        let Value::Object(map) = value else {
            return Err(TestError::configuration(
                "Capabilities must be a JSON object",
            ));
        };
        Ok(Self::from_map(map))
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        let mut values = HashMap::new();
        for (key, value) in map {
            match Capability::from_key(key) {
                Some(cap) => {
                    values.insert(cap, value.clone());
                }
                None => tracing::debug!(key = %key, "Ignoring unknown capability"),
            }
        }
        Self { values }
    }

    /// Load a capabilities JSON file
    pub fn load(path: &Path) -> TestResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TestError::configuration(format!(
                "Failed to read capabilities from {}: {e}",
                path.display()
            ))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            TestError::configuration(format!(
                "Failed to parse capabilities from {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&value)
    }

    /// Apply overrides from variables named after capability keys.
    ///
    /// Values parse as JSON when possible (`5000`, `true`, `{"a":1}`),
    /// otherwise they are kept as plain strings.
    #[must_use]
    pub fn with_overrides<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, raw) in vars {
            if let Some(cap) = Capability::from_key(&key) {
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                tracing::debug!(capability = cap.as_str(), "Capability overridden from environment");
                self.values.insert(cap, value);
            }
        }
        self
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(std::env::vars())
    }

    #[must_use]
    pub fn with(mut self, cap: Capability, value: impl Into<Value>) -> Self {
        self.values.insert(cap, value.into());
        self
    }

    pub fn get(&self, cap: Capability) -> Option<&Value> {
        self.values.get(&cap).filter(|v| !v.is_null())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.get(cap).is_some()
    }

    /// String value; numbers and booleans are rendered, empty strings are absent
    pub fn get_str(&self, cap: Capability) -> Option<String> {
        match self.get(cap)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, cap: Capability) -> Option<bool> {
        match self.get(cap)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn flag(&self, cap: Capability) -> bool {
        self.get_bool(cap).unwrap_or(false)
    }

    pub fn get_u64(&self, cap: Capability) -> TestResult<Option<u64>> {
        match self.get(cap) {
            None => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid_number(cap, n)),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| invalid_number(cap, s)),
            Some(other) => Err(invalid_number(cap, other)),
        }
    }

    /// Millisecond value as a duration
    pub fn get_millis(&self, cap: Capability) -> TestResult<Option<Duration>> {
        Ok(self.get_u64(cap)?.map(Duration::from_millis))
    }

    /// JSON value; strings holding JSON documents are parsed
    pub fn get_json(&self, cap: Capability) -> TestResult<Option<Value>> {
        match self.get(cap) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => serde_json::from_str(s).map(Some).map_err(|e| {
                TestError::configuration(format!(
                    "Capability {} is not valid JSON: {e}",
                    cap.as_str()
                ))
            }),
            Some(other) => Ok(Some(other.clone())),
        }
    }

    pub fn matching_mode(&self) -> TestResult<MatchMode> {
        match self.get_str(Capability::SCRIPTING_MATCHING_MODE) {
            Some(mode) => mode.parse(),
            None => Ok(MatchMode::default()),
        }
    }

    pub fn matcher(&self) -> TestResult<Matcher> {
        Ok(Matcher::new(self.matching_mode()?))
    }

    pub fn wait_for_bot_timeout(&self) -> TestResult<Duration> {
        Ok(self
            .get_millis(Capability::WAITFORBOTTIMEOUT)?
            .unwrap_or(DEFAULT_WAIT_FOR_BOT))
    }

    /// Keys present in this map, sorted, for logging
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.values.keys().map(|c| c.as_str()).collect();
        keys.sort_unstable();
        keys
    }
}

fn invalid_number(cap: Capability, value: impl std::fmt::Display) -> TestError {
    TestError::configuration(format!(
        "Capability {} expects a non-negative number, got {value}",
        cap.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_unknown_keys_ignored() {
        let caps = Capabilities::from_json(&json!({
            "SIMPLEREST_URL": "http://bot",
            "NOT_A_CAPABILITY": 1
        }))
        .unwrap();
        assert_eq!(caps.keys(), vec!["SIMPLEREST_URL"]);
    }

    #[test]
    fn test_script_layout_switches_are_kept() {
        let caps = Capabilities::from_json(&json!({
            "SCRIPTING_XLSX_STARTROW": 2,
            "SCRIPTING_CSV_QA_COLUMN_ANSWER": "answer",
            "SCRIPTING_ENABLE_MEMORY": true,
            "CUSTOMHOOK_ONBOTRESPONSE": "audit"
        }))
        .unwrap();
        assert_eq!(caps.keys().len(), 4);
        assert_eq!(caps.get_u64(Capability::SCRIPTING_XLSX_STARTROW).unwrap(), Some(2));
        assert!(caps.flag(Capability::SCRIPTING_ENABLE_MEMORY));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(Capabilities::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_typed_getters() {
        let caps = Capabilities::new()
            .with(Capability::SIMPLEREST_TIMEOUT, "2500")
            .with(Capability::SIMPLEREST_RETRIES, 3)
            .with(Capability::SIMPLEREST_IGNORE_EMPTY, "true")
            .with(Capability::SIMPLEREST_STRICT_SSL, false)
            .with(Capability::SIMPLEREST_INIT_CONTEXT, r#"{"lang":"en"}"#);

        assert_eq!(
            caps.get_millis(Capability::SIMPLEREST_TIMEOUT).unwrap(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(caps.get_u64(Capability::SIMPLEREST_RETRIES).unwrap(), Some(3));
        assert!(caps.flag(Capability::SIMPLEREST_IGNORE_EMPTY));
        assert_eq!(caps.get_bool(Capability::SIMPLEREST_STRICT_SSL), Some(false));
        assert_eq!(
            caps.get_json(Capability::SIMPLEREST_INIT_CONTEXT).unwrap(),
            Some(json!({ "lang": "en" }))
        );
        assert_eq!(caps.get_u64(Capability::SIMPLEREST_POLL_INTERVAL).unwrap(), None);
    }

    #[test]
    fn test_invalid_number_is_configuration_error() {
        let caps = Capabilities::new().with(Capability::SIMPLEREST_TIMEOUT, "soon");
        let err = caps.get_millis(Capability::SIMPLEREST_TIMEOUT).unwrap_err();
        assert!(err.message.contains("SIMPLEREST_TIMEOUT"));
    }

    #[test]
    fn test_overrides_parse_json_or_keep_string() {
        let caps = Capabilities::new().with_overrides(vec![
            ("SIMPLEREST_RETRIES".to_string(), "4".to_string()),
            ("SIMPLEREST_URL".to_string(), "http://localhost:1234".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ]);
        assert_eq!(caps.get(Capability::SIMPLEREST_RETRIES), Some(&json!(4)));
        assert_eq!(
            caps.get_str(Capability::SIMPLEREST_URL).as_deref(),
            Some("http://localhost:1234")
        );
        assert_eq!(caps.keys().len(), 2);
    }

    #[test]
    fn test_matching_mode() {
        assert_eq!(Capabilities::new().matching_mode().unwrap(), MatchMode::Include);
        let caps = Capabilities::new().with(Capability::SCRIPTING_MATCHING_MODE, "wildcardIgnoreCase");
        assert_eq!(caps.matching_mode().unwrap(), MatchMode::WildcardIgnoreCase);
        let caps = Capabilities::new().with(Capability::SCRIPTING_MATCHING_MODE, "nope");
        assert!(caps.matcher().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"PROJECTNAME":"demo","WAITFORBOTTIMEOUT":1500}}"#).unwrap();
        let caps = Capabilities::load(file.path()).unwrap();
        assert_eq!(caps.get_str(Capability::PROJECTNAME).as_deref(), Some("demo"));
        assert_eq!(caps.wait_for_bot_timeout().unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_every_key_round_trips() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_key(cap.as_str()), Some(*cap));
        }
    }
}
