//! Compiled JSONPath queries over bot payloads

use crate::error::{TestError, TestResult};
use serde_json::Value;
use serde_json_path::JsonPath;
use std::fmt;

/// A parsed JSONPath expression, kept with its source text for diagnostics
#[derive(Clone)]
pub struct JsonQuery {
    source: String,
    path: JsonPath,
}

impl JsonQuery {
    pub fn parse(source: &str) -> TestResult<Self> {
        let path = JsonPath::parse(source).map_err(|e| {
            TestError::configuration(format!("Invalid JSONPath \"{source}\": {e}"))
        })?;
        Ok(Self {
            source: source.to_string(),
            path,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All nodes selected by the query, in document order
    pub fn query<'a>(&self, document: &'a Value) -> Vec<&'a Value> {
        self.path.query(document).all()
    }

    pub fn first<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.path.query(document).first()
    }

    pub fn exists(&self, document: &Value) -> bool {
        !self.path.query(document).is_empty()
    }
}

impl fmt::Debug for JsonQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JsonQuery").field(&self.source).finish()
    }
}

/// Whether an argument reads as a JSONPath expression rather than a literal
pub fn looks_like_json_path(candidate: &str) -> bool {
    candidate == "$" || candidate.starts_with("$.") || candidate.starts_with("$[")
}

/// Selected values flattened one level: an array result contributes its items
pub fn query_flat<'a>(query: &JsonQuery, document: &'a Value) -> Vec<&'a Value> {
    query
        .query(document)
        .into_iter()
        .flat_map(|node| match node {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}
