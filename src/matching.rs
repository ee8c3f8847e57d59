//! Match engine: syntactic comparison of bot output against expectations

use crate::error::{AssertionCause, TestError, TestResult};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::str::FromStr;

/// Comparison mode, configured via `SCRIPTING_MATCHING_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    Regexp,
    RegexpIgnoreCase,
    Wildcard,
    WildcardIgnoreCase,
    #[default]
    Include,
    IncludeIgnoreCase,
    Equals,
    EqualsIgnoreCase,
}

impl MatchMode {
    pub const ALL: [MatchMode; 8] = [
        MatchMode::Regexp,
        MatchMode::RegexpIgnoreCase,
        MatchMode::Wildcard,
        MatchMode::WildcardIgnoreCase,
        MatchMode::Include,
        MatchMode::IncludeIgnoreCase,
        MatchMode::Equals,
        MatchMode::EqualsIgnoreCase,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchMode::Regexp => "regexp",
            MatchMode::RegexpIgnoreCase => "regexpIgnoreCase",
            MatchMode::Wildcard => "wildcard",
            MatchMode::WildcardIgnoreCase => "wildcardIgnoreCase",
            MatchMode::Include => "include",
            MatchMode::IncludeIgnoreCase => "includeIgnoreCase",
            MatchMode::Equals => "equals",
            MatchMode::EqualsIgnoreCase => "equalsIgnoreCase",
        }
    }

    fn ignore_case(self) -> bool {
        matches!(
            self,
            MatchMode::RegexpIgnoreCase
                | MatchMode::WildcardIgnoreCase
                | MatchMode::IncludeIgnoreCase
                | MatchMode::EqualsIgnoreCase
        )
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMode {
    type Err = TestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                TestError::configuration(format!(
                    "SCRIPTING_MATCHING_MODE \"{s}\" unknown, expected one of: {}",
                    MatchMode::ALL.map(MatchMode::as_str).join(", ")
                ))
            })
    }
}

/// Matching strategy injected into asserters and the runner
#[derive(Debug, Clone, Copy, Default)]
pub struct Matcher {
    mode: MatchMode,
}

impl Matcher {
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// True if `actual` satisfies the `expected` pattern under this mode
    pub fn matches(&self, actual: &str, expected: &str) -> TestResult<bool> {
        let ignore_case = self.mode.ignore_case();
        Ok(match self.mode {
            MatchMode::Include | MatchMode::IncludeIgnoreCase => {
                if ignore_case {
                    actual.to_lowercase().contains(&expected.to_lowercase())
                } else {
                    actual.contains(expected)
                }
            }
            MatchMode::Equals => actual == expected,
            MatchMode::EqualsIgnoreCase => actual.to_lowercase() == expected.to_lowercase(),
            MatchMode::Wildcard | MatchMode::WildcardIgnoreCase => {
                wildcard_regex(expected, ignore_case)?.is_match(actual)
            }
            MatchMode::Regexp | MatchMode::RegexpIgnoreCase => {
                build_regex(expected, ignore_case)?.is_match(actual)
            }
        })
    }

    /// Check a single expectation, honoring a negation flag.
    ///
    /// The failure always reports the original expected/actual pair; a
    /// negative check says "expected NOT to match".
    pub fn check(&self, actual: &str, expected: &str, not: bool, subject: &str) -> TestResult<()> {
        let matched = self.matches(actual, expected)?;
        if matched != not {
            return Ok(());
        }
        Err(mismatch(subject, actual, expected, not))
    }

    /// Like `check`, for a list of alternatives: a match on any one counts.
    pub fn check_any(
        &self,
        actual: &str,
        candidates: &[String],
        not: bool,
        subject: &str,
    ) -> TestResult<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let mut matched = false;
        for candidate in candidates {
            if self.matches(actual, candidate)? {
                matched = true;
                break;
            }
        }
        if matched != not {
            return Ok(());
        }
        let expected = if candidates.len() == 1 {
            candidates[0].clone()
        } else {
            candidates.join(" | ")
        };
        Err(mismatch(subject, actual, &expected, not))
    }
}

fn mismatch(subject: &str, actual: &str, expected: &str, not: bool) -> TestError {
    let verb = if not {
        "expected NOT to match"
    } else {
        "expected to match"
    };
    TestError::assertion(format!("{subject} \"{actual}\" {verb} \"{expected}\""))
        .with_cause(AssertionCause::new(expected, actual, not))
}

fn build_regex(pattern: &str, ignore_case: bool) -> TestResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| TestError::configuration(format!("Invalid regular expression \"{pattern}\": {e}")))
}

fn wildcard_regex(pattern: &str, ignore_case: bool) -> TestResult<Regex> {
    let mut compiled = String::with_capacity(pattern.len() + 8);
    compiled.push_str("(?s)^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                compiled.push_str(&regex::escape(&literal));
                literal.clear();
                compiled.push_str(if c == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    compiled.push_str(&regex::escape(&literal));
    compiled.push('$');
    build_regex(&compiled, ignore_case)
}
