//! Blacklist patterns and the matcher they compile into.
//!
//! Patterns are scoped either globally or to one application. The
//! daemon's cache rebuilds a [`PatternSet`] snapshot from the store;
//! matching scans global patterns before application-scoped ones and
//! returns on the first hit.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SinkError;

/// How a pattern is compared against a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// The message equals the pattern exactly.
    Exact,
    /// The message contains the pattern, case-insensitively.
    Substring,
    /// The message matches the pattern as a case-insensitive regex.
    Regex,
}

impl PatternType {
    /// Stable string form used in the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Substring => "substring",
            Self::Regex => "regex",
        }
    }
}

impl std::str::FromStr for PatternType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "substring" => Ok(Self::Substring),
            "regex" => Ok(Self::Regex),
            other => Err(SinkError::invalid(format!(
                "unknown pattern type: {other}"
            ))),
        }
    }
}

/// A stored blacklist pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistPattern {
    /// Store-assigned id.
    pub id: i64,
    /// The pattern text.
    pub pattern: String,
    /// How the pattern is compared.
    pub pattern_type: PatternType,
    /// Scope; `None` means global.
    pub application_id: Option<String>,
    /// Operator-supplied reason, reported back on blocked admissions.
    pub reason: Option<String>,
    /// Row creation time.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last mutation time.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// The outcome of a successful blacklist match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistMatch {
    /// The pattern text that matched.
    pub pattern: String,
    /// The reason attached to the pattern, if any.
    pub reason: Option<String>,
}

/// A pattern compiled for matching. Regex patterns are compiled once at
/// snapshot build time; an ill-formed regex never matches.
#[derive(Debug, Clone)]
struct CompiledPattern {
    pattern: String,
    pattern_type: PatternType,
    reason: Option<String>,
    regex: Option<regex::Regex>,
}

impl CompiledPattern {
    fn compile(source: &BlacklistPattern) -> Self {
        let regex = match source.pattern_type {
            PatternType::Regex => {
                match RegexBuilder::new(&source.pattern)
                    .case_insensitive(true)
                    .build()
                {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!(
                            pattern = %source.pattern,
                            error = %err,
                            "ignoring ill-formed blacklist regex"
                        );
                        None
                    },
                }
            },
            PatternType::Exact | PatternType::Substring => None,
        };

        Self {
            pattern: source.pattern.clone(),
            pattern_type: source.pattern_type,
            reason: source.reason.clone(),
            regex,
        }
    }

    fn matches(&self, message: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => message == self.pattern,
            PatternType::Substring => message
                .to_lowercase()
                .contains(&self.pattern.to_lowercase()),
            PatternType::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(message)),
        }
    }
}

/// An immutable matcher snapshot built from the stored patterns.
#[derive(Debug, Default)]
pub struct PatternSet {
    global: Vec<CompiledPattern>,
    scoped: std::collections::HashMap<String, Vec<CompiledPattern>>,
}

impl PatternSet {
    /// Compiles a snapshot from stored patterns, partitioned by scope.
    #[must_use]
    pub fn compile<'a>(patterns: impl IntoIterator<Item = &'a BlacklistPattern>) -> Self {
        let mut set = Self::default();
        for source in patterns {
            let compiled = CompiledPattern::compile(source);
            match &source.application_id {
                None => set.global.push(compiled),
                Some(app) => set.scoped.entry(app.clone()).or_default().push(compiled),
            }
        }
        set
    }

    /// Matches a message against global patterns first, then patterns
    /// scoped to `application_id`. Returns the first hit.
    #[must_use]
    pub fn matches(&self, message: &str, application_id: &str) -> Option<BlacklistMatch> {
        let hit = |p: &CompiledPattern| BlacklistMatch {
            pattern: p.pattern.clone(),
            reason: p.reason.clone(),
        };

        if let Some(p) = self.global.iter().find(|p| p.matches(message)) {
            return Some(hit(p));
        }
        self.scoped
            .get(application_id)
            .and_then(|patterns| patterns.iter().find(|p| p.matches(message)))
            .map(hit)
    }

    /// Total number of compiled patterns in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.global.len() + self.scoped.values().map(Vec::len).sum::<usize>()
    }

    /// Whether the snapshot contains no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn pattern(
        pattern: &str,
        pattern_type: PatternType,
        application_id: Option<&str>,
    ) -> BlacklistPattern {
        BlacklistPattern {
            id: 0,
            pattern: pattern.into(),
            pattern_type,
            application_id: application_id.map(Into::into),
            reason: Some("noise".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_exact_is_case_sensitive() {
        let patterns = [pattern("Timeout", PatternType::Exact, None)];
        let set = PatternSet::compile(&patterns);
        assert!(set.matches("Timeout", "app").is_some());
        assert!(set.matches("timeout", "app").is_none());
        assert!(set.matches("Timeout!", "app").is_none());
    }

    #[test]
    fn test_substring_is_case_insensitive() {
        let patterns = [pattern("spam", PatternType::Substring, None)];
        let set = PatternSet::compile(&patterns);
        assert!(set.matches("This is SPAM indeed", "app").is_some());
        assert!(set.matches("clean message", "app").is_none());
    }

    #[test]
    fn test_regex_is_case_insensitive() {
        let patterns = [pattern(r"conn.* refused", PatternType::Regex, None)];
        let set = PatternSet::compile(&patterns);
        assert!(set.matches("Connection refused", "app").is_some());
        assert!(set.matches("connection accepted", "app").is_none());
    }

    #[test]
    fn test_ill_formed_regex_never_matches() {
        let patterns = [pattern(r"([unclosed", PatternType::Regex, None)];
        let set = PatternSet::compile(&patterns);
        assert!(set.matches("([unclosed", "app").is_none());
    }

    #[test]
    fn test_scoped_pattern_only_blocks_its_application() {
        let patterns = [pattern("noisy", PatternType::Substring, Some("app-a"))];
        let set = PatternSet::compile(&patterns);
        assert!(set.matches("noisy message", "app-a").is_some());
        assert!(set.matches("noisy message", "app-b").is_none());
    }

    #[test]
    fn test_global_patterns_scanned_before_scoped() {
        let patterns = [
            pattern("hit", PatternType::Substring, Some("app")),
            pattern("hit", PatternType::Exact, None),
        ];
        let set = PatternSet::compile(&patterns);
        // Exact global pattern wins for the exact message even though a
        // scoped substring pattern also matches.
        let matched = set.matches("hit", "app").unwrap();
        assert_eq!(matched.pattern, "hit");
        assert!(set.matches("a hit b", "app").is_some());
    }
}
