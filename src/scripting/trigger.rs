/// `scripting/trigger.rs` — lifecycle events and content-type filters
///
/// The host pipeline calls `ScriptEngine::trigger` with a `LifecycleEvent` and
/// the type of the content passing through. A script runs when its record
/// names the same event and its type filter matches the content type.
use std::{fmt, str::FromStr};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pipeline stages scripts can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    /// Before content is written to the store.
    PreStore,
    /// After content has been written.
    PostStore,
    /// Before content is deleted.
    PreDelete,
    /// After content has been deleted.
    PostDelete,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 4] = [
        LifecycleEvent::PreStore,
        LifecycleEvent::PostStore,
        LifecycleEvent::PreDelete,
        LifecycleEvent::PostDelete,
    ];

    /// Returns the name stored in a script record's `event` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::PreStore => "PRE_STORE",
            LifecycleEvent::PostStore => "POST_STORE",
            LifecycleEvent::PreDelete => "PRE_DELETE",
            LifecycleEvent::PostDelete => "POST_DELETE",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown lifecycle event '{0}'")]
pub struct UnknownEvent(pub String);

impl FromStr for LifecycleEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

// ── Type filter ───────────────────────────────────────────────────────────────

/// A content-type pattern that must match the whole type label.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    pattern: String,
    regex: Option<Regex>,
}

impl TypeFilter {
    /// Compiles `pattern`. An invalid pattern is logged and matches nothing.
    pub fn new(pattern: &str) -> Self {
        let regex = match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => Some(regex),
            Err(e) => {
                log::warn!("[script] Invalid content type filter '{}': {}", pattern, e);
                None
            }
        };
        Self {
            pattern: pattern.to_string(),
            regex,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, content_type: &str) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(content_type))
    }
}
