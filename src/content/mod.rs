/// `content/` — the content-store collaborator consumed by the scripting engine
///
/// The engine never talks to a concrete content store. It resolves external ids
/// and fetches versioned payloads through the `ContentManager` trait, which the
/// host implements. `memory::InMemoryContentManager` is a map-backed
/// implementation for tests and embedded hosts.
pub mod memory;

use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// A resolved, versioned handle to one piece of content.
///
/// The text form is `delegation:key:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentVersionId {
    pub delegation_id: String,
    pub key: String,
    pub version: String,
}

impl ContentVersionId {
    pub fn new(
        delegation_id: impl Into<String>,
        key: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            delegation_id: delegation_id.into(),
            key: key.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ContentVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.delegation_id, self.key, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid content version id '{0}', expected delegation:key:version")]
pub struct InvalidVersionId(pub String);

impl FromStr for ContentVersionId {
    type Err = InvalidVersionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersionId(s.to_string());
        let (delegation_id, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (key, version) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if delegation_id.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(delegation_id, key, version))
    }
}

/// The identity a content-store call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Subject {
    principal: Option<String>,
}

impl Subject {
    /// The anonymous caller used by the engine for all of its own lookups.
    pub fn nobody() -> Self {
        Self { principal: None }
    }

    pub fn principal(id: impl Into<String>) -> Self {
        Self {
            principal: Some(id.into()),
        }
    }

    pub fn principal_id(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Outcome of a content fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    NotFound,
    Forbidden,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOT_FOUND",
            Status::Forbidden => "FORBIDDEN",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Status::Ok),
            "NOT_FOUND" => Ok(Status::NotFound),
            "FORBIDDEN" => Ok(Status::Forbidden),
            "FAILED" => Ok(Status::Failed),
            other => Err(format!("Unknown content status '{other}'")),
        }
    }
}

/// A content payload: the main data plus named aspects.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentData {
    pub content_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub aspects: IndexMap<String, serde_json::Value>,
}

impl ContentData {
    pub fn new(content_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            content_type: content_type.into(),
            data,
            aspects: IndexMap::new(),
        }
    }

    pub fn with_aspect(mut self, name: impl Into<String>, data: serde_json::Value) -> Self {
        self.aspects.insert(name.into(), data);
        self
    }

    pub fn aspect(&self, name: &str) -> Option<&serde_json::Value> {
        self.aspects.get(name)
    }
}

/// Content about to be written by the host pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentWrite {
    /// Version the write is based on, if it updates existing content.
    pub origin: Option<ContentVersionId>,
    pub content: ContentData,
}

impl ContentWrite {
    pub fn new(content: ContentData) -> Self {
        Self {
            origin: None,
            content,
        }
    }

    pub fn with_origin(mut self, origin: ContentVersionId) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Result of a content fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentResult {
    pub status: Status,
    pub version: Option<ContentVersionId>,
    pub content: Option<ContentData>,
}

impl ContentResult {
    pub fn ok(version: ContentVersionId, content: ContentData) -> Self {
        Self {
            status: Status::Ok,
            version: Some(version),
            content: Some(content),
        }
    }

    pub fn failed(status: Status) -> Self {
        Self {
            status,
            version: None,
            content: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

// ── Collaborator ──────────────────────────────────────────────────────────────

/// Content-store capability used by the engine.
///
/// Both calls are synchronous and may be made from any engine thread,
/// including while a script is running.
pub trait ContentManager: Send + Sync {
    /// Resolve an external id to the version currently published under it.
    fn resolve(&self, external_id: &str, caller: &Subject) -> Option<ContentVersionId>;

    /// Fetch a version. `data_type` names the expected payload type; an empty
    /// string accepts any type.
    fn get(&self, version: &ContentVersionId, data_type: &str, caller: &Subject) -> ContentResult;
}

/// Shared handle to the host's content manager.
///
/// Cloning shares the manager; it is never deep-copied along with a context.
#[derive(Clone)]
pub struct ContentManagerHandle(Arc<dyn ContentManager>);

impl ContentManagerHandle {
    pub fn new(manager: impl ContentManager + 'static) -> Self {
        Self(Arc::new(manager))
    }

    /// True when both handles point at the same manager.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl<T: ContentManager + 'static> From<Arc<T>> for ContentManagerHandle {
    fn from(manager: Arc<T>) -> Self {
        Self(manager)
    }
}

impl From<Arc<dyn ContentManager>> for ContentManagerHandle {
    fn from(manager: Arc<dyn ContentManager>) -> Self {
        Self(manager)
    }
}

impl Deref for ContentManagerHandle {
    type Target = dyn ContentManager;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ContentManagerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ContentManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentManagerHandle(..)")
    }
}
