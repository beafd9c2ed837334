/// `content/memory.rs` — map-backed content manager
///
/// Every `put_content` publishes a new version under the external id. Call counters
/// and the resolve log let tests observe what the engine fetched.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use super::{ContentData, ContentManager, ContentResult, ContentVersionId, Status, Subject};

#[derive(Default)]
pub struct InMemoryContentManager {
    entries: Mutex<HashMap<String, (ContentVersionId, ContentData)>>,
    next_version: AtomicU64,
    resolve_calls: AtomicUsize,
    get_calls: AtomicUsize,
    resolved: Mutex<Vec<String>>,
    get_delay: Option<Duration>,
}

impl InMemoryContentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow every `get` down, to widen race windows in concurrency tests.
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }

    /// Publish `content` under `external_id`, replacing any previous version.
    pub fn put_content(&self, external_id: impl Into<String>, content: ContentData) -> ContentVersionId {
        let external_id = external_id.into();
        let n = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let version = ContentVersionId::new("memory", external_id.clone(), n.to_string());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_id, (version.clone(), content));
        version
    }

    pub fn remove(&self, external_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(external_id)
            .is_some()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// External ids passed to `resolve`, in call order.
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ContentManager for InMemoryContentManager {
    fn resolve(&self, external_id: &str, _caller: &Subject) -> Option<ContentVersionId> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(external_id.to_string());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(external_id)
            .map(|(version, _)| version.clone())
    }

    fn get(&self, version: &ContentVersionId, data_type: &str, _caller: &Subject) -> ContentResult {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.get_delay {
            thread::sleep(delay);
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.values().find(|(v, _)| v == version) {
            Some((v, content)) if data_type.is_empty() || content.content_type == data_type => {
                ContentResult::ok(v.clone(), content.clone())
            }
            Some(_) => ContentResult::failed(Status::Failed),
            None => ContentResult::failed(Status::NotFound),
        }
    }
}
