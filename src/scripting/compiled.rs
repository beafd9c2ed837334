/// `scripting/compiled.rs` — script records paired with their compiled chunks
///
/// Chunks compile on first use, under the engine's Lua lock, and are kept for
/// the lifetime of the record instance. A record reloaded into the cache is a
/// new instance and compiles again.
use std::{
    fmt,
    sync::{Mutex, OnceLock, PoisonError},
};

use mlua::{Function, Lua, Result as LuaResult};

use super::{
    record::ScriptRecord,
    sandbox,
    trigger::{LifecycleEvent, TypeFilter},
};

/// Source of the library evaluated ahead of every `run` and `trigger` script.
pub const LIBRARY_SOURCE: &str = include_str!("script_util.lua");
pub const LIBRARY_NAME: &str = "script-util";

/// A chunk compiled at most once.
#[derive(Default)]
pub struct LazyChunk {
    chunk: Mutex<Option<Function>>,
}

impl LazyChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, lua: &Lua, name: &str, source: &str) -> LuaResult<Function> {
        let mut chunk = self.chunk.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(function) = chunk.as_ref() {
            return Ok(function.clone());
        }
        let function = sandbox::compile_scoped(lua, name, source)?;
        log::debug!("[script] Compiled {}", name);
        *chunk = Some(function.clone());
        Ok(function)
    }

    pub fn is_compiled(&self) -> bool {
        self.chunk
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

pub struct CompilableScript {
    record: ScriptRecord,
    chunk: LazyChunk,
    filter: OnceLock<Option<TypeFilter>>,
}

impl CompilableScript {
    pub fn new(record: ScriptRecord) -> Self {
        Self {
            record,
            chunk: LazyChunk::new(),
            filter: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &ScriptRecord {
        &self.record
    }

    pub fn compiled(&self, lua: &Lua) -> LuaResult<Function> {
        self.chunk.get_or_compile(lua, &self.record.id, &self.record.source)
    }

    pub fn is_compiled(&self) -> bool {
        self.chunk.is_compiled()
    }

    /// Whether `trigger(event, content_type)` should run this script. Records
    /// without an event or a type filter never match.
    pub fn matches(&self, event: LifecycleEvent, content_type: &str) -> bool {
        self.record.lifecycle_event() == Some(event)
            && self.filter().is_some_and(|filter| filter.matches(content_type))
    }

    fn filter(&self) -> Option<&TypeFilter> {
        self.filter
            .get_or_init(|| self.record.type_filter.as_deref().map(TypeFilter::new))
            .as_ref()
    }
}

impl fmt::Debug for CompilableScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilableScript")
            .field("id", &self.record.id)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::sandbox::TrustLevel;

    #[test]
    fn compiles_once_per_instance() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let script = CompilableScript::new(ScriptRecord::new("a", "x = 1"));
        assert!(!script.is_compiled());
        let first = script.compiled(&lua).unwrap();
        let second = script.compiled(&lua).unwrap();
        assert!(script.is_compiled());
        assert_eq!(
            mlua::Value::Function(first).to_pointer(),
            mlua::Value::Function(second).to_pointer()
        );
    }

    #[test]
    fn failed_compilation_is_retried() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let script = CompilableScript::new(ScriptRecord::new("bad", "x = = 1"));
        assert!(script.compiled(&lua).is_err());
        assert!(!script.is_compiled());
    }

    #[test]
    fn matching_needs_event_and_filter() {
        let record = ScriptRecord::new("a", "").with_event(LifecycleEvent::PreStore);
        let no_filter = CompilableScript::new(record.clone());
        assert!(!no_filter.matches(LifecycleEvent::PreStore, "news"));

        let script = CompilableScript::new(record.with_type_filter("news.*"));
        assert!(script.matches(LifecycleEvent::PreStore, "news.article"));
        assert!(!script.matches(LifecycleEvent::PostStore, "news.article"));
        assert!(!script.matches(LifecycleEvent::PreStore, "image"));
    }

    #[test]
    fn library_source_compiles() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        LazyChunk::new().get_or_compile(&lua, LIBRARY_NAME, LIBRARY_SOURCE).unwrap();
    }
}
