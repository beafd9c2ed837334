/// `scripting/engine.rs` — lifecycle script engine
///
/// `ScriptEngine` resolves scripts through the content store, compiles them
/// into the engine's single Lua state and runs them against a deep copy of
/// the caller's context. The copy is returned only when every script of the
/// run succeeded; the caller's context is never touched.
///
/// Host-initiated calls look scripts up before taking the Lua lock, so cache
/// population stays concurrent while evaluation is serialized. Nested calls
/// made by scripts (`require`, `run`) reuse the `&Lua` handed to the callback.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use mlua::{Lua, Table, Value as LuaValue};

use super::{
    api::register_all,
    cache::{Expiry, LoadingCache},
    compiled::{CompilableScript, LazyChunk, LIBRARY_NAME, LIBRARY_SOURCE},
    context::{Context, Value, CONTENT_MANAGER_KEY},
    detached::DetachedPool,
    error::{LoadError, ScriptEngineError},
    marshal,
    record::{ScriptIndex, ScriptRecord},
    sandbox,
    trigger::LifecycleEvent,
};
use crate::{
    config::EngineConfig,
    content::{ContentData, ContentManagerHandle, ContentResult, Status, Subject},
};

pub type Result<T> = std::result::Result<T, ScriptEngineError>;

// ── ScriptEngine ──────────────────────────────────────────────────────────────

/// Shared handle. Clones drive the same engine; the engine is torn down when
/// the last handle is dropped.
#[derive(Clone)]
pub struct ScriptEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    content_manager: ContentManagerHandle,
    /// Host API table every scope falls back to.
    host: Table,
    library: LazyChunk,
    scripts: LoadingCache<Arc<CompilableScript>>,
    index: LoadingCache<Arc<ScriptIndex>>,
    // Dropped after every handle into it.
    lua: Mutex<Lua>,
    detached: DetachedPool,
    self_ref: Weak<EngineInner>,
}

impl ScriptEngine {
    pub fn new(
        content_manager: impl Into<ContentManagerHandle>,
        config: EngineConfig,
    ) -> Result<Self> {
        let content_manager = content_manager.into();
        let lua = sandbox::create_vm(config.trust_level)
            .map_err(|e| ScriptEngineError::Init(format!("Failed to create Lua VM: {e}")))?;
        let host = sandbox::create_host_table(&lua)
            .map_err(|e| ScriptEngineError::Init(format!("Failed to create host table: {e}")))?;
        let detached = DetachedPool::new(&config.detached)
            .map_err(|e| ScriptEngineError::Init(format!("Failed to start detached pool: {e}")))?;

        let loader_cm = content_manager.clone();
        let scripts = LoadingCache::new(
            "script",
            config.script_cache.max_entries,
            Expiry::AfterAccess(config.script_cache.ttl()),
            move |external_id: &str| {
                let content = fetch(&loader_cm, external_id, ScriptRecord::DATA_TYPE)?;
                let record = ScriptRecord::from_content(external_id, &content)?;
                Ok(Arc::new(CompilableScript::new(record)))
            },
        );
        let loader_cm = content_manager.clone();
        let index = LoadingCache::new(
            "index",
            config.index_cache.max_entries,
            Expiry::RefreshAfterWrite(config.index_cache.ttl()),
            move |external_id: &str| {
                let content = fetch(&loader_cm, external_id, ScriptIndex::DATA_TYPE)?;
                Ok(Arc::new(ScriptIndex::from_content(external_id, &content)?))
            },
        );

        let inner = Arc::new_cyclic(|self_ref| EngineInner {
            config,
            content_manager,
            host,
            library: LazyChunk::new(),
            scripts,
            index,
            lua: Mutex::new(lua),
            detached,
            self_ref: self_ref.clone(),
        });
        {
            let lua = inner.lock_lua();
            register_all(&lua, &inner.host, Arc::downgrade(&inner))
                .map_err(|e| ScriptEngineError::Init(format!("API registration failed: {e}")))?;
        }
        log::info!(
            "[script] Engine ready (namespace '{}', index '{}')",
            inner.config.script_namespace,
            inner.config.index_external_id
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run the script `script_id` against a copy of `context` and return the
    /// mutated copy. The script's type filter is not consulted.
    pub fn run(&self, script_id: &str, context: &Context) -> Result<Context> {
        self.inner.run(script_id, context)
    }

    /// Run every indexed script attached to `event` whose type filter matches
    /// `content_type`, in index order, threading the context through them.
    pub fn trigger(
        &self,
        event: LifecycleEvent,
        content_type: &str,
        context: &Context,
    ) -> Result<Context> {
        self.inner.trigger(event, content_type, context)
    }

    /// Queue a run of `script_id` and return immediately. Errors are logged.
    pub fn run_detached(&self, script_id: &str, context: &Context) {
        self.inner.run_detached(script_id, context)
    }

    /// Evaluate `script_id` as a module and return its `exports`.
    pub fn require(&self, script_id: &str) -> Result<Value> {
        self.inner.require(script_id)
    }

    /// Drop every cached record and the cached index.
    pub fn invalidate_caches(&self) {
        self.inner.scripts.invalidate_all();
        self.inner.index.invalidate_all();
        log::info!("[script] Caches invalidated");
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

impl EngineInner {
    fn lock_lua(&self) -> MutexGuard<'_, Lua> {
        self.lua.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, script_id: &str) -> Result<Arc<CompilableScript>> {
        let external_id = self.config.script_external_id(script_id);
        self.scripts
            .get(&external_id)
            .map_err(|source| ScriptEngineError::NotFound {
                id: script_id.to_string(),
                source,
            })
    }

    fn run(&self, script_id: &str, context: &Context) -> Result<Context> {
        let script = self.lookup(script_id)?;
        let lua = self.lock_lua();
        self.execute(&lua, &script, context)
    }

    /// `run` for callers already holding the Lua state.
    pub(crate) fn run_in(&self, lua: &Lua, script_id: &str, context: &Context) -> Result<Context> {
        let script = self.lookup(script_id)?;
        self.execute(lua, &script, context)
    }

    fn trigger(&self, event: LifecycleEvent, content_type: &str, context: &Context) -> Result<Context> {
        let index_id = &self.config.index_external_id;
        let index = match self.index.get(index_id) {
            Ok(index) => index,
            Err(e) => {
                log::warn!("[script] Cannot load script index {}: {}", index_id, e);
                return Ok(context.clone());
            }
        };

        let mut threaded: Option<Context> = None;
        for external_id in &index.scripts {
            let script = match self.scripts.get(external_id) {
                Ok(script) => script,
                Err(e) => {
                    log::warn!("[script] Skipping {}: {}", external_id, e);
                    continue;
                }
            };
            if !script.matches(event, content_type) {
                continue;
            }
            log::debug!("[script] {} {} for '{}'", event, script.id(), content_type);
            let input = threaded.as_ref().unwrap_or(context);
            let lua = self.lock_lua();
            match self.execute(&lua, &script, input) {
                Ok(next) => threaded = Some(next),
                Err(e @ ScriptEngineError::Compile { .. }) => {
                    log::warn!("[script] Skipping {}: {}", external_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(threaded.unwrap_or_else(|| context.clone()))
    }

    fn execute(&self, lua: &Lua, script: &CompilableScript, context: &Context) -> Result<Context> {
        let id = script.id();
        let chunk = script.compiled(lua).map_err(ScriptEngineError::compile(id))?;
        let library = self
            .library
            .get_or_compile(lua, LIBRARY_NAME, LIBRARY_SOURCE)
            .map_err(ScriptEngineError::compile(LIBRARY_NAME))?;

        let mut working = context.deep_copy();
        working.insert(CONTENT_MANAGER_KEY, self.content_manager.clone());

        let scope = sandbox::new_scope(lua, &self.host).map_err(ScriptEngineError::evaluation(id))?;
        for (key, value) in &working {
            let value = marshal::to_lua(lua, value)
                .map_err(|e| ScriptEngineError::Marshal(format!("{key}: {e}")))?;
            scope
                .raw_set(key.as_str(), value)
                .map_err(ScriptEngineError::evaluation(id))?;
        }

        library
            .call::<()>(scope.clone())
            .map_err(ScriptEngineError::evaluation(id))?;
        chunk
            .call::<()>(scope.clone())
            .map_err(ScriptEngineError::evaluation(id))?;

        marshal::write_back(&scope, &mut working)
            .map_err(|e| ScriptEngineError::Marshal(format!("{id}: {e}")))?;
        log::debug!("[script] {} finished", id);
        Ok(working)
    }

    // ── Modules ───────────────────────────────────────────────────────────

    fn require(&self, script_id: &str) -> Result<Value> {
        let script = self.lookup(script_id).map_err(require_error(script_id))?;
        let lua = self.lock_lua();
        let exports = self
            .evaluate_module(&lua, &script)
            .map_err(require_error(script_id))?;
        marshal::from_lua(exports).map_err(|e| ScriptEngineError::Marshal(format!("{script_id}: {e}")))
    }

    /// `require` for callers already holding the Lua state.
    pub(crate) fn require_in(&self, lua: &Lua, script_id: &str) -> Result<LuaValue> {
        self.lookup(script_id)
            .and_then(|script| self.evaluate_module(lua, &script))
            .map_err(require_error(script_id))
    }

    /// Runs a module in a scope holding only `exports`, without the library.
    fn evaluate_module(&self, lua: &Lua, script: &CompilableScript) -> Result<LuaValue> {
        let id = script.id();
        let chunk = script.compiled(lua).map_err(ScriptEngineError::compile(id))?;
        let scope = sandbox::new_scope(lua, &self.host).map_err(ScriptEngineError::evaluation(id))?;
        let exports = lua.create_table().map_err(ScriptEngineError::evaluation(id))?;
        scope
            .raw_set("exports", exports)
            .map_err(ScriptEngineError::evaluation(id))?;
        chunk
            .call::<()>(scope.clone())
            .map_err(ScriptEngineError::evaluation(id))?;
        scope
            .raw_get::<LuaValue>("exports")
            .map_err(ScriptEngineError::evaluation(id))
    }

    // ── Detached ──────────────────────────────────────────────────────────

    pub(crate) fn run_detached(&self, script_id: &str, context: &Context) {
        let engine = self.self_ref.clone();
        let id = script_id.to_string();
        let context = context.deep_copy();
        let submitted = self.detached.submit(move || {
            let Some(engine) = engine.upgrade() else {
                log::warn!("[script] Engine dropped before detached run of {}", id);
                return;
            };
            if let Err(e) = engine.run(&id, &context) {
                log::error!("[script] Detached run of {} failed: {}", id, e);
            }
        });
        if let Err(e) = submitted {
            log::error!("[script] Detached run of {} rejected: {}", script_id, e);
        }
    }
}

fn require_error(script_id: &str) -> impl FnOnce(ScriptEngineError) -> ScriptEngineError + '_ {
    move |source| ScriptEngineError::Require {
        id: script_id.to_string(),
        source: Box::new(source),
    }
}

/// Resolve `external_id` and fetch its payload as `data_type`.
fn fetch(
    content_manager: &ContentManagerHandle,
    external_id: &str,
    data_type: &str,
) -> std::result::Result<ContentData, LoadError> {
    let caller = Subject::nobody();
    let version = content_manager
        .resolve(external_id, &caller)
        .ok_or_else(|| LoadError::NotFound(external_id.to_string()))?;
    match content_manager.get(&version, data_type, &caller) {
        ContentResult {
            status: Status::Ok,
            content: Some(content),
            ..
        } => Ok(content),
        result => {
            log::debug!("[script] Fetch of {} returned {}", version, result.status);
            Err(LoadError::NotFound(external_id.to_string()))
        }
    }
}
