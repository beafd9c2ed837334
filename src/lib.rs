pub mod config;
pub mod content;
pub mod scripting;

pub use config::EngineConfig;
pub use content::{
    ContentData, ContentManager, ContentManagerHandle, ContentResult, ContentVersionId,
    ContentWrite, Status, Subject,
};
pub use scripting::{
    context::{Context, Value},
    engine::ScriptEngine,
    error::{ImmutableError, ScriptEngineError},
    proxy::Proxy,
    record::{ScriptIndex, ScriptRecord},
    sandbox::TrustLevel,
    trigger::LifecycleEvent,
};
