/// `scripting/` — lifecycle scripting engine
///
/// Scripts are Lua sources published in the content store. `ScriptEngine`
/// resolves, caches and compiles them, and runs them against a copy of a
/// caller-supplied `Context`, either directly (`run`), for a lifecycle event
/// (`trigger`) or in the background (`run_detached`).
pub mod api;
pub mod cache;
pub mod compiled;
pub mod context;
pub mod detached;
pub mod engine;
pub mod error;
pub mod mail;
pub mod marshal;
pub mod proxy;
pub mod record;
pub mod sandbox;
pub mod trigger;
