/// `scripting/sandbox.rs` — the shared Lua state and per-run scopes
///
/// One Lua state is created per engine with a restricted set of standard
/// libraries. Every run gets a fresh environment table, so globals assigned
/// by one script never leak into another. Lookups that miss the environment
/// fall through to the host API table and then to the Lua globals.
use mlua::{Function, Lua, LuaOptions, Result as LuaResult, StdLib, Table};
use serde::{Deserialize, Serialize};

/// Controls which Lua standard libraries scripts can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Default: string, table, math, coroutine, utf8. No I/O or OS.
    #[default]
    Basic,
    /// Basic + io
    FileRead,
    /// Basic + io, os and package
    Elevated,
}

impl TrustLevel {
    fn std_libs(self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::FileRead => basic | StdLib::IO,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS | StdLib::PACKAGE,
        }
    }
}

/// Creates the engine's Lua state with the libraries `trust` allows.
pub fn create_vm(trust: TrustLevel) -> LuaResult<Lua> {
    Lua::new_with(trust.std_libs(), LuaOptions::default())
}

/// Creates the table host API functions are registered in.
pub fn create_host_table(lua: &Lua) -> LuaResult<Table> {
    chained_table(lua, lua.globals())
}

/// Creates an empty scope for one run or one `require`.
pub fn new_scope(lua: &Lua, host: &Table) -> LuaResult<Table> {
    chained_table(lua, host.clone())
}

fn chained_table(lua: &Lua, fallback: Table) -> LuaResult<Table> {
    let table = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.raw_set("__index", fallback)?;
    table.set_metatable(Some(meta));
    Ok(table)
}

/// Compiles `source` into a function that runs it against the scope passed
/// as its first argument.
pub fn compile_scoped(lua: &Lua, name: &str, source: &str) -> LuaResult<Function> {
    lua.load(format!("return function(_ENV, ...) {source}\nend"))
        .set_name(format!("={name}"))
        .eval::<Function>()
}
