/// `scripting/marshal.rs` — moves values between the host and Lua
///
/// Plain data becomes Lua tables and back. Written content, fetch results and
/// contexts enter Lua as proxy userdata (`ProxyObject`); the content manager
/// enters as a userdata with `resolve` and `get` methods.
///
/// Inside a proxy the wrapped content is held as a Lua table laid out as
///
/// ```text
/// { contentType = "...", origin = "d:k:v", aspects = { [name] = { name = ..., data = ... } } }
/// ```
///
/// and the proxy's `aspects` property is that same `aspects` table, so aspect
/// edits made by a script show up in the content handed back to the host.
///
/// Tables built from host lists carry a shared marker metatable and nulls
/// inside tables become the `null` light userdata, so untouched values come
/// back exactly as they went in.
use indexmap::IndexMap;
use mlua::{
    AnyUserData, Function, Lua, MetaMethod, Result as LuaResult, Table, UserData, UserDataMethods,
    Value as LuaValue, Variadic,
};

use super::{
    context::{Context, ScriptFunction, Value},
    error::ImmutableError,
    proxy::{Builtin, Proxy, ProxyKind, ASPECTS_PROPERTY, CONTENT_DATA_ASPECT},
};
use crate::content::{
    ContentData, ContentManagerHandle, ContentResult, ContentVersionId, ContentWrite, Status, Subject,
};

/// Tables nested deeper than this are treated as cyclic.
const MAX_DEPTH: usize = 64;

const ARRAY_MARKER: &str = "__array";
const ARRAY_METATABLE_KEY: &str = "lifecycle.array_metatable";

/// Stand-in for a null held inside a table. Scripts see it as the global `null`.
pub fn null() -> LuaValue {
    LuaValue::NULL
}

fn array_metatable(lua: &Lua) -> LuaResult<Table> {
    if let Some(meta) = lua.named_registry_value::<Option<Table>>(ARRAY_METATABLE_KEY)? {
        return Ok(meta);
    }
    let meta = lua.create_table()?;
    meta.raw_set(ARRAY_MARKER, true)?;
    lua.set_named_registry_value(ARRAY_METATABLE_KEY, meta.clone())?;
    Ok(meta)
}

fn array_table(lua: &Lua, capacity: usize) -> LuaResult<Table> {
    let table = lua.create_table_with_capacity(capacity, 0)?;
    table.set_metatable(Some(array_metatable(lua)?));
    Ok(table)
}

fn is_array(table: &Table) -> bool {
    table
        .metatable()
        .and_then(|meta| meta.raw_get::<bool>(ARRAY_MARKER).ok())
        .unwrap_or(false)
}

// ── Host → Lua ────────────────────────────────────────────────────────────────

pub fn to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    Ok(match value {
        Value::Nil => LuaValue::Nil,
        Value::Bool(b) => LuaValue::Boolean(*b),
        Value::Integer(i) => LuaValue::Integer(*i),
        Value::Number(n) => LuaValue::Number(*n),
        Value::String(s) => LuaValue::String(lua.create_string(s)?),
        Value::List(items) => {
            let table = array_table(lua, items.len())?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, item_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Map(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), item_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::ContentWrite(write) => proxy_to_lua(lua, &Proxy::content_write(write.clone(), false))?,
        Value::ContentResult(result) => {
            proxy_to_lua(lua, &Proxy::content_result(result.clone(), false))?
        }
        Value::Context(context) => proxy_to_lua(lua, &Proxy::context(context.clone()))?,
        Value::Proxy(proxy) => proxy_to_lua(lua, proxy)?,
        Value::ContentManager(handle) => {
            LuaValue::UserData(lua.create_userdata(ContentManagerObject(handle.clone()))?)
        }
        Value::Function(function) => LuaValue::Function(function.0.clone()),
    })
}

/// `to_lua` for values held inside a table, where nil would drop the slot.
fn item_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    match value {
        Value::Nil => Ok(null()),
        value => to_lua(lua, value),
    }
}

pub fn proxy_to_lua(lua: &Lua, proxy: &Proxy) -> LuaResult<LuaValue> {
    let object = ProxyObject::from_proxy(lua, proxy)?;
    Ok(LuaValue::UserData(lua.create_userdata(object)?))
}

// ── Lua → Host ────────────────────────────────────────────────────────────────

pub fn from_lua(value: LuaValue) -> LuaResult<Value> {
    from_lua_at(value, 0)
}

fn from_lua_at(value: LuaValue, depth: usize) -> LuaResult<Value> {
    if depth > MAX_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "value nests too deeply to leave the script".into(),
        ));
    }
    Ok(match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Bool(b),
        LuaValue::Integer(i) => Value::Integer(i),
        LuaValue::Number(n) => Value::Number(n),
        LuaValue::String(s) => Value::String(s.to_string_lossy()),
        LuaValue::Table(table) => table_to_value(&table, depth)?,
        LuaValue::Function(function) => Value::Function(ScriptFunction(function)),
        LuaValue::UserData(ud) => userdata_to_value(&ud)?,
        // `null` sentinels
        LuaValue::LightUserData(_) => Value::Nil,
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "a {} value cannot leave the script",
                other.type_name()
            )))
        }
    })
}

fn table_to_value(table: &Table, depth: usize) -> LuaResult<Value> {
    let pairs = table
        .clone()
        .pairs::<LuaValue, LuaValue>()
        .collect::<LuaResult<Vec<_>>>()?;
    if let Some(len) = sequence_len(table, &pairs) {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(from_lua_at(table.raw_get::<LuaValue>(i)?, depth + 1)?);
        }
        return Ok(Value::List(items));
    }
    let mut map = IndexMap::with_capacity(pairs.len());
    for (key, item) in pairs {
        map.insert(key_string(&key)?, from_lua_at(item, depth + 1)?);
    }
    Ok(Value::Map(map))
}

fn userdata_to_value(ud: &AnyUserData) -> LuaResult<Value> {
    if let Ok(object) = ud.borrow::<ProxyObject>() {
        return object.to_proxy().map(Value::from);
    }
    if let Ok(manager) = ud.borrow::<ContentManagerObject>() {
        return Ok(Value::ContentManager(manager.0.clone()));
    }
    Err(mlua::Error::RuntimeError(
        "foreign userdata cannot leave the script".into(),
    ))
}

/// Length of `table` when it leaves the script as a list: its keys are
/// exactly `1..=n`, and either `n > 0` or the table came from a host list.
fn sequence_len(table: &Table, pairs: &[(LuaValue, LuaValue)]) -> Option<usize> {
    let len = table.raw_len();
    let dense = pairs.len() == len
        && pairs
            .iter()
            .all(|(k, _)| matches!(k, LuaValue::Integer(i) if *i >= 1 && *i as usize <= len));
    (dense && (len > 0 || is_array(table))).then_some(len)
}

fn key_string(key: &LuaValue) -> LuaResult<String> {
    match key {
        LuaValue::String(s) => Ok(s.to_string_lossy()),
        LuaValue::Integer(i) => Ok(i.to_string()),
        LuaValue::Number(n) => Ok(n.to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "a {} key cannot leave the script",
            other.type_name()
        ))),
    }
}

/// Copies the scope back into `context`: every existing key takes the value
/// bound in the scope, then non-function globals the script introduced are
/// added. New globals that cannot leave the script are left behind.
pub(crate) fn write_back(scope: &Table, context: &mut Context) -> LuaResult<()> {
    let keys: Vec<String> = context.keys().cloned().collect();
    for key in keys {
        let value = from_lua(scope.raw_get::<LuaValue>(key.as_str())?)?;
        context.insert(key, value);
    }
    for pair in scope.clone().pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        let LuaValue::String(key) = key else { continue };
        let key = key.to_string_lossy();
        if context.contains_key(&key) || matches!(value, LuaValue::Function(_)) {
            continue;
        }
        match from_lua(value) {
            Ok(value) => {
                context.insert(key, value);
            }
            Err(e) => log::debug!("[script] Leaving global '{}' behind: {}", key, e),
        }
    }
    Ok(())
}

// ── JSON payloads ─────────────────────────────────────────────────────────────

pub(crate) fn json_to_lua(lua: &Lua, val: &serde_json::Value) -> LuaResult<LuaValue> {
    match val {
        serde_json::Value::Null => Ok(null()),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(LuaValue::String(lua.create_string(s.as_str())?)),
        serde_json::Value::Array(arr) => {
            let t = array_table(lua, arr.len())?;
            for (i, v) in arr.iter().enumerate() {
                t.raw_set(i + 1, json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(t))
        }
        serde_json::Value::Object(obj) => {
            let t = lua.create_table_with_capacity(0, obj.len())?;
            for (k, v) in obj {
                t.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(t))
        }
    }
}

/// Empty tables become objects unless they came from a JSON array. Functions,
/// userdata and tables nested past the depth limit become `null`.
pub(crate) fn lua_to_json(val: LuaValue) -> LuaResult<serde_json::Value> {
    lua_to_json_at(val, 0)
}

fn lua_to_json_at(val: LuaValue, depth: usize) -> LuaResult<serde_json::Value> {
    Ok(match val {
        LuaValue::Nil => serde_json::Value::Null,
        LuaValue::Boolean(b) => serde_json::Value::Bool(b),
        LuaValue::Integer(i) => serde_json::json!(i),
        LuaValue::Number(n) => serde_json::json!(n),
        LuaValue::String(s) => serde_json::Value::String(s.to_string_lossy()),
        LuaValue::Table(t) if depth < MAX_DEPTH => {
            let pairs = t.clone().pairs::<LuaValue, LuaValue>().collect::<LuaResult<Vec<_>>>()?;
            if let Some(len) = sequence_len(&t, &pairs) {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    items.push(lua_to_json_at(t.raw_get::<LuaValue>(i)?, depth + 1)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    map.insert(key_string(&k)?, lua_to_json_at(v, depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
        }
        _ => serde_json::Value::Null,
    })
}

// ── Content tables ────────────────────────────────────────────────────────────

fn aspect_table(lua: &Lua, name: &str, data: &serde_json::Value) -> LuaResult<Table> {
    let aspect = lua.create_table_with_capacity(0, 2)?;
    aspect.raw_set("name", name)?;
    aspect.raw_set("data", json_to_lua(lua, data)?)?;
    Ok(aspect)
}

fn content_to_table(lua: &Lua, content: &ContentData) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.raw_set("contentType", content.content_type.as_str())?;
    let aspects = lua.create_table()?;
    for (name, data) in &content.aspects {
        aspects.raw_set(name.as_str(), aspect_table(lua, name, data)?)?;
    }
    aspects.raw_set(
        CONTENT_DATA_ASPECT,
        aspect_table(lua, CONTENT_DATA_ASPECT, &content.data)?,
    )?;
    table.raw_set(ASPECTS_PROPERTY, aspects)?;
    Ok(table)
}

fn table_to_content(table: &Table) -> LuaResult<ContentData> {
    let mut content = ContentData {
        content_type: table.raw_get::<Option<String>>("contentType")?.unwrap_or_default(),
        ..ContentData::default()
    };
    let Some(aspects) = table.raw_get::<Option<Table>>(ASPECTS_PROPERTY)? else {
        return Ok(content);
    };
    for pair in aspects.pairs::<String, LuaValue>() {
        let (name, aspect) = pair?;
        let data = match aspect {
            LuaValue::Table(aspect) => lua_to_json(aspect.raw_get::<LuaValue>("data")?)?,
            other => lua_to_json(other)?,
        };
        if name == CONTENT_DATA_ASPECT {
            content.data = data;
        } else {
            content.aspects.insert(name, data);
        }
    }
    Ok(content)
}

fn parse_version(text: Option<String>) -> Option<ContentVersionId> {
    text.and_then(|text| text.parse().ok())
}

fn write_to_table(lua: &Lua, write: &ContentWrite) -> LuaResult<Table> {
    let table = content_to_table(lua, &write.content)?;
    if let Some(origin) = &write.origin {
        table.raw_set("origin", origin.to_string())?;
    }
    Ok(table)
}

fn table_to_write(table: &Table) -> LuaResult<ContentWrite> {
    Ok(ContentWrite {
        origin: parse_version(table.raw_get("origin")?),
        content: table_to_content(table)?,
    })
}

fn result_to_table(lua: &Lua, result: &ContentResult) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.raw_set("status", result.status.as_str())?;
    if let Some(version) = &result.version {
        table.raw_set("version", version.to_string())?;
    }
    if let Some(content) = &result.content {
        table.raw_set("content", content_to_table(lua, content)?)?;
    }
    Ok(table)
}

fn table_to_result(table: &Table) -> LuaResult<ContentResult> {
    let status = table
        .raw_get::<Option<String>>("status")?
        .and_then(|s| s.parse().ok())
        .unwrap_or(Status::Failed);
    let content = match table.raw_get::<Option<Table>>("content")? {
        Some(content) => Some(table_to_content(&content)?),
        None => None,
    };
    Ok(ContentResult {
        status,
        version: parse_version(table.raw_get("version")?),
        content,
    })
}

// ── Proxy userdata ────────────────────────────────────────────────────────────

enum BaseView {
    ContentWrite(Table),
    ContentResult(Table),
    Context(Context),
    Plain(LuaValue),
}

/// Script-side proxy. Mirrors `Proxy`, with the wrapped content held as a
/// live Lua table.
pub(crate) struct ProxyObject {
    kind: ProxyKind,
    immutable: bool,
    base: BaseView,
    properties: Table,
    /// The `aspects` table shared with `base`, while the proxy still links it.
    linked_aspects: Option<Table>,
}

impl ProxyObject {
    fn from_proxy(lua: &Lua, proxy: &Proxy) -> LuaResult<Self> {
        let mut linked_aspects = None;
        let base = match proxy.base() {
            Value::ContentWrite(write) => {
                let table = write_to_table(lua, write)?;
                if proxy.aspects_linked() {
                    linked_aspects = Some(table.raw_get::<Table>(ASPECTS_PROPERTY)?);
                }
                BaseView::ContentWrite(table)
            }
            Value::ContentResult(result) => {
                let table = result_to_table(lua, result)?;
                if proxy.aspects_linked() {
                    if let Some(content) = table.raw_get::<Option<Table>>("content")? {
                        linked_aspects = Some(content.raw_get::<Table>(ASPECTS_PROPERTY)?);
                    }
                }
                BaseView::ContentResult(table)
            }
            Value::Context(context) => BaseView::Context(context.clone()),
            other => BaseView::Plain(to_lua(lua, other)?),
        };

        let properties = lua.create_table()?;
        for (name, value) in proxy.properties() {
            match &linked_aspects {
                Some(aspects) if name == ASPECTS_PROPERTY => {
                    properties.raw_set(name.as_str(), aspects.clone())?
                }
                _ => properties.raw_set(name.as_str(), to_lua(lua, value)?)?,
            }
        }

        Ok(Self {
            kind: proxy.kind(),
            immutable: proxy.is_immutable(),
            base,
            properties,
            linked_aspects,
        })
    }

    fn to_proxy(&self) -> LuaResult<Proxy> {
        let base = match &self.base {
            BaseView::ContentWrite(table) => Value::ContentWrite(table_to_write(table)?),
            BaseView::ContentResult(table) => Value::ContentResult(table_to_result(table)?),
            BaseView::Context(context) => Value::Context(context.clone()),
            BaseView::Plain(value) => from_lua(value.clone())?,
        };
        let linked = match (
            &self.linked_aspects,
            self.properties.raw_get::<LuaValue>(ASPECTS_PROPERTY)?,
        ) {
            (Some(linked), LuaValue::Table(current)) => same_table(linked, &current),
            _ => false,
        };
        let mut properties = IndexMap::new();
        for pair in self.properties.clone().pairs::<String, LuaValue>() {
            let (name, value) = pair?;
            if linked && name == ASPECTS_PROPERTY {
                continue;
            }
            properties.insert(name, from_lua(value)?);
        }
        Ok(Proxy::from_parts(base, properties, self.immutable, linked))
    }

    fn member(&self, lua: &Lua, name: &str) -> LuaResult<LuaValue> {
        match &self.base {
            BaseView::Context(context) => match context.get(name) {
                Some(value) => to_lua(lua, value),
                None => Ok(LuaValue::Nil),
            },
            _ => self.properties.raw_get(name),
        }
    }

    /// Context built-ins cannot be assigned over.
    fn guards(&self, name: &str) -> bool {
        self.kind == ProxyKind::Context && Builtin::lookup(self.kind, name).is_some()
    }

    fn class_name(&self) -> String {
        format!("[object {}]", self.kind.class_name())
    }

    fn context_mut(&mut self) -> LuaResult<&mut Context> {
        match &mut self.base {
            BaseView::Context(context) => Ok(context),
            _ => Err(mlua::Error::RuntimeError("not a context".into())),
        }
    }
}

fn same_table(a: &Table, b: &Table) -> bool {
    LuaValue::Table(a.clone()).to_pointer() == LuaValue::Table(b.clone()).to_pointer()
}

impl UserData for ProxyObject {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Index, |lua, (ud, name): (AnyUserData, String)| {
            let kind = ud.borrow::<ProxyObject>()?.kind;
            if let Some(builtin) = Builtin::lookup(kind, &name) {
                return builtin_function(lua, ud, builtin).map(LuaValue::Function);
            }
            let this = ud.borrow::<ProxyObject>()?;
            this.member(lua, &name)
        });
        methods.add_meta_method_mut(
            MetaMethod::NewIndex,
            |_, this, (name, value): (String, LuaValue)| {
                if this.immutable || this.guards(&name) {
                    return Err(mlua::Error::external(ImmutableError::new(name)));
                }
                match &mut this.base {
                    BaseView::Context(context) if value.is_nil() => {
                        context.remove(&name);
                        Ok(())
                    }
                    BaseView::Context(context) => {
                        context.insert(name, from_lua(value)?);
                        Ok(())
                    }
                    _ => this.properties.raw_set(name, value),
                }
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.class_name()));
    }
}

/// Arguments to a built-in, minus the proxy itself when called with `:`.
fn call_args(ud: &AnyUserData, args: &Variadic<LuaValue>) -> Vec<LuaValue> {
    let this = LuaValue::UserData(ud.clone()).to_pointer();
    let skip = match args.first() {
        Some(first @ LuaValue::UserData(_)) => usize::from(first.to_pointer() == this),
        _ => 0,
    };
    args.iter().skip(skip).cloned().collect()
}

fn key_arg(args: &[LuaValue]) -> LuaResult<String> {
    match args.first() {
        Some(key @ (LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Number(_))) => {
            key_string(key)
        }
        _ => Err(mlua::Error::RuntimeError("expected a string key".into())),
    }
}

fn builtin_function(lua: &Lua, ud: AnyUserData, builtin: Builtin) -> LuaResult<Function> {
    match builtin {
        Builtin::ToString => lua.create_function(move |_, _: Variadic<LuaValue>| {
            Ok(ud.borrow::<ProxyObject>()?.class_name())
        }),
        Builtin::ValueOf => {
            lua.create_function(move |_, _: Variadic<LuaValue>| Ok(ud.clone()))
        }
        Builtin::HasOwnProperty => lua.create_function(move |_, args: Variadic<LuaValue>| {
            let name = key_arg(&call_args(&ud, &args))?;
            let this = ud.borrow::<ProxyObject>()?;
            match &this.base {
                BaseView::Context(context) => Ok(context.contains_key(&name)),
                _ => Ok(!this.properties.raw_get::<LuaValue>(name)?.is_nil()),
            }
        }),
        Builtin::GetContentWrite => {
            let base = match &ud.borrow::<ProxyObject>()?.base {
                BaseView::ContentWrite(table) => table.clone(),
                _ => return Err(mlua::Error::RuntimeError("not written content".into())),
            };
            lua.create_function(move |_, _: Variadic<LuaValue>| Ok(base.clone()))
        }
        Builtin::ContextGet => lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let key = key_arg(&call_args(&ud, &args))?;
            ud.borrow::<ProxyObject>()?.member(lua, &key)
        }),
        Builtin::ContextPut => lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let args = call_args(&ud, &args);
            let key = key_arg(&args)?;
            let value = from_lua(args.get(1).cloned().unwrap_or(LuaValue::Nil))?;
            let previous = ud.borrow_mut::<ProxyObject>()?.context_mut()?.insert(key, value);
            previous.map_or(Ok(LuaValue::Nil), |v| to_lua(lua, &v))
        }),
        Builtin::ContextRemove => lua.create_function(move |lua, args: Variadic<LuaValue>| {
            let key = key_arg(&call_args(&ud, &args))?;
            let removed = ud.borrow_mut::<ProxyObject>()?.context_mut()?.remove(&key);
            removed.map_or(Ok(LuaValue::Nil), |v| to_lua(lua, &v))
        }),
        Builtin::GetBaseObject => lua.create_function(move |lua, _: Variadic<LuaValue>| {
            let this = ud.borrow::<ProxyObject>()?;
            let entries = lua.create_table()?;
            if let BaseView::Context(context) = &this.base {
                for (key, value) in context {
                    entries.raw_set(key.as_str(), to_lua(lua, value)?)?;
                }
            }
            Ok(entries)
        }),
    }
}

// ── Content manager userdata ──────────────────────────────────────────────────

pub(crate) struct ContentManagerObject(ContentManagerHandle);

impl UserData for ContentManagerObject {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("resolve", |_, this, external_id: String| {
            Ok(this
                .0
                .resolve(&external_id, &Subject::nobody())
                .map(|version| version.to_string()))
        });
        methods.add_method(
            "get",
            |lua, this, (version, data_type): (String, Option<String>)| {
                let version: ContentVersionId = version.parse().map_err(mlua::Error::external)?;
                let result = this.0.get(
                    &version,
                    data_type.as_deref().unwrap_or_default(),
                    &Subject::nobody(),
                );
                proxy_to_lua(lua, &Proxy::content_result(result, false))
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok("[object ContentManager]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::{
        error::ScriptEngineError,
        sandbox::{self, TrustLevel},
    };
    use serde_json::json;

    fn run(lua: &Lua, scope: &Table, source: &str) -> LuaResult<()> {
        sandbox::compile_scoped(lua, "test", source)?.call::<()>(scope.clone())
    }

    fn scope_with(lua: &Lua, context: &Context) -> Table {
        let host = sandbox::create_host_table(lua).unwrap();
        let scope = sandbox::new_scope(lua, &host).unwrap();
        for (key, value) in context {
            scope.raw_set(key.as_str(), to_lua(lua, value).unwrap()).unwrap();
        }
        scope
    }

    fn article() -> ContentWrite {
        ContentWrite::new(
            ContentData::new("atex.onecms.article", json!({ "headline": "New Article" }))
                .with_aspect("p.InsertionInfo", json!({ "securityParentId": "policy:22.222" })),
        )
    }

    fn returned_write(context: &Context, key: &str) -> ContentWrite {
        match context.get(key) {
            Some(Value::ContentWrite(write)) => write.clone(),
            other => panic!("expected written content, got {other:?}"),
        }
    }

    // ── Plain values ──────────────────────────────────────────────────────────

    #[test]
    fn plain_values_cross_in_both_directions() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut map = IndexMap::new();
        map.insert("n".to_string(), Value::Number(1.5));
        map.insert("list".to_string(), Value::List(vec![Value::from(1), Value::from("a")]));
        let value = Value::Map(map);
        assert_eq!(from_lua(to_lua(&lua, &value).unwrap()).unwrap(), value);
    }

    #[test]
    fn empty_lists_and_nulls_survive_a_round_trip() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let json = json!({ "tags": [], "note": null, "n": 1, "nested": [null, { "x": [] }] });
        assert_eq!(lua_to_json(json_to_lua(&lua, &json).unwrap()).unwrap(), json);

        let mut map = IndexMap::new();
        map.insert("empty".to_string(), Value::List(vec![]));
        map.insert("gap".to_string(), Value::List(vec![Value::from(1), Value::Nil, Value::from(3)]));
        map.insert("missing".to_string(), Value::Nil);
        let value = Value::Map(map);
        assert_eq!(from_lua(to_lua(&lua, &value).unwrap()).unwrap(), value);
    }

    #[test]
    fn tables_built_by_scripts_infer_their_shape() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let empty = lua.create_table().unwrap();
        assert_eq!(from_lua(LuaValue::Table(empty.clone())).unwrap(), Value::Map(IndexMap::new()));
        assert_eq!(lua_to_json(LuaValue::Table(empty)).unwrap(), json!({}));

        let list: Table = lua.load("return { 'a', 'b' }").eval().unwrap();
        assert_eq!(lua_to_json(LuaValue::Table(list)).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn host_lists_stay_lists_when_scripts_edit_them() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([
            ("tags", Value::List(vec![])),
            ("emptied", Value::List(vec![Value::from("x")])),
        ]);
        let scope = scope_with(&lua, &context);
        run(&lua, &scope, "tags[#tags + 1] = 'news'; emptied[1] = nil").unwrap();
        write_back(&scope, &mut context).unwrap();
        assert_eq!(context.get("tags"), Some(&Value::List(vec![Value::from("news")])));
        assert_eq!(context.get("emptied"), Some(&Value::List(vec![])));
    }

    #[test]
    fn cyclic_tables_are_rejected() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let table: Table = lua.load("local t = {} t.self = t return t").eval().unwrap();
        assert!(from_lua(LuaValue::Table(table)).is_err());
    }

    #[test]
    fn write_back_updates_keys_and_adds_new_globals() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("x", 1)]);
        let scope = scope_with(&lua, &context);
        run(&lua, &scope, "x = x + 1; added = 'yes'; function helper() end").unwrap();
        write_back(&scope, &mut context).unwrap();
        assert_eq!(context.get("x"), Some(&Value::Integer(2)));
        assert_eq!(context.get("added"), Some(&Value::from("yes")));
        assert!(!context.contains_key("helper"));
    }

    #[test]
    fn write_back_leaves_unmarshallable_globals_behind() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("x", 0)]);
        let scope = scope_with(&lua, &context);
        run(
            &lua,
            &scope,
            "worker = coroutine.create(function() end); cycle = {}; cycle.self = cycle; x = 1",
        )
        .unwrap();
        write_back(&scope, &mut context).unwrap();
        assert_eq!(context.get("x"), Some(&Value::Integer(1)));
        assert!(!context.contains_key("worker"));
        assert!(!context.contains_key("cycle"));
    }

    #[test]
    fn write_back_still_fails_for_existing_keys() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("x", 0)]);
        let scope = scope_with(&lua, &context);
        run(&lua, &scope, "x = coroutine.create(function() end)").unwrap();
        assert!(write_back(&scope, &mut context).is_err());
    }

    // ── Content proxies ───────────────────────────────────────────────────────

    #[test]
    fn aspect_edits_reach_the_wrapped_content() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("content", article())]);
        let scope = scope_with(&lua, &context);
        run(
            &lua,
            &scope,
            r#"
            content.aspects["p.InsertionInfo"].data.securityParentId = "policy:22.333"
            content.aspects.contentData.data.headline = "Edited"
            assert(content.getContentWrite().contentType == "atex.onecms.article")
            "#,
        )
        .unwrap();
        write_back(&scope, &mut context).unwrap();

        let write = returned_write(&context, "content");
        assert_eq!(write.content.data, json!({ "headline": "Edited" }));
        assert_eq!(
            write.content.aspect("p.InsertionInfo"),
            Some(&json!({ "securityParentId": "policy:22.333" }))
        );
    }

    #[test]
    fn replacing_aspects_does_not_touch_the_content() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("content", article())]);
        let scope = scope_with(&lua, &context);
        run(&lua, &scope, "content.aspects = { replaced = true }").unwrap();
        write_back(&scope, &mut context).unwrap();

        assert_eq!(returned_write(&context, "content"), article());
        match context.get_raw("content") {
            Some(Value::Proxy(proxy)) => assert!(!proxy.aspects_linked()),
            other => panic!("expected a proxy, got {other:?}"),
        }
    }

    #[test]
    fn immutable_proxy_raises_on_assignment() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let context = Context::from_pairs([("content", Proxy::content_write(article(), true))]);
        let scope = scope_with(&lua, &context);
        let source = run(&lua, &scope, "content.aspects = nil").unwrap_err();
        let err = ScriptEngineError::Evaluation { id: "test".into(), source };
        assert_eq!(err.immutability_violation(), Some(&ImmutableError::new("aspects")));
    }

    #[test]
    fn context_builtins_cannot_be_assigned_over() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let context = Context::from_pairs([("ctx", Context::new())]);
        let scope = scope_with(&lua, &context);
        let source = run(&lua, &scope, "ctx.get = 1").unwrap_err();
        let err = ScriptEngineError::Evaluation { id: "test".into(), source };
        assert_eq!(err.immutability_violation(), Some(&ImmutableError::new("get")));
    }

    #[test]
    fn builtins_work_with_dot_and_colon_calls() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let context = Context::from_pairs([("content", article())]);
        let scope = scope_with(&lua, &context);
        run(
            &lua,
            &scope,
            r#"
            assert(tostring(content) == "[object ContentWrite]")
            assert(content.toString() == "[object ContentWrite]")
            assert(content:hasOwnProperty("aspects"))
            assert(content.hasOwnProperty("aspects"))
            assert(not content.hasOwnProperty("missing"))
            assert(content.valueOf() == content)
            "#,
        )
        .unwrap();
    }

    // ── Context proxies ───────────────────────────────────────────────────────

    #[test]
    fn context_proxy_put_get_remove() {
        let lua = sandbox::create_vm(TrustLevel::Basic).unwrap();
        let mut context = Context::from_pairs([("ctx", Context::from_pairs([("first", 1)]))]);
        let scope = scope_with(&lua, &context);
        run(
            &lua,
            &scope,
            r#"
            assert(ctx.first == 1)
            assert(ctx.get("first") == 1)
            assert(ctx:put("second", 2) == nil)
            assert(ctx.put("second", 3) == 2)
            assert(ctx.remove("first") == 1)
            assert(ctx.getBaseObject().second == 3)
            ctx["third"] = 3
            assert(ctx.third == 3 and ctx.get("third") == 3)
            assert(ctx.hasOwnProperty("third"))
            ctx.fourth = 4
            ctx.fourth = nil
            assert(not ctx.hasOwnProperty("fourth"))
            local ok = pcall(function() ctx.put = 1 end)
            assert(not ok)
            "#,
        )
        .unwrap();
        write_back(&scope, &mut context).unwrap();
        assert_eq!(
            context.get("ctx").and_then(Value::as_context),
            Some(&Context::from_pairs([("second", 3), ("third", 3)]))
        );
    }
}
