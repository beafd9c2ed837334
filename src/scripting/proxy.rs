/// `scripting/proxy.rs` — host side of the script proxy layer
///
/// A `Proxy` wraps one host value plus a property map that scripts read and
/// write. The wrapped value is never changed through the property surface,
/// except for contexts: a context proxy's properties are the context's
/// entries, and only its built-in members are read-only. An immutable proxy
/// rejects every set and delete.
///
/// The Lua-facing half lives in `marshal.rs`; both halves look up built-in
/// members through `Builtin::lookup` so they agree on names.
use std::fmt;

use indexmap::IndexMap;

use super::{
    context::{Context, Value},
    error::ImmutableError,
};
use crate::content::{ContentData, ContentResult, ContentWrite};

/// Property holding the flattened aspects of written and fetched content.
pub const ASPECTS_PROPERTY: &str = "aspects";
/// Property holding the status of a fetch result.
pub const STATUS_PROPERTY: &str = "status";
/// Aspect name under which the main payload appears in `aspects`.
pub const CONTENT_DATA_ASPECT: &str = "contentData";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    ContentWrite,
    ContentResult,
    Context,
    Plain,
}

impl ProxyKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            ProxyKind::ContentWrite => "ContentWrite",
            ProxyKind::ContentResult => "ContentResult",
            ProxyKind::Context => "ScriptContext",
            ProxyKind::Plain => "Object",
        }
    }
}

/// Members every proxy, or every proxy of one kind, answers without
/// consulting its property map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    ToString,
    ValueOf,
    HasOwnProperty,
    GetContentWrite,
    ContextGet,
    ContextPut,
    ContextRemove,
    GetBaseObject,
}

impl Builtin {
    pub fn lookup(kind: ProxyKind, name: &str) -> Option<Builtin> {
        match (kind, name) {
            (_, "toString") => Some(Builtin::ToString),
            (_, "valueOf") => Some(Builtin::ValueOf),
            (_, "hasOwnProperty") => Some(Builtin::HasOwnProperty),
            (ProxyKind::ContentWrite, "getContentWrite") => Some(Builtin::GetContentWrite),
            (ProxyKind::Context, "get") => Some(Builtin::ContextGet),
            (ProxyKind::Context, "put") => Some(Builtin::ContextPut),
            (ProxyKind::Context, "remove") => Some(Builtin::ContextRemove),
            (ProxyKind::Context, "getBaseObject") => Some(Builtin::GetBaseObject),
            _ => None,
        }
    }
}

/// Result of reading a member through a proxy.
#[derive(Debug, PartialEq)]
pub enum Member<'a> {
    Builtin(Builtin),
    Property(&'a Value),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    base: Value,
    properties: IndexMap<String, Value>,
    immutable: bool,
    /// Whether `aspects` still reflects the wrapped content.
    aspects_linked: bool,
}

impl Proxy {
    /// Wraps `base`, choosing the proxy kind from the value's variant.
    pub fn new(base: Value, immutable: bool) -> Self {
        match base {
            Value::ContentWrite(write) => Self::content_write(write, immutable),
            Value::ContentResult(result) => Self::content_result(result, immutable),
            Value::Context(context) => Self {
                immutable,
                ..Self::context(context)
            },
            base => Self {
                base,
                properties: IndexMap::new(),
                immutable,
                aspects_linked: false,
            },
        }
    }

    pub fn content_write(write: ContentWrite, immutable: bool) -> Self {
        let mut properties = IndexMap::new();
        properties.insert(ASPECTS_PROPERTY.to_string(), aspect_map(&write.content));
        Self {
            base: Value::ContentWrite(write),
            properties,
            immutable,
            aspects_linked: true,
        }
    }

    pub fn content_result(result: ContentResult, immutable: bool) -> Self {
        let mut properties = IndexMap::new();
        let aspects_linked = result.content.is_some();
        if let Some(content) = &result.content {
            properties.insert(ASPECTS_PROPERTY.to_string(), aspect_map(content));
        }
        properties.insert(
            STATUS_PROPERTY.to_string(),
            Value::String(result.status.as_str().to_string()),
        );
        Self {
            base: Value::ContentResult(result),
            properties,
            immutable,
            aspects_linked,
        }
    }

    /// Assignments land in the wrapped context; `get`, `put` and the other
    /// built-ins cannot be assigned over.
    pub fn context(context: Context) -> Self {
        Self {
            base: Value::Context(context),
            properties: IndexMap::new(),
            immutable: false,
            aspects_linked: false,
        }
    }

    /// Reassembles a proxy that crossed back from a script. When the aspects
    /// are still linked the property is rebuilt from the wrapped content.
    pub(crate) fn from_parts(
        base: Value,
        mut properties: IndexMap<String, Value>,
        immutable: bool,
        aspects_linked: bool,
    ) -> Self {
        if aspects_linked {
            if let Some(content) = content_of(&base) {
                properties.insert(ASPECTS_PROPERTY.to_string(), aspect_map(content));
            }
        }
        Self {
            base,
            properties,
            immutable,
            aspects_linked,
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self.base {
            Value::ContentWrite(_) => ProxyKind::ContentWrite,
            Value::ContentResult(_) => ProxyKind::ContentResult,
            Value::Context(_) => ProxyKind::Context,
            _ => ProxyKind::Plain,
        }
    }

    pub fn base(&self) -> &Value {
        &self.base
    }

    /// Mutable access to the wrapped value, for the host.
    pub fn base_mut(&mut self) -> &mut Value {
        &mut self.base
    }

    pub fn into_base(self) -> Value {
        self.base
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub(crate) fn aspects_linked(&self) -> bool {
        self.aspects_linked
    }

    pub fn properties(&self) -> &IndexMap<String, Value> {
        &self.properties
    }

    pub fn get(&self, name: &str) -> Member<'_> {
        if let Some(builtin) = Builtin::lookup(self.kind(), name) {
            return Member::Builtin(builtin);
        }
        let found = match &self.base {
            Value::Context(context) => context.get(name),
            _ => self.properties.get(name),
        };
        found.map_or(Member::Missing, Member::Property)
    }

    pub fn has_own_property(&self, name: &str) -> bool {
        match &self.base {
            Value::Context(context) => context.contains_key(name),
            _ => self.properties.contains_key(name),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ImmutableError> {
        self.check_writable(name)?;
        let value = value.into();
        if let Value::Context(context) = &mut self.base {
            context.insert(name, value);
            return Ok(());
        }
        if name == ASPECTS_PROPERTY {
            self.aspects_linked = false;
        }
        self.properties.insert(name.to_string(), value);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<Option<Value>, ImmutableError> {
        self.check_writable(name)?;
        if let Value::Context(context) = &mut self.base {
            return Ok(context.remove(name));
        }
        if name == ASPECTS_PROPERTY {
            self.aspects_linked = false;
        }
        Ok(self.properties.shift_remove(name))
    }

    fn check_writable(&self, name: &str) -> Result<(), ImmutableError> {
        let kind = self.kind();
        if self.immutable || (kind == ProxyKind::Context && Builtin::lookup(kind, name).is_some()) {
            return Err(ImmutableError::new(name));
        }
        Ok(())
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[object {}]", self.kind().class_name())
    }
}

fn content_of(base: &Value) -> Option<&ContentData> {
    match base {
        Value::ContentWrite(write) => Some(&write.content),
        Value::ContentResult(result) => result.content.as_ref(),
        _ => None,
    }
}

/// Flattens the aspects of `content` into `{ name => { name, data } }`, with
/// the main payload under `contentData`.
pub(crate) fn aspect_map(content: &ContentData) -> Value {
    let mut aspects = IndexMap::with_capacity(content.aspects.len() + 1);
    for (name, data) in &content.aspects {
        aspects.insert(name.clone(), aspect_value(name, data));
    }
    aspects.insert(
        CONTENT_DATA_ASPECT.to_string(),
        aspect_value(CONTENT_DATA_ASPECT, &content.data),
    );
    Value::Map(aspects)
}

fn aspect_value(name: &str, data: &serde_json::Value) -> Value {
    let mut aspect = IndexMap::with_capacity(2);
    aspect.insert("name".to_string(), Value::String(name.to_string()));
    aspect.insert("data".to_string(), Value::from(data.clone()));
    Value::Map(aspect)
}
