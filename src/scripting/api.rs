/// `scripting/api.rs` — registers the host globals visible to every script
///
/// Provides: log, null, require, run, runDetached, Context, emailHostSMTP
///
/// Functions are registered once per engine in the host table that every
/// scope falls back to. Engine-backed functions hold a weak engine handle and
/// use the Lua state handed to the callback, so nested runs never re-enter the
/// engine's Lua lock.
use std::sync::{Arc, Weak};

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue, Variadic};

use super::{
    context::{Context, Value},
    engine::EngineInner,
    mail::{MailHost, SmtpAuth},
    marshal::{self, from_lua, proxy_to_lua},
    proxy::Proxy,
};

/// Register all host globals in `host`.
pub(crate) fn register_all(lua: &Lua, host: &Table, engine: Weak<EngineInner>) -> LuaResult<()> {
    register_log(lua, host)?;
    register_context(lua, host)?;
    register_mail(lua, host)?;
    register_engine(lua, host, engine)?;
    Ok(())
}

// ── log ───────────────────────────────────────────────────────────────────────

fn register_log(lua: &Lua, host: &Table) -> LuaResult<()> {
    let log_tbl = lua.create_table()?;

    macro_rules! log_fn {
        ($level:expr) => {{
            lua.create_function(|_, args: Variadic<LuaValue>| {
                let msg = args.iter().map(display).collect::<Vec<_>>().join(" ");
                log::log!($level, "[script] {}", msg);
                Ok(())
            })?
        }};
    }

    log_tbl.raw_set("info", log_fn!(log::Level::Info))?;
    log_tbl.raw_set("warn", log_fn!(log::Level::Warn))?;
    log_tbl.raw_set("error", log_fn!(log::Level::Error))?;
    host.raw_set("log", log_tbl)?;
    Ok(())
}

fn display(arg: &LuaValue) -> String {
    match arg {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy(),
        other => other.type_name().to_string(),
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// `Context(k1, v1, k2, v2, ...)` builds a context proxy.
fn register_context(lua: &Lua, host: &Table) -> LuaResult<()> {
    let constructor = lua.create_function(|lua, args: Variadic<LuaValue>| {
        if args.len() % 2 != 0 {
            return Err(mlua::Error::RuntimeError(
                "Context expects key/value pairs".into(),
            ));
        }
        let mut context = Context::new();
        for pair in args.chunks(2) {
            let key = match &pair[0] {
                LuaValue::String(key) => key.to_string_lossy(),
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Context keys must be strings, got {}",
                        other.type_name()
                    )))
                }
            };
            context.insert(key, from_lua(pair[1].clone())?);
        }
        proxy_to_lua(lua, &Proxy::context(context))
    })?;
    host.raw_set("Context", constructor)?;
    host.raw_set("null", marshal::null())?;
    Ok(())
}

// ── mail ──────────────────────────────────────────────────────────────────────

/// `emailHostSMTP(host, { user = ..., password = ... })` returns a mailer
/// whose `send(to, subject, body, contentType)` delivers synchronously.
fn register_mail(lua: &Lua, host: &Table) -> LuaResult<()> {
    let factory = lua.create_function(|lua, (smtp_host, auth): (String, Option<Table>)| {
        let auth = match auth {
            Some(auth) => Some(SmtpAuth {
                user: auth.get("user")?,
                password: auth.get::<Option<String>>("password")?.unwrap_or_default(),
            }),
            None => None,
        };
        let mail_host = MailHost::new(smtp_host, auth);
        let mailer = lua.create_table()?;
        mailer.raw_set(
            "send",
            lua.create_function(
                move |_, (to, subject, body, content_type): (String, String, LuaValue, Option<String>)| {
                    mail_host
                        .send(&to, &subject, &display(&body), content_type.as_deref())
                        .map_err(mlua::Error::external)
                },
            )?,
        )?;
        Ok(mailer)
    })?;
    host.raw_set("emailHostSMTP", factory)?;
    Ok(())
}

// ── engine ────────────────────────────────────────────────────────────────────

fn register_engine(lua: &Lua, host: &Table, engine: Weak<EngineInner>) -> LuaResult<()> {
    let weak = engine.clone();
    host.raw_set(
        "require",
        lua.create_function(move |lua, script_id: String| {
            let engine = upgrade(&weak)?;
            engine
                .require_in(lua, &script_id)
                .map_err(mlua::Error::external)
        })?,
    )?;

    let weak = engine.clone();
    host.raw_set(
        "run",
        lua.create_function(move |lua, (script_id, context): (String, Option<LuaValue>)| {
            let engine = upgrade(&weak)?;
            let context = context_arg(context)?;
            let result = engine
                .run_in(lua, &script_id, &context)
                .map_err(mlua::Error::external)?;
            proxy_to_lua(lua, &Proxy::context(result))
        })?,
    )?;

    host.raw_set(
        "runDetached",
        lua.create_function(move |_, (script_id, context): (String, Option<LuaValue>)| {
            let engine = upgrade(&engine)?;
            engine.run_detached(&script_id, &context_arg(context)?);
            Ok(())
        })?,
    )?;
    Ok(())
}

fn upgrade(engine: &Weak<EngineInner>) -> LuaResult<Arc<EngineInner>> {
    engine
        .upgrade()
        .ok_or_else(|| mlua::Error::RuntimeError("script engine has shut down".into()))
}

/// Accepts a context proxy, a plain table or nothing.
fn context_arg(value: Option<LuaValue>) -> LuaResult<Context> {
    let Some(value) = value else {
        return Ok(Context::new());
    };
    match from_lua(value)? {
        Value::Nil => Ok(Context::new()),
        Value::Map(entries) => Ok(Context::from(entries)),
        Value::Context(context) => Ok(context),
        Value::Proxy(proxy) => match proxy.into_base() {
            Value::Context(context) => Ok(context),
            other => Err(mlua::Error::RuntimeError(format!(
                "expected a context, got {}",
                other.type_name()
            ))),
        },
        other => Err(mlua::Error::RuntimeError(format!(
            "expected a context, got {}",
            other.type_name()
        ))),
    }
}
