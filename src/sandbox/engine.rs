// src/sandbox/engine.rs
// Isolated script execution on an embedded QuickJS runtime.
//
// The interpreter context exposes exactly: require() for stubs under the
// sandbox root plus the two mock module names, a top-level-frozen
// serversInfo mapping, a mutable toolOutputCache mapping, and console
// logging routed to the host's stderr. Nothing else - no filesystem,
// network, process, or environment access exists inside the context.

use crate::error::{MetaError, Result};
use async_trait::async_trait;
use rquickjs::convert::Coerced;
use rquickjs::function::{Async, Rest};
use rquickjs::{
    Array, AsyncContext, AsyncRuntime, CatchResultExt, Ctx, Exception, Function, Object,
    Value as JsValue, async_with,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Seam between sandbox scripts and live downstream clients. The production
/// implementation wraps a connected peer; tests substitute fixtures.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value>;
}

/// One server as visible from inside the sandbox.
#[derive(Clone)]
pub struct SandboxServer {
    pub name: String,
    pub invoker: Option<Arc<dyn ToolInvoker>>,
}

/// A tool response observed during a script run.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedCall {
    pub tool_name: String,
    pub raw_response: Value,
}

/// Captured calls per server, in the order the script observed them.
pub type CaptureMap = Vec<(String, Vec<CapturedCall>)>;

/// Result of one sandbox run: the exported value (or the script failure)
/// plus whatever tool outputs were captured before the script ended.
pub struct ScriptOutcome {
    pub value: Result<Value>,
    pub captures: CaptureMap,
}

const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Run one user script against a fresh interpreter context.
///
/// The exported value is awaited when it is a promise and returned as-is
/// otherwise; a script that exports nothing yields JSON null. The output
/// cache is read back even when the script fails.
pub async fn run_script(root: &Path, code: &str, servers: &[SandboxServer]) -> ScriptOutcome {
    let runtime = match AsyncRuntime::new() {
        Ok(rt) => rt,
        Err(e) => return engine_failure(format!("cannot create sandbox runtime: {e}")),
    };
    runtime.set_memory_limit(MEMORY_LIMIT_BYTES).await;

    let context = match AsyncContext::full(&runtime).await {
        Ok(ctx) => ctx,
        Err(e) => return engine_failure(format!("cannot create sandbox context: {e}")),
    };

    let root = root.to_path_buf();
    let servers = servers.to_vec();
    let servers_for_parse = servers.clone();
    let wrapped = wrap_commonjs(code);

    let (value_json, captures_json) = async_with!(context => |ctx| {
        if let Err(e) = install_environment(&ctx, &root, &servers) {
            let message = format!("cannot set up sandbox environment: {e}");
            return (Err(message), None);
        }

        let mut evaluated: std::result::Result<JsValue, String> = ctx
            .eval::<JsValue, _>(wrapped.as_str())
            .catch(&ctx)
            .map_err(|e| e.to_string());

        if let Ok(exported) = &evaluated {
            if let Some(promise) = exported.as_promise() {
                evaluated = promise
                    .clone()
                    .into_future::<JsValue>()
                    .await
                    .catch(&ctx)
                    .map_err(|e| e.to_string());
            }
        }

        let value_json = evaluated.and_then(|v| stringify(&ctx, v));
        let captures_json = read_cache_json(&ctx);
        (value_json, captures_json)
    })
    .await;

    let value = match value_json {
        Ok(json) => serde_json::from_str(&json)
            .map_err(|e| MetaError::Sandbox(format!("script result is not valid JSON: {e}"))),
        Err(message) => Err(MetaError::Sandbox(message)),
    };

    ScriptOutcome {
        value,
        captures: parse_captures(captures_json, &servers_for_parse),
    }
}

fn engine_failure(message: String) -> ScriptOutcome {
    ScriptOutcome {
        value: Err(MetaError::Sandbox(message)),
        captures: Vec::new(),
    }
}

/// Wrap source in a CommonJS-style closure. The script communicates its
/// result by assigning `module.exports`; an untouched binding exports null.
fn wrap_commonjs(source: &str) -> String {
    format!(
        "(function() {{ const module = {{ exports: null }};\n{source}\n;return module.exports; }})()"
    )
}

fn install_environment<'js>(
    ctx: &Ctx<'js>,
    root: &Path,
    servers: &[SandboxServer],
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    // console -> host stderr logging, the only ambient channel
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            info!(target: "sandbox", "{}", join_console_parts(parts));
        })?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), |parts: Rest<Coerced<String>>| {
            warn!(target: "sandbox", "{}", join_console_parts(parts));
        })?,
    )?;
    globals.set("console", console)?;

    // toolOutputCache: one empty, mutable bucket per server
    let cache = Object::new(ctx.clone())?;
    for server in servers {
        cache.set(server.name.as_str(), Array::new(ctx.clone())?)?;
    }
    globals.set("__toolOutputCache", cache)?;

    // serversInfo: name plus a callTool bridge for connected servers
    let info = Object::new(ctx.clone())?;
    for server in servers {
        let entry = Object::new(ctx.clone())?;
        entry.set("name", server.name.as_str())?;
        if let Some(invoker) = &server.invoker {
            let invoker = invoker.clone();
            let call = Function::new(
                ctx.clone(),
                Async(move |tool: String, args_json: String| {
                    let invoker = invoker.clone();
                    async move { invoke_tool(invoker, tool, args_json).await }
                }),
            )?;
            entry.set("callTool", call)?;
        }
        info.set(server.name.as_str(), entry)?;
    }
    let freeze: Function = ctx.eval("Object.freeze")?;
    let frozen: Object = freeze.call((info,))?;
    globals.set("__serversInfo", frozen)?;

    globals.set("__requireCache", Object::new(ctx.clone())?)?;

    let require_root = root.to_path_buf();
    let require = Function::new(
        ctx.clone(),
        move |fn_ctx: Ctx<'js>, path: String| -> rquickjs::Result<JsValue<'js>> {
            resolve_require(&fn_ctx, &require_root, &path)
        },
    )?;
    globals.set("require", require)?;

    Ok(())
}

fn join_console_parts(parts: Rest<Coerced<String>>) -> String {
    parts
        .0
        .into_iter()
        .map(|part| part.0)
        .collect::<Vec<_>>()
        .join(" ")
}

/// The whole module system: the two mock names resolve to the injected
/// objects, and `.cjs` paths resolve strictly under the sandbox root.
fn resolve_require<'js>(
    ctx: &Ctx<'js>,
    root: &Path,
    path: &str,
) -> rquickjs::Result<JsValue<'js>> {
    if path == "serversInfo" {
        return ctx.globals().get("__serversInfo");
    }
    if path == "toolOutputCache" {
        return ctx.globals().get("__toolOutputCache");
    }

    let rel = path.strip_prefix("./").unwrap_or(path);
    if Path::new(rel).is_absolute() || rel.split(['/', '\\']).any(|part| part == "..") {
        return Err(forbidden(ctx, path));
    }

    let full = root.join(rel);
    let canonical = match full.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            return Err(Exception::throw_message(
                ctx,
                &format!("Cannot find module '{path}'"),
            ));
        }
    };
    let canonical_root = match root.canonicalize() {
        Ok(p) => p,
        Err(_) => return Err(forbidden(ctx, path)),
    };
    if !canonical.starts_with(&canonical_root)
        || canonical.extension().and_then(|e| e.to_str()) != Some("cjs")
    {
        return Err(forbidden(ctx, path));
    }

    let key = canonical.to_string_lossy().into_owned();
    let cache: Object = ctx.globals().get("__requireCache")?;
    let cached: JsValue = cache.get(key.as_str())?;
    if !cached.is_undefined() {
        return Ok(cached);
    }

    let source = match std::fs::read_to_string(&canonical) {
        Ok(source) => source,
        Err(e) => {
            return Err(Exception::throw_message(
                ctx,
                &format!("Cannot read module '{path}': {e}"),
            ));
        }
    };
    let exports: JsValue = ctx.eval(wrap_commonjs(&source).as_str())?;
    cache.set(key.as_str(), exports.clone())?;
    Ok(exports)
}

fn forbidden(ctx: &Ctx<'_>, path: &str) -> rquickjs::Error {
    Exception::throw_message(
        ctx,
        &format!("Cannot require '{path}': only tool stubs under the sandbox root are available"),
    )
}

/// Bridge one tool call to the host. Always resolves to a JSON string; a
/// failed downstream call becomes an error-shaped response rather than a JS
/// exception, matching the MCP result envelope.
async fn invoke_tool(invoker: Arc<dyn ToolInvoker>, tool: String, args_json: String) -> String {
    let args: Value =
        serde_json::from_str(&args_json).unwrap_or_else(|_| Value::Object(Default::default()));
    match invoker.call_tool(&tool, args).await {
        Ok(response) => response.to_string(),
        Err(e) => serde_json::json!({
            "content": [{"type": "text", "text": format!("Error: {e}")}],
            "isError": true,
        })
        .to_string(),
    }
}

fn stringify<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> std::result::Result<String, String> {
    match ctx.json_stringify(value) {
        Ok(Some(text)) => text.to_string().map_err(|e| e.to_string()),
        Ok(None) => Ok("null".to_string()),
        Err(e) => Err(format!("script result is not serializable: {e}")),
    }
}

fn read_cache_json(ctx: &Ctx<'_>) -> Option<String> {
    let cache: JsValue = ctx.globals().get("__toolOutputCache").ok()?;
    match ctx.json_stringify(cache) {
        Ok(Some(text)) => text.to_string().ok(),
        _ => None,
    }
}

fn parse_captures(captures_json: Option<String>, servers: &[SandboxServer]) -> CaptureMap {
    let parsed: Value = captures_json
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or(Value::Null);

    servers
        .iter()
        .map(|server| {
            let calls = parsed
                .get(server.name.as_str())
                .and_then(|bucket| serde_json::from_value::<Vec<CapturedCall>>(bucket.clone()).ok())
                .unwrap_or_default();
            (server.name.clone(), calls)
        })
        .collect()
}
