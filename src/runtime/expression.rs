/// Sandboxed Lua evaluation for step conditions and transforms
///
/// Each evaluation gets a fresh interpreter with `os`, `io`, `debug`,
/// `package`, the chunk loaders, `pcall`/`xpcall` and `coroutine` removed,
/// and the scope exposed as the globals `params`, `steps`, `conditions` and
/// `previous`. Interpreters are
/// created and dropped inside these synchronous functions, never held across
/// an await.
///
/// A chunk runs under a memory limit and a wall-clock budget; an instruction
/// hook aborts it once the budget is spent so a runaway loop cannot pin the
/// worker thread.

use crate::runtime::error::StepError;
use mlua::{HookTriggers, LuaSerdeExt, SerializeOptions, VmState};
use serde_json::Value;
use std::time::{Duration, Instant};

const MEMORY_LIMIT: usize = 16 * 1024 * 1024;
const TIME_LIMIT: Duration = Duration::from_millis(500);
const HOOK_INTERVAL: u32 = 10_000;
const BLOCKED_GLOBALS: [&str; 11] = [
    "os", "io", "debug", "package", "require", "dofile", "loadfile", "load", "pcall", "xpcall", "coroutine",
];
const SCOPE_GLOBALS: [&str; 4] = ["params", "steps", "conditions", "previous"];

fn lua_error(context: &str, e: mlua::Error) -> StepError {
    StepError::Terminal(format!("{}: {}", context, e))
}

fn to_lua(lua: &mlua::Lua, value: &Value) -> mlua::Result<mlua::Value> {
    // JSON null becomes nil so `if previous.x then` behaves as expected
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

fn sandbox(document: &Value) -> Result<mlua::Lua, StepError> {
    let lua = mlua::Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT)
        .map_err(|e| lua_error("Failed to limit Lua memory", e))?;

    let deadline = Instant::now() + TIME_LIMIT;
    lua.set_hook(HookTriggers::new().every_nth_instruction(HOOK_INTERVAL), move |_, _| {
        if Instant::now() >= deadline {
            return Err(mlua::Error::runtime(format!(
                "script exceeded its {}ms time limit",
                TIME_LIMIT.as_millis()
            )));
        }
        Ok(VmState::Continue)
    })
    .map_err(|e| lua_error("Failed to install Lua time limit", e))?;

    {
        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals
                .set(name, mlua::Nil)
                .map_err(|e| lua_error("Failed to prepare Lua sandbox", e))?;
        }
        for name in SCOPE_GLOBALS {
            let value = to_lua(&lua, &document[name]).map_err(|e| lua_error("Failed to expose scope", e))?;
            globals
                .set(name, value)
                .map_err(|e| lua_error("Failed to expose scope", e))?;
        }
    }

    Ok(lua)
}

fn is_truthy(value: &mlua::Value) -> bool {
    match value {
        mlua::Value::Nil | mlua::Value::Boolean(false) => false,
        mlua::Value::LightUserData(ud) => !ud.0.is_null(),
        _ => true,
    }
}

/// Evaluate a condition with Lua truthiness
///
/// A bare expression (`params.amount > 100`) is evaluated as if prefixed
/// with `return`; a chunk that already returns is run as-is.
pub fn evaluate_condition(expression: &str, document: &Value) -> Result<bool, StepError> {
    let lua = sandbox(document)?;
    let source = if expression.trim_start().starts_with("return") {
        expression.to_string()
    } else {
        format!("return ({})", expression)
    };

    let value = lua
        .load(source.as_str())
        .set_name("condition")
        .eval::<mlua::Value>()
        .map_err(|e| lua_error("Condition evaluation failed", e))?;

    tracing::debug!("🔀 Condition '{}' evaluated to {:?}", expression, value);
    Ok(is_truthy(&value))
}

/// Run a transform script over the mapped input
///
/// The mapped value is available as the global `input`; the chunk's return
/// value becomes the step output. A script that returns nothing passes
/// `input` through unchanged.
pub fn run_transform(script: &str, input: &Value, document: &Value) -> Result<Value, StepError> {
    let lua = sandbox(document)?;
    let input_value = to_lua(&lua, input).map_err(|e| lua_error("Failed to expose transform input", e))?;
    lua.globals()
        .set("input", input_value)
        .map_err(|e| lua_error("Failed to expose transform input", e))?;

    let returned = lua
        .load(script)
        .set_name("transform")
        .eval::<mlua::Value>()
        .map_err(|e| lua_error("Transform script failed", e))?;

    if returned.is_nil() {
        return Ok(input.clone());
    }
    lua.from_value::<Value>(returned)
        .map_err(|e| lua_error("Transform returned a value that is not JSON", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "params": { "amount": 150, "currency": "EUR" },
            "steps": { "fetch": { "status": 200, "data": { "items": [1, 2, 3] } } },
            "conditions": {},
            "previous": { "status": 200, "note": null }
        })
    }

    #[test]
    fn test_conditions() {
        let doc = document();
        assert!(evaluate_condition("params.amount > 100", &doc).unwrap());
        assert!(!evaluate_condition("params.currency == 'USD'", &doc).unwrap());
        assert!(evaluate_condition("steps.fetch.status == 200 and #steps.fetch.data.items == 3", &doc).unwrap());
        assert!(!evaluate_condition("previous.note", &doc).unwrap());
        assert!(evaluate_condition("return previous.status ~= nil", &doc).unwrap());
    }

    #[test]
    fn test_sandbox_blocks_system_access() {
        let doc = document();
        assert!(matches!(evaluate_condition("os.time() > 0", &doc), Err(StepError::Terminal(_))));
        assert!(evaluate_condition("io ~= nil", &doc).map(|b| !b).unwrap());
        assert!(run_transform("return require('socket')", &json!({}), &doc).is_err());
    }

    #[test]
    fn test_transform() {
        let doc = document();
        let output = run_transform(
            "return { total = input.amount * 2, label = input.currency .. '!' }",
            &json!({ "amount": 21, "currency": "EUR" }),
            &doc,
        )
        .unwrap();
        assert_eq!(output["total"], 42);
        assert_eq!(output["label"], "EUR!");

        let passthrough = run_transform("local x = 1", &json!({ "keep": true }), &doc).unwrap();
        assert_eq!(passthrough, json!({ "keep": true }));

        assert!(run_transform("return (", &json!({}), &doc).is_err());
    }

    #[test]
    fn test_runaway_scripts_hit_time_limit() {
        let doc = document();
        let started = Instant::now();

        let err = evaluate_condition("(function() while true do end return true end)()", &doc).unwrap_err();
        assert!(matches!(&err, StepError::Terminal(msg) if msg.contains("time limit")), "{:?}", err);

        let err = run_transform("local n = 0 while true do n = n + 1 end", &json!({}), &doc).unwrap_err();
        assert!(matches!(&err, StepError::Terminal(msg) if msg.contains("time limit")), "{:?}", err);

        // A protected call cannot swallow the abort and keep looping
        let err = evaluate_condition("pcall(function() while true do end end)", &doc).unwrap_err();
        assert!(matches!(err, StepError::Terminal(_)));

        assert!(started.elapsed() < Duration::from_secs(5));

        // Ordinary loops finish well inside the budget
        let output = run_transform("local s = 0 for i = 1, 100000 do s = s + i end return { sum = s }", &json!({}), &doc)
            .unwrap();
        assert_eq!(output["sum"], 5000050000_i64);
    }
}
