/// Condition evaluation for condition nodes
///
/// Two forms are supported:
/// - a structured `{variable, operator, value}` triple evaluated natively
/// - a free-form boolean expression evaluated in a sandboxed Lua state
///
/// Equality is loose:
/// 1. both sides coerce to finite numbers (numbers or numeric strings) -> numeric compare
/// 2. both sides are booleans or "true"/"false" strings -> boolean compare
/// 3. null equals only null or the empty string
/// 4. otherwise the rendered strings are compared exactly

use mlua::{HookTriggers, LuaSerdeExt, SerializeOptions, VmState};
use serde_json::{Map, Value};
use std::cell::Cell;

/// Structured comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    Regex,
    InArray,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "greater" => Operator::Greater,
            "less" => Operator::Less,
            "greater_equal" => Operator::GreaterEqual,
            "less_equal" => Operator::LessEqual,
            "regex" => Operator::Regex,
            "in_array" => Operator::InArray,
            "is_empty" => Operator::IsEmpty,
            "is_not_empty" => Operator::IsNotEmpty,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::Greater => "greater",
            Operator::Less => "less",
            Operator::GreaterEqual => "greater_equal",
            Operator::LessEqual => "less_equal",
            Operator::Regex => "regex",
            Operator::InArray => "in_array",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
        }
    }

    pub fn needs_value(&self) -> bool {
        !matches!(self, Operator::IsEmpty | Operator::IsNotEmpty)
    }
}

/// Coerce to a finite number: JSON numbers and trimmed numeric strings
pub fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Render a value the way placeholders and string operators see it
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose equality, see module docs for the exact rule
pub fn loose_equals(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (as_bool(left), as_bool(right)) {
        return a == b;
    }
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s.is_empty(),
        (Value::Null, _) | (_, Value::Null) => false,
        _ => render(left) == render(right),
    }
}

pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_equals(item, needle)),
        Value::Object(map) => map.contains_key(&render(needle)),
        Value::Null => false,
        other => render(other).contains(&render(needle)),
    }
}

fn in_array(value: &Value, list: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|item| loose_equals(value, item)),
        Value::String(s) => s
            .split(',')
            .any(|item| loose_equals(value, &Value::String(item.trim().to_string()))),
        other => loose_equals(value, other),
    }
}

fn numeric(left: &Value, right: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Evaluate a structured comparison. Errors only on a malformed regex.
pub fn compare(operator: Operator, actual: &Value, expected: &Value) -> Result<bool, String> {
    Ok(match operator {
        Operator::Equals => loose_equals(actual, expected),
        Operator::NotEquals => !loose_equals(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::Greater => numeric(actual, expected, |a, b| a > b),
        Operator::Less => numeric(actual, expected, |a, b| a < b),
        Operator::GreaterEqual => numeric(actual, expected, |a, b| a >= b),
        Operator::LessEqual => numeric(actual, expected, |a, b| a <= b),
        Operator::Regex => {
            let pattern = render(expected);
            let re = regex::Regex::new(&pattern)
                .map_err(|e| format!("invalid regex '{}': {}", pattern, e))?;
            re.is_match(&render(actual))
        }
        Operator::InArray => in_array(actual, expected),
        Operator::IsEmpty => is_empty(actual),
        Operator::IsNotEmpty => !is_empty(actual),
    })
}

/// Globals an expression may not name; they are also removed from the state
const BLOCKED_GLOBALS: [&str; 18] = [
    "os", "io", "debug", "package", "require", "load", "dofile", "loadfile",
    "loadstring", "rawget", "rawset", "rawequal", "getmetatable", "setmetatable",
    "_G", "_ENV", "coroutine", "collectgarbage",
];

/// Instructions between budget checks
const HOOK_INTERVAL: u32 = 1_000;
/// Instructions one expression may execute
const INSTRUCTION_BUDGET: u32 = 1_000_000;
/// Bytes one expression state may allocate
const MEMORY_LIMIT: usize = 8 * 1024 * 1024;

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names an expression reads as globals: identifiers outside string literals that
/// are not field accesses (`a.load`, `a:load`)
fn free_identifiers(expression: &str) -> Vec<&str> {
    let bytes = expression.as_bytes();
    let mut found = Vec::new();
    let mut after_access = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\'' || c == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != c {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            after_access = false;
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if !after_access {
                found.push(&expression[start..i]);
            }
            after_access = false;
        } else if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            after_access = false;
        } else if c == b'.' && bytes.get(i + 1) == Some(&b'.') {
            // concatenation
            i += 2;
            after_access = false;
        } else {
            if !c.is_ascii_whitespace() {
                after_access = c == b'.' || c == b':';
            }
            i += 1;
        }
    }
    found
}

/// Evaluate a boolean expression over the variable namespace
///
/// Every variable is bound as a global (when its name is a Lua identifier) and inside a
/// `vars` table. The result follows Lua truthiness: only nil and false are false.
/// Evaluation is bounded by an instruction budget and a memory limit; callers on the
/// async runtime run it on the blocking pool.
pub fn evaluate_expression(expression: &str, variables: &Map<String, Value>) -> Result<bool, String> {
    if let Some(name) = free_identifiers(expression)
        .into_iter()
        .find(|name| BLOCKED_GLOBALS.contains(name))
    {
        tracing::warn!("🚨 Blocked condition expression using '{}'", name);
        return Err(format!("expression uses forbidden identifier '{}'", name));
    }

    let lua = mlua::Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT)
        .map_err(|e| format!("failed to limit Lua memory: {}", e))?;
    let executed = Cell::new(0u32);
    lua.set_hook(HookTriggers::new().every_nth_instruction(HOOK_INTERVAL), move |_, _| {
        let total = executed.get().saturating_add(HOOK_INTERVAL);
        executed.set(total);
        if total > INSTRUCTION_BUDGET {
            Err(mlua::Error::runtime("instruction budget exhausted"))
        } else {
            Ok(VmState::Continue)
        }
    })
    .map_err(|e| format!("failed to install Lua hook: {}", e))?;

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| format!("failed to sandbox Lua: {}", e))?;
    }

    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    let vars = lua
        .create_table()
        .map_err(|e| format!("failed to create vars table: {}", e))?;
    for (name, value) in variables {
        let lua_value = lua
            .to_value_with(value, options)
            .map_err(|e| format!("failed to convert variable '{}': {}", name, e))?;
        vars.set(name.as_str(), lua_value.clone())
            .map_err(|e| format!("failed to bind variable '{}': {}", name, e))?;
        if is_identifier(name) && !BLOCKED_GLOBALS.contains(&name.as_str()) {
            globals
                .set(name.as_str(), lua_value)
                .map_err(|e| format!("failed to bind variable '{}': {}", name, e))?;
        }
    }
    globals
        .set("vars", vars)
        .map_err(|e| format!("failed to bind vars table: {}", e))?;

    let result = lua
        .load(format!("return ({})", expression))
        .eval::<mlua::Value>()
        .map_err(|e| format!("expression failed: {}", e))?;

    Ok(!matches!(result, mlua::Value::Nil | mlua::Value::Boolean(false)))
}
