//! Jinja-style rendering for guards, eval expressions, and task inputs.
//!
//! Rendering is read-only over the provided scope: templates can never
//! mutate state, only produce values.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, Value};
use serde_json::Map;

use crate::error::{EngineError, EngineResult};

/// Template renderer with the engine's filter set.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("int", filter_int);
        env.add_filter("split", filter_split);
        env.add_filter("join", filter_join);
        env.add_filter("length", filter_length);
        env.add_filter("get", filter_get);
        env.add_filter("keys", filter_keys);
        env.add_filter("values", filter_values);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env.add_test("none", test_none);
        env.add_test("sequence", test_sequence);
        env.add_test("mapping", test_mapping);

        Self { env }
    }

    /// Render a template string against the scope.
    pub fn render(&self, template: &str, scope: &Map<String, serde_json::Value>) -> EngineResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }
        let ctx = scope_to_value(scope);
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| EngineError::Template(format!("parse: {}", e)))?;
        tmpl.render(ctx)
            .map_err(|e| EngineError::Template(format!("render: {}", e)))
    }

    /// Render and coerce the result back into a JSON value.
    pub fn render_to_value(
        &self,
        template: &str,
        scope: &Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        // A template that is one bare expression keeps its native type.
        if let Some(expr) = single_expression(template) {
            let value = self.eval_expr(expr, scope)?;
            if let serde_json::Value::String(s) = &value {
                let trimmed = s.trim();
                if (trimmed.starts_with('{') && trimmed.ends_with('}'))
                    || (trimmed.starts_with('[') && trimmed.ends_with(']'))
                {
                    if let Ok(parsed) = serde_json::from_str(trimmed) {
                        return Ok(parsed);
                    }
                }
            }
            return Ok(value);
        }

        let rendered = self.render(template, scope)?;
        let trimmed = rendered.trim();
        if (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        {
            if let Ok(value) = serde_json::from_str(trimmed) {
                return Ok(value);
            }
        }
        if let Ok(b) = trimmed.parse::<bool>() {
            return Ok(serde_json::Value::Bool(b));
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(serde_json::Value::Number(i.into()));
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(serde_json::Value::Number(n));
            }
        }
        if trimmed == "null" || trimmed == "None" {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::Value::String(rendered))
    }

    /// Render a nested structure recursively; strings are templated, keys
    /// included.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        scope: &Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, scope),
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(self.render(k, scope)?, self.render_value(v, scope)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            serde_json::Value::Array(arr) => Ok(serde_json::Value::Array(
                arr.iter()
                    .map(|v| self.render_value(v, scope))
                    .collect::<EngineResult<Vec<_>>>()?,
            )),
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate an expression to a typed JSON value. Accepts both bare
    /// expressions and `{{ ... }}`-wrapped ones.
    pub fn eval_expr(
        &self,
        expr: &str,
        scope: &Map<String, serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let bare = single_expression(expr).unwrap_or(expr);
        let compiled = self
            .env
            .compile_expression(bare)
            .map_err(|e| EngineError::Template(format!("expression parse: {}", e)))?;
        let result = compiled
            .eval(scope_to_value(scope))
            .map_err(|e| EngineError::Template(format!("expression eval: {}", e)))?;
        Ok(minijinja_to_json(&result))
    }

    /// Evaluate a guard or eval condition to a boolean.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        scope: &Map<String, serde_json::Value>,
    ) -> EngineResult<bool> {
        let bare = single_expression(condition).unwrap_or(condition);
        let compiled = self
            .env
            .compile_expression(bare)
            .map_err(|e| EngineError::Template(format!("condition parse: {}", e)))?;
        let result = compiled
            .eval(scope_to_value(scope))
            .map_err(|e| EngineError::Template(format!("condition eval: {}", e)))?;
        Ok(result.is_true())
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// If the string is exactly one `{{ ... }}` expression, return its inside;
/// a bare string without any template syntax also counts as an expression
/// when used in expression position.
fn single_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if !trimmed.starts_with("{{") || !trimmed.ends_with("}}") {
        return None;
    }
    let inner = &trimmed[2..trimmed.len() - 2];
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn scope_to_value(scope: &Map<String, serde_json::Value>) -> Value {
    Value::from_iter(scope.iter().map(|(k, v)| (k.clone(), json_to_minijinja(v))))
}

/// Null maps to UNDEFINED so `is defined` and `default` behave like Jinja.
fn json_to_minijinja(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::UNDEFINED,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                Value::from(f)
            } else {
                Value::UNDEFINED
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(arr) => {
            Value::from(arr.iter().map(json_to_minijinja).collect::<Vec<_>>())
        }
        // Keyed iteration order must match the JSON map's order.
        serde_json::Value::Object(map) => {
            Value::from_iter(map.iter().map(|(k, v)| (k.clone(), json_to_minijinja(v))))
        }
    }
}

fn minijinja_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    if value.kind() == ValueKind::Bool {
        return serde_json::Value::Bool(value.is_true());
    }
    if let Some(i) = value.as_i64() {
        return serde_json::Value::Number(i.into());
    }
    if value.kind() == ValueKind::Number {
        if let Some(n) = value
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return serde_json::Value::Number(n);
        }
    }
    if let Some(s) = value.as_str() {
        return serde_json::Value::String(s.to_string());
    }
    if value.kind() == ValueKind::Seq {
        if let Ok(iter) = value.try_iter() {
            return serde_json::Value::Array(iter.map(|v| minijinja_to_json(&v)).collect());
        }
    }
    if value.kind() == ValueKind::Map {
        let mut map = serde_json::Map::new();
        if let Ok(iter) = value.try_iter() {
            for key in iter {
                if let Ok(item) = value.get_item(&key) {
                    map.insert(key.to_string(), minijinja_to_json(&item));
                }
            }
        }
        return serde_json::Value::Object(map);
    }
    serde_json::Value::String(value.to_string())
}

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64
        .decode(value.to_string().as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64decode: {}", e)))?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8: {}", e)))
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&minijinja_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(&value.to_string())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("fromjson: {}", e)))?;
    Ok(json_to_minijinja(&parsed))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    s.parse::<i64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("int: {}", e)))
}

fn filter_split(value: &Value, sep: Option<&Value>) -> Vec<String> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_else(|| " ".to_string());
    value
        .to_string()
        .split(&separator)
        .map(|s| s.to_string())
        .collect()
}

fn filter_join(value: &Value, sep: Option<&Value>) -> Result<String, Error> {
    let separator = sep.map(|v| v.to_string()).unwrap_or_default();
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "join requires a sequence"))?;
    Ok(iter.map(|v| v.to_string()).collect::<Vec<_>>().join(&separator))
}

fn filter_length(value: &Value) -> Result<usize, Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.len());
    }
    value.len().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            "length requires string, sequence, or mapping",
        )
    })
}

fn filter_get(value: &Value, key: &Value) -> Value {
    value.get_item(key).unwrap_or(Value::UNDEFINED)
}

fn filter_keys(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(ErrorKind::InvalidOperation, "keys requires a mapping"));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "keys requires a mapping"))?;
    Ok(iter.collect())
}

fn filter_values(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(ErrorKind::InvalidOperation, "values requires a mapping"));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "values requires a mapping"))?;
    Ok(iter
        .map(|key| value.get_item(&key).unwrap_or(Value::UNDEFINED))
        .collect())
}

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

fn test_none(value: &Value) -> bool {
    value.is_none()
}

fn test_sequence(value: &Value) -> bool {
    value.kind() == ValueKind::Seq
}

fn test_mapping(value: &Value) -> bool {
    value.kind() == ValueKind::Map
}
