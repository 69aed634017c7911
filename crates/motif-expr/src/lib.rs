//! Component F — variable resolution and condition evaluation over a
//! workflow run's `Context`.
//!
//! Deliberately small: no arithmetic, no function calls, no
//! parentheses. Anything more complex is composed of multiple
//! `variable_set` nodes upstream, not expressed here.

use std::collections::HashMap;

use serde_json::Value;

/// Everything a path or condition can see. `node_outputs` holds one
/// JSON object per node id, shaped `{"output": {"resources": [...],
/// "variables": {...}}}` so `$node.<id>.output.resources[0].url` and
/// `$node.<id>.output.variables.<name>` both resolve.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub variables: HashMap<String, Value>,
    pub node_outputs: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `resolve(path) → value`. Missing segments evaluate to `Value::Null`
/// ("undefined"), never an error.
pub fn resolve(path: &str, ctx: &Context) -> Value {
    if let Some(rest) = path.strip_prefix("$var.") {
        let mut segments = Segments::new(rest);
        let Some(ident) = segments.next_ident() else {
            return Value::Null;
        };
        let root = ctx.variables.get(ident).cloned().unwrap_or(Value::Null);
        return walk(root, segments);
    }

    if let Some(rest) = path.strip_prefix("$node.") {
        let mut segments = Segments::new(rest);
        let Some(node_id) = segments.next_ident() else {
            return Value::Null;
        };
        let Some(field) = segments.next_ident() else {
            return Value::Null;
        };
        let root = ctx
            .node_outputs
            .get(node_id)
            .and_then(|v| v.get(field))
            .cloned()
            .unwrap_or(Value::Null);
        return walk(root, segments);
    }

    if let Some(rest) = path.strip_prefix("$literal.") {
        return serde_json::from_str(rest).unwrap_or(Value::Null);
    }

    Value::String(path.to_string())
}

/// Walks the remaining `.ident` / `[digit+]` segments over a starting
/// `Value`, returning `Null` the moment a segment is missing.
fn walk(mut current: Value, mut segments: Segments<'_>) -> Value {
    while let Some(segment) = segments.next_segment() {
        current = match (&current, &segment) {
            (Value::Object(map), PathSegment::Field(name)) => {
                map.get(name).cloned().unwrap_or(Value::Null)
            }
            (Value::Array(items), PathSegment::Index(idx)) => {
                items.get(*idx).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        };
        if current.is_null() {
            return Value::Null;
        }
    }
    current
}

enum PathSegment<'a> {
    Field(&'a str),
    Index(usize),
}

struct Segments<'a> {
    rest: &'a str,
}

impl<'a> Segments<'a> {
    fn new(rest: &'a str) -> Self {
        Self { rest }
    }

    /// Consumes a leading bare identifier (used for the first hop of
    /// `$var.` / `$node.`, which is not preceded by `.` or `[`).
    fn next_ident(&mut self) -> Option<&'a str> {
        let end = self
            .rest
            .find(|c| c == '.' || c == '[')
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (ident, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(ident)
    }

    fn next_segment(&mut self) -> Option<PathSegment<'a>> {
        if let Some(stripped) = self.rest.strip_prefix('.') {
            let end = stripped
                .find(|c| c == '.' || c == '[')
                .unwrap_or(stripped.len());
            let (ident, rest) = stripped.split_at(end);
            self.rest = rest;
            if ident.is_empty() {
                return None;
            }
            return Some(PathSegment::Field(ident));
        }
        if let Some(stripped) = self.rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            let (digits, rest) = stripped.split_at(end);
            self.rest = &rest[1..];
            return digits.parse::<usize>().ok().map(PathSegment::Index);
        }
        None
    }
}

/// `evaluate(expr) → bool`.
pub fn evaluate(expr: &str, ctx: &Context) -> bool {
    let tokens = tokenize(expr);
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    parser.parse_or(ctx)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Or,
    And,
    RelOp(&'static str),
    Operand(String),
}

const REL_OPS: &[&str] = &["===", "!==", "==", "!=", "<=", ">=", "<", ">"];

fn tokenize(expr: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    let mut buf = String::new();

    macro_rules! flush {
        () => {
            if !buf.trim().is_empty() {
                tokens.push(Token::Operand(buf.trim().to_string()));
            }
            buf.clear();
        };
    }

    while i < chars.len() {
        if chars[i..].starts_with(&['|', '|']) {
            flush!();
            tokens.push(Token::Or);
            i += 2;
            continue;
        }
        if chars[i..].starts_with(&['&', '&']) {
            flush!();
            tokens.push(Token::And);
            i += 2;
            continue;
        }
        let mut matched_op = None;
        for op in REL_OPS {
            let op_chars: Vec<char> = op.chars().collect();
            if chars[i..].starts_with(op_chars.as_slice()) {
                matched_op = Some(*op);
                break;
            }
        }
        if let Some(op) = matched_op {
            flush!();
            tokens.push(Token::RelOp(op));
            i += op.len();
            continue;
        }
        buf.push(chars[i]);
        i += 1;
    }
    flush!();
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self, ctx: &Context) -> bool {
        let mut acc = self.parse_and(ctx);
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            let rhs = self.parse_and(ctx);
            acc = acc || rhs;
        }
        acc
    }

    fn parse_and(&mut self, ctx: &Context) -> bool {
        let mut acc = self.parse_rel(ctx);
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            let rhs = self.parse_rel(ctx);
            acc = acc && rhs;
        }
        acc
    }

    fn parse_rel(&mut self, ctx: &Context) -> bool {
        let Some(Token::Operand(lhs_raw)) = self.peek().cloned() else {
            return false;
        };
        self.pos += 1;
        let lhs = eval_operand(&lhs_raw, ctx);

        let op = match self.peek() {
            Some(Token::RelOp(op)) => *op,
            _ => return truthy(&lhs),
        };
        self.pos += 1;

        let Some(Token::Operand(rhs_raw)) = self.peek().cloned() else {
            return false;
        };
        self.pos += 1;
        let rhs = eval_operand(&rhs_raw, ctx);

        compare(op, &lhs, &rhs)
    }
}

fn eval_operand(raw: &str, ctx: &Context) -> Value {
    if raw.starts_with("$var.") || raw.starts_with("$node.") || raw.starts_with("$literal.") {
        return resolve(raw, ctx);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
            Value::String(unquoted.unwrap_or(raw).to_string())
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_trimmed_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(op: &str, lhs: &Value, rhs: &Value) -> bool {
    match op {
        "<" | "<=" | ">" | ">=" => {
            let (Some(l), Some(r)) = (value_as_f64(lhs), value_as_f64(rhs)) else {
                return false;
            };
            match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => unreachable!(),
            }
        }
        "==" | "===" | "!=" | "!==" => {
            let equal = match (value_as_f64(lhs), value_as_f64(rhs)) {
                (Some(l), Some(r)) => l == r,
                _ => value_as_trimmed_string(lhs) == value_as_trimmed_string(rhs),
            };
            if op.starts_with('!') {
                !equal
            } else {
                equal
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_vars(vars: &[(&str, Value)]) -> Context {
        let mut ctx = Context::new();
        for (k, v) in vars {
            ctx.variables.insert(k.to_string(), v.clone());
        }
        ctx
    }

    #[test]
    fn resolves_nested_var_path() {
        let ctx = ctx_with_vars(&[("payload", json!({"user": {"name": "ada"}}))]);
        assert_eq!(resolve("$var.payload.user.name", &ctx), json!("ada"));
    }

    #[test]
    fn resolves_missing_segment_to_null_not_error() {
        let ctx = ctx_with_vars(&[("payload", json!({"user": {}}))]);
        assert_eq!(resolve("$var.payload.user.missing.deep", &ctx), Value::Null);
    }

    #[test]
    fn resolves_array_index_segment() {
        let ctx = ctx_with_vars(&[("items", json!(["a", "b", "c"]))]);
        assert_eq!(resolve("$var.items[1]", &ctx), json!("b"));
    }

    #[test]
    fn resolves_node_output_variable() {
        let mut ctx = Context::new();
        ctx.node_outputs
            .insert("n1".to_string(), json!({"variables": {"score": 7}}));
        assert_eq!(resolve("$node.n1.variables.score", &ctx), json!(7));
    }

    #[test]
    fn resolves_node_output_resource_url() {
        let mut ctx = Context::new();
        ctx.node_outputs.insert(
            "motion".to_string(),
            json!({"output": {"resources": [{"url": "https://cdn/out.mp4"}], "variables": {}}}),
        );
        assert_eq!(
            resolve("$node.motion.output.resources[0].url", &ctx),
            json!("https://cdn/out.mp4")
        );
    }

    #[test]
    fn resolves_literal_json() {
        let ctx = Context::new();
        assert_eq!(resolve("$literal.42", &ctx), json!(42));
        assert_eq!(resolve("$literal.\"hi\"", &ctx), json!("hi"));
    }

    #[test]
    fn bare_path_without_sigil_is_the_literal_string() {
        let ctx = Context::new();
        assert_eq!(resolve("plain-text", &ctx), json!("plain-text"));
    }

    #[test]
    fn evaluates_relational_and_boolean_composition() {
        let ctx = ctx_with_vars(&[("score", json!(85)), ("flag", json!(true))]);
        assert!(evaluate("$var.score >= 80 && $var.flag == true", &ctx));
        assert!(!evaluate("$var.score < 80 || $var.flag != true", &ctx));
    }

    #[test]
    fn missing_variable_in_boolean_context_is_false() {
        let ctx = Context::new();
        assert!(!evaluate("$var.nope", &ctx));
    }

    #[test]
    fn string_equality_is_trimmed() {
        let ctx = ctx_with_vars(&[("label", json!(" done "))]);
        assert!(evaluate("$var.label == \"done\"", &ctx));
    }
}
