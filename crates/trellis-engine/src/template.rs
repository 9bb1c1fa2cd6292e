//! Template resolution
//!
//! Substitutes `{{...}}` expressions against the execution context. The
//! resolver is a small interpreter over a fixed grammar: dotted references
//! (`steps.*`, `inputs.*`, `global_vars.*`, `workflow.*`), literals, and a
//! set of builtin functions. There is no host-language evaluation.

use crate::context::ExecutionContext;
use log::debug;
use serde_json::Value;
use trellis_core::value::{
    as_number, is_truthy, number_value, to_display_string, traverse, unwrap_result_envelope,
};

/// Resolves `{{...}}` placeholders against a context.
pub struct TemplateResolver;

impl TemplateResolver {
    /// Resolve a template string.
    ///
    /// A string that is exactly one placeholder returns the referenced value
    /// with its original type. Mixed text stringifies each substitution and
    /// concatenates. Unknown references re-emit the original `{{...}}` text.
    pub fn resolve(text: &str, ctx: &ExecutionContext) -> Value {
        let placeholders = find_placeholders(text);
        if placeholders.is_empty() {
            return Value::String(text.to_string());
        }

        // Single-placeholder form preserves the resolved value's type.
        if placeholders.len() == 1 {
            let (start, end, expr) = &placeholders[0];
            if text[..*start].trim().is_empty() && text[*end..].trim().is_empty() {
                return match Self::eval(expr, ctx) {
                    Some(value) => value,
                    None => Value::String(text.to_string()),
                };
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end, expr) in &placeholders {
            out.push_str(&text[cursor..*start]);
            match Self::eval(expr, ctx) {
                Some(value) => out.push_str(&to_display_string(&value)),
                None => {
                    debug!("unresolved template expression: {}", expr);
                    out.push_str(&text[*start..*end]);
                }
            }
            cursor = *end;
        }
        out.push_str(&text[cursor..]);
        Value::String(out)
    }

    /// Resolve and stringify, regardless of the value's type.
    pub fn resolve_to_string(text: &str, ctx: &ExecutionContext) -> String {
        to_display_string(&Self::resolve(text, ctx))
    }

    /// Deep-resolve every string inside a JSON value.
    pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
        match value {
            Value::String(s) => Self::resolve(s, ctx),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| Self::resolve_value(v, ctx)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::resolve_value(v, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a condition expression. The expression may be written bare
    /// or wrapped in `{{...}}`; an unresolvable reference is falsey.
    pub fn truthy(condition: &str, ctx: &ExecutionContext) -> bool {
        let expr = strip_braces(condition);
        match Self::eval(expr, ctx) {
            Some(value) => is_truthy(&value),
            None => {
                debug!("condition '{}' did not resolve; treating as false", condition);
                false
            }
        }
    }

    /// Evaluate an expression that may be written bare or wrapped in
    /// `{{...}}`, as step conditions and switch selectors are.
    pub fn eval_expression(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
        Self::eval(strip_braces(expr), ctx)
    }

    /// Evaluate one expression. `None` means the reference did not resolve.
    pub fn eval(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
        let expr = expr.trim();
        if expr.is_empty() {
            return None;
        }

        // Comparisons come first so each side is evaluated independently.
        if let Some((lhs, rhs)) = split_comparison(expr, "==") {
            let equal = Self::eval_operand(lhs, ctx)? == Self::eval_operand(rhs, ctx)?;
            return Some(Value::Bool(equal));
        }
        if let Some((lhs, rhs)) = split_comparison(expr, "!=") {
            let equal = Self::eval_operand(lhs, ctx)? == Self::eval_operand(rhs, ctx)?;
            return Some(Value::Bool(!equal));
        }

        Self::eval_operand(expr, ctx)
    }

    fn eval_operand(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
        // Comparison operands may themselves be written in braces, as in
        // `{{steps.a.result.n}} == 42`.
        let expr = strip_braces(expr);

        if let Some(literal) = parse_literal(expr) {
            return Some(literal);
        }

        if let Some((name, args)) = parse_call(expr) {
            return Self::eval_builtin(name, &args, ctx);
        }

        Self::eval_reference(expr, ctx)
    }

    fn eval_reference(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
        if let Some(rest) = expr.strip_prefix("steps.") {
            let (step_name, path) = split_head(rest);
            let stored = ctx.get_result(step_name)?;
            let unwrapped = unwrap_result_envelope(stored);
            return match path {
                None => Some(unwrapped.clone()),
                Some(path) => {
                    // Only the `.result` traversal form is part of the grammar.
                    let rest = path.strip_prefix("result")?;
                    let rest = if rest.is_empty() || rest.starts_with('[') {
                        rest
                    } else {
                        rest.strip_prefix('.')?
                    };
                    traverse(unwrapped, rest).cloned()
                }
            };
        }

        if let Some(rest) = expr.strip_prefix("inputs.") {
            let (name, path) = split_head(rest);
            let value = ctx.inputs.get(name)?;
            return match path {
                None => Some(value.clone()),
                Some(path) => traverse(value, path).cloned(),
            };
        }

        if let Some(rest) = expr.strip_prefix("global_vars.") {
            let (name, path) = split_head(rest);
            let value = ctx.global(name)?;
            return match path {
                None => Some(value.clone()),
                Some(path) => traverse(value, path).cloned(),
            };
        }

        if let Some(rest) = expr.strip_prefix("workflow.") {
            let (name, path) = split_head(rest);
            let value = ctx.workflow.get(name)?;
            return match path {
                None => Some(value.clone()),
                Some(path) => traverse(value, path).cloned(),
            };
        }

        None
    }

    fn eval_builtin(name: &str, args: &[&str], ctx: &ExecutionContext) -> Option<Value> {
        let eval_args = |args: &[&str]| -> Option<Vec<Value>> {
            args.iter().map(|arg| Self::eval(arg, ctx)).collect()
        };

        match name {
            "add" | "subtract" | "multiply" | "divide" | "max" | "min" => {
                let values = eval_args(args)?;
                let numbers: Vec<f64> = values.iter().map(|v| as_number(v)).collect::<Option<_>>()?;
                if numbers.is_empty() {
                    return None;
                }
                let result = match name {
                    "add" => numbers.iter().sum(),
                    "subtract" => numbers[1..].iter().fold(numbers[0], |acc, n| acc - n),
                    "multiply" => numbers.iter().product(),
                    "divide" => numbers[1..].iter().fold(numbers[0], |acc, n| {
                        if *n == 0.0 {
                            0.0
                        } else {
                            acc / n
                        }
                    }),
                    "max" => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    "min" => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                    _ => unreachable!(),
                };
                Some(number_value(result))
            }
            "round" => {
                let values = eval_args(args)?;
                let number = as_number(values.first()?)?;
                Some(number_value(number.round()))
            }
            "length" => {
                let values = eval_args(args)?;
                let length = match values.first()? {
                    Value::String(s) => s.chars().count(),
                    Value::Array(arr) => arr.len(),
                    Value::Object(map) => map.len(),
                    _ => return None,
                };
                Some(Value::from(length as u64))
            }
            "json" => {
                let values = eval_args(args)?;
                serde_json::to_string(values.first()?).ok().map(Value::String)
            }
            "keys" => {
                let values = eval_args(args)?;
                match values.first()? {
                    Value::Object(map) => {
                        let mut keys: Vec<&String> = map.keys().collect();
                        keys.sort();
                        Some(Value::Array(
                            keys.into_iter().map(|k| Value::String(k.clone())).collect(),
                        ))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Locate `{{ ... }}` spans. Returns (start, end, inner expression).
fn find_placeholders(text: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find("{{") {
        let start = cursor + open;
        match text[start + 2..].find("}}") {
            Some(close) => {
                let end = start + 2 + close + 2;
                spans.push((start, end, text[start + 2..end - 2].trim()));
                cursor = end;
            }
            None => break,
        }
    }
    spans
}

/// Strip the braces from a string that is exactly one `{{...}}` wrap.
/// Anything else, including text with several placeholders, passes through.
fn strip_braces(expr: &str) -> &str {
    let trimmed = expr.trim();
    if let [(start, end, inner)] = find_placeholders(trimmed).as_slice() {
        if trimmed[..*start].is_empty() && trimmed[*end..].is_empty() {
            return inner;
        }
    }
    trimmed
}

/// Split `name.rest.of.path` into the head identifier and the remaining
/// path. Brackets directly after the head stay with the path.
fn split_head(input: &str) -> (&str, Option<&str>) {
    let boundary = input.find(|c| c == '.' || c == '[');
    match boundary {
        Some(pos) => {
            let head = &input[..pos];
            let rest = input[pos..].strip_prefix('.').unwrap_or(&input[pos..]);
            (head, Some(rest))
        }
        None => (input, None),
    }
}

fn parse_literal(expr: &str) -> Option<Value> {
    match expr {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" | "nil" => return Some(Value::Null),
        _ => {}
    }

    if (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
        || (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
    {
        return Some(Value::String(expr[1..expr.len() - 1].to_string()));
    }

    if let Ok(int) = expr.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(float) = expr.parse::<f64>() {
        return Some(number_value(float));
    }

    None
}

/// Parse `name(arg, arg, ...)`. Arguments are split on top-level commas.
fn parse_call(expr: &str) -> Option<(&str, Vec<&str>)> {
    let open = expr.find('(')?;
    if !expr.ends_with(')') {
        return None;
    }
    let name = expr[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let body = &expr[open + 1..expr.len() - 1];
    if body.trim().is_empty() {
        return Some((name, Vec::new()));
    }

    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '"' | '\'' => match in_quote {
                Some(q) if q == c => in_quote = None,
                None => in_quote = Some(c),
                _ => {}
            },
            '(' | '[' if in_quote.is_none() => depth += 1,
            ')' | ']' if in_quote.is_none() => depth = depth.saturating_sub(1),
            ',' if depth == 0 && in_quote.is_none() => {
                args.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(body[start..].trim());
    Some((name, args))
}

/// Split a top-level comparison, ignoring operators inside quotes.
fn split_comparison<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut in_quote: Option<char> = None;
    let bytes = expr.as_bytes();
    for (i, c) in expr.char_indices() {
        match c {
            '"' | '\'' => match in_quote {
                Some(q) if q == c => in_quote = None,
                None => in_quote = Some(c),
                _ => {}
            },
            _ if in_quote.is_none()
                && expr[i..].starts_with(op)
                && i > 0
                // `!=` must not be matched inside `==` scanning and vice versa.
                && bytes.get(i.wrapping_sub(1)) != Some(&b'!')
                && bytes.get(i.wrapping_sub(1)) != Some(&b'=') =>
            {
                let lhs = &expr[..i];
                let rhs = &expr[i + op.len()..];
                if !lhs.trim().is_empty() && !rhs.trim().is_empty() {
                    return Some((lhs, rhs));
                }
            }
            _ => {}
        }
    }
    None
}
