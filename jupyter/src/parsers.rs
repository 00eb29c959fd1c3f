//! Return value parsers
//!
//! `evaluate` turns the `text/plain` representation of an execution's result
//! into JSON. The representation is language specific, so each supported
//! kernel language has its own parser, looked up by kernel name.

use serde_json::{Number, Value};
use std::collections::HashMap;

use crate::error::{ProxyError, Result};
use crate::execution::ExecutionResult;

pub trait ReturnParser: Send + Sync {
    fn language(&self) -> &'static str;

    fn parse_return(&self, result: &ExecutionResult) -> Result<Value>;
}

/// Parsers keyed by language
pub struct ReturnParsers {
    by_language: HashMap<&'static str, Box<dyn ReturnParser>>,
}

impl ReturnParsers {
    pub fn empty() -> Self {
        Self {
            by_language: HashMap::new(),
        }
    }

    /// Python, Julia and R
    pub fn builtin() -> Self {
        let mut parsers = Self::empty();
        parsers.register(Box::new(PythonParser));
        parsers.register(Box::new(JuliaParser));
        parsers.register(Box::new(RParser));
        parsers
    }

    pub fn register(&mut self, parser: Box<dyn ReturnParser>) {
        self.by_language.insert(parser.language(), parser);
    }

    pub fn for_kernel(&self, kernel_name: &str) -> Option<&dyn ReturnParser> {
        self.by_language
            .get(kernel_language(kernel_name)?)
            .map(|p| p.as_ref())
    }
}

impl Default for ReturnParsers {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Map a kernelspec name (`python3`, `julia-1.10`, `ir`) to its language
pub fn kernel_language(kernel_name: &str) -> Option<&'static str> {
    let name = kernel_name.to_ascii_lowercase();
    if name.starts_with("python") {
        Some("python")
    } else if name.starts_with("julia") {
        Some("julia")
    } else if name == "ir" || name == "r" || name.starts_with("r-") {
        Some("r")
    } else {
        None
    }
}

/// The result text, or an error if the execution failed
fn result_text(result: &ExecutionResult) -> Result<Option<&str>> {
    if let Some(error) = &result.error {
        return Err(ProxyError::ReturnParse(format!(
            "execution raised {}: {}",
            error.ename, error.evalue
        )));
    }
    Ok(result.return_value.as_deref().map(str::trim))
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn unquote(text: &str, quote: char) -> Option<String> {
    let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

pub struct PythonParser;

impl PythonParser {
    fn literal(text: &str) -> Option<Value> {
        match text {
            "None" => return Some(Value::Null),
            "True" => return Some(Value::Bool(true)),
            "False" => return Some(Value::Bool(false)),
            _ => {}
        }
        if let Some(n) = parse_number(text) {
            return Some(n);
        }
        if let Some(s) = unquote(text, '\'').or_else(|| unquote(text, '"')) {
            return Some(Value::String(s));
        }
        // Containers whose repr happens to be valid JSON once Python's
        // constants are spelled the JSON way
        let jsonish = text
            .replace('\'', "\"")
            .replace("None", "null")
            .replace("True", "true")
            .replace("False", "false");
        let jsonish = match jsonish.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            Some(tuple) => format!("[{}]", tuple.trim_end_matches(',')),
            None => jsonish,
        };
        serde_json::from_str(&jsonish).ok()
    }
}

impl ReturnParser for PythonParser {
    fn language(&self) -> &'static str {
        "python"
    }

    fn parse_return(&self, result: &ExecutionResult) -> Result<Value> {
        match result_text(result)? {
            None => Ok(Value::Null),
            Some(text) => Self::literal(text)
                .ok_or_else(|| ProxyError::ReturnParse(format!("not a Python literal: {}", text))),
        }
    }
}

pub struct JuliaParser;

impl JuliaParser {
    fn scalar(text: &str) -> Option<Value> {
        match text {
            "nothing" | "missing" => Some(Value::Null),
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => parse_number(text).or_else(|| unquote(text, '"').map(Value::String)),
        }
    }
}

impl ReturnParser for JuliaParser {
    fn language(&self) -> &'static str {
        "julia"
    }

    fn parse_return(&self, result: &ExecutionResult) -> Result<Value> {
        let Some(text) = result_text(result)? else {
            return Ok(Value::Null);
        };
        // "3-element Vector{Int64}:\n 1\n 2\n 3"
        if let Some((summary, body)) = text.split_once(":\n") {
            if summary.contains("-element") {
                return body
                    .lines()
                    .map(|line| Self::scalar(line.trim()))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array)
                    .ok_or_else(|| ProxyError::ReturnParse(format!("unsupported Julia vector: {}", text)));
            }
        }
        Self::scalar(text)
            .or_else(|| serde_json::from_str(text).ok())
            .ok_or_else(|| ProxyError::ReturnParse(format!("not a Julia literal: {}", text)))
    }
}

pub struct RParser;

impl RParser {
    fn scalar(token: &str) -> Option<Value> {
        match token {
            "NULL" | "NA" => Some(Value::Null),
            "TRUE" => Some(Value::Bool(true)),
            "FALSE" => Some(Value::Bool(false)),
            _ => parse_number(token).or_else(|| unquote(token, '"').map(Value::String)),
        }
    }

    /// Split a printed vector line into elements, keeping quoted strings whole
    fn tokens(line: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        for c in line.chars() {
            match c {
                '"' => {
                    quoted = !quoted;
                    current.push(c);
                }
                c if c.is_whitespace() && !quoted => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        tokens
    }
}

impl ReturnParser for RParser {
    fn language(&self) -> &'static str {
        "r"
    }

    fn parse_return(&self, result: &ExecutionResult) -> Result<Value> {
        let Some(text) = result_text(result)? else {
            return Ok(Value::Null);
        };
        if text == "NULL" {
            return Ok(Value::Null);
        }
        // "[1] 1 2 3" possibly wrapped over several "[n]"-prefixed lines
        let mut values = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix('[').and_then(|l| l.split_once(']')) else {
                return Err(ProxyError::ReturnParse(format!("unsupported R output: {}", text)));
            };
            for token in Self::tokens(rest.1) {
                values.push(Self::scalar(&token).ok_or_else(|| {
                    ProxyError::ReturnParse(format!("not an R literal: {}", token))
                })?);
            }
        }
        match values.len() {
            1 => Ok(values.remove(0)),
            _ => Ok(Value::Array(values)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionError;
    use serde_json::json;

    fn returning(text: &str) -> ExecutionResult {
        ExecutionResult {
            return_value: Some(text.to_string()),
            ..ExecutionResult::default()
        }
    }

    #[test]
    fn test_kernel_language() {
        assert_eq!(kernel_language("python3"), Some("python"));
        assert_eq!(kernel_language("julia-1.10"), Some("julia"));
        assert_eq!(kernel_language("ir"), Some("r"));
        assert_eq!(kernel_language("rust"), None);
    }

    #[test]
    fn test_python_literals() {
        let p = PythonParser;
        assert_eq!(p.parse_return(&returning("2")).unwrap(), json!(2));
        assert_eq!(p.parse_return(&returning("2.5")).unwrap(), json!(2.5));
        assert_eq!(p.parse_return(&returning("'hi'")).unwrap(), json!("hi"));
        assert_eq!(p.parse_return(&returning("None")).unwrap(), Value::Null);
        assert_eq!(
            p.parse_return(&returning("{'a': [1, True, None]}")).unwrap(),
            json!({"a": [1, true, null]})
        );
        assert_eq!(p.parse_return(&returning("(1, 2)")).unwrap(), json!([1, 2]));
        assert_eq!(p.parse_return(&ExecutionResult::default()).unwrap(), Value::Null);
        assert!(p.parse_return(&returning("<object at 0x7f>")).is_err());
    }

    #[test]
    fn test_julia_values() {
        let p = JuliaParser;
        assert_eq!(p.parse_return(&returning("4")).unwrap(), json!(4));
        assert_eq!(p.parse_return(&returning("\"hi\"")).unwrap(), json!("hi"));
        assert_eq!(p.parse_return(&returning("nothing")).unwrap(), Value::Null);
        assert_eq!(
            p.parse_return(&returning("3-element Vector{Int64}:\n 1\n 2\n 3"))
                .unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_r_vectors() {
        let p = RParser;
        assert_eq!(p.parse_return(&returning("[1] 2")).unwrap(), json!(2));
        assert_eq!(
            p.parse_return(&returning("[1] \"a b\" \"c\"")).unwrap(),
            json!(["a b", "c"])
        );
        assert_eq!(
            p.parse_return(&returning("[1] 1 2\n[3] 3")).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(p.parse_return(&returning("[1] TRUE")).unwrap(), json!(true));
        assert!(p.parse_return(&returning("function(x) x")).is_err());
    }

    #[test]
    fn test_error_result_is_not_parsed() {
        let result = ExecutionResult {
            error: Some(ExecutionError {
                ename: "NameError".to_string(),
                evalue: "name 'x' is not defined".to_string(),
                traceback: vec![],
            }),
            ..ExecutionResult::default()
        };
        assert!(matches!(
            PythonParser.parse_return(&result),
            Err(ProxyError::ReturnParse(_))
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let parsers = ReturnParsers::builtin();
        assert_eq!(parsers.for_kernel("python3").unwrap().language(), "python");
        assert!(parsers.for_kernel("bash").is_none());
        assert!(ReturnParsers::empty().for_kernel("python3").is_none());
    }
}
