//! Tool-call detection in free-form model output.
//!
//! Models without native function calling describe the tool they want in text,
//! using one of three conventions:
//! - `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`
//! - `<tool_call name="..." arguments='{...}'/>`
//! - `name({...})`, only honoured after the last `</think>`
//!
//! Extraction is tolerant: a match that does not parse is skipped and the
//! scan continues with the next one.

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::protocol::ToolInvocationRequest;
use crate::reasoning_parser::THINK_CLOSE;

lazy_static! {
    static ref TAGGED_CALL: Regex = Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").unwrap();
    static ref SELF_CLOSING_CALL: Regex = Regex::new(r"<tool_call[^>]*?/>").unwrap();
    static ref ATTRIBUTE_CALL: Regex =
        Regex::new(r#"<tool_call\s+name="([^"]+)"\s+arguments='([^']+)'\s*/>"#).unwrap();
    static ref BARE_CALL: Regex = Regex::new(r"(?s)(\w+)\s*\(\s*(\{.*?\})\s*\)").unwrap();
}

/// Which textual convention a match came from (used for diagnostics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSyntax {
    Tagged,
    Attribute,
    Bare,
}

/// Extract every tool invocation request from finalized output.
///
/// The three passes run in a fixed order and their results are concatenated
/// without deduplication.
pub fn extract_tool_calls(text: &str) -> Vec<ToolInvocationRequest> {
    let mut calls = Vec::new();

    for cap in TAGGED_CALL.captures_iter(text) {
        let inner = cap.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        match parse_tagged(inner) {
            Ok(call) => calls.push(call),
            Err(reason) => skip(CallSyntax::Tagged, inner, &reason),
        }
    }

    for cap in ATTRIBUTE_CALL.captures_iter(text) {
        let (Some(name), Some(args)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        match parse_arguments(args.as_str()) {
            Ok(arguments) => calls.push(ToolInvocationRequest::new(name.as_str(), arguments)),
            Err(reason) => skip(CallSyntax::Attribute, args.as_str(), &reason),
        }
    }

    // Bare calls inside reasoning are usually the model thinking out loud.
    if let Some(idx) = text.rfind(THINK_CLOSE) {
        let after_think = &text[idx + THINK_CLOSE.len()..];
        for cap in BARE_CALL.captures_iter(after_think) {
            let (Some(name), Some(args)) = (cap.get(1), cap.get(2)) else {
                continue;
            };
            match parse_arguments(args.as_str()) {
                Ok(arguments) => calls.push(ToolInvocationRequest::new(name.as_str(), arguments)),
                Err(reason) => skip(CallSyntax::Bare, args.as_str(), &reason),
            }
        }
    }

    tracing::debug!("extracted {} tool call(s)", calls.len());
    calls
}

/// Remove all three tool-call conventions from display text.
///
/// Returns the input unchanged (borrowed) when nothing matches.
pub fn scrub_tool_calls(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for pattern in [&*TAGGED_CALL, &*SELF_CLOSING_CALL, &*BARE_CALL] {
        if pattern.is_match(&out) {
            let replaced = pattern.replace_all(&out, "").into_owned();
            out = Cow::Owned(replaced);
        }
    }
    out
}

fn parse_tagged(inner: &str) -> Result<ToolInvocationRequest, String> {
    let value: Value = serde_json::from_str(inner).map_err(|e| e.to_string())?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing \"name\"".to_string())?;
    let arguments = match value.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err("\"arguments\" is not an object".to_string()),
    };
    Ok(ToolInvocationRequest::new(name, arguments))
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw).map_err(|e| e.to_string())? {
        Value::Object(map) => Ok(map),
        _ => Err("arguments are not an object".to_string()),
    }
}

fn skip(syntax: CallSyntax, fragment: &str, reason: &str) {
    tracing::warn!(?syntax, fragment, "skipping malformed tool call: {}", reason);
}
