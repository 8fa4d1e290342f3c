//! Decider (C3, §4.3): given goal, screen, and history, produce one
//! `Decision`. Wraps a remote chat-completion backend and an optional
//! local on-device generator behind a common trait; the Orchestrator owns
//! the remote→local fallback chain (§7), this module owns parsing.
//!
//! The tolerant-parsing chain (`sanitize_llm_json`/`extract_json`/
//! `repair_truncated_json`/`extract_partial_actions`) is carried over from
//! `brain/mod.rs` near verbatim — those functions never returned `Result`
//! there and must not here either (§10.2: tolerant parsing is total). The
//! heuristic keyword scan and final `done` fallback are new: the base
//! crate stopped at "treat raw text as a reflection", the spec requires
//! one more tier before giving up.

use crate::config::{LocalDeciderConfig, RemoteDeciderConfig};
use crate::types::{Decision, Direction, ToolCall, ToolDefinition, ToolResult, UiAction};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Transient failure taxonomy for decider calls. Adapted from
/// `fallback.rs`'s `ErrorClass`; the cooldown/rotation machinery there
/// served a long-lived multi-call session and has no analog in ACC's
/// bounded single run — only the classification survives, used by the
/// Orchestrator to decide whether a fallback is worth attempting and to
/// log why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeciderErrorClass {
    RateLimit,
    AuthError,
    Timeout,
    ServerError,
    ClientError,
    NetworkError,
    Unknown,
}

impl DeciderErrorClass {
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();
        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            Self::RateLimit
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("invalid api key")
            || lower.contains("authentication")
        {
            Self::AuthError
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline exceeded") {
            Self::Timeout
        } else if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("internal server error")
            || lower.contains("bad gateway")
            || lower.contains("service unavailable")
        {
            Self::ServerError
        } else if lower.contains("400") || lower.contains("invalid request") || lower.contains("model not found") {
            Self::ClientError
        } else if lower.contains("connection refused") || lower.contains("dns") || lower.contains("unreachable") {
            Self::NetworkError
        } else {
            Self::Unknown
        }
    }

    /// Worth retrying against a different backend.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ClientError)
    }
}

/// The prompt shape the Orchestrator picks (§4.3/§4.5); the Decider does
/// not choose between these, it only renders whichever it's handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    Normal,
    LoopRecovery,
    FailureRecovery,
}

pub struct PromptContext<'a> {
    pub goal: &'a str,
    pub screen_text: &'a str,
    pub last_action_result: Option<&'a str>,
    pub previous_actions: Option<&'a str>,
    pub plan: Option<&'a Plan>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<String>,
    pub success_criteria: Option<String>,
    pub current_step: usize,
}

const ACTIONS_LEGEND: &str = "ACTIONS: tap(index) taps an element; type(text) fills the focused/first editable \
field; enter submits it; swipe(direction: u/d/l/r) scrolls; long(index) long-presses; back/home/notif/quick are \
platform globals; open(app) launches an app by fuzzy name; url(u) opens a link; search(q) runs a web search; \
wait does nothing for one step; screenshot captures the display; done ends the run when the goal is met.";

/// Build the prompt text for one decider call. Vision is not a distinct
/// text variant — when a vision-capable remote is configured the image
/// is passed alongside this same text (§4.3).
pub fn build_prompt(variant: PromptVariant, ctx: &PromptContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("GOAL: {}\n", ctx.goal));
    out.push_str(&format!("SCREEN:\n{}\n", ctx.screen_text));
    if let Some(last) = ctx.last_action_result {
        out.push_str(&format!("LAST_ACTION: {}\n", last));
    }
    if let Some(prev) = ctx.previous_actions {
        if !prev.is_empty() {
            out.push_str(&format!("PREVIOUS_ACTIONS:\n{}\n", prev));
        }
    }
    if let Some(plan) = ctx.plan {
        out.push_str(&format!(
            "PLAN (step {}/{}): {}\n",
            ctx.plan.map(|p| p.current_step + 1).unwrap_or(0),
            plan.steps.len(),
            plan.steps.join(" -> ")
        ));
        if let Some(ref criteria) = plan.success_criteria {
            out.push_str(&format!("SUCCESS_CRITERIA: {}\n", criteria));
        }
    }
    match variant {
        PromptVariant::Normal => {}
        PromptVariant::LoopRecovery => {
            out.push_str("NOTE: you repeated an action; try a different element, direction, or strategy.\n");
        }
        PromptVariant::FailureRecovery => {
            out.push_str("NOTE: the last action failed; consider scrolling, waiting, or a different element.\n");
        }
    }
    out.push_str(ACTIONS_LEGEND);
    out
}

/// Outbound port: a decider backend resolves one prompt (plus optional
/// tool catalog and optional image) into a `Decision`.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(
        &self,
        prompt: &str,
        tools: &[ToolDefinition],
        image_base64: Option<&str>,
    ) -> anyhow::Result<Decision>;

    /// Re-query after tool execution (§4.4/§6): the original prompt and
    /// tool catalog carry over, plus the calls just made and their
    /// results. The default just folds the results into the original
    /// prompt as text and calls `decide` again with the same tool
    /// catalog still attached, so another `ToolCalls` round stays
    /// possible. `RemoteDecider` overrides this to build the proper
    /// `tool_calls`/`role:"tool"` message sequence instead.
    async fn continue_after_tools(
        &self,
        original_prompt: &str,
        _calls: &[ToolCall],
        results: &[ToolResult],
        tools: &[ToolDefinition],
    ) -> anyhow::Result<Decision> {
        let summary = results.iter().map(|r| format!("{}: {}", r.name, r.result)).collect::<Vec<_>>().join("\n");
        let followup = format!("{original_prompt}\n\nTOOL RESULTS:\n{summary}\nContinue toward the goal.");
        self.decide(&followup, tools, None).await
    }

    fn supports_vision(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// Remote chat-completion backend (§6): single POST, temperature 0,
/// JSON-object or function-calling response mode.
pub struct RemoteDecider {
    config: RemoteDeciderConfig,
    client: reqwest::Client,
}

impl RemoteDecider {
    pub fn new(config: RemoteDeciderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }
}

#[async_trait]
impl Decider for RemoteDecider {
    async fn decide(
        &self,
        prompt: &str,
        tools: &[ToolDefinition],
        image_base64: Option<&str>,
    ) -> anyhow::Result<Decision> {
        let user_content: Value = match image_base64 {
            Some(b64) if self.config.vision_enabled => serde_json::json!([
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{b64}"), "detail": "low"}},
            ]),
            _ => Value::String(prompt.to_string()),
        };
        let messages = vec![serde_json::json!({"role": "user", "content": user_content})];
        self.send_chat(messages, tools).await
    }

    /// Builds the OpenAI-style follow-up turn (§6): the original user
    /// message, an assistant message carrying the `tool_calls` just made,
    /// then one `role:"tool"` message per result, each tied back by
    /// `tool_call_id`.
    async fn continue_after_tools(
        &self,
        original_prompt: &str,
        calls: &[ToolCall],
        results: &[ToolResult],
        tools: &[ToolDefinition],
    ) -> anyhow::Result<Decision> {
        let assistant_tool_calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": serde_json::to_string(&scalar_map_to_value(&c.arguments)).unwrap_or_default(),
                    },
                })
            })
            .collect();

        let mut messages = vec![
            serde_json::json!({"role": "user", "content": original_prompt}),
            serde_json::json!({"role": "assistant", "content": Value::Null, "tool_calls": assistant_tool_calls}),
        ];
        for (call, result) in calls.iter().zip(results.iter()) {
            messages.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": result.result,
            }));
        }

        self.send_chat(messages, tools).await
    }

    fn supports_vision(&self) -> bool {
        self.config.vision_enabled
    }

    fn name(&self) -> &str {
        "remote"
    }
}

impl RemoteDecider {
    async fn send_chat(&self, messages: Vec<Value>, tools: &[ToolDefinition]) -> anyhow::Result<Decision> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": messages,
            "parallel_tool_calls": false,
        });

        if tools.is_empty() {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        } else {
            body["tools"] = serde_json::json!(tools.iter().map(tool_definition_to_schema).collect::<Vec<_>>());
        }

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("remote decider request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("remote decider returned {status}: {text}");
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("remote decider returned malformed JSON: {e}"))?;

        let message = &value["choices"][0]["message"];
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            if !calls.is_empty() {
                return Ok(Decision::ToolCalls(parse_remote_tool_calls(calls)));
            }
        }

        let content = message.get("content").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(parse_decision_text(content))
    }
}

fn tool_definition_to_schema(def: &ToolDefinition) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in &def.parameters {
        let type_str = match p.param_type {
            crate::types::ParamType::String => "string",
            crate::types::ParamType::Integer => "integer",
            crate::types::ParamType::Number => "number",
            crate::types::ParamType::Boolean => "boolean",
        };
        let mut schema = serde_json::json!({"type": type_str, "description": p.description});
        if let Some(ref values) = p.enum_values {
            schema["enum"] = serde_json::json!(values);
        }
        properties.insert(p.name.clone(), schema);
        if p.required {
            required.push(p.name.clone());
        }
    }
    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": {"type": "object", "properties": properties, "required": required},
        },
    })
}

fn parse_remote_tool_calls(calls: &[Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .filter_map(|c| {
            let id = c.get("id").and_then(|v| v.as_str())?.to_string();
            let name = c["function"]["name"].as_str()?.to_string();
            let args_str = c["function"]["arguments"].as_str().unwrap_or("{}");
            let args_value: Value = serde_json::from_str(args_str).unwrap_or(Value::Null);
            let arguments = value_to_scalar_map(&args_value);
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

fn value_to_scalar_map(value: &Value) -> HashMap<String, crate::types::ScalarValue> {
    use crate::types::ScalarValue;
    let mut map = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (k, v) in obj {
            let scalar = match v {
                Value::String(s) => ScalarValue::String(s.clone()),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        ScalarValue::Int(i)
                    } else {
                        ScalarValue::Number(n.as_f64().unwrap_or(0.0))
                    }
                }
                Value::Bool(b) => ScalarValue::Bool(*b),
                _ => ScalarValue::Null,
            };
            map.insert(k.clone(), scalar);
        }
    }
    map
}

fn scalar_map_to_value(map: &HashMap<String, crate::types::ScalarValue>) -> Value {
    use crate::types::ScalarValue;
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        let value = match v {
            ScalarValue::String(s) => Value::String(s.clone()),
            ScalarValue::Int(i) => serde_json::json!(i),
            ScalarValue::Number(n) => serde_json::json!(n),
            ScalarValue::Bool(b) => Value::Bool(*b),
            ScalarValue::Null => Value::Null,
        };
        obj.insert(k.clone(), value);
    }
    Value::Object(obj)
}

/// Local on-device generator (§6): grammar-constrained JSON, relaxed to
/// `<tool_call>` tags when tools are registered.
pub struct LocalDecider {
    config: LocalDeciderConfig,
    client: reqwest::Client,
}

impl LocalDecider {
    pub fn new(config: LocalDeciderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn tool_catalog_addendum(tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "\nTOOLS (call at most one per turn, as \
             <tool_call>{\"tool\":\"name\",\"arguments\":{...}}</tool_call>):\n",
        );
        for t in tools {
            out.push_str(&format!("- {}: {}\n", t.name, t.description));
        }
        out
    }
}

#[async_trait]
impl Decider for LocalDecider {
    async fn decide(
        &self,
        prompt: &str,
        tools: &[ToolDefinition],
        _image_base64: Option<&str>,
    ) -> anyhow::Result<Decision> {
        let full_prompt = format!("{prompt}{}", Self::tool_catalog_addendum(tools));
        let max_tokens = if tools.is_empty() { 64 } else { self.config.max_tokens.max(128) };

        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": full_prompt,
            "stream": false,
            "options": {"temperature": 0.0, "top_p": 0.95, "num_predict": max_tokens},
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.config.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("local decider request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("local decider returned {status}");
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("local decider returned malformed JSON: {e}"))?;
        let text = value.get("response").and_then(|v| v.as_str()).unwrap_or_default();

        if let Some(call) = extract_tool_call_tag(text) {
            return Ok(Decision::ToolCalls(vec![call]));
        }

        Ok(parse_decision_text(text))
    }

    fn name(&self) -> &str {
        "local"
    }
}

fn extract_tool_call_tag(text: &str) -> Option<ToolCall> {
    let start = text.find("<tool_call>")? + "<tool_call>".len();
    let end = text.find("</tool_call>")?;
    if end <= start {
        return None;
    }
    let inner = &text[start..end];
    let value: Value = serde_json::from_str(inner.trim()).ok()?;
    let name = value.get("tool").and_then(|v| v.as_str())?.to_string();
    let arguments = value.get("arguments").map(value_to_scalar_map).unwrap_or_default();
    Some(ToolCall { id: uuid::Uuid::new_v4().to_string(), name, arguments })
}

// ---------------------------------------------------------------------
// Tolerant JSON parsing chain, ported from brain/mod.rs's
// sanitize_llm_json / extract_json / repair_truncated_json /
// extract_partial_actions. These remain total functions: never panic,
// never return Result, always degrade to a best-effort value.
// ---------------------------------------------------------------------

/// Normalize curly quotes, dashes, NBSP, BOM, and strip trailing commas
/// before `}`/`]` that some models emit.
pub fn sanitize_llm_json(text: &str) -> String {
    let mut s = text
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2014}', '\u{2013}'], "-")
        .replace('\u{00A0}', " ")
        .replace('\u{FEFF}', "");

    let bytes: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == '}' || bytes[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    s = out;
    s
}

/// Extract the first balanced JSON object from free-form text, tolerating
/// ` ```json ` / bare ` ``` ` fences.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Some(balanced) = balanced_object_from(trimmed, 0) {
            return Some(balanced);
        }
    }
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(brace) = after.find('{') {
            if let Some(balanced) = balanced_object_from(after, brace) {
                return Some(balanced);
            }
        }
    }
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(brace) = after.find('{') {
            if let Some(balanced) = balanced_object_from(after, brace) {
                return Some(balanced);
            }
        }
    }
    if let Some(brace) = text.find('{') {
        if let Some(balanced) = balanced_object_from(text, brace) {
            return Some(balanced);
        }
    }
    None
}

fn balanced_object_from(text: &str, start: usize) -> Option<String> {
    let chars: Vec<char> = text[start..].chars().collect();
    if chars.first() != Some(&'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut prev_escape = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if c == '"' && !prev_escape {
                in_string = false;
            }
            prev_escape = c == '\\' && !prev_escape;
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(chars[..=i].iter().collect());
                }
            }
            _ => {}
        }
        prev_escape = false;
    }
    None
}

/// Repair a truncated JSON object: if an odd number of unescaped quotes
/// suggests a string was cut mid-token, back up to the last safe comma or
/// open brace, then close any unclosed `{`/`[`.
pub fn repair_truncated_json(s: &str) -> String {
    let Some(start) = s.find('{') else {
        return s.to_string();
    };
    let mut body = s[start..].to_string();

    let quote_count = count_unescaped_quotes(&body);
    if quote_count % 2 != 0 {
        if let Some(cut) = body.rfind(|c| c == ',' || c == '{') {
            body.truncate(cut + 1);
            if body.ends_with(',') {
                body.pop();
            }
        }
    }
    let trimmed = body.trim_end();
    if trimmed.ends_with(',') {
        body = trimmed[..trimmed.len() - 1].to_string();
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut prev_char = '\0';
    for c in body.chars() {
        if in_string {
            if c == '"' && prev_char != '\\' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' => {
                    stack.pop();
                }
                _ => {}
            }
        }
        prev_char = c;
    }
    if in_string {
        body.push('"');
    }
    while let Some(closer) = stack.pop() {
        body.push(closer);
    }
    body
}

fn count_unescaped_quotes(s: &str) -> usize {
    let mut count = 0;
    let mut prev = '\0';
    for c in s.chars() {
        if c == '"' && prev != '\\' {
            count += 1;
        }
        prev = c;
    }
    count
}

/// Pull individual objects out of an `"actions"` array even when the
/// overall JSON document is broken.
pub fn extract_partial_actions(s: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let Some(key_pos) = s.find("\"actions\"") else {
        return out;
    };
    let Some(bracket) = s[key_pos..].find('[') else {
        return out;
    };
    let start = key_pos + bracket + 1;
    let mut depth = 0i32;
    let mut obj_start = None;
    let mut in_string = false;
    let mut prev_char = '\0';

    for (i, c) in s[start..].char_indices() {
        if in_string {
            if c == '"' && prev_char != '\\' {
                in_string = false;
            }
            prev_char = c;
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    obj_start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(os) = obj_start.take() {
                        let candidate = &s[start + os..=start + i];
                        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                            out.push(v);
                        }
                    }
                }
            }
            ']' if depth == 0 => break,
            _ => {}
        }
        prev_char = c;
    }
    out
}

const DIRECTION_WORDS: &[(&str, &str)] =
    &[("up", "u"), ("down", "d"), ("left", "l"), ("right", "r")];

/// Accept both long and short key aliases on a raw JSON object and
/// produce the canonical field map this module parses against.
fn normalize_keys(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let mut out = serde_json::Map::new();
    for (k, v) in obj {
        let canonical = match k.as_str() {
            "a" => "action",
            "i" => "index",
            "t" => "text",
            "d" => "direction",
            "u" => "url",
            "q" => "query",
            other => other,
        };
        out.insert(canonical.to_string(), v.clone());
    }
    if let Some(Value::String(dir)) = out.get("direction").cloned() {
        let lower = dir.to_lowercase();
        for (word, letter) in DIRECTION_WORDS {
            if lower == *word {
                out.insert("direction".to_string(), Value::String(letter.to_string()));
                break;
            }
        }
    }
    Value::Object(out)
}

/// If `action` is empty or the literal `"ACTION"` placeholder, infer it
/// from whichever fields are populated.
fn infer_action_from_fields(obj: &serde_json::Map<String, Value>) -> Option<String> {
    if obj.contains_key("query") {
        Some("search".to_string())
    } else if obj.contains_key("url") {
        Some("url".to_string())
    } else if obj.contains_key("app") {
        Some("open".to_string())
    } else if obj.contains_key("direction") {
        Some("swipe".to_string())
    } else if obj.contains_key("index") && obj.contains_key("text") {
        Some("type".to_string())
    } else if obj.contains_key("index") {
        Some("tap".to_string())
    } else if obj.contains_key("text") {
        Some("type".to_string())
    } else {
        None
    }
}

/// Build a `Decision` from a normalized JSON object.
fn decision_from_object(value: &Value) -> Option<Decision> {
    let normalized = normalize_keys(value);
    let obj = normalized.as_object()?;

    let mut action_str = obj.get("action").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    if action_str.is_empty() || action_str.eq_ignore_ascii_case("ACTION") {
        action_str = infer_action_from_fields(obj)?;
    }

    let action = UiAction::parse(&action_str)?;
    let index = obj.get("index").and_then(|v| v.as_u64()).map(|i| i as usize);
    let text = obj.get("text").and_then(|v| v.as_str()).map(|s| s.to_string());
    let direction = obj.get("direction").and_then(|v| v.as_str()).and_then(Direction::parse);
    let url = obj.get("url").and_then(|v| v.as_str()).map(|s| s.to_string());
    let query = obj.get("query").and_then(|v| v.as_str()).map(|s| s.to_string());
    let app = obj.get("app").and_then(|v| v.as_str()).map(|s| s.to_string());
    let reason = obj.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string());

    Some(Decision::Ui { action, index, text, direction, url, query, app, reason })
}

/// Heuristic keyword scan, the tier below JSON extraction (§4.3): scan
/// raw text for an action word when nothing parses as JSON at all.
fn heuristic_scan(text: &str) -> Decision {
    let lower = text.to_lowercase();
    for word in ["done", "back", "home", "enter", "wait", "tap", "type", "swipe"] {
        if lower.contains(word) {
            if let Some(action) = UiAction::parse(word) {
                return Decision::ui(action);
            }
        }
    }
    Decision::ui(UiAction::Wait)
}

/// Canonicalize raw decider text into a `Decision`, following the full
/// chain in §4.3: JSON extraction, repair-and-retry, partial-actions
/// extraction, heuristic scan, and a final hard-coded `done`.
pub fn parse_decision_text(raw: &str) -> Decision {
    let sanitized = sanitize_llm_json(raw);

    if let Some(json_str) = extract_json(&sanitized) {
        if let Ok(value) = serde_json::from_str::<Value>(&json_str) {
            if let Some(decision) = decision_from_object(&value) {
                return decision;
            }
            if value.get("actions").is_some() {
                if let Some(first) = value["actions"].as_array().and_then(|a| a.first()) {
                    if let Some(decision) = decision_from_object(first) {
                        return decision;
                    }
                }
            }
        }

        let repaired = repair_truncated_json(&json_str);
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            if let Some(decision) = decision_from_object(&value) {
                return decision;
            }
        }

        let partial = extract_partial_actions(&json_str);
        if let Some(first) = partial.first() {
            if let Some(decision) = decision_from_object(first) {
                return decision;
            }
        }
    }

    let partial = extract_partial_actions(&sanitized);
    if let Some(first) = partial.first() {
        if let Some(decision) = decision_from_object(first) {
            return decision;
        }
    }

    if sanitized.trim().is_empty() {
        debug!("decider returned empty completion, falling back to wait");
        return Decision::ui(UiAction::Wait);
    }

    if extract_json(&sanitized).is_none() {
        warn!("decider response had no JSON, trying heuristic scan: {}", truncate(&sanitized, 80));
        return heuristic_scan(&sanitized);
    }

    Decision::TextAnswer(sanitized)
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_curly_quotes_and_trailing_commas() {
        let input = "{\u{201C}action\u{201D}: \u{201C}tap\u{201D}, \u{201C}index\u{201D}: 1,}";
        let sanitized = sanitize_llm_json(input);
        assert!(sanitized.contains("\"action\""));
        assert!(!sanitized.contains(",}"));
    }

    #[test]
    fn extract_json_handles_fenced_block() {
        let text = "here you go:\n```json\n{\"action\": \"tap\", \"index\": 2}\n```\nthanks";
        let json = extract_json(text).unwrap();
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
    }

    #[test]
    fn repair_truncated_json_closes_unbalanced_braces() {
        let truncated = r#"{"action": "tap", "index": 3"#;
        let repaired = repair_truncated_json(truncated);
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn key_aliases_resolve_to_canonical_fields() {
        let value: Value = serde_json::from_str(r#"{"a": "tap", "i": 4}"#).unwrap();
        let decision = decision_from_object(&value).unwrap();
        assert_eq!(
            decision,
            Decision::Ui {
                action: UiAction::Tap,
                index: Some(4),
                text: None,
                direction: None,
                url: None,
                query: None,
                app: None,
                reason: None
            }
        );
    }

    #[test]
    fn direction_word_normalizes_to_letter_then_parses() {
        let value: Value = serde_json::from_str(r#"{"action": "swipe", "direction": "up"}"#).unwrap();
        let decision = decision_from_object(&value).unwrap();
        match decision {
            Decision::Ui { direction, .. } => assert_eq!(direction, Some(Direction::Up)),
            _ => panic!("expected Ui decision"),
        }
    }

    #[test]
    fn empty_action_infers_search_from_query_field() {
        let value: Value = serde_json::from_str(r#"{"action": "", "query": "weather today"}"#).unwrap();
        let decision = decision_from_object(&value).unwrap();
        match decision {
            Decision::Ui { action, query, .. } => {
                assert_eq!(action, UiAction::Search);
                assert_eq!(query.as_deref(), Some("weather today"));
            }
            _ => panic!("expected Ui decision"),
        }
    }

    #[test]
    fn literal_action_placeholder_infers_from_app_field() {
        let value: Value = serde_json::from_str(r#"{"action": "ACTION", "app": "Spotify"}"#).unwrap();
        let decision = decision_from_object(&value).unwrap();
        match decision {
            Decision::Ui { action, app, .. } => {
                assert_eq!(action, UiAction::Open);
                assert_eq!(app.as_deref(), Some("Spotify"));
            }
            _ => panic!("expected Ui decision"),
        }
    }

    #[test]
    fn partial_actions_extracted_from_broken_overall_json() {
        let broken = r#"{"actions": [{"action": "tap", "index": 1}, {BROKEN"#;
        let partial = extract_partial_actions(broken);
        assert_eq!(partial.len(), 1);
    }

    #[test]
    fn non_json_text_falls_back_through_heuristic_scan() {
        let decision = parse_decision_text("I think we should go back now.");
        assert_eq!(decision, Decision::ui(UiAction::Back));
    }

    #[test]
    fn total_garbage_still_yields_a_decision_never_panics() {
        let decision = parse_decision_text("\u{0}\u{1}garbled{{{");
        assert!(matches!(decision, Decision::Ui { .. } | Decision::TextAnswer(_)));
    }

    #[test]
    fn error_classification_matches_known_substrings() {
        assert_eq!(DeciderErrorClass::classify("HTTP 429 too many requests"), DeciderErrorClass::RateLimit);
        assert_eq!(DeciderErrorClass::classify("connection refused"), DeciderErrorClass::NetworkError);
        assert_eq!(DeciderErrorClass::classify("400 invalid request"), DeciderErrorClass::ClientError);
    }

    #[test]
    fn client_error_is_not_retryable() {
        assert!(!DeciderErrorClass::ClientError.is_retryable());
        assert!(DeciderErrorClass::ServerError.is_retryable());
    }

    struct EchoDecider;

    #[async_trait]
    impl Decider for EchoDecider {
        async fn decide(&self, prompt: &str, tools: &[ToolDefinition], _image: Option<&str>) -> anyhow::Result<Decision> {
            Ok(Decision::TextAnswer(format!("prompt={prompt} tools={}", tools.len())))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn default_continue_after_tools_keeps_prompt_and_tool_catalog() {
        let decider = EchoDecider;
        let tools = vec![ToolDefinition {
            name: "get_current_time".to_string(),
            description: "current time".to_string(),
            parameters: vec![],
        }];
        let call = ToolCall { id: "1".to_string(), name: "get_current_time".to_string(), arguments: HashMap::new() };
        let result = ToolResult {
            tool_call_id: "1".to_string(),
            name: "get_current_time".to_string(),
            result: "12:00:00 UTC".to_string(),
            is_error: false,
        };
        let decision = decider
            .continue_after_tools("GOAL: what time is it\nSCREEN:\nempty", &[call], &[result], &tools)
            .await
            .unwrap();
        match decision {
            Decision::TextAnswer(text) => {
                assert!(text.contains("GOAL: what time is it"));
                assert!(text.contains("12:00:00 UTC"));
                assert!(text.contains("tools=1"));
            }
            other => panic!("expected TextAnswer, got {other:?}"),
        }
    }
}
