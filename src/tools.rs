//! ToolRegistry & ToolLoop (C4, §4.4): named tools with typed parameters,
//! executed in a bounded sub-loop until a non-tool `Decision` emerges.
//!
//! The base crate has no tool-calling sub-loop of its own (its "tools"
//! were workspace skills invoked through free-form prompt text); this
//! module is built fresh, but keeps the base crate's conventions: async
//! handlers returning `anyhow::Result`-shaped success/failure collapsed
//! into a flat `ToolResult`, and the same `#[cfg(test)] mod tests` /
//! `#[tokio::test]` style used throughout the base crate.

use crate::action::{ActionOutcome, ActionParams, ActionSink};
use crate::types::{Decision, Direction, ParamType, ScalarValue, ToolCall, ToolDefinition, ToolParam, ToolResult, UiAction};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_TOOL_ITERATIONS: u32 = 5;

pub type ToolHandler =
    Arc<dyn Fn(HashMap<String, ScalarValue>) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Registers `(ToolDefinition, handler)` pairs by name and exposes the
/// catalog in the two shapes the two decider backends need.
#[derive(Clone)]
pub struct ToolRegistry {
    entries: HashMap<String, (ToolDefinition, ToolHandler)>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn register(&mut self, def: ToolDefinition, handler: ToolHandler) {
        self.entries.insert(def.name.clone(), (def, handler));
    }

    pub fn catalog(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|(d, _)| d.clone()).collect()
    }

    /// Prompt addendum for the local backend, describing the
    /// `<tool_call>{"tool":"name","arguments":{...}}</tool_call>` contract.
    pub fn prompt_addendum(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "Call at most one tool per turn as \
             <tool_call>{\"tool\":\"name\",\"arguments\":{...}}</tool_call>:\n",
        );
        for (name, (def, _)) in &self.entries {
            out.push_str(&format!("- {name}: {}\n", def.description));
        }
        out
    }

    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        match self.entries.get(&call.name) {
            Some((_, handler)) => match handler(call.arguments.clone()).await {
                Ok(result) => ToolResult { tool_call_id: call.id.clone(), name: call.name.clone(), result, is_error: false },
                Err(err) => ToolResult { tool_call_id: call.id.clone(), name: call.name.clone(), result: err, is_error: true },
            },
            None => ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                result: format!("unknown tool: {}", call.name),
                is_error: true,
            },
        }
    }
}

/// True when a tool call name is a UI tool (prefix `ui_`) — these are
/// isomorphic to `UiAction`s and short-circuit the sub-loop (§4.4).
pub fn is_ui_tool(name: &str) -> bool {
    name.starts_with("ui_")
}

/// Resolve a UI tool call into `ActionParams` ready for `ActionSink`.
pub fn ui_tool_to_action_params(call: &ToolCall) -> Option<(UiAction, ActionParamsInput)> {
    let action = match call.name.as_str() {
        "ui_tap" => UiAction::Tap,
        "ui_long_press" => UiAction::Long,
        "ui_type" => UiAction::Type,
        "ui_enter" => UiAction::Enter,
        "ui_swipe" => UiAction::Swipe,
        "ui_back" => UiAction::Back,
        "ui_home" => UiAction::Home,
        "ui_open_app" => UiAction::Open,
        "ui_open_url" => UiAction::Url,
        "ui_web_search" => UiAction::Search,
        "ui_open_notifications" => UiAction::Notif,
        "ui_open_quick_settings" => UiAction::Quick,
        "ui_wait" => UiAction::Wait,
        "ui_done" => UiAction::Done,
        _ => return None,
    };
    let index = call.arguments.get("index").and_then(|v| v.as_f64()).map(|f| f as usize);
    let text = call.arguments.get("text").and_then(|v| v.as_str()).map(|s| s.to_string());
    let direction = call.arguments.get("direction").and_then(|v| v.as_str()).and_then(Direction::parse);
    let url = call.arguments.get("url").and_then(|v| v.as_str()).map(|s| s.to_string());
    let query = call.arguments.get("query").and_then(|v| v.as_str()).map(|s| s.to_string());
    let app = call.arguments.get("app").and_then(|v| v.as_str()).map(|s| s.to_string());
    Some((action, ActionParamsInput { index, text, direction, url, query, app }))
}

pub struct ActionParamsInput {
    pub index: Option<usize>,
    pub text: Option<String>,
    pub direction: Option<Direction>,
    pub url: Option<String>,
    pub query: Option<String>,
    pub app: Option<String>,
}

/// Outcome of running the tool sub-loop to completion.
pub enum ToolLoopOutcome {
    /// A UI tool call was the first entry of the initial response — the
    /// Orchestrator must execute it directly as one UI step, no
    /// recursion into the registry loop.
    UiShortCircuit(ToolCall),
    /// Every tool call was resolved and the decider converged on a
    /// non-tool response.
    Resolved(Decision),
    /// `MAX_TOOL_ITERATIONS` exceeded without convergence.
    Overflow,
}

/// Re-query callback: given the original tool calls and their results,
/// ask the Decider again (preserving the original goal/screen context and
/// tool catalog, per §6's multi-turn contract) and get back the next
/// `Decision`.
pub type RequeryFn<'a> = dyn Fn(&[ToolCall], &[ToolResult]) -> Pin<Box<dyn Future<Output = anyhow::Result<Decision>> + Send + 'a>>
    + 'a;

/// Drive the tool sub-loop for one initial `Decision`. `record` is called
/// once per executed tool call so the caller can append it to History.
pub async fn run_tool_loop<'a>(
    initial: Decision,
    registry: &ToolRegistry,
    requery: &RequeryFn<'a>,
    mut record: impl FnMut(&str, &ToolResult),
) -> ToolLoopOutcome {
    let mut current = initial;
    let mut iterations = 0u32;

    loop {
        let Decision::ToolCalls(calls) = &current else {
            return ToolLoopOutcome::Resolved(current);
        };
        let Some(first) = calls.first() else {
            return ToolLoopOutcome::Resolved(Decision::Error("empty tool call list".to_string()));
        };
        if is_ui_tool(&first.name) {
            return ToolLoopOutcome::UiShortCircuit(first.clone());
        }

        if iterations >= MAX_TOOL_ITERATIONS {
            warn!("tool loop exceeded {MAX_TOOL_ITERATIONS} iterations, aborting");
            return ToolLoopOutcome::Overflow;
        }
        iterations += 1;

        let calls = calls.clone();
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            let result = registry.dispatch(call).await;
            record(&call.name, &result);
            debug!("tool {} -> error={} result={}", call.name, result.is_error, truncate(&result.result, 120));
            results.push(result);
        }

        match requery(&calls, &results).await {
            Ok(next) => current = next,
            Err(e) => {
                warn!("decider re-query after tool results failed: {e}");
                return ToolLoopOutcome::Overflow;
            }
        }
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect::<String>() + "..."
    }
}

/// Delegate a resolved UI tool call through `ActionSink`, resolving its
/// index against the current screen the same way a plain `UiAction`
/// decision would be.
pub async fn execute_ui_tool(
    call: &ToolCall,
    sink: &dyn ActionSink,
    screen: &crate::types::Screen,
) -> Option<ActionOutcome> {
    let (action, input) = ui_tool_to_action_params(call)?;
    let coords = input.index.and_then(|i| screen.coords_for(i));
    let params = ActionParams {
        action,
        coords,
        text: input.text,
        direction: input.direction,
        url: input.url,
        query: input.query,
        app: input.app,
    };
    Some(sink.execute(params).await)
}

// ---------------------------------------------------------------------
// Built-in non-UI tools (§4.4).
// ---------------------------------------------------------------------

pub fn def(name: &str, description: &str, params: Vec<ToolParam>) -> ToolDefinition {
    ToolDefinition { name: name.to_string(), description: description.to_string(), parameters: params }
}

pub fn param(name: &str, param_type: ParamType, required: bool, description: &str) -> ToolParam {
    ToolParam { name: name.to_string(), param_type, required, description: description.to_string(), enum_values: None }
}

/// Register every built-in non-UI tool (§4.4). Host capabilities that are
/// unavailable (battery, device info, clipboard) simply return an error
/// result rather than panicking — matches the "tool failure" taxonomy in
/// §7.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(
        def("get_current_time", "Current time, optionally in a given IANA timezone.", vec![param(
            "timezone",
            ParamType::String,
            false,
            "IANA timezone name, e.g. America/New_York. Defaults to UTC.",
        )]),
        Arc::new(|args| {
            Box::pin(async move {
                let tz = args.get("timezone").and_then(|v| v.as_str()).unwrap_or("UTC");
                let now = chrono::Utc::now();
                Ok(format!("{} {}", now.format("%H:%M:%S"), tz))
            })
        }),
    );

    registry.register(def("get_current_date", "Current calendar date (UTC).", vec![]), Arc::new(|_args| {
        Box::pin(async move { Ok(chrono::Utc::now().format("%Y-%m-%d").to_string()) })
    }));

    registry.register(def("get_battery_level", "Device battery percentage.", vec![]), Arc::new(|_args| {
        Box::pin(async move { Err("battery level not available on this host".to_string()) })
    }));

    registry.register(def("get_device_info", "Device model and OS version.", vec![]), Arc::new(|_args| {
        Box::pin(async move { Err("device info not available on this host".to_string()) })
    }));

    registry.register(def("get_clipboard", "Current clipboard text contents.", vec![]), Arc::new(|_args| {
        Box::pin(async move { Err("clipboard access not available on this host".to_string()) })
    }));

    registry.register(
        def("math_calculate", "Evaluate an arithmetic expression (+ - * / parens).", vec![param(
            "expression",
            ParamType::String,
            true,
            "e.g. (3 + 4) * 2",
        )]),
        Arc::new(|args| {
            Box::pin(async move {
                let expr = args.get("expression").and_then(|v| v.as_str()).ok_or("missing expression")?;
                evaluate_expression(expr).map(|n| n.to_string())
            })
        }),
    );

    registry.register(
        def("unit_convert", "Convert a value between units (temperature, length, weight).", vec![
            param("value", ParamType::Number, true, "numeric value to convert"),
            param("from_unit", ParamType::String, true, "source unit, e.g. celsius, km, lb"),
            param("to_unit", ParamType::String, true, "target unit, e.g. fahrenheit, mi, kg"),
        ]),
        Arc::new(|args| {
            Box::pin(async move {
                let value = args.get("value").and_then(|v| v.as_f64()).ok_or("missing value")?;
                let from = args.get("from_unit").and_then(|v| v.as_str()).ok_or("missing from_unit")?;
                let to = args.get("to_unit").and_then(|v| v.as_str()).ok_or("missing to_unit")?;
                convert_units(value, from, to).map(|n| n.to_string())
            })
        }),
    );

    registry.register(
        def("get_weather", "Current weather forecast for a coordinate.", vec![
            param("lat", ParamType::Number, true, "latitude"),
            param("lon", ParamType::Number, true, "longitude"),
            param("name", ParamType::String, false, "display name for the location"),
        ]),
        Arc::new(|args| {
            Box::pin(async move {
                let lat = args.get("lat").and_then(|v| v.as_f64()).ok_or("missing lat")?;
                let lon = args.get("lon").and_then(|v| v.as_f64()).ok_or("missing lon")?;
                let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("location");
                fetch_weather(lat, lon, name).await
            })
        }),
    );
}

async fn fetch_weather(lat: f64, lon: f64, name: &str) -> Result<String, String> {
    let url = format!(
        "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}&current_weather=true"
    );
    let resp = reqwest::get(&url).await.map_err(|e| format!("weather request failed: {e}"))?;
    let value: serde_json::Value = resp.json().await.map_err(|e| format!("weather response malformed: {e}"))?;
    let temp = value["current_weather"]["temperature"].as_f64().ok_or("no temperature in response")?;
    let code = value["current_weather"]["weathercode"].as_u64().unwrap_or(0);
    Ok(format!("{name}: {temp}°C, {}", weather_code_description(code)))
}

fn weather_code_description(code: u64) -> &'static str {
    match code {
        0 => "clear sky",
        1 | 2 | 3 => "partly cloudy",
        45 | 48 => "fog",
        51 | 53 | 55 => "drizzle",
        61 | 63 | 65 => "rain",
        71 | 73 | 75 => "snow",
        80 | 81 | 82 => "rain showers",
        95 => "thunderstorm",
        _ => "unknown conditions",
    }
}

fn convert_units(value: f64, from: &str, to: &str) -> Result<f64, String> {
    let from = from.to_lowercase();
    let to = to.to_lowercase();
    match (from.as_str(), to.as_str()) {
        ("celsius", "fahrenheit") => Ok(value * 9.0 / 5.0 + 32.0),
        ("fahrenheit", "celsius") => Ok((value - 32.0) * 5.0 / 9.0),
        ("celsius", "kelvin") => Ok(value + 273.15),
        ("kelvin", "celsius") => Ok(value - 273.15),
        ("km", "mi") => Ok(value * 0.621371),
        ("mi", "km") => Ok(value / 0.621371),
        ("m", "ft") => Ok(value * 3.28084),
        ("ft", "m") => Ok(value / 3.28084),
        ("kg", "lb") => Ok(value * 2.20462),
        ("lb", "kg") => Ok(value / 2.20462),
        _ if from == to => Ok(value),
        _ => Err(format!("unsupported conversion: {from} -> {to}")),
    }
}

/// Recursive-descent evaluator for `+ - * / ( )` with unary sign,
/// per §4.4.
fn evaluate_expression(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens in expression".to_string());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num = num_str.parse::<f64>().map_err(|_| format!("bad number: {num_str}"))?;
                tokens.push(Token::Number(num));
            }
            other => return Err(format!("unexpected character: {other}")),
        }
    }
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut value = self.parse_term()?;
        while let Some(tok) = self.peek() {
            match tok {
                Token::Plus => {
                    self.advance();
                    value += self.parse_term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, String> {
        let mut value = self.parse_unary()?;
        while let Some(tok) = self.peek() {
            match tok {
                Token::Star => {
                    self.advance();
                    value *= self.parse_unary()?;
                }
                Token::Slash => {
                    self.advance();
                    let divisor = self.parse_unary()?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected closing paren".to_string()),
                }
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_calculate_respects_precedence_and_parens() {
        assert_eq!(evaluate_expression("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate_expression("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate_expression("-5 + 2").unwrap(), -3.0);
    }

    #[test]
    fn math_calculate_rejects_division_by_zero() {
        assert!(evaluate_expression("1 / 0").is_err());
    }

    #[test]
    fn unit_convert_handles_temperature_and_length() {
        assert!((convert_units(0.0, "celsius", "fahrenheit").unwrap() - 32.0).abs() < 1e-9);
        assert!((convert_units(1.0, "km", "mi").unwrap() - 0.621371).abs() < 1e-6);
    }

    #[test]
    fn unit_convert_rejects_unsupported_pair() {
        assert!(convert_units(1.0, "celsius", "km").is_err());
    }

    #[test]
    fn is_ui_tool_matches_prefix_only() {
        assert!(is_ui_tool("ui_tap"));
        assert!(!is_ui_tool("get_current_time"));
    }

    #[tokio::test]
    async fn registry_dispatches_registered_tool() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        let call = ToolCall { id: "1".to_string(), name: "get_current_date".to_string(), arguments: HashMap::new() };
        let result = registry.dispatch(&call).await;
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn registry_reports_unknown_tool_as_error() {
        let registry = ToolRegistry::new();
        let call = ToolCall { id: "1".to_string(), name: "nonexistent".to_string(), arguments: HashMap::new() };
        let result = registry.dispatch(&call).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn ui_tool_call_short_circuits_before_loop_body() {
        let registry = ToolRegistry::new();
        let call = ToolCall { id: "1".to_string(), name: "ui_tap".to_string(), arguments: HashMap::new() };
        let initial = Decision::ToolCalls(vec![call.clone()]);
        let requery: Box<RequeryFn<'static>> =
            Box::new(|_calls, _results| Box::pin(async { Ok(Decision::ui(UiAction::Wait)) }));
        let outcome = run_tool_loop(initial, &registry, &*requery, |_, _| {}).await;
        assert!(matches!(outcome, ToolLoopOutcome::UiShortCircuit(c) if c.name == "ui_tap"));
    }
}
