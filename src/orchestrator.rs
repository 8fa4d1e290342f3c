//! Orchestrator (C6, §4.6): the outer step loop. Shortcut/pre-launch,
//! optional planning, per-step prompt/decide/dispatch, budget and
//! cancellation checks, event emission.
//!
//! Grounded on `oneshot.rs`'s `run_oneshot()` — the bounded per-run loop
//! shape (perceive → build prompt → call the model → parse → dispatch →
//! settle → record) and its step-level `tracing::info!` logging carry
//! over directly; the decision semantics (UiAction vocabulary, tool
//! sub-loop, loop/failure-recovery prompt selection) are the spec's, not
//! the base crate's workspace/session-entangled ones.

use crate::action::{resolve_params, ActionParams, ActionSink};
use crate::config::AccConfig;
use crate::decider::{build_prompt, Decider, DeciderErrorClass, Plan, PromptContext, PromptVariant};
use crate::history::{History, LoopDetector};
use crate::screen::ScreenSource;
use crate::tools::{execute_ui_tool, run_tool_loop, ToolLoopOutcome, ToolRegistry};
use crate::types::{ActionRecord, Decision, Event, UiAction};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Cooperative cancel flag (§5). Cloning shares the same underlying
/// atomic so a caller can hold one half and call `request_stop()` while
/// the run loop holds the other.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keyword → app-name shortcuts for the pre-launch heuristic (§4.6).
const PRELAUNCH_APPS: &[(&str, &str)] = &[
    ("youtube", "YouTube"),
    ("chrome", "Chrome"),
    ("whatsapp", "WhatsApp"),
    ("gmail", "Gmail"),
    ("spotify", "Spotify"),
    ("maps", "Maps"),
    ("clock", "Clock"),
    ("timer", "Clock"),
    ("alarm", "Clock"),
    ("camera", "Camera"),
    ("settings", "Settings"),
];

pub struct Orchestrator {
    config: AccConfig,
    screen_source: Arc<dyn ScreenSource>,
    action_sink: Arc<dyn ActionSink>,
    remote: Option<Arc<dyn Decider>>,
    local: Option<Arc<dyn Decider>>,
    tools: ToolRegistry,
    events: UnboundedSender<Event>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        config: AccConfig,
        screen_source: Arc<dyn ScreenSource>,
        action_sink: Arc<dyn ActionSink>,
        remote: Option<Arc<dyn Decider>>,
        local: Option<Arc<dyn Decider>>,
        tools: ToolRegistry,
        events: UnboundedSender<Event>,
        cancel: CancelToken,
    ) -> Self {
        Self { config, screen_source, action_sink, remote, local, tools, events, cancel }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Run one bounded goal-directed session to completion.
    pub async fn run(&self, goal: &str) -> anyhow::Result<()> {
        if self.remote.is_none() && self.local.is_none() {
            self.emit(Event::Error("no decider backend configured".to_string()));
            anyhow::bail!("configuration fatal: no decider backend configured");
        }
        if self.cancel.is_stopped() {
            self.emit(Event::Error("stop requested before start".to_string()));
            anyhow::bail!("configuration fatal: stop requested before start");
        }

        self.pre_launch(goal).await;
        let plan = self.build_plan(goal).await;

        let mut history = History::new();
        let detector = LoopDetector::new();
        let start = Instant::now();
        let max_duration = Duration::from_secs(self.config.orchestrator.max_duration_secs);
        let step_delay = Duration::from_millis(self.config.orchestrator.step_delay_ms);
        let mut plan = plan;
        let mut step: u32 = 0;

        loop {
            if self.cancel.is_stopped() {
                self.emit(Event::Log("cancelled".to_string()));
                return Ok(());
            }
            if step >= self.config.orchestrator.max_steps {
                self.emit(Event::Done("Max steps reached".to_string()));
                return Ok(());
            }
            if start.elapsed() >= max_duration {
                self.emit(Event::Done("Max duration reached".to_string()));
                return Ok(());
            }

            let screen = self
                .screen_source
                .snapshot(self.config.screen.max_elements, self.config.screen.max_text_length)
                .await;
            if screen.is_empty() {
                self.emit(Event::Log("screen unavailable, waiting".to_string()));
                tokio::time::sleep(step_delay).await;
                continue;
            }

            let repetitive = match history.last() {
                Some(last) => detector.is_repetitive(&history, &last.action, last.target.as_deref()),
                None => false,
            };
            let variant = if repetitive {
                self.emit(Event::Log("Loop detected, adding recovery prompt".to_string()));
                PromptVariant::LoopRecovery
            } else if detector.had_recent_failure(&history) {
                self.emit(Event::Log("Recent failure, adding recovery prompt".to_string()));
                PromptVariant::FailureRecovery
            } else {
                PromptVariant::Normal
            };

            let previous_actions = history.format_for_prompt();
            let last_result = history.last_action_result();
            let ctx = PromptContext {
                goal,
                screen_text: &screen.compact_text,
                last_action_result: last_result.as_deref(),
                previous_actions: Some(previous_actions.as_str()),
                plan: plan.as_ref(),
            };
            let prompt = build_prompt(variant, &ctx);

            let want_vision = self.remote.as_ref().is_some_and(|r| r.supports_vision());
            let screenshot = if want_vision { self.screen_source.screenshot_base64().await } else { None };
            let (decision, backend) = self.decide_with_fallback(&prompt, screenshot.as_deref()).await;

            let resolved = self.run_tools_if_any(decision, &screen, &prompt, backend, &mut history, step + 1).await;

            step += 1;
            let (action_name, target, result_msg, success, is_done) = match resolved {
                ResolvedDecision::AlreadyExecuted { action_name, target, message, success, is_done } => {
                    (action_name, target, message, success, is_done)
                }
                ResolvedDecision::Pending(decision) => self.dispatch(decision, &screen).await,
            };

            history.push(ActionRecord {
                step,
                action: action_name.clone(),
                target: target.clone(),
                result: Some(result_msg.clone()),
                success,
            });

            self.emit(Event::Step { step, action: action_name.clone(), result: result_msg.clone() });
            info!("Step {}: {} ({:?}) -> {} [{}ms]", step, action_name, target, result_msg, step_delay.as_millis());

            if success && action_name != "wait" {
                if let Some(ref mut p) = plan {
                    if p.current_step + 1 < p.steps.len() {
                        p.current_step += 1;
                    }
                }
            }

            if is_done {
                self.emit(Event::Done("Goal achieved".to_string()));
                return Ok(());
            }

            tokio::time::sleep(step_delay).await;
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Scan the goal for an app keyword and launch it directly before the
    /// step loop starts (§4.6). Never terminal; failures are swallowed.
    async fn pre_launch(&self, goal: &str) {
        let lower = goal.to_lowercase();
        let Some((_, app)) = PRELAUNCH_APPS.iter().find(|(kw, _)| lower.contains(kw)) else {
            return;
        };
        self.emit(Event::Log(format!("pre-launch: opening {app}")));
        let outcome = self
            .action_sink
            .execute(ActionParams {
                action: UiAction::Open,
                coords: None,
                text: None,
                direction: None,
                url: None,
                query: extract_search_query(&lower, app),
                app: Some(app.to_string()),
            })
            .await;
        if !outcome.success {
            self.emit(Event::Log(format!("pre-launch failed: {}", outcome.message)));
        }
    }

    /// One-shot planning call when a remote decider is configured (§4.6).
    /// Failure is non-fatal — the run proceeds without a plan.
    async fn build_plan(&self, goal: &str) -> Option<Plan> {
        let remote = self.remote.as_ref()?;
        let prompt = format!(
            "GOAL: {goal}\nRespond with a JSON object {{\"steps\": [\"...\"], \"success_criteria\": \"...\"}} \
             describing a short plan to achieve the goal."
        );
        match remote.decide(&prompt, &[], None).await {
            Ok(Decision::TextAnswer(text)) => parse_plan_json(&text),
            _ => None,
        }
    }

    /// Remote (with vision if configured) → remote text → local,
    /// falling back on each failure (§7); if every backend fails,
    /// fabricate `Decision::ui(Wait)` rather than propagate an error.
    /// Classifies each failure via `DeciderErrorClass` so a non-retryable
    /// remote error (e.g. a malformed request on our end) doesn't waste a
    /// local call that would fail the same way. Also returns the backend
    /// that produced the decision, so a subsequent tool re-query can
    /// continue the same conversation rather than starting a fresh one.
    async fn decide_with_fallback(&self, prompt: &str, image: Option<&str>) -> (Decision, Option<Arc<dyn Decider>>) {
        if let Some(remote) = &self.remote {
            let tools = self.tools.catalog();
            match remote.decide(prompt, &tools, image).await {
                Ok(decision) => return (decision, Some(remote.clone())),
                Err(e) => {
                    let class = DeciderErrorClass::classify(&e.to_string());
                    self.emit(Event::Log(format!("remote decider failed ({class:?}), falling back: {e}")));
                    if !class.is_retryable() {
                        self.emit(Event::Log("remote error not retryable, skipping local fallback".to_string()));
                        return (Decision::ui(UiAction::Wait), None);
                    }
                }
            }
        }
        if let Some(local) = &self.local {
            let tools = self.tools.catalog();
            match local.decide(prompt, &tools, None).await {
                Ok(decision) => return (decision, Some(local.clone())),
                Err(e) => {
                    let class = DeciderErrorClass::classify(&e.to_string());
                    self.emit(Event::Log(format!("local decider failed ({class:?}): {e}")));
                }
            }
        }
        (Decision::ui(UiAction::Wait), None)
    }

    async fn run_tools_if_any(
        &self,
        decision: Decision,
        screen: &crate::types::Screen,
        prompt: &str,
        backend: Option<Arc<dyn Decider>>,
        history: &mut History,
        step: u32,
    ) -> ResolvedDecision {
        let Decision::ToolCalls(_) = &decision else {
            return ResolvedDecision::Pending(decision);
        };
        let registry = &self.tools;
        let requery: Box<crate::tools::RequeryFn<'static>> = {
            let backend = backend.clone();
            let remote = self.remote.clone();
            let local = self.local.clone();
            let tools_catalog = self.tools.catalog();
            let prompt = prompt.to_string();
            Box::new(move |calls: &[crate::types::ToolCall], results: &[crate::types::ToolResult]| {
                let backend = backend.clone();
                let remote = remote.clone();
                let local = local.clone();
                let tools_catalog = tools_catalog.clone();
                let prompt = prompt.clone();
                let calls = calls.to_vec();
                let results = results.to_vec();
                Box::pin(async move {
                    if let Some(backend) = backend {
                        if let Ok(d) = backend.continue_after_tools(&prompt, &calls, &results, &tools_catalog).await {
                            return Ok(d);
                        }
                    }
                    if let Some(remote) = remote {
                        if let Ok(d) = remote.continue_after_tools(&prompt, &calls, &results, &tools_catalog).await {
                            return Ok(d);
                        }
                    }
                    if let Some(local) = local {
                        if let Ok(d) = local.continue_after_tools(&prompt, &calls, &results, &tools_catalog).await {
                            return Ok(d);
                        }
                    }
                    Ok(Decision::ui(UiAction::Wait))
                })
            })
        };

        let outcome = run_tool_loop(decision, registry, &*requery, |name, result| {
            history.push(ActionRecord {
                step,
                action: format!("tool:{name}"),
                target: None,
                result: Some(result.result.clone()),
                success: !result.is_error,
            });
        })
        .await;
        match outcome {
            // The UI tool call was already executed by the tool loop's
            // short-circuit contract (§4.4: "return the call to the
            // Orchestrator to execute as a single UI step") — execute it
            // here, once, and report the outcome directly rather than
            // re-resolving it as a pending Decision (which would dispatch
            // it a second time).
            ToolLoopOutcome::UiShortCircuit(call) => {
                match execute_ui_tool(&call, &*self.action_sink, screen).await {
                    Some(outcome) => {
                        let action_name = crate::tools::ui_tool_to_action_params(&call)
                            .map(|(a, _)| a)
                            .unwrap_or(UiAction::Wait);
                        ResolvedDecision::AlreadyExecuted {
                            action_name: action_name.as_str().to_string(),
                            target: None,
                            message: outcome.message,
                            success: outcome.success,
                            is_done: action_name == UiAction::Done,
                        }
                    }
                    None => ResolvedDecision::AlreadyExecuted {
                        action_name: "wait".to_string(),
                        target: None,
                        message: format!("unresolvable UI tool call: {}", call.name),
                        success: false,
                        is_done: false,
                    },
                }
            }
            ToolLoopOutcome::Resolved(decision) => ResolvedDecision::Pending(decision),
            ToolLoopOutcome::Overflow => ResolvedDecision::Pending(Decision::Error(
                "tool loop exceeded max iterations".to_string(),
            )),
        }
    }

    /// Resolve a pending `Decision` into one ActionSink call and return
    /// `(action_name, target, result_message, success, is_done)` for
    /// history recording (§4.6 step 7-8). `TextAnswer` with embedded JSON
    /// is re-parsed once into a `Ui` decision inline (not recursively —
    /// a second text answer just falls through to `wait`).
    async fn dispatch(
        &self,
        decision: Decision,
        screen: &crate::types::Screen,
    ) -> (String, Option<String>, String, bool, bool) {
        let decision = match decision {
            Decision::TextAnswer(text) => crate::decider::parse_decision_text(&text),
            other => other,
        };
        match decision {
            Decision::Ui { action, index, text, direction, url, query, app, .. } => {
                let target = action_target(action, index, &text, direction, &url, &query, &app, screen);
                let params = resolve_params(action, index, text, direction, url, query, app, screen);
                let outcome = self.action_sink.execute(params).await;
                let is_done = action == UiAction::Done;
                (action.as_str().to_string(), target, outcome.message, outcome.success, is_done)
            }
            Decision::TextAnswer(_) => {
                ("wait".to_string(), None, "non-actionable text response".to_string(), true, false)
            }
            Decision::Error(msg) => ("wait".to_string(), None, msg, true, false),
            Decision::ToolCalls(_) => {
                ("wait".to_string(), None, "unresolved tool calls".to_string(), true, false)
            }
        }
    }
}

/// Outcome of resolving a `Decision` through the tool sub-loop (§4.4):
/// either it still needs to go through `dispatch`, or a UI tool call was
/// already executed directly and its outcome is final.
enum ResolvedDecision {
    Pending(Decision),
    AlreadyExecuted { action_name: String, target: Option<String>, message: String, success: bool, is_done: bool },
}

fn action_target(
    action: UiAction,
    index: Option<usize>,
    text: &Option<String>,
    direction: Option<crate::types::Direction>,
    url: &Option<String>,
    query: &Option<String>,
    app: &Option<String>,
    screen: &crate::types::Screen,
) -> Option<String> {
    match action {
        UiAction::Tap | UiAction::Long => index.and_then(|i| screen.label_for(i)).map(|s| s.to_string()),
        UiAction::Type => text.clone(),
        UiAction::Swipe => direction.map(|d| d.letter().to_string()),
        UiAction::Url => url.clone(),
        UiAction::Search => query.clone(),
        UiAction::Open => app.clone(),
        _ => None,
    }
}

/// Extract a search query for YouTube/Spotify pre-launch per §4.6's
/// named patterns: `(play|watch|search(?: for)?) X on <app>` and
/// `<app>.*? (play|watch|find) X`.
fn extract_search_query(goal_lower: &str, app: &str) -> Option<String> {
    if !app.eq_ignore_ascii_case("YouTube") && !app.eq_ignore_ascii_case("Spotify") {
        return None;
    }
    let app_lower = app.to_lowercase();
    let pattern_a = Regex::new(&format!(
        r"(?:play|watch|search(?: for)?)\s+(.+?)\s+on\s+{}",
        regex::escape(&app_lower)
    ))
    .ok()?;
    if let Some(caps) = pattern_a.captures(goal_lower) {
        return caps.get(1).map(|m| m.as_str().trim().to_string());
    }
    let pattern_b = Regex::new(&format!(r"{}.*?(?:play|watch|find)\s+(.+)", regex::escape(&app_lower))).ok()?;
    if let Some(caps) = pattern_b.captures(goal_lower) {
        return caps.get(1).map(|m| m.as_str().trim().to_string());
    }
    None
}

fn parse_plan_json(text: &str) -> Option<Plan> {
    let json = crate::decider::extract_json(text)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    let steps: Vec<String> =
        value.get("steps")?.as_array()?.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
    if steps.is_empty() {
        return None;
    }
    let success_criteria = value.get("success_criteria").and_then(|v| v.as_str()).map(|s| s.to_string());
    Some(Plan { steps, success_criteria, current_step: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_search_query_handles_play_x_on_app_pattern() {
        let q = extract_search_query("play lofi beats on spotify", "Spotify");
        assert_eq!(q.as_deref(), Some("lofi beats"));
    }

    #[test]
    fn extract_search_query_returns_none_for_non_search_apps() {
        assert_eq!(extract_search_query("open gmail", "Gmail"), None);
    }

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_stopped());
        token.request_stop();
        token.request_stop();
        assert!(token.is_stopped());
    }

    #[test]
    fn parse_plan_json_extracts_steps_and_criteria() {
        let text = r#"{"steps": ["open app", "tap search"], "success_criteria": "video playing"}"#;
        let plan = parse_plan_json(text).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.success_criteria.as_deref(), Some("video playing"));
        assert_eq!(plan.current_step, 0);
    }

    #[test]
    fn parse_plan_json_rejects_empty_steps() {
        assert!(parse_plan_json(r#"{"steps": []}"#).is_none());
    }
}
