//! Core data model shared by every ACC component: the closed `UiAction`
//! vocabulary, the tagged `Decision` sum type, tool schemas, and the
//! append-only `ActionRecord`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The closed set of atomic UI effects the Orchestrator may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiAction {
    Tap,
    Type,
    Enter,
    Swipe,
    Long,
    Back,
    Home,
    Open,
    Url,
    Search,
    Notif,
    Quick,
    Screenshot,
    Wait,
    Done,
}

impl UiAction {
    /// Parse from a canonical or short-alias action word. Returns `None` for
    /// anything not in the vocabulary (the caller is expected to fall back
    /// to a heuristic or `wait`).
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_lowercase().as_str() {
            "tap" => Self::Tap,
            "type" => Self::Type,
            "enter" => Self::Enter,
            "swipe" => Self::Swipe,
            "long" | "long_press" => Self::Long,
            "back" => Self::Back,
            "home" => Self::Home,
            "open" | "open_app" | "launch_app" => Self::Open,
            "url" | "open_url" => Self::Url,
            "search" | "web_search" => Self::Search,
            "notif" | "open_notifications" | "notifications" => Self::Notif,
            "quick" | "open_quick_settings" | "quick_settings" => Self::Quick,
            "screenshot" => Self::Screenshot,
            "wait" => Self::Wait,
            "done" => Self::Done,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::Type => "type",
            Self::Enter => "enter",
            Self::Swipe => "swipe",
            Self::Long => "long",
            Self::Back => "back",
            Self::Home => "home",
            Self::Open => "open",
            Self::Url => "url",
            Self::Search => "search",
            Self::Notif => "notif",
            Self::Quick => "quick",
            Self::Screenshot => "screenshot",
            Self::Wait => "wait",
            Self::Done => "done",
        }
    }
}

/// Swipe direction. Appears only alongside `UiAction::Swipe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_lowercase().as_str() {
            "u" | "up" => Self::Up,
            "d" | "down" => Self::Down,
            "l" | "left" => Self::Left,
            "r" | "right" => Self::Right,
            _ => return None,
        })
    }

    pub fn letter(&self) -> char {
        match self {
            Self::Up => 'u',
            Self::Down => 'd',
            Self::Left => 'l',
            Self::Right => 'r',
        }
    }
}

/// One observable interactive node from the host accessibility tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenElement {
    /// Stable within one snapshot, 0-based, dense.
    pub index: usize,
    pub label: String,
    pub resource_id: Option<String>,
    pub class_hint: String,
    pub center_x: i32,
    pub center_y: i32,
    pub clickable: bool,
    pub editable: bool,
    pub checkable: bool,
    pub checked: bool,
    pub enabled: bool,
    pub suggested_action: SuggestedAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Tap,
    Type,
    Toggle,
    Read,
}

/// A bounded, indexed snapshot of the current screen.
#[derive(Debug, Clone, Default)]
pub struct Screen {
    pub elements: Vec<ScreenElement>,
    pub index_map: HashMap<usize, (i32, i32)>,
    pub compact_text: String,
}

impl Screen {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn coords_for(&self, index: usize) -> Option<(i32, i32)> {
        self.index_map.get(&index).copied()
    }

    pub fn label_for(&self, index: usize) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.label.as_str())
    }

    pub fn first_editable(&self) -> Option<&ScreenElement> {
        self.elements.iter().find(|e| e.editable)
    }
}

/// One tool invocation requested by the Decider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: HashMap<String, ScalarValue>,
}

/// A JSON scalar — the argument value type for tool calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Int(i64),
    Number(f64),
    Bool(bool),
    Null,
}

impl ScalarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Describes one tool the Decider may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

/// The result of executing one `ToolCall`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub result: String,
    pub is_error: bool,
}

/// The canonical, tagged decision the Decider resolves raw model output into.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ui {
        action: UiAction,
        index: Option<usize>,
        text: Option<String>,
        direction: Option<Direction>,
        url: Option<String>,
        query: Option<String>,
        app: Option<String>,
        reason: Option<String>,
    },
    ToolCalls(Vec<ToolCallShape>),
    TextAnswer(String),
    Error(String),
}

/// `ToolCall` without the `PartialEq`-breaking `HashMap` ordering concerns —
/// kept as a distinct alias so `Decision` can derive `PartialEq` for tests.
pub type ToolCallShape = ToolCall;

impl PartialEq for ToolCall {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name && self.arguments == other.arguments
    }
}

impl Decision {
    pub fn ui(action: UiAction) -> Self {
        Self::Ui {
            action,
            index: None,
            text: None,
            direction: None,
            url: None,
            query: None,
            app: None,
            reason: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Ui { action: UiAction::Done, .. })
    }
}

/// One entry in the append-only action history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub action: String,
    pub target: Option<String>,
    pub result: Option<String>,
    pub success: bool,
}

/// Outbound events emitted by the Orchestrator (§4.6 / §6).
#[derive(Debug, Clone)]
pub enum Event {
    Log(String),
    Step { step: u32, action: String, result: String },
    Speak(String),
    Done(String),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_action_round_trips_through_parse_and_as_str() {
        for a in [
            UiAction::Tap,
            UiAction::Type,
            UiAction::Enter,
            UiAction::Swipe,
            UiAction::Long,
            UiAction::Back,
            UiAction::Home,
            UiAction::Open,
            UiAction::Url,
            UiAction::Search,
            UiAction::Notif,
            UiAction::Quick,
            UiAction::Screenshot,
            UiAction::Wait,
            UiAction::Done,
        ] {
            assert_eq!(UiAction::parse(a.as_str()), Some(a));
        }
    }

    #[test]
    fn direction_accepts_both_word_and_letter() {
        assert_eq!(Direction::parse("up"), Some(Direction::Up));
        assert_eq!(Direction::parse("u"), Some(Direction::Up));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn screen_snapshot_with_zero_cap_is_empty() {
        let screen = Screen::empty();
        assert_eq!(screen.elements.len(), 0);
        assert!(screen.is_empty());
    }
}
