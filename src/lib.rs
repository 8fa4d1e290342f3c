//! Agent Control Core (ACC): the decision-execution loop driving a
//! mobile/desktop UI automation agent.
//!
//! Given a natural-language goal and a live accessibility-tree stream,
//! ACC produces a sequence of validated UI actions and halts on
//! completion, stall, or budget exhaustion. This crate exposes the core
//! as a library — `ScreenSource`/`ActionSink` ports, the `Decider`,
//! `ToolRegistry`, `History`/`LoopDetector`, and the `Orchestrator` that
//! ties them together — so a host binds concrete implementations and
//! drives one bounded run.

pub mod action;
pub mod config;
pub mod decider;
pub mod history;
pub mod orchestrator;
pub mod screen;
pub mod tools;
pub mod types;

pub use action::{ActionOutcome, ActionParams, ActionSink, AdbActionSink};
pub use config::AccConfig;
pub use decider::{Decider, LocalDecider, RemoteDecider};
pub use history::{History, LoopDetector};
pub use orchestrator::{CancelToken, Orchestrator};
pub use screen::{AdbScreenSource, ScreenSource};
pub use tools::{register_builtin_tools, ToolRegistry};
pub use types::{Decision, Event, Screen, ScreenElement, UiAction};
