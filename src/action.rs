//! ActionSink (C2, §4.2): execute one atomic effect against the host UI
//! per call and report success/message.
//!
//! Grounded on `action/mod.rs`'s ADB dispatch style (`do_action`/`adb`
//! helper/`wait_for_settle`), stripped of the RED/YELLOW/GREEN
//! confirmation gate (no spec analog — replaced by the blocklist below)
//! and remapped onto the closed `UiAction` vocabulary, including the
//! fuzzy app-matching ladder the teacher never implemented.

use crate::types::{Direction, Screen, UiAction};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::debug;

/// Result of one `ActionSink::execute` call.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

/// Parameters for one dispatched action, resolved against the current
/// `Screen` by the Orchestrator before the call (index → coordinates).
#[derive(Debug, Clone)]
pub struct ActionParams {
    pub action: UiAction,
    pub coords: Option<(i32, i32)>,
    pub text: Option<String>,
    pub direction: Option<Direction>,
    pub url: Option<String>,
    pub query: Option<String>,
    pub app: Option<String>,
}

/// Outbound port: the host supplies an implementation backed by ADB,
/// a platform automation API, or a fake for tests.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn execute(&self, params: ActionParams) -> ActionOutcome;
}

/// A launcher entry considered during app fuzzy-matching.
#[derive(Debug, Clone)]
pub struct AppEntry {
    pub label: String,
    pub package: String,
}

/// Packages that must never be launched by `open`, regardless of score.
const APP_BLOCKLIST: &[&str] = &[
    "com.google.android.googlequicksearchbox",
    "com.android.systemui",
    "com.android.settings",
    "com.google.android.apps.assistant",
];

const SEARCH_URL: &str = "https://www.google.com/search?q=";

pub struct AdbActionSink {
    adb_device: Option<String>,
}

impl AdbActionSink {
    pub fn new(adb_device: Option<String>) -> Self {
        Self { adb_device }
    }

    fn adb_command(&self) -> Command {
        let mut cmd = Command::new("adb");
        if let Some(ref d) = self.adb_device {
            cmd.args(["-s", d]);
        }
        cmd
    }

    async fn adb(&self, args: &[&str]) -> Result<String, String> {
        let mut cmd = self.adb_command();
        cmd.args(args);
        let out = cmd.output().await.map_err(|e| format!("failed to spawn adb: {e}"))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&out.stderr).trim().to_string())
        }
    }

    async fn tap_point(&self, x: i32, y: i32) -> Result<(), String> {
        self.adb(&["shell", "input", "tap", &x.to_string(), &y.to_string()])
            .await
            .map(|_| ())
    }

    async fn long_press_point(&self, x: i32, y: i32) -> Result<(), String> {
        self.adb(&[
            "shell",
            "input",
            "swipe",
            &x.to_string(),
            &y.to_string(),
            &x.to_string(),
            &y.to_string(),
            "550",
        ])
        .await
        .map(|_| ())
    }

    async fn type_text(&self, text: &str) -> Result<(), String> {
        let escaped = text.replace(' ', "%s").replace('\'', "\\'");
        self.adb(&["shell", "input", "text", &escaped]).await.map(|_| ())
    }

    async fn key_event(&self, code: &str) -> Result<(), String> {
        self.adb(&["shell", "input", "keyevent", code]).await.map(|_| ())
    }

    async fn swipe(&self, direction: Direction) -> Result<(), String> {
        let (w, h) = self.screen_resolution().await.unwrap_or((1080, 2400));
        let (x1, y1, x2, y2) = match direction {
            Direction::Up => (w / 2, (h * 3) / 4, w / 2, h / 4),
            Direction::Down => (w / 2, h / 4, w / 2, (h * 3) / 4),
            Direction::Left => ((w * 3) / 4, h / 2, w / 4, h / 2),
            Direction::Right => (w / 4, h / 2, (w * 3) / 4, h / 2),
        };
        self.adb(&[
            "shell",
            "input",
            "swipe",
            &x1.to_string(),
            &y1.to_string(),
            &x2.to_string(),
            &y2.to_string(),
            "300",
        ])
        .await
        .map(|_| ())
    }

    async fn screen_resolution(&self) -> Option<(i32, i32)> {
        let out = self.adb(&["shell", "wm", "size"]).await.ok()?;
        let line = out.lines().find(|l| l.contains("Physical size"))?;
        let dims = line.split(':').nth(1)?.trim();
        let mut parts = dims.split('x');
        let w = parts.next()?.trim().parse().ok()?;
        let h = parts.next()?.trim().parse().ok()?;
        Some((w, h))
    }

    async fn list_apps(&self) -> Vec<AppEntry> {
        let Ok(out) = self.adb(&["shell", "pm", "list", "packages", "-3"]).await else {
            return Vec::new();
        };
        let packages: Vec<String> =
            out.lines().filter_map(|l| l.strip_prefix("package:")).map(|s| s.to_string()).collect();
        let mut apps = Vec::with_capacity(packages.len());
        for pkg in packages {
            let label = self.app_label(&pkg).await.unwrap_or_else(|| label_from_package(&pkg));
            apps.push(AppEntry { label, package: pkg });
        }
        apps
    }

    /// Resolve a package's human-visible label via `dumpsys package`
    /// (`nonLocalizedLabel=`). Returns `None` when the label is absent or
    /// resource-indirected (`null`), letting the caller fall back to a
    /// package-name-derived label.
    async fn app_label(&self, pkg: &str) -> Option<String> {
        let out = self.adb(&["shell", "dumpsys", "package", pkg]).await.ok()?;
        parse_non_localized_label(&out)
    }
}

fn parse_non_localized_label(dumpsys_output: &str) -> Option<String> {
    let line = dumpsys_output.lines().find(|l| l.contains("nonLocalizedLabel="))?;
    let start = line.find("nonLocalizedLabel=")? + "nonLocalizedLabel=".len();
    let rest = line[start..].trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    let label = rest[..end].trim();
    if label.is_empty() || label.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(label.to_string())
    }
}

#[async_trait]
impl ActionSink for AdbActionSink {
    async fn execute(&self, params: ActionParams) -> ActionOutcome {
        match params.action {
            UiAction::Tap => match params.coords {
                Some((x, y)) => match self.tap_point(x, y).await {
                    Ok(_) => ActionOutcome::ok(format!("tapped ({x},{y})")),
                    Err(e) => ActionOutcome::fail(e),
                },
                None => ActionOutcome::fail("tap requires an index that resolved to coordinates"),
            },
            UiAction::Long => match params.coords {
                Some((x, y)) => match self.long_press_point(x, y).await {
                    Ok(_) => ActionOutcome::ok(format!("long-pressed ({x},{y})")),
                    Err(e) => ActionOutcome::fail(e),
                },
                None => ActionOutcome::fail("long requires an index that resolved to coordinates"),
            },
            UiAction::Type => match params.text {
                Some(text) if !text.is_empty() => match self.type_text(&text).await {
                    Ok(_) => ActionOutcome::ok(format!("typed \"{text}\"")),
                    Err(e) => ActionOutcome::fail(e),
                },
                _ => ActionOutcome::fail("no text to type"),
            },
            UiAction::Enter => match self.key_event("66").await {
                Ok(_) => ActionOutcome::ok("submitted via enter"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Swipe => match params.direction {
                Some(d) => match self.swipe(d).await {
                    Ok(_) => ActionOutcome::ok(format!("swiped {}", d.letter())),
                    Err(e) => ActionOutcome::fail(e),
                },
                None => ActionOutcome::fail("swipe requires a direction"),
            },
            UiAction::Back => match self.key_event("4").await {
                Ok(_) => ActionOutcome::ok("went back"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Home => match self.key_event("3").await {
                Ok(_) => ActionOutcome::ok("went home"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Notif => match self.adb(&["shell", "cmd", "statusbar", "expand-notifications"]).await {
                Ok(_) => ActionOutcome::ok("opened notifications"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Quick => match self.adb(&["shell", "cmd", "statusbar", "expand-settings"]).await {
                Ok(_) => ActionOutcome::ok("opened quick settings"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Open => match params.app {
                Some(app) => {
                    let catalog = self.list_apps().await;
                    match best_app_match(&app, &catalog) {
                        Some(entry) => {
                            match self
                                .adb(&[
                                    "shell",
                                    "monkey",
                                    "-p",
                                    &entry.package,
                                    "-c",
                                    "android.intent.category.LAUNCHER",
                                    "1",
                                ])
                                .await
                            {
                                Ok(_) => ActionOutcome::ok(format!("opened {}", entry.package)),
                                Err(e) => ActionOutcome::fail(e),
                            }
                        }
                        None => ActionOutcome::fail(format!("no app matched \"{app}\"")),
                    }
                }
                None => ActionOutcome::fail("open requires an app name"),
            },
            UiAction::Url => match params.url {
                Some(u) => match self
                    .adb(&["shell", "am", "start", "-a", "android.intent.action.VIEW", "-d", &u])
                    .await
                {
                    Ok(_) => ActionOutcome::ok(format!("opened url {u}")),
                    Err(e) => ActionOutcome::fail(e),
                },
                None => ActionOutcome::fail("url requires a target"),
            },
            UiAction::Search => match params.query {
                Some(q) => {
                    let url = format!("{SEARCH_URL}{}", urlencode(&q));
                    match self
                        .adb(&["shell", "am", "start", "-a", "android.intent.action.VIEW", "-d", &url])
                        .await
                    {
                        Ok(_) => ActionOutcome::ok(format!("searched \"{q}\"")),
                        Err(e) => ActionOutcome::fail(e),
                    }
                }
                None => ActionOutcome::fail("search requires a query"),
            },
            UiAction::Wait => {
                sleep(Duration::from_millis(crate::config::STEP_DELAY_MS)).await;
                ActionOutcome::ok("waited")
            }
            UiAction::Screenshot => match self.adb(&["exec-out", "screencap", "-p"]).await {
                Ok(_) => ActionOutcome::ok("captured screenshot"),
                Err(e) => ActionOutcome::fail(e),
            },
            UiAction::Done => ActionOutcome::ok("done"),
        }
    }
}

fn label_from_package(pkg: &str) -> String {
    pkg.rsplit('.').next().unwrap_or(pkg).to_string()
}

fn normalize(s: &str) -> String {
    s.to_lowercase().chars().filter(|c| c.is_alphanumeric()).collect()
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '~' {
                c.to_string()
            } else if c == ' ' {
                "+".to_string()
            } else {
                let mut buf = [0u8; 4];
                c.encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| format!("%{:02X}", b))
                    .collect()
            }
        })
        .collect()
}

/// The §4.2 app-matching ladder. Returns `None` if no entry scores above
/// zero or every candidate is blocklisted.
pub fn best_app_match<'a>(target: &str, catalog: &'a [AppEntry]) -> Option<&'a AppEntry> {
    let target_norm = normalize(target);
    if target_norm.is_empty() {
        return None;
    }
    let target_words: Vec<&str> = target.to_lowercase().split_whitespace().collect();

    let mut best: Option<(&AppEntry, u32)> = None;
    for entry in catalog {
        if APP_BLOCKLIST.contains(&entry.package.as_str()) {
            continue;
        }
        let label_norm = normalize(&entry.label);
        let package_norm = normalize(&entry.package);
        let is_music_ambiguous = |s: &str| s.contains("music");

        let score: u32 = if label_norm == target_norm {
            100
        } else if label_norm.starts_with(&target_norm) {
            80
        } else if target_words.iter().any(|w| normalize(w) == label_norm) {
            75
        } else if package_norm.ends_with(&target_norm) {
            70
        } else if label_norm.contains(&target_norm) && !is_music_ambiguous(&target_norm) {
            60
        } else if package_norm.contains(&target_norm) && !is_music_ambiguous(&target_norm) {
            50
        } else if target_words.iter().any(|w| package_norm.contains(&normalize(w))) {
            45
        } else if label_norm.contains(&target_norm) {
            30
        } else if package_norm.contains(&target_norm) {
            20
        } else {
            0
        };

        if score == 0 {
            continue;
        }

        match &best {
            None => best = Some((entry, score)),
            Some((cur, cur_score)) => {
                if score > *cur_score || (score == *cur_score && entry.package < cur.package) {
                    best = Some((entry, score));
                }
            }
        }
    }
    best.map(|(e, _)| e)
}

/// Resolve an `(action, index, text, direction, url, query, app)` tuple
/// from a `Decision::Ui` against the current screen into dispatch-ready
/// `ActionParams`. Lives here (not in `types.rs`) since it is
/// ActionSink-facing resolution logic, not a data shape.
pub fn resolve_params(
    action: UiAction,
    index: Option<usize>,
    text: Option<String>,
    direction: Option<Direction>,
    url: Option<String>,
    query: Option<String>,
    app: Option<String>,
    screen: &Screen,
) -> ActionParams {
    let coords = index.and_then(|i| screen.coords_for(i));
    if index.is_some() && coords.is_none() {
        debug!("index {:?} did not resolve to any element on current screen", index);
    }
    ActionParams { action, coords, text, direction, url, query, app }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, package: &str) -> AppEntry {
        AppEntry { label: label.to_string(), package: package.to_string() }
    }

    #[test]
    fn parses_non_localized_label_from_dumpsys_output() {
        let dump = "Package [com.spotify.music] (abcd1234):\n  userId=10123\n  \
                    applicationInfo=ApplicationInfo{1234 com.spotify.music}\n  \
                    labelRes=0x7f120001 nonLocalizedLabel=Spotify icon=0x7f0a0001\n  flags=[ HAS_CODE ]";
        assert_eq!(parse_non_localized_label(dump).as_deref(), Some("Spotify"));
    }

    #[test]
    fn falls_back_when_label_is_resource_indirected() {
        let dump = "labelRes=0x7f120001 nonLocalizedLabel=null icon=0x7f0a0001";
        assert_eq!(parse_non_localized_label(dump), None);
    }

    #[test]
    fn falls_back_when_label_field_is_absent() {
        assert_eq!(parse_non_localized_label("no label info here"), None);
    }

    #[test]
    fn exact_label_match_wins_over_substring() {
        let catalog = vec![
            entry("Spotify", "com.spotify.music"),
            entry("Spotify Lite", "com.spotify.lite"),
        ];
        let best = best_app_match("spotify", &catalog).unwrap();
        assert_eq!(best.package, "com.spotify.music");
    }

    #[test]
    fn blocklisted_package_is_never_returned() {
        let catalog = vec![entry("Assistant", "com.google.android.googlequicksearchbox")];
        assert!(best_app_match("assistant", &catalog).is_none());
    }

    #[test]
    fn music_token_excluded_from_substring_tiers() {
        let catalog = vec![entry("YouTube Music", "com.google.android.apps.youtube.music")];
        // "music" alone should not substring-match via tiers 60/50 (excluded),
        // only via the weaker word-level/label/package tiers.
        assert!(best_app_match("music", &catalog).is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let catalog = vec![entry("Chrome", "com.android.chrome")];
        assert!(best_app_match("zzz_nonexistent_app", &catalog).is_none());
    }

    #[test]
    fn ties_break_on_lexicographic_package() {
        let catalog = vec![
            entry("Maps", "com.zzz.maps"),
            entry("Maps", "com.aaa.maps"),
        ];
        let best = best_app_match("maps", &catalog).unwrap();
        assert_eq!(best.package, "com.aaa.maps");
    }

    #[test]
    fn package_suffix_beats_plain_substring() {
        let catalog = vec![
            entry("Gmail", "com.google.android.gm"),
            entry("Not Gmail At All", "com.example.somegmailclone"),
        ];
        let best = best_app_match("gm", &catalog).unwrap();
        assert_eq!(best.package, "com.google.android.gm");
    }
}
