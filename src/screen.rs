//! ScreenSource (C1, §4.1): on demand, produce a normalized, bounded
//! snapshot of interactive UI elements with stable indices and
//! screen-space coordinates.
//!
//! Grounded on the accessibility-tree parser in `sanitizer.rs`: the
//! streaming `<node ...>` scanner, per-element scoring, and `format_for_llm`
//! layout are carried over, re-indexed 0-based and recapped to the spec's
//! defaults (`max_elements=30`, `max_text_length=50`) instead of the
//! original's 1-based / 50-element scheme.

use crate::types::{Screen, ScreenElement, SuggestedAction};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ELEMENTS: usize = 30;
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 50;

/// Inbound port: the host supplies an implementation backed by whatever
/// accessibility service it has (platform accessibility API, web driver,
/// desktop automation layer, or a fake for tests).
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn snapshot(&self, max_elements: usize, max_text_length: usize) -> Screen;

    /// Capture the current display as base64-encoded PNG bytes, for a
    /// vision-capable Decider call (§4.3, §6). `None` if the host has no
    /// screenshot capability or the capture failed.
    async fn screenshot_base64(&self) -> Option<String> {
        None
    }
}

/// ADB/uiautomator-backed `ScreenSource`.
pub struct AdbScreenSource {
    adb_device: Option<String>,
}

impl AdbScreenSource {
    pub fn new(adb_device: Option<String>) -> Self {
        Self { adb_device }
    }

    fn adb_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("adb");
        if let Some(ref d) = self.adb_device {
            cmd.args(["-s", d]);
        }
        cmd
    }

    async fn dump_tree(&self) -> Option<String> {
        let mut cmd = self.adb_command();
        cmd.args(["shell", "uiautomator", "dump", "/dev/tty"]);
        match cmd.output().await {
            Ok(out) if out.status.success() => {
                let raw = String::from_utf8_lossy(&out.stdout).to_string();
                if let Some(i) = raw.find("<?xml") {
                    Some(raw[i..].to_string())
                } else if let Some(i) = raw.find("<hierarchy") {
                    Some(raw[i..].to_string())
                } else if raw.contains("<node") {
                    Some(raw)
                } else {
                    None
                }
            }
            Ok(out) => {
                warn!(
                    "uiautomator dump failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!("failed to run uiautomator dump: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ScreenSource for AdbScreenSource {
    async fn snapshot(&self, max_elements: usize, max_text_length: usize) -> Screen {
        let Some(xml) = self.dump_tree().await else {
            debug!("no accessibility tree available, returning empty screen");
            return Screen::empty();
        };
        parse_accessibility_xml(&xml, max_elements, max_text_length)
    }

    async fn screenshot_base64(&self) -> Option<String> {
        use base64::Engine;
        let mut cmd = self.adb_command();
        cmd.args(["exec-out", "screencap", "-p"]);
        let out = cmd.output().await.ok()?;
        if !out.status.success() || out.stdout.is_empty() {
            warn!("screencap failed or returned no bytes");
            return None;
        }
        Some(base64::engine::general_purpose::STANDARD.encode(&out.stdout))
    }
}

/// Raw element extracted from one `<node .../>` tag, pre-scoring.
struct RawElement {
    text: String,
    content_desc: String,
    resource_id: String,
    class_short: String,
    clickable: bool,
    long_clickable: bool,
    focusable: bool,
    scrollable: bool,
    checkable: bool,
    checked: bool,
    enabled: bool,
    editable: bool,
    bounds: [i32; 4],
    score: f32,
}

/// Parse uiautomator XML into a bounded, 0-indexed `Screen`.
///
/// Traversal is a streaming scan over `<node ...>` tags (bounded
/// depth-first pre-order as the XML itself already encodes); an element is
/// admitted when `enabled` and (non-empty label OR clickable/editable/
/// checkable) and has positive on-screen bounds.
pub fn parse_accessibility_xml(xml: &str, max_elements: usize, max_text_length: usize) -> Screen {
    if max_elements == 0 {
        return Screen::empty();
    }

    let mut raw: Vec<RawElement> = Vec::new();
    let mut pos = 0usize;
    let bytes = xml.as_bytes();

    while pos < bytes.len() && raw.len() < max_elements {
        let Some(start) = find_substr(xml, pos, "<node ") else {
            break;
        };
        let Some(tag_end) = find_substr(xml, start, ">") else {
            break;
        };
        let tag = &xml[start..=tag_end];
        if let Some(elem) = parse_node_tag(tag) {
            if is_admissible(&elem) {
                raw.push(elem);
            }
        }
        pos = tag_end + 1;
    }

    if raw.is_empty() {
        return Screen::empty();
    }

    for e in &mut raw {
        e.score = score_element(e);
    }
    raw.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut elements = Vec::with_capacity(raw.len());
    let mut index_map = HashMap::with_capacity(raw.len());

    for (i, e) in raw.into_iter().enumerate() {
        let cx = (e.bounds[0] + e.bounds[2]) / 2;
        let cy = (e.bounds[1] + e.bounds[3]) / 2;
        let label = truncate_label(
            if !e.text.is_empty() { &e.text } else { &e.content_desc },
            max_text_length,
        );
        let resource_id = e.resource_id.rsplit('/').next().map(|s| s.to_string()).filter(|s| !s.is_empty());
        let suggested_action = if e.editable {
            SuggestedAction::Type
        } else if e.checkable {
            SuggestedAction::Toggle
        } else if e.clickable || e.long_clickable {
            SuggestedAction::Tap
        } else {
            SuggestedAction::Read
        };

        index_map.insert(i, (cx, cy));
        elements.push(ScreenElement {
            index: i,
            label,
            resource_id,
            class_hint: e.class_short,
            center_x: cx,
            center_y: cy,
            clickable: e.clickable || e.long_clickable,
            editable: e.editable,
            checkable: e.checkable,
            checked: e.checked,
            enabled: e.enabled,
            suggested_action,
        });
    }

    let compact_text = format_compact_text(&elements);

    Screen { elements, index_map, compact_text }
}

/// `idx: label (class) [caps]` — one line per element, deterministic order.
fn format_compact_text(elements: &[ScreenElement]) -> String {
    let mut out = String::with_capacity(elements.len() * 48);
    for e in elements {
        let mut caps: Vec<&str> = Vec::with_capacity(4);
        if e.clickable {
            caps.push("tap");
        }
        if e.editable {
            caps.push("type");
        }
        if e.checkable {
            caps.push(if e.checked { "checked" } else { "unchecked" });
        }
        if !e.enabled {
            caps.push("disabled");
        }
        out.push_str(&format!(
            "{}: {} ({}) [{}]\n",
            e.index,
            e.label,
            e.class_hint,
            caps.join(",")
        ));
    }
    out
}

fn truncate_label(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

fn is_admissible(e: &RawElement) -> bool {
    if !e.enabled {
        return false;
    }
    let has_content = !e.text.is_empty() || e.clickable || e.editable || e.checkable;
    if !has_content {
        return false;
    }
    let w = e.bounds[2] - e.bounds[0];
    let h = e.bounds[3] - e.bounds[1];
    w > 0 && h > 0
}

fn score_element(e: &RawElement) -> f32 {
    let mut score = 0.0f32;
    if e.clickable {
        score += 10.0;
    }
    if e.editable {
        score += 12.0;
    }
    if e.long_clickable {
        score += 5.0;
    }
    if e.focusable {
        score += 3.0;
    }
    if e.scrollable {
        score += 4.0;
    }
    if e.checkable {
        score += 6.0;
    }
    if !e.text.is_empty() {
        score += 5.0 + (e.text.len().min(100) as f32) * 0.02;
    }
    if !e.content_desc.is_empty() {
        score += 3.0;
    }
    if !e.resource_id.is_empty() {
        score += 1.0;
    }
    let w = (e.bounds[2] - e.bounds[0]).max(0);
    let h = (e.bounds[3] - e.bounds[1]).max(0);
    let area = (w as f32) * (h as f32);
    if area > 100.0 {
        score += (area.ln() * 0.5).min(5.0);
    }
    if area < 10.0 {
        score -= 10.0;
    }
    if e.bounds[0] < -10 || e.bounds[1] < -10 {
        score -= 20.0;
    }
    match e.class_short.to_lowercase().as_str() {
        "button" | "imagebutton" => score += 3.0,
        "edittext" => score += 4.0,
        "checkbox" | "switch" | "radiobutton" | "togglebutton" => score += 3.0,
        "searchview" => score += 5.0,
        _ => {}
    }
    if !e.enabled {
        score -= 5.0;
    }
    score
}

fn parse_node_tag(tag: &str) -> Option<RawElement> {
    let text = get_attr(tag, "text").unwrap_or_default();
    let content_desc = get_attr(tag, "content-desc").unwrap_or_default();
    let resource_id = get_attr(tag, "resource-id").unwrap_or_default();
    let class = get_attr(tag, "class").unwrap_or_default();
    let bounds_str = get_attr(tag, "bounds").unwrap_or_default();
    let bounds = parse_bounds(&bounds_str)?;

    let clickable = get_bool_attr(tag, "clickable");
    let long_clickable = get_bool_attr(tag, "long-clickable");
    let focusable = get_bool_attr(tag, "focusable");
    let scrollable = get_bool_attr(tag, "scrollable");
    let checkable = get_bool_attr(tag, "checkable");
    let checked = get_bool_attr(tag, "checked");
    let enabled = get_bool_attr(tag, "enabled");
    let password = get_bool_attr(tag, "password");

    let class_lower = class.to_lowercase();
    let editable = class_lower.contains("edittext")
        || class_lower.contains("searchview")
        || class_lower.contains("autocompletetextview")
        || password;

    let class_short = class.rsplit('.').next().unwrap_or(&class).to_string();

    Some(RawElement {
        text,
        content_desc,
        resource_id,
        class_short,
        clickable,
        long_clickable,
        focusable,
        scrollable,
        checkable,
        checked,
        enabled,
        editable,
        bounds,
        score: 0.0,
    })
}

fn parse_bounds(s: &str) -> Option<[i32; 4]> {
    let mut nums = Vec::with_capacity(4);
    let mut current = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() || ch == '-' {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<i32>() {
                nums.push(n);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(n) = current.parse::<i32>() {
            nums.push(n);
        }
    }
    if nums.len() >= 4 {
        Some([nums[0], nums[1], nums[2], nums[3]])
    } else {
        None
    }
}

fn get_attr(tag: &str, name: &str) -> Option<String> {
    let pattern = format!("{}=\"", name);
    let start = tag.find(&pattern)? + pattern.len();
    let end = tag[start..].find('"')? + start;
    let raw = &tag[start..end];
    Some(
        raw.replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&#10;", "\n")
            .replace("&#13;", "\r"),
    )
}

fn get_bool_attr(tag: &str, name: &str) -> bool {
    get_attr(tag, name).map(|v| v == "true").unwrap_or(false)
}

fn find_substr(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..].find(needle).map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.whatsapp" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,2400]">
    <node index="0" text="Chats" resource-id="com.whatsapp:id/tab_label" class="android.widget.TextView" package="com.whatsapp" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="true" bounds="[0,150][270,210]">
    </node>
    <node index="1" text="" resource-id="com.whatsapp:id/fab" class="android.widget.ImageButton" package="com.whatsapp" content-desc="New chat" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[900,2200][1040,2340]">
    </node>
    <node index="2" text="Hello! How are you?" resource-id="" class="android.widget.TextView" package="com.whatsapp" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[100,500][800,550]">
    </node>
    <node index="3" text="" resource-id="com.whatsapp:id/entry" class="android.widget.EditText" package="com.whatsapp" content-desc="Type a message" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[80,2100][900,2180]">
    </node>
  </node>
</hierarchy>"#;

    #[test]
    fn indices_are_dense_and_zero_based() {
        let screen = parse_accessibility_xml(SAMPLE_XML, 30, 50);
        for (i, e) in screen.elements.iter().enumerate() {
            assert_eq!(e.index, i);
        }
        assert_eq!(screen.elements.first().map(|e| e.index), Some(0));
    }

    #[test]
    fn index_map_matches_element_centers() {
        let screen = parse_accessibility_xml(SAMPLE_XML, 30, 50);
        for e in &screen.elements {
            assert_eq!(screen.coords_for(e.index), Some((e.center_x, e.center_y)));
        }
    }

    #[test]
    fn empty_xml_yields_empty_screen() {
        let screen = parse_accessibility_xml("", 30, 50);
        assert!(screen.is_empty());
        assert_eq!(screen.compact_text, "");
    }

    #[test]
    fn max_elements_zero_yields_no_elements() {
        let screen = parse_accessibility_xml(SAMPLE_XML, 0, 50);
        assert_eq!(screen.elements.len(), 0);
    }

    #[test]
    fn scan_stops_once_cap_is_reached() {
        let screen = parse_accessibility_xml(SAMPLE_XML, 2, 50);
        assert_eq!(screen.elements.len(), 2);
    }

    #[test]
    fn labels_are_capped_at_max_text_length() {
        let long_xml = format!(
            r#"<hierarchy><node index="0" text="{}" resource-id="" class="android.widget.Button" package="com.app" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][200,80]"></node></hierarchy>"#,
            "x".repeat(200)
        );
        let screen = parse_accessibility_xml(&long_xml, 30, 10);
        assert_eq!(screen.elements[0].label.chars().count(), 10);
    }

    #[test]
    fn parse_bounds_rejects_malformed_input() {
        assert_eq!(parse_bounds("[0,0][1080,2400]"), Some([0, 0, 1080, 2400]));
        assert_eq!(parse_bounds("invalid"), None);
    }

    #[test]
    fn compact_text_has_one_line_per_element() {
        let screen = parse_accessibility_xml(SAMPLE_XML, 30, 50);
        assert_eq!(screen.compact_text.lines().count(), screen.elements.len());
    }
}
