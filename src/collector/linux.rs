//! Linux and BSD desktop probes.
//!
//! Each compositor family exposes focus and idle information differently,
//! so each gets its own probe. All of them shell out to the helper the
//! desktop already ships with, bounded by a short timeout, and parse the
//! output with the pure functions at the bottom of this module.

use crate::collector::command::run_with_timeout;
use crate::collector::types::Backend;
use crate::collector::{CollectorError, ForegroundProbe};
use serde_json::Value;
use std::time::Duration;

/// X11 sessions: `xprop` for the focused window class, `xprintidle` for idle.
#[derive(Debug, Clone)]
pub struct X11Probe {
    timeout: Duration,
}

impl X11Probe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ForegroundProbe for X11Probe {
    fn backend(&self) -> Backend {
        Backend::X11
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        let root = run_with_timeout("xprop", &["-root", "_NET_ACTIVE_WINDOW"], self.timeout)?;
        let window_id = parse_active_window_id(&root)?;
        let class = run_with_timeout("xprop", &["-id", &window_id, "WM_CLASS"], self.timeout)?;
        parse_wm_class(&class)
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        let out = run_with_timeout("xprintidle", &[], self.timeout)?;
        parse_millis(&out).map(Duration::from_millis)
    }
}

/// Sway: the focused node of `swaymsg -t get_tree`.
#[derive(Debug, Clone)]
pub struct SwayProbe {
    timeout: Duration,
}

impl SwayProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ForegroundProbe for SwayProbe {
    fn backend(&self) -> Backend {
        Backend::Sway
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        let tree = run_with_timeout("swaymsg", &["-t", "get_tree"], self.timeout)?;
        parse_sway_tree(&tree)
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        Err(CollectorError::Unsupported("idle time on sway"))
    }
}

/// Hyprland: `hyprctl activewindow -j`.
#[derive(Debug, Clone)]
pub struct HyprlandProbe {
    timeout: Duration,
}

impl HyprlandProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ForegroundProbe for HyprlandProbe {
    fn backend(&self) -> Backend {
        Backend::Hyprland
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        let out = run_with_timeout("hyprctl", &["activewindow", "-j"], self.timeout)?;
        parse_hyprland_window(&out)
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        Err(CollectorError::Unsupported("idle time on hyprland"))
    }
}

/// GNOME on Wayland: Mutter's idle monitor over D-Bus.
///
/// Mutter does not let ordinary clients see which window has focus, so the
/// application query always fails and the tracker reports the sentinel.
#[derive(Debug, Clone)]
pub struct GnomeProbe {
    timeout: Duration,
}

impl GnomeProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ForegroundProbe for GnomeProbe {
    fn backend(&self) -> Backend {
        Backend::GnomeWayland
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        Err(CollectorError::Unsupported("foreground application on gnome wayland"))
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        let out = run_with_timeout(
            "gdbus",
            &[
                "call",
                "--session",
                "--dest",
                "org.gnome.Mutter.IdleMonitor",
                "--object-path",
                "/org/gnome/Mutter/IdleMonitor/Core",
                "--method",
                "org.gnome.Mutter.IdleMonitor.GetIdletime",
            ],
            self.timeout,
        )?;
        parse_gdbus_uint64(&out).map(Duration::from_millis)
    }
}

/// Extract the window id from `xprop -root _NET_ACTIVE_WINDOW`.
///
/// Output looks like `_NET_ACTIVE_WINDOW(WINDOW): window id # 0x3c00007`.
/// An id of `0x0` means nothing has focus.
pub fn parse_active_window_id(output: &str) -> Result<String, CollectorError> {
    let id = output
        .rsplit('#')
        .next()
        .and_then(|tail| tail.split([',', ' ']).find(|t| !t.trim().is_empty()))
        .map(|t| t.trim().to_string())
        .filter(|t| t.starts_with("0x"))
        .ok_or_else(|| CollectorError::Parse(format!("no window id in {:?}", output.trim())))?;

    if u64::from_str_radix(id.trim_start_matches("0x"), 16).unwrap_or(0) == 0 {
        return Err(CollectorError::Parse("no active window".to_string()));
    }
    Ok(id)
}

/// Extract the application class from `xprop -id <id> WM_CLASS`.
///
/// Output looks like `WM_CLASS(STRING) = "Navigator", "firefox"`; the last
/// string is the class, which names the application rather than the window.
pub fn parse_wm_class(output: &str) -> Result<String, CollectorError> {
    let quoted: Vec<&str> = output.split('"').skip(1).step_by(2).collect();
    quoted
        .last()
        .map(|class| class.trim())
        .filter(|class| !class.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CollectorError::Parse(format!("no WM_CLASS in {:?}", output.trim())))
}

/// Parse a bare millisecond count such as `xprintidle` prints.
pub fn parse_millis(output: &str) -> Result<u64, CollectorError> {
    output
        .trim()
        .parse::<u64>()
        .map_err(|e| CollectorError::Parse(format!("invalid millisecond count: {e}")))
}

/// Parse a GVariant reply such as `(uint64 12345,)`.
pub fn parse_gdbus_uint64(output: &str) -> Result<u64, CollectorError> {
    let digits: String = output
        .split("uint64")
        .nth(1)
        .unwrap_or("")
        .chars()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<u64>()
        .map_err(|_| CollectorError::Parse(format!("no uint64 in {:?}", output.trim())))
}

/// Find the focused window in a sway tree and name its application.
pub fn parse_sway_tree(output: &str) -> Result<String, CollectorError> {
    let tree: Value =
        serde_json::from_str(output).map_err(|e| CollectorError::Parse(e.to_string()))?;
    let node = find_focused(&tree)
        .ok_or_else(|| CollectorError::Parse("no focused node".to_string()))?;

    // Native Wayland clients carry app_id, XWayland clients a window class.
    node.get("app_id")
        .and_then(Value::as_str)
        .or_else(|| {
            node.get("window_properties")
                .and_then(|props| props.get("class"))
                .and_then(Value::as_str)
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CollectorError::Parse("focused node has no application".to_string()))
}

fn find_focused(node: &Value) -> Option<&Value> {
    if node.get("focused").and_then(Value::as_bool) == Some(true) {
        return Some(node);
    }
    ["nodes", "floating_nodes"]
        .iter()
        .filter_map(|key| node.get(*key).and_then(Value::as_array))
        .flatten()
        .find_map(find_focused)
}

/// Read the `class` of `hyprctl activewindow -j`.
///
/// Hyprland prints `{}` when no window has focus.
pub fn parse_hyprland_window(output: &str) -> Result<String, CollectorError> {
    let window: Value =
        serde_json::from_str(output).map_err(|e| CollectorError::Parse(e.to_string()))?;
    window
        .get("class")
        .and_then(Value::as_str)
        .filter(|class| !class.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CollectorError::Parse("no active window".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_window_id() {
        let out = "_NET_ACTIVE_WINDOW(WINDOW): window id # 0x3c00007\n";
        assert_eq!(parse_active_window_id(out).unwrap(), "0x3c00007");

        let out = "_NET_ACTIVE_WINDOW(WINDOW): window id # 0x0\n";
        assert!(parse_active_window_id(out).is_err());

        assert!(parse_active_window_id("_NET_ACTIVE_WINDOW:  not found.").is_err());
    }

    #[test]
    fn test_wm_class_takes_class_not_instance() {
        let out = "WM_CLASS(STRING) = \"Navigator\", \"firefox\"\n";
        assert_eq!(parse_wm_class(out).unwrap(), "firefox");

        let out = "WM_CLASS(STRING) = \"code\", \"Code\"\n";
        assert_eq!(parse_wm_class(out).unwrap(), "Code");

        assert!(parse_wm_class("WM_CLASS:  not found.\n").is_err());
    }

    #[test]
    fn test_millis() {
        assert_eq!(parse_millis("15320\n").unwrap(), 15320);
        assert!(parse_millis("").is_err());
        assert!(parse_millis("-3").is_err());
    }

    #[test]
    fn test_gdbus_uint64() {
        assert_eq!(parse_gdbus_uint64("(uint64 48213,)\n").unwrap(), 48213);
        assert!(parse_gdbus_uint64("Error: GDBus.Error").is_err());
    }

    #[test]
    fn test_sway_tree_nested_focus() {
        let tree = r#"{
            "focused": false,
            "nodes": [
                {"focused": false, "nodes": [
                    {"focused": false, "app_id": "foot", "nodes": []},
                    {"focused": true, "app_id": "org.mozilla.firefox", "nodes": []}
                ]}
            ],
            "floating_nodes": []
        }"#;
        assert_eq!(parse_sway_tree(tree).unwrap(), "org.mozilla.firefox");
    }

    #[test]
    fn test_sway_tree_xwayland_and_floating() {
        let tree = r#"{
            "focused": false,
            "nodes": [],
            "floating_nodes": [
                {"focused": true, "app_id": null,
                 "window_properties": {"class": "Slack", "instance": "slack"}}
            ]
        }"#;
        assert_eq!(parse_sway_tree(tree).unwrap(), "Slack");
    }

    #[test]
    fn test_sway_tree_without_focus() {
        let tree = r#"{"focused": false, "nodes": []}"#;
        assert!(parse_sway_tree(tree).is_err());
        assert!(parse_sway_tree("not json").is_err());
    }

    #[test]
    fn test_hyprland_window() {
        let out = r#"{"address": "0x55d1", "class": "kitty", "title": "~"}"#;
        assert_eq!(parse_hyprland_window(out).unwrap(), "kitty");
        assert!(parse_hyprland_window("{}").is_err());
    }
}
