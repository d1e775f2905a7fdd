//! Activity sample and backend types for the harvester.
//!
//! A sample captures only three things: which application has focus, how
//! long the user has been idle, and how long the same application has held
//! focus. Window titles and input content are never captured.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application identifier reported when the platform query fails.
pub const UNKNOWN_APPLICATION: &str = "unknown";

/// One reading of the user's desktop activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Foreground application identifier (process or window class name)
    pub application: String,
    /// Time since the last keyboard or mouse input, in milliseconds
    pub idle_ms: u64,
    /// Continuous time the application has held focus, in milliseconds
    pub attention_span_ms: u64,
    /// When the sample was taken
    pub captured_at: DateTime<Utc>,
}

impl ActivitySample {
    pub fn new(application: impl Into<String>, idle: Duration, attention_span: Duration) -> Self {
        Self {
            application: application.into(),
            idle_ms: duration_to_ms(idle),
            attention_span_ms: duration_to_ms(attention_span),
            captured_at: Utc::now(),
        }
    }

    /// The safe default used when sampling fails outright.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_APPLICATION, Duration::ZERO, Duration::ZERO)
    }

    /// Check whether the application could not be determined.
    pub fn is_unknown(&self) -> bool {
        self.application == UNKNOWN_APPLICATION
    }
}

/// Convert a duration to whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The windowing environment the activity probe talks to.
///
/// Exactly one backend is selected per process, once, at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Hyprland,
    Sway,
    GnomeWayland,
    X11,
    MacOs,
    Windows,
    Unsupported,
}

impl Backend {
    /// Detect the backend for the current process environment.
    pub fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            Backend::MacOs
        }

        #[cfg(target_os = "windows")]
        {
            Backend::Windows
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            Self::detect_unix_session(|key| std::env::var(key).ok())
        }
    }

    /// Pick a backend for a unix desktop session from its environment.
    ///
    /// Compositor-specific sockets win over the generic display variables,
    /// since XWayland sets `DISPLAY` under most Wayland compositors too.
    pub fn detect_unix_session<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| env(key).map(|v| !v.is_empty()).unwrap_or(false);

        if present("HYPRLAND_INSTANCE_SIGNATURE") {
            return Backend::Hyprland;
        }
        if present("SWAYSOCK") {
            return Backend::Sway;
        }
        if present("WAYLAND_DISPLAY") {
            let gnome = env("XDG_CURRENT_DESKTOP")
                .map(|desktop| desktop.to_ascii_uppercase().contains("GNOME"))
                .unwrap_or(false);
            if gnome {
                return Backend::GnomeWayland;
            }
        }
        if present("DISPLAY") {
            return Backend::X11;
        }
        Backend::Unsupported
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Hyprland => "hyprland",
            Backend::Sway => "sway",
            Backend::GnomeWayland => "gnome-wayland",
            Backend::X11 => "x11",
            Backend::MacOs => "macos",
            Backend::Windows => "windows",
            Backend::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
