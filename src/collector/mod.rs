//! Activity collection for the harvester.
//!
//! Platform probes answer two questions: which application has focus, and
//! how long ago the user last touched the keyboard or mouse. A
//! [`SampleCache`] bounds how often those questions reach the operating
//! system, and an [`ActivityTracker`] turns the answers into samples with an
//! attention span, falling back to safe defaults whenever a probe fails.

pub mod cache;
pub mod command;
pub mod noop;
pub mod tracker;
pub mod types;

#[cfg(all(unix, not(target_os = "macos")))]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

use std::time::Duration;

// Re-export commonly used types
pub use cache::SampleCache;
pub use noop::UnsupportedProbe;
pub use tracker::{ActivitySource, ActivityTracker};
pub use types::{ActivitySample, Backend, UNKNOWN_APPLICATION};

/// A platform query for the foreground application and input idle time.
///
/// Implementations report failures as errors; turning those into sentinel
/// values is the tracker's job.
pub trait ForegroundProbe: Send + Sync {
    /// The backend this probe queries.
    fn backend(&self) -> Backend;

    /// Identifier of the application that currently has focus.
    fn query_application(&self) -> Result<String, CollectorError>;

    /// Time since the last user input.
    fn query_idle(&self) -> Result<Duration, CollectorError>;
}

impl<P: ForegroundProbe + ?Sized> ForegroundProbe for Box<P> {
    fn backend(&self) -> Backend {
        (**self).backend()
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        (**self).query_application()
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        (**self).query_idle()
    }
}

/// Build the probe for a detected backend.
///
/// A backend that is not available on the current target yields an
/// [`UnsupportedProbe`], so callers never need to special-case platforms.
pub fn probe_for(backend: Backend, command_timeout: Duration) -> Box<dyn ForegroundProbe> {
    match backend {
        #[cfg(all(unix, not(target_os = "macos")))]
        Backend::Hyprland => Box::new(linux::HyprlandProbe::new(command_timeout)),
        #[cfg(all(unix, not(target_os = "macos")))]
        Backend::Sway => Box::new(linux::SwayProbe::new(command_timeout)),
        #[cfg(all(unix, not(target_os = "macos")))]
        Backend::GnomeWayland => Box::new(linux::GnomeProbe::new(command_timeout)),
        #[cfg(all(unix, not(target_os = "macos")))]
        Backend::X11 => Box::new(linux::X11Probe::new(command_timeout)),
        #[cfg(target_os = "macos")]
        Backend::MacOs => Box::new(macos::MacOsProbe::new(command_timeout)),
        #[cfg(target_os = "windows")]
        Backend::Windows => {
            let _ = command_timeout;
            Box::new(windows::WindowsProbe::new())
        }
        other => {
            let _ = command_timeout;
            Box::new(UnsupportedProbe::new(other))
        }
    }
}

/// Errors that can occur while querying the desktop environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    /// The backend cannot answer this query at all
    Unsupported(&'static str),
    /// A helper command could not be run or exited unsuccessfully
    CommandFailed { program: String, reason: String },
    /// A helper command did not finish in time and was killed
    Timeout { program: String },
    /// A helper produced output we could not understand
    Parse(String),
    /// A native OS call failed
    Os(String),
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Unsupported(what) => write!(f, "Not supported by this backend: {what}"),
            CollectorError::CommandFailed { program, reason } => {
                write!(f, "Command `{program}` failed: {reason}")
            }
            CollectorError::Timeout { program } => write!(f, "Command `{program}` timed out"),
            CollectorError::Parse(e) => write!(f, "Parse error: {e}"),
            CollectorError::Os(e) => write!(f, "OS query failed: {e}"),
        }
    }
}

impl std::error::Error for CollectorError {}
