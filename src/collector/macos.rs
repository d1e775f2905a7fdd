//! macOS implementation of the activity probe.
//!
//! The frontmost process comes from System Events via `osascript`, idle
//! time from the `HIDIdleTime` property of the IOHIDSystem registry entry.
//! `osascript` needs the Automation permission for System Events; without
//! it the query fails and the tracker reports the sentinel application.

use crate::collector::command::run_with_timeout;
use crate::collector::types::Backend;
use crate::collector::{CollectorError, ForegroundProbe};
use std::time::Duration;

const FRONTMOST_SCRIPT: &str =
    "tell application \"System Events\" to get name of first application process whose frontmost is true";

/// The macOS activity probe.
#[derive(Debug, Clone)]
pub struct MacOsProbe {
    timeout: Duration,
}

impl MacOsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ForegroundProbe for MacOsProbe {
    fn backend(&self) -> Backend {
        Backend::MacOs
    }

    fn query_application(&self) -> Result<String, CollectorError> {
        let out = run_with_timeout("osascript", &["-e", FRONTMOST_SCRIPT], self.timeout)?;
        let name = out.trim();
        if name.is_empty() {
            return Err(CollectorError::Parse("empty frontmost process".to_string()));
        }
        Ok(name.to_string())
    }

    fn query_idle(&self) -> Result<Duration, CollectorError> {
        let out = run_with_timeout("ioreg", &["-c", "IOHIDSystem", "-d", "4"], self.timeout)?;
        parse_hid_idle_time(&out)
    }
}

/// Read `"HIDIdleTime" = <nanoseconds>` out of an `ioreg` dump.
pub fn parse_hid_idle_time(output: &str) -> Result<Duration, CollectorError> {
    output
        .lines()
        .find(|line| line.contains("\"HIDIdleTime\""))
        .and_then(|line| line.split('=').nth(1))
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_nanos)
        .ok_or_else(|| CollectorError::Parse("HIDIdleTime not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hid_idle_time() {
        let dump = "  | |   \"HIDIdleTime\" = 2543012875\n  | |   \"HIDParameters\" = {}\n";
        let idle = parse_hid_idle_time(dump).unwrap();
        assert_eq!(idle.as_millis(), 2543);
    }

    #[test]
    fn test_hid_idle_time_missing() {
        assert!(parse_hid_idle_time("+-o IOHIDSystem").is_err());
    }
}
