//! Bounded execution of desktop helper commands.
//!
//! Helpers such as `xprop` or `hyprctl` normally answer in a few
//! milliseconds, but a wedged compositor can leave them hanging. Every call
//! here is bounded; a helper that overruns is killed.

use crate::collector::CollectorError;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default bound for a single helper invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(400);

/// Most helper invocations one sample needs: X11 runs `xprop` twice and
/// `xprintidle` once.
pub const MAX_COMMANDS_PER_SAMPLE: u32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Per-command bound that keeps a whole sample within `sample_budget`.
pub fn command_budget(sample_budget: Duration) -> Duration {
    (sample_budget / MAX_COMMANDS_PER_SAMPLE).min(DEFAULT_COMMAND_TIMEOUT)
}

/// Run `program` with `args` and return its stdout.
///
/// Fails if the program cannot be started, exits unsuccessfully, or is
/// still running after `timeout`.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CollectorError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| CollectorError::CommandFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    // Drain stdout on a side thread so a chatty helper cannot fill the pipe
    // and stall before exiting.
    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = reader
                    .map(|handle| handle.join().unwrap_or_default())
                    .unwrap_or_default();
                if !status.success() {
                    return Err(CollectorError::CommandFailed {
                        program: program.to_string(),
                        reason: format!("exited with {status}"),
                    });
                }
                return Ok(output);
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CollectorError::Timeout {
                    program: program.to_string(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(CollectorError::CommandFailed {
                    program: program.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
