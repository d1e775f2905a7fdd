//! Nudge Harvester - productivity label collection from desktop activity.
//!
//! The harvester samples which application has focus and how long the user
//! has been idle, asks the user at intervals whether they are being
//! productive, and writes each answer next to the activity it describes.
//! With ML assistance enabled, a local decision service can fire a prompt
//! early or hold it back when it is confident enough.
//!
//! # Privacy Guarantees
//!
//! - **No content**: window titles, keystrokes and screen content are never read
//! - **Hashed identity**: application names reach disk only as a stable hash
//! - **Local only**: every socket binds to and talks over loopback
//! - **Transparency**: every prompt and its outcome is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Nudge Harvester                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐          │
//! │  │   Probe    │──▶│   Sample   │──▶│   Tracker    │          │
//! │  │ (platform) │   │   Cache    │   │ (attention)  │          │
//! │  └────────────┘   └────────────┘   └──────┬───────┘          │
//! │                                           ▼                   │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐          │
//! │  │ Supervisor │──▶│  Adaptive  │──▶│   Snapshot   │──▶ CSV   │
//! │  │ (services) │   │    Gate    │   │ Coordinator  │          │
//! │  └────────────┘   └────────────┘   └──────▲───────┘          │
//! │                                           │ YES / NO / SNAP   │
//! │                                    ┌──────┴───────┐          │
//! │                                    │  Response    │          │
//! │                                    │  Listener    │          │
//! │                                    └──────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nudge_harvester::{config::Config, engine};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let stats = engine::run(Config::default(), engine::RunOptions::default(), cancel).await?;
//! println!("{} snapshots requested", stats.snapshots_requested);
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod core;
pub mod engine;
pub mod gate;
pub mod protocol;
pub mod supervisor;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use collector::{ActivitySample, ActivitySource, ActivityTracker, Backend, SampleCache};
pub use config::Config;
pub use core::{
    stable_hash, CsvSink, LabelEvent, LabelSink, Snapshot, SnapshotCoordinator, SnapshotState,
    TriggerSource,
};
pub use engine::{Engine, Harvester, RunOptions, TickOutcome};
pub use gate::{AdaptiveGate, DecisionService, GateVerdict, Prediction};
pub use protocol::Token;
pub use supervisor::{ProcessState, ProcessSupervisor, ServiceKind};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║             NUDGE HARVESTER - PRIVACY DECLARATION                ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This tool asks you, now and then, whether you are productive,   ║
║  and records your answer with a summary of recent activity.      ║
║                                                                  ║
║  ✓ WHAT WE CAPTURE:                                              ║
║    • Which application has focus (stored only as a number)       ║
║    • How long since your last keyboard or mouse input            ║
║    • How long the same application has held focus                ║
║    • Your YES / NO answer                                        ║
║                                                                  ║
║  ✗ WHAT WE NEVER CAPTURE:                                        ║
║    • Which keys you press or what you type                       ║
║    • Window titles, documents or web addresses                   ║
║    • Where your cursor is                                        ║
║    • Any screen content                                          ║
║                                                                  ║
║  All data stays on this machine. Unanswered prompts are          ║
║  discarded without being written.                                ║
║                                                                  ║
║  You can view collection statistics anytime with:                ║
║    nudge-harvester status                                        ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_declaration_contents() {
        assert!(PRIVACY_DECLARATION.contains("PRIVACY"));
        assert!(PRIVACY_DECLARATION.contains("NEVER CAPTURE"));
        assert!(PRIVACY_DECLARATION.contains("keys you press"));
        assert!(PRIVACY_DECLARATION.contains("nudge-harvester status"));
    }
}
