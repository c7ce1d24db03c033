use std::time::Duration;

use crate::catalog::InstalledTitle;

/// Notifications published by a title engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The persisted record of the title changed (install, patch or addon).
    CurrentGameChanged { title: InstalledTitle },
    GameRunningChanged { title_id: String, running: bool },
    /// A play session ended; `reported` is false when the report could not be delivered.
    PlaySessionEnded {
        title_id: String,
        elapsed: Duration,
        reported: bool,
    },
}
