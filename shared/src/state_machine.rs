//! Command Lifecycle State Machine
//!
//! Defines the legal status transitions of a command:
//! ```text
//! PENDING -> RUNNING -> COMPLETED | FAILED | TIMEOUT
//! PENDING -> FAILED              (no executor, or orchestration error)
//! ```
//! Terminal states (`COMPLETED`, `FAILED`, `TIMEOUT`) accept no further writes.

use crate::model::CommandStatus;

/// Check if a stored status may be overwritten with another
pub fn is_valid_transition(from: CommandStatus, to: CommandStatus) -> bool {
    use CommandStatus::*;

    match (from, to) {
        // Re-writing a non-terminal status is harmless
        (a, b) if a == b => !a.is_terminal(),

        (Pending, Running) => true,
        (Pending, Failed) => true,
        (Running, Completed | Failed | Timeout) => true,

        _ => false,
    }
}
