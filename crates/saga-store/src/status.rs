//! Step status lifecycle.

use serde::{Deserialize, Serialize};

/// The status of one saga step.
///
/// Transitions:
/// ```text
///         ┌──► Started ──┬──► Completed ──┬──► Compensated
/// None ───┤              │                └──► CompensationFailed
///         ├──────────────┼──► Completed
///         └──────────────┴──► Failed ─────┬──► Compensated
///                                          └──► CompensationFailed
/// ```
///
/// A key's first record may carry any forward status (`Started`,
/// `Completed` or `Failed`), since handlers often record the outcome of a
/// step without ever recording its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    /// No record exists for the step key.
    #[default]
    None,
    Started,
    Completed,
    Failed,
    /// Terminal.
    Compensated,
    /// Terminal.
    CompensationFailed,
}

impl StepStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [StepStatus; 6] = [
        StepStatus::None,
        StepStatus::Started,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Compensated,
        StepStatus::CompensationFailed,
    ];

    /// Statuses reachable from `self` in a single transition.
    pub const fn allowed_next(&self) -> &'static [StepStatus] {
        match self {
            StepStatus::None => &[StepStatus::Started, StepStatus::Completed, StepStatus::Failed],
            StepStatus::Started => &[StepStatus::Completed, StepStatus::Failed],
            StepStatus::Completed | StepStatus::Failed => {
                &[StepStatus::Compensated, StepStatus::CompensationFailed]
            }
            StepStatus::Compensated | StepStatus::CompensationFailed => &[],
        }
    }

    /// Returns true if `self → next` is an edge of the transition table.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Compensated | StepStatus::CompensationFailed)
    }

    /// Returns true once the step has left the compensation-eligible states.
    pub fn is_failed_or_compensated(&self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::Compensated | StepStatus::CompensationFailed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::None => "None",
            StepStatus::Started => "Started",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
