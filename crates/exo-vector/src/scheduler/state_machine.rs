//! Processing task state machine with validated transitions.
//!
//! Queued -> Assigned -> Processing -> Completed/Failed
//! Queued -> Cancelled

use exo_core::error::{ExoError, Result};
use exo_core::types::{ProcessingTask, TaskState};

/// Validate that a state transition is allowed.
///
/// Valid transitions:
/// - Queued -> Assigned
/// - Queued -> Cancelled (batch aborted before dequeue)
/// - Assigned -> Processing
/// - Processing -> Completed
/// - Processing -> Failed
pub fn validate_transition(from: TaskState, to: TaskState) -> Result<()> {
    let valid = matches!(
        (from, to),
        (TaskState::Queued, TaskState::Assigned)
            | (TaskState::Queued, TaskState::Cancelled)
            | (TaskState::Assigned, TaskState::Processing)
            | (TaskState::Processing, TaskState::Completed)
            | (TaskState::Processing, TaskState::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(ExoError::InvalidTransition { from, to })
    }
}

/// Move `task` to `to`, leaving it unchanged on an invalid transition.
pub fn advance(task: &mut ProcessingTask, to: TaskState) -> Result<()> {
    validate_transition(task.state, to)?;
    task.state = to;
    Ok(())
}
