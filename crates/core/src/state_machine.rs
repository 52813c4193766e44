use crate::error::{CoreError, Result};
use crate::status::PhaseStatus;

/// Legal phase status transitions.
///
/// A phase only moves forward within one pass. Advancing a phase that is
/// already done starts a new pass, which is the only way back to running.
pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: &PhaseStatus, to: &PhaseStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &PhaseStatus) -> Vec<PhaseStatus> {
        match from {
            PhaseStatus::Pending => vec![PhaseStatus::Running],
            PhaseStatus::Running => vec![PhaseStatus::Done],
            PhaseStatus::Done => vec![PhaseStatus::Running],
        }
    }

    #[cfg(test)]
    fn can_transition(from: &PhaseStatus, to: &PhaseStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
