use thiserror::Error;

/// Typed failure kinds surfaced across module boundaries.
///
/// The propagation rules live with the executor and runner: `LocateFailed` is
/// recoverable inside a workflow, `StepFailed` is terminal for the task once
/// the retry and replan budgets are spent, `UnableToReachHome` is terminal in
/// preset but only logged in reset, and `ClassificationFailed` never falls
/// through to keyword routing.
#[derive(Debug, Error)]
pub enum PilotError {
    /// The utterance was empty or unrecognizable; the user gets guidance
    /// instead of a device run.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Neither the fast-form parser nor the model produced anything
    /// actionable. The shell re-prompts mode selection.
    #[error("classification failed: {0}")]
    ClassificationFailed(String),

    /// A device command timed out or the bridge itself is gone.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device command returned non-zero; stderr is kept for diagnostics.
    #[error("device command failed: {0}")]
    DeviceCommandFailed(String),

    /// Every locator stage was exhausted for a target.
    #[error("could not locate '{target}' (last stage: {stage})")]
    LocateFailed { target: String, stage: &'static str },

    /// A workflow step reached its retry budget.
    #[error("step '{step}' failed after {attempts} attempts: {reason}")]
    StepFailed {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// The ensure-home loop ran out of attempts.
    #[error("unable to reach home after {0} attempts")]
    UnableToReachHome(u32),

    /// Required workflow parameters were not extractable from the task.
    #[error("missing required parameters: {0:?}")]
    ParamsMissing(Vec<String>),

    /// A remote planner or model returned unparseable content.
    #[error("planner failed: {0}")]
    PlannerFailed(String),
}

impl PilotError {
    /// Stable short name used in user-facing failure lines and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            PilotError::InvalidInput(_) => "invalid_input",
            PilotError::ClassificationFailed(_) => "classification_failed",
            PilotError::DeviceUnavailable(_) => "device_unavailable",
            PilotError::DeviceCommandFailed(_) => "device_command_failed",
            PilotError::LocateFailed { .. } => "locate_failed",
            PilotError::StepFailed { .. } => "step_failed",
            PilotError::UnableToReachHome(_) => "unable_to_reach_home",
            PilotError::ParamsMissing(_) => "params_missing",
            PilotError::PlannerFailed(_) => "planner_failed",
        }
    }

    /// Whether the failure should map to exit code 2 (config/device) rather
    /// than 1 (task failure).
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            PilotError::DeviceUnavailable(_) | PilotError::DeviceCommandFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(PilotError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(
            PilotError::LocateFailed {
                target: "send_button".into(),
                stage: "remote-model",
            }
            .kind(),
            "locate_failed"
        );
    }

    #[test]
    fn device_errors_are_environment() {
        assert!(PilotError::DeviceUnavailable("adb gone".into()).is_environment());
        assert!(!PilotError::StepFailed {
            step: "tap".into(),
            attempts: 3,
            reason: "no match".into(),
        }
        .is_environment());
    }
}
