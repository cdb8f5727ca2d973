use super::{OrchestrationStatus, Runtime};
use crate::Event;

/// Status plus the latest custom status value, for richer introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationStatusDetail {
    pub status: OrchestrationStatus,
    pub custom_status: Option<String>,
}

/// Derive runtime status from an event history.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    // Terminal events win regardless of position
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => {
                return OrchestrationStatus::Failed { error: error.clone() };
            }
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

/// Latest `CustomStatusSet` value, if any.
pub fn custom_status_from_history(history: &[Event]) -> Option<String> {
    history.iter().rev().find_map(|e| match e {
        Event::CustomStatusSet { value } => Some(value.clone()),
        _ => None,
    })
}

impl Runtime {
    /// Current status for an instance derived from persisted history.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        let hist = self.history_store.read(instance).await;
        status_from_history(&hist)
    }

    /// Status plus latest custom status value.
    pub async fn get_status_detail(&self, instance: &str) -> OrchestrationStatusDetail {
        let hist = self.history_store.read(instance).await;
        OrchestrationStatusDetail {
            status: status_from_history(&hist),
            custom_status: custom_status_from_history(&hist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_not_found() {
        assert_eq!(status_from_history(&[]), OrchestrationStatus::NotFound);
    }

    #[test]
    fn started_without_terminal_is_running() {
        let hist = vec![Event::OrchestrationStarted {
            name: "o".into(),
            input: "".into(),
        }];
        assert_eq!(status_from_history(&hist), OrchestrationStatus::Running);
    }

    #[test]
    fn terminated_reports_reason() {
        let hist = vec![
            Event::OrchestrationStarted {
                name: "o".into(),
                input: "".into(),
            },
            Event::OrchestrationTerminated {
                reason: "operator".into(),
            },
        ];
        assert_eq!(
            status_from_history(&hist),
            OrchestrationStatus::Terminated {
                reason: "operator".into()
            }
        );
    }

    #[test]
    fn latest_custom_status_wins() {
        let hist = vec![
            Event::CustomStatusSet { value: "phase-1".into() },
            Event::CustomStatusSet { value: "phase-2".into() },
        ];
        assert_eq!(custom_status_from_history(&hist), Some("phase-2".into()));
    }
}
