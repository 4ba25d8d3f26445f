//! Terminal outcome of one work item.

use super::validation::ValidationError;
use super::work_item::ItemResult;
use crate::resilience::SendError;

/// Why an item failed terminally.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("retries exhausted: {0}")]
    Exhausted(String),

    #[error("request rejected: {0}")]
    NonRetryable(String),

    #[error("item pipeline panicked: {0}")]
    Panicked(String),
}

/// Outcome of processing one item.
///
/// `Cancelled` is not terminal: the item was abandoned by shutdown and is
/// left unmarked so the next run picks it up.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Succeeded(ItemResult),
    Failed(FailureReason),
    Cancelled,
}

impl ItemOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemOutcome::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded(_))
    }
}

impl From<SendError> for ItemOutcome {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Cancelled => ItemOutcome::Cancelled,
            SendError::NonRetryable(api) => ItemOutcome::Failed(FailureReason::NonRetryable(api.to_string())),
            exhausted @ SendError::AllRetriesExhausted { .. } => {
                ItemOutcome::Failed(FailureReason::Exhausted(exhausted.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ApiError;
    use crate::resilience::AttemptError;
    use serde_json::Map;

    #[test]
    fn test_outcome_terminality() {
        assert!(ItemOutcome::Succeeded(ItemResult::new("a", Map::new())).is_terminal());
        assert!(ItemOutcome::Failed(FailureReason::Panicked("boom".into())).is_terminal());
        assert!(!ItemOutcome::Cancelled.is_terminal());
    }

    #[test]
    fn test_outcome_from_send_error() {
        assert_eq!(ItemOutcome::from(SendError::Cancelled), ItemOutcome::Cancelled);

        let outcome = ItemOutcome::from(SendError::AllRetriesExhausted {
            attempts: 3,
            last: Box::new(AttemptError::Api(ApiError::Timeout)),
        });
        assert!(matches!(outcome, ItemOutcome::Failed(FailureReason::Exhausted(ref msg)) if msg.contains("3 attempts")));

        let outcome = ItemOutcome::from(SendError::NonRetryable(ApiError::Rejected {
            status: 401,
            message: "bad key".into(),
        }));
        assert!(matches!(outcome, ItemOutcome::Failed(FailureReason::NonRetryable(_))));
    }

    #[test]
    fn test_failure_reason_from_validation() {
        let reason: FailureReason = ValidationError::missing("summary").into();
        assert_eq!(reason.to_string(), "validation failed: Missing field: summary");
    }
}
