//! Pure step-transition validation shared by every store backend.
//!
//! [`validate`] decides, without I/O, what a proposed write means:
//!
//! 1. No existing record: the previous status is
//!    [`StepStatus::None`](crate::StepStatus::None).
//! 2. Same status as the existing record: equal payload is an idempotent
//!    redelivery, a different payload is a non-idempotent duplicate.
//! 3. Otherwise the transition table in
//!    [`StepStatus::allowed_next`](crate::StepStatus::allowed_next) decides.
//! 4. Finally the parent chain is walked to reject cycles.

use std::collections::{HashMap, HashSet};

use crate::{MessageId, SagaStepMetadata, StepKey};

/// Classification of a proposed step write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    ValidTransition,
    /// Same status and payload as stored; the caller must not write.
    Idempotent,
    DuplicateWithDifferentPayload,
    InvalidTransition,
    CircularChain,
}

/// Outcome of [`validate`]: the classification plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepValidation {
    pub result: ValidationResult,
    pub message: String,
}

impl StepValidation {
    fn new(result: ValidationResult, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }
}

/// Validates replacing `existing` with `proposed` for `key`.
///
/// `steps` is every record currently known in the saga; it is used for
/// the ancestry walk. The proposed record's message id, parent id and
/// status are read from `proposed`.
pub fn validate(
    steps: &[SagaStepMetadata],
    key: &StepKey,
    proposed: &SagaStepMetadata,
    existing: Option<&SagaStepMetadata>,
) -> StepValidation {
    let previous = existing.map(|e| e.status).unwrap_or_default();

    if previous == proposed.status {
        // `None` never reaches here as a proposal in practice, but an
        // absent record cannot be a duplicate of anything.
        if let Some(existing) = existing {
            return if existing.payload == proposed.payload {
                StepValidation::new(
                    ValidationResult::Idempotent,
                    format!("step {key} already recorded as {previous}"),
                )
            } else {
                StepValidation::new(
                    ValidationResult::DuplicateWithDifferentPayload,
                    format!("step {key} already recorded as {previous} with a different payload"),
                )
            };
        }
    }

    if !previous.can_transition_to(proposed.status) {
        return StepValidation::new(
            ValidationResult::InvalidTransition,
            format!(
                "step {key} cannot move from {previous} to {}",
                proposed.status
            ),
        );
    }

    if has_circular_chain(proposed.message_id, proposed.parent_message_id, steps) {
        return StepValidation::new(
            ValidationResult::CircularChain,
            format!("parent chain of step {key} revisits a message id"),
        );
    }

    StepValidation::new(
        ValidationResult::ValidTransition,
        format!("step {key}: {previous} -> {}", proposed.status),
    )
}

/// Follows parent pointers from `message_id` and reports whether any
/// message id is visited twice.
///
/// The walk is bounded by the number of distinct message ids known, so it
/// terminates on arbitrarily long legitimate chains as well as on cycles.
pub fn has_circular_chain(
    message_id: MessageId,
    parent_message_id: Option<MessageId>,
    steps: &[SagaStepMetadata],
) -> bool {
    let parents: HashMap<MessageId, Option<MessageId>> = steps
        .iter()
        .filter(|s| s.message_id != message_id)
        .map(|s| (s.message_id, s.parent_message_id))
        .collect();

    let mut visited = HashSet::with_capacity(parents.len() + 1);
    visited.insert(message_id);

    let mut current = parent_message_id;
    for _ in 0..=parents.len() {
        let Some(id) = current else {
            return false;
        };
        if !visited.insert(id) {
            return true;
        }
        current = parents.get(&id).copied().flatten();
    }

    false
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::StepStatus;

    fn record(
        step_type: &str,
        status: StepStatus,
        message_id: MessageId,
        parent: Option<MessageId>,
        payload: serde_json::Value,
    ) -> SagaStepMetadata {
        SagaStepMetadata {
            step_type: step_type.to_string(),
            handler_type: "TestHandler".to_string(),
            status,
            message_id,
            parent_message_id: parent,
            message_type_name: step_type.to_string(),
            application_id: None,
            payload,
            recorded_at: Utc::now(),
            failure: None,
        }
    }

    #[test]
    fn new_key_accepts_forward_status() {
        let proposed = record("A", StepStatus::Completed, MessageId::new(), None, json!({}));
        let result = validate(&[], &proposed.key(), &proposed, None);
        assert_eq!(result.result, ValidationResult::ValidTransition);
    }

    #[test]
    fn new_key_rejects_compensated() {
        let proposed = record("A", StepStatus::Compensated, MessageId::new(), None, json!({}));
        let result = validate(&[], &proposed.key(), &proposed, None);
        assert_eq!(result.result, ValidationResult::InvalidTransition);
    }

    #[test]
    fn same_status_same_payload_is_idempotent() {
        let id = MessageId::new();
        let existing = record("A", StepStatus::Completed, id, None, json!({"order": 1}));
        let proposed = record("A", StepStatus::Completed, id, None, json!({"order": 1}));
        let result = validate(
            std::slice::from_ref(&existing),
            &proposed.key(),
            &proposed,
            Some(&existing),
        );
        assert_eq!(result.result, ValidationResult::Idempotent);
    }

    #[test]
    fn same_status_different_payload_is_duplicate() {
        let id = MessageId::new();
        let existing = record("A", StepStatus::Completed, id, None, json!({"order": 1}));
        let proposed = record("A", StepStatus::Completed, id, None, json!({"order": 2}));
        let result = validate(
            std::slice::from_ref(&existing),
            &proposed.key(),
            &proposed,
            Some(&existing),
        );
        assert_eq!(result.result, ValidationResult::DuplicateWithDifferentPayload);
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let id = MessageId::new();
        let existing = record("A", StepStatus::Compensated, id, None, json!({}));
        let proposed = record("A", StepStatus::Completed, id, None, json!({}));
        let result = validate(
            std::slice::from_ref(&existing),
            &proposed.key(),
            &proposed,
            Some(&existing),
        );
        assert_eq!(result.result, ValidationResult::InvalidTransition);
        assert!(result.message.contains("Compensated"));
    }

    #[test]
    fn every_status_pair_follows_the_table() {
        let id = MessageId::new();
        for from in StepStatus::ALL {
            for to in StepStatus::ALL.into_iter().filter(|s| *s != StepStatus::None) {
                let existing = (from != StepStatus::None)
                    .then(|| record("A", from, id, None, json!({"v": 1})));
                let proposed = record("A", to, id, None, json!({"v": 1}));
                let steps: Vec<_> = existing.iter().cloned().collect();
                let result = validate(&steps, &proposed.key(), &proposed, existing.as_ref());

                let expected = if from == to {
                    ValidationResult::Idempotent
                } else if from.can_transition_to(to) {
                    ValidationResult::ValidTransition
                } else {
                    ValidationResult::InvalidTransition
                };
                assert_eq!(result.result, expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn three_step_cycle_is_detected_from_any_member() {
        let a = MessageId::new();
        let b = MessageId::new();
        let c = MessageId::new();
        let steps = vec![
            record("A", StepStatus::Started, a, Some(c), json!({})),
            record("B", StepStatus::Started, b, Some(a), json!({})),
            record("C", StepStatus::Started, c, Some(b), json!({})),
        ];

        for existing in &steps {
            let mut proposed = existing.clone();
            proposed.status = StepStatus::Completed;
            let result = validate(&steps, &proposed.key(), &proposed, Some(existing));
            assert_eq!(result.result, ValidationResult::CircularChain);
        }
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let id = MessageId::new();
        assert!(has_circular_chain(id, Some(id), &[]));
    }

    #[test]
    fn long_linear_chain_is_not_a_cycle() {
        let ids: Vec<MessageId> = (0..500).map(|_| MessageId::new()).collect();
        let steps: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let parent = i.checked_sub(1).map(|p| ids[p]);
                record("Step", StepStatus::Completed, *id, parent, json!({}))
            })
            .collect();

        let tail = MessageId::new();
        assert!(!has_circular_chain(tail, ids.last().copied(), &steps));
    }

    #[test]
    fn missing_parent_ends_the_walk() {
        assert!(!has_circular_chain(
            MessageId::new(),
            Some(MessageId::new()),
            &[]
        ));
    }
}
