use crate::Message;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewindTargetError {
    #[error("message index {index} out of range (thread has {len} messages)")]
    OutOfRange { index: u64, len: usize },
    #[error("message {index} was not written by the end user")]
    NotEndUser { index: u64 },
    #[error("message {index} cannot be rewound right now")]
    NotEligible { index: u64 },
}

/// End-user turns the executor has already moved past, minus any turn that
/// is currently being rewound.
pub fn rewindable_indices(messages: &[Message], in_flight: Option<u64>) -> BTreeSet<u64> {
    let Some(last_index) = messages.iter().map(|message| message.message_index).max() else {
        return BTreeSet::new();
    };
    messages
        .iter()
        .filter(|message| message.originator.is_end_user())
        .map(|message| message.message_index)
        .filter(|index| *index < last_index)
        .filter(|index| Some(*index) != in_flight)
        .collect()
}

/// Sets `can_rewind_before` on end-user messages and clears it everywhere else.
pub fn apply_rewind_flags(messages: &mut [Message], eligible: &BTreeSet<u64>) {
    for message in messages {
        message.can_rewind_before = if message.originator.is_end_user() {
            Some(eligible.contains(&message.message_index))
        } else {
            None
        };
    }
}

pub fn check_rewind_target<'a>(
    messages: &'a [Message],
    index: u64,
    eligible: &BTreeSet<u64>,
) -> Result<&'a Message, RewindTargetError> {
    let target = messages
        .iter()
        .find(|message| message.message_index == index)
        .ok_or(RewindTargetError::OutOfRange {
            index,
            len: messages.len(),
        })?;
    if !target.originator.is_end_user() {
        return Err(RewindTargetError::NotEndUser { index });
    }
    if !eligible.contains(&index) {
        return Err(RewindTargetError::NotEligible { index });
    }
    Ok(target)
}
