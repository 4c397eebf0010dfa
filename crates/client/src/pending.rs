//! Outstanding sends awaiting `message_sent`
//!
//! A correlation table from temp ID to a one-shot completion with a deadline.
//! Every entry is settled exactly once: resolved by its ack, rejected by its
//! deadline, or rejected as a unit when the session ends.

use std::collections::HashMap;

use deskline_shared::{MessageId, TempId};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ClientError;

/// Completion handed back to the caller of a send
pub type SendCompletion = oneshot::Sender<Result<MessageId, ClientError>>;

struct PendingSend {
    deadline: Instant,
    completion: SendCompletion,
}

#[derive(Default)]
pub struct PendingSends {
    entries: HashMap<TempId, PendingSend>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a send. A temp ID already in flight is refused and the
    /// completion handed back untouched.
    pub fn insert(
        &mut self,
        temp_id: TempId,
        deadline: Instant,
        completion: SendCompletion,
    ) -> Result<(), SendCompletion> {
        if self.entries.contains_key(&temp_id) {
            return Err(completion);
        }
        self.entries.insert(
            temp_id,
            PendingSend {
                deadline,
                completion,
            },
        );
        Ok(())
    }

    /// Settle a send with its durable ID. Returns `false` when nothing was
    /// waiting (already timed out, or never sent from this session).
    pub fn resolve(&mut self, temp_id: &TempId, durable_id: MessageId) -> bool {
        match self.entries.remove(temp_id) {
            Some(pending) => {
                // The caller may have stopped waiting
                let _ = pending.completion.send(Ok(durable_id));
                true
            }
            None => false,
        }
    }

    pub fn reject(&mut self, temp_id: &TempId, err: ClientError) -> bool {
        match self.entries.remove(temp_id) {
            Some(pending) => {
                let _ = pending.completion.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Reject everything outstanding; returns how many were rejected
    pub fn reject_all(&mut self, err: ClientError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.completion.send(Err(err.clone()));
        }
        count
    }

    /// Reject every send whose deadline is at or before `now`
    pub fn expire_due(&mut self, now: Instant) -> Vec<TempId> {
        let due: Vec<TempId> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(temp_id, _)| temp_id.clone())
            .collect();

        for temp_id in &due {
            self.reject(temp_id, ClientError::Timeout);
        }
        due
    }

    /// Earliest outstanding deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|pending| pending.deadline).min()
    }

    pub fn contains(&self, temp_id: &TempId) -> bool {
        self.entries.contains_key(temp_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
