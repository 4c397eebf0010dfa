//! Withdrawals and read receipts not yet settled with the server
//!
//! Both are applied to the local view first. The intent stays here until it
//! has been written to a live session, and a withdrawal stays until the
//! server confirms or rejects it. A session lost in between puts unconfirmed
//! withdrawals back in line for the next one; the server applies both kinds
//! idempotently, so a resend is harmless.

use std::collections::BTreeSet;

use deskline_shared::MessageId;

/// One frame owed to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Withdraw(MessageId),
    Read(MessageId),
}

#[derive(Debug, Default)]
pub struct Outbox {
    unsent_withdrawals: BTreeSet<MessageId>,
    awaiting_withdrawals: BTreeSet<MessageId>,
    unsent_reads: BTreeSet<MessageId>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a withdrawal. Returns `false` when one is already queued or
    /// awaiting its outcome.
    pub fn queue_withdrawal(&mut self, message_id: MessageId) -> bool {
        if self.awaiting_withdrawals.contains(&message_id) {
            return false;
        }
        self.unsent_withdrawals.insert(message_id)
    }

    pub fn queue_read(&mut self, message_id: MessageId) -> bool {
        self.unsent_reads.insert(message_id)
    }

    /// Everything not yet written to a session, withdrawals first. Withdrawals
    /// handed out here await their outcome from then on.
    pub fn take_unsent(&mut self) -> Vec<Intent> {
        let withdrawals = std::mem::take(&mut self.unsent_withdrawals);
        self.awaiting_withdrawals.extend(withdrawals.iter().copied());

        withdrawals
            .into_iter()
            .map(Intent::Withdraw)
            .chain(std::mem::take(&mut self.unsent_reads).into_iter().map(Intent::Read))
            .collect()
    }

    /// Put back an intent that could not be written
    pub fn requeue(&mut self, intent: Intent) {
        match intent {
            Intent::Withdraw(message_id) => {
                self.awaiting_withdrawals.remove(&message_id);
                self.unsent_withdrawals.insert(message_id);
            }
            Intent::Read(message_id) => {
                self.unsent_reads.insert(message_id);
            }
        }
    }

    /// The server confirmed or rejected a withdrawal. Returns `false` when
    /// this client was not waiting on one for `message_id`.
    pub fn settle_withdrawal(&mut self, message_id: MessageId) -> bool {
        let awaiting = self.awaiting_withdrawals.remove(&message_id);
        let unsent = self.unsent_withdrawals.remove(&message_id);
        awaiting || unsent
    }

    /// The session ended; outcomes it never delivered are owed again
    pub fn session_lost(&mut self) {
        let awaiting = std::mem::take(&mut self.awaiting_withdrawals);
        self.unsent_withdrawals.extend(awaiting);
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent_withdrawals.is_empty() || !self.unsent_reads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawal_is_queued_once_until_settled() {
        let mut outbox = Outbox::new();
        assert!(outbox.queue_withdrawal(MessageId(1)));
        assert!(!outbox.queue_withdrawal(MessageId(1)));

        assert_eq!(outbox.take_unsent(), vec![Intent::Withdraw(MessageId(1))]);
        assert!(!outbox.has_unsent());
        // Still awaiting its outcome
        assert!(!outbox.queue_withdrawal(MessageId(1)));

        assert!(outbox.settle_withdrawal(MessageId(1)));
        assert!(!outbox.settle_withdrawal(MessageId(1)));
        assert!(outbox.queue_withdrawal(MessageId(1)));
    }

    #[test]
    fn test_lost_session_owes_unconfirmed_withdrawals_again() {
        let mut outbox = Outbox::new();
        outbox.queue_withdrawal(MessageId(1));
        outbox.queue_withdrawal(MessageId(2));
        outbox.queue_read(MessageId(3));
        assert_eq!(outbox.take_unsent().len(), 3);

        outbox.settle_withdrawal(MessageId(2));
        outbox.session_lost();

        // Reads are not confirmed, so only the open withdrawal returns
        assert_eq!(outbox.take_unsent(), vec![Intent::Withdraw(MessageId(1))]);
    }

    #[test]
    fn test_requeued_intents_go_out_again() {
        let mut outbox = Outbox::new();
        outbox.queue_withdrawal(MessageId(5));
        outbox.queue_read(MessageId(6));
        for intent in outbox.take_unsent() {
            outbox.requeue(intent);
        }
        assert_eq!(
            outbox.take_unsent(),
            vec![Intent::Withdraw(MessageId(5)), Intent::Read(MessageId(6))]
        );
    }
}
