//! Optimistic local view of a room's messages
//!
//! Local actions (compose, withdraw, read) are applied here before the server
//! confirms them, and server frames are folded into the same view. Every
//! mutation, local or remote, goes through [`LocalMessages::apply_optimistic`],
//! which is idempotent: applying a change twice leaves the same state as
//! applying it once, and reports [`Applied::Unchanged`] the second time.
//!
//! A local withdrawal only hides the message. Its content is dropped once the
//! server confirms, and restored if the server rejects it.

use std::collections::{BTreeSet, HashMap};

use deskline_shared::{MessageId, TempId, UserId};

/// Where a locally composed message stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Transmitted (or about to be); no durable ID yet
    Sending,
    /// The server assigned a durable ID
    Sent,
    /// Never reached the server
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    /// Withdrawn locally, not yet confirmed
    Requested,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub temp_id: Option<TempId>,
    pub durable_id: Option<MessageId>,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub internal: bool,
    pub state: DeliveryState,
    pub withdrawal: Option<Withdrawal>,
    pub read_by: BTreeSet<UserId>,
}

impl LocalMessage {
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawal.is_some()
    }
}

/// One mutation of the local view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// A message composed on this client
    Compose {
        temp_id: TempId,
        sender_id: Option<UserId>,
        content: String,
        internal: bool,
    },
    /// `message_sent`: the composed message now has a durable ID
    Acknowledge { temp_id: TempId, durable_id: MessageId },
    /// A composed message could not be transmitted
    Fail { temp_id: TempId },
    /// `new_message` from another participant
    Remote {
        durable_id: MessageId,
        sender_id: UserId,
        content: String,
        internal: bool,
    },
    /// Withdrawal requested on this client
    Withdraw { message_id: MessageId },
    /// `message_withdrawn`: the server's withdrawal, ours or another participant's
    ConfirmWithdraw { message_id: MessageId },
    /// The server refused our withdrawal
    RevertWithdraw { message_id: MessageId },
    Read { message_id: MessageId, user_id: UserId },
    /// The server refused our read receipt
    RevertRead { message_id: MessageId, user_id: UserId },
}

/// Result of applying a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Already in the requested state
    Unchanged,
    /// The change refers to a message this view has never seen
    Unknown,
}

#[derive(Debug, Default)]
pub struct LocalMessages {
    entries: Vec<LocalMessage>,
    by_temp: HashMap<TempId, usize>,
    by_durable: HashMap<MessageId, usize>,
}

impl LocalMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change to the local view
    pub fn apply_optimistic(&mut self, change: LocalChange) -> Applied {
        match change {
            LocalChange::Compose {
                temp_id,
                sender_id,
                content,
                internal,
            } => {
                if self.by_temp.contains_key(&temp_id) {
                    return Applied::Unchanged;
                }
                self.by_temp.insert(temp_id.clone(), self.entries.len());
                self.entries.push(LocalMessage {
                    temp_id: Some(temp_id),
                    durable_id: None,
                    sender_id,
                    content,
                    internal,
                    state: DeliveryState::Sending,
                    withdrawal: None,
                    read_by: BTreeSet::new(),
                });
                Applied::Changed
            }

            LocalChange::Acknowledge {
                temp_id,
                durable_id,
            } => {
                let Some(&index) = self.by_temp.get(&temp_id) else {
                    return Applied::Unknown;
                };
                let entry = &mut self.entries[index];
                if entry.durable_id == Some(durable_id) && entry.state == DeliveryState::Sent {
                    return Applied::Unchanged;
                }
                entry.durable_id = Some(durable_id);
                entry.state = DeliveryState::Sent;
                self.by_durable.insert(durable_id, index);
                Applied::Changed
            }

            LocalChange::Fail { temp_id } => {
                let Some(&index) = self.by_temp.get(&temp_id) else {
                    return Applied::Unknown;
                };
                let entry = &mut self.entries[index];
                if entry.state != DeliveryState::Sending {
                    return Applied::Unchanged;
                }
                entry.state = DeliveryState::Failed;
                Applied::Changed
            }

            LocalChange::Remote {
                durable_id,
                sender_id,
                content,
                internal,
            } => {
                if self.by_durable.contains_key(&durable_id) {
                    return Applied::Unchanged;
                }
                self.by_durable.insert(durable_id, self.entries.len());
                self.entries.push(LocalMessage {
                    temp_id: None,
                    durable_id: Some(durable_id),
                    sender_id: Some(sender_id),
                    content,
                    internal,
                    state: DeliveryState::Sent,
                    withdrawal: None,
                    read_by: BTreeSet::new(),
                });
                Applied::Changed
            }

            LocalChange::Withdraw { message_id } => {
                let Some(entry) = self.get_mut(message_id) else {
                    return Applied::Unknown;
                };
                if entry.withdrawal.is_some() {
                    return Applied::Unchanged;
                }
                entry.withdrawal = Some(Withdrawal::Requested);
                Applied::Changed
            }

            LocalChange::ConfirmWithdraw { message_id } => {
                let Some(entry) = self.get_mut(message_id) else {
                    return Applied::Unknown;
                };
                if entry.withdrawal == Some(Withdrawal::Confirmed) {
                    return Applied::Unchanged;
                }
                entry.withdrawal = Some(Withdrawal::Confirmed);
                entry.content.clear();
                Applied::Changed
            }

            LocalChange::RevertWithdraw { message_id } => {
                let Some(entry) = self.get_mut(message_id) else {
                    return Applied::Unknown;
                };
                // A confirmed withdrawal is the server's word and stays
                if entry.withdrawal != Some(Withdrawal::Requested) {
                    return Applied::Unchanged;
                }
                entry.withdrawal = None;
                Applied::Changed
            }

            LocalChange::Read {
                message_id,
                user_id,
            } => {
                let Some(entry) = self.get_mut(message_id) else {
                    return Applied::Unknown;
                };
                if entry.read_by.insert(user_id) {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }

            LocalChange::RevertRead {
                message_id,
                user_id,
            } => {
                let Some(entry) = self.get_mut(message_id) else {
                    return Applied::Unknown;
                };
                if entry.read_by.remove(&user_id) {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&LocalMessage> {
        self.by_durable
            .get(&message_id)
            .and_then(|&index| self.entries.get(index))
    }

    fn get_mut(&mut self, message_id: MessageId) -> Option<&mut LocalMessage> {
        let index = *self.by_durable.get(&message_id)?;
        self.entries.get_mut(index)
    }

    pub fn get_by_temp(&self, temp_id: &TempId) -> Option<&LocalMessage> {
        self.by_temp
            .get(temp_id)
            .and_then(|&index| self.entries.get(index))
    }

    /// All messages in the order they entered this view
    pub fn snapshot(&self) -> Vec<LocalMessage> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose(local: &mut LocalMessages, temp: &str) -> Applied {
        local.apply_optimistic(LocalChange::Compose {
            temp_id: TempId::from(temp),
            sender_id: None,
            content: "hello".to_string(),
            internal: false,
        })
    }

    #[test]
    fn test_compose_then_acknowledge_remaps_to_durable_id() {
        let mut local = LocalMessages::new();
        assert_eq!(compose(&mut local, "t1"), Applied::Changed);
        assert_eq!(compose(&mut local, "t1"), Applied::Unchanged);
        assert_eq!(
            local.get_by_temp(&TempId::from("t1")).unwrap().state,
            DeliveryState::Sending
        );

        let ack = LocalChange::Acknowledge {
            temp_id: TempId::from("t1"),
            durable_id: MessageId(10),
        };
        assert_eq!(local.apply_optimistic(ack.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(ack), Applied::Unchanged);

        let entry = local.get(MessageId(10)).unwrap();
        assert_eq!(entry.state, DeliveryState::Sent);
        assert_eq!(entry.temp_id, Some(TempId::from("t1")));
        assert_eq!(local.len(), 1);
    }

    fn remote(local: &mut LocalMessages, id: i64, content: &str) {
        local.apply_optimistic(LocalChange::Remote {
            durable_id: MessageId(id),
            sender_id: UserId::new(),
            content: content.to_string(),
            internal: false,
        });
    }

    #[test]
    fn test_withdraw_is_idempotent() {
        let mut local = LocalMessages::new();
        remote(&mut local, 3, "secret");

        let withdraw = LocalChange::Withdraw {
            message_id: MessageId(3),
        };
        assert_eq!(local.apply_optimistic(withdraw.clone()), Applied::Changed);
        let once = local.snapshot();
        assert_eq!(local.apply_optimistic(withdraw), Applied::Unchanged);
        assert_eq!(local.snapshot(), once);

        // Hidden, but the text survives until the server confirms
        let entry = local.get(MessageId(3)).unwrap();
        assert_eq!(entry.withdrawal, Some(Withdrawal::Requested));
        assert_eq!(entry.content, "secret");

        let confirm = LocalChange::ConfirmWithdraw {
            message_id: MessageId(3),
        };
        assert_eq!(local.apply_optimistic(confirm.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(confirm), Applied::Unchanged);
        let entry = local.get(MessageId(3)).unwrap();
        assert_eq!(entry.withdrawal, Some(Withdrawal::Confirmed));
        assert!(entry.content.is_empty());
    }

    #[test]
    fn test_rejected_withdraw_restores_the_message() {
        let mut local = LocalMessages::new();
        remote(&mut local, 7, "not yours to withdraw");

        local.apply_optimistic(LocalChange::Withdraw {
            message_id: MessageId(7),
        });
        let revert = LocalChange::RevertWithdraw {
            message_id: MessageId(7),
        };
        assert_eq!(local.apply_optimistic(revert.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(revert.clone()), Applied::Unchanged);

        let entry = local.get(MessageId(7)).unwrap();
        assert!(!entry.is_withdrawn());
        assert_eq!(entry.content, "not yours to withdraw");

        // Never undoes a withdrawal the server announced
        local.apply_optimistic(LocalChange::ConfirmWithdraw {
            message_id: MessageId(7),
        });
        assert_eq!(local.apply_optimistic(revert), Applied::Unchanged);
        assert!(local.get(MessageId(7)).unwrap().is_withdrawn());
    }

    #[test]
    fn test_rejected_read_is_removed() {
        let mut local = LocalMessages::new();
        remote(&mut local, 8, "hi");
        let reader = UserId::new();

        local.apply_optimistic(LocalChange::Read {
            message_id: MessageId(8),
            user_id: reader,
        });
        let revert = LocalChange::RevertRead {
            message_id: MessageId(8),
            user_id: reader,
        };
        assert_eq!(local.apply_optimistic(revert.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(revert), Applied::Unchanged);
        assert!(local.get(MessageId(8)).unwrap().read_by.is_empty());
    }

    #[test]
    fn test_read_receipt_is_idempotent() {
        let mut local = LocalMessages::new();
        remote(&mut local, 4, "hi");

        let reader = UserId::new();
        let read = LocalChange::Read {
            message_id: MessageId(4),
            user_id: reader,
        };
        assert_eq!(local.apply_optimistic(read.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(read), Applied::Unchanged);
        assert_eq!(local.get(MessageId(4)).unwrap().read_by.len(), 1);
    }

    #[test]
    fn test_changes_to_unseen_messages_are_unknown() {
        let mut local = LocalMessages::new();
        assert_eq!(
            local.apply_optimistic(LocalChange::Withdraw {
                message_id: MessageId(99)
            }),
            Applied::Unknown
        );
        assert_eq!(
            local.apply_optimistic(LocalChange::Acknowledge {
                temp_id: TempId::from("never"),
                durable_id: MessageId(99),
            }),
            Applied::Unknown
        );
        assert!(local.is_empty());
    }

    #[test]
    fn test_failed_send_can_still_be_acknowledged() {
        let mut local = LocalMessages::new();
        compose(&mut local, "t2");

        let fail = LocalChange::Fail {
            temp_id: TempId::from("t2"),
        };
        assert_eq!(local.apply_optimistic(fail.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(fail), Applied::Unchanged);

        local.apply_optimistic(LocalChange::Acknowledge {
            temp_id: TempId::from("t2"),
            durable_id: MessageId(5),
        });
        assert_eq!(local.get(MessageId(5)).unwrap().state, DeliveryState::Sent);
    }

    #[test]
    fn test_remote_duplicate_is_ignored() {
        let mut local = LocalMessages::new();
        let remote = LocalChange::Remote {
            durable_id: MessageId(1),
            sender_id: UserId::new(),
            content: "x".to_string(),
            internal: false,
        };
        assert_eq!(local.apply_optimistic(remote.clone()), Applied::Changed);
        assert_eq!(local.apply_optimistic(remote), Applied::Unchanged);
        assert_eq!(local.len(), 1);
    }
}
