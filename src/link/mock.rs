//! Mock implementation for [`MessageSender`] that records everything sent through it
use std::sync::{Mutex, PoisonError};

use crate::message::{ResultCode, StorageMessage, StorageReply};

use super::MessageSender;

#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<StorageMessage>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything recorded so far
    pub fn take(&self) -> Vec<StorageMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every recorded reply with an aborted result.
    /// Everything else stays recorded, in order.
    pub fn take_aborted_replies(&self) -> Vec<StorageReply> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut aborted = Vec::new();
        let mut kept = Vec::with_capacity(sent.len());
        for message in sent.drain(..) {
            match message {
                StorageMessage::Reply(reply) if reply.result.code == ResultCode::Aborted => {
                    aborted.push(reply)
                }
                other => kept.push(other),
            }
        }
        *sent = kept;

        aborted
    }
}

impl MessageSender for RecordingSender {
    fn send(&self, message: StorageMessage) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}
