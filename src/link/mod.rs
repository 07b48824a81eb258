//! The processing chain abstraction.
//!
//! A storage node processes every message through a chain of links. Commands travel down the chain
//! (towards persistence), replies travel up (towards the sender). A link either passes a message on
//! to the next link or handles it itself, possibly answering with a reply sent back up.
//!
//! Links don't know their neighbours. They're given a [`MessageSender`] for each direction.
use crate::message::{StorageMessage, StorageReply};

pub mod mock;

/// One direction of the chain, as seen from a link
pub trait MessageSender: Send + Sync {
    fn send(&self, message: StorageMessage);
}

/// What a link did with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Passed unchanged to the next link
    Forward,
    /// Answered with an aborted reply. Never reaches the next link.
    Abort,
    /// Taken over by the link and forwarded later (eg: cluster state changes)
    Deferred,
}

pub trait StorageLink: Send + Sync {
    /// Called for every message travelling down the chain
    fn handle_inbound(&self, message: StorageMessage) -> Disposition;
    /// Called for every reply travelling up the chain
    fn handle_reply(&self, reply: StorageReply);
    /// Called once when the chain shuts down
    fn handle_close(&self);
}
