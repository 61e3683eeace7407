//! Per-machine FIFO message buffer with deferral-aware peeking.
//!
//! The queue never judges deferral itself. The caller passes a predicate
//! answering "is this message deferred by its receiver right now?", so the
//! same queue works whether it holds a machine's inbound messages
//! (receiver-queue semantics) or its outbound ones (sender-queue semantics).
//!
//! `dequeue_next` removes exactly the message the last `peek_next` observed.
//! Deferred messages are skipped but never discarded, and the relative order
//! of everything left behind is preserved.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::Message;
use crate::error::{CheckerError, Result};

/// Ordered buffer of messages owned by one machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageQueue {
    messages: VecDeque<Message>,
    #[serde(skip)]
    peeked: Option<usize>,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the back.
    pub fn enqueue(&mut self, message: Message) {
        self.messages.push_back(message);
        // Positions before the new tail are unchanged, so a cached peek stays valid.
    }

    /// Number of buffered messages, deferred ones included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the buffer holds no messages at all.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Iterate buffered messages in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Return the earliest message that is not deferred, remembering it for
    /// the next [`dequeue_next`](Self::dequeue_next).
    pub fn peek_next(&mut self, is_deferred: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.peeked = self.messages.iter().position(|m| !is_deferred(m));
        self.peeked.and_then(|i| self.messages.get(i))
    }

    /// Same search as [`peek_next`](Self::peek_next) without touching the
    /// remembered position.
    pub fn find_next(&self, is_deferred: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.messages.iter().find(|m| !is_deferred(m))
    }

    /// Remove and return the message observed by the last `peek_next`.
    pub fn dequeue_next(&mut self) -> Result<Message> {
        let index = self
            .peeked
            .take()
            .ok_or_else(|| CheckerError::internal("dequeue_next called without a preceding peek_next"))?;
        self.messages
            .remove(index)
            .ok_or_else(|| CheckerError::internal("peeked message vanished from queue"))
    }

    /// Whether the next deliverable message creates a machine.
    pub fn has_create_machine_pending(&self, is_deferred: impl Fn(&Message) -> bool) -> bool {
        self.find_next(is_deferred)
            .map(Message::is_create_machine)
            .unwrap_or(false)
    }

    /// Whether the next deliverable message carries a synchronous event.
    pub fn has_sync_event_pending(&self, is_deferred: impl Fn(&Message) -> bool) -> bool {
        self.find_next(is_deferred).map(Message::is_sync).unwrap_or(false)
    }

    /// Whether at least one message could be delivered now.
    pub fn has_deliverable(&self, is_deferred: impl Fn(&Message) -> bool) -> bool {
        self.find_next(is_deferred).is_some()
    }

    /// Drop every buffered message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.peeked = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, MachineId};

    fn msg(event: &str) -> Message {
        Message::new(event, MachineId::new("M", 0), None, None)
    }

    #[test]
    fn test_peek_skips_deferred_without_discarding() {
        let mut q = MessageQueue::new();
        q.enqueue(msg("A"));
        q.enqueue(msg("B"));
        q.enqueue(msg("C"));

        let in_s = |m: &Message| m.event.name() == "A";
        assert_eq!(q.peek_next(in_s).unwrap().event.name(), "B");
        let b = q.dequeue_next().unwrap();
        assert_eq!(b.event.name(), "B");
        assert_eq!(q.len(), 2);

        // After leaving the deferring state, A is first again.
        assert_eq!(q.peek_next(|_| false).unwrap().event.name(), "A");
        let names: Vec<_> = q.iter().map(|m| m.event.name().to_string()).collect();
        assert_eq!(names, vec!["A", "C"]);
    }

    #[test]
    fn test_dequeue_without_peek_is_internal_error() {
        let mut q = MessageQueue::new();
        q.enqueue(msg("A"));
        let err = q.dequeue_next().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Internal);

        q.peek_next(|_| false);
        q.dequeue_next().unwrap();
        // The peek is consumed by the dequeue.
        q.enqueue(msg("B"));
        assert!(q.dequeue_next().is_err());
    }

    #[test]
    fn test_all_deferred_peeks_nothing() {
        let mut q = MessageQueue::new();
        q.enqueue(msg("A"));
        assert!(q.peek_next(|_| true).is_none());
        assert!(q.dequeue_next().is_err());
        assert!(!q.has_deliverable(|_| true));
        assert!(!q.is_empty());
    }

    #[test]
    fn test_priority_predicates_look_at_next_deliverable() {
        let mut q = MessageQueue::new();
        q.enqueue(msg("A"));
        q.enqueue(Message::new(
            Event::synchronous("Reply"),
            MachineId::new("M", 0),
            None,
            None,
        ));
        q.enqueue(Message::new(Event::create_machine(), MachineId::new("N", 0), None, None));

        assert!(!q.has_sync_event_pending(|_| false));
        assert!(q.has_sync_event_pending(|m| m.event.name() == "A"));
        assert!(!q.has_create_machine_pending(|m| m.event.name() == "A"));
        assert!(q.has_create_machine_pending(|m| !m.is_create_machine()));
    }
}
