//! Event queues.
//!
//! The step loop owns both queues and drains the internal queue before
//! touching the external one. External producers (callers, invoked
//! services, delayed sends) hand events off through a cloneable
//! [`EventSender`]; insertion order is preserved per producer.

use crate::error::CommunicationError;
use crate::event::Event;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Thread-safe writer side of the external queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Enqueues an external event. Fails once the run has ended.
    pub fn send(&self, event: Event) -> Result<(), CommunicationError> {
        self.tx
            .send(event)
            .map_err(|_| CommunicationError::ChannelClosed)
    }
}

/// The interpreter's event queues: internal FIFO plus external channel.
pub struct EventQueue {
    internal: VecDeque<Event>,
    external_rx: mpsc::UnboundedReceiver<Event>,
    external_tx: mpsc::UnboundedSender<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        Self {
            internal: VecDeque::new(),
            external_rx,
            external_tx,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.external_tx.clone(),
        }
    }

    pub fn push_internal(&mut self, event: Event) {
        self.internal.push_back(event);
    }

    /// Next internal event, if any.
    pub fn pop_internal(&mut self) -> Option<Event> {
        self.internal.pop_front()
    }

    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    /// Next event without blocking: internal first, then whatever the
    /// external channel already holds.
    pub fn try_next(&mut self) -> Option<Event> {
        if let Some(event) = self.internal.pop_front() {
            return Some(event);
        }
        self.external_rx.try_recv().ok()
    }

    /// Next event, suspending until an external event arrives when both
    /// queues are empty.
    pub async fn next(&mut self) -> Option<Event> {
        if let Some(event) = self.internal.pop_front() {
            return Some(event);
        }
        self.external_rx.recv().await
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[tokio::test]
    async fn internal_drains_before_external() {
        let mut queue = EventQueue::new();
        let sender = queue.sender();

        sender.send(Event::external("ext")).unwrap();
        queue.push_internal(Event::internal("int"));

        let first = queue.next().await.unwrap();
        assert_eq!(first.name, "int");
        assert_eq!(first.kind, EventKind::Internal);

        let second = queue.next().await.unwrap();
        assert_eq!(second.name, "ext");
    }

    #[tokio::test]
    async fn external_order_preserved_per_producer() {
        let mut queue = EventQueue::new();
        let sender = queue.sender();

        for i in 0..5 {
            sender.send(Event::external(format!("e{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.next().await.unwrap().name, format!("e{i}"));
        }
    }

    #[test]
    fn try_next_does_not_block() {
        let mut queue = EventQueue::new();
        assert!(queue.try_next().is_none());

        queue.push_internal(Event::internal("only"));
        assert_eq!(queue.try_next().unwrap().name, "only");
        assert!(queue.try_next().is_none());
    }

    #[tokio::test]
    async fn send_fails_after_queue_dropped() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        drop(queue);

        let result = sender.send(Event::external("late"));
        assert!(matches!(result, Err(CommunicationError::ChannelClosed)));
    }
}
