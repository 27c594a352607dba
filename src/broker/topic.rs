use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::error::SendError;

use super::{MessageSelector, TransportMessage};

pub type SubscriberId = String;

/// A consumer's end of a destination: its delivery channel and filter.
#[derive(Debug)]
pub struct Subscriber {
    pub sender: UnboundedSender<TransportMessage>,
    pub selector: Option<MessageSelector>,
}

impl Subscriber {
    pub fn accepts(&self, message: &TransportMessage) -> bool {
        self.selector
            .as_ref()
            .is_none_or(|selector| selector.matches(&message.properties))
    }
}

/// Fans every message out to all matching subscribers.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub temporary: bool,
    pub subscribers: HashMap<SubscriberId, Subscriber>,
}

impl Topic {
    pub fn new(name: &str, temporary: bool) -> Self {
        Self {
            name: name.to_string(),
            temporary,
            subscribers: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, id: SubscriberId, subscriber: Subscriber) {
        self.subscribers.insert(id, subscriber);
    }

    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, message: &TransportMessage) -> usize {
        self.subscribers
            .values()
            .filter(|subscriber| subscriber.accepts(message))
            .filter(|subscriber| subscriber.sender.send(message.clone()).is_ok())
            .count()
    }
}

/// Hands each message to exactly one matching consumer, rotating between
/// them. Messages nobody can take wait until a matching consumer arrives.
#[derive(Debug, Default)]
pub struct Queue {
    pub name: String,
    pub temporary: bool,
    consumers: Vec<(SubscriberId, Subscriber)>,
    pending: VecDeque<TransportMessage>,
    next: usize,
}

impl Queue {
    pub fn new(name: &str, temporary: bool) -> Self {
        Self {
            name: name.to_string(),
            temporary,
            ..Self::default()
        }
    }

    pub fn subscribe(&mut self, id: SubscriberId, subscriber: Subscriber) {
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(message) = self.pending.pop_front() {
            if !subscriber.accepts(&message) {
                waiting.push_back(message);
            } else if let Err(SendError(message)) = subscriber.sender.send(message) {
                waiting.push_back(message);
            }
        }
        self.pending = waiting;
        self.consumers.push((id, subscriber));
    }

    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|(consumer_id, _)| consumer_id != id);
        before != self.consumers.len()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn publish(&mut self, message: TransportMessage) {
        let count = self.consumers.len();
        let mut message = message;
        for offset in 0..count {
            let index = (self.next + offset) % count;
            let (_, subscriber) = &self.consumers[index];
            if !subscriber.accepts(&message) {
                continue;
            }
            match subscriber.sender.send(message) {
                Ok(()) => {
                    self.next = (index + 1) % count;
                    return;
                }
                Err(SendError(returned)) => message = returned,
            }
        }
        self.pending.push_back(message);
    }
}
