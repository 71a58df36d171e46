// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker with transacted sessions.
//!
//! Queues have competing consumers, topics fan out to every live subscriber
//! (non-durable: publishing to a topic nobody listens to drops the message).
//! Rolled back messages go back to the head of their source until the
//! redelivery budget is spent, then to `DLQ.<destination>`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    BrokerConsumer, BrokerMessage, BrokerSession, Destination, MapMessage, MessageBroker,
    RollbackDisposition,
};
use crate::error::BrokerError;
use crate::trace::MessagingModel;

const DEFAULT_MAX_REDELIVERIES: u32 = 5;
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Prefix of dead-letter queue names.
pub const DLQ_PREFIX: &str = "DLQ.";

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<BrokerState>,
    available: Condvar,
    max_redeliveries: u32,
    fail_commits: AtomicU32,
    fail_sessions: AtomicU32,
    session_seq: AtomicU64,
    message_seq: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Envelope>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    dead_letters: HashMap<String, Vec<BrokerMessage>>,
    subscriber_seq: u64,
}

struct Subscriber {
    id: u64,
    pending: VecDeque<Envelope>,
}

#[derive(Clone)]
struct Envelope {
    message: BrokerMessage,
    redeliveries: u32,
}

impl Envelope {
    fn fresh(message: BrokerMessage) -> Self {
        Self {
            message,
            redeliveries: 0,
        }
    }

    fn to_message(&self) -> BrokerMessage {
        let mut message = self.message.clone();
        if let BrokerMessage::Map(map) = &mut message {
            map.redelivery_count = self.redeliveries;
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Queue(String),
    Subscriber { topic: String, id: u64 },
}

impl Source {
    fn name(&self) -> &str {
        match self {
            Self::Queue(name) => name,
            Self::Subscriber { topic, .. } => topic,
        }
    }
}

impl BrokerState {
    fn take(&mut self, source: &Source) -> Option<Envelope> {
        match source {
            Source::Queue(name) => self.queues.get_mut(name)?.pop_front(),
            Source::Subscriber { topic, id } => self
                .subscribers
                .get_mut(topic)?
                .iter_mut()
                .find(|s| s.id == *id)?
                .pending
                .pop_front(),
        }
    }

    fn put_back(&mut self, source: &Source, envelope: Envelope) {
        match source {
            Source::Queue(name) => self
                .queues
                .entry(name.clone())
                .or_default()
                .push_front(envelope),
            Source::Subscriber { topic, id } => {
                if let Some(subscriber) = self
                    .subscribers
                    .get_mut(topic)
                    .and_then(|subs| subs.iter_mut().find(|s| s.id == *id))
                {
                    subscriber.pending.push_front(envelope);
                }
            }
        }
    }

    fn deliver(&mut self, destination: &Destination, message: BrokerMessage) {
        match destination.model {
            MessagingModel::Queue => self
                .queues
                .entry(destination.name.clone())
                .or_default()
                .push_back(Envelope::fresh(message)),
            MessagingModel::Topic => {
                for subscriber in self
                    .subscribers
                    .get_mut(&destination.name)
                    .into_iter()
                    .flatten()
                {
                    subscriber
                        .pending
                        .push_back(Envelope::fresh(message.clone()));
                }
            }
        }
    }

    fn rollback_received(
        &mut self,
        received: Vec<(Source, Envelope)>,
        disposition: RollbackDisposition,
        max_redeliveries: u32,
    ) {
        for (source, mut envelope) in received.into_iter().rev() {
            envelope.redeliveries += 1;
            let exhausted = envelope.redeliveries > max_redeliveries;
            if disposition == RollbackDisposition::Refuse || exhausted {
                let dlq = format!("{DLQ_PREFIX}{}", source.name());
                warn!(
                    dlq = %dlq,
                    redeliveries = envelope.redeliveries,
                    refused = disposition == RollbackDisposition::Refuse,
                    "Moving message to dead-letter queue"
                );
                self.dead_letters
                    .entry(dlq)
                    .or_default()
                    .push(envelope.to_message());
            } else {
                self.put_back(&source, envelope);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("max_redeliveries", &self.shared.max_redeliveries)
            .field("sessions_created", &self.sessions_created())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    /// A broker that dead-letters a message after `max_redeliveries` failed redeliveries.
    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: Condvar::new(),
                max_redeliveries,
                fail_commits: AtomicU32::new(0),
                fail_sessions: AtomicU32::new(0),
                session_seq: AtomicU64::new(0),
                message_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Puts a message on a destination outside of any transaction.
    pub fn send_raw(&self, destination: &Destination, message: BrokerMessage) {
        lock(&self.shared.state).deliver(destination, message);
        self.shared.available.notify_all();
    }

    /// Messages waiting on a queue, not counting ones currently held by a transaction.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.shared.state)
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Dead-lettered messages originating from `destination`.
    pub fn dead_letters(&self, destination: &str) -> Vec<BrokerMessage> {
        lock(&self.shared.state)
            .dead_letters
            .get(&format!("{DLQ_PREFIX}{destination}"))
            .cloned()
            .unwrap_or_default()
    }

    /// The next `count` commits fail, rolling back as a broker would.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.fail_commits.store(count, Ordering::SeqCst);
    }

    /// The next `count` session creations fail.
    pub fn fail_next_sessions(&self, count: u32) {
        self.shared.fail_sessions.store(count, Ordering::SeqCst);
    }

    pub fn sessions_created(&self) -> u64 {
        self.shared.session_seq.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MessageBroker for InMemoryBroker {
    fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if take_one(&self.shared.fail_sessions) {
            return Err(BrokerError::SessionUnavailable(
                "injected session failure".to_string(),
            ));
        }
        let id = self.shared.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = id, "Created in-memory broker session");
        Ok(Arc::new(InMemorySession {
            inner: Arc::new(SessionInner {
                id,
                shared: self.shared.clone(),
                closed: AtomicBool::new(false),
                tx: Mutex::new(SessionTx::default()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }))
    }
}

struct SessionInner {
    id: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
    tx: Mutex<SessionTx>,
    subscriptions: Mutex<Vec<(String, u64)>>,
}

#[derive(Default)]
struct SessionTx {
    received: Vec<(Source, Envelope)>,
    outgoing: Vec<(Destination, MapMessage)>,
}

struct InMemorySession {
    inner: Arc<SessionInner>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionClosed);
        }
        Ok(())
    }
}

impl BrokerSession for InMemorySession {
    fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.ensure_open()?;
        let source = match destination.model {
            MessagingModel::Queue => Source::Queue(destination.name.clone()),
            MessagingModel::Topic => {
                let mut state = lock(&self.inner.shared.state);
                state.subscriber_seq += 1;
                let id = state.subscriber_seq;
                state
                    .subscribers
                    .entry(destination.name.clone())
                    .or_default()
                    .push(Subscriber {
                        id,
                        pending: VecDeque::new(),
                    });
                lock(&self.inner.subscriptions).push((destination.name.clone(), id));
                Source::Subscriber {
                    topic: destination.name.clone(),
                    id,
                }
            }
        };
        Ok(Box::new(InMemoryConsumer {
            inner: self.inner.clone(),
            source,
        }))
    }

    fn send(&self, destination: &Destination, mut message: MapMessage) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let seq = self.inner.shared.message_seq.fetch_add(1, Ordering::SeqCst) + 1;
        message.message_id = format!("ID:mem-{}-{}", self.inner.id, seq);
        let id = message.message_id.clone();
        lock(&self.inner.tx)
            .outgoing
            .push((destination.clone(), message));
        Ok(id)
    }

    fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let tx = std::mem::take(&mut *lock(&self.inner.tx));
        let shared = &self.inner.shared;
        let mut state = lock(&shared.state);
        if take_one(&shared.fail_commits) {
            state.rollback_received(
                tx.received,
                RollbackDisposition::Redeliver,
                shared.max_redeliveries,
            );
            drop(state);
            shared.available.notify_all();
            return Err(BrokerError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }
        for (destination, message) in tx.outgoing {
            state.deliver(&destination, BrokerMessage::Map(message));
        }
        drop(state);
        shared.available.notify_all();
        Ok(())
    }

    fn rollback(&self, disposition: RollbackDisposition) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let tx = std::mem::take(&mut *lock(&self.inner.tx));
        let shared = &self.inner.shared;
        lock(&shared.state).rollback_received(tx.received, disposition, shared.max_redeliveries);
        shared.available.notify_all();
        Ok(())
    }

    fn close(&self) {
        let shared = &self.inner.shared;
        {
            let mut state = lock(&shared.state);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let tx = std::mem::take(&mut *lock(&self.inner.tx));
            state.rollback_received(
                tx.received,
                RollbackDisposition::Redeliver,
                shared.max_redeliveries,
            );
            for (topic, id) in lock(&self.inner.subscriptions).drain(..) {
                if let Some(subscribers) = state.subscribers.get_mut(&topic) {
                    subscribers.retain(|s| s.id != id);
                }
            }
        }
        debug!(session = self.inner.id, "Closed in-memory broker session");
        shared.available.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct InMemoryConsumer {
    inner: Arc<SessionInner>,
    source: Source,
}

impl BrokerConsumer for InMemoryConsumer {
    fn receive(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        let shared = &self.inner.shared;
        let mut state = lock(&shared.state);
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(envelope) = state.take(&self.source) {
                let message = envelope.to_message();
                // Recorded under the state lock so a concurrent close cannot lose it.
                lock(&self.inner.tx)
                    .received
                    .push((self.source.clone(), envelope));
                return Ok(Some(message));
            }
            state = match shared.available.wait_timeout(state, RECEIVE_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn map(text: &str) -> MapMessage {
        let mut message = MapMessage::new();
        message.set_string("body", text);
        message
    }

    fn body(message: &BrokerMessage) -> String {
        message.as_map().unwrap().string("body").unwrap().to_string()
    }

    #[test]
    fn test_sends_visible_only_after_commit() {
        let broker = InMemoryBroker::new();
        let session = broker.create_session().unwrap();
        let q = Destination::queue("q");

        session.send(&q, map("a")).unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        session.commit().unwrap();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[test]
    fn test_rollback_discards_sends_and_redelivers_received() {
        let broker = InMemoryBroker::new();
        let q = Destination::queue("q");
        broker.send_raw(&q, BrokerMessage::Map(map("a")));

        let session = broker.create_session().unwrap();
        let consumer = session.create_consumer(&q).unwrap();
        let received = consumer.receive().unwrap().unwrap();
        assert_eq!(body(&received), "a");
        session.send(&Destination::queue("out"), map("x")).unwrap();

        session.rollback(RollbackDisposition::Redeliver).unwrap();
        assert_eq!(broker.queue_depth("out"), 0);
        assert_eq!(broker.queue_depth("q"), 1);

        let again = consumer.receive().unwrap().unwrap();
        assert_eq!(again.as_map().unwrap().redelivery_count, 1);
    }

    #[test]
    fn test_redelivery_budget_then_dlq() {
        let broker = InMemoryBroker::with_max_redeliveries(1);
        let q = Destination::queue("q");
        broker.send_raw(&q, BrokerMessage::Map(map("a")));
        let session = broker.create_session().unwrap();
        let consumer = session.create_consumer(&q).unwrap();

        consumer.receive().unwrap().unwrap();
        session.rollback(RollbackDisposition::Redeliver).unwrap();
        consumer.receive().unwrap().unwrap();
        session.rollback(RollbackDisposition::Redeliver).unwrap();

        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.dead_letters("q").len(), 1);
    }

    #[test]
    fn test_refuse_goes_straight_to_dlq() {
        let broker = InMemoryBroker::new();
        let q = Destination::queue("q");
        broker.send_raw(&q, BrokerMessage::Text("garbage".into()));
        let session = broker.create_session().unwrap();
        let consumer = session.create_consumer(&q).unwrap();
        consumer.receive().unwrap().unwrap();
        session.rollback(RollbackDisposition::Refuse).unwrap();

        assert_eq!(
            broker.dead_letters("q"),
            vec![BrokerMessage::Text("garbage".into())]
        );
    }

    #[test]
    fn test_topic_fans_out_to_live_subscribers_only() {
        let broker = InMemoryBroker::new();
        let t = Destination::topic("t");
        let s1 = broker.create_session().unwrap();
        let s2 = broker.create_session().unwrap();
        let c1 = s1.create_consumer(&t).unwrap();
        let c2 = s2.create_consumer(&t).unwrap();

        let producer = broker.create_session().unwrap();
        producer.send(&t, map("news")).unwrap();
        producer.commit().unwrap();

        assert_eq!(body(&c1.receive().unwrap().unwrap()), "news");
        assert_eq!(body(&c2.receive().unwrap().unwrap()), "news");

        s2.close();
        producer.send(&t, map("more")).unwrap();
        producer.commit().unwrap();
        assert_eq!(body(&c1.receive().unwrap().unwrap()), "more");
        assert_eq!(c2.receive().unwrap(), None);
    }

    #[test]
    fn test_close_unblocks_receive() {
        let broker = InMemoryBroker::new();
        let session = broker.create_session().unwrap();
        let consumer = session.create_consumer(&Destination::queue("empty")).unwrap();

        let closer = {
            let session = session.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                session.close();
            })
        };
        assert_eq!(consumer.receive().unwrap(), None);
        closer.join().unwrap();
        assert!(session.is_closed());
        assert!(matches!(session.commit(), Err(BrokerError::SessionClosed)));
    }

    #[test]
    fn test_close_returns_held_messages() {
        let broker = InMemoryBroker::new();
        let q = Destination::queue("q");
        broker.send_raw(&q, BrokerMessage::Map(map("a")));
        let session = broker.create_session().unwrap();
        session.create_consumer(&q).unwrap().receive().unwrap().unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
        session.close();
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[test]
    fn test_injected_commit_failure_rolls_back() {
        let broker = InMemoryBroker::new();
        let q = Destination::queue("q");
        broker.send_raw(&q, BrokerMessage::Map(map("a")));
        let session = broker.create_session().unwrap();
        session.create_consumer(&q).unwrap().receive().unwrap().unwrap();
        session.send(&Destination::queue("out"), map("x")).unwrap();

        broker.fail_next_commits(1);
        assert!(matches!(session.commit(), Err(BrokerError::CommitFailed(_))));
        assert_eq!(broker.queue_depth("out"), 0);
        assert_eq!(broker.queue_depth("q"), 1);
        session.commit().unwrap();
    }

    #[test]
    fn test_injected_session_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sessions(1);
        assert!(broker.create_session().is_err());
        assert!(broker.create_session().is_ok());
        assert_eq!(broker.sessions_created(), 1);
    }
}
