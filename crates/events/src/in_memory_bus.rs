//! In-memory durable bus for tests/dev.
//!
//! - One append-only log shared by all consumer groups
//! - Per-group cursor, in-flight table with ack deadlines, and a redelivery
//!   queue honouring the group's backoff policy
//! - Expired deliveries are reaped lazily whenever a member fetches
//! - No IO / no async; members block on a condvar

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use creatiflow_core::{ErrorCode, FailureDetail};

use crate::bus::{
    AckHandle, BusError, BusMessage, ConsumerOptions, Delivery, DeliveryConsumer, DeliveryToken,
    Headers, MessageBus, Subscription,
};
use crate::dead_letter::{DeadLetterRecord, is_dead_letter_subject};
use crate::subject;

#[derive(Debug, Default)]
struct AttemptLog {
    delivered: u32,
    first_failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct InFlight {
    seq: usize,
    deadline: Instant,
}

#[derive(Debug)]
struct Redelivery {
    seq: usize,
    available_at: Instant,
}

#[derive(Debug)]
struct ConsumerGroup {
    options: ConsumerOptions,
    cursor: usize,
    redeliveries: VecDeque<Redelivery>,
    in_flight: HashMap<u64, InFlight>,
    /// Unsettled sequences only; acks and dead-lettering remove their entry.
    attempts: HashMap<usize, AttemptLog>,
}

impl ConsumerGroup {
    fn new(options: ConsumerOptions) -> Self {
        Self {
            options,
            cursor: 0,
            redeliveries: VecDeque::new(),
            in_flight: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    /// Count a failed delivery of `seq`; returns the dead-letter message to
    /// append when the budget is exhausted for the first time.
    fn fail(
        &mut self,
        log: &[Arc<BusMessage>],
        seq: usize,
        error: FailureDetail,
        now: Instant,
    ) -> Option<BusMessage> {
        let entry = self.attempts.entry(seq).or_default();
        let first_failed_at = *entry.first_failed_at.get_or_insert_with(Utc::now);
        let delivered = entry.delivered;

        if delivered < self.options.max_deliver {
            let delay = self.options.backoff.delay_for_attempt(delivered);
            self.redeliveries.push_back(Redelivery {
                seq,
                available_at: now + delay,
            });
            return None;
        }

        // Budget spent: `seq` is never handed out again, so it settles here.
        self.attempts.remove(&seq);

        let message = &log[seq];
        if is_dead_letter_subject(&message.subject) {
            warn!(
                durable = %self.options.durable_name,
                subject = %message.subject,
                "dropping dead-letter message after exhausting retries"
            );
            return None;
        }

        let record = DeadLetterRecord::new(message, delivered, error, first_failed_at);
        let payload = match record.to_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "dead-letter encode failed");
                return None;
            }
        };
        warn!(
            durable = %self.options.durable_name,
            subject = %message.subject,
            attempts = record.attempt_count,
            code = %record.last_error.code,
            "message dead-lettered"
        );
        Some(BusMessage {
            subject: record.subject(),
            payload,
            headers: message.headers.clone(),
            published_at: Utc::now(),
        })
    }

    fn reap_expired(&mut self, log: &[Arc<BusMessage>], now: Instant) -> Vec<BusMessage> {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        let mut dead = Vec::new();
        for token in expired {
            if let Some(flight) = self.in_flight.remove(&token) {
                debug!(
                    durable = %self.options.durable_name,
                    seq = flight.seq,
                    "ack wait elapsed; scheduling redelivery"
                );
                let timeout = FailureDetail::new(
                    ErrorCode::AckTimeout,
                    format!("not acknowledged within {:?}", self.options.ack_wait),
                );
                dead.extend(self.fail(log, flight.seq, timeout, now));
            }
        }
        dead
    }

    fn next_seq(&mut self, log: &[Arc<BusMessage>], now: Instant) -> Option<usize> {
        if let Some(pos) = self.redeliveries.iter().position(|r| r.available_at <= now) {
            return self.redeliveries.remove(pos).map(|r| r.seq);
        }
        while self.cursor < log.len() {
            let seq = self.cursor;
            self.cursor += 1;
            if subject::matches(&self.options.filter, &log[seq].subject) {
                return Some(seq);
            }
        }
        None
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let redelivery = self.redeliveries.iter().map(|r| r.available_at).min();
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (redelivery, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    log: Vec<Arc<BusMessage>>,
    groups: HashMap<String, ConsumerGroup>,
    next_token: u64,
    /// Remaining injected publish failures per subject filter.
    publish_faults: Vec<(String, u32)>,
}

impl BusState {
    fn append(&mut self, message: BusMessage) {
        self.log.push(Arc::new(message));
    }

    fn append_all(&mut self, messages: Vec<BusMessage>) {
        for message in messages {
            self.append(message);
        }
    }

    fn take_publish_fault(&mut self, subject: &str) -> bool {
        for (filter, remaining) in self.publish_faults.iter_mut() {
            if *remaining > 0 && subject::matches(filter, subject) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BusState>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Transient("in-memory bus lock poisoned".into()))
    }

    fn parse_token(token: &DeliveryToken) -> Result<u64, BusError> {
        token
            .id
            .parse()
            .map_err(|_| BusError::Fatal(format!("foreign delivery token '{}'", token.id)))
    }

    /// Reap expired deliveries of `durable`, dead-lettering where due.
    fn reap(state: &mut BusState, durable: &str, now: Instant) -> bool {
        let BusState { log, groups, .. } = &mut *state;
        let Some(group) = groups.get_mut(durable) else {
            return false;
        };
        let dead = group.reap_expired(&log[..], now);
        if dead.is_empty() {
            return false;
        }
        state.append_all(dead);
        true
    }
}

impl AckHandle for Shared {
    fn ack(&self, token: &DeliveryToken) -> Result<(), BusError> {
        let id = Self::parse_token(token)?;
        let mut state = self.lock()?;
        let group = state
            .groups
            .get_mut(&token.durable_name)
            .ok_or_else(|| BusError::Fatal(format!("unknown consumer '{}'", token.durable_name)))?;
        match group.in_flight.remove(&id) {
            Some(flight) => {
                group.attempts.remove(&flight.seq);
            }
            None => {
                // Ack wait already elapsed; the message was or will be redelivered.
                debug!(durable = %token.durable_name, token = id, "late ack ignored");
            }
        }
        Ok(())
    }

    fn nak(&self, token: &DeliveryToken, error: &FailureDetail) -> Result<(), BusError> {
        let id = Self::parse_token(token)?;
        let now = Instant::now();
        let mut state = self.lock()?;
        let BusState { log, groups, .. } = &mut *state;
        let group = groups
            .get_mut(&token.durable_name)
            .ok_or_else(|| BusError::Fatal(format!("unknown consumer '{}'", token.durable_name)))?;
        let Some(flight) = group.in_flight.remove(&id) else {
            debug!(durable = %token.durable_name, token = id, "late nak ignored");
            return Ok(());
        };
        let dead = group.fail(&log[..], flight.seq, error.clone(), now);
        state.append_all(dead.into_iter().collect());
        drop(state);
        self.signal.notify_all();
        Ok(())
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    durable_name: String,
}

impl DeliveryConsumer for InMemoryConsumer {
    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let give_up_at = Instant::now() + timeout;
        let mut state = self.shared.lock()?;
        loop {
            let now = Instant::now();
            if Shared::reap(&mut state, &self.durable_name, now) {
                self.shared.signal.notify_all();
            }

            let BusState {
                log,
                groups,
                next_token,
                ..
            } = &mut *state;
            let group = groups.get_mut(&self.durable_name).ok_or_else(|| {
                BusError::Fatal(format!("unknown consumer '{}'", self.durable_name))
            })?;

            if let Some(seq) = group.next_seq(&log[..], now) {
                *next_token += 1;
                let token = *next_token;
                let attempts = group.attempts.entry(seq).or_default();
                attempts.delivered += 1;
                let delivery_count = attempts.delivered;
                group.in_flight.insert(
                    token,
                    InFlight {
                        seq,
                        deadline: now + group.options.ack_wait,
                    },
                );
                let acker: Arc<dyn AckHandle> = self.shared.clone();
                return Ok(Some(Delivery::new(
                    (*log[seq]).clone(),
                    delivery_count,
                    group.options.max_deliver,
                    DeliveryToken {
                        durable_name: self.durable_name.clone(),
                        id: token.to_string(),
                    },
                    acker,
                )));
            }

            if now >= give_up_at {
                return Ok(None);
            }
            let wake_at = group
                .next_wakeup()
                .map_or(give_up_at, |w| w.min(give_up_at))
                .max(now);
            let (guard, _) = self
                .shared
                .signal
                .wait_timeout(state, wake_at - now)
                .map_err(|_| BusError::Transient("in-memory bus lock poisoned".into()))?;
            state = guard;
        }
    }
}

/// In-process durable bus.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message whose subject matches `filter`, in publish order.
    pub fn published(&self, filter: &str) -> Vec<BusMessage> {
        match self.shared.lock() {
            Ok(state) => state
                .log
                .iter()
                .filter(|m| subject::matches(filter, &m.subject))
                .map(|m| (**m).clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Fail the next `count` publishes to subjects matching `filter` with a
    /// transient error.
    pub fn inject_publish_failures(&self, filter: impl Into<String>, count: u32) {
        if let Ok(mut state) = self.shared.lock() {
            state.publish_faults.push((filter.into(), count));
        }
    }

    /// Messages of `durable_name` delivered at least once and not yet settled.
    pub fn unsettled(&self, durable_name: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.groups.get(durable_name).map(|g| g.attempts.len()))
            .unwrap_or(0)
    }

    /// Deliveries of `durable_name` currently awaiting ack.
    pub fn in_flight(&self, durable_name: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.groups.get(durable_name).map(|g| g.in_flight.len()))
            .unwrap_or(0)
    }
}

impl MessageBus for InMemoryBus {
    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        headers: Headers,
    ) -> Result<(), BusError> {
        subject::validate_publish_subject(subject)?;
        let mut state = self.shared.lock()?;
        if state.take_publish_fault(subject) {
            return Err(BusError::Transient(format!("injected publish failure on '{subject}'")));
        }
        state.append(BusMessage {
            subject: subject.to_string(),
            payload,
            headers,
            published_at: Utc::now(),
        });
        drop(state);
        debug!(subject, "published");
        self.shared.signal.notify_all();
        Ok(())
    }

    fn subscribe(&self, options: ConsumerOptions) -> Result<Subscription, BusError> {
        options.validate()?;
        let mut state = self.shared.lock()?;
        match state.groups.get(&options.durable_name) {
            Some(existing) if existing.options.filter != options.filter => {
                return Err(BusError::Fatal(format!(
                    "durable '{}' already bound to '{}'",
                    options.durable_name, existing.options.filter
                )));
            }
            Some(_) => {}
            None => {
                debug!(durable = %options.durable_name, filter = %options.filter, "consumer group created");
                state
                    .groups
                    .insert(options.durable_name.clone(), ConsumerGroup::new(options.clone()));
            }
        }
        drop(state);

        let consumer = InMemoryConsumer {
            shared: self.shared.clone(),
            durable_name: options.durable_name.clone(),
        };
        Ok(Subscription::new(options.durable_name, Box::new(consumer)))
    }

    fn health_check(&self) -> Result<(), BusError> {
        self.shared.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::dead_letter::DEAD_LETTER_FILTER;
    use serde_json::json;
    use std::thread;

    const TICK: Duration = Duration::from_millis(20);

    fn opts(filter: &str, durable: &str) -> ConsumerOptions {
        ConsumerOptions::new(filter, durable)
            .with_max_deliver(3)
            .with_ack_wait(Duration::from_millis(50))
            .with_backoff(BackoffPolicy::none())
    }

    fn publish(bus: &InMemoryBus, subject: &str, n: i64) {
        bus.publish(subject, json!({ "n": n }), Headers::new()).unwrap();
    }

    #[test]
    fn competing_consumers_split_messages() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe(opts("work.>", "workers")).unwrap();
        let mut b = bus.subscribe(opts("work.>", "workers")).unwrap();
        for n in 0..4 {
            publish(&bus, "work.item", n);
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let d = a.fetch(TICK).unwrap().unwrap();
            seen.push(d.payload()["n"].as_i64().unwrap());
            d.ack().unwrap();
            let d = b.fetch(TICK).unwrap().unwrap();
            seen.push(d.payload()["n"].as_i64().unwrap());
            d.ack().unwrap();
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(a.fetch(TICK).unwrap().is_none());
        assert!(b.fetch(TICK).unwrap().is_none());
    }

    #[test]
    fn separate_groups_each_get_a_copy() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe(opts("work.item", "group-a")).unwrap();
        let mut b = bus.subscribe(opts("work.item", "group-b")).unwrap();
        publish(&bus, "work.item", 1);
        assert!(a.fetch(TICK).unwrap().is_some());
        assert!(b.fetch(TICK).unwrap().is_some());
    }

    #[test]
    fn unacked_delivery_is_redelivered_after_ack_wait() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe(opts("work.item", "workers")).unwrap();
        let mut b = bus.subscribe(opts("work.item", "workers")).unwrap();
        publish(&bus, "work.item", 7);

        let first = a.fetch(TICK).unwrap().unwrap();
        assert_eq!(first.delivery_count(), 1);
        drop(first); // replica died before acking

        assert!(b.fetch(Duration::from_millis(10)).unwrap().is_none());
        let again = b.fetch(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(again.delivery_count(), 2);
        assert_eq!(again.payload()["n"], 7);
        again.ack().unwrap();
        assert!(a.fetch(Duration::from_millis(100)).unwrap().is_none());
    }

    #[test]
    fn exhausted_message_is_dead_lettered_exactly_once() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(opts("work.item", "workers")).unwrap();
        let mut dlq = bus.subscribe(opts(DEAD_LETTER_FILTER, "dlq")).unwrap();
        publish(&bus, "work.item", 1);

        let boom = FailureDetail::new(ErrorCode::ProviderError, "boom");
        for expected in 1..=3 {
            let d = sub.fetch(Duration::from_millis(100)).unwrap().unwrap();
            assert_eq!(d.delivery_count(), expected);
            assert_eq!(d.is_final_attempt(), expected == 3);
            d.nak(&boom).unwrap();
        }
        assert!(sub.fetch(Duration::from_millis(120)).unwrap().is_none());

        let dead = bus.published(DEAD_LETTER_FILTER);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].subject, "deadletter.work.item");
        let record = DeadLetterRecord::from_payload(&dead[0].payload).unwrap();
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.original_payload, json!({ "n": 1 }));
        assert_eq!(record.last_error, boom);

        let d = dlq.fetch(TICK).unwrap().unwrap();
        d.ack().unwrap();
    }

    #[test]
    fn settled_messages_release_their_attempt_history() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(opts("work.item", "workers").with_max_deliver(1)).unwrap();
        publish(&bus, "work.item", 1);
        publish(&bus, "work.item", 2);

        let first = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(bus.unsettled("workers"), 1);
        first.ack().unwrap();
        assert_eq!(bus.unsettled("workers"), 0);

        let second = sub.fetch(TICK).unwrap().unwrap();
        second.nak(&FailureDetail::new(ErrorCode::ProviderError, "boom")).unwrap();
        assert_eq!(bus.published(DEAD_LETTER_FILTER).len(), 1);
        assert_eq!(bus.unsettled("workers"), 0);
        assert!(sub.fetch(TICK).unwrap().is_none());
    }

    #[test]
    fn timeouts_count_against_the_budget() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(opts("work.item", "workers").with_max_deliver(2)).unwrap();
        publish(&bus, "work.item", 1);

        drop(sub.fetch(TICK).unwrap().unwrap());
        drop(sub.fetch(Duration::from_millis(200)).unwrap().unwrap());
        assert!(sub.fetch(Duration::from_millis(150)).unwrap().is_none());

        let dead = bus.published(DEAD_LETTER_FILTER);
        assert_eq!(dead.len(), 1);
        let record = DeadLetterRecord::from_payload(&dead[0].payload).unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_error.code, ErrorCode::AckTimeout);
    }

    #[test]
    fn dead_letters_are_never_dead_lettered_again() {
        let bus = InMemoryBus::new();
        let mut dlq = bus.subscribe(opts(DEAD_LETTER_FILTER, "dlq").with_max_deliver(1)).unwrap();
        bus.publish("deadletter.work.item", json!({}), Headers::new()).unwrap();
        let d = dlq.fetch(TICK).unwrap().unwrap();
        d.nak(&FailureDetail::new(ErrorCode::Internal, "x")).unwrap();
        assert_eq!(bus.published(DEAD_LETTER_FILTER).len(), 1);
    }

    #[test]
    fn backoff_delays_redelivery() {
        let bus = InMemoryBus::new();
        let mut sub = bus
            .subscribe(opts("work.item", "workers").with_backoff(BackoffPolicy::fixed(Duration::from_millis(80))))
            .unwrap();
        publish(&bus, "work.item", 1);
        let d = sub.fetch(TICK).unwrap().unwrap();
        d.nak(&FailureDetail::new(ErrorCode::RateLimited, "slow")).unwrap();
        assert!(sub.fetch(Duration::from_millis(20)).unwrap().is_none());
        assert!(sub.fetch(Duration::from_millis(200)).unwrap().is_some());
    }

    #[test]
    fn late_ack_after_timeout_is_harmless() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(opts("work.item", "workers")).unwrap();
        publish(&bus, "work.item", 1);
        let slow = sub.fetch(TICK).unwrap().unwrap();
        thread::sleep(Duration::from_millis(70));
        let redelivered = sub.fetch(TICK).unwrap().unwrap();
        slow.ack().unwrap();
        redelivered.ack().unwrap();
        assert_eq!(bus.in_flight("workers"), 0);
    }

    #[test]
    fn wildcard_publish_is_fatal() {
        let bus = InMemoryBus::new();
        let err = bus.publish("work.*", json!({}), Headers::new()).unwrap_err();
        assert!(matches!(err, BusError::Fatal(_)));
    }

    #[test]
    fn rebinding_durable_to_other_filter_is_rejected() {
        let bus = InMemoryBus::new();
        bus.subscribe(opts("work.a", "workers")).unwrap();
        assert!(bus.subscribe(opts("work.b", "workers")).is_err());
    }

    #[test]
    fn injected_publish_failures_are_transient() {
        let bus = InMemoryBus::new();
        bus.inject_publish_failures("work.>", 1);
        let err = bus.publish("work.item", json!({}), Headers::new()).unwrap_err();
        assert!(err.is_transient());
        assert!(bus.publish("work.item", json!({}), Headers::new()).is_ok());
    }

    #[test]
    fn blocked_fetch_wakes_on_publish() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(opts("work.item", "workers")).unwrap();
        let publisher = bus.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            publish(&publisher, "work.item", 5);
        });
        let d = sub.fetch(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(d.payload()["n"], 5);
        handle.join().unwrap();
    }
}
