//! Durable competing-consumer message bus (mechanics only).
//!
//! ## Delivery model
//!
//! - **Durable consumer groups**: a subscription names a `durable_name`; every
//!   replica subscribing under the same name shares one cursor, and each
//!   message goes to exactly one replica at a time.
//! - **At-least-once**: a delivery that is not acknowledged within `ack_wait`
//!   is redelivered, possibly to another replica. Handlers must tolerate
//!   duplicate and concurrent execution of the same logical unit.
//! - **Bounded retries**: after `max_deliver` failed deliveries (nak or ack
//!   timeout) the message is moved verbatim to `deadletter.<subject>` with a
//!   [`DeadLetterRecord`](crate::DeadLetterRecord) wrapper. Dead-lettering
//!   happens once per message and is never itself retried.
//! - **No ordering** across messages.
//!
//! ## Usage
//!
//! ```ignore
//! let mut sub = bus.subscribe(ConsumerOptions::new("image.generate.request", "asset-generation"))?;
//! loop {
//!     match sub.fetch(Duration::from_millis(250))? {
//!         Some(delivery) => match handle(&delivery) {
//!             Ok(()) => delivery.ack()?,
//!             Err(e) => delivery.nak(&e.detail())?,
//!         },
//!         None => continue, // check for shutdown
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use creatiflow_core::FailureDetail;

use crate::backoff::BackoffPolicy;

/// Message headers (string to string).
pub type Headers = BTreeMap<String, String>;

/// Header carrying the work unit idempotency key.
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
/// Header carrying the campaign correlation id.
pub const HEADER_CORRELATION_ID: &str = "correlation-id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Network/timeout/busy; the caller may retry.
    #[error("transient bus error: {0}")]
    Transient(String),

    /// Malformed subject or payload, unknown consumer; retrying will not help.
    #[error("fatal bus error: {0}")]
    Fatal(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

/// A message as stored on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub subject: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: Headers,
    pub published_at: DateTime<Utc>,
}

/// Durable consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    /// Subject filter (may contain wildcards).
    pub filter: String,
    pub durable_name: String,
    pub max_deliver: u32,
    pub ack_wait: Duration,
    pub backoff: BackoffPolicy,
}

impl ConsumerOptions {
    pub fn new(filter: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            durable_name: durable_name.into(),
            max_deliver: 3,
            ack_wait: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), BusError> {
        crate::subject::validate_filter(&self.filter)?;
        if self.durable_name.trim().is_empty() {
            return Err(BusError::Fatal("durable_name must not be empty".into()));
        }
        if self.max_deliver == 0 {
            return Err(BusError::Fatal("max_deliver must be at least 1".into()));
        }
        if self.ack_wait.is_zero() {
            return Err(BusError::Fatal("ack_wait must be positive".into()));
        }
        if let Some(problem) = self.backoff.problem() {
            return Err(BusError::Fatal(problem));
        }
        Ok(())
    }
}

/// Opaque handle identifying one delivery to its consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    pub durable_name: String,
    pub id: String,
}

/// Settles deliveries on behalf of a bus implementation.
pub trait AckHandle: Send + Sync {
    fn ack(&self, token: &DeliveryToken) -> Result<(), BusError>;

    /// Negative acknowledgement: count a failed attempt and schedule
    /// redelivery (or dead-letter once the budget is spent).
    fn nak(&self, token: &DeliveryToken, error: &FailureDetail) -> Result<(), BusError>;
}

/// One delivery of a message to one replica.
///
/// Dropping a delivery without settling it leaves it in flight; it is
/// redelivered once `ack_wait` elapses.
pub struct Delivery {
    message: BusMessage,
    delivery_count: u32,
    max_deliver: u32,
    token: DeliveryToken,
    acker: Arc<dyn AckHandle>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("delivery_count", &self.delivery_count)
            .field("max_deliver", &self.max_deliver)
            .field("token", &self.token)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        message: BusMessage,
        delivery_count: u32,
        max_deliver: u32,
        token: DeliveryToken,
        acker: Arc<dyn AckHandle>,
    ) -> Self {
        Self {
            message,
            delivery_count,
            max_deliver,
            token,
            acker,
        }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.message.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    /// 1 on first delivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn max_deliver(&self) -> u32 {
        self.max_deliver
    }

    /// A nak now would exhaust the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.delivery_count >= self.max_deliver
    }

    pub fn token(&self) -> &DeliveryToken {
        &self.token
    }

    pub fn ack(self) -> Result<(), BusError> {
        self.acker.ack(&self.token)
    }

    pub fn nak(self, error: &FailureDetail) -> Result<(), BusError> {
        self.acker.nak(&self.token, error)
    }
}

/// Pull side of a consumer group member.
pub trait DeliveryConsumer: Send {
    /// Wait up to `timeout` for the next delivery.
    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError>;
}

/// A replica's membership in a durable consumer group.
///
/// Intended for single-threaded consumption: one subscription per replica.
pub struct Subscription {
    durable_name: String,
    consumer: Box<dyn DeliveryConsumer>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("durable_name", &self.durable_name)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(durable_name: impl Into<String>, consumer: Box<dyn DeliveryConsumer>) -> Self {
        Self {
            durable_name: durable_name.into(),
            consumer,
        }
    }

    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    pub fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        self.consumer.fetch(timeout)
    }
}

/// Transport-agnostic durable bus.
pub trait MessageBus: Send + Sync {
    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        headers: Headers,
    ) -> Result<(), BusError>;

    /// Join (creating if needed) the durable consumer group `options.durable_name`.
    fn subscribe(&self, options: ConsumerOptions) -> Result<Subscription, BusError>;

    /// Connectivity probe used at startup.
    fn health_check(&self) -> Result<(), BusError> {
        Ok(())
    }
}

impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        headers: Headers,
    ) -> Result<(), BusError> {
        (**self).publish(subject, payload, headers)
    }

    fn subscribe(&self, options: ConsumerOptions) -> Result<Subscription, BusError> {
        (**self).subscribe(options)
    }

    fn health_check(&self) -> Result<(), BusError> {
        (**self).health_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_options_validation() {
        let ok = ConsumerOptions::new("image.generate.request", "asset-generation");
        assert!(ok.validate().is_ok());

        assert!(ok.clone().with_max_deliver(0).validate().is_err());
        assert!(ok.clone().with_ack_wait(Duration::ZERO).validate().is_err());
        assert!(
            ConsumerOptions::new("a.>.b", "x").validate().is_err(),
            "tail wildcard in the middle"
        );
        assert!(ConsumerOptions::new("a.b", " ").validate().is_err());
    }
}
