//! Messaging mechanics for the pipeline.
//!
//! - [`bus`]: durable competing-consumer bus contract (publish, subscribe, ack/nak)
//! - [`in_memory_bus`]: in-process implementation for tests/dev
//! - [`envelope`] / [`payload`]: the uniform message schema between stages
//! - [`handler`]: the stage handler contract
//! - [`dead_letter`]: dead-letter record schema and subject naming

pub mod backoff;
pub mod bus;
pub mod dead_letter;
pub mod envelope;
pub mod handler;
pub mod in_memory_bus;
pub mod payload;
pub mod subject;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use bus::{
    AckHandle, BusError, BusMessage, ConsumerOptions, Delivery, DeliveryConsumer, DeliveryToken,
    Headers, MessageBus, Subscription,
};
pub use dead_letter::{DeadLetterRecord, dead_letter_subject, is_dead_letter_subject};
pub use envelope::MessageEnvelope;
pub use handler::{StageError, StageHandler, StageInput, StageOutput, ValidationError};
pub use in_memory_bus::InMemoryBus;
pub use payload::{RevisionFeedback, StagePayload};
