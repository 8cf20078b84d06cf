//! Consumer threads.
//!
//! Every consumer (stage replica, completion tracker, escalation monitor) is
//! one thread owning one [`Subscription`]. It fetches a delivery, hands it to
//! a [`DeliveryProcessor`] which settles it, and checks for shutdown between
//! fetches. Parallelism comes from running more replicas under the same
//! durable name.

pub mod completion_tracker;
pub mod escalation;
pub mod stage_worker;

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use creatiflow_events::{BusError, Delivery, Subscription};

pub use completion_tracker::{CompletionTracker, READY_FOR_REVIEW_SUBJECT, ReadyNotice};
pub use escalation::{EscalationMonitor, OpsAlert, alert_subject};
pub use stage_worker::StageWorker;

/// How a delivery was settled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Work done, side effects durable, acked.
    Processed,
    /// Already handled by an earlier delivery; acked without new effects.
    Duplicate,
    /// Nak'd for redelivery.
    Retry,
    /// Published to the dead-letter subject and acked.
    DeadLettered,
    /// Stale or irrelevant; acked without effects.
    Discarded,
}

/// Handles one delivery end to end, including its ack or nak.
///
/// An `Err` means the delivery could not be settled; the bus redelivers it
/// once its ack wait elapses.
pub trait DeliveryProcessor: Send + Sync {
    fn handle(&self, delivery: Delivery) -> Result<Disposition, BusError>;
}

impl<P> DeliveryProcessor for Arc<P>
where
    P: DeliveryProcessor + ?Sized,
{
    fn handle(&self, delivery: Delivery) -> Result<Disposition, BusError> {
        (**self).handle(delivery)
    }
}

/// Handle to control and join a consumer thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop after its current delivery.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to exit.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) {
        self.signal();
        self.join();
    }
}

/// Spawn a named consumer thread.
pub fn spawn_consumer(
    name: impl Into<String>,
    subscription: Subscription,
    processor: Arc<dyn DeliveryProcessor>,
    poll: Duration,
) -> io::Result<WorkerHandle> {
    let name = name.into();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_name = name.clone();
    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || consume_loop(&thread_name, subscription, processor.as_ref(), shutdown_rx, poll))?;

    Ok(WorkerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn consume_loop(
    name: &str,
    mut subscription: Subscription,
    processor: &dyn DeliveryProcessor,
    shutdown_rx: mpsc::Receiver<()>,
    poll: Duration,
) {
    info!(worker = name, durable = subscription.durable_name(), "worker started");
    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match subscription.fetch(poll) {
            Ok(Some(delivery)) => match processor.handle(delivery) {
                Ok(disposition) => debug!(worker = name, ?disposition, "delivery settled"),
                Err(err) => warn!(worker = name, error = %err, "delivery left unsettled"),
            },
            Ok(None) => continue,
            Err(err) if err.is_transient() => {
                warn!(worker = name, error = %err, "fetch failed; backing off");
                thread::sleep(poll);
            }
            Err(err) => {
                error!(worker = name, error = %err, "subscription unusable; stopping worker");
                break;
            }
        }
    }
    info!(worker = name, "worker stopped");
}
