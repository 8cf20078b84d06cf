//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Stream**: one stream (`creatiflow:messages` by default) carries every
//!   subject; entries hold `subject`, `payload`, `headers`, `published_at`
//! - **Consumer groups**: one per durable name, created with `XGROUP CREATE
//!   ... MKSTREAM`; each replica reads as its own consumer and leaves the
//!   group when dropped, unless it still owns pending entries
//! - **Filtering**: groups read the whole stream and ack non-matching subjects
//!   straight away
//! - **Redelivery**: entries pending longer than `ack_wait` are claimed by
//!   whichever replica fetches next (`XPENDING` + `XCLAIM`); a nak shortens
//!   the remaining idle window to the backoff delay
//! - **Dead-lettering**: once an entry was delivered `max_deliver` times it is
//!   republished as a [`DeadLetterRecord`] on `deadletter.<subject>` and acked
//!
//! Failure metadata of nak'd entries lives in a hash next to the stream so the
//! dead-letter record carries the last error even when another replica
//! dead-letters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use creatiflow_core::{ErrorCode, FailureDetail};
use creatiflow_events::{
    AckHandle, BusError, BusMessage, ConsumerOptions, DeadLetterRecord, Delivery, DeliveryConsumer,
    DeliveryToken, Headers, MessageBus, Subscription, is_dead_letter_subject,
    subject as subjects,
};

/// Default stream key for all subjects.
pub const DEFAULT_STREAM_KEY: &str = "creatiflow:messages";

/// How many expired pending entries one fetch asks the server for.
const PENDING_SCAN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

impl From<RedisStreamsError> for BusError {
    fn from(value: RedisStreamsError) -> Self {
        match value {
            RedisStreamsError::Connection(_) | RedisStreamsError::Command(_) => {
                BusError::Transient(value.to_string())
            }
            RedisStreamsError::Serialization(_)
            | RedisStreamsError::Deserialization(_)
            | RedisStreamsError::ConsumerGroup(_) => BusError::Fatal(value.to_string()),
        }
    }
}

/// Failure history of one pending entry, shared across replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureLog {
    last_error: FailureDetail,
    first_failed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    client: redis::Client,
    stream_key: String,
}

impl Inner {
    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    fn failures_key(&self, group: &str) -> String {
        format!("{}:failures:{group}", self.stream_key)
    }

    fn xadd(&self, message: &BusMessage) -> Result<redis::Cmd, RedisStreamsError> {
        let payload = serde_json::to_string(&message.payload)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let headers = serde_json::to_string(&message.headers)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key)
            .arg("*")
            .arg("subject")
            .arg(&message.subject)
            .arg("payload")
            .arg(payload)
            .arg("headers")
            .arg(headers)
            .arg("published_at")
            .arg(message.published_at.to_rfc3339());
        Ok(cmd)
    }

    fn append(&self, conn: &mut redis::Connection, message: &BusMessage) -> Result<String, RedisStreamsError> {
        self.xadd(message)?
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))
    }

    fn ensure_group(&self, group: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        // "0": a new group starts from the beginning of the stream.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(format!("{group}: {e}"))),
        }
    }

    /// Queue XACK plus removal of the entry's failure log.
    fn settle(&self, pipe: &mut redis::Pipeline, group: &str, id: &str) {
        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(group)
            .arg(id)
            .ignore()
            .cmd("HDEL")
            .arg(self.failures_key(group))
            .arg(id)
            .ignore();
    }

    fn ack(&self, conn: &mut redis::Connection, group: &str, id: &str) -> Result<(), RedisStreamsError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle(&mut pipe, group, id);
        pipe.query::<()>(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))
    }

    /// Pending entries of `group` idle for at least `min_idle`, oldest first.
    /// `consumer` narrows the scan to one consumer's entries.
    fn expired_pending(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        min_idle: u64,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, RedisStreamsError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(&self.stream_key)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN);
        if let Some(consumer) = consumer {
            cmd.arg(consumer);
        }
        let reply: redis::Value = cmd
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;
        parse_pending_reply(reply)
    }

    fn failure_log(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        id: &str,
    ) -> Result<Option<FailureLog>, RedisStreamsError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.failures_key(group))
            .arg(id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("HGET failed: {e}")))?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    fn record_failure(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        id: &str,
        error: &FailureDetail,
    ) -> Result<FailureLog, RedisStreamsError> {
        let first_failed_at = self
            .failure_log(conn, group, id)?
            .map_or_else(Utc::now, |log| log.first_failed_at);
        let log = FailureLog {
            last_error: error.clone(),
            first_failed_at,
        };
        let raw = serde_json::to_string(&log).map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let _: u64 = redis::cmd("HSET")
            .arg(self.failures_key(group))
            .arg(id)
            .arg(raw)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("HSET failed: {e}")))?;
        Ok(log)
    }

    /// Republish `message` as a dead letter, then ack the original entry.
    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        group: &str,
        id: &str,
        message: &BusMessage,
        attempts: u32,
        log: FailureLog,
    ) -> Result<(), RedisStreamsError> {
        if is_dead_letter_subject(&message.subject) {
            warn!(group, subject = %message.subject, "dropping dead-letter message after exhausting retries");
            return self.ack(conn, group, id);
        }
        let record = DeadLetterRecord::new(message, attempts, log.last_error, log.first_failed_at);
        let payload = record
            .to_payload()
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let republished = self.xadd(&BusMessage {
            subject: record.subject(),
            payload,
            headers: message.headers.clone(),
            published_at: Utc::now(),
        })?;

        self.dead_letter_transaction(group, id, republished)
            .query::<()>(conn)
            .map_err(|e| RedisStreamsError::Command(format!("dead-letter transaction failed: {e}")))?;
        warn!(
            group,
            subject = %message.subject,
            attempts,
            code = %record.last_error.code,
            "message dead-lettered"
        );
        Ok(())
    }
}

impl Inner {
    /// MULTI/EXEC so the dead letter and the ack land together or not at all.
    fn dead_letter_transaction(&self, group: &str, id: &str, republished: redis::Cmd) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().add_command(republished).ignore();
        self.settle(&mut pipe, group, id);
        pipe
    }
}

/// One row of an extended `XPENDING` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    id: String,
    consumer: String,
    idle_ms: u64,
    delivered: u64,
}

/// Parse `[[id, consumer, idle, delivered], ...]`.
fn parse_pending_reply(reply: redis::Value) -> Result<Vec<PendingEntry>, RedisStreamsError> {
    let rows = match reply {
        redis::Value::Bulk(rows) => rows,
        redis::Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(RedisStreamsError::Deserialization(format!(
                "unexpected XPENDING reply: {other:?}"
            )));
        }
    };
    rows.into_iter()
        .map(|row| match row {
            redis::Value::Bulk(fields) => match fields.as_slice() {
                [
                    redis::Value::Data(id),
                    redis::Value::Data(consumer),
                    redis::Value::Int(idle),
                    redis::Value::Int(delivered),
                ] => Ok(PendingEntry {
                    id: String::from_utf8_lossy(id).to_string(),
                    consumer: String::from_utf8_lossy(consumer).to_string(),
                    idle_ms: (*idle).max(0) as u64,
                    delivered: (*delivered).max(0) as u64,
                }),
                _ => Err(RedisStreamsError::Deserialization(format!(
                    "malformed XPENDING row: {fields:?}"
                ))),
            },
            other => Err(RedisStreamsError::Deserialization(format!(
                "malformed XPENDING row: {other:?}"
            ))),
        })
        .collect()
}

/// Parse one stream entry: `[id, [field1, value1, field2, value2, ...]]`.
fn parse_stream_entry(entry: &redis::Value) -> Result<(String, BusMessage), RedisStreamsError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(RedisStreamsError::Deserialization("Invalid entry format".to_string()));
    };
    if parts.len() < 2 {
        return Err(RedisStreamsError::Deserialization("Entry too short".to_string()));
    }
    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(RedisStreamsError::Deserialization("Invalid message ID format".to_string())),
    };
    let redis::Value::Bulk(raw_fields) = &parts[1] else {
        return Err(RedisStreamsError::Deserialization(format!("entry {id} has no fields")));
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| RedisStreamsError::Deserialization(format!("entry {id} missing {name}")))
    };
    let subject = field("subject")?.clone();
    let payload = serde_json::from_str(field("payload")?)
        .map_err(|e| RedisStreamsError::Deserialization(format!("entry {id} payload: {e}")))?;
    let headers: Headers = match fields.get("headers") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| RedisStreamsError::Deserialization(format!("entry {id} headers: {e}")))?,
        None => Headers::new(),
    };
    let published_at = fields
        .get("published_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

    Ok((
        id,
        BusMessage {
            subject,
            payload,
            headers,
            published_at,
        },
    ))
}

/// Entries of the first stream in an `XREADGROUP` reply (`Nil` on timeout).
fn read_reply_entries(reply: redis::Value) -> Vec<redis::Value> {
    let redis::Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    streams
        .into_iter()
        .find_map(|stream| match stream {
            redis::Value::Bulk(mut parts) if parts.len() == 2 => match parts.pop() {
                Some(redis::Value::Bulk(entries)) => Some(entries),
                _ => None,
            },
            _ => None,
        })
        .unwrap_or_default()
}

/// Deliveries handed out by one consumer and not yet settled.
#[derive(Debug, Default)]
struct Outstanding {
    entries: HashMap<String, (BusMessage, u32)>,
}

struct RedisAcker {
    inner: Arc<Inner>,
    options: ConsumerOptions,
    consumer: String,
    outstanding: Mutex<Outstanding>,
}

impl RedisAcker {
    fn take(&self, id: &str) -> Result<Option<(BusMessage, u32)>, BusError> {
        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| BusError::Transient("redis acker lock poisoned".into()))?;
        Ok(outstanding.entries.remove(id))
    }
}

impl RedisAcker {
    /// Remove this consumer from its group unless it still owns pending
    /// entries; deleting it then would drop them from the pending list.
    fn leave_group(&self) -> Result<bool, RedisStreamsError> {
        let group = &self.options.durable_name;
        let mut conn = self.inner.connection()?;
        let owned = self.inner.expired_pending(&mut conn, group, 0, Some(self.consumer.as_str()))?;
        if !owned.is_empty() {
            return Ok(false);
        }
        let _: i64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&self.inner.stream_key)
            .arg(group)
            .arg(&self.consumer)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XGROUP DELCONSUMER failed: {e}")))?;
        Ok(true)
    }
}

impl Drop for RedisAcker {
    fn drop(&mut self) {
        match self.leave_group() {
            Ok(true) => debug!(consumer = %self.consumer, "left consumer group"),
            Ok(false) => debug!(consumer = %self.consumer, "consumer kept; it still owns pending entries"),
            Err(e) => warn!(consumer = %self.consumer, error = %e, "failed to leave consumer group"),
        }
    }
}

impl AckHandle for RedisAcker {
    fn ack(&self, token: &DeliveryToken) -> Result<(), BusError> {
        self.take(&token.id)?;
        let mut conn = self.inner.connection()?;
        self.inner.ack(&mut conn, &token.durable_name, &token.id)?;
        Ok(())
    }

    fn nak(&self, token: &DeliveryToken, error: &FailureDetail) -> Result<(), BusError> {
        let Some((message, delivered)) = self.take(&token.id)? else {
            debug!(durable = %token.durable_name, id = %token.id, "nak for unknown delivery ignored");
            return Ok(());
        };
        let group = &token.durable_name;
        let mut conn = self.inner.connection()?;
        let log = self.inner.record_failure(&mut conn, group, &token.id, error)?;

        if delivered >= self.options.max_deliver {
            self.inner
                .dead_letter(&mut conn, group, &token.id, &message, delivered, log)?;
            return Ok(());
        }

        // Keep the entry pending but make it reclaimable once the backoff
        // delay has passed instead of after the full ack wait.
        let delay = self.options.backoff.delay_for_attempt(delivered);
        let idle = self.options.ack_wait.saturating_sub(delay);
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.inner.stream_key)
            .arg(group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&token.id)
            .arg("IDLE")
            .arg(idle.as_millis() as u64)
            .arg("JUSTID")
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;
        Ok(())
    }
}

struct RedisStreamsConsumer {
    acker: Arc<RedisAcker>,
}

impl RedisStreamsConsumer {
    fn delivery(&self, id: String, message: BusMessage, delivery_count: u32) -> Result<Delivery, BusError> {
        let options = &self.acker.options;
        let mut outstanding = self
            .acker
            .outstanding
            .lock()
            .map_err(|_| BusError::Transient("redis acker lock poisoned".into()))?;
        outstanding
            .entries
            .insert(id.clone(), (message.clone(), delivery_count));
        drop(outstanding);

        let acker: Arc<dyn AckHandle> = self.acker.clone();
        Ok(Delivery::new(
            message,
            delivery_count,
            options.max_deliver,
            DeliveryToken {
                durable_name: options.durable_name.clone(),
                id,
            },
            acker,
        ))
    }

    /// Claim one entry whose ack wait elapsed, dead-lettering exhausted ones.
    fn reclaim(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, BusError> {
        let inner = &self.acker.inner;
        let options = &self.acker.options;
        let group = &options.durable_name;
        let min_idle = options.ack_wait.as_millis() as u64;

        // The server filters by idle time, so live entries at the head of the
        // pending list cannot hide expired ones behind them.
        let pending = inner.expired_pending(conn, group, min_idle, None)?;

        for PendingEntry {
            id,
            consumer: owner,
            idle_ms,
            delivered,
        } in pending
        {
            let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
                .arg(&inner.stream_key)
                .arg(group)
                .arg(&self.acker.consumer)
                .arg(min_idle)
                .arg(&id)
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;
            // Empty: another replica claimed it first. Nil fields: trimmed.
            let Some(entry) = claimed.first() else {
                continue;
            };
            let (id, message) = match parse_stream_entry(entry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(group, id, error = %e, "unreadable pending entry acked");
                    inner.ack(conn, group, &id)?;
                    continue;
                }
            };

            let delivered = delivered as u32;
            if delivered >= options.max_deliver {
                let log = inner.failure_log(conn, group, &id)?.unwrap_or_else(|| FailureLog {
                    last_error: FailureDetail::new(
                        ErrorCode::AckTimeout,
                        format!("not acknowledged within {:?}", options.ack_wait),
                    ),
                    first_failed_at: Utc::now(),
                });
                inner.dead_letter(conn, group, &id, &message, delivered, log)?;
                continue;
            }
            debug!(group, id, from = %owner, idle_ms, delivered, "reclaimed pending entry");
            return self.delivery(id, message, delivered + 1).map(Some);
        }
        Ok(None)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        block: Duration,
    ) -> Result<Option<(String, BusMessage)>, RedisStreamsError> {
        let inner = &self.acker.inner;
        let group = &self.acker.options.durable_name;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.acker.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&inner.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let Some(entry) = read_reply_entries(reply).into_iter().next() else {
            return Ok(None);
        };
        match parse_stream_entry(&entry) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                if let redis::Value::Bulk(parts) = &entry {
                    if let Some(redis::Value::Data(id)) = parts.first() {
                        let id = String::from_utf8_lossy(id).to_string();
                        warn!(group, id, error = %e, "unreadable entry acked");
                        inner.ack(conn, group, &id)?;
                    }
                }
                Ok(None)
            }
        }
    }
}

impl DeliveryConsumer for RedisStreamsConsumer {
    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let give_up_at = Instant::now() + timeout;
        let mut conn = self.acker.inner.connection()?;
        loop {
            if let Some(delivery) = self.reclaim(&mut conn)? {
                return Ok(Some(delivery));
            }

            let remaining = give_up_at.saturating_duration_since(Instant::now());
            if let Some((id, message)) = self.read_new(&mut conn, remaining)? {
                if subjects::matches(&self.acker.options.filter, &message.subject) {
                    return self.delivery(id, message, 1).map(Some);
                }
                // Not for this group.
                self.acker
                    .inner
                    .ack(&mut conn, &self.acker.options.durable_name, &id)?;
                continue;
            }

            if Instant::now() >= give_up_at {
                return Ok(None);
            }
        }
    }
}

/// Redis Streams implementation of [`MessageBus`].
#[derive(Debug, Clone)]
pub struct RedisStreamsBus {
    inner: Arc<Inner>,
}

impl RedisStreamsBus {
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream holding every subject (default: [`DEFAULT_STREAM_KEY`])
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            }),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.inner.stream_key
    }
}

impl MessageBus for RedisStreamsBus {
    #[instrument(skip(self, payload, headers), fields(stream_key = %self.inner.stream_key), err)]
    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        headers: Headers,
    ) -> Result<(), BusError> {
        subjects::validate_publish_subject(subject)?;
        let mut conn = self.inner.connection()?;
        let id = self.inner.append(
            &mut conn,
            &BusMessage {
                subject: subject.to_string(),
                payload,
                headers,
                published_at: Utc::now(),
            },
        )?;
        debug!(subject, id, "published");
        Ok(())
    }

    fn subscribe(&self, options: ConsumerOptions) -> Result<Subscription, BusError> {
        options.validate()?;
        self.inner.ensure_group(&options.durable_name)?;
        let consumer = format!("{}-{}", options.durable_name, uuid::Uuid::now_v7());
        debug!(durable = %options.durable_name, consumer, filter = %options.filter, "joined consumer group");

        let durable_name = options.durable_name.clone();
        let acker = Arc::new(RedisAcker {
            inner: self.inner.clone(),
            options,
            consumer,
            outstanding: Mutex::new(Outstanding::default()),
        });
        Ok(Subscription::new(durable_name, Box::new(RedisStreamsConsumer { acker })))
    }

    fn health_check(&self) -> Result<(), BusError> {
        let mut conn = self.inner.connection()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_entries_written_by_publish() {
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![
                data("subject"),
                data("image.generate.request"),
                data("payload"),
                data(r#"{"revision":0}"#),
                data("headers"),
                data(r#"{"correlation-id":"abc"}"#),
                data("published_at"),
                data("2024-05-01T10:00:00+00:00"),
            ]),
        ]);
        let (id, message) = parse_stream_entry(&entry).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(message.subject, "image.generate.request");
        assert_eq!(message.payload, json!({ "revision": 0 }));
        assert_eq!(message.headers["correlation-id"], "abc");
    }

    #[test]
    fn missing_payload_is_rejected() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("subject"), data("a.b")]),
        ]);
        assert!(matches!(
            parse_stream_entry(&entry),
            Err(RedisStreamsError::Deserialization(_))
        ));
    }

    #[test]
    fn timeout_reply_has_no_entries() {
        assert!(read_reply_entries(redis::Value::Nil).is_empty());
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("creatiflow:messages"),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![data("1-0"), redis::Value::Bulk(vec![])])]),
        ])]);
        assert_eq!(read_reply_entries(reply).len(), 1);
    }

    #[test]
    fn pending_rows_are_parsed_in_reply_order() {
        let reply = redis::Value::Bulk(vec![
            redis::Value::Bulk(vec![
                data("1-0"),
                data("stage.content-1"),
                redis::Value::Int(31_000),
                redis::Value::Int(2),
            ]),
            redis::Value::Bulk(vec![
                data("7-0"),
                data("stage.content-2"),
                redis::Value::Int(30_500),
                redis::Value::Int(1),
            ]),
        ]);
        let rows = parse_pending_reply(reply).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1],
            PendingEntry {
                id: "7-0".into(),
                consumer: "stage.content-2".into(),
                idle_ms: 30_500,
                delivered: 1,
            }
        );
    }

    #[test]
    fn empty_pending_reply_means_nothing_to_claim() {
        assert!(parse_pending_reply(redis::Value::Bulk(vec![])).unwrap().is_empty());
        assert!(parse_pending_reply(redis::Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn summary_shaped_pending_reply_is_rejected() {
        // `XPENDING key group` without a range returns [count, min, max, consumers].
        let reply = redis::Value::Bulk(vec![redis::Value::Int(3)]);
        assert!(matches!(
            parse_pending_reply(reply),
            Err(RedisStreamsError::Deserialization(_))
        ));
    }

    #[test]
    fn dead_letter_and_ack_share_one_transaction() {
        let inner = Inner {
            client: redis::Client::open("redis://127.0.0.1:6379").unwrap(),
            stream_key: DEFAULT_STREAM_KEY.into(),
        };
        let message = BusMessage {
            subject: "deadletter.image.generate.request".into(),
            payload: json!({ "attempt_count": 3 }),
            headers: Headers::new(),
            published_at: Utc::now(),
        };
        let republished = inner.xadd(&message).unwrap();
        let packed = inner
            .dead_letter_transaction("stage.image", "5-0", republished)
            .get_packed_pipeline();
        let text = String::from_utf8_lossy(&packed);

        let order: Vec<usize> = ["MULTI", "XADD", "XACK", "HDEL", "EXEC"]
            .iter()
            .map(|cmd| text.find(cmd).unwrap_or_else(|| panic!("{cmd} missing")))
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
        assert!(text.contains("creatiflow:messages:failures:stage.image"));
    }

    #[test]
    fn connection_errors_are_transient() {
        let err: BusError = RedisStreamsError::Connection("refused".into()).into();
        assert!(err.is_transient());
        let err: BusError = RedisStreamsError::Deserialization("bad".into()).into();
        assert!(!err.is_transient());
    }
}
