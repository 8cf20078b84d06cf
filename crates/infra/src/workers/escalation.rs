//! Escalation monitor: turns dead letters into ops alerts.
//!
//! An ordinary competing consumer on `deadletter.>`. It resolves the owning
//! campaign through the correlation id, classifies severity from the error
//! code and publishes an alert on `ops.alert.<severity>`. It never retries
//! the original work; only the alert publish itself is retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use creatiflow_core::{CampaignId, CorrelationId, ErrorCode, FailureDetail, Severity};
use creatiflow_events::dead_letter::DEAD_LETTER_FILTER;
use creatiflow_events::{
    BusError, ConsumerOptions, DeadLetterRecord, Delivery, Headers, MessageBus,
    bus::HEADER_CORRELATION_ID,
};

use crate::config::StageConfig;
use crate::store::{PipelineStore, StoreError};

use super::{DeliveryProcessor, Disposition};

pub const ESCALATION_DURABLE: &str = "escalation-monitor";

pub fn alert_subject(severity: Severity) -> String {
    format!("ops.alert.{}", severity.as_str())
}

/// Ops-facing alert raised for one dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsAlert {
    pub severity: Severity,
    pub code: ErrorCode,
    pub message: String,
    pub campaign_id: Option<CampaignId>,
    pub campaign_name: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub original_subject: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub raised_at: DateTime<Utc>,
}

impl OpsAlert {
    pub fn subject(&self) -> String {
        alert_subject(self.severity)
    }
}

pub struct EscalationMonitor {
    store: Arc<dyn PipelineStore>,
    bus: Arc<dyn MessageBus>,
}

impl EscalationMonitor {
    pub fn new(store: Arc<dyn PipelineStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    pub fn options(config: &StageConfig) -> ConsumerOptions {
        config.consumer_options(DEAD_LETTER_FILTER, ESCALATION_DURABLE)
    }

    /// Alert for `record`, enriched with the owning campaign when it resolves.
    pub fn build_alert(&self, record: &DeadLetterRecord) -> Result<OpsAlert, StoreError> {
        let correlation_id = record.correlation_id();
        let campaign = match correlation_id {
            Some(id) => self.store.find_by_correlation(id)?,
            None => None,
        };
        Ok(OpsAlert {
            severity: record.last_error.code.severity(),
            code: record.last_error.code,
            message: record.last_error.message.clone(),
            campaign_id: campaign.as_ref().map(|c| c.id),
            campaign_name: campaign.map(|c| c.config.name),
            correlation_id,
            original_subject: record.original_subject.clone(),
            attempt_count: record.attempt_count,
            first_failed_at: record.first_failed_at,
            raised_at: Utc::now(),
        })
    }

    fn raise(&self, alert: &OpsAlert) -> Result<(), BusError> {
        let payload = serde_json::to_value(alert)
            .map_err(|e| BusError::Fatal(format!("alert encode: {e}")))?;
        let mut headers = Headers::new();
        if let Some(correlation_id) = alert.correlation_id {
            headers.insert(HEADER_CORRELATION_ID.into(), correlation_id.to_string());
        }
        self.bus.publish(&alert.subject(), payload, headers)
    }
}

impl DeliveryProcessor for EscalationMonitor {
    fn handle(&self, delivery: Delivery) -> Result<Disposition, BusError> {
        let record = match DeadLetterRecord::from_payload(delivery.payload()) {
            Ok(r) => r,
            Err(e) => {
                warn!(subject = delivery.subject(), error = %e, "undecodable dead letter ignored");
                delivery.ack()?;
                return Ok(Disposition::Discarded);
            }
        };

        let alert = match self.build_alert(&record) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "campaign lookup failed; nak");
                delivery.nak(&FailureDetail::new(ErrorCode::StorageError, e.to_string()))?;
                return Ok(Disposition::Retry);
            }
        };
        if let Err(e) = self.raise(&alert) {
            warn!(error = %e, "alert publish failed; nak");
            delivery.nak(&FailureDetail::new(ErrorCode::BusUnavailable, e.to_string()))?;
            return Ok(Disposition::Retry);
        }

        let campaign_id = alert.campaign_id.map(|id| id.to_string()).unwrap_or_default();
        if alert.severity == Severity::Critical {
            error!(
                %campaign_id,
                code = %alert.code,
                subject = %alert.original_subject,
                attempts = alert.attempt_count,
                message = %alert.message,
                "critical pipeline failure escalated"
            );
        } else {
            warn!(
                %campaign_id,
                code = %alert.code,
                subject = %alert.original_subject,
                attempts = alert.attempt_count,
                message = %alert.message,
                "pipeline failure escalated"
            );
        }
        delivery.ack()?;
        Ok(Disposition::Processed)
    }
}
