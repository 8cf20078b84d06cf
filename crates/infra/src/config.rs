//! Pipeline configuration: one consumer record per stage, plus backend
//! selection and logging.
//!
//! Sources, highest priority first:
//! 1. `CREATIFLOW_*` environment variables
//! 2. TOML file
//! 3. Built-in defaults
//!
//! Every source funnels through [`PipelineConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use creatiflow_core::Stage;
use creatiflow_events::{BackoffPolicy, ConsumerOptions};
use creatiflow_observability::{LogFormat, LoggingConfig};

pub const ENV_PREFIX: &str = "CREATIFLOW_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Parse(String),

    #[error("invalid value for {key}: '{value}'")]
    InvalidOverride { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Consumer settings shared by stage replicas, the tracker and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub replicas: usize,
    pub max_deliver: u32,
    pub ack_wait_ms: u64,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl StageConfig {
    pub fn new(replicas: usize, max_deliver: u32, ack_wait: Duration) -> Self {
        Self {
            replicas,
            max_deliver,
            ack_wait_ms: ack_wait.as_millis() as u64,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn consumer_options(
        &self,
        filter: impl Into<String>,
        durable_name: impl Into<String>,
    ) -> ConsumerOptions {
        ConsumerOptions::new(filter, durable_name)
            .with_max_deliver(self.max_deliver)
            .with_ack_wait(self.ack_wait())
            .with_backoff(self.backoff.clone())
    }

    fn check(&self, name: &str) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::Invalid(format!("{name}.replicas must be at least 1")));
        }
        if self.max_deliver == 0 {
            return Err(ConfigError::Invalid(format!("{name}.max_deliver must be at least 1")));
        }
        if self.ack_wait_ms == 0 {
            return Err(ConfigError::Invalid(format!("{name}.ack_wait_ms must be positive")));
        }
        if let Some(problem) = self.backoff.problem() {
            return Err(ConfigError::Invalid(format!("{name}.backoff: {problem}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfigs {
    pub enrichment: StageConfig,
    pub content_generation: StageConfig,
    pub asset_generation: StageConfig,
    pub composition: StageConfig,
    pub finalization: StageConfig,
}

impl Default for StageConfigs {
    fn default() -> Self {
        Self {
            enrichment: StageConfig::new(2, 3, Duration::from_secs(60)),
            content_generation: StageConfig::new(2, 3, Duration::from_secs(120)),
            asset_generation: StageConfig::new(2, 3, Duration::from_secs(180)),
            composition: StageConfig::new(2, 3, Duration::from_secs(180)),
            finalization: StageConfig::new(2, 3, Duration::from_secs(180)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusBackend {
    #[default]
    InMemory,
    Redis {
        url: String,
        #[serde(default = "default_stream_key")]
        stream_key: String,
    },
}

fn default_stream_key() -> String {
    "creatiflow:messages".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    InMemory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bus: BusBackend,
    pub store: StoreBackend,
    pub logging: LoggingConfig,
    pub stages: StageConfigs,
    pub completion_tracker: StageConfig,
    pub escalation_monitor: StageConfig,
    /// How long a replica blocks on one fetch before checking for shutdown.
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bus: BusBackend::default(),
            store: StoreBackend::default(),
            logging: LoggingConfig::default(),
            stages: StageConfigs::default(),
            completion_tracker: StageConfig::new(1, 5, Duration::from_secs(30)),
            escalation_monitor: StageConfig::new(1, 3, Duration::from_secs(30)),
            poll_interval_ms: 250,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load_layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        base.with_env_overrides(std::env::vars())
    }

    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Enrichment => &self.stages.enrichment,
            Stage::ContentGeneration => &self.stages.content_generation,
            Stage::AssetGeneration => &self.stages.asset_generation,
            Stage::Composition => &self.stages.composition,
            Stage::Finalization => &self.stages.finalization,
        }
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut StageConfig {
        match stage {
            Stage::Enrichment => &mut self.stages.enrichment,
            Stage::ContentGeneration => &mut self.stages.content_generation,
            Stage::AssetGeneration => &mut self.stages.asset_generation,
            Stage::Composition => &mut self.stages.composition,
            Stage::Finalization => &mut self.stages.finalization,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Apply `CREATIFLOW_*` overrides from `vars` (typically `std::env::vars()`).
    ///
    /// Recognised keys:
    /// - `CREATIFLOW_REDIS_URL`, `CREATIFLOW_DATABASE_URL`
    /// - `CREATIFLOW_LOG_LEVEL`, `CREATIFLOW_LOG_FORMAT`
    /// - `CREATIFLOW_POLL_INTERVAL_MS`
    /// - `CREATIFLOW_<CONSUMER>_{REPLICAS,MAX_DELIVER,ACK_WAIT_MS}` where
    ///   `<CONSUMER>` is a stage name (`ENRICHMENT`, `CONTENT_GENERATION`, ...),
    ///   `COMPLETION_TRACKER` or `ESCALATION_MONITOR`
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.apply_override(key, name, value)?;
        }
        self.validate()?;
        Ok(self)
    }

    fn apply_override(&mut self, key: &str, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        };

        match name {
            "REDIS_URL" => {
                self.bus = BusBackend::Redis {
                    url: value.to_string(),
                    stream_key: match &self.bus {
                        BusBackend::Redis { stream_key, .. } => stream_key.clone(),
                        BusBackend::InMemory => default_stream_key(),
                    },
                };
            }
            "DATABASE_URL" => {
                self.store = StoreBackend::Postgres {
                    url: value.to_string(),
                    max_connections: match &self.store {
                        StoreBackend::Postgres { max_connections, .. } => *max_connections,
                        StoreBackend::InMemory => default_max_connections(),
                    },
                };
            }
            "LOG_LEVEL" => self.logging.level = value.to_string(),
            "LOG_FORMAT" => self.logging.format = LogFormat::parse(value).ok_or_else(invalid)?,
            "POLL_INTERVAL_MS" => self.poll_interval_ms = value.parse().map_err(|_| invalid())?,
            other => {
                let Some((consumer, field)) = split_consumer_field(other) else {
                    // Unknown keys are ignored so unrelated tooling can share the prefix.
                    return Ok(());
                };
                let target = match consumer {
                    "COMPLETION_TRACKER" => &mut self.completion_tracker,
                    "ESCALATION_MONITOR" => &mut self.escalation_monitor,
                    stage => match Stage::parse(&stage.to_ascii_lowercase()) {
                        Ok(stage) => self.stage_mut(stage),
                        Err(_) => return Ok(()),
                    },
                };
                match field {
                    "REPLICAS" => target.replicas = value.parse().map_err(|_| invalid())?,
                    "MAX_DELIVER" => target.max_deliver = value.parse().map_err(|_| invalid())?,
                    "ACK_WAIT_MS" => target.ack_wait_ms = value.parse().map_err(|_| invalid())?,
                    _ => unreachable!("split_consumer_field only yields known fields"),
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            self.stage(stage).check(stage.as_str())?;
        }
        self.completion_tracker.check("completion_tracker")?;
        self.escalation_monitor.check("escalation_monitor")?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if let BusBackend::Redis { url, stream_key } = &self.bus {
            if url.is_empty() || stream_key.is_empty() {
                return Err(ConfigError::Invalid("redis bus needs url and stream_key".into()));
            }
        }
        if let StoreBackend::Postgres {
            url,
            max_connections,
        } = &self.store
        {
            if url.is_empty() || *max_connections == 0 {
                return Err(ConfigError::Invalid(
                    "postgres store needs url and max_connections >= 1".into(),
                ));
            }
        }
        Ok(())
    }
}

fn split_consumer_field(name: &str) -> Option<(&str, &str)> {
    ["REPLICAS", "MAX_DELIVER", "ACK_WAIT_MS"]
        .into_iter()
        .find_map(|field| {
            name.strip_suffix(field)
                .and_then(|rest| rest.strip_suffix('_'))
                .map(|consumer| (consumer, field))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_stage_ack_windows() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stage(Stage::Enrichment).ack_wait(), Duration::from_secs(60));
        assert_eq!(config.stage(Stage::ContentGeneration).ack_wait(), Duration::from_secs(120));
        assert_eq!(config.stage(Stage::Finalization).ack_wait(), Duration::from_secs(180));
        assert!(Stage::ALL.iter().all(|s| config.stage(*s).max_deliver == 3));
    }

    #[test]
    fn parses_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            poll_interval_ms = 50

            [bus]
            kind = "redis"
            url = "redis://localhost:6379"

            [stages.asset_generation]
            replicas = 4
            max_deliver = 5
            ack_wait_ms = 240000

            [stages.asset_generation.backoff]
            strategy = "linear"
            base_delay_ms = 500
            max_delay_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(
            config.bus,
            BusBackend::Redis {
                url: "redis://localhost:6379".into(),
                stream_key: "creatiflow:messages".into()
            }
        );
        let asset = config.stage(Stage::AssetGeneration);
        assert_eq!((asset.replicas, asset.max_deliver), (4, 5));
        assert_eq!(asset.backoff.base_delay_ms, 500);
        assert_eq!(config.stage(Stage::Composition).replicas, 2);
    }

    #[test]
    fn rejects_zero_max_deliver() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [completion_tracker]
            replicas = 1
            max_deliver = 0
            ack_wait_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("completion_tracker")));
    }

    #[test]
    fn env_overrides_win() {
        let config = PipelineConfig::default()
            .with_env_overrides([
                ("CREATIFLOW_ASSET_GENERATION_REPLICAS", "6"),
                ("CREATIFLOW_ESCALATION_MONITOR_MAX_DELIVER", "7"),
                ("CREATIFLOW_DATABASE_URL", "postgres://localhost/creatiflow"),
                ("CREATIFLOW_LOG_FORMAT", "pretty"),
                ("UNRELATED", "x"),
            ])
            .unwrap();
        assert_eq!(config.stage(Stage::AssetGeneration).replicas, 6);
        assert_eq!(config.escalation_monitor.max_deliver, 7);
        assert!(matches!(config.store, StoreBackend::Postgres { max_connections: 10, .. }));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn bad_override_is_reported() {
        let err = PipelineConfig::default()
            .with_env_overrides([("CREATIFLOW_ENRICHMENT_ACK_WAIT_MS", "soon")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { key, .. } if key == "CREATIFLOW_ENRICHMENT_ACK_WAIT_MS"));
    }

    #[test]
    fn overrides_are_validated() {
        let err = PipelineConfig::default()
            .with_env_overrides([("CREATIFLOW_FINALIZATION_REPLICAS", "0")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn consumer_options_carry_stage_settings() {
        let config = PipelineConfig::default();
        let opts = config
            .stage(Stage::Composition)
            .consumer_options("brand.compose.request", "composition");
        assert_eq!(opts.max_deliver, 3);
        assert_eq!(opts.ack_wait, Duration::from_secs(180));
        assert!(opts.validate().is_ok());
    }
}
