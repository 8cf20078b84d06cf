//! Infrastructure layer: store and bus backends, stage workers, runtime.
//!
//! - [`coordinator`]: stateless fan-out and the surface offered to callers
//!   (submit, status, revision)
//! - [`workers`]: stage replicas, completion tracker, escalation monitor
//! - [`store`]: persisted campaigns, completion matrices, units and results
//! - [`event_bus`]: durable bus backends beyond the in-memory one
//! - [`runtime`]: wires everything together from [`config::PipelineConfig`]

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod event_bus;
pub mod runtime;
pub mod stages;
pub mod store;
pub mod workers;


pub use config::{ConfigError, PipelineConfig, StageConfig};
pub use coordinator::{CampaignStatusView, CoordinatorError, PipelineCoordinator, RevisionRequest};
pub use runtime::{PipelineRuntime, StartupError};
pub use stages::Collaborators;
pub use store::{InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, StoreError};
