pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AppConfig, EventBusConfig, ObservabilityConfig, OrchestratorConfig, PipelineConfig,
    QueueConfig, ResourceManagerConfig, WorkerConfig,
};
pub use errors::{VigilError, VigilResult};
pub use logging::init_logging;
