pub mod failure_detector;
pub mod orchestrator;
pub mod resource_manager;

pub use failure_detector::WorkerFailureDetector;
pub use orchestrator::{JobOrchestrator, OrchestratorStats};
pub use resource_manager::{GpuResourceManager, ResourceStats};
