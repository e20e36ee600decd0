pub mod batcher;
pub mod clip;
pub mod pipeline;
pub mod rules;
pub mod service;
pub mod tracker;

pub use batcher::{FrameBatcher, FrameSampler};
pub use clip::{ClipExtractor, ClipWindow};
pub use pipeline::{PipelineOutcome, StreamPipeline};
pub use rules::RuleEngine;
pub use service::WorkerService;
pub use tracker::{BatchSummary, IouTracker};
