pub mod models;
pub mod ports;

pub use models::{
    BoundingBox, CandidateEvent, Detection, Frame, Job, JobLifecycleEvent, JobPriority,
    JobRequest, JobState, Rule, RuleCondition, Track, TrackState, WorkerHeartbeat,
    WorkerRegistration, WorkerSlot, WorkerStatus, Zone,
};
pub use ports::{
    Detector, EventBus, EventConsumer, FrameSource, FrameStream, QueueStats, ResourceAllocator,
    TaskQueue,
};
