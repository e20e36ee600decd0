pub mod detection;
pub mod event;
pub mod job;
pub mod rule;
pub mod worker;

pub use detection::{BoundingBox, Detection, Frame, Track, TrackState};
pub use event::{CandidateEvent, JobLifecycleEvent};
pub use job::{Job, JobPriority, JobRequest, JobState};
pub use rule::{Rule, RuleCondition, Zone};
pub use worker::{WorkerHeartbeat, WorkerRegistration, WorkerSlot, WorkerStatus};
