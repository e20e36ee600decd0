pub mod event_bus;
pub mod synthetic;
pub mod task_queue;

pub use event_bus::InProcEventBus;
pub use synthetic::{SyntheticDetector, SyntheticFrameSource};
pub use task_queue::InMemoryTaskQueue;
