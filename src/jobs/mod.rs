pub mod queue;
pub mod store;
pub mod types;

pub use queue::{JobHandler, JobQueue, ProgressReporter};
pub use store::JobStore;
pub use types::{Job, JobStatus, JobType, TranscribeParams, TranslateConfig, TranslateParams};
