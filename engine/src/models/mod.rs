//! Wrappers for all objects within the ingest engine

pub mod events;
pub mod helpers;
pub mod jobs;
pub mod system;
pub mod tags;
pub mod users;

pub use events::{JobEvent, JobEventKind};
pub use helpers::{PageOpts, Value};
pub use jobs::{
    BulkAction, BulkJobAccepted, BulkJobRequest, BulkTask, DiscoverRequest, DiscoverResponse,
    ExtractedMedia, Job, JobAction, JobDraft, JobFileCreate, JobList, JobListOpts, JobStatus,
    JobType, JobUrlCreate, Safety,
};
pub use system::{GlobalSettings, GlobalSettingsUpdate};
pub use tags::TagCacheEntry;
pub use users::{BooruCredentials, SiteCredentials, UserConfig};

// optional imports
pub mod backends;
