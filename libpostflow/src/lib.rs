//! PostFlow - scheduled publishing and engagement sync for photographers
//!
//! This library holds everything the `postflow-scheduler` daemon runs:
//! publishing due posts to Instagram, Mastodon and Pixelfed, mirroring the
//! posts back with their engagement, and the single-instance job scheduler
//! that drives both.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub mod platforms;
pub mod publish;
pub mod scheduler;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{PlatformError, PostflowError, Result, SchedulerError, ValidationError};
pub use publish::{PlatformPublisher, PublishEngine};
pub use scheduler::{FileLock, Job, JobScheduler, JobSpec, ProcessLock};
pub use sync::SyncEngine;
pub use types::{
    Platform, PlatformAccount, PlatformPost, PostStatus, PublishState, ScheduledPost,
};
