//! Shared types and plumbing for the kude operator.
//!
//! This crate holds everything the reconcilers observe and mutate:
//! - the declarative resource kinds (`TrackedRepository`, `Bundle`, `RunRecord`)
//! - object metadata, finalizers and owner references
//! - the condition set merged by type
//! - the object store contract and its in-memory implementation
//! - operator configuration and logging bootstrap

pub mod condition;
pub mod config;
pub mod logging;
pub mod resource;
pub mod store;
pub mod types;

pub use condition::{Condition, ConditionStatus, find_condition, is_condition_true, set_condition};
pub use config::{ConfigError, EnvError, EnvParser, OperatorConfig};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use resource::{
    HasConditions, ObjectKey, ObjectMeta, ObjectReference, OwnerReference, Resource,
    ResourceError, parse_interval,
};
pub use store::{Api, InMemoryStore, ListParams, ObjectStore, StoreError, WatchEvent, WatchEventType};
pub use types::{
    Bundle, BundleSpec, BundleStatus, DEFAULT_RUNS_HISTORY_LIMIT, RunRecord, RunRecordSpec,
    RunRecordStatus, TrackedRepository, TrackedRepositorySpec, TrackedRepositoryStatus,
};
