//! Declarative resource kinds reconciled by the operator.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::resource::{HasConditions, ObjectKey, ObjectMeta, Resource, ResourceError, parse_interval};

/// Retained RunRecords per Bundle when `runsHistoryLimit` is unset or not positive.
pub const DEFAULT_RUNS_HISTORY_LIMIT: usize = 10;

// ── TrackedRepository ──────────────────────────────────────────────────────

/// Desired state of a mirrored remote repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRepositorySpec {
    /// Remote URL to clone from.
    pub url: String,
    /// Branch or ref to track (`main`, `refs/heads/main`, `refs/tags/v1`).
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Polling interval, e.g. `30s`.
    pub polling_interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRepositoryStatus {
    /// Commit at HEAD after the last successful pull; empty if never cloned.
    #[serde(default, rename = "lastPulledSHA")]
    pub last_pulled_sha: String,
    /// Local mirror path, `<root>/<uid>`.
    #[serde(default)]
    pub work_directory: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRepository {
    pub metadata: ObjectMeta,
    pub spec: TrackedRepositorySpec,
    #[serde(default)]
    pub status: TrackedRepositoryStatus,
}

impl TrackedRepository {
    pub fn new(namespace: &str, name: &str, spec: TrackedRepositorySpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: TrackedRepositoryStatus::default(),
        }
    }
}

impl TrackedRepositorySpec {
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.url.trim().is_empty() {
            return Err(ResourceError::InvalidField {
                field: "spec.url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.ref_.trim().is_empty() {
            return Err(ResourceError::InvalidField {
                field: "spec.ref",
                reason: "must not be empty".to_string(),
            });
        }
        if self.polling_interval.trim().is_empty() {
            return Err(ResourceError::InvalidField {
                field: "spec.pollingInterval",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl Resource for TrackedRepository {
    const KIND: &'static str = "TrackedRepository";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasConditions for TrackedRepository {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

// ── Bundle ─────────────────────────────────────────────────────────────────

/// Manifests to keep applied from one TrackedRepository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// File globs, relative to the mirror root, applied in order.
    pub files: Vec<String>,
    /// Extra arguments placed between `apply` and `-f`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Source repository as `namespace/name`.
    pub source_repository: String,
    pub drift_detection_interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_history_limit: Option<i64>,
}

impl BundleSpec {
    /// Effective retention count; unset or non-positive falls back to the default.
    pub fn history_limit(&self) -> usize {
        match self.runs_history_limit {
            Some(limit) if limit > 0 => usize::try_from(limit).unwrap_or(usize::MAX),
            _ => DEFAULT_RUNS_HISTORY_LIMIT,
        }
    }

    pub fn source_key(&self) -> Result<ObjectKey, ResourceError> {
        self.source_repository.parse()
    }

    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.files.is_empty() {
            return Err(ResourceError::InvalidField {
                field: "spec.files",
                reason: "at least one file pattern is required".to_string(),
            });
        }
        self.source_key()?;
        if self.drift_detection_interval.trim().is_empty() {
            return Err(ResourceError::InvalidField {
                field: "spec.driftDetectionInterval",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(limit) = self.runs_history_limit
            && limit < 1
        {
            return Err(ResourceError::InvalidField {
                field: "spec.runsHistoryLimit",
                reason: format!("must be at least 1, got {limit}"),
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Result<std::time::Duration, ResourceError> {
        parse_interval(&self.drift_detection_interval)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub metadata: ObjectMeta,
    pub spec: BundleSpec,
    #[serde(default)]
    pub status: BundleStatus,
}

impl Bundle {
    pub fn new(namespace: &str, name: &str, spec: BundleSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: BundleStatus::default(),
        }
    }
}

impl Resource for Bundle {
    const KIND: &'static str = "Bundle";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasConditions for Bundle {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

// ── RunRecord ──────────────────────────────────────────────────────────────

/// Inputs of one apply invocation, written once at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecordSpec {
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    pub directory: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Outcome of one apply invocation, written once after the process ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecordStatus {
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub metadata: ObjectMeta,
    pub spec: RunRecordSpec,
    /// `None` until the process has exited or failed to start.
    #[serde(default)]
    pub status: Option<RunRecordStatus>,
}

impl RunRecord {
    /// Whether the run finished with exit code zero.
    pub fn succeeded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.exit_code == 0)
    }
}

impl Resource for RunRecord {
    const KIND: &'static str = "RunRecord";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
