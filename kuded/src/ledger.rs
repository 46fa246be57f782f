//! Idempotent condition writes against the object store.

use kude_common::{Api, ConditionStatus, HasConditions, StoreError, set_condition};

/// Condition entry used to seed a fresh resource.
pub struct Baseline<'a> {
    pub type_: &'a str,
    pub status: ConditionStatus,
    pub reason: &'a str,
    pub message: &'a str,
}

pub struct ConditionLedger;

impl ConditionLedger {
    /// Merges one condition and persists the status when it changed.
    ///
    /// Returns `true` when a write happened. On success `object` is replaced
    /// by the stored copy so later writes in the same pass carry the current
    /// resource version.
    pub async fn set_condition<K: HasConditions>(
        api: &Api<K>,
        object: &mut K,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        let generation = object.meta().generation;
        if !set_condition(object.conditions_mut(), type_, status, reason, message, generation) {
            return Ok(false);
        }
        *object = api.replace_status(object).await?;
        Ok(true)
    }

    /// Seeds the condition set on first sight with a single status write.
    /// Resources that already carry conditions are left alone.
    pub async fn ensure_baseline<K: HasConditions>(
        api: &Api<K>,
        object: &mut K,
        baseline: &[Baseline<'_>],
    ) -> Result<bool, StoreError> {
        if !object.conditions().is_empty() {
            return Ok(false);
        }
        let generation = object.meta().generation;
        for entry in baseline {
            set_condition(
                object.conditions_mut(),
                entry.type_,
                entry.status,
                entry.reason,
                entry.message,
                generation,
            );
        }
        *object = api.replace_status(object).await?;
        Ok(true)
    }
}
