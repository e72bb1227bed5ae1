use crate::address::EmailAddress;
use crate::error::{FailureCause, MailError, Result};
use crate::models::MessageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Success,
    Partial,
    Failure,
}

/// Target identifier that has a canonical comparison form.
pub trait BatchTarget: Ord + Clone + Send + Sync {
    fn normalized(&self) -> Self;
}

// EmailAddress ordering and equality are already case-folded; the first
// spelling seen is kept for display.
impl BatchTarget for EmailAddress {
    fn normalized(&self) -> Self {
        self.clone()
    }
}

impl BatchTarget for MessageId {
    fn normalized(&self) -> Self {
        MessageId(self.0.trim().to_string())
    }
}

impl BatchTarget for String {
    fn normalized(&self) -> Self {
        self.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult<K: Ord> {
    success_values: BTreeSet<K>,
    failures: BTreeMap<K, FailureCause>,
}

impl<K: Ord + Clone> BatchResult<K> {
    pub fn new() -> Self {
        Self {
            success_values: BTreeSet::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Record a success. A target already recorded keeps its first outcome.
    pub fn record_success(&mut self, target: K) {
        if !self.failures.contains_key(&target) {
            self.success_values.insert(target);
        }
    }

    pub fn record_failure(&mut self, target: K, cause: FailureCause) {
        if !self.success_values.contains(&target) {
            self.failures.entry(target).or_insert(cause);
        }
    }

    pub fn status(&self) -> BatchStatus {
        match (self.success_values.is_empty(), self.failures.is_empty()) {
            (true, _) => BatchStatus::Failure,
            (false, true) => BatchStatus::Success,
            (false, false) => BatchStatus::Partial,
        }
    }

    pub fn success_values(&self) -> &BTreeSet<K> {
        &self.success_values
    }

    pub fn failure_values(&self) -> BTreeSet<K> {
        self.failures.keys().cloned().collect()
    }

    pub fn failure_cause(&self, target: &K) -> Option<&FailureCause> {
        self.failures.get(target)
    }

    pub fn failures(&self) -> &BTreeMap<K, FailureCause> {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.success_values.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Ord + Clone> Default for BatchResult<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// One operation applied to a single target.
#[async_trait]
pub trait TargetOperation<K>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply_one(&self, target: &K) -> Result<()>;
}

pub struct BatchOperationEngine {
    max_batch_size: usize,
}

impl BatchOperationEngine {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }

    /// Precondition checks plus normalize-and-dedupe, in first-seen order.
    pub fn prepare<K: BatchTarget>(&self, targets: &[K]) -> Result<Vec<K>> {
        if targets.is_empty() {
            return Err(MailError::InvalidArgument(
                "batch requires at least one target".to_string(),
            ));
        }
        if targets.len() > self.max_batch_size {
            return Err(MailError::LimitExceeded {
                requested: targets.len(),
                max: self.max_batch_size,
            });
        }
        let mut seen = BTreeSet::new();
        Ok(targets
            .iter()
            .map(BatchTarget::normalized)
            .filter(|target| seen.insert(target.clone()))
            .collect())
    }

    /// Run `operation` on every unique target. Item-scoped errors become
    /// failures; any other error aborts the batch.
    pub async fn apply<K, O>(&self, operation: &O, targets: &[K]) -> Result<BatchResult<K>>
    where
        K: BatchTarget,
        O: TargetOperation<K> + ?Sized,
    {
        let unique = self.prepare(targets)?;
        debug!(
            operation = operation.name(),
            requested = targets.len(),
            unique = unique.len(),
            "Applying batch operation"
        );

        let mut result = BatchResult::new();
        for target in unique {
            match operation.apply_one(&target).await {
                Ok(()) => result.record_success(target),
                Err(err) if err.is_item_scoped() => {
                    result.record_failure(target, FailureCause::from(&err))
                }
                Err(err) => {
                    warn!(operation = operation.name(), error = %err, "Batch operation aborted");
                    return Err(err);
                }
            }
        }

        let status = result.status();
        info!(
            operation = operation.name(),
            status = ?status,
            succeeded = result.success_values().len(),
            failed = result.failures().len(),
            "Batch operation finished"
        );
        Ok(result)
    }
}
