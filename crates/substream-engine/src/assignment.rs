//! Assignment Manager - fenced rebalance passes
//!
//! Runs one rebalance pass for a subscription against the coordination store.
//! Any broker may run a pass at any time; conditional writes make concurrent
//! passes safe.
//!
//! ## How It Works
//!
//! 1. **Read**: current assignment (with its store version) and live sessions
//! 2. **Check**: if the assignment still fits, stop; nothing is written
//! 3. **Compute**: `Rebalancer::compute` produces generation G+1
//! 4. **Write**: conditional on the version read in step 1
//!    - success → the new record is authoritative
//!    - `VersionConflict` → another broker wrote first; go back to step 1
//!
//! Conflicts are bounded by `max_conflict_retries`; an unreachable store is
//! retried with exponential backoff per call.
//!
//! ## Generation Fencing
//!
//! Sessions act on an assignment only after checking its generation is the
//! newest they have seen (`validate_generation`). A session holding an older
//! generation never starts reading a partition it no longer owns.

use crate::error::{EngineError, Result};
use crate::rebalancer::Rebalancer;
use std::sync::Arc;
use substream_coordination::{
    retry_with_backoff, AssignmentRecord, CoordinationError, CoordinationStore, RetryPolicy,
    Versioned,
};
use substream_core::{Partition, SubscriptionId};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AssignmentManager {
    broker_id: String,
    store: Arc<dyn CoordinationStore>,
    retry_policy: RetryPolicy,
    max_conflict_retries: usize,
}

impl AssignmentManager {
    pub fn new(
        broker_id: String,
        store: Arc<dyn CoordinationStore>,
        retry_policy: RetryPolicy,
        max_conflict_retries: usize,
    ) -> Self {
        Self {
            broker_id,
            store,
            retry_policy,
            max_conflict_retries,
        }
    }

    /// Run one rebalance pass.
    ///
    /// # Returns
    ///
    /// The assignment in force after the pass (written by us, or left as is).
    ///
    /// # Errors
    ///
    /// - `AssignmentConflict`: lost more than `max_conflict_retries` races
    /// - `CoordinationUnavailable`: the store stayed unreachable through every retry
    pub async fn rebalance(
        &self,
        subscription_id: &SubscriptionId,
        partitions: &[Partition],
    ) -> Result<Versioned<AssignmentRecord>> {
        let mut conflicts = 0;

        loop {
            let current = retry_with_backoff(&self.retry_policy, || {
                self.store.get_assignment(subscription_id)
            })
            .await?;
            let live = retry_with_backoff(&self.retry_policy, || {
                self.store.list_sessions(subscription_id)
            })
            .await?;

            if !Rebalancer::needs_rebalance(&current.value, &live, partitions) {
                debug!(
                    subscription_id = %subscription_id,
                    generation = current.value.generation,
                    "Assignment up to date"
                );
                return Ok(current);
            }

            let plan = Rebalancer::compute(&current.value, &live, partitions);
            let record = plan.record;
            let written = retry_with_backoff(&self.retry_policy, || {
                self.store
                    .put_assignment(subscription_id, current.version, record.clone())
            })
            .await;

            match written {
                Ok(version) => {
                    info!(
                        subscription_id = %subscription_id,
                        broker_id = %self.broker_id,
                        generation = record.generation,
                        sessions = record.members.len(),
                        movements = plan.movements.len(),
                        unchanged = plan.partitions_unchanged,
                        "Rebalanced subscription"
                    );
                    return Ok(Versioned {
                        version,
                        value: record,
                    });
                }
                Err(CoordinationError::VersionConflict { expected, actual }) => {
                    conflicts += 1;
                    if conflicts > self.max_conflict_retries {
                        warn!(
                            subscription_id = %subscription_id,
                            conflicts,
                            "Giving up rebalance after repeated conflicts"
                        );
                        return Err(EngineError::AssignmentConflict {
                            attempts: conflicts,
                        });
                    }
                    debug!(
                        subscription_id = %subscription_id,
                        expected,
                        actual,
                        conflicts,
                        "Assignment changed concurrently, recomputing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Check that `expected_generation` is still the current generation
    pub async fn validate_generation(
        &self,
        subscription_id: &SubscriptionId,
        expected_generation: u64,
    ) -> Result<()> {
        let current = retry_with_backoff(&self.retry_policy, || {
            self.store.get_assignment(subscription_id)
        })
        .await?;

        if current.value.generation == expected_generation {
            Ok(())
        } else {
            Err(EngineError::StaleGeneration {
                expected: expected_generation,
                actual: current.value.generation,
            })
        }
    }
}
