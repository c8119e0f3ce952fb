//! Resource ledger
//!
//! Named capacity pools with non-blocking reservation. A reservation is
//! atomic across every pool it touches: either all pools are debited or
//! none are. Reservations are keyed by task id so cancellation and crash
//! recovery can release deterministically, and `release` is idempotent.

use crate::types::{FabricError, FabricResult, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Live usage of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
struct Pool {
    total: u64,
    used: u64,
}

/// Capacity ledger over named pools
#[derive(Debug, Default)]
pub struct ResourceLedger {
    pools: HashMap<String, Pool>,
    reservations: HashMap<TaskId, HashMap<String, u64>>,
}

impl ResourceLedger {
    /// Declare pools at construction: name → total capacity
    pub fn new(capacities: &HashMap<String, u64>) -> Self {
        let pools = capacities
            .iter()
            .map(|(name, &total)| (name.clone(), Pool { total, used: 0 }))
            .collect();
        Self {
            pools,
            reservations: HashMap::new(),
        }
    }

    /// Attempt to reserve `requirements` for `task_id`.
    ///
    /// Strictly non-blocking: on any shortfall the ledger is left
    /// untouched and the first conflicting pool is reported. Re-reserving
    /// for a task that already holds an identical reservation is a no-op;
    /// a different requirement set releases the old reservation first.
    pub fn try_reserve(
        &mut self,
        task_id: TaskId,
        requirements: &HashMap<String, u64>,
    ) -> FabricResult<()> {
        if requirements.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.reservations.get(&task_id) {
            if existing == requirements {
                return Ok(());
            }
            self.release(task_id);
        }

        // Validate every pool before touching any of them.
        for (name, &needed) in requirements {
            match self.pools.get(name) {
                Some(pool) => {
                    let available = pool.total - pool.used;
                    if needed > available {
                        return Err(FabricError::ResourceUnavailable {
                            pool: name.clone(),
                            needed,
                            available,
                        });
                    }
                }
                None => {
                    return Err(FabricError::ResourceUnavailable {
                        pool: name.clone(),
                        needed,
                        available: 0,
                    });
                }
            }
        }

        for (name, &needed) in requirements {
            // Presence was checked above.
            if let Some(pool) = self.pools.get_mut(name) {
                pool.used += needed;
            }
        }
        self.reservations.insert(task_id, requirements.clone());
        debug!(%task_id, ?requirements, "reserved");
        Ok(())
    }

    /// Release every reservation held under `task_id`; idempotent
    pub fn release(&mut self, task_id: TaskId) {
        if let Some(held) = self.reservations.remove(&task_id) {
            for (name, amount) in held {
                if let Some(pool) = self.pools.get_mut(&name) {
                    pool.used = pool.used.saturating_sub(amount);
                }
            }
            debug!(%task_id, "released");
        }
    }

    /// True when `task_id` currently holds a reservation
    pub fn holds_reservation(&self, task_id: TaskId) -> bool {
        self.reservations.contains_key(&task_id)
    }

    /// Per-pool usage for metrics
    pub fn snapshot(&self) -> HashMap<String, PoolUsage> {
        self.pools
            .iter()
            .map(|(name, pool)| {
                (
                    name.clone(),
                    PoolUsage {
                        used: pool.used,
                        total: pool.total,
                    },
                )
            })
            .collect()
    }

    /// Total capacities, keyed by pool name
    pub fn capacities(&self) -> HashMap<String, u64> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.total))
            .collect()
    }

    /// Availability signal in `[0, 1]` for the given requirements:
    /// 1.0 when every pool could satisfy them right now, scaling down
    /// with contention, 0.0 when any pool cannot
    pub fn availability_score(&self, requirements: &HashMap<String, u64>) -> f64 {
        if requirements.is_empty() {
            return 1.0;
        }
        let mut score: f64 = 1.0;
        for (name, &needed) in requirements {
            let Some(pool) = self.pools.get(name) else {
                return 0.0;
            };
            let available = pool.total - pool.used;
            if needed > available {
                return 0.0;
            }
            let free_fraction = if pool.total == 0 {
                0.0
            } else {
                available as f64 / pool.total as f64
            };
            score = score.min(free_fraction);
        }
        score
    }
}
