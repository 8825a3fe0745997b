//! Memory accounting - Remaining allocatable memory on this node

use std::collections::HashMap;

use super::error::{NodeError, NodeResult};

/// Tracks how much of the node's memory pool is still unassigned, and
/// which stone holds what
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLedger {
    /// Configured pool size
    total: i64,
    /// Memory not assigned to any stone
    available: i64,
    /// Memory held per stone name
    charges: HashMap<String, i64>,
}

impl MemoryLedger {
    pub fn new(total: i64) -> Self {
        Self {
            total,
            available: total,
            charges: HashMap::new(),
        }
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Memory currently assigned to stones
    pub fn used(&self) -> i64 {
        self.total - self.available
    }

    /// Memory charged to `name`, if any
    pub fn charge_of(&self, name: &str) -> Option<i64> {
        self.charges.get(name).copied()
    }

    /// Charge `amount` to `name`. Fails without touching the ledger if the
    /// pool would go negative.
    pub fn reserve(&mut self, name: &str, amount: i64) -> NodeResult<()> {
        if amount > self.available {
            return Err(NodeError::InsufficientMemory {
                requested: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        *self.charges.entry(name.to_string()).or_insert(0) += amount;
        Ok(())
    }

    /// Return whatever `name` holds to the pool. Returns the amount
    /// credited; stones without a charge credit nothing.
    pub fn release(&mut self, name: &str) -> i64 {
        let amount = self.charges.remove(name).unwrap_or(0);
        self.available = (self.available + amount).min(self.total);
        amount
    }

    /// Rebuild the ledger from the stones that are actually running.
    ///
    /// If the pool was shrunk below what those stones hold, `available`
    /// goes negative and stays there until enough of them are released.
    pub fn reconcile<I>(&mut self, charges: I)
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        self.charges = charges.into_iter().collect();
        let assigned: i64 = self.charges.values().sum();
        self.available = self.total - assigned;
    }

    /// Percentage of the pool in use
    pub fn usage_percent(&self) -> f32 {
        if self.total > 0 {
            (self.used() as f32 / self.total as f32) * 100.0
        } else {
            0.0
        }
    }
}
