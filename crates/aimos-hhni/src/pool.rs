//! Budget pools shared by several participants.
//!
//! A pool owns a token and time allowance. Participants ask for a slice,
//! spend some of it, and hand the rest back with [`BudgetPool::return_unused`].

use aimos_types::config::{BudgetStrategy, PoolConfig};
use aimos_types::{AimosError, AimosResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Lower bound on the utilisation factor applied by ADAPTIVE pools.
const ADAPTIVE_FLOOR: f64 = 0.25;

/// Per-participant bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Allocation {
    /// Tokens granted over the pool's lifetime.
    pub tokens_granted: u64,
    /// Tokens currently held (granted minus returned).
    pub tokens_allocated: u64,
    /// Tokens reported as spent.
    pub tokens_used: u64,
    pub time_allocated: f64,
    /// Whether the participant has reported its usage.
    pub settled: bool,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub strategy: BudgetStrategy,
    pub total_tokens: u64,
    pub remaining_tokens: u64,
    pub total_time: f64,
    pub remaining_time: f64,
    pub participants: usize,
    pub served: usize,
    pub utilization: f64,
}

/// A bounded allowance shared across a fixed set of participants.
#[derive(Debug, Clone)]
pub struct BudgetPool {
    name: String,
    strategy: BudgetStrategy,
    total_tokens: u64,
    remaining_tokens: u64,
    total_time: f64,
    remaining_time: f64,
    participants: BTreeSet<String>,
    allocations: BTreeMap<String, Allocation>,
}

impl BudgetPool {
    pub fn new<I, S>(name: impl Into<String>, config: &PoolConfig, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let total_time = config.total_time_seconds.max(0.0);
        Self {
            name: name.into(),
            strategy: config.strategy,
            total_tokens: config.total_tokens,
            remaining_tokens: config.total_tokens,
            total_time,
            remaining_time: total_time,
            participants: participants.into_iter().map(Into::into).collect(),
            allocations: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.remaining_tokens
    }

    pub fn remaining_time(&self) -> f64 {
        self.remaining_time
    }

    pub fn allocation(&self, participant: &str) -> Option<&Allocation> {
        self.allocations.get(participant)
    }

    pub fn add_participant(&mut self, participant: impl Into<String>) -> bool {
        self.participants.insert(participant.into())
    }

    fn check_participant(&self, participant: &str) -> AimosResult<()> {
        if self.participants.contains(participant) {
            Ok(())
        } else {
            Err(AimosError::Validation(format!(
                "'{participant}' is not a participant of pool '{}'",
                self.name
            )))
        }
    }

    /// Participants still waiting for a first grant, counting the caller.
    fn unserved_including(&self, participant: &str) -> u64 {
        let others = self
            .participants
            .iter()
            .filter(|p| p.as_str() != participant && !self.allocations.contains_key(p.as_str()))
            .count() as u64;
        others + 1
    }

    /// Spent / granted over participants that have reported usage.
    fn observed_utilization(&self) -> f64 {
        let (used, granted) = self
            .allocations
            .values()
            .filter(|a| a.settled)
            .fold((0u64, 0u64), |(u, g), a| (u + a.tokens_used, g + a.tokens_granted));
        if granted == 0 {
            1.0
        } else {
            used as f64 / granted as f64
        }
    }

    fn grant(&self, participant: &str, requested: u64) -> u64 {
        let fair_share = self.remaining_tokens / self.unserved_including(participant);
        let granted = match self.strategy {
            BudgetStrategy::Greedy => self.remaining_tokens,
            BudgetStrategy::Fair => fair_share,
            BudgetStrategy::Adaptive => {
                let factor = self.observed_utilization().max(ADAPTIVE_FLOOR);
                (fair_share as f64 * factor).floor() as u64
            }
        };
        requested.min(granted)
    }

    /// Grant up to `requested` tokens according to the pool strategy.
    pub fn allocate(&mut self, participant: &str, requested: u64) -> AimosResult<u64> {
        self.check_participant(participant)?;
        let granted = self.grant(participant, requested);
        self.remaining_tokens -= granted;
        let entry = self.allocations.entry(participant.to_string()).or_default();
        entry.tokens_granted += granted;
        entry.tokens_allocated += granted;
        entry.settled = false;
        debug!(pool = %self.name, participant, requested, granted, remaining = self.remaining_tokens, "Pool allocation");
        Ok(granted)
    }

    /// Grant exactly `requested` tokens or fail with `BudgetExceeded`.
    pub fn allocate_exact(&mut self, participant: &str, requested: u64) -> AimosResult<u64> {
        self.check_participant(participant)?;
        let available = self.grant(participant, u64::MAX);
        if requested > available {
            return Err(AimosError::BudgetExceeded {
                requested,
                available,
            });
        }
        self.allocate(participant, requested)
    }

    /// Grant wall-clock seconds the same way tokens are granted.
    pub fn allocate_time(&mut self, participant: &str, requested: f64) -> AimosResult<f64> {
        self.check_participant(participant)?;
        let share = match self.strategy {
            BudgetStrategy::Greedy => self.remaining_time,
            _ => self.remaining_time / self.unserved_including(participant) as f64,
        };
        let granted = requested.max(0.0).min(share);
        self.remaining_time -= granted;
        self.allocations
            .entry(participant.to_string())
            .or_default()
            .time_allocated += granted;
        Ok(granted)
    }

    /// Report usage and credit back what was granted but not spent.
    pub fn return_unused(&mut self, participant: &str, actual_usage: u64) -> AimosResult<u64> {
        self.check_participant(participant)?;
        let Some(entry) = self.allocations.get_mut(participant) else {
            return Ok(0);
        };
        let credit = entry.tokens_allocated.saturating_sub(actual_usage);
        entry.tokens_allocated -= credit;
        entry.tokens_used = actual_usage.min(entry.tokens_allocated);
        entry.settled = true;
        self.remaining_tokens += credit;
        debug!(pool = %self.name, participant, credit, remaining = self.remaining_tokens, "Returned unused tokens");
        Ok(credit)
    }

    /// Fraction of the token allowance currently handed out.
    pub fn utilization(&self) -> f64 {
        if self.total_tokens == 0 {
            return 0.0;
        }
        (self.total_tokens - self.remaining_tokens) as f64 / self.total_tokens as f64
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            strategy: self.strategy,
            total_tokens: self.total_tokens,
            remaining_tokens: self.remaining_tokens,
            total_time: self.total_time,
            remaining_time: self.remaining_time,
            participants: self.participants.len(),
            served: self.allocations.len(),
            utilization: self.utilization(),
        }
    }
}

/// Named pools owned by one orchestrator.
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: BTreeMap<String, BudgetPool>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_pool<I, S>(&mut self, name: &str, config: &PoolConfig, participants: I) -> AimosResult<&mut BudgetPool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.pools.contains_key(name) {
            return Err(AimosError::Validation(format!("pool '{name}' already exists")));
        }
        Ok(self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| BudgetPool::new(name, config, participants)))
    }

    pub fn get(&self, name: &str) -> Option<&BudgetPool> {
        self.pools.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> AimosResult<&mut BudgetPool> {
        self.pools
            .get_mut(name)
            .ok_or_else(|| AimosError::NotFound(format!("pool '{name}'")))
    }

    pub fn remove(&mut self, name: &str) -> Option<BudgetPool> {
        self.pools.remove(name)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(BudgetPool::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: BudgetStrategy) -> PoolConfig {
        PoolConfig {
            total_tokens: 900,
            total_time_seconds: 30.0,
            strategy,
        }
    }

    #[test]
    fn test_fair_divides_among_unserved() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Fair), ["a", "b", "c"]);
        assert_eq!(pool.allocate("a", 1_000).unwrap(), 300);
        assert_eq!(pool.allocate("b", 100).unwrap(), 100);
        // 500 left, only c unserved.
        assert_eq!(pool.allocate("c", 1_000).unwrap(), 500);
        assert_eq!(pool.remaining_tokens(), 0);
    }

    #[test]
    fn test_greedy_takes_what_remains() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Greedy), ["a", "b"]);
        assert_eq!(pool.allocate("a", 800).unwrap(), 800);
        assert_eq!(pool.allocate("b", 800).unwrap(), 100);
    }

    #[test]
    fn test_return_unused_credits_difference() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Greedy), ["a"]);
        pool.allocate("a", 500).unwrap();
        assert_eq!(pool.return_unused("a", 200).unwrap(), 300);
        assert_eq!(pool.remaining_tokens(), 700);
        // Second report credits nothing more.
        assert_eq!(pool.return_unused("a", 200).unwrap(), 0);
        assert_eq!(pool.allocation("a").unwrap().tokens_used, 200);
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Fair), ["a"]);
        assert_eq!(pool.allocate("zed", 10).unwrap_err().kind(), "validation_error");
        assert!(pool.return_unused("zed", 0).is_err());
    }

    #[test]
    fn test_allocate_exact_budget_exceeded() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Fair), ["a", "b"]);
        let err = pool.allocate_exact("a", 600).unwrap_err();
        assert_eq!(err.kind(), "budget_exceeded");
        assert_eq!(pool.remaining_tokens(), 900);
        assert_eq!(pool.allocate_exact("a", 450).unwrap(), 450);
    }

    #[test]
    fn test_adaptive_scales_by_observed_use() {
        let mut pool = BudgetPool::new("p", &config(BudgetStrategy::Adaptive), ["a", "b", "c"]);
        assert_eq!(pool.allocate("a", 1_000).unwrap(), 300);
        pool.return_unused("a", 150).unwrap();
        // 750 left, two unserved: fair share 375, observed use 0.5.
        assert_eq!(pool.allocate("b", 1_000).unwrap(), 187);
    }

    #[test]
    fn test_time_and_manager() {
        let mut manager = PoolManager::new();
        let pool = manager
            .create_pool("search", &config(BudgetStrategy::Fair), ["a", "b"])
            .unwrap();
        assert_eq!(pool.allocate_time("a", 100.0).unwrap(), 15.0);
        assert!(manager
            .create_pool("search", &config(BudgetStrategy::Fair), ["x"])
            .is_err());
        assert!(manager.get_mut("missing").is_err());
        assert_eq!(manager.stats().len(), 1);
        assert_eq!(manager.get("search").unwrap().remaining_time(), 15.0);
    }
}
