//! Load-balancer variants selecting among a backend's registered pools
//! (C12). Both tolerate concurrent add/remove of backends since they only
//! read the current candidate slice at selection time and hold no state
//! keyed by backend identity themselves.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain_types::BackendWeight;

/// One candidate a [`LoadBalancer`] may select, named and weighted.
#[derive(Debug, Clone)]
pub struct BackendCandidate {
    /// The backend's pool key.
    pub name: String,
    /// Weight consulted by [`WeightedRoundRobin`]; ignored by [`RoundRobin`].
    pub weight: BackendWeight,
}

/// Selects one backend name from the currently registered candidates.
pub trait LoadBalancer: Send + Sync {
    /// Returns the next candidate's name, or `None` if `candidates` is empty.
    fn select(&self, candidates: &[BackendCandidate]) -> Option<String>;
}

/// Cycles through candidates in registration order via an atomic index
/// modulo the candidate count.
#[derive(Debug, Default)]
pub struct RoundRobin {
    index: AtomicUsize,
}

impl RoundRobin {
    /// Creates a fresh round-robin balancer starting at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &[BackendCandidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i].name.clone())
    }
}

/// Picks `index mod total_weight`, then advances through candidates
/// accumulating weight until the cumulative weight crosses the picked index,
/// per spec.md §4.12.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    index: AtomicUsize,
}

impl WeightedRoundRobin {
    /// Creates a fresh weighted round-robin balancer starting at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn select(&self, candidates: &[BackendCandidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let total_weight: u64 = candidates
            .iter()
            .map(|c| { let w: u32 = c.weight.into(); u64::from(w) })
            .sum();
        let i = (self.index.fetch_add(1, Ordering::Relaxed) as u64) % total_weight;
        let mut cumulative = 0u64;
        for candidate in candidates {
            let w: u32 = candidate.weight.into();
            cumulative += u64::from(w);
            if i < cumulative {
                return Some(candidate.name.clone());
            }
        }
        candidates.last().map(|c| c.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, weight: u32) -> BackendCandidate {
        BackendCandidate { name: name.to_string(), weight: BackendWeight::try_new(weight).expect("valid") }
    }

    #[test]
    fn round_robin_should_cycle_through_candidates() {
        let balancer = RoundRobin::new();
        let candidates = vec![candidate("A", 1), candidate("B", 1), candidate("C", 1)];
        let picks: Vec<String> =
            (0..6).map(|_| balancer.select(&candidates).expect("non-empty")).collect();
        assert_eq!(picks, vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn round_robin_with_no_candidates_should_return_none() {
        let balancer = RoundRobin::new();
        assert!(balancer.select(&[]).is_none());
    }

    #[test]
    fn weighted_round_robin_should_favor_higher_weight() {
        let balancer = WeightedRoundRobin::new();
        let candidates = vec![candidate("A", 3), candidate("B", 1)];
        let picks: Vec<String> =
            (0..4).map(|_| balancer.select(&candidates).expect("non-empty")).collect();
        let a_count = picks.iter().filter(|p| *p == "A").count();
        assert_eq!(a_count, 3);
    }
}
