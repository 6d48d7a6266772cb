//! Tie-break strategies for picking among equally healthy endpoints.

use rand::{rng, Rng};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses one candidate given each candidate's in-flight load.
///
/// `loads` is never empty. The returned index must be `< loads.len()`; out-of-range answers are
/// clamped by the balancer.
pub trait Selector: Send + Sync + fmt::Debug {
    fn select(&self, loads: &[usize]) -> usize;
}

/// Rotates through candidates.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn select(&self, loads: &[usize]) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % loads.len()
    }
}

/// Candidate with the fewest in-flight dispatches; ties go to the first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl Selector for LeastLoaded {
    fn select(&self, loads: &[usize]) -> usize {
        loads.iter().enumerate().min_by_key(|(_, load)| **load).map_or(0, |(i, _)| i)
    }
}

/// Samples two distinct candidates at random and keeps the less loaded one.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerOfTwoChoices;

impl Selector for PowerOfTwoChoices {
    fn select(&self, loads: &[usize]) -> usize {
        let n = loads.len();
        if n < 2 {
            return 0;
        }
        let mut rng = rng();
        let a = rng.random_range(0..n);
        let mut b = rng.random_range(0..n - 1);
        if b >= a {
            b += 1;
        }
        if loads[b] < loads[a] {
            b
        } else {
            a
        }
    }
}
