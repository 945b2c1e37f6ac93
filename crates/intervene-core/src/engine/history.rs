//! Per-step history arenas.
//!
//! Every state component keeps values indexed by the trial step `n` in
//! `0..=N`. Slots are explicitly defined or undefined; rolling back clears the
//! slots after the restored step so stale values can never leak into a rerun.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Arena of optional values, one slot per trial step (`N + 1` slots).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepHistory<T> {
    slots: Vec<Option<T>>,
}

impl<T> StepHistory<T> {
    /// Creates an arena with `trial_len + 1` undefined slots.
    pub fn new(trial_len: usize) -> Self {
        Self {
            slots: (0..=trial_len).map(|_| None).collect(),
        }
    }

    /// Number of slots (`N + 1`).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Stores `value` at step `n`. Steps beyond the arena are ignored.
    pub fn record(&mut self, n: usize, value: T) {
        if let Some(slot) = self.slots.get_mut(n) {
            *slot = Some(value);
        }
    }

    pub fn get(&self, n: usize) -> Option<&T> {
        self.slots.get(n).and_then(Option::as_ref)
    }

    pub fn is_defined(&self, n: usize) -> bool {
        self.get(n).is_some()
    }

    /// Undefines every slot strictly after step `n`.
    pub fn clear_after(&mut self, n: usize) {
        for slot in self.slots.iter_mut().skip(n + 1) {
            *slot = None;
        }
    }

    /// Undefines every slot.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Values of the contiguous defined prefix `0..=n` (stops at the first gap).
    pub fn prefix(&self, n: usize) -> impl Iterator<Item = &T> {
        self.slots
            .iter()
            .take(n + 1)
            .map_while(Option::as_ref)
    }

    /// All defined slots with their step.
    pub fn defined(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(n, slot)| slot.as_ref().map(|v| (n, v)))
    }
}

impl<T: Clone> StepHistory<T> {
    /// Copy that keeps only the slot at step `n`, for scratch rollouts.
    pub fn fork_at(&self, n: usize) -> Self {
        let mut out = Self {
            slots: vec![None; self.slots.len()],
        };
        if let Some(value) = self.get(n) {
            out.record(n, value.clone());
        }
        out
    }
}

/// Running log-likelihood with its cumulative value recorded per step.
///
/// `history[0] == 0` and `history[n]` holds the total after step `n`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LikelihoodLedger {
    total: f64,
    history: StepHistory<f64>,
}

impl LikelihoodLedger {
    pub fn new(trial_len: usize) -> Self {
        let mut history = StepHistory::new(trial_len);
        history.record(0, 0.0);
        Self {
            total: 0.0,
            history,
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Adds `log_prob` and records the new total at step `n`.
    pub fn accumulate(&mut self, n: usize, log_prob: f64) {
        self.total += log_prob;
        self.history.record(n, self.total);
    }

    /// Cumulative total at step `n`, if recorded.
    pub fn at(&self, n: usize) -> Option<f64> {
        self.history.get(n).copied()
    }

    pub fn history(&self) -> &StepHistory<f64> {
        &self.history
    }

    /// Restores the total recorded at step `n` and undefines later steps.
    pub fn rewind(&mut self, n: usize) {
        self.total = self.at(n).unwrap_or(0.0);
        self.history.clear_after(n);
        if n == 0 {
            self.history.record(0, 0.0);
        }
    }
}
