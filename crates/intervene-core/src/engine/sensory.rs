//! Omniscient sensory state: the agent perceives the environment's values exactly.

use crate::engine::environment::OuNetwork;
use crate::engine::history::StepHistory;
use crate::engine::types::Percept;

#[derive(Debug, Clone)]
pub struct SensoryState {
    trial_len: usize,
    n: usize,
    percept: Percept,
    history: StepHistory<Percept>,
}

impl SensoryState {
    pub fn new(trial_len: usize, num_variables: usize) -> Self {
        let percept = Percept::new(vec![0.0; num_variables], vec![0.0; num_variables]);
        let mut history = StepHistory::new(trial_len);
        history.record(0, percept.clone());
        Self {
            trial_len,
            n: 0,
            percept,
            history,
        }
    }

    /// Reads the environment's current and previous values.
    pub fn observe(&mut self, environment: &OuNetwork) -> &Percept {
        self.percept = Percept::new(environment.current().to_vec(), environment.previous().to_vec());
        self.n = (self.n + 1).min(self.trial_len);
        self.history.record(self.n, self.percept.clone());
        &self.percept
    }

    /// Aligns the percept with an environment without advancing time.
    pub fn sync(&mut self, environment: &OuNetwork) {
        self.percept = Percept::new(environment.current().to_vec(), environment.previous().to_vec());
        self.history.record(self.n, self.percept.clone());
    }

    pub fn percept(&self) -> &Percept {
        &self.percept
    }

    pub fn current(&self) -> &[f64] {
        &self.percept.current
    }

    pub fn previous(&self) -> &[f64] {
        &self.percept.previous
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn rollback(&mut self, back: usize) {
        self.n = self.n.saturating_sub(back);
        self.history.clear_after(self.n);
        if let Some(p) = self.history.get(self.n) {
            self.percept = p.clone();
        }
    }
}
