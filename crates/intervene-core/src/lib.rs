//! # Intervene Core
//!
//! Simulation and fitting of causal-learning agents that observe, and
//! intervene on, a noisy multivariate attractor network.

pub mod config;
pub mod engine;
pub mod fitting;

// Re-export commonly used types
pub use config::AgentConfig;
pub use engine::agent::Agent;
pub use engine::errors::CoreError;
pub use engine::experiment::{Experiment, FitSummary, RunSummary};
pub use engine::internal::{InternalState, InternalStateKind};
pub use engine::types::{Dynamics, Intervention, Percept};
pub use fitting::{aggregate_log_likelihood, fit_trial, fit_trials, sweep, TrialData};
