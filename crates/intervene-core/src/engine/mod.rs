//! The simulation and inference engine for causal-learning agents.
//!
//! This module provides:
//! - **errors**: Error taxonomy shared by every component
//! - **space**: Enumerated hypothesis space over causal graphs
//! - **environment**: Ground-truth attractor network (simulated or replayed)
//! - **sensory**: Percepts handed from the environment to the agent
//! - **internal**: Belief engines (discrete, continuous, mean-field)
//! - **action**: Intervention planning and action scoring
//! - **agent** / **experiment**: Orchestration in generative and replay modes

pub mod action;
pub mod agent;
pub mod environment;
pub mod errors;
pub mod experiment;
pub mod history;
pub mod internal;
pub mod numeric_kernels;
pub mod sensory;
pub mod space;
pub mod types;
