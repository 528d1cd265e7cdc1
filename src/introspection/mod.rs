// Copyright 2025 Machina Contributors.

//! Machine introspection: configuration extraction, diffing, prediction,
//! and configuration-level cloning
//!
//! Everything here operates on the immutable [`Configuration`] graph; no
//! live machine is ever mutated by an introspection operation.

mod clone;
mod configuration;
mod diff;
mod predict;

pub use clone::{clone_from_configuration, clone_machine, ClonedMachine};
pub use configuration::{extract, extract_from_info, Configuration, StateConfig, TransitionInfo};
pub use diff::{diff, ConfigurationDiff, GuardChange, ModifiedTransition, TransitionChange};
pub use predict::{predict, Prediction};
