//! Controller process: observes variant load, runs the optimizer and
//! publishes decisions.

pub mod actuator;
pub mod adapter;
pub mod args;
pub mod collector;
pub mod config;
pub mod inventory;
pub mod metrics;
pub mod reconcile;
pub mod retry;
