//! # taskmill
//!
//! Postgres-backed work routing and dispatch engine.
//!
//! Routes incoming work items to workers via configurable rule sets,
//! tracks worker capacity, executes assigned work through pluggable
//! executors, and delivers domain events to webhook receivers with
//! retries and at-least-once semantics.

pub mod clock;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod event;
pub mod executor;
pub mod failure;
pub mod model;
pub mod routing;
pub mod scheduler;
pub mod telemetry;
