//! # scrapeq
//!
//! Background scraping jobs with cluster-wide admission control.
//!
//! Uploads become a work (job group) with tasks, task ids travel through an
//! at-least-once queue, and workers only run a job body while holding a
//! token from a shared counting semaphore sized from available memory.
//! Backends are pluggable: Postgres (tables, token counter row, pgmq) in
//! production, in-memory for tests.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod tokens;
