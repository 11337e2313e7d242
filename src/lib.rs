//! Core of the named-process exporter.
//!
//! The pipeline turns an ever-shifting population of processes into stable,
//! monotonically non-decreasing per-group counters:
//!
//! - [`selector`] decides, per process, whether to track it and under which
//!   group name;
//! - [`proc::read`] snapshots static identity and running metrics for every
//!   live process (and optionally every thread) from /proc;
//! - [`proc::tracker`] keeps the keyed registry of process lives, computes
//!   clamped counter deltas and handles parent-chain inheritance;
//! - [`proc::grouper`] folds the deltas into per-group totals carried on a
//!   monotone history floor;
//! - [`collector`] owns the Prometheus metric catalogue and the
//!   single-writer scrape loop;
//! - [`web`] exposes the scrape endpoint over HTTP(S).

pub mod cli;
pub mod collector;
pub mod config;
pub mod proc;
pub mod selector;
pub mod web;
