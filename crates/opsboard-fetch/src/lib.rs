//! The data-access engine of the Opsboard application.
//!
//! Opsboard UI code issues many overlapping reads for the same entities
//! (users, projects, companies) and watches a handful of live-update
//! channels. This crate sits between those callers and the hosted data
//! service: it caches successful reads with a TTL, collapses concurrent
//! fetches for the same key into a single upstream call, keeps the set of
//! open change-notification subscriptions bounded, and records a rolling
//! log of engine activity for observability.
//!
//! The [`service::FetchService`] is the composition root; see the
//! [`caching`] module docs for how a fetch flows through the layers.

#[macro_use]
pub mod metrics;

pub mod activity;
pub mod caching;
pub mod config;
pub mod logging;
pub mod service;
pub mod subscriptions;
pub mod utils;
