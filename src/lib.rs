//! Import job status tracking and real-time progress distribution.
//!
//! Producers report job progress through [`services::job_status::JobStatusService`],
//! which keeps a TTL-bounded snapshot per job in a [`services::store::JobStore`]
//! and publishes progress-bearing snapshots on a pub/sub channel. The gateway
//! in [`routes`] fans those out over WebSockets to
//! [`client::ProgressClient`]s, which reconcile them into per-file state.

pub mod app_state;
pub mod client;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
