//! HostPulse kernel
//!
//! Central server of the telemetry pipeline:
//! - [`ingest`]: consumes the `metrics` queue into the store
//! - [`store`]: SQLite persistence, one transaction per message
//! - [`repository`]: validated read queries
//! - [`http`]: JSON query API on axum
//! - [`health`], [`config`]: operational surface

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod ingest;
pub mod repository;
pub mod store;

pub use config::{load_config, KernelConfig};
pub use error::{ApiError, QueryError, StoreError};
pub use health::{HealthTracker, KernelHealth};
pub use http::{build_router, AppState};
pub use repository::{MetricQuery, MetricsRepository, DEFAULT_LIMIT};
pub use store::{MetricStore, SavedMetric};
