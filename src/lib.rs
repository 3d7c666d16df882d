//! Charger telemetry analytics: session segmentation, failure classification
//! and success-rate statistics, served over HTTP from a local document store.

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod projections;
pub mod stats;
pub mod store;
