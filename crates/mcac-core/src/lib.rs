//! Types shared by the metric collector agent crates: configuration, filtering rules,
//! insights, the metric model and the daemon lifecycle seam.

pub mod config;
pub mod filtering;
pub mod insight;
pub mod lifecycle;
pub mod metrics;
