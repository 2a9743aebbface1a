pub mod admission;
pub mod config;
pub mod context;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reconciler;
pub mod service;
pub mod sinks;
pub mod tenant;
pub mod wal;
