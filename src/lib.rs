pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod pricing;
pub mod wal;
