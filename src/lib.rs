pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod executor;
pub mod health;
pub mod ipc;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod scheduler;
pub mod telemetry;
pub mod venue;
pub mod writer;
