#[macro_use]
pub mod metrics;

pub mod authorization;
pub mod caching;
pub mod config;
pub mod context;
pub mod executor;
pub mod invalidation;
pub mod jobs;
pub mod logging;
pub mod render;
pub mod services;
pub mod types;
pub mod utils;
