pub mod actor;
pub mod config;
pub mod context;
pub mod controller;
pub mod election;
pub mod endpoints;
pub mod error;
pub mod fixture;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod service;
pub mod watcher;
