// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Library entry point exposing core modules for binaries and integration tests.

pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod pb;
pub mod repository;
pub mod server;
pub mod service;
pub mod telemetry;
