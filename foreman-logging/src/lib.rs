//! Logging initialisation for Foreman
//!
//! Hosts log according to their `LoggingConfig`; worker processes log to
//! stderr only, because their stdout carries the protocol.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
