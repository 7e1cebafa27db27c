//! Metrics adapter server
//!
//! HTTP surface and configuration for the `metrics-adapter` binary.

pub mod api;
pub mod config;
