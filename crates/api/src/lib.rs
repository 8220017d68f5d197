//! HTTP route layer over the telemetry pipeline.

pub mod app;
