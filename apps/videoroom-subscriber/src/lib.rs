pub mod app;
pub mod config;
pub mod peer;
pub mod relay;
pub mod signaling;
pub mod subscription;
pub mod supervisor;
pub mod telemetry;
