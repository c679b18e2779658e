pub mod app;
pub mod telemetry;
pub mod shutdown;
