pub mod control;
pub mod telemetry;
