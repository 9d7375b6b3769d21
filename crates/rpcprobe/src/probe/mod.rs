pub mod collection;
pub mod config;
pub mod harness;
pub mod runner;
pub mod telemetry;
