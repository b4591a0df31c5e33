//! CLI module for tradepost

pub mod app;
pub mod commands;

pub use app::{SimulationApp, SimulationReport, TradePlan};
pub use commands::{Cli, Commands};
