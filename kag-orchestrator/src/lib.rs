// Library entry point for the binary and the integration tests

pub mod cli;
pub mod commands;
pub mod config;
pub mod configurator;
pub mod keys;
pub mod logger;
pub mod provider_manager;
pub mod rcon;
pub mod reconciliation;
pub mod remote;
pub mod retry;
pub mod state_machine;
pub mod state_store;
