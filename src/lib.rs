pub mod config;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod runner;
pub mod signals;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod ui;
