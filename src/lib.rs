pub mod config;
pub mod errors;
pub mod execution;
pub mod logging;
