pub mod cluster;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
