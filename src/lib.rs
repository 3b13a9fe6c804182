pub mod cache;
pub mod config;
pub mod logging;
pub mod query;
pub mod social;
