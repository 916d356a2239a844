pub mod adapters;
pub mod bridge;
pub mod config;
pub mod error;
pub mod session;
