pub mod config;
pub mod rewrite;
pub mod store;
pub mod types;
