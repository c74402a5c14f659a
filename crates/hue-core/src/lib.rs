pub mod config;
pub mod identity;
pub mod models;
pub mod upstream_map;
