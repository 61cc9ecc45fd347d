pub mod config;
pub mod scan;
pub mod store;
pub mod store_manager;
