pub mod args;
pub mod decoder;
pub mod runner;
pub mod tee;
