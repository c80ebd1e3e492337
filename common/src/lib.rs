pub mod bench;
pub mod config;
pub mod configuration;
pub mod matrix;
pub mod record;
pub mod runner;
pub mod util;
