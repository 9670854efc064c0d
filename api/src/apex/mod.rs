pub mod config;
pub mod endpoints;
pub mod state;
pub mod utils;
