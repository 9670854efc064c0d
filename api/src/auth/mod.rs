pub mod endpoints;
pub mod schemas;
