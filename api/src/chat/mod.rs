pub mod delegates;
pub mod endpoints;
pub mod errors;
pub mod index;
pub mod mongo;
pub mod schemas;
pub mod store;
