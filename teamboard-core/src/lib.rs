pub mod board;
pub mod config;
pub mod paths;
pub mod rank;
pub mod store;
pub mod sync;
pub mod teams;
pub mod types;
pub mod validate;
