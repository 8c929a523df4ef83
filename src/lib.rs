//! One-way incremental sync of a Square catalog into PostgreSQL.

pub mod alert;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod square;
pub mod state;
pub mod store;
pub mod sync;
