//! `SQLite` persistence for the local store

mod connection;
mod migrations;
mod rows;
mod store;

pub use connection::Database;
pub use store::SqliteStore;
