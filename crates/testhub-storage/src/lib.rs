//! TestHub Storage Layer
//!
//! A small key/value store on top of SQLite that plays the role browser
//! local storage plays for the web client. Every write is committed before
//! the call returns.

mod database;
mod error;
mod migrations;

pub use database::Database;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
