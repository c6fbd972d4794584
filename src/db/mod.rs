pub mod connection;
pub mod import;
pub mod migrations;
pub mod queries;

pub use connection::Database;
pub use import::Inventory;
